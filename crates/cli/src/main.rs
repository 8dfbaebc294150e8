use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use modctl_apply::{split_manifests, KubeAccess, ResourceClient, WaitScope};
use modctl_catalog::{Catalog, ClusterSource, CustomResourcePolicy, HttpFetcher, ManifestClient, ModuleMetadata, ModuleTemplate, RemoteSource};
use modctl_core::config::Config;
use modctl_core::{Json, ObjectRef, Printer};
use modctl_kubehub::{KubeDiscovery, Resolver};
use modctl_ops::ModuleOrchestrator;
use modctl_params::Parameter;
use tracing::{info, warn};

/// Outer bound for one invocation; every wait phase gets its own, shorter child scope.
const COMMAND_BUDGET: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "modctl", version, about = "Enable, manage and install cluster modules")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced resources that do not set one
    #[arg(short = 'n', long = "namespace", global = true, env = "MODCTL_DEFAULT_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds allowed for each wait-for-ready / wait-for-deletion phase
    #[arg(long = "timeout", global = true, env = "MODCTL_WAIT_TIMEOUT_SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(clap::Args, Debug, Default)]
struct CrArgs {
    /// Apply the module's default custom resource
    #[arg(long = "default-cr", action = ArgAction::SetTrue)]
    default_cr: bool,
    /// YAML file with custom resources to apply once the module is ready
    #[arg(long = "cr-path")]
    cr_path: Option<String>,
    /// Typed value set on every custom resource: [string|int|bool|path:]path=value
    #[arg(long = "set")]
    set: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a core module to the manifest
    Enable {
        module: String,
        /// Release channel (default: the manifest's channel)
        #[arg(short = 'c', long = "channel", default_value = "")]
        channel: String,
        #[command(flatten)]
        crs: CrArgs,
    },
    /// Remove a module
    Disable {
        module: String,
        /// Uninstall a community module instead of editing the manifest
        #[arg(long = "community", action = ArgAction::SetTrue)]
        community: bool,
    },
    /// Hand a module back to the operator
    Manage {
        module: String,
        /// Let the operator create and delete the default custom resource
        #[arg(long = "default-cr", action = ArgAction::SetTrue)]
        default_cr: bool,
    },
    /// Take a module out of the operator's control
    Unmanage { module: String },
    /// Install a community module
    Install {
        module: String,
        /// Module version (default: latest)
        #[arg(long = "version", default_value = "")]
        version: String,
        #[command(flatten)]
        crs: CrArgs,
    },
    /// Remove an installed community module
    Uninstall {
        module: String,
        /// Remove even when resources of the module's kinds are still running
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// List module templates, or the channels of one module
    Catalog {
        module: Option<String>,
        #[arg(long = "community", action = ArgAction::SetTrue)]
        community: bool,
        /// Community modules from the remote catalog
        #[arg(long = "remote", action = ArgAction::SetTrue)]
        remote: bool,
    },
    /// Resolve an apiVersion and kind to the served resource
    Resolve { api_version: String, kind: String },
    /// Server-side apply the documents of YAML files
    Apply {
        #[arg(required = true)]
        files: Vec<String>,
        /// Typed value set on every document: [string|int|bool|path:]path=value
        #[arg(long = "set")]
        set: Vec<String>,
    },
    /// Delete the resources named by the documents of YAML files
    Delete {
        #[arg(required = true)]
        files: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("MODCTL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MODCTL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MODCTL_METRICS_ADDR; expected host:port");
        }
    }
}

struct Wiring {
    resolver: Arc<Resolver>,
    resources: ResourceClient,
    orch: ModuleOrchestrator,
    printer: Printer,
}

async fn wire(cfg: &Config) -> Result<Wiring> {
    let client = modctl_kubehub::get_kube_client().await?;
    let mut resolver = Resolver::new(Arc::new(KubeDiscovery::new(client.clone())));
    if cfg.discovery_cache {
        resolver = resolver.with_cache();
    }
    let resolver = Arc::new(resolver);
    let resources =
        ResourceClient::new(resolver.clone(), Arc::new(KubeAccess::new(client))).with_default_namespace(cfg.default_namespace.clone());

    let metadata: Arc<dyn ModuleMetadata> =
        Arc::new(ManifestClient::new(resources.clone(), cfg.manifest_name.clone(), cfg.manifest_namespace.clone()));
    let fetcher = Arc::new(HttpFetcher::new(cfg.fetch_timeout()).context("failed to build HTTP client")?);
    let mut catalog = Catalog::new(Arc::new(ClusterSource::new(metadata.clone())), fetcher.clone(), resources.clone(), metadata.clone());
    if let Some(url) = &cfg.community_catalog_url {
        catalog = catalog.with_remote(Arc::new(RemoteSource::new(fetcher, url.clone())));
    }

    let printer = Printer::stdout();
    let orch = ModuleOrchestrator::new(resources.clone(), metadata, Arc::new(catalog), printer.clone()).with_timeout(cfg.wait_timeout());
    Ok(Wiring { resolver, resources, orch, printer })
}

fn parse_params(raw: &[String]) -> Result<Vec<Parameter>> {
    raw.iter().map(|s| Parameter::from_assignment(s).map_err(anyhow::Error::from)).collect()
}

fn read_file(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read file {}", path))
}

fn custom_resources(orch: &ModuleOrchestrator, args: &CrArgs) -> Result<Vec<Json>> {
    let params = parse_params(&args.set)?;
    match &args.cr_path {
        Some(path) => Ok(orch.prepare_custom_resources(&read_file(path)?, &params)?),
        None if !params.is_empty() => bail!("--set requires --cr-path"),
        None => Ok(Vec::new()),
    }
}

fn documents(files: &[String], params: &[Parameter]) -> Result<Vec<Json>> {
    let mut docs = Vec::new();
    for file in files {
        let mut parsed = split_manifests(&read_file(file)?).with_context(|| format!("failed to parse {}", file))?;
        for doc in parsed.iter_mut() {
            modctl_params::set(doc, params)?;
        }
        docs.extend(parsed);
    }
    Ok(docs)
}

#[derive(serde::Serialize)]
struct TemplateRow<'a> {
    name: &'a str,
    module: &'a str,
    version: &'a str,
    community: bool,
}

fn print_templates(printer: &Printer, output: Output, templates: &[ModuleTemplate]) -> Result<()> {
    match output {
        Output::Human => {
            printer.msgln(format!("{:<32} {:<24} {}", "NAME", "MODULE", "VERSION"));
            for t in templates {
                printer.msgln(format!("{:<32} {:<24} {}", t.name(), t.module_name(), t.version()));
            }
        }
        Output::Json => {
            let rows: Vec<_> = templates
                .iter()
                .map(|t| TemplateRow { name: t.name(), module: t.module_name(), version: t.version(), community: t.is_community() })
                .collect();
            printer.msgln(serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

async fn run(cli: Cli, scope: &WaitScope) -> Result<()> {
    let mut cfg = Config::from_env();
    if let Some(ns) = cli.namespace {
        cfg.default_namespace = ns;
    }
    if let Some(secs) = cli.timeout {
        cfg.wait_timeout_secs = secs;
    }
    let Wiring { resolver, resources, orch, printer } = wire(&cfg).await?;

    match cli.command {
        Commands::Enable { module, channel, crs } => {
            info!(module = %module, channel = %channel, "enable invoked");
            let crs_docs = custom_resources(&orch, &crs)?;
            orch.enable(&module, &channel, crs.default_cr, &crs_docs, scope).await?;
        }
        Commands::Disable { module, community } => {
            info!(module = %module, community, "disable invoked");
            orch.disable(&module, community, scope).await?;
        }
        Commands::Manage { module, default_cr } => {
            info!(module = %module, "manage invoked");
            orch.manage(&module, CustomResourcePolicy::from_default_cr(default_cr), scope).await?;
            printer.msgln(format!("{} module managed", module));
        }
        Commands::Unmanage { module } => {
            info!(module = %module, "unmanage invoked");
            orch.unmanage(&module, scope).await?;
            printer.msgln(format!("{} module unmanaged", module));
        }
        Commands::Install { module, version, crs } => {
            info!(module = %module, version = %version, "install invoked");
            let crs_docs = custom_resources(&orch, &crs)?;
            orch.install(&module, &version, crs.default_cr, &crs_docs, scope).await?;
        }
        Commands::Uninstall { module, force } => {
            info!(module = %module, force, "uninstall invoked");
            let running = orch.running_resources_of_community_module(&module).await?;
            if !running.is_empty() {
                printer.msgln(format!("the {} module still has running resources:", module));
                for r in &running {
                    printer.msgln(format!("  {}", r));
                }
                if !force {
                    bail!("refusing to remove {} while its resources are running; pass --force to remove anyway", module);
                }
            }
            let report = orch.uninstall(&module, scope).await?;
            if !report.is_clean() {
                bail!("{} of the {} module resources could not be removed", report.failed.len(), module);
            }
        }
        Commands::Catalog { module: Some(module), .. } => {
            let channels = orch.available_channels(&module).await?;
            match cli.output {
                Output::Human => {
                    printer.msgln(format!("{:<16} {}", "CHANNEL", "VERSION"));
                    for (channel, version) in &channels {
                        printer.msgln(format!("{:<16} {}", channel, version));
                    }
                }
                Output::Json => printer.msgln(serde_json::to_string_pretty(&channels)?),
            }
        }
        Commands::Catalog { module: None, community, remote } => {
            let catalog = orch.catalog();
            let templates = if remote {
                catalog.external_community().await?
            } else if community {
                catalog.community().await?
            } else {
                catalog.core().await?
            };
            print_templates(&printer, cli.output, &templates)?;
        }
        Commands::Resolve { api_version, kind } => {
            let desc = resolver.resolve(&api_version, &kind).await?;
            match cli.output {
                Output::Human => {
                    let reach = if desc.namespaced { "namespaced" } else { "cluster" };
                    printer.msgln(format!("{} • {} • {} • {}", desc.api_version(), desc.kind, desc.plural, reach));
                }
                Output::Json => printer.msgln(serde_json::to_string_pretty(&desc)?),
            }
        }
        Commands::Apply { files, set } => {
            let params = parse_params(&set)?;
            for doc in documents(&files, &params)? {
                let applied = resources.apply(&doc).await?;
                printer.msgln(format!("applied {}", ObjectRef::from_json(&applied)?));
            }
        }
        Commands::Delete { files } => {
            for doc in documents(&files, &[])? {
                let r = ObjectRef::from_json(&doc)?;
                match resources.remove(&r).await {
                    Ok(()) => printer.msgln(format!("deleted {}", r)),
                    Err(e) if e.is_not_found() => printer.msgln(format!("{} not found", r)),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let scope = WaitScope::new(COMMAND_BUDGET);
    let token = scope.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });

    match run(cli, &scope).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
