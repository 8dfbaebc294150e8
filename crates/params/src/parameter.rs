use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ParamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Int,
    Bool,
    /// Value is read from the file named on input.
    Path,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Int => "int",
            ParamKind::Bool => "bool",
            ParamKind::Path => "path",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" | "str" => Some(ParamKind::String),
            "int" | "int64" => Some(ParamKind::Int),
            "bool" => Some(ParamKind::Bool),
            "path" | "file" => Some(ParamKind::Path),
            _ => None,
        }
    }
}

/// A typed value bound to a destination path. `None` means unset (no input, no default).
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    String { path: String, value: Option<String> },
    Int { path: String, value: Option<i64> },
    Bool { path: String, value: Option<bool> },
    Path { path: String, value: Option<String> },
}

impl Parameter {
    /// New parameter; a default of the wrong JSON type is ignored.
    pub fn new(kind: ParamKind, path: impl Into<String>, default: Option<&Json>) -> Self {
        let path = path.into();
        match kind {
            ParamKind::String => Parameter::String { path, value: default.and_then(|d| d.as_str()).map(|s| s.to_string()) },
            ParamKind::Int => Parameter::Int { path, value: default.and_then(|d| d.as_i64()) },
            ParamKind::Bool => Parameter::Bool { path, value: default.and_then(|d| d.as_bool()) },
            ParamKind::Path => Parameter::Path { path, value: default.and_then(|d| d.as_str()).map(|s| s.to_string()) },
        }
    }

    /// Parse `[kind:]path=value`; the kind defaults to string.
    pub fn from_assignment(s: &str) -> Result<Self, ParamError> {
        let (lhs, raw) = s.split_once('=').ok_or_else(|| ParamError::Parse {
            input: s.to_string(),
            kind: "assignment",
            reason: "expected [kind:]path=value".into(),
        })?;
        let (kind, path) = match lhs.split_once(':') {
            Some((k, p)) => {
                let kind = ParamKind::parse(k).ok_or_else(|| ParamError::Parse {
                    input: s.to_string(),
                    kind: "assignment",
                    reason: format!("unknown parameter kind {}", k),
                })?;
                (kind, p)
            }
            None => (ParamKind::String, lhs),
        };
        let mut p = Parameter::new(kind, path, None);
        p.set(raw)?;
        Ok(p)
    }

    pub fn kind(&self) -> ParamKind {
        match self {
            Parameter::String { .. } => ParamKind::String,
            Parameter::Int { .. } => ParamKind::Int,
            Parameter::Bool { .. } => ParamKind::Bool,
            Parameter::Path { .. } => ParamKind::Path,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Parameter::String { path, .. } | Parameter::Int { path, .. } | Parameter::Bool { path, .. } | Parameter::Path { path, .. } => path,
        }
    }

    /// Parse raw input into the value. Empty input leaves the value as it was.
    pub fn set(&mut self, raw: &str) -> Result<(), ParamError> {
        if raw.is_empty() {
            return Ok(());
        }
        let kind = self.kind();
        let fail = |reason: String| ParamError::Parse { input: raw.to_string(), kind: kind.as_str(), reason };
        match self {
            Parameter::String { value, .. } => *value = Some(raw.to_string()),
            Parameter::Int { value, .. } => *value = Some(raw.trim().parse::<i64>().map_err(|e| fail(e.to_string()))?),
            Parameter::Bool { value, .. } => *value = Some(raw.trim().parse::<bool>().map_err(|e| fail(e.to_string()))?),
            Parameter::Path { value, .. } => {
                let contents = std::fs::read_to_string(raw).map_err(|e| fail(e.to_string()))?;
                if !contents.is_empty() {
                    *value = Some(contents);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self) -> Option<Json> {
        match self {
            Parameter::String { value, .. } | Parameter::Path { value, .. } => value.clone().map(Json::String),
            Parameter::Int { value, .. } => value.map(Json::from),
            Parameter::Bool { value, .. } => value.map(Json::Bool),
        }
    }

    /// Render back to the textual form; empty when unset.
    pub fn serialize(&self) -> String {
        match self {
            Parameter::String { value, .. } | Parameter::Path { value, .. } => value.clone().unwrap_or_default(),
            Parameter::Int { value, .. } => value.map(|v| v.to_string()).unwrap_or_default(),
            Parameter::Bool { value, .. } => value.map(|v| v.to_string()).unwrap_or_default(),
        }
    }
}
