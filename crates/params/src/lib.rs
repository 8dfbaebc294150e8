//! modctl params: build nested fragments from `(path, value)` pairs and merge them into documents.

#![forbid(unsafe_code)]

use serde_json::{Map, Value as Json};
use tracing::debug;

mod parameter;

pub use parameter::{ParamKind, Parameter};

/// Largest array index a path may address.
pub const MAX_INDEX: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("invalid path {path}: {reason}")]
    Path { path: String, reason: String },
    #[error("failed to parse {input:?} as {kind}: {reason}")]
    Parse { input: String, kind: &'static str, reason: String },
    #[error("fields have different types for key {key}: type {found} other than expected {expected}")]
    Validation { key: String, found: &'static str, expected: &'static str },
    #[error("failed to build value {value} for path {path}")]
    Build {
        value: String,
        path: String,
        #[source]
        source: Box<ParamError>,
    },
    #[error("failed to set value {value} for path {path}")]
    Set {
        value: String,
        path: String,
        #[source]
        source: Box<ParamError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    /// `name[]` is index 0, `name[N]` is index N.
    Indexed(String, usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>, ParamError> {
    let bad = |reason: String| ParamError::Path { path: path.to_string(), reason };
    let s = path.strip_prefix('.').unwrap_or(path);
    if s.is_empty() {
        return Err(bad("empty path".into()));
    }
    let mut out = Vec::new();
    for seg in s.split('.') {
        if seg.is_empty() {
            return Err(bad("empty segment".into()));
        }
        match seg.find('[') {
            None if seg.contains(']') => return Err(bad(format!("unbalanced bracket in {}", seg))),
            None => out.push(Segment::Field(seg.to_string())),
            Some(open) => {
                let name = &seg[..open];
                let inner = seg[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| bad(format!("index must close segment {}", seg)))?;
                if name.is_empty() {
                    return Err(bad(format!("missing field name before index in {}", seg)));
                }
                let idx = if inner.is_empty() {
                    0
                } else {
                    inner
                        .parse::<usize>()
                        .map_err(|_| bad(format!("failed to get slice element number from field {}", seg)))?
                };
                if idx > MAX_INDEX {
                    return Err(bad(format!("index {} exceeds {}", idx, MAX_INDEX)));
                }
                out.push(Segment::Indexed(name.to_string(), idx));
            }
        }
    }
    Ok(out)
}

/// Minimal document placing `value` at `path`.
pub fn materialize(path: &str, value: Json) -> Result<Json, ParamError> {
    let segs = parse_path(path)?;
    Ok(build(&segs, value))
}

fn build(segs: &[Segment], value: Json) -> Json {
    let Some((seg, rest)) = segs.split_first() else { return value };
    let inner = build(rest, value);
    let mut obj = Map::new();
    match seg {
        Segment::Field(name) => {
            obj.insert(name.clone(), inner);
        }
        Segment::Indexed(name, idx) => {
            let mut arr = vec![Json::Null; idx + 1];
            arr[*idx] = inner;
            obj.insert(name.clone(), Json::Array(arr));
        }
    }
    Json::Object(obj)
}

/// Kind names reported by validation errors.
pub fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(n) if n.is_i64() => "int64",
        Json::Number(n) if n.is_u64() => "uint64",
        Json::Number(_) => "float64",
        Json::String(_) => "string",
        Json::Array(_) => "slice",
        Json::Object(_) => "map",
    }
}

/// Fold `fragment` into `dest`. A `null` destination becomes an empty object first.
pub fn merge(fragment: &Json, dest: &mut Json) -> Result<(), ParamError> {
    if dest.is_null() {
        *dest = Json::Object(Map::new());
    }
    match (fragment, dest) {
        (Json::Object(from), Json::Object(to)) => merge_maps(from, to),
        (from, to) => Err(ParamError::Validation { key: ".".into(), found: kind_name(from), expected: kind_name(to) }),
    }
}

fn merge_maps(from: &Map<String, Json>, to: &mut Map<String, Json>) -> Result<(), ParamError> {
    for (key, val) in from {
        match to.get_mut(key) {
            None => {
                to.insert(key.clone(), val.clone());
            }
            Some(existing) => merge_value(key, val, existing)?,
        }
    }
    Ok(())
}

fn merge_value(key: &str, src: &Json, dst: &mut Json) -> Result<(), ParamError> {
    // null marks a slot that was not supplied
    if src.is_null() {
        return Ok(());
    }
    if dst.is_null() {
        *dst = src.clone();
        return Ok(());
    }
    if kind_name(src) != kind_name(dst) {
        return Err(ParamError::Validation { key: key.to_string(), found: kind_name(src), expected: kind_name(dst) });
    }
    match (src, dst) {
        (Json::Object(from), Json::Object(to)) => merge_maps(from, to),
        (Json::Array(from), Json::Array(to)) => merge_arrays(key, from, to),
        (s, d) => {
            *d = s.clone();
            Ok(())
        }
    }
}

fn merge_arrays(key: &str, from: &[Json], to: &mut Vec<Json>) -> Result<(), ParamError> {
    for (i, s) in from.iter().enumerate() {
        if i >= to.len() {
            to.push(s.clone());
            continue;
        }
        match s {
            Json::Null => continue,
            Json::Object(_) | Json::Array(_) => merge_value(&format!("{}[{}]", key, i), s, &mut to[i])?,
            // scalars replace whatever sits in the slot
            _ => to[i] = s.clone(),
        }
    }
    Ok(())
}

fn display_value(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Materialize and merge every parameter that carries a value, in order.
///
/// The first failure stops the batch; earlier merges stay in `doc`.
pub fn set(doc: &mut Json, params: &[Parameter]) -> Result<(), ParamError> {
    for p in params {
        let Some(value) = p.get() else { continue };
        let shown = display_value(&value);
        let fragment = materialize(p.path(), value).map_err(|e| ParamError::Build {
            value: shown.clone(),
            path: p.path().to_string(),
            source: Box::new(e),
        })?;
        merge(&fragment, doc).map_err(|e| ParamError::Set { value: shown.clone(), path: p.path().to_string(), source: Box::new(e) })?;
        debug!(path = %p.path(), kind = ?p.kind(), "parameter set");
    }
    Ok(())
}

/// Read the value found at `path`, if any.
pub fn lookup<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    let segs = parse_path(path).ok()?;
    let mut cur = doc;
    for seg in &segs {
        cur = match seg {
            Segment::Field(name) => cur.get(name)?,
            Segment::Indexed(name, idx) => cur.get(name)?.get(*idx)?,
        };
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_grammar() {
        assert_eq!(
            parse_path(".spec.elems[].iter").expect("ok"),
            vec![Segment::Field("spec".into()), Segment::Indexed("elems".into(), 0), Segment::Field("iter".into())]
        );
        assert_eq!(parse_path("a[3]").expect("ok"), vec![Segment::Indexed("a".into(), 3)]);
        for bad in ["", ".", ".a..b", ".a[x]", ".a[1]b", ".[2]", ".a]", ".a[99999]"] {
            assert!(parse_path(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn explicit_index_grows_with_empty_slots() {
        let v = materialize(".spec.list[2].name", json!("x")).expect("ok");
        assert_eq!(v, json!({"spec": {"list": [null, null, {"name": "x"}]}}));
        let leaf = materialize("ports[1]", json!(80)).expect("ok");
        assert_eq!(leaf, json!({"ports": [null, 80]}));
    }

    #[test]
    fn bare_brackets_overwrite_index_zero() {
        let mut doc = json!({});
        merge(&materialize(".spec.elems[].iter", json!(1)).expect("m1"), &mut doc).expect("merge 1");
        merge(&materialize(".spec.elems[].iter", json!(2)).expect("m2"), &mut doc).expect("merge 2");
        assert_eq!(doc, json!({"spec": {"elems": [{"iter": 2}]}}));
    }

    #[test]
    fn increasing_indices_accumulate() {
        let mut doc = json!({});
        for (i, v) in ["a", "b", "c"].iter().enumerate() {
            merge(&materialize(&format!(".items[{}]", i), json!(v)).expect("m"), &mut doc).expect("merge");
        }
        assert_eq!(doc, json!({"items": ["a", "b", "c"]}));
    }

    #[test]
    fn missing_source_slots_keep_destination_elements() {
        let mut doc = json!({"list": ["keep", {"a": 1}, "tail", "extra"]});
        merge(&materialize(".list[1].b", json!(2)).expect("m"), &mut doc).expect("merge");
        assert_eq!(doc, json!({"list": ["keep", {"a": 1, "b": 2}, "tail", "extra"]}));
    }

    #[test]
    fn mismatched_kinds_name_both() {
        let mut doc = json!({"metadata": {"name": "test"}});
        let e = merge(&materialize(".metadata.name", json!(1)).expect("m"), &mut doc).unwrap_err();
        assert_eq!(e.to_string(), "fields have different types for key name: type int64 other than expected string");
        assert_eq!(doc, json!({"metadata": {"name": "test"}}));
    }

    #[test]
    fn merging_every_key_of_the_fragment() {
        let mut doc = json!({"spec": {"a": 1}});
        merge(&json!({"spec": {"a": 2, "b": 3}, "status": {"ok": true}}), &mut doc).expect("merge");
        assert_eq!(doc, json!({"spec": {"a": 2, "b": 3}, "status": {"ok": true}}));
    }

    #[test]
    fn scalar_slots_are_replaced_and_nested_lists_merge() {
        let mut doc = json!({"spec": {"elems": ["1", "2", []]}});
        merge(&json!({"spec": {"elems": [1, "2", ["1a"], "12", "14"]}}), &mut doc).expect("merge");
        assert_eq!(doc, json!({"spec": {"elems": [1, "2", ["1a"], "12", "14"]}}));
    }

    #[test]
    fn lookup_follows_the_same_grammar() {
        let doc = json!({"spec": {"elems": [{"iter": 2}]}});
        assert_eq!(lookup(&doc, ".spec.elems[].iter"), Some(&json!(2)));
        assert_eq!(lookup(&doc, ".spec.elems[3].iter"), None);
    }
}
