//! Harvest anonymization service.
//!
//! Every operation is deterministic and keeps the shape of its input: strings
//! keep their length, URLs keep their punctuation, PEM payloads keep their
//! block count. Anonymizing an anonymized value returns it unchanged.

#![forbid(unsafe_code)]

use harvest_core::{DynamicObject, NestedPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod obfuscate;
pub mod pem;

pub use obfuscate::{Ipv4Net, ObfuscatingMarshaller, Obfuscator, CLUSTER_BASE_DOMAIN_PLACEHOLDER};
pub use pem::{anonymize_pem, ConfigMapAnonymizer, PemBlock};

/// Replacement character for anonymized content.
pub const PLACEHOLDER: char = 'x';
/// Replacement for values that are not strings.
pub const COMPOUND_PLACEHOLDER: &str = "xxx";

/// Replace every character with the placeholder.
pub fn string(s: &str) -> String {
    s.chars().map(|_| PLACEHOLDER).collect()
}

fn is_url_punct(c: char) -> bool {
    matches!(c, ':' | '/' | '.' | '-')
}

/// Keep URL punctuation (`:` `/` `.` `-`) and mask everything else.
pub fn url(s: &str) -> String {
    s.chars().map(|c| if is_url_punct(c) { c } else { PLACEHOLDER }).collect()
}

/// Comma-separated URL list; separators and element boundaries are kept.
pub fn url_csv(s: &str) -> String {
    s.split(',').map(url).collect::<Vec<_>>().join(",")
}

/// Anonymize each URL; an empty list is treated as absent.
pub fn url_slice(list: &[String]) -> Option<Vec<String>> {
    if list.is_empty() {
        return None;
    }
    Some(list.iter().map(|s| url(s)).collect())
}

/// Result of a nested-field operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    Changed,
    NotPresent,
}

fn mask_value(v: &mut Value, f: fn(&str) -> String) {
    match v {
        Value::Null => {}
        Value::String(s) => *s = f(s),
        Value::Array(items) if items.iter().all(Value::is_string) => {
            for it in items.iter_mut() {
                if let Value::String(s) = it {
                    *s = f(s);
                }
            }
        }
        other => *other = Value::String(COMPOUND_PLACEHOLDER.to_string()),
    }
}

fn at_path(obj: &mut DynamicObject, path: &NestedPath, f: impl FnOnce(&mut Value)) -> FieldChange {
    match harvest_core::resource::lookup_mut(obj.value_mut(), path.segments()) {
        Some(v) => {
            f(v);
            FieldChange::Changed
        }
        None => FieldChange::NotPresent,
    }
}

/// Strings are masked, string lists are masked per element, anything else becomes `"xxx"`.
pub fn nested_field(obj: &mut DynamicObject, path: &NestedPath) -> FieldChange {
    at_path(obj, path, |v| mask_value(v, string))
}

/// Like [`nested_field`] but with URL masking.
pub fn nested_url(obj: &mut DynamicObject, path: &NestedPath) -> FieldChange {
    at_path(obj, path, |v| mask_value(v, url))
}

pub fn nested_url_csv(obj: &mut DynamicObject, path: &NestedPath) -> FieldChange {
    at_path(obj, path, |v| mask_value(v, url_csv))
}

/// Mask every string value of the map at `path`.
pub fn nested_map_values(obj: &mut DynamicObject, path: &NestedPath) -> FieldChange {
    at_path(obj, path, |v| {
        if let Some(m) = v.as_object_mut() {
            for val in m.values_mut() {
                mask_value(val, string);
            }
        }
    })
}

/// Remove the entry; absent paths are a no-op.
pub fn remove_nested(obj: &mut DynamicObject, path: &NestedPath) -> FieldChange {
    match obj.remove(path) {
        Some(_) => FieldChange::Changed,
        None => FieldChange::NotPresent,
    }
}

/// Depth-first walk; every map entry whose key is in `keys` is masked.
pub fn recursive(v: &mut Value, keys: &[String]) -> usize {
    let mut hits = 0;
    match v {
        Value::Object(m) => {
            for (k, val) in m.iter_mut() {
                if keys.iter().any(|key| key == k) {
                    mask_value(val, string);
                    hits += 1;
                } else {
                    hits += recursive(val, keys);
                }
            }
        }
        Value::Array(items) => {
            for it in items.iter_mut() {
                hits += recursive(it, keys);
            }
        }
        _ => {}
    }
    hits
}

/// A declared sensitive path and how to treat it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOp {
    Anonymize(NestedPath),
    AnonymizeUrl(NestedPath),
    AnonymizeUrlCsv(NestedPath),
    AnonymizeMapValues(NestedPath),
    Remove(NestedPath),
    /// Mask these keys wherever they appear.
    Recursive(Vec<String>),
}

impl FieldOp {
    pub fn anonymize(path: &str) -> Self { FieldOp::Anonymize(NestedPath::dotted(path)) }
    pub fn url(path: &str) -> Self { FieldOp::AnonymizeUrl(NestedPath::dotted(path)) }
    pub fn url_csv(path: &str) -> Self { FieldOp::AnonymizeUrlCsv(NestedPath::dotted(path)) }
    pub fn map_values(path: &str) -> Self { FieldOp::AnonymizeMapValues(NestedPath::dotted(path)) }
    pub fn remove(path: &str) -> Self { FieldOp::Remove(NestedPath::dotted(path)) }
    pub fn recursive(keys: &[&str]) -> Self { FieldOp::Recursive(keys.iter().map(|k| k.to_string()).collect()) }

    pub fn apply(&self, obj: &mut DynamicObject) {
        match self {
            FieldOp::Anonymize(p) => { nested_field(obj, p); }
            FieldOp::AnonymizeUrl(p) => { nested_url(obj, p); }
            FieldOp::AnonymizeUrlCsv(p) => { nested_url_csv(obj, p); }
            FieldOp::AnonymizeMapValues(p) => { nested_map_values(obj, p); }
            FieldOp::Remove(p) => { remove_nested(obj, p); }
            FieldOp::Recursive(keys) => { recursive(obj.value_mut(), keys); }
        }
    }
}

pub fn apply_all(obj: &mut DynamicObject, ops: &[FieldOp]) {
    for op in ops {
        op.apply(obj);
    }
}
