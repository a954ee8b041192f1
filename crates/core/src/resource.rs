//! Resource coordinates and schema-less object navigation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::fmt;

/// Group/version/resource triple addressing one served resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), resource: resource.to_string() }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `resource.group` as printed by kubectl.
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() { self.resource.clone() } else { format!("{}.{}", self.resource, self.group) }
    }

    /// Parse `group/version/resource` or `version/resource`.
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, resource] if !version.is_empty() && !resource.is_empty() => Some(Self::new("", version, resource)),
            [group, version, resource] if !version.is_empty() && !resource.is_empty() => Some(Self::new(group, version, resource)),
            _ => None,
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Fully qualified reference to one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub gvr: Gvr,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(gvr: Gvr, namespace: Option<&str>, name: &str) -> Self {
        Self { gvr, namespace: namespace.map(str::to_string), name: name.to_string() }
    }
}

/// A path of map keys into a nested JSON object, e.g. `spec.storage.s3.bucket`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NestedPath(SmallVec<[String; 4]>);

impl NestedPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Split a dotted path. Empty segments are ignored.
    pub fn dotted(path: &str) -> Self {
        Self(path.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Path without its final segment, and the final segment.
    pub fn split_last(&self) -> Option<(&[String], &str)> {
        self.0.split_last().map(|(last, parent)| (parent, last.as_str()))
    }
}

impl fmt::Display for NestedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Typed view of the value found at a nested path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Leaf<'a> {
    String(&'a str),
    List(&'a [Value]),
    Map(&'a Map<String, Value>),
    Other(&'a Value),
}

impl<'a> Leaf<'a> {
    pub fn of(v: &'a Value) -> Self {
        match v {
            Value::String(s) => Leaf::String(s),
            Value::Array(a) => Leaf::List(a),
            Value::Object(m) => Leaf::Map(m),
            other => Leaf::Other(other),
        }
    }
}

/// Walk `path` inside `root`. Missing keys and non-map intermediates yield `None`.
pub fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

pub fn lookup_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in path {
        cur = cur.as_object_mut()?.get_mut(seg)?;
    }
    Some(cur)
}

/// An object without a compiled schema: the raw JSON body as served by the cluster.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicObject(pub Value);

impl DynamicObject {
    pub fn new(v: Value) -> Self { Self(v) }
    pub fn into_value(self) -> Value { self.0 }
    pub fn value(&self) -> &Value { &self.0 }
    pub fn value_mut(&mut self) -> &mut Value { &mut self.0 }

    pub fn name(&self) -> &str { self.str_at(&["metadata", "name"]).unwrap_or_default() }
    pub fn namespace(&self) -> Option<&str> { self.str_at(&["metadata", "namespace"]).filter(|s| !s.is_empty()) }
    pub fn uid(&self) -> Option<&str> { self.str_at(&["metadata", "uid"]) }
    pub fn kind(&self) -> Option<&str> { self.str_at(&["kind"]) }
    pub fn api_version(&self) -> Option<&str> { self.str_at(&["apiVersion"]) }

    pub fn label(&self, key: &str) -> Option<&str> { self.str_at(&["metadata", "labels", key]) }
    pub fn annotation(&self, key: &str) -> Option<&str> { self.str_at(&["metadata", "annotations", key]) }

    pub fn get(&self, path: &NestedPath) -> Option<Leaf<'_>> {
        lookup(&self.0, path.segments()).map(Leaf::of)
    }

    pub fn get_str(&self, path: &NestedPath) -> Option<&str> {
        match self.get(path)? { Leaf::String(s) => Some(s), _ => None }
    }

    pub fn get_list(&self, path: &NestedPath) -> Option<&[Value]> {
        match self.get(path)? { Leaf::List(l) => Some(l), _ => None }
    }

    pub fn get_map(&self, path: &NestedPath) -> Option<&Map<String, Value>> {
        match self.get(path)? { Leaf::Map(m) => Some(m), _ => None }
    }

    /// Convenience for literal paths: `obj.str_at(&["spec", "claim"])`.
    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        let mut cur = &self.0;
        for seg in path {
            cur = cur.as_object()?.get(*seg)?;
        }
        cur.as_str()
    }

    pub fn at(&self, path: &[&str]) -> Option<&Value> {
        let mut cur = &self.0;
        for seg in path {
            cur = cur.as_object()?.get(*seg)?;
        }
        Some(cur)
    }

    /// Replace the value at `path`, creating intermediate maps.
    /// Returns false when an intermediate exists and is not a map.
    pub fn set(&mut self, path: &NestedPath, v: Value) -> bool {
        let Some((parent, last)) = path.split_last() else {
            self.0 = v;
            return true;
        };
        let mut cur = &mut self.0;
        for seg in parent {
            if cur.is_null() {
                *cur = Value::Object(Map::new());
            }
            let Some(obj) = cur.as_object_mut() else { return false };
            cur = obj.entry(seg.clone()).or_insert(Value::Null);
        }
        if cur.is_null() {
            *cur = Value::Object(Map::new());
        }
        match cur.as_object_mut() {
            Some(obj) => {
                obj.insert(last.to_string(), v);
                true
            }
            None => false,
        }
    }

    /// Remove the entry at `path`; absent paths are a no-op.
    pub fn remove(&mut self, path: &NestedPath) -> Option<Value> {
        let (parent, last) = path.split_last()?;
        lookup_mut(&mut self.0, parent)?.as_object_mut()?.remove(last)
    }
}

impl From<Value> for DynamicObject {
    fn from(v: Value) -> Self { Self(v) }
}
