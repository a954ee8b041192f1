//! Per-item shaping: declared field operations, an optional hand-written
//! pass, and an optional projection onto one subtree.

use harvest_anonymize::FieldOp;
use harvest_core::{resource::lookup, DynamicObject, NestedPath};
use serde_json::{Map, Value};

pub type ShapeFn = fn(&mut DynamicObject);

#[derive(Debug, Clone, Default)]
pub struct Shape {
    pub ops: Vec<FieldOp>,
    pub custom: Option<ShapeFn>,
    /// Emit only this subtree; a missing subtree becomes `{}`.
    pub project: Option<NestedPath>,
}

impl Shape {
    pub fn none() -> Self { Self::default() }

    pub fn ops(ops: Vec<FieldOp>) -> Self { Self { ops, ..Self::default() } }

    pub fn custom(f: ShapeFn) -> Self { Self { custom: Some(f), ..Self::default() } }

    pub fn project(path: &str) -> Self { Self { project: Some(NestedPath::dotted(path)), ..Self::default() } }

    pub fn with_ops(mut self, ops: Vec<FieldOp>) -> Self {
        self.ops.extend(ops);
        self
    }

    pub fn with_custom(mut self, f: ShapeFn) -> Self {
        self.custom = Some(f);
        self
    }

    pub fn is_identity(&self) -> bool { self.ops.is_empty() && self.custom.is_none() && self.project.is_none() }

    pub fn apply(&self, mut obj: DynamicObject) -> Value {
        harvest_anonymize::apply_all(&mut obj, &self.ops);
        if let Some(f) = self.custom {
            f(&mut obj);
        }
        match &self.project {
            Some(path) => lookup(obj.value(), path.segments()).cloned().unwrap_or_else(|| Value::Object(Map::new())),
            None => obj.into_value(),
        }
    }
}

/// The key of the last-applied annotation, which embeds dots.
pub fn last_applied() -> FieldOp {
    FieldOp::Remove(NestedPath::new(["metadata", "annotations", "kubectl.kubernetes.io/last-applied-configuration"]))
}
