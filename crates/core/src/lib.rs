//! Harvest core types: records, marshallers, task outcomes and dynamic objects.

#![forbid(unsafe_code)]

pub mod names;
pub mod outcome;
pub mod record;
pub mod resource;

pub use names::RecordName;
pub use outcome::{Outcome, TaskOutput};
pub use record::{JsonMarshaller, Marshaller, RawBytes, RawJson, Record, ResourceMarshaller, JSON_EXTENSION};
pub use resource::{DynamicObject, Gvr, Leaf, NestedPath, ResourceRef};

pub mod prelude {
    pub use super::{
        DynamicObject, Gvr, JsonMarshaller, Leaf, Marshaller, NestedPath, Outcome, RawBytes, RawJson, Record, RecordName,
        ResourceMarshaller, ResourceRef, TaskOutput,
    };
}

/// Identifier of a catalog entry: `<group>/<task>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TaskId {
    pub group: String,
    pub name: String,
}

impl TaskId {
    pub fn new(group: &str, name: &str) -> Self { Self { group: group.to_string(), name: name.to_string() } }

    pub fn parse(key: &str) -> Option<Self> {
        let (group, name) = key.split_once('/')?;
        if group.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(group, name))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips_through_display() {
        let id = TaskId::parse("clusterconfig/node_logs").expect("id");
        assert_eq!(id.to_string(), "clusterconfig/node_logs");
        assert!(TaskId::parse("clusterconfig").is_none());
        assert!(TaskId::parse("a/b/c").is_none());
        assert!(TaskId::parse("/b").is_none());
    }
}
