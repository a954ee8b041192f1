//! Which registry entries a run executes.

use std::collections::BTreeSet;

use harvest_core::TaskId;

/// Disables every task.
pub const ALL: &str = "ALL";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    all_disabled: bool,
    /// Task ids (`group/task`) or whole groups.
    disabled: BTreeSet<String>,
    only: Option<BTreeSet<String>>,
}

impl Selection {
    pub fn new() -> Self { Self::default() }

    /// Entries are trimmed; empty ones are ignored.
    pub fn disabled<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut s = Self::default();
        for item in items {
            let item = item.as_ref().trim();
            if item == ALL {
                s.all_disabled = true;
            } else if !item.is_empty() {
                s.disabled.insert(item.to_string());
            }
        }
        s
    }

    /// Restrict the run to these ids; disabled entries stay disabled.
    pub fn only<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: BTreeSet<String> = ids.into_iter().map(|s| s.as_ref().trim().to_string()).filter(|s| !s.is_empty()).collect();
        if !ids.is_empty() {
            self.only = Some(ids);
        }
        self
    }

    pub fn is_enabled(&self, id: &TaskId) -> bool {
        if self.all_disabled {
            return false;
        }
        let key = id.to_string();
        if self.disabled.contains(&key) || self.disabled.contains(&id.group) {
            return false;
        }
        self.only.as_ref().map_or(true, |only| only.contains(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId { TaskId::parse(s).expect("id") }

    #[test]
    fn disabled_by_id_group_or_all() {
        let s = Selection::disabled(["clusterconfig/node_logs", " ", "workloads"]);
        assert!(!s.is_enabled(&id("clusterconfig/node_logs")));
        assert!(s.is_enabled(&id("clusterconfig/nodes")));
        assert!(!s.is_enabled(&id("workloads/images")));
        assert!(!Selection::disabled(["ALL"]).is_enabled(&id("clusterconfig/nodes")));
    }

    #[test]
    fn only_narrows_the_run() {
        let s = Selection::disabled(["clusterconfig/metrics"]).only(["clusterconfig/metrics", "clusterconfig/nodes"]);
        assert!(s.is_enabled(&id("clusterconfig/nodes")));
        assert!(!s.is_enabled(&id("clusterconfig/metrics")));
        assert!(!s.is_enabled(&id("clusterconfig/dns")));
        assert!(Selection::new().only(Vec::<String>::new()).is_enabled(&id("clusterconfig/dns")));
    }
}
