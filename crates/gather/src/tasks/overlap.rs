//! Namespaces whose service-account UID ranges overlap.

use std::collections::BTreeSet;

use harvest_core::{JsonMarshaller, Record, TaskOutput};
use harvest_kubehub::{ListQuery, Profile};
use k8s_openapi::api::core::v1::Namespace;

use crate::{access_failure, TaskContext};

pub const UID_RANGE_ANNOTATION: &str = "openshift.io/sa.scc.uid-range";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub start: i64,
    pub len: i64,
}

impl UidRange {
    /// `start/len`
    pub fn parse(s: &str) -> Option<Self> {
        let (start, len) = s.split_once('/')?;
        Some(Self { start: start.trim().parse().ok()?, len: len.trim().parse().ok()? })
    }

    fn end(&self) -> i64 { self.start + self.len }

    pub fn overlaps(&self, other: &UidRange) -> bool {
        (self.end() > other.start && self.end() <= other.end()) || (other.end() > self.start && other.end() <= self.end())
    }
}

/// Groups in which every member overlaps every other. A namespace may sit in
/// several groups; pairs join the first group they both fit.
pub fn overlapping_groups(namespaces: &[(String, UidRange)]) -> Vec<BTreeSet<String>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, (_, a)) in namespaces.iter().enumerate() {
        for (j, (_, b)) in namespaces.iter().enumerate().skip(i + 1) {
            if !a.overlaps(b) {
                continue;
            }
            let fits = |g: &Vec<usize>| g.iter().all(|&k| a.overlaps(&namespaces[k].1) && b.overlaps(&namespaces[k].1));
            match groups.iter_mut().find(|g| fits(g)) {
                Some(g) => {
                    for k in [i, j] {
                        if !g.contains(&k) {
                            g.push(k);
                        }
                    }
                }
                None => groups.push(vec![i, j]),
            }
        }
    }
    groups.into_iter().map(|g| g.into_iter().map(|k| namespaces[k].0.clone()).collect()).collect()
}

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let listed = ctx.clients.workload(Profile::Proto).list::<Namespace>(None, &ListQuery::default()).await;
    let paged = match listed {
        Ok(p) => p,
        Err(e) => return access_failure("listing namespaces", e),
    };
    let mut out = TaskOutput::new();
    let mut ranges = Vec::with_capacity(paged.items.len());
    for ns in &paged.items {
        let name = ns.metadata.name.clone().unwrap_or_default();
        let range = ns.metadata.annotations.as_ref().and_then(|a| a.get(UID_RANGE_ANNOTATION)).and_then(|s| UidRange::parse(s));
        match range {
            Some(r) => ranges.push((name, r)),
            None => out.warn(format!("can't read uid range of the {name} namespace")),
        }
    }
    out.push(Record::new("config/namespaces_with_overlapping_uids", JsonMarshaller(overlapping_groups(&ranges))));
    for w in paged.warnings() {
        out.warn(w);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(name: &str, r: &str) -> (String, UidRange) { (name.to_string(), UidRange::parse(r).expect("range")) }

    #[test]
    fn parses_start_and_length() {
        assert_eq!(UidRange::parse("1000680000/10000"), Some(UidRange { start: 1000680000, len: 10000 }));
        assert_eq!(UidRange::parse("garbage"), None);
        assert_eq!(UidRange::parse("1/x"), None);
    }

    #[test]
    fn contained_range_overlaps() {
        let groups = overlapping_groups(&[ns("A", "10000/2000"), ns("B", "11000/1000"), ns("C", "20000/1000")]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].iter().map(String::as_str).collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn chain_splits_into_groups() {
        // B overlaps both neighbours, A and C do not overlap each other.
        let groups = overlapping_groups(&[ns("A", "0/100"), ns("B", "50/100"), ns("C", "120/100")]);
        let as_vec: Vec<Vec<&str>> = groups.iter().map(|g| g.iter().map(String::as_str).collect()).collect();
        assert_eq!(as_vec, vec![vec!["A", "B"], vec!["B", "C"]]);
    }
}
