//! In-memory [`ClusterAccess`] used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use harvest_core::{DynamicObject, Gvr};
use serde_json::Value;

use crate::{AccessError, ApiGroup, ByteStream, ClusterAccess, ListQuery, LogQuery, ObjectPage, Profile, RawRequest};

const CHUNK: usize = 64;

#[derive(Default)]
struct State {
    objects: BTreeMap<Gvr, Vec<DynamicObject>>,
    list_failures: BTreeMap<Gvr, AccessError>,
    logs: BTreeMap<(String, String, String), Bytes>,
    raw: BTreeMap<(Profile, String), Result<Bytes, AccessError>>,
    extra_groups: Vec<ApiGroup>,
    calls: Vec<String>,
}

/// A fake cluster. A kind is served once it has been registered, even with no
/// objects; listing an unregistered kind fails with `NotFound`.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    list_calls: Arc<AtomicUsize>,
}

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Register `gvr` as served without adding objects.
    pub fn serve(self, gvr: &Gvr) -> Self {
        self.with_state(|s| {
            s.objects.entry(gvr.clone()).or_default();
        });
        self
    }

    pub fn with(self, gvr: &Gvr, objects: impl IntoIterator<Item = Value>) -> Self {
        for o in objects {
            self.insert(gvr, o);
        }
        self.serve(gvr)
    }

    pub fn insert(&self, gvr: &Gvr, obj: Value) {
        self.with_state(|s| s.objects.entry(gvr.clone()).or_default().push(DynamicObject::new(obj)));
    }

    pub fn fail_list(self, gvr: &Gvr, err: AccessError) -> Self {
        self.with_state(|s| {
            s.list_failures.insert(gvr.clone(), err);
        });
        self
    }

    /// Log body for one container. An empty container name matches requests without one.
    pub fn with_logs(self, namespace: &str, pod: &str, container: &str, body: impl Into<Bytes>) -> Self {
        self.with_state(|s| {
            s.logs.insert((namespace.into(), pod.into(), container.into()), body.into());
        });
        self
    }

    /// Response body for a raw GET, keyed by path without query.
    pub fn with_raw(self, profile: Profile, path: &str, body: impl Into<Bytes>) -> Self {
        self.with_state(|s| {
            s.raw.insert((profile, path.into()), Ok(body.into()));
        });
        self
    }

    pub fn with_raw_error(self, profile: Profile, path: &str, err: AccessError) -> Self {
        self.with_state(|s| {
            s.raw.insert((profile, path.into()), Err(err));
        });
        self
    }

    pub fn with_group(self, name: &str, versions: &[&str]) -> Self {
        self.with_state(|s| {
            s.extra_groups.push(ApiGroup { name: name.into(), versions: versions.iter().map(|v| v.to_string()).collect() })
        });
        self
    }

    /// Number of list calls served so far, including failed ones.
    pub fn list_calls(&self) -> usize { self.list_calls.load(Ordering::Relaxed) }

    /// Every call in arrival order, e.g. `list v1/pods ns=openshift-etcd`.
    pub fn calls(&self) -> Vec<String> { self.with_state(|s| s.calls.clone()) }
}

fn label_term_matches(labels: Option<&serde_json::Map<String, Value>>, term: &str) -> bool {
    let get = |k: &str| labels.and_then(|m| m.get(k)).and_then(Value::as_str);
    let term = term.trim();
    if let Some((k, v)) = term.split_once("!=") {
        return get(k.trim()) != Some(v.trim());
    }
    if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return get(k.trim()) == Some(v.trim());
    }
    if let Some(k) = term.strip_prefix('!') {
        return get(k.trim()).is_none();
    }
    term.is_empty() || get(term).is_some()
}

/// Equality-based selectors only.
pub fn matches_labels(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.at(&["metadata", "labels"]).and_then(Value::as_object);
    selector.split(',').all(|t| label_term_matches(labels, t))
}

pub fn matches_fields(obj: &DynamicObject, selector: &str) -> bool {
    selector.split(',').filter(|t| !t.trim().is_empty()).all(|term| {
        let (path, want, negate) = match term.split_once("!=") {
            Some((p, v)) => (p, v, true),
            None => match term.split_once("==").or_else(|| term.split_once('=')) {
                Some((p, v)) => (p, v, false),
                None => return false,
            },
        };
        let segs: Vec<&str> = path.trim().split('.').collect();
        let got = obj.str_at(&segs).unwrap_or_default();
        (got == want.trim()) != negate
    })
}

fn chunked(body: Bytes) -> ByteStream {
    let chunks: Vec<Result<Bytes, AccessError>> =
        (0..body.len()).step_by(CHUNK).map(|i| Ok(body.slice(i..(i + CHUNK).min(body.len())))).collect();
    futures::stream::iter(chunks).boxed()
}

#[async_trait::async_trait]
impl ClusterAccess for MockCluster {
    async fn list(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery) -> Result<ObjectPage, AccessError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.with_state(|s| {
            s.calls.push(format!("list {gvr} ns={}", namespace.unwrap_or("")));
            if let Some(err) = s.list_failures.get(gvr) {
                return Err(err.clone());
            }
            let all = s.objects.get(gvr).ok_or_else(|| AccessError::NotFound(gvr.to_string()))?;
            let matching: Vec<&DynamicObject> = all
                .iter()
                .filter(|o| namespace.map_or(true, |ns| o.namespace() == Some(ns)))
                .filter(|o| query.label_selector.as_deref().map_or(true, |sel| matches_labels(o, sel)))
                .filter(|o| query.field_selector.as_deref().map_or(true, |sel| matches_fields(o, sel)))
                .collect();
            let offset: usize = match &query.continue_token {
                Some(t) => t.parse().map_err(|_| AccessError::Api { code: 410, message: format!("bad continue token {t}") })?,
                None => 0,
            };
            let limit = query.limit.map(|l| l as usize).filter(|l| *l > 0).unwrap_or(usize::MAX);
            let end = offset.saturating_add(limit).min(matching.len());
            let items: Vec<DynamicObject> = matching.get(offset..end).unwrap_or_default().iter().map(|o| (*o).clone()).collect();
            let (continue_token, remaining) = if end < matching.len() {
                (Some(end.to_string()), Some((matching.len() - end) as i64))
            } else {
                (None, None)
            };
            Ok(ObjectPage { items, continue_token, remaining })
        })
    }

    async fn get(&self, gvr: &Gvr, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, AccessError> {
        self.with_state(|s| {
            s.calls.push(format!("get {gvr} {}/{name}", namespace.unwrap_or("")));
            Ok(s.objects
                .get(gvr)
                .and_then(|objs| objs.iter().find(|o| o.name() == name && o.namespace() == namespace))
                .cloned())
        })
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, query: &LogQuery) -> Result<ByteStream, AccessError> {
        let container = query.container.clone().unwrap_or_default();
        let body = self.with_state(|s| {
            s.calls.push(format!("logs {namespace}/{pod}/{container}"));
            s.logs.get(&(namespace.to_string(), pod.to_string(), container.clone())).cloned()
        });
        let body = body.ok_or_else(|| AccessError::NotFound(format!("{namespace}/{pod}/{container}")))?;
        let body = match query.limit_bytes {
            Some(n) if n >= 0 && (n as usize) < body.len() => body.slice(..n as usize),
            _ => body,
        };
        Ok(chunked(body))
    }

    async fn raw(&self, req: &RawRequest) -> Result<ByteStream, AccessError> {
        let found = self.with_state(|s| {
            s.calls.push(format!("raw {:?} {}", req.profile, req.path_and_query()));
            s.raw.get(&(req.profile, req.path.clone())).cloned()
        });
        match found {
            Some(Ok(body)) => Ok(chunked(body)),
            Some(Err(e)) => Err(e),
            None => Err(AccessError::NotFound(req.path.clone())),
        }
    }

    async fn api_groups(&self) -> Result<Vec<ApiGroup>, AccessError> {
        Ok(self.with_state(|s| {
            let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for gvr in s.objects.keys() {
                let versions = groups.entry(gvr.group.clone()).or_default();
                if !versions.contains(&gvr.version) {
                    versions.push(gvr.version.clone());
                }
            }
            for g in &s.extra_groups {
                groups.entry(g.name.clone()).or_default().extend(g.versions.iter().cloned());
            }
            groups.into_iter().map(|(name, versions)| ApiGroup { name, versions }).collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn pods() -> Gvr { Gvr::new("", "v1", "pods") }

    fn pod(ns: &str, name: &str, app: &str) -> Value {
        json!({"metadata": {"name": name, "namespace": ns, "labels": {"app": app}}, "status": {"phase": "Running"}})
    }

    #[tokio::test]
    async fn pages_through_continue_tokens() {
        let m = MockCluster::new().with(&pods(), (0..5).map(|i| pod("a", &format!("p{i}"), "x")));
        let q = ListQuery::default().with_limit(2);
        let first = m.list(&pods(), None, &q).await.expect("page");
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.remaining, Some(3));
        let q2 = ListQuery { continue_token: first.continue_token.clone(), ..q.clone() };
        let second = m.list(&pods(), None, &q2).await.expect("page");
        assert_eq!(second.items[0].name(), "p2");
        assert_eq!(m.list_calls(), 2);
    }

    #[tokio::test]
    async fn unserved_kind_is_not_found() {
        let m = MockCluster::new();
        let err = m.list(&Gvr::new("ceph.rook.io", "v1", "cephclusters"), None, &ListQuery::default()).await;
        assert!(matches!(err, Err(AccessError::NotFound(_))));
        let got = m.get(&pods(), Some("a"), "p").await.expect("get");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn selectors_filter() {
        let m = MockCluster::new().with(&pods(), vec![pod("a", "p1", "sdn"), pod("b", "p2", "dns")]);
        let page = m.list(&pods(), None, &ListQuery::labels("app=sdn")).await.expect("list");
        assert_eq!(page.items.len(), 1);
        let page = m.list(&pods(), None, &ListQuery::fields("metadata.namespace=b")).await.expect("list");
        assert_eq!(page.items[0].name(), "p2");
        let page = m.list(&pods(), Some("a"), &ListQuery::fields("status.phase!=Running")).await.expect("list");
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn logs_are_chunked_and_capped() {
        let body = "line\n".repeat(40);
        let m = MockCluster::new().with_logs("ns", "p", "c", body.clone());
        let q = LogQuery { container: Some("c".into()), ..Default::default() };
        let chunks: Vec<Bytes> = m.pod_logs("ns", "p", &q).await.expect("logs").try_collect().await.expect("chunks");
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), body.as_bytes());
        let capped = LogQuery { limit_bytes: Some(10), ..q };
        let chunks: Vec<Bytes> = m.pod_logs("ns", "p", &capped).await.expect("logs").try_collect().await.expect("chunks");
        assert_eq!(chunks.concat().len(), 10);
    }
}
