//! Per-task client handles.
//!
//! A [`Clients`] value is built once per run; each task gets a copy scoped to
//! its own cancellation token through [`Clients::scoped`]. Every call made
//! through a handle races that token, so cancellation takes effect at the
//! next network boundary.

use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use harvest_core::{DynamicObject, Gvr};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::paginate::{collect_pages, PageBudget, Paged};
use crate::ratelimit::RateLimiter;
use crate::{AccessError, ApiGroup, ByteStream, ClusterAccess, ListQuery, LogQuery, ObjectPage, Profile, RawRequest};

/// Coordinates of a compiled kind.
pub fn gvr_of<K: k8s_openapi::Resource>() -> Gvr { Gvr::new(K::GROUP, K::VERSION, K::URL_PATH_SEGMENT) }

pub const CONFIG_GROUP: &str = "config.openshift.io";

/// Shared access plus the task-scoped cancellation token.
#[derive(Clone)]
pub struct Clients {
    access: Arc<dyn ClusterAccess>,
    limiter: Arc<RateLimiter>,
    budget: PageBudget,
    cancel: CancellationToken,
}

impl Clients {
    pub fn new(access: Arc<dyn ClusterAccess>) -> Self {
        Self {
            access,
            limiter: Arc::new(RateLimiter::unlimited()),
            budget: PageBudget::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_budget(mut self, budget: PageBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Copy bound to `cancel`.
    pub fn scoped(&self, cancel: CancellationToken) -> Self { Self { cancel, ..self.clone() } }

    pub fn cancel_token(&self) -> &CancellationToken { &self.cancel }
    pub fn budget(&self) -> PageBudget { self.budget }
    pub fn limiter(&self) -> &Arc<RateLimiter> { &self.limiter }

    /// Race `fut` against cancellation.
    pub async fn guarded<T, F>(&self, fut: F) -> Result<T, AccessError>
    where
        F: Future<Output = Result<T, AccessError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AccessError::Cancelled),
            r = fut => r,
        }
    }

    pub fn config(&self) -> ConfigClient { ConfigClient { clients: self.clone() } }

    /// Built-in kinds. `Profile::Proto` prefers protobuf where the backend supports it.
    pub fn workload(&self, profile: Profile) -> WorkloadClient { WorkloadClient { clients: self.clone(), profile } }

    pub fn policy(&self) -> PolicyClient { PolicyClient { inner: self.workload(Profile::Standard) } }
    pub fn dynamic(&self) -> DynamicClient { DynamicClient { clients: self.clone() } }
    pub fn rest(&self, profile: Profile) -> RestClient { RestClient { clients: self.clone(), profile } }

    pub async fn api_groups(&self) -> Result<Vec<ApiGroup>, AccessError> { self.guarded(self.access.api_groups()).await }

    pub async fn pod_logs(&self, namespace: &str, pod: &str, query: &LogQuery) -> Result<ByteStream, AccessError> {
        self.guarded(self.access.pod_logs(namespace, pod, query)).await
    }

    async fn page(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery) -> Result<ObjectPage, AccessError> {
        self.guarded(self.access.list(gvr, namespace, query)).await
    }

    async fn all(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery, budget: PageBudget) -> Result<Paged<DynamicObject>, AccessError> {
        let base = ListQuery { limit: Some(query.limit.unwrap_or(budget.page_limit)), ..query.clone() };
        collect_pages(budget, |token| {
            let q = ListQuery { continue_token: token, ..base.clone() };
            async move { self.page(gvr, namespace, &q).await }
        })
        .await
    }

    async fn one(&self, gvr: &Gvr, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, AccessError> {
        self.guarded(self.access.get(gvr, namespace, name)).await
    }
}

/// Cluster-wide configuration kinds (`config.openshift.io/v1`).
#[derive(Clone)]
pub struct ConfigClient {
    clients: Clients,
}

impl ConfigClient {
    pub fn gvr(resource: &str) -> Gvr { Gvr::new(CONFIG_GROUP, "v1", resource) }

    /// `Ok(None)` for an absent object or a kind that is not served.
    pub async fn get(&self, resource: &str, name: &str) -> Result<Option<DynamicObject>, AccessError> {
        match self.clients.one(&Self::gvr(resource), None, name).await {
            Err(AccessError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    pub async fn list(&self, resource: &str) -> Result<Paged<DynamicObject>, AccessError> {
        self.clients.all(&Self::gvr(resource), None, &ListQuery::default(), self.clients.budget).await
    }
}

/// Built-in kinds decoded into their k8s-openapi models.
#[derive(Clone)]
pub struct WorkloadClient {
    clients: Clients,
    profile: Profile,
}

impl WorkloadClient {
    pub fn profile(&self) -> Profile { self.profile }

    /// Decoded listing under the task budget; malformed items are reported in `skipped`.
    pub async fn list<K>(&self, namespace: Option<&str>, query: &ListQuery) -> Result<Paged<K>, AccessError>
    where
        K: k8s_openapi::Resource + DeserializeOwned,
    {
        self.list_with::<K>(namespace, query, self.clients.budget).await
    }

    pub async fn list_with<K>(&self, namespace: Option<&str>, query: &ListQuery, budget: PageBudget) -> Result<Paged<K>, AccessError>
    where
        K: k8s_openapi::Resource + DeserializeOwned,
    {
        let gvr = gvr_of::<K>();
        debug!(gvr = %gvr, ns = ?namespace, profile = ?self.profile, "kubehub: typed list");
        Ok(self.clients.all(&gvr, namespace, query, budget).await?.decode())
    }

    /// Single page, for callers that drive their own paging.
    pub async fn page<K>(&self, namespace: Option<&str>, query: &ListQuery) -> Result<(Vec<K>, ObjectPage), AccessError>
    where
        K: k8s_openapi::Resource + DeserializeOwned,
    {
        let mut page = self.clients.page(&gvr_of::<K>(), namespace, query).await?;
        let items = std::mem::take(&mut page.items);
        let typed = items.into_iter().filter_map(|o| serde_json::from_value::<K>(o.into_value()).ok()).collect();
        Ok((typed, page))
    }

    pub async fn get<K>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, AccessError>
    where
        K: k8s_openapi::Resource + DeserializeOwned,
    {
        match self.clients.one(&gvr_of::<K>(), namespace, name).await? {
            Some(o) => serde_json::from_value(o.into_value()).map(Some).map_err(|e| AccessError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Raw object, for kinds whose records keep the server JSON.
    pub async fn get_raw<K: k8s_openapi::Resource>(&self, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, AccessError> {
        self.clients.one(&gvr_of::<K>(), namespace, name).await
    }

    pub async fn list_raw<K: k8s_openapi::Resource>(&self, namespace: Option<&str>, query: &ListQuery) -> Result<Paged<DynamicObject>, AccessError> {
        self.clients.all(&gvr_of::<K>(), namespace, query, self.clients.budget).await
    }
}

/// Pod disruption budgets and admission webhooks.
#[derive(Clone)]
pub struct PolicyClient {
    inner: WorkloadClient,
}

impl PolicyClient {
    pub async fn pod_disruption_budgets(&self, budget: PageBudget) -> Result<Paged<DynamicObject>, AccessError> {
        use k8s_openapi::api::policy::v1::PodDisruptionBudget;
        let q = ListQuery::default().with_limit(budget.page_limit);
        self.inner.clients.all(&gvr_of::<PodDisruptionBudget>(), None, &q, budget).await
    }

    pub async fn validating_webhooks(&self) -> Result<Paged<DynamicObject>, AccessError> {
        use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
        self.inner.list_raw::<ValidatingWebhookConfiguration>(None, &ListQuery::default()).await
    }

    pub async fn mutating_webhooks(&self) -> Result<Paged<DynamicObject>, AccessError> {
        use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
        self.inner.list_raw::<MutatingWebhookConfiguration>(None, &ListQuery::default()).await
    }
}

/// Schema-less access keyed by [`Gvr`].
#[derive(Clone)]
pub struct DynamicClient {
    clients: Clients,
}

impl DynamicClient {
    pub async fn page(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery) -> Result<ObjectPage, AccessError> {
        self.clients.page(gvr, namespace, query).await
    }

    pub async fn list_all(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery) -> Result<Paged<DynamicObject>, AccessError> {
        self.clients.all(gvr, namespace, query, self.clients.budget).await
    }

    pub async fn list_with(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery, budget: PageBudget) -> Result<Paged<DynamicObject>, AccessError> {
        self.clients.all(gvr, namespace, query, budget).await
    }

    pub async fn get(&self, gvr: &Gvr, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, AccessError> {
        self.clients.one(gvr, namespace, name).await
    }

    /// Marker check: whether at least one object of `gvr` exists.
    pub async fn has_any(&self, gvr: &Gvr) -> Result<bool, AccessError> {
        match self.clients.page(gvr, None, &ListQuery::default().with_limit(1)).await {
            Ok(p) => Ok(!p.items.is_empty()),
            Err(AccessError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Raw GETs, rate limited.
#[derive(Clone)]
pub struct RestClient {
    clients: Clients,
    profile: Profile,
}

impl RestClient {
    pub fn request(&self, path: &str) -> RawRequest { RawRequest::get(self.profile, path) }

    pub async fn stream(&self, req: &RawRequest) -> Result<ByteStream, AccessError> {
        self.clients
            .guarded(async {
                self.clients.limiter.acquire().await;
                Ok(())
            })
            .await?;
        self.clients.guarded(self.clients.access.raw(req)).await
    }

    /// Whole body, at most `cap` bytes. The flag reports whether the body was cut.
    pub async fn get_bytes(&self, req: &RawRequest, cap: usize) -> Result<(Bytes, bool), AccessError> {
        let mut stream = self.stream(req).await?;
        let mut buf = BytesMut::new();
        loop {
            let next = self.clients.guarded(async { Ok(stream.next().await) }).await?;
            match next {
                Some(chunk) => {
                    let chunk = chunk?;
                    let room = cap.saturating_sub(buf.len());
                    if chunk.len() > room {
                        buf.extend_from_slice(&chunk[..room]);
                        return Ok((buf.freeze(), true));
                    }
                    buf.extend_from_slice(&chunk);
                }
                None => return Ok((buf.freeze(), false)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockCluster;
    use k8s_openapi::api::core::v1::{Namespace, Pod};
    use serde_json::json;

    fn clients(m: MockCluster) -> Clients { Clients::new(Arc::new(m)) }

    #[test]
    fn typed_coordinates() {
        assert_eq!(gvr_of::<Pod>(), Gvr::new("", "v1", "pods"));
        assert_eq!(gvr_of::<k8s_openapi::api::policy::v1::PodDisruptionBudget>().group, "policy");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let m = MockCluster::new().with(&gvr_of::<Namespace>(), vec![json!({"metadata": {"name": "a"}})]);
        let c = clients(m.clone()).scoped(CancellationToken::new());
        c.cancel_token().cancel();
        let err = c.workload(Profile::Standard).list::<Namespace>(None, &ListQuery::default()).await;
        assert!(matches!(err, Err(AccessError::Cancelled)));
        assert_eq!(m.list_calls(), 0);
    }

    #[tokio::test]
    async fn config_get_tolerates_unserved_kind() {
        let c = clients(MockCluster::new());
        assert!(c.config().get("clusterversions", "version").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn typed_list_pages_and_decodes() {
        let gvr = gvr_of::<Namespace>();
        let m = MockCluster::new().with(&gvr, (0..7).map(|i| json!({"metadata": {"name": format!("ns{i}")}})));
        let c = clients(m.clone()).with_budget(PageBudget::new(3, 5));
        let paged = c.workload(Profile::Proto).list::<Namespace>(None, &ListQuery::default()).await.expect("list");
        assert_eq!(paged.items.len(), 5);
        assert_eq!(paged.total, 7);
        assert_eq!(m.list_calls(), 3);
        assert_eq!(paged.items[0].metadata.name.as_deref(), Some("ns0"));
    }

    #[tokio::test]
    async fn marker_check() {
        let gvr = Gvr::new("installers.datahub.sap.com", "v1alpha1", "datahubs");
        assert!(!clients(MockCluster::new()).dynamic().has_any(&gvr).await.expect("absent"));
        let served_empty = MockCluster::new().serve(&gvr);
        assert!(!clients(served_empty).dynamic().has_any(&gvr).await.expect("empty"));
        let present = MockCluster::new().with(&gvr, vec![json!({"metadata": {"name": "d", "namespace": "sdi"}})]);
        assert!(clients(present).dynamic().has_any(&gvr).await.expect("present"));
    }

    #[tokio::test]
    async fn rest_body_is_capped() {
        let m = MockCluster::new().with_raw(Profile::Metrics, "/federate", "a".repeat(200));
        let rest = clients(m).rest(Profile::Metrics);
        let (body, cut) = rest.get_bytes(&rest.request("/federate"), 100).await.expect("body");
        assert_eq!(body.len(), 100);
        assert!(cut);
    }
}
