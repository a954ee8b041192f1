//! Harvest kubehub: the cluster access layer.
//!
//! Everything a gathering task needs from the cluster goes through the
//! [`ClusterAccess`] trait. [`KubeCluster`] talks to a live API server via kube;
//! [`MockCluster`] serves canned objects, logs and endpoint bodies for tests.
//! Tasks never hold the trait object directly: they build per-task handles
//! from [`Clients`], which wrap every call in the task's cancellation token.

#![forbid(unsafe_code)]

use bytes::Bytes;
use futures::stream::BoxStream;
use harvest_core::{DynamicObject, Gvr};
use serde::{Deserialize, Serialize};

pub mod handles;
pub mod kube_cluster;
pub mod mock;
pub mod paginate;
pub mod ratelimit;

pub use handles::{gvr_of, Clients, ConfigClient, DynamicClient, PolicyClient, RestClient, WorkloadClient};
pub use kube_cluster::{KubeCluster, ProfileEndpoints};
pub use mock::MockCluster;
pub use paginate::{PageBudget, Paged};
pub use ratelimit::RateLimiter;

/// Streamed response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, AccessError>>;

/// Failures of a single cluster call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("too_many_requests: {0}")]
    TooManyRequests(String),
    #[error("api {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

impl AccessError {
    /// Kind not served or object absent.
    pub fn is_not_found(&self) -> bool { matches!(self, AccessError::NotFound(_)) }
    pub fn is_cancelled(&self) -> bool { matches!(self, AccessError::Cancelled) }
}

impl From<kube::Error> for AccessError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => AccessError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 429 => AccessError::TooManyRequests(ae.message),
            kube::Error::Api(ae) => AccessError::Api { code: ae.code, message: ae.message },
            kube::Error::SerdeError(e) => AccessError::Decode(e.to_string()),
            other => AccessError::Transport(other.to_string()),
        }
    }
}

/// List parameters. `limit` is the page size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

impl ListQuery {
    pub fn labels(sel: &str) -> Self { Self { label_selector: Some(sel.to_string()), ..Default::default() } }
    pub fn fields(sel: &str) -> Self { Self { field_selector: Some(sel.to_string()), ..Default::default() } }
    pub fn with_limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }
}

/// One page of a list response, in server order.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub items: Vec<DynamicObject>,
    pub continue_token: Option<String>,
    pub remaining: Option<i64>,
}

/// Container log request options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    pub container: Option<String>,
    pub since_seconds: Option<i64>,
    pub limit_bytes: Option<i64>,
    pub tail_lines: Option<i64>,
    pub previous: bool,
    pub timestamps: bool,
}

impl LogQuery {
    /// The container log endpoint for `pod`, accepting a gzip body.
    pub fn request(&self, namespace: &str, pod: &str) -> RawRequest {
        let mut req = RawRequest::get(Profile::Standard, &format!("/api/v1/namespaces/{namespace}/pods/{pod}/log")).gzip();
        if let Some(c) = &self.container {
            req = req.param("container", c);
        }
        if let Some(s) = self.since_seconds {
            req = req.param("sinceSeconds", &s.to_string());
        }
        if let Some(b) = self.limit_bytes {
            req = req.param("limitBytes", &b.to_string());
        }
        if let Some(t) = self.tail_lines {
            req = req.param("tailLines", &t.to_string());
        }
        if self.previous {
            req = req.param("previous", "true");
        }
        if self.timestamps {
            req = req.param("timestamps", "true");
        }
        req
    }
}

/// Authentication profile a call is issued under.
///
/// Profiles differ in credentials, base endpoint and content-type preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Standard,
    /// Prefers protobuf for built-in kinds.
    Proto,
    /// Prometheus federation and status endpoints.
    Metrics,
    /// Alertmanager API.
    Alerts,
}

/// A plain GET against the API server or a proxied endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub profile: Profile,
    /// Path relative to the profile's base endpoint.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub accept: Option<String>,
    pub accept_gzip: bool,
}

impl RawRequest {
    pub fn get(profile: Profile, path: &str) -> Self {
        Self { profile, path: path.to_string(), query: Vec::new(), accept: None, accept_gzip: false }
    }

    pub fn param(mut self, k: &str, v: &str) -> Self {
        self.query.push((k.to_string(), v.to_string()));
        self
    }

    pub fn accept(mut self, v: &str) -> Self {
        self.accept = Some(v.to_string());
        self
    }

    pub fn gzip(mut self) -> Self {
        self.accept_gzip = true;
        self
    }

    /// Path plus percent-encoded query string.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let qs: Vec<String> = self.query.iter().map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))).collect();
        format!("{}?{}", self.path, qs.join("&"))
    }
}

/// A served API group and its versions, preferred first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiGroup {
    pub name: String,
    pub versions: Vec<String>,
}

/// Raw cluster operations. Implementations are shared across tasks.
#[async_trait::async_trait]
pub trait ClusterAccess: Send + Sync {
    /// One page of `gvr` objects; a kind that is not served yields `NotFound`.
    async fn list(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery) -> Result<ObjectPage, AccessError>;

    /// `Ok(None)` when the object does not exist.
    async fn get(&self, gvr: &Gvr, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, AccessError>;

    async fn pod_logs(&self, namespace: &str, pod: &str, query: &LogQuery) -> Result<ByteStream, AccessError>;

    async fn raw(&self, req: &RawRequest) -> Result<ByteStream, AccessError>;

    async fn api_groups(&self) -> Result<Vec<ApiGroup>, AccessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_percent_encoded() {
        let r = RawRequest::get(Profile::Metrics, "/federate").param("match[]", "cluster_installer").param("match[]", "ALERTS");
        assert_eq!(r.path_and_query(), "/federate?match%5B%5D=cluster_installer&match%5B%5D=ALERTS");
        let plain = RawRequest::get(Profile::Standard, "/metrics");
        assert_eq!(plain.path_and_query(), "/metrics");
    }

    #[test]
    fn pod_log_request_asks_for_gzip() {
        let q = LogQuery { container: Some("ovn controller".into()), since_seconds: Some(3600), limit_bytes: Some(2048), timestamps: true, ..LogQuery::default() };
        let r = q.request("openshift-ovn", "node-1");
        assert_eq!(r.profile, Profile::Standard);
        assert!(r.accept_gzip);
        assert_eq!(
            r.path_and_query(),
            "/api/v1/namespaces/openshift-ovn/pods/node-1/log?container=ovn%20controller&sinceSeconds=3600&limitBytes=2048&timestamps=true"
        );
        let prev = LogQuery { previous: true, tail_lines: Some(10), ..LogQuery::default() }.request("ns", "p");
        assert_eq!(prev.path_and_query(), "/api/v1/namespaces/ns/pods/p/log?tailLines=10&previous=true");
    }

    #[test]
    fn list_query_builders() {
        let q = ListQuery::labels("app=sdn").with_limit(500);
        assert_eq!(q.label_selector.as_deref(), Some("app=sdn"));
        assert_eq!(q.limit, Some(500));
        assert!(AccessError::NotFound("x".into()).is_not_found());
        assert!(!AccessError::Cancelled.is_not_found());
    }
}
