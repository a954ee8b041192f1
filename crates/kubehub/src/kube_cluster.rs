//! Live cluster access over kube.

use std::time::Instant;

use bytes::Bytes;
use futures::{channel::mpsc, SinkExt, StreamExt};
use harvest_core::{DynamicObject, Gvr};
use kube::{
    api::{Api, ListParams},
    core::ApiResource,
    discovery::Discovery,
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
use tracing::{debug, info, warn};

use crate::{AccessError, ApiGroup, ByteStream, ClusterAccess, ListQuery, LogQuery, ObjectPage, Profile, RawRequest};

const STREAM_BUFFER: usize = 16;

/// Base paths the non-standard profiles are proxied through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileEndpoints {
    pub metrics: String,
    pub alerts: String,
}

impl Default for ProfileEndpoints {
    fn default() -> Self {
        Self {
            metrics: "/api/v1/namespaces/openshift-monitoring/services/https:prometheus-k8s:9091/proxy".into(),
            alerts: "/api/v1/namespaces/openshift-monitoring/services/https:alertmanager-main:9094/proxy".into(),
        }
    }
}

impl ProfileEndpoints {
    fn base(&self, profile: Profile) -> &str {
        match profile {
            Profile::Standard | Profile::Proto => "",
            Profile::Metrics => &self.metrics,
            Profile::Alerts => &self.alerts,
        }
    }
}

/// [`ClusterAccess`] backed by a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    endpoints: ProfileEndpoints,
}

impl KubeCluster {
    pub fn new(client: Client, endpoints: ProfileEndpoints) -> Self { Self { client, endpoints } }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default(endpoints: ProfileEndpoints) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        info!("kubehub: client ready");
        Ok(Self::new(client, endpoints))
    }

    fn api(&self, gvr: &Gvr, namespace: Option<&str>) -> Api<kube::core::DynamicObject> {
        let ar = api_resource(gvr);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn send(&self, req: &RawRequest, op: &'static str) -> Result<ByteStream, AccessError> {
        let uri = format!("{}{}", self.endpoints.base(req.profile), req.path_and_query());
        let mut builder = http::Request::get(uri.as_str());
        if let Some(a) = &req.accept {
            builder = builder.header(http::header::ACCEPT, a.as_str());
        }
        if req.accept_gzip {
            builder = builder.header(http::header::ACCEPT_ENCODING, "gzip");
        }
        let request = builder.body(Vec::new()).map_err(|e| AccessError::Transport(e.to_string()))?;
        let client = self.client.clone();
        counter!("harvest_cluster_calls_total", 1u64, "op" => op);
        spawn_body(uri, move |pipe| async move {
            let reader = client.request_stream(request).await;
            pipe.run(reader).await
        })
        .await
    }
}

fn api_resource(gvr: &Gvr) -> ApiResource {
    ApiResource {
        group: gvr.group.clone(),
        version: gvr.version.clone(),
        api_version: gvr.api_version(),
        kind: String::new(),
        plural: gvr.resource.clone(),
    }
}

fn list_params(q: &ListQuery) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = &q.label_selector {
        lp = lp.labels(l);
    }
    if let Some(f) = &q.field_selector {
        lp = lp.fields(f);
    }
    if let Some(n) = q.limit {
        lp = lp.limit(n);
    }
    if let Some(c) = &q.continue_token {
        lp = lp.continue_token(c);
    }
    lp
}

/// Items of a list response come without type information; restore it.
fn typed_item(mut v: Value, api_version: &str, kind: Option<&str>) -> DynamicObject {
    if let Some(obj) = v.as_object_mut() {
        obj.entry("apiVersion").or_insert_with(|| Value::String(api_version.to_string()));
        if let Some(k) = kind {
            obj.entry("kind").or_insert_with(|| Value::String(k.to_string()));
        }
    }
    DynamicObject::new(v)
}

fn observe(op: &'static str, started: Instant) {
    counter!("harvest_cluster_calls_total", 1u64, "op" => op);
    histogram!("harvest_cluster_call_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
}

/// Sending half of a streamed response body.
struct BodyPipe {
    ctx: String,
    opened: oneshot::Sender<Result<(), AccessError>>,
    tx: mpsc::Sender<Result<Bytes, AccessError>>,
}

impl BodyPipe {
    async fn run<R: futures::AsyncBufRead>(mut self, reader: Result<R, kube::Error>) {
        let reader = match reader {
            Ok(r) => {
                let _ = self.opened.send(Ok(()));
                r
            }
            Err(e) => {
                let _ = self.opened.send(Err(AccessError::from(e)));
                return;
            }
        };
        let stream = ReaderStream::new(reader.compat());
        futures::pin_mut!(stream);
        while let Some(next) = stream.next().await {
            let item = next.map_err(|e| AccessError::Transport(e.to_string()));
            let failed = item.is_err();
            if self.tx.send(item).await.is_err() || failed {
                break;
            }
        }
        debug!(ctx = %self.ctx, "kubehub: body stream ended");
    }
}

/// Run `body` on its own task and hand back the receiving half once the
/// response is open. Readers returned by kube borrow their client, so they
/// are consumed where they are created.
async fn spawn_body<F, Fut>(ctx: String, body: F) -> Result<ByteStream, AccessError>
where
    F: FnOnce(BodyPipe) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (opened, open_rx) = oneshot::channel();
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(body(BodyPipe { ctx, opened, tx }));
    match open_rx.await {
        Ok(Ok(())) => Ok(rx.boxed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AccessError::Transport("stream task ended before opening".into())),
    }
}

#[async_trait::async_trait]
impl ClusterAccess for KubeCluster {
    async fn list(&self, gvr: &Gvr, namespace: Option<&str>, query: &ListQuery) -> Result<ObjectPage, AccessError> {
        let started = Instant::now();
        let list = self.api(gvr, namespace).list(&list_params(query)).await;
        observe("list", started);
        let list = list.map_err(AccessError::from)?;
        let raw = serde_json::to_value(&list).map_err(|e| AccessError::Decode(e.to_string()))?;
        let kind = raw.get("kind").and_then(Value::as_str).and_then(|k| k.strip_suffix("List")).map(str::to_string);
        let api_version = gvr.api_version();
        let items = list
            .items
            .into_iter()
            .filter_map(|o| match serde_json::to_value(o) {
                Ok(v) => Some(typed_item(v, &api_version, kind.as_deref())),
                Err(e) => {
                    warn!(gvr = %gvr, error = %e, "kubehub: dropping unserializable item");
                    None
                }
            })
            .collect();
        Ok(ObjectPage {
            items,
            continue_token: list.metadata.continue_.filter(|c| !c.is_empty()),
            remaining: list.metadata.remaining_item_count,
        })
    }

    async fn get(&self, gvr: &Gvr, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, AccessError> {
        let started = Instant::now();
        let got = self.api(gvr, namespace).get_opt(name).await;
        observe("get", started);
        match got.map_err(AccessError::from)? {
            Some(o) => {
                let v = serde_json::to_value(o).map_err(|e| AccessError::Decode(e.to_string()))?;
                Ok(Some(typed_item(v, &gvr.api_version(), None)))
            }
            None => Ok(None),
        }
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, query: &LogQuery) -> Result<ByteStream, AccessError> {
        self.send(&query.request(namespace, pod), "logs").await
    }

    async fn raw(&self, req: &RawRequest) -> Result<ByteStream, AccessError> { self.send(req, "raw").await }

    async fn api_groups(&self) -> Result<Vec<ApiGroup>, AccessError> {
        let started = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await;
        observe("discovery", started);
        let discovery = discovery.map_err(AccessError::from)?;
        let mut out: Vec<ApiGroup> = discovery
            .groups()
            .map(|g| ApiGroup { name: g.name().to_string(), versions: g.versions().map(str::to_string).collect() })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
