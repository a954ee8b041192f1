//! LokiStack instances; only the logging namespace is expected to hold them.

use harvest_core::{Gvr, Record, ResourceMarshaller, TaskOutput};
use harvest_kubehub::ListQuery;

use crate::catalog::{list_limited, Limit};
use crate::{access_failure, TaskContext};

pub const EXPECTED_NAMESPACE: &str = "openshift-logging";
pub const MAX_STACKS: usize = 20;

pub fn lokistacks() -> Gvr { Gvr::new("loki.grafana.com", "v1", "lokistacks") }

pub async fn gather(ctx: TaskContext) -> TaskOutput {
    let gvr = lokistacks();
    let listed = list_limited(&ctx, &gvr, None, &ListQuery::default(), None).await;
    let (items, warnings) = match listed {
        Ok(l) => l,
        Err(e) => return access_failure("listing lokistacks", e),
    };
    let mut out = TaskOutput::new();
    let (items, over) = Limit::found(MAX_STACKS).apply(&gvr.resource, items);
    if let Some(msg) = over {
        out.fail(msg);
    }
    for stack in items {
        let ns = stack.namespace().unwrap_or_default().to_string();
        if ns != EXPECTED_NAMESPACE {
            out.fail(format!("lokistack {} found in unexpected namespace {ns} (expected {EXPECTED_NAMESPACE})", stack.name()));
            continue;
        }
        let name = format!("config/lokistack/{ns}/{}", stack.name());
        out.push(Record::new(name, ResourceMarshaller(stack.into_value())));
    }
    for w in warnings {
        out.warn(w);
    }
    out
}
