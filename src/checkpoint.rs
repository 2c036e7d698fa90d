//! Kubelet checkpoint trigger.
//!
//! The checkpoint API is only reachable through the node proxy, so the
//! request goes through the operator's authenticated client rather than a
//! direct kubelet connection.

use k8s_openapi::api::core::v1::Pod;
use kube::core::ErrorResponse;
use kube::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct CheckpointResponse {
    #[serde(default)]
    items: Vec<String>,
}

/// Extracts the on-node archive path from the kubelet response,
/// `{"items":["/var/lib/kubelet/checkpoints/checkpoint-...tar"]}`.
pub fn parse_checkpoint_response(body: &str) -> Result<String> {
    let resp: CheckpointResponse = serde_json::from_str(body)?;
    resp.items
        .into_iter()
        .next()
        .ok_or(Error::EmptyCheckpointResponse)
}

/// POSTs a checkpoint request for `container` through the node proxy and
/// returns the archive path on the node.
///
/// A 404 means the kubelet (or its container runtime) has the feature
/// disabled, which gets its own error so the reconciler can say so in the
/// warning event.
pub async fn trigger_checkpoint(
    client: Client,
    config: &Config,
    pod: &Pod,
    container: &str,
) -> Result<String> {
    let node = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
        .ok_or(Error::NoNodeAssigned)?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();

    let path = format!("/api/v1/nodes/{node}/proxy/checkpoint/{namespace}/{name}/{container}");
    let request = http::Request::builder()
        .method("POST")
        .uri(path)
        .body(Vec::new())?;

    let body = tokio::time::timeout(config.checkpoint_timeout, client.request_text(request))
        .await
        .map_err(|_| Error::CheckpointTimeout(config.checkpoint_timeout))?
        .map_err(|err| match err {
            kube::Error::Api(ErrorResponse { code: 404, .. }) => Error::CheckpointNotEnabled,
            other => other.into(),
        })?;

    parse_checkpoint_response(&body)
}
