use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API call failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to build proxy request: {0}")]
    Http(#[from] http::Error),

    #[error("no container name available for log capture")]
    NoContainerName,

    #[error("pod is not assigned to a node")]
    NoNodeAssigned,

    #[error("checkpointing is not enabled on the node's kubelet or container runtime")]
    CheckpointNotEnabled,

    #[error("checkpoint request timed out after {0:?}")]
    CheckpointTimeout(Duration),

    #[error("failed to parse checkpoint response: {0}")]
    CheckpointResponse(#[from] serde_json::Error),

    #[error("checkpoint created but no file path returned")]
    EmptyCheckpointResponse,

    #[error("the VolumeSnapshot CRD is not installed in this cluster")]
    SnapshotCrdMissing,

    #[error("blob upload failed: {0}")]
    Upload(#[from] reqwest::Error),

    #[error("blob store rejected upload with status {0}")]
    UploadRejected(reqwest::StatusCode),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
