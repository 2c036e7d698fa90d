//! Checkpoint collector job.
//!
//! Checkpoint archives are written by the kubelet onto the node's filesystem,
//! so a node-pinned Job hostPath-mounts the file and re-runs this binary's
//! `collector` subcommand to stream it to the blob store and delete it.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

pub const COLLECTOR_JOB_LABEL: &str = "forensic-job";

/// Inputs for one collector job.
#[derive(Debug, Clone)]
pub struct CollectorJob {
    pub namespace: String,
    /// Node holding the checkpoint archive; the job is pinned to it.
    pub node_name: String,
    pub checkpoint_path: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub key: String,
    /// Operator image, which carries the `collector` subcommand.
    pub image: String,
    pub owner: Option<OwnerReference>,
}

/// Builds the node-pinned upload Job. Runs as root and privileged because
/// checkpoint archives are root-owned on the host.
pub fn build_collector_job(cfg: &CollectorJob) -> Job {
    let mut job = Job::default();
    job.metadata.generate_name = Some("forensic-collector-".to_string());
    job.metadata.namespace = Some(cfg.namespace.clone());
    job.metadata.labels = Some(BTreeMap::from([(
        COLLECTOR_JOB_LABEL.to_string(),
        "collector".to_string(),
    )]));
    if let Some(owner) = cfg.owner.clone() {
        job.metadata.owner_references = Some(vec![owner]);
    }

    let container = Container {
        name: "collector".to_string(),
        image: Some(cfg.image.clone()),
        command: Some(vec![
            "/kube-forensics-operator".to_string(),
            "collector".to_string(),
            format!("--file={}", cfg.checkpoint_path),
            format!("--blob-bucket={}", cfg.bucket),
            format!("--blob-region={}", cfg.region),
            format!("--blob-endpoint={}", cfg.endpoint),
            format!("--blob-key={}", cfg.key),
        ]),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "checkpoint-file".to_string(),
            mount_path: cfg.checkpoint_path.clone(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    job.spec = Some(JobSpec {
        // The job cleans itself up shortly after the upload finishes.
        ttl_seconds_after_finished: Some(300),
        template: PodTemplateSpec {
            spec: Some(PodSpec {
                node_name: Some(cfg.node_name.clone()),
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                volumes: Some(vec![Volume {
                    name: "checkpoint-file".to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: cfg.checkpoint_path.clone(),
                        type_: Some("File".to_string()),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    });
    job
}
