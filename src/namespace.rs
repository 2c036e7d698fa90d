//! Forensic namespace bootstrap and egress isolation.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, PostParams};
use kube::core::ErrorResponse;
use kube::Client;

use crate::config::Config;
use crate::error::Result;
use crate::labels::NETWORK_POLICY_NAME;

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { reason, .. }) if reason == "AlreadyExists")
}

/// Idempotently creates the forensic namespace.
pub async fn ensure_namespace(client: Client, config: &Config) -> Result<()> {
    let mut namespace = Namespace::default();
    namespace.metadata.name = Some(config.target_namespace.clone());

    let api: Api<Namespace> = Api::all(client);
    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => Ok(()),
        Err(err) if is_already_exists(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// The deny-all-egress policy: empty pod selector, egress policy type, zero
/// egress rules. A compromised process resurrected inside a replica has no
/// way to phone home.
pub fn build_deny_all_egress(config: &Config) -> NetworkPolicy {
    let mut policy = NetworkPolicy::default();
    policy.metadata.name = Some(NETWORK_POLICY_NAME.to_string());
    policy.metadata.namespace = Some(config.target_namespace.clone());
    policy.spec = Some(NetworkPolicySpec {
        pod_selector: LabelSelector::default(),
        policy_types: Some(vec!["Egress".to_string()]),
        egress: Some(Vec::new()),
        ..Default::default()
    });
    policy
}

/// Idempotently creates the deny-all-egress policy in the forensic namespace.
pub async fn ensure_network_policy(client: Client, config: &Config) -> Result<()> {
    let api: Api<NetworkPolicy> = Api::namespaced(client, &config.target_namespace);
    match api
        .create(&PostParams::default(), &build_deny_all_egress(config))
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if is_already_exists(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
