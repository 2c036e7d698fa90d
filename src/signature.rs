//! Crash-signature computation.
//!
//! Two crashes share a signature when they come from the same workload,
//! container and exit code in the same namespace; the reconciler uses the
//! signature as a label value to rate-limit replica creation.

use k8s_openapi::api::core::v1::Pod;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Computes the 63-hex-char crash signature for a pod.
///
/// The workload name is the first owner reference's name when present, else
/// the generate-name prefix, else the pod name, so that restarted instances
/// of the same controller collapse into one crash class.
pub fn crash_signature(pod: &Pod, container_name: &str, exit_code: i32) -> String {
    let workload_name = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .map(|r| r.name.as_str())
        .or(pod.metadata.generate_name.as_deref())
        .filter(|n| !n.is_empty())
        .or(pod.metadata.name.as_deref())
        .unwrap_or_default();

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let input = format!("{namespace}-{workload_name}-{container_name}-{exit_code}");
    let mut sig = sha256_hex(input.as_bytes());
    // sha256 hex is 64 chars; label values cap at 63.
    sig.truncate(63);
    sig
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn pod(ns: &str, name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(ns.to_string());
        pod.metadata.name = Some(name.to_string());
        pod
    }

    #[test]
    fn signature_is_truncated_lowercase_hex() {
        let sig = crash_signature(&pod("prod", "api-abc"), "app", 137);
        assert_eq!(sig.len(), 63);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn signature_matches_digest_of_input() {
        let sig = crash_signature(&pod("prod", "api-abc"), "app", 137);
        let expected = sha256_hex(b"prod-api-abc-app-137");
        assert_eq!(sig, expected[..63]);
    }

    #[test]
    fn owner_reference_takes_precedence() {
        let mut p = pod("prod", "api-abc-7f9d4-x2v1q");
        p.metadata.generate_name = Some("api-abc-7f9d4-".to_string());
        p.metadata.owner_references = Some(vec![OwnerReference {
            name: "api-abc-7f9d4".to_string(),
            kind: "ReplicaSet".to_string(),
            ..Default::default()
        }]);
        let sig = crash_signature(&p, "app", 1);
        assert_eq!(sig, sha256_hex(b"prod-api-abc-7f9d4-app-1")[..63]);
    }

    #[test]
    fn generate_name_beats_instance_name() {
        let mut p = pod("prod", "worker-x2v1q");
        p.metadata.generate_name = Some("worker-".to_string());
        let sig = crash_signature(&p, "main", 2);
        assert_eq!(sig, sha256_hex(b"prod-worker--main-2")[..63]);
    }

    #[test]
    fn distinct_exit_codes_produce_distinct_signatures() {
        let p = pod("prod", "api");
        assert_ne!(
            crash_signature(&p, "app", 137),
            crash_signature(&p, "app", 139)
        );
    }
}
