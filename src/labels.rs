//! Shared label, annotation and mount-path vocabulary.
//!
//! Everything the operator stamps onto cluster objects is defined here so the
//! reconciler, the replica builder and the janitor agree on the exact keys.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source pod name, truncated to the 63-char label value limit.
pub const LABEL_SOURCE_POD: &str = "forensic-source-pod";

/// Source pod UID. The foreign key linking a replica to its cloned
/// dependencies and snapshots; the janitor cascades deletion over it.
pub const LABEL_SOURCE_POD_UID: &str = "forensic-source-pod-uid";

/// Creation instant of the replica, in the colon-free label-safe format.
pub const LABEL_FORENSIC_TIME: &str = "forensic-time";

pub const LABEL_FORENSIC_TTL: &str = "forensic.io/ttl";

pub const LABEL_CRASH_SIGNATURE: &str = "forensic.io/crash-signature";

/// Set to `true` on a source pod to force secret redaction regardless of the
/// global cloning setting.
pub const ANNOTATION_NO_SECRET_CLONE: &str = "forensic.io/no-secret-clone";

/// Set to `true` on a replica to exempt it from TTL reaping.
pub const ANNOTATION_HOLD: &str = "forensic.io/hold";

pub const ANNOTATION_EXIT_CODE: &str = "forensic.io/exit-code";
pub const ANNOTATION_LOG_SHA256: &str = "forensic.io/log-sha256";
pub const ANNOTATION_SNAPSHOTS: &str = "forensic.io/snapshots";
pub const ANNOTATION_CHECKPOINT: &str = "forensic.io/checkpoint";
pub const ANNOTATION_ORIGINAL_COMMAND: &str = "forensic.io/original-command";
pub const ANNOTATION_ORIGINAL_ARGS: &str = "forensic.io/original-args";
pub const ANNOTATION_LOG_S3_URL: &str = "forensic.io/log-s3-url";

pub const NETWORK_POLICY_NAME: &str = "deny-all-egress";

/// Key under which the captured log is stored in its ConfigMap.
pub const LOG_CONFIGMAP_KEY: &str = "crash.log";

/// Where the captured log is mounted inside every replica container.
pub const LOG_MOUNT_PATH: &str = "/forensics/original-logs";

/// Where the toolkit utilities are mounted inside every replica container.
pub const TOOLKIT_MOUNT_PATH: &str = "/usr/local/bin/toolkit";

/// Formats an instant for the `forensic-time` label. Label values may not
/// contain colons, so this is RFC 3339 with `-` in the time part.
pub fn forensic_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%SZ").to_string()
}

/// Formats a TTL for the `forensic.io/ttl` label. `humantime` output is
/// stripped of spaces ("1h 30m" would be an invalid label value) and parses
/// back with [`parse_ttl_label`].
pub fn ttl_label(ttl: Duration) -> String {
    humantime::format_duration(ttl).to_string().replace(' ', "")
}

pub fn parse_ttl_label(value: &str) -> Option<Duration> {
    humantime::parse_duration(value).ok()
}
