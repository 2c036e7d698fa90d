use std::time::Duration;

/// Runtime configuration for the forensics operator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace where forensic replicas and their dependencies live.
    pub target_namespace: String,
    /// Lifetime of a replica before the janitor reaps it.
    pub forensic_ttl: Duration,
    /// Upper bound on captured log bytes.
    pub max_log_size_bytes: usize,
    /// Namespaces never watched for crashes.
    pub ignore_namespaces: Vec<String>,
    /// Allow-list of watched namespaces; empty means all.
    pub watch_namespaces: Vec<String>,
    /// Clone secret values verbatim instead of redacting them.
    pub enable_secret_cloning: bool,
    /// Request a kubelet checkpoint of the crashed container.
    pub enable_checkpointing: bool,
    /// Repeated crashes with the same signature inside this window create no
    /// new replica.
    pub rate_limit_window: Duration,
    /// Deadline for the node-proxy checkpoint POST. Multi-gigabyte memory
    /// dumps take a while.
    pub checkpoint_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_namespace: "debug-forensics".to_string(),
            forensic_ttl: Duration::from_secs(24 * 3600),
            max_log_size_bytes: 500 * 1024,
            ignore_namespaces: vec!["kube-system".to_string(), "kube-public".to_string()],
            watch_namespaces: Vec::new(),
            enable_secret_cloning: true,
            enable_checkpointing: false,
            rate_limit_window: Duration::from_secs(3600),
            checkpoint_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Whether pods in `namespace` are eligible for forensic capture.
    pub fn watches_namespace(&self, namespace: &str) -> bool {
        if !self.watch_namespaces.is_empty()
            && !self.watch_namespaces.iter().any(|ns| ns == namespace)
        {
            return false;
        }
        if self.ignore_namespaces.iter().any(|ns| ns == namespace) {
            return false;
        }
        namespace != self.target_namespace
    }
}

/// Splits a comma-separated namespace list, trimming whitespace and dropping
/// empty entries.
pub fn parse_namespace_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_lists() {
        assert_eq!(
            parse_namespace_list("kube-system, kube-public"),
            vec!["kube-system", "kube-public"]
        );
        assert_eq!(parse_namespace_list(""), Vec::<String>::new());
        assert_eq!(parse_namespace_list(" a ,, b "), vec!["a", "b"]);
    }

    #[test]
    fn empty_watch_list_watches_everything_but_ignored() {
        let cfg = Config::default();
        assert!(cfg.watches_namespace("prod"));
        assert!(!cfg.watches_namespace("kube-system"));
        assert!(!cfg.watches_namespace("debug-forensics"));
    }

    #[test]
    fn allow_list_restricts_watching() {
        let cfg = Config {
            watch_namespaces: vec!["prod".to_string()],
            ..Config::default()
        };
        assert!(cfg.watches_namespace("prod"));
        assert!(!cfg.watches_namespace("staging"));
    }

    #[test]
    fn ignore_list_wins_over_allow_list() {
        let cfg = Config {
            watch_namespaces: vec!["kube-system".to_string()],
            ..Config::default()
        };
        assert!(!cfg.watches_namespace("kube-system"));
    }
}
