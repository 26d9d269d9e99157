use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use docx_remote_control::{
    AdmissionConfig, BatchConfig, BucketConfig, CircuitConfig, ControlConfig, LeaseConfig,
    Operation, RetryPolicy, VersionCacheConfig,
};

/// Configuration for the docx-remote-control runner.
#[derive(Parser, Debug, Clone)]
#[command(name = "docx-remote-control")]
#[command(about = "Submit a batch of operations to a remote workbook under lease, rate and retry control")]
pub struct Config {
    /// Base URL of the remote API
    #[arg(long, env = "REMOTE_BASE_URL")]
    pub base_url: String,

    /// Resource path, relative to the base URL (e.g. drives/{id}/items/{id}/workbook)
    #[arg(long, env = "REMOTE_RESOURCE")]
    pub resource: String,

    /// JSON file holding an array of operations ("-" for stdin)
    #[arg(long, default_value = "-", env = "REMOTE_OPERATIONS")]
    pub operations: PathBuf,

    /// Bearer token sent with every request
    #[arg(long, default_value = "", env = "REMOTE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,

    /// Scopes requested from the credential source
    #[arg(long = "scope", env = "REMOTE_SCOPES", value_delimiter = ',')]
    pub scopes: Vec<String>,

    /// Open a non-persistent session (changes are discarded on close)
    #[arg(long)]
    pub no_persist: bool,

    /// Per-request timeout (seconds)
    #[arg(long, default_value = "30", env = "REMOTE_REQUEST_TIMEOUT")]
    pub request_timeout_secs: u64,

    /// Overall deadline for the submission (seconds)
    #[arg(long, env = "REMOTE_DEADLINE")]
    pub deadline_secs: Option<u64>,

    /// Session lifetime granted by the remote (seconds)
    #[arg(long, default_value = "300", env = "SESSION_TTL")]
    pub session_ttl_secs: u64,

    /// Refresh sessions with less than this remaining (seconds)
    #[arg(long, default_value = "60", env = "SESSION_REFRESH_THRESHOLD")]
    pub refresh_threshold_secs: u64,

    /// Interval of the expired-session sweep (seconds)
    #[arg(long, default_value = "30", env = "SESSION_REAPER_INTERVAL")]
    pub reaper_interval_secs: u64,

    /// Allow more than one session per resource
    #[arg(long, env = "ALLOW_MULTIPLE_SESSIONS")]
    pub allow_multiple_leases: bool,

    /// Global admission burst
    #[arg(long, default_value = "100", env = "GLOBAL_CAPACITY")]
    pub global_capacity: u32,

    /// Global admission rate (requests per second)
    #[arg(long, default_value = "50", env = "GLOBAL_RATE")]
    pub global_rate: f64,

    /// Per-resource admission burst
    #[arg(long, default_value = "10", env = "RESOURCE_CAPACITY")]
    pub resource_capacity: u32,

    /// Per-resource admission rate (requests per second)
    #[arg(long, default_value = "5", env = "RESOURCE_RATE")]
    pub resource_rate: f64,

    /// Failures that open a resource's circuit
    #[arg(long, default_value = "5", env = "CIRCUIT_FAILURE_THRESHOLD")]
    pub failure_threshold: u32,

    /// Window in which failures are counted (seconds)
    #[arg(long, default_value = "60", env = "CIRCUIT_FAILURE_WINDOW")]
    pub failure_window_secs: u64,

    /// Half-open successes that close a circuit
    #[arg(long, default_value = "2", env = "CIRCUIT_SUCCESS_THRESHOLD")]
    pub success_threshold: u32,

    /// Time an open circuit waits before a trial (seconds)
    #[arg(long, default_value = "30", env = "CIRCUIT_RESET_TIMEOUT")]
    pub reset_timeout_secs: u64,

    /// Attempts per operation across all failure classes
    #[arg(long, default_value = "10", env = "RETRY_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Operations per batch call
    #[arg(long, default_value = "20", env = "BATCH_MAX_COUNT")]
    pub batch_max_count: usize,

    /// Estimated bytes per batch call
    #[arg(long, default_value = "4194304", env = "BATCH_MAX_BYTES")]
    pub batch_max_bytes: usize,

    /// Batch calls in flight at once
    #[arg(long, default_value = "4", env = "BATCH_PARALLELISM")]
    pub batch_parallelism: usize,
}

impl Config {
    pub fn persist(&self) -> bool {
        !self.no_persist
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    /// Map the command line onto the control layer's configuration.
    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            lease: LeaseConfig {
                ttl: Duration::from_secs(self.session_ttl_secs),
                refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
                reaper_interval: Duration::from_secs(self.reaper_interval_secs),
                allow_multiple_leases: self.allow_multiple_leases,
            },
            versions: VersionCacheConfig::default(),
            admission: AdmissionConfig {
                global: BucketConfig {
                    capacity: self.global_capacity,
                    refill_per_sec: self.global_rate,
                },
                per_resource: BucketConfig {
                    capacity: self.resource_capacity,
                    refill_per_sec: self.resource_rate,
                },
            },
            circuit: CircuitConfig {
                failure_threshold: self.failure_threshold,
                failure_window: Duration::from_secs(self.failure_window_secs),
                success_threshold: self.success_threshold,
                reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            batch: BatchConfig {
                max_count: self.batch_max_count,
                max_bytes: self.batch_max_bytes,
                parallelism: self.batch_parallelism,
            },
        }
    }
}

/// Read a JSON array of operations from `path` ("-" reads stdin).
pub fn load_operations(path: &Path) -> anyhow::Result<Vec<Operation>> {
    let raw = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("Failed to read operations from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read operations from {}", path.display()))?
    };
    serde_json::from_str(&raw).context("Operations must be a JSON array of operations")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec![
            "docx-remote-control",
            "--base-url",
            "https://graph.example.com/v1.0",
            "--resource",
            "me/drive/items/abc/workbook",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults_map_to_valid_control_config() {
        let config = parse(&[]);
        assert!(config.persist());
        let control = config.control_config();
        assert!(control.validate().is_ok());
        assert_eq!(control.lease.ttl, Duration::from_secs(300));
        assert_eq!(control.admission.per_resource.capacity, 10);
        assert_eq!(control.batch.max_count, 20);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--no-persist",
            "--batch-parallelism",
            "8",
            "--scope",
            "Files.ReadWrite,offline_access",
            "--deadline-secs",
            "90",
        ]);
        assert!(!config.persist());
        assert_eq!(config.control_config().batch.parallelism, 8);
        assert_eq!(config.scopes, vec!["Files.ReadWrite", "offline_access"]);
        assert_eq!(config.deadline(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_load_operations_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "a", "target": "Sheet1!A1", "payload": {{"values": [[1]]}}}},
                {{"target": "Sheet1!B2", "method": "POST"}}]"#
        )
        .unwrap();

        let operations = load_operations(file.path()).unwrap();
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0].id, "a");
        assert_eq!(operations[1].method, "POST");
    }

    #[test]
    fn test_load_operations_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_operations(file.path()).is_err());
    }
}
