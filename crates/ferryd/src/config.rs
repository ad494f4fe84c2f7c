use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);
const FOUR_HOURS: Duration = Duration::from_secs(4 * 3600);
const TEN_MINUTES: Duration = Duration::from_secs(10 * 60);

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FerrydConfig {
    /// Maximum concurrently dispatched deliveries per transport;
    /// the size of the worker pool a transport may occupy
    #[serde(default = "FerrydConfig::default_process_limit")]
    pub process_limit: usize,

    /// Initial concurrency window of a destination queue
    #[serde(default = "FerrydConfig::default_dest_concurrency_limit")]
    pub dest_concurrency_limit: usize,

    /// Maximum recipients bundled into one delivery
    #[serde(default = "FerrydConfig::default_dest_recipient_limit")]
    pub dest_recipient_limit: usize,

    /// Maximum messages resident in the scheduler at once
    #[serde(default = "FerrydConfig::default_message_active_limit")]
    pub message_active_limit: usize,

    /// Size of the global in-core recipient slot pool, shared by
    /// all resident messages
    #[serde(default = "FerrydConfig::default_recipient_limit")]
    pub recipient_limit: usize,

    /// First back-off delay for a destination declared dead
    #[serde(
        default = "FerrydConfig::default_minimal_backoff",
        with = "duration_serde"
    )]
    pub minimal_backoff: Duration,

    /// Back-off doubles per consecutive throttle up to this cap
    #[serde(
        default = "FerrydConfig::default_maximal_backoff",
        with = "duration_serde"
    )]
    pub maximal_backoff: Duration,

    /// A delivery worker that has not reported within this limit is
    /// killed and its unacknowledged recipients deferred
    #[serde(default = "FerrydConfig::default_time_limit", with = "duration_serde")]
    pub time_limit: Duration,

    /// How often the active area is rescanned for new queue files,
    /// and the deferred area for files due another try
    #[serde(
        default = "FerrydConfig::default_sweep_interval",
        with = "duration_serde"
    )]
    pub sweep_interval: Duration,

    /// Name used as the nexthop for the local transport; defaults
    /// to the HOSTNAME environment variable, then "localhost"
    #[serde(default)]
    pub hostname: Option<String>,

    /// Root of the on-disk queue areas
    #[serde(default = "FerrydConfig::default_spool_path")]
    pub spool_path: PathBuf,

    /// Where delivery/bounce/defer records are appended; stdout
    /// when unset
    #[serde(default)]
    pub disposition_log: Option<PathBuf>,

    /// Command spawned per delivery; receives one request as a JSON
    /// line on stdin and answers with one report line on stdout
    #[serde(default)]
    pub worker_command: Vec<String>,

    /// Per-transport overrides of the limit knobs
    #[serde(default, rename = "transport")]
    pub transports: HashMap<String, TransportTuning>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TransportTuning {
    pub process_limit: Option<usize>,
    pub dest_concurrency_limit: Option<usize>,
    pub dest_recipient_limit: Option<usize>,
}

impl Default for FerrydConfig {
    fn default() -> Self {
        Self {
            process_limit: Self::default_process_limit(),
            dest_concurrency_limit: Self::default_dest_concurrency_limit(),
            dest_recipient_limit: Self::default_dest_recipient_limit(),
            message_active_limit: Self::default_message_active_limit(),
            recipient_limit: Self::default_recipient_limit(),
            minimal_backoff: Self::default_minimal_backoff(),
            maximal_backoff: Self::default_maximal_backoff(),
            time_limit: Self::default_time_limit(),
            sweep_interval: Self::default_sweep_interval(),
            hostname: None,
            spool_path: Self::default_spool_path(),
            disposition_log: None,
            worker_command: vec![],
            transports: HashMap::new(),
        }
    }
}

impl FerrydConfig {
    fn default_process_limit() -> usize {
        50
    }

    fn default_dest_concurrency_limit() -> usize {
        20
    }

    fn default_dest_recipient_limit() -> usize {
        50
    }

    fn default_message_active_limit() -> usize {
        20_000
    }

    fn default_recipient_limit() -> usize {
        20_000
    }

    fn default_minimal_backoff() -> Duration {
        FIVE_MINUTES
    }

    fn default_maximal_backoff() -> Duration {
        FOUR_HOURS
    }

    fn default_time_limit() -> Duration {
        TEN_MINUTES
    }

    fn default_sweep_interval() -> Duration {
        Duration::from_secs(60)
    }

    pub fn effective_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn default_spool_path() -> PathBuf {
        PathBuf::from("/var/spool/ferrymta")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("reading {}: {err:#}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .map_err(|err| anyhow::anyhow!("parsing {}: {err:#}", path.display()))?;
        Ok(config)
    }

    /// The effective limits for a transport, after overrides.
    pub fn transport_limits(&self, transport: &str) -> TransportLimits {
        let tuning = self.transports.get(transport);
        TransportLimits {
            process_limit: tuning
                .and_then(|t| t.process_limit)
                .unwrap_or(self.process_limit),
            dest_concurrency_limit: tuning
                .and_then(|t| t.dest_concurrency_limit)
                .unwrap_or(self.dest_concurrency_limit),
            dest_recipient_limit: tuning
                .and_then(|t| t.dest_recipient_limit)
                .unwrap_or(self.dest_recipient_limit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    pub process_limit: usize,
    pub dest_concurrency_limit: usize,
    pub dest_recipient_limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = FerrydConfig::default();
        assert_eq!(config.process_limit, 50);
        assert_eq!(config.dest_concurrency_limit, 20);
        assert_eq!(config.dest_recipient_limit, 50);
        assert_eq!(config.message_active_limit, 20_000);
        assert_eq!(config.recipient_limit, 20_000);
        assert_eq!(config.minimal_backoff, Duration::from_secs(300));
        assert_eq!(config.maximal_backoff, Duration::from_secs(4 * 3600));
    }

    #[test]
    fn transport_overrides_apply() {
        let config: FerrydConfig = toml::from_str(
            r#"
                dest_concurrency_limit = 10
                minimal_backoff = "90s"

                [transport.smtp]
                dest_concurrency_limit = 5

                [transport.local]
                dest_recipient_limit = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.minimal_backoff, Duration::from_secs(90));

        let smtp = config.transport_limits("smtp");
        assert_eq!(smtp.dest_concurrency_limit, 5);
        assert_eq!(smtp.dest_recipient_limit, 50);

        let local = config.transport_limits("local");
        assert_eq!(local.dest_concurrency_limit, 10);
        assert_eq!(local.dest_recipient_limit, 1);

        let other = config.transport_limits("relay");
        assert_eq!(other.process_limit, 50);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = toml::from_str::<FerrydConfig>("concurency = 5").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }
}
