//! Queue configuration.

use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Operator-facing queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Delay before retry `n` is `retry_delays[n - 1]`; the last entry repeats
    /// when more retries are allowed than delays are listed.
    pub retry_delays: Vec<Duration>,
    /// Retry budget for messages published without an explicit one.
    pub default_max_retries: u32,
    /// How long dead-lettered records are kept.
    pub dead_letter_ttl: Duration,
    /// Processing lock TTL; also the crash-recovery window.
    pub processing_timeout: Duration,
    /// Maximum concurrently handled messages per worker.
    pub batch_size: usize,
    /// Worker polling and sweeper cadence.
    pub poll_interval: Duration,
    /// Number of worker threads started by `LocalQueue::start`.
    pub workers: usize,
    /// How long completed records stay inspectable.
    pub completed_ttl: Duration,
    /// Charge a sweeper reclaim against the retry budget.
    pub reclaim_consumes_retry: bool,
    /// Namespace for every store key.
    pub key_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
            default_max_retries: DEFAULT_MAX_RETRIES,
            dead_letter_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            processing_timeout: Duration::from_secs(30),
            batch_size: 4,
            poll_interval: Duration::from_millis(100),
            workers: 2,
            completed_ttl: Duration::from_secs(24 * 60 * 60),
            reclaim_consumes_retry: false,
            key_prefix: "trackflow".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.default_max_retries = max;
        self
    }

    pub fn with_dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.dead_letter_ttl = ttl;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_completed_ttl(mut self, ttl: Duration) -> Self {
        self.completed_ttl = ttl;
        self
    }

    pub fn with_reclaim_consumes_retry(mut self, enabled: bool) -> Self {
        self.reclaim_consumes_retry = enabled;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Delay to wait before the `retry_count`-th retry (1-indexed).
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let idx = (retry_count as usize - 1).min(self.retry_delays.len().saturating_sub(1));
        self.retry_delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// Load configuration from `TRACKFLOW_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed values are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("TRACKFLOW_RETRY_DELAYS") {
            match parse_duration_list(&raw) {
                Ok(delays) => config.retry_delays = delays,
                Err(e) => warn!(value = %raw, error = %e, "ignoring TRACKFLOW_RETRY_DELAYS"),
            }
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_MAX_RETRIES", |s| s.parse::<u32>().ok()) {
            config.default_max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_DEAD_LETTER_TTL", parse_duration_opt) {
            config.dead_letter_ttl = v;
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_PROCESSING_TIMEOUT", parse_duration_opt) {
            config.processing_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_BATCH_SIZE", |s| s.parse::<usize>().ok()) {
            config = config.with_batch_size(v);
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_POLL_INTERVAL", parse_duration_opt) {
            config.poll_interval = v;
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_WORKERS", |s| s.parse::<usize>().ok()) {
            config = config.with_workers(v);
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_COMPLETED_TTL", parse_duration_opt) {
            config.completed_ttl = v;
        }
        if let Some(v) = parse_var(&lookup, "TRACKFLOW_RECLAIM_CONSUMES_RETRY", |s| {
            s.parse::<bool>().ok()
        }) {
            config.reclaim_consumes_retry = v;
        }
        if let Some(prefix) = lookup("TRACKFLOW_KEY_PREFIX").filter(|p| !p.is_empty()) {
            config.key_prefix = prefix;
        }

        config
    }
}

fn parse_var<F, P, T>(lookup: &F, key: &str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring malformed configuration value");
    }
    parsed
}

fn parse_duration_opt(raw: &str) -> Option<Duration> {
    parse_duration(raw).ok()
}

/// Parse `250ms`, `5s`, `2m`, `1h` or `7d`. A bare number means seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration `{raw}`"))?;

    let secs_per_unit: u64 = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => return Err(format!("unknown duration unit `{other}` in `{raw}`")),
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration `{raw}` is out of range"))
}

/// Parse a comma-separated list of durations (`1s,5s,30s`).
pub fn parse_duration_list(raw: &str) -> Result<Vec<Duration>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_duration)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn delay_table_is_indexed_by_retry_count() {
        let config = QueueConfig::default().with_retry_delays(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(30),
        ]);

        assert_eq!(config.delay_for_retry(0), Duration::ZERO);
        assert_eq!(config.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_retry(2), Duration::from_secs(5));
        assert_eq!(config.delay_for_retry(3), Duration::from_secs(30));
        // Last entry repeats.
        assert_eq!(config.delay_for_retry(9), Duration::from_secs(30));
    }

    #[test]
    fn empty_delay_table_retries_immediately() {
        let config = QueueConfig::default().with_retry_delays(vec![]);
        assert_eq!(config.delay_for_retry(1), Duration::ZERO);
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("12").unwrap(), Duration::from_secs(12));
        assert!(parse_duration("5y").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration(&format!("{}d", u64::MAX / 2)).is_err());
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
        assert_eq!(
            parse_duration_list("1s, 5s,30s").unwrap(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30)
            ]
        );
    }

    #[test]
    fn loads_from_lookup_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TRACKFLOW_RETRY_DELAYS", "100ms,200ms"),
            ("TRACKFLOW_MAX_RETRIES", "5"),
            ("TRACKFLOW_PROCESSING_TIMEOUT", "10s"),
            ("TRACKFLOW_BATCH_SIZE", "0"),
            ("TRACKFLOW_WORKERS", "lots"),
            ("TRACKFLOW_RECLAIM_CONSUMES_RETRY", "true"),
            ("TRACKFLOW_DEAD_LETTER_TTL", "5124095576030432h"),
            ("TRACKFLOW_COMPLETED_TTL", "213503982334602d"),
        ]);
        let config = QueueConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(
            config.retry_delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.processing_timeout, Duration::from_secs(10));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.workers, QueueConfig::default().workers);
        assert!(config.reclaim_consumes_retry);
        assert_eq!(config.dead_letter_ttl, QueueConfig::default().dead_letter_ttl);
        assert_eq!(config.completed_ttl, QueueConfig::default().completed_ttl);
    }

    proptest! {
        #[test]
        fn delay_lookup_always_comes_from_the_table(
            delays in proptest::collection::vec(0u64..10_000, 1..8),
            retry in 1u32..64,
        ) {
            let table: Vec<Duration> = delays.iter().map(|ms| Duration::from_millis(*ms)).collect();
            let config = QueueConfig::default().with_retry_delays(table.clone());
            prop_assert!(table.contains(&config.delay_for_retry(retry)));
        }
    }
}
