//! Process settings read from the environment.

use std::net::SocketAddr;

use tracing::warn;

use trackflow_queue::QueueConfig;

pub const DEFAULT_ADMIN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Which queue implementation the worker runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// `LocalQueue` over a key-value store.
    #[default]
    Local,
    /// Redis Streams consumer groups.
    Streams,
}

impl Backend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Backend::Local),
            "streams" | "redis-streams" => Some(Backend::Streams),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub backend: Backend,
    /// Put `LocalQueue` on Redis instead of the in-memory store.
    pub use_persistent_stores: bool,
    pub redis_url: String,
    pub admin_addr: SocketAddr,
    pub queue: QueueConfig,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let use_persistent_stores = lookup("USE_PERSISTENT_STORES")
            .unwrap_or_else(|| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

        let backend = match lookup("TRACKFLOW_BACKEND") {
            None => Backend::default(),
            Some(raw) => Backend::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown TRACKFLOW_BACKEND, using local");
                Backend::Local
            }),
        };

        let admin_addr = lookup("TRACKFLOW_ADMIN_ADDR")
            .and_then(|raw| match raw.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(value = %raw, error = %e, "ignoring TRACKFLOW_ADMIN_ADDR");
                    None
                }
            })
            .unwrap_or_else(default_admin_addr);

        Self {
            backend,
            use_persistent_stores,
            redis_url,
            admin_addr,
            queue: QueueConfig::from_lookup(&lookup),
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_in_memory_local_queue() {
        let settings = WorkerSettings::from_lookup(lookup(&[]));
        assert_eq!(settings.backend, Backend::Local);
        assert!(!settings.use_persistent_stores);
        assert_eq!(settings.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(settings.admin_addr.to_string(), DEFAULT_ADMIN_ADDR);
        assert_eq!(settings.queue, QueueConfig::default());
    }

    #[test]
    fn reads_backend_store_and_queue_settings() {
        let settings = WorkerSettings::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("REDIS_URL", "redis://cache:6380"),
            ("TRACKFLOW_BACKEND", "Streams"),
            ("TRACKFLOW_ADMIN_ADDR", "127.0.0.1:9090"),
            ("TRACKFLOW_MAX_RETRIES", "5"),
            ("TRACKFLOW_PROCESSING_TIMEOUT", "10s"),
        ]));
        assert_eq!(settings.backend, Backend::Streams);
        assert!(settings.use_persistent_stores);
        assert_eq!(settings.redis_url, "redis://cache:6380");
        assert_eq!(settings.admin_addr.port(), 9090);
        assert_eq!(settings.queue.default_max_retries, 5);
        assert_eq!(settings.queue.processing_timeout, Duration::from_secs(10));
    }

    #[test]
    fn malformed_values_fall_back() {
        let settings = WorkerSettings::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "yes please"),
            ("TRACKFLOW_BACKEND", "kafka"),
            ("TRACKFLOW_ADMIN_ADDR", "not-an-addr"),
        ]));
        assert_eq!(settings.backend, Backend::Local);
        assert!(!settings.use_persistent_stores);
        assert_eq!(settings.admin_addr.port(), 8080);
    }
}
