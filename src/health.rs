use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::policy::ThrottlePolicy;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub rule_id: String,
    pub store: StoreStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreStatus {
    pub backend: String,
    pub table: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    policy: Arc<ThrottlePolicy>,
}

impl HealthChecker {
    pub fn new(policy: Arc<ThrottlePolicy>) -> Self {
        Self { policy }
    }

    /// Pings the store; blocks for one round-trip.
    pub fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let store = self.check_store();
        let overall_status = if store.error.is_none() { "healthy" } else { "unhealthy" };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            rule_id: self.policy.rule_id().to_string(),
            store,
        }
    }

    fn check_store(&self) -> StoreStatus {
        let kv = self.policy.store().kv();
        let start = Instant::now();
        let result = kv.ping();
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (status, error) = match result {
            Ok(()) => ("healthy", None),
            Err(e) => ("unavailable", Some(e.to_string())),
        };

        StoreStatus {
            backend: kv.backend().to_string(),
            table: kv.table().to_string(),
            status: status.to_string(),
            response_time_ms,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ThrottleConfig;
    use crate::kv::MemoryStore;

    #[test]
    fn test_memory_store_is_healthy() {
        let policy = ThrottlePolicy::with_store(
            ThrottleConfig::new("rid"),
            Arc::new(MemoryStore::new("quota_throttle")),
            Arc::new(SystemClock),
        )
        .unwrap();

        let status = HealthChecker::new(Arc::new(policy)).check_health();
        assert_eq!(status.status, "healthy");
        assert_eq!(status.rule_id, "rid");
        assert_eq!(status.store.backend, "memory");
        assert!(status.store.error.is_none());

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("quota_throttle"));
    }
}
