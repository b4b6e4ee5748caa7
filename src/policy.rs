use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::ThrottleConfig;
use crate::error::{Result, ThrottlerError};
use crate::keys::entity_hex;
use crate::kv::{open_store, KvStore};
use crate::record::QuotaRecord;
use crate::store::ThrottleStore;

/// Entity-facing quota policy: hourly and daily limits over a shared store.
pub struct ThrottlePolicy {
    config: ThrottleConfig,
    store: ThrottleStore,
}

/// Snapshot of an entity's quota after rollover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub rule_id: String,
    pub entity: String,
    pub hour_count: u64,
    pub day_count: u64,
    pub per_hour: Option<u64>,
    pub per_day: Option<u64>,
    pub remaining_hour: Option<u64>,
    pub remaining_day: Option<u64>,
    pub at_quota: bool,
    pub locked_by_other: bool,
}

impl ThrottlePolicy {
    /// Create a policy, opening the store its configuration names.
    ///
    /// Fails if the configuration is invalid or the store's table cannot be
    /// used, so misconfiguration surfaces before any request is evaluated.
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        config.check()?;
        let uri = config.resolved_store_uri()?;
        let kv = open_store(&uri, config.table())?;
        Self::with_store(config, kv, Arc::new(SystemClock))
    }

    /// Create a policy over an already opened store and clock.
    pub fn with_store(
        config: ThrottleConfig,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.check()?;
        let store = ThrottleStore::new(kv, clock, config.lock_expiry);

        info!(
            rule_id = %config.rule_id,
            per_hour = ?config.per_hour,
            per_day = ?config.per_day,
            backend = store.kv().backend(),
            holder = store.holder_token(),
            "Throttle policy ready"
        );

        Ok(Self { config, store })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn rule_id(&self) -> &str {
        &self.config.rule_id
    }

    pub fn store(&self) -> &ThrottleStore {
        &self.store
    }

    pub fn holder_token(&self) -> &str {
        self.store.holder_token()
    }

    /// Whether the entity has used up its hourly or daily budget.
    pub fn at_quota(&self, entity: &[u8]) -> Result<bool> {
        let record = self.store.get(self.rule_id(), entity)?;
        Ok(self.exceeds(&self.store.effective(&record)))
    }

    /// Lock the entity and check its budget.
    ///
    /// On `true` the lock stays held until [`use_quota`](Self::use_quota) or
    /// [`release`](Self::release). Contention and exhausted budgets both deny;
    /// a denial never leaves our lock behind.
    pub fn approve(&self, entity: &[u8]) -> Result<bool> {
        let rule_id = self.rule_id();
        let (record, acquired) = self.store.get_locked(rule_id, entity)?;

        if !acquired {
            debug!(rule_id, entity = %entity_hex(entity), "Denied: entity locked by another holder");
            return Ok(false);
        }

        if self.exceeds(&self.store.effective(&record)) {
            debug!(rule_id, entity = %entity_hex(entity), "Denied: quota exhausted");
            let mut record = record;
            self.store.unlock(rule_id, entity, &mut record)?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Commit a reservation made by a successful [`approve`](Self::approve).
    pub fn use_quota(&self, entity: &[u8]) -> Result<QuotaRecord> {
        let rule_id = self.rule_id();
        let record = self.store.get(rule_id, entity)?;

        if !record.is_lock_owned_by(self.holder_token()) {
            return Err(ThrottlerError::LockNotHeld {
                rule_id: rule_id.to_string(),
                entity: entity_hex(entity),
            });
        }

        self.store.increment(rule_id, entity)
    }

    /// Approve and commit in one step.
    pub fn approve_and_use(&self, entity: &[u8]) -> Result<bool> {
        if !self.approve(entity)? {
            return Ok(false);
        }
        self.use_quota(entity)?;
        Ok(true)
    }

    /// Drop an approval without consuming quota.
    pub fn release(&self, entity: &[u8]) -> Result<()> {
        let mut record = self.store.get(self.rule_id(), entity)?;
        self.store.unlock(self.rule_id(), entity, &mut record)
    }

    /// Reset the entity's counters regardless of who holds its lock.
    pub fn clear(&self, entity: &[u8]) -> Result<()> {
        self.store.clear(self.rule_id(), entity)?;
        Ok(())
    }

    pub fn status(&self, entity: &[u8]) -> Result<QuotaStatus> {
        let record = self.store.get(self.rule_id(), entity)?;
        let current = self.store.effective(&record);

        Ok(QuotaStatus {
            rule_id: self.config.rule_id.clone(),
            entity: entity_hex(entity),
            hour_count: current.hour_count,
            day_count: current.day_count,
            per_hour: self.config.per_hour,
            per_day: self.config.per_day,
            remaining_hour: self.config.per_hour.map(|l| l.saturating_sub(current.hour_count)),
            remaining_day: self.config.per_day.map(|l| l.saturating_sub(current.day_count)),
            at_quota: self.exceeds(&current),
            locked_by_other: self.store.is_locked(&record),
        })
    }

    /// Either configured limit being reached is enough; absent limits never bind.
    fn exceeds(&self, current: &QuotaRecord) -> bool {
        let hour_full = self.config.per_hour.is_some_and(|limit| current.hour_count >= limit);
        let day_full = self.config.per_day.is_some_and(|limit| current.day_count >= limit);
        hour_full || day_full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryStore;
    use chrono::{Local, TimeZone};

    fn policy(config: ThrottleConfig) -> ThrottlePolicy {
        let clock = Arc::new(ManualClock::new(Local.with_ymd_and_hms(2022, 3, 9, 17, 0, 0).unwrap()));
        ThrottlePolicy::with_store(config, Arc::new(MemoryStore::new("quota_throttle")), clock).unwrap()
    }

    #[test]
    fn test_approve_alone_does_not_consume() {
        let pr = policy(ThrottleConfig::new("rid").with_per_hour(1));

        assert!(pr.approve(b"pid").unwrap());
        assert!(!pr.at_quota(b"pid").unwrap());
        assert!(pr.approve(b"pid").unwrap());

        pr.use_quota(b"pid").unwrap();
        assert!(pr.at_quota(b"pid").unwrap());
        assert!(!pr.approve(b"pid").unwrap());
    }

    #[test]
    fn test_use_without_approve_is_misuse() {
        let pr = policy(ThrottleConfig::new("rid").with_per_day(5));
        let err = pr.use_quota(b"pid").unwrap_err();
        assert!(err.is_protocol_misuse());
    }

    #[test]
    fn test_denial_releases_lock() {
        let pr = policy(ThrottleConfig::new("rid").with_per_day(1));
        assert!(pr.approve_and_use(b"pid").unwrap());
        assert!(!pr.approve(b"pid").unwrap());

        let record = pr.store().get("rid", b"pid").unwrap();
        assert_eq!(record.lock_token, None);
    }

    #[test]
    fn test_release_keeps_counts() {
        let pr = policy(ThrottleConfig::new("rid").with_per_day(2));
        assert!(pr.approve(b"pid").unwrap());
        pr.release(b"pid").unwrap();

        assert!(pr.use_quota(b"pid").unwrap_err().is_protocol_misuse());
        assert_eq!(pr.status(b"pid").unwrap().day_count, 0);
    }

    #[test]
    fn test_no_limits_never_at_quota() {
        let pr = policy(ThrottleConfig::new("rid"));
        for _ in 0..10 {
            assert!(pr.approve_and_use(b"pid").unwrap());
        }
        assert!(!pr.at_quota(b"pid").unwrap());
    }

    #[test]
    fn test_status_reports_remaining() {
        let pr = policy(ThrottleConfig::new("rid").with_per_hour(2).with_per_day(5));
        assert!(pr.approve_and_use(b"pid").unwrap());

        let status = pr.status(b"pid").unwrap();
        assert_eq!(status.entity, "706964");
        assert_eq!(status.hour_count, 1);
        assert_eq!(status.remaining_hour, Some(1));
        assert_eq!(status.remaining_day, Some(4));
        assert!(!status.at_quota);
        assert!(!status.locked_by_other);
    }

    #[test]
    fn test_clear_resets() {
        let pr = policy(ThrottleConfig::new("rid").with_per_day(1));
        assert!(pr.approve_and_use(b"pid").unwrap());
        assert!(pr.at_quota(b"pid").unwrap());

        pr.clear(b"pid").unwrap();
        assert!(!pr.at_quota(b"pid").unwrap());
        assert_eq!(pr.status(b"pid").unwrap().day_count, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let clock = Arc::new(SystemClock);
        let result = ThrottlePolicy::with_store(
            ThrottleConfig::new("rid").with_per_hour(0),
            Arc::new(MemoryStore::new("quota_throttle")),
            clock,
        );
        assert!(result.is_err());
    }
}
