use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bucket::Buckets;
use crate::clock::Clock;
use crate::error::{Result, ThrottlerError};
use crate::keys::{entity_hex, record_key};
use crate::kv::KvStore;
use crate::record::{self, QuotaRecord};

/// Retries for conditional writes of a lock we already own.
const MAX_RELEASE_ATTEMPTS: usize = 3;

/// Quota records with an optimistic lock kept in the same value as the
/// counters. Every write is a compare-and-set against the raw value read.
pub struct ThrottleStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    holder: String,
    lock_expiry: Duration,
}

/// Raw stored value alongside its decoded form.
struct Snapshot {
    raw: Option<String>,
    record: QuotaRecord,
}

impl ThrottleStore {
    /// Creates a store with a freshly generated holder token.
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, lock_expiry: Duration) -> Self {
        Self {
            kv,
            clock,
            holder: Uuid::new_v4().to_string(),
            lock_expiry,
        }
    }

    /// Token identifying this instance as a lock holder.
    pub fn holder_token(&self) -> &str {
        &self.holder
    }

    pub fn lock_expiry(&self) -> Duration {
        self.lock_expiry
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn buckets(&self) -> Buckets {
        Buckets::at(&self.clock.now())
    }

    /// Current record, or a zero record for the current buckets if the entity
    /// has no readable record.
    pub fn get(&self, rule_id: &str, entity: &[u8]) -> Result<QuotaRecord> {
        Ok(self.read(rule_id, entity)?.record)
    }

    /// Reads the record and tries to lock it in one call.
    pub fn get_locked(&self, rule_id: &str, entity: &[u8]) -> Result<(QuotaRecord, bool)> {
        let mut record = self.get(rule_id, entity)?;
        let acquired = self.lock(rule_id, entity, &mut record)?;
        Ok((record, acquired))
    }

    /// True if another holder owns an unexpired lock on `record`.
    ///
    /// Our own lock is never reported as locked.
    pub fn is_locked(&self, record: &QuotaRecord) -> bool {
        match record.lock_token.as_deref() {
            Some(token) if token != self.holder => !self.lock_expired(record),
            _ => false,
        }
    }

    /// Record with any stale hour/day buckets reset to now.
    pub fn effective(&self, record: &QuotaRecord) -> QuotaRecord {
        record.rolled_over(self.buckets())
    }

    /// Tries to take the entity's lock.
    ///
    /// Succeeds when the stored record is unlocked, its lock has expired, or
    /// the lock is already ours. `record` is refreshed with the latest stored
    /// state either way.
    pub fn lock(&self, rule_id: &str, entity: &[u8], record: &mut QuotaRecord) -> Result<bool> {
        let key = record_key(rule_id, entity);
        let snapshot = self.read(rule_id, entity)?;

        if self.is_locked(&snapshot.record) {
            debug!(rule_id, entity = %entity_hex(entity), "Entity locked by another holder");
            *record = snapshot.record;
            return Ok(false);
        }

        if self.is_expired_foreign_lock(&snapshot.record) {
            warn!(
                rule_id,
                entity = %entity_hex(entity),
                stale_holder = snapshot.record.lock_token.as_deref().unwrap_or_default(),
                "Taking over expired lock"
            );
        }

        let mut locked = snapshot.record.clone();
        locked.lock_token = Some(self.holder.clone());
        locked.lock_epoch = self.clock.epoch_seconds();

        let acquired = self.kv.compare_and_set(&key, snapshot.raw.as_deref(), &record::encode(&locked))?;

        if acquired {
            debug!(rule_id, entity = %entity_hex(entity), "Lock acquired");
            *record = locked;
        } else {
            debug!(rule_id, entity = %entity_hex(entity), "Lost lock race");
            *record = self.get(rule_id, entity)?;
        }

        Ok(acquired)
    }

    /// Releases our own lock on the entity; does nothing if we do not hold it.
    pub fn unlock(&self, rule_id: &str, entity: &[u8], record: &mut QuotaRecord) -> Result<()> {
        let key = record_key(rule_id, entity);

        for _ in 0..MAX_RELEASE_ATTEMPTS {
            let snapshot = self.read(rule_id, entity)?;
            if !snapshot.record.is_lock_owned_by(&self.holder) {
                *record = snapshot.record;
                return Ok(());
            }

            let mut unlocked = snapshot.record.clone();
            unlocked.clear_lock();

            if self.kv.compare_and_set(&key, snapshot.raw.as_deref(), &record::encode(&unlocked))? {
                debug!(rule_id, entity = %entity_hex(entity), "Lock released");
                *record = unlocked;
                return Ok(());
            }
        }

        Err(ThrottlerError::Internal(format!(
            "Could not release lock on entity {} after {} attempts",
            entity_hex(entity),
            MAX_RELEASE_ATTEMPTS
        )))
    }

    /// Consumes one unit of quota and releases the lock.
    ///
    /// Works from the stored record, applying bucket rollover before counting.
    /// Fails with [`ThrottlerError::LockNotHeld`] if another holder owns an
    /// unexpired lock, or if the record changed underneath us.
    pub fn increment(&self, rule_id: &str, entity: &[u8]) -> Result<QuotaRecord> {
        let key = record_key(rule_id, entity);
        let snapshot = self.read(rule_id, entity)?;

        if self.is_locked(&snapshot.record) {
            return Err(self.lock_not_held(rule_id, entity));
        }

        let mut next = self.effective(&snapshot.record);
        next.hour_count = next.hour_count.saturating_add(1);
        next.day_count = next.day_count.saturating_add(1);
        next.last_update = self.clock.epoch_seconds();
        next.clear_lock();

        if !self.kv.compare_and_set(&key, snapshot.raw.as_deref(), &record::encode(&next))? {
            warn!(rule_id, entity = %entity_hex(entity), "Record changed during increment");
            return Err(self.lock_not_held(rule_id, entity));
        }

        debug!(
            rule_id,
            entity = %entity_hex(entity),
            hour_count = next.hour_count,
            day_count = next.day_count,
            "Quota consumed"
        );

        Ok(next)
    }

    /// Deletes the entity's record regardless of lock state.
    pub fn clear(&self, rule_id: &str, entity: &[u8]) -> Result<bool> {
        let removed = self.kv.delete(&record_key(rule_id, entity))?;
        debug!(rule_id, entity = %entity_hex(entity), removed, "Quota cleared");
        Ok(removed)
    }

    fn read(&self, rule_id: &str, entity: &[u8]) -> Result<Snapshot> {
        let raw = self.kv.get(&record_key(rule_id, entity))?;

        let decoded = raw.as_deref().and_then(record::decode);
        if raw.is_some() && decoded.is_none() {
            warn!(rule_id, entity = %entity_hex(entity), "Unreadable quota record, starting fresh");
        }

        let record = decoded
            .unwrap_or_else(|| QuotaRecord::fresh(self.buckets(), self.clock.epoch_seconds()));

        Ok(Snapshot { raw, record })
    }

    fn lock_expired(&self, record: &QuotaRecord) -> bool {
        self.clock.epoch_seconds() - record.lock_epoch >= self.lock_expiry.as_secs_f64()
    }

    fn is_expired_foreign_lock(&self, record: &QuotaRecord) -> bool {
        match record.lock_token.as_deref() {
            Some(token) => token != self.holder && self.lock_expired(record),
            None => false,
        }
    }

    fn lock_not_held(&self, rule_id: &str, entity: &[u8]) -> ThrottlerError {
        ThrottlerError::LockNotHeld {
            rule_id: rule_id.to_string(),
            entity: entity_hex(entity),
        }
    }
}
