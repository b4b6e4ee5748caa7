use serde::Serialize;
use serde_json::{Map, Value};

use crate::bucket::{Buckets, NEVER};

const KEY_LAST_UPDATE: &str = "tm";
const KEY_HOUR_BUCKET: &str = "hr";
const KEY_DAY_BUCKET: &str = "dy";
const KEY_HOUR_COUNT: &str = "hc";
const KEY_DAY_COUNT: &str = "dc";
const KEY_LOCK_TOKEN: &str = "lk";
const KEY_LOCK_EPOCH: &str = "lt";

/// Persisted counters and lock state for one (rule, entity) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaRecord {
    #[serde(rename = "tm")]
    pub last_update: f64,
    #[serde(rename = "hr")]
    pub hour_bucket: i64,
    #[serde(rename = "dy")]
    pub day_bucket: i64,
    #[serde(rename = "hc")]
    pub hour_count: u64,
    #[serde(rename = "dc")]
    pub day_count: u64,
    #[serde(rename = "lk", skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    #[serde(rename = "lt")]
    pub lock_epoch: f64,
}

impl Default for QuotaRecord {
    fn default() -> Self {
        Self {
            last_update: 0.0,
            hour_bucket: NEVER,
            day_bucket: NEVER,
            hour_count: 0,
            day_count: 0,
            lock_token: None,
            lock_epoch: 0.0,
        }
    }
}

impl QuotaRecord {
    /// Zero-count record stamped with the given buckets.
    pub fn fresh(buckets: Buckets, now: f64) -> Self {
        Self {
            last_update: now,
            hour_bucket: buckets.hour,
            day_bucket: buckets.day,
            ..Self::default()
        }
    }

    /// Copy of this record with stale buckets reset.
    ///
    /// A new day resets both counters; a new hour within the same day resets
    /// only the hour counter.
    pub fn rolled_over(&self, buckets: Buckets) -> Self {
        let mut next = self.clone();
        if next.day_bucket < buckets.day {
            next.day_bucket = buckets.day;
            next.hour_bucket = buckets.hour;
            next.day_count = 0;
            next.hour_count = 0;
        } else if next.hour_bucket < buckets.hour {
            next.hour_bucket = buckets.hour;
            next.hour_count = 0;
        }
        next
    }

    pub fn is_lock_owned_by(&self, token: &str) -> bool {
        self.lock_token.as_deref() == Some(token)
    }

    pub fn clear_lock(&mut self) {
        self.lock_token = None;
        self.lock_epoch = 0.0;
    }
}

pub fn encode(record: &QuotaRecord) -> String {
    // Serializing a struct of plain numbers and strings cannot fail.
    serde_json::to_string(record).unwrap_or_else(|_| String::from("{}"))
}

/// Never fails on malformed fields; each falls back to its "never seen"
/// default. Input that is not a JSON object decodes to `None`.
pub fn decode(raw: &str) -> Option<QuotaRecord> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let fields = value.as_object()?;

    Some(QuotaRecord {
        last_update: float_field(fields, KEY_LAST_UPDATE).or(0.0),
        hour_bucket: int_field(fields, KEY_HOUR_BUCKET).or(NEVER),
        day_bucket: int_field(fields, KEY_DAY_BUCKET).or(NEVER),
        hour_count: count_field(fields, KEY_HOUR_COUNT).or(0),
        day_count: count_field(fields, KEY_DAY_COUNT).or(0),
        lock_token: text_field(fields, KEY_LOCK_TOKEN).into_option(),
        lock_epoch: float_field(fields, KEY_LOCK_EPOCH).or(0.0),
    })
}

/// Outcome of reading one field out of a decoded object.
#[derive(Debug, Clone, PartialEq)]
enum Field<T> {
    Present(T),
    Absent,
}

impl<T> Field<T> {
    fn from_option(value: Option<T>) -> Self {
        value.map_or(Field::Absent, Field::Present)
    }

    fn or(self, default: T) -> T {
        match self {
            Field::Present(value) => value,
            Field::Absent => default,
        }
    }

    fn into_option(self) -> Option<T> {
        match self {
            Field::Present(value) => Some(value),
            Field::Absent => None,
        }
    }
}

fn float_field(fields: &Map<String, Value>, key: &str) -> Field<f64> {
    Field::from_option(fields.get(key).and_then(Value::as_f64).filter(|v| v.is_finite()))
}

fn int_field(fields: &Map<String, Value>, key: &str) -> Field<i64> {
    Field::from_option(fields.get(key).and_then(Value::as_i64))
}

fn count_field(fields: &Map<String, Value>, key: &str) -> Field<u64> {
    Field::from_option(fields.get(key).and_then(Value::as_u64))
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Field<String> {
    Field::from_option(
        fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buckets(day: i64, hour_of_day: i64) -> Buckets {
        Buckets {
            day,
            hour: day * 24 + hour_of_day,
        }
    }

    #[test]
    fn test_encode_then_decode_preserves_lock() {
        let mut record = QuotaRecord::fresh(buckets(738_000, 17), 1_646_845_200.5);
        record.hour_count = 1;
        record.day_count = 2;
        record.lock_token = Some("holder-a".to_string());
        record.lock_epoch = 1_646_845_201.0;

        assert_eq!(decode(&encode(&record)), Some(record));
    }

    #[test]
    fn test_unlocked_record_omits_lock_token() {
        let encoded = encode(&QuotaRecord::fresh(buckets(1, 0), 0.0));
        assert!(!encoded.contains("\"lk\""));
    }

    #[test]
    fn test_garbage_decodes_to_absent() {
        assert_eq!(decode("junk"), None);
        assert_eq!(decode(""), None);
        assert_eq!(decode("[1, 2, 3]"), None);
        assert_eq!(decode("42"), None);
    }

    #[test]
    fn test_mistyped_fields_fall_back_to_defaults() {
        let raw = json!({"tm": null, "hr": "wot", "dy": 3, "dc": "many", "hc": -4}).to_string();
        let record = decode(&raw).unwrap();

        assert_eq!(record.last_update, 0.0);
        assert_eq!(record.hour_bucket, NEVER);
        assert_eq!(record.day_bucket, 3);
        assert_eq!(record.day_count, 0);
        assert_eq!(record.hour_count, 0);
        assert_eq!(record.lock_token, None);
    }

    #[test]
    fn test_renamed_and_unknown_fields_are_ignored() {
        let raw = json!({"tim": 1, "hr": 1, "dy": 3, "extra": {"nested": true}}).to_string();
        let record = decode(&raw).unwrap();

        assert_eq!(record.hour_bucket, 1);
        assert_eq!(record.day_bucket, 3);
        assert_eq!(record.last_update, 0.0);
    }

    #[test]
    fn test_empty_lock_token_means_unlocked() {
        let record = decode(&json!({"lk": "", "lt": 10.0}).to_string()).unwrap();
        assert_eq!(record.lock_token, None);
    }

    #[test]
    fn test_rollover_new_hour_keeps_day_count() {
        let mut record = QuotaRecord::fresh(buckets(10, 17), 0.0);
        record.hour_count = 1;
        record.day_count = 2;

        let next = record.rolled_over(buckets(10, 18));
        assert_eq!(next.hour_count, 0);
        assert_eq!(next.day_count, 2);
        assert_eq!(next.hour_bucket, buckets(10, 18).hour);
    }

    #[test]
    fn test_rollover_new_day_resets_both() {
        let mut record = QuotaRecord::fresh(buckets(10, 3), 0.0);
        record.hour_count = 1;
        record.day_count = 3;

        let next = record.rolled_over(buckets(11, 0));
        assert_eq!(next.hour_count, 0);
        assert_eq!(next.day_count, 0);
        assert_eq!((next.day_bucket, next.hour_bucket), (11, buckets(11, 0).hour));
    }

    #[test]
    fn test_rollover_current_buckets_is_identity() {
        let mut record = QuotaRecord::fresh(buckets(10, 3), 0.0);
        record.hour_count = 1;
        record.day_count = 1;

        assert_eq!(record.rolled_over(buckets(10, 3)), record);
    }
}
