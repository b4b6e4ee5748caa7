use chrono::{DateTime, Datelike, Local, Timelike};

/// Bucket value for records that never observed a real window.
pub const NEVER: i64 = i64::MIN;

/// Local-calendar day and absolute hour index (`day * 24 + hour`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buckets {
    pub day: i64,
    pub hour: i64,
}

impl Buckets {
    pub fn at(instant: &DateTime<Local>) -> Self {
        let day = i64::from(instant.num_days_from_ce());
        let hour = day * 24 + i64::from(instant.hour());
        Self { day, hour }
    }
}
