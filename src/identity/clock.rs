//! Calendar source for daily quota resets.

use chrono::NaiveDate;
use std::sync::Mutex;

/// Source of the current local date
pub trait Clock: Send + Sync {
    /// Today's date in local time
    fn today(&self) -> NaiveDate;

    /// Unix timestamp of today's local midnight
    fn midnight_timestamp(&self) -> i64 {
        self.today()
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| midnight.and_local_timezone(chrono::Local).earliest())
            .map(|midnight| midnight.timestamp())
            .unwrap_or(0)
    }
}

/// Wall clock in the local timezone
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Manually driven clock, for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    /// Start at the given date
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    /// Move forward by whole days
    pub fn advance_days(&self, days: u64) {
        if let Ok(mut today) = self.today.lock() {
            *today = *today + chrono::Days::new(days);
        }
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        match self.today.lock() {
            Ok(today) => *today,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
