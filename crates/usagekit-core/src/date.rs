//! Wall-clock indirection.
//!
//! Components never read the system clock directly; they hold a
//! [`DateProvider`] so tests can pin time to a fixed date or derive it
//! from the virtual scheduler.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::scheduler::VirtualTimeScheduler;

/// Source of the current wall-clock time.
pub trait DateProvider: Send + Sync {
    /// Returns the current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDateProvider;

impl DateProvider for SystemDateProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A provider pinned to midnight UTC of a fixed calendar date.
#[derive(Debug, Clone, Copy)]
pub struct StubDateProvider {
    date: NaiveDate,
}

impl StubDateProvider {
    /// Creates a provider for the given date (1-based month and day).
    ///
    /// # Panics
    ///
    /// Panics when the arguments do not name a valid calendar date.
    #[must_use]
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        let date = NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date");
        Self { date }
    }
}

impl DateProvider for StubDateProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::new(self.date, NaiveTime::MIN))
    }
}

/// A provider that reads the current tick of a [`VirtualTimeScheduler`]
/// as time elapsed since the Unix epoch.
#[derive(Clone)]
pub struct VirtualTimeDateProvider {
    scheduler: Arc<VirtualTimeScheduler>,
}

impl VirtualTimeDateProvider {
    /// Creates a provider bound to the given scheduler.
    #[must_use]
    pub fn new(scheduler: Arc<VirtualTimeScheduler>) -> Self {
        Self { scheduler }
    }
}

impl DateProvider for VirtualTimeDateProvider {
    fn now(&self) -> DateTime<Utc> {
        let nanos = self.scheduler.current_time().as_nanos();
        DateTime::from_timestamp_nanos(i64::try_from(nanos).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn stub_provider_reports_midnight_of_its_date() {
        let provider = StubDateProvider::new(2016, 4, 18);
        let now = provider.now();
        assert_eq!(now.date_naive(), NaiveDate::from_ymd_opt(2016, 4, 18).unwrap());
        assert_eq!(now.timestamp() % 86_400, 0);
    }

    #[test]
    fn virtual_provider_follows_scheduler_clock() {
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let provider = VirtualTimeDateProvider::new(Arc::clone(&scheduler));
        assert_eq!(provider.now().timestamp_millis(), 0);
        scheduler.advance_by(Duration::from_secs(90));
        assert_eq!(provider.now().timestamp_millis(), 90_000);
    }
}
