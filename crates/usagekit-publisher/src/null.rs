//! Null publisher installed when publishing must not happen.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use usagekit_core::scheduler::Scheduler;
use usagekit_core::settings::AnalyticsSettings;

use crate::collector::DEFAULT_PUBLISH_INTERVAL;

/// A publisher that never schedules work and never touches the network
/// or the spool directory. Installed for opted-out users and when
/// publishing is disabled for debugging.
pub struct NullPublisher {
    settings: AnalyticsSettings,
    scheduler: Option<Arc<dyn Scheduler>>,
    publish_interval: Mutex<Duration>,
}

impl NullPublisher {
    /// Creates a null publisher. The placeholder instance installed at
    /// process start has no scheduler.
    #[must_use]
    pub fn new(settings: AnalyticsSettings, scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self {
            settings,
            scheduler,
            publish_interval: Mutex::new(DEFAULT_PUBLISH_INTERVAL),
        }
    }

    /// The settings this publisher was installed with.
    #[must_use]
    pub fn settings(&self) -> &AnalyticsSettings {
        &self.settings
    }

    /// The scheduler this publisher was installed with, if any.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    /// The configured publish interval; retained so the setting
    /// survives an opt-in round trip, but nothing is ever scheduled.
    #[must_use]
    pub fn publish_interval(&self) -> Duration {
        *self
            .publish_interval
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the interval without scheduling anything.
    pub fn set_publish_interval(&self, interval: Duration) {
        *self
            .publish_interval
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = interval;
    }
}
