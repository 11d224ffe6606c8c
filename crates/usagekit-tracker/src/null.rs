//! Null tracker installed for opted-out users.

use std::sync::Arc;

use usagekit_core::scheduler::Scheduler;
use usagekit_core::settings::AnalyticsSettings;
use usagekit_core::wire::LogEvent;

/// A tracker that accepts and discards all events. It never touches the
/// spool directory, which is what makes opt-out absolute.
pub struct NullTracker {
    settings: AnalyticsSettings,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl NullTracker {
    /// Creates a null tracker. The placeholder instance installed at
    /// process start has no scheduler.
    #[must_use]
    pub fn new(settings: AnalyticsSettings, scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self {
            settings,
            scheduler,
        }
    }

    /// Discards the event.
    pub fn log_details(&self, _event: LogEvent) {}

    /// The settings this tracker was installed with.
    #[must_use]
    pub fn settings(&self) -> &AnalyticsSettings {
        &self.settings
    }

    /// The scheduler this tracker was installed with, if any.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }
}
