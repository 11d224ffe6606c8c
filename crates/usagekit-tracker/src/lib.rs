//! # usagekit-tracker
//!
//! The write side of the analytics pipeline: hosts report usage events
//! through a [`UsageTracker`], which journals them to spool files that
//! the publisher uploads later. The tracker works for long-running
//! tools and short-lived command-line invocations alike; anything
//! durably spooled survives the process.
//!
//! Which variant a process gets is decided by the user's opt-in choice:
//! [`update_settings_and_tracker`] installs a [`JournalingTracker`] for
//! opted-in users and a [`NullTracker`] (accepts and discards) for
//! everyone else, so opted-out sessions never touch the spool
//! directory.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::Utc;
use prost::Message as _;
use thiserror::Error;
use uuid::Uuid;

use usagekit_core::paths;
use usagekit_core::scheduler::Scheduler;
use usagekit_core::settings::AnalyticsSettings;
use usagekit_core::wire::{LogEvent, UsageEvent};

mod journaling;
mod null;
#[cfg(test)]
pub(crate) mod testutil;

pub use journaling::JournalingTracker;
pub use null::NullTracker;

// =============================================================================
// Error type
// =============================================================================

/// Errors from tracker construction and spool writes.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Filesystem I/O failure.
    #[error("spool I/O error: {context}: {source}")]
    Io {
        /// Human-readable context for the error.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The spool file is already locked elsewhere.
    #[error("unable to lock usage spool file {}", path.display())]
    Lock {
        /// The file that could not be locked.
        path: PathBuf,
    },

    /// `log` was called after `close`; a programmer error.
    #[error("usage tracker already closed")]
    Closed,
}

impl TrackerError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// =============================================================================
// UsageTracker
// =============================================================================

/// A usage tracker: either the journaling implementation or the null
/// implementation installed for opted-out users.
///
/// The two variants expose the same operations; the null variant never
/// touches disk.
pub enum UsageTracker {
    /// Durable spool-backed tracker for opted-in users.
    Journaling(JournalingTracker),
    /// Accepts and discards all events.
    Null(NullTracker),
}

impl UsageTracker {
    /// Logs a usage event, stamping it with the process session id and
    /// the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Fails with [`TrackerError::Closed`] after [`close`](Self::close).
    pub fn log(&self, event: UsageEvent) -> Result<(), TrackerError> {
        let mut event = event;
        event.session_id = session_id().to_string();
        let log_event = LogEvent {
            event_time_ms: Utc::now().timestamp_millis(),
            source_extension: event.encode_to_vec(),
        };
        self.log_details(log_event)
    }

    /// Logs a fully built spool record. Prefer [`log`](Self::log);
    /// this entry point exists for hosts that stamp their own times.
    ///
    /// # Errors
    ///
    /// Fails with [`TrackerError::Closed`] after [`close`](Self::close).
    pub fn log_details(&self, event: LogEvent) -> Result<(), TrackerError> {
        match self {
            Self::Journaling(tracker) => tracker.log_details(event),
            Self::Null(tracker) => {
                tracker.log_details(event);
                Ok(())
            }
        }
    }

    /// The settings this tracker was installed with.
    #[must_use]
    pub fn settings(&self) -> &AnalyticsSettings {
        match self {
            Self::Journaling(tracker) => tracker.settings(),
            Self::Null(tracker) => tracker.settings(),
        }
    }

    /// The scheduler this tracker runs on, if any. The placeholder null
    /// tracker installed before [`initialize`] has none.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        match self {
            Self::Journaling(tracker) => Some(tracker.scheduler()),
            Self::Null(tracker) => tracker.scheduler(),
        }
    }

    /// Sets the number of records after which the active spool file
    /// rotates. Zero disables size-based rotation.
    pub fn set_max_journal_size(&self, max_size: u32) {
        if let Self::Journaling(tracker) = self {
            tracker.set_max_journal_size(max_size);
        }
    }

    /// Sets the time after which a non-empty active spool file rotates.
    /// Zero disables time-based rotation.
    pub fn set_max_journal_time(&self, max_time: Duration) {
        if let Self::Journaling(tracker) = self {
            tracker.set_max_journal_time(max_time);
        }
    }

    /// Closes the tracker: releases the active spool file and cancels
    /// pending rotation. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails when the active spool file cannot be released.
    pub fn close(&self) -> Result<(), TrackerError> {
        match self {
            Self::Journaling(tracker) => tracker.close(),
            Self::Null(_) => Ok(()),
        }
    }
}

// =============================================================================
// Process-wide lifecycle
// =============================================================================

static SESSION_ID: OnceLock<String> = OnceLock::new();

/// Random id identifying this process session; stamped on every event
/// logged through [`UsageTracker::log`].
#[must_use]
pub fn session_id() -> &'static str {
    SESSION_ID.get_or_init(|| Uuid::new_v4().to_string())
}

static INSTANCE: OnceLock<Mutex<Arc<UsageTracker>>> = OnceLock::new();

fn instance_cell() -> &'static Mutex<Arc<UsageTracker>> {
    INSTANCE.get_or_init(|| {
        Mutex::new(Arc::new(UsageTracker::Null(NullTracker::new(
            AnalyticsSettings::new(),
            None,
        ))))
    })
}

/// The tracker installed for this process. Never absent: before
/// [`initialize`] runs, a placeholder null tracker is installed.
#[must_use]
pub fn get_instance() -> Arc<UsageTracker> {
    instance_cell()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Installs the tracker matching the opt-in state of `settings`:
/// journaling when opted in, null otherwise.
///
/// # Errors
///
/// Fails when the journaling tracker cannot create and lock its first
/// spool file; this is fatal for the opted-in path.
pub fn initialize(
    settings: &AnalyticsSettings,
    scheduler: &Arc<dyn Scheduler>,
) -> Result<Arc<UsageTracker>, TrackerError> {
    let tracker = if settings.has_opted_in() {
        UsageTracker::Journaling(JournalingTracker::create(
            settings.clone(),
            Arc::clone(scheduler),
            paths::spool_directory(),
        )?)
    } else {
        UsageTracker::Null(NullTracker::new(settings.clone(), Some(Arc::clone(scheduler))))
    };
    let tracker = Arc::new(tracker);
    *instance_cell()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&tracker);
    Ok(tracker)
}

/// Records the user's opt-in choice, persists it, and swaps the
/// process-wide tracker to the matching variant.
///
/// Failures saving the settings or closing the previous tracker are
/// logged and do not abort the swap.
///
/// # Errors
///
/// Fails only when the replacement journaling tracker cannot be
/// constructed.
pub fn update_settings_and_tracker(
    opt_in: bool,
    scheduler: &Arc<dyn Scheduler>,
) -> Result<AnalyticsSettings, TrackerError> {
    let current = get_instance();
    let settings = AnalyticsSettings::get_instance();

    if opt_in != settings.has_opted_in() {
        settings.set_opted_in(opt_in);
        if let Err(error) = settings.save() {
            tracing::error!(%error, "unable to save analytics settings");
        }
    }
    if let Err(error) = current.close() {
        tracing::error!(%error, "unable to close existing usage tracker");
    }
    initialize(&settings, scheduler)?;
    Ok(settings)
}

/// Replaces the process-wide tracker, bypassing settings resolution.
pub fn set_instance_for_test(tracker: Arc<UsageTracker>) {
    *instance_cell()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = tracker;
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use usagekit_core::environment::fakes::EnvironmentOverride;
    use usagekit_core::scheduler::VirtualTimeScheduler;

    use crate::testutil::spool_details;

    use super::*;

    #[test]
    fn update_settings_and_tracker_swaps_variants() {
        let config_dir = TempDir::new().unwrap();
        let _guard = EnvironmentOverride::settings_home(config_dir.path());
        AnalyticsSettings::set_instance_for_test(None);
        set_instance_for_test(Arc::new(UsageTracker::Null(NullTracker::new(
            AnalyticsSettings::new(),
            None,
        ))));

        let before = get_instance();
        assert!(matches!(*before, UsageTracker::Null(_)));
        let settings_file = config_dir.path().join("analytics.settings");
        assert!(!settings_file.exists());

        let scheduler: Arc<dyn Scheduler> = Arc::new(VirtualTimeScheduler::new());

        // Opting out from scratch initializes settings and installs a
        // fresh null tracker.
        let settings1 = update_settings_and_tracker(false, &scheduler).unwrap();
        assert!(settings_file.exists());
        let after_first = get_instance();
        assert!(matches!(*after_first, UsageTracker::Null(_)));
        assert!(!Arc::ptr_eq(&before, &after_first));
        assert_eq!(&settings1, after_first.settings());
        assert!(!settings1.has_opted_in());
        assert!(after_first.scheduler().is_some_and(|s| Arc::ptr_eq(s, &scheduler)));

        // Opting in installs the journaling tracker.
        let settings2 = update_settings_and_tracker(true, &scheduler).unwrap();
        let after_second = get_instance();
        assert!(matches!(*after_second, UsageTracker::Journaling(_)));
        assert_eq!(&settings2, after_second.settings());
        assert!(settings2.has_opted_in());
        let spool_dir = paths::spool_directory();
        assert_eq!(spool_details(&spool_dir).locked_files.len(), 1);

        // Opting back out swaps to null and releases the spool file.
        let settings3 = update_settings_and_tracker(false, &scheduler).unwrap();
        let after_third = get_instance();
        assert!(matches!(*after_third, UsageTracker::Null(_)));
        assert_eq!(&settings3, after_third.settings());
        assert!(!settings3.has_opted_in());
        assert!(spool_details(&spool_dir).locked_files.is_empty());

        AnalyticsSettings::set_instance_for_test(None);
        set_instance_for_test(Arc::new(UsageTracker::Null(NullTracker::new(
            AnalyticsSettings::new(),
            None,
        ))));
    }

    #[test]
    fn session_id_is_a_stable_uuid() {
        let first = session_id();
        Uuid::parse_str(first).unwrap();
        assert_eq!(session_id(), first);
    }
}
