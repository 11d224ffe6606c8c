//! # usagekit-publisher
//!
//! The upload side of the analytics pipeline: periodically scans the
//! spool directory trackers write to, uploads completed `.trk` files
//! to the collector over HTTPS, and deletes them once the collector
//! accepts them. Transient network and server failures back the
//! schedule off exponentially; nothing durably spooled is lost.
//!
//! Like the tracker, the publisher comes in two variants selected by
//! the user's opt-in state (plus a debug switch): the real
//! [`CollectorPublisher`] and a [`NullPublisher`] that never schedules
//! work, so opted-out sessions generate no network traffic at all.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use thiserror::Error;

use usagekit_core::paths;
use usagekit_core::scheduler::Scheduler;
use usagekit_core::settings::AnalyticsSettings;

mod collector;
mod null;
mod transport;

pub use collector::{CollectorPublisher, DEFAULT_PUBLISH_INTERVAL, DEFAULT_SERVER_URL};
pub use null::NullPublisher;
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};

// =============================================================================
// Error type
// =============================================================================

/// Errors from publisher construction and configuration.
///
/// Upload failures never surface here: the publisher absorbs them into
/// its backoff state and retries on a later beat.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Host-supplied configuration is invalid (malformed URL, broken
    /// transport); a programmer error.
    #[error("invalid publisher configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },
}

// =============================================================================
// AnalyticsPublisher
// =============================================================================

/// A publisher: either the collector implementation or the null
/// implementation installed when publishing must not happen.
pub enum AnalyticsPublisher {
    /// Uploads spooled events to the collector.
    Collector(CollectorPublisher),
    /// Publishes nothing.
    Null(NullPublisher),
}

impl AnalyticsPublisher {
    /// The settings this publisher was installed with.
    #[must_use]
    pub fn settings(&self) -> &AnalyticsSettings {
        match self {
            Self::Collector(publisher) => publisher.settings(),
            Self::Null(publisher) => publisher.settings(),
        }
    }

    /// The delay between publish beats.
    #[must_use]
    pub fn publish_interval(&self) -> Duration {
        match self {
            Self::Collector(publisher) => publisher.publish_interval(),
            Self::Null(publisher) => publisher.publish_interval(),
        }
    }

    /// Updates the publish interval, rescheduling the pending beat on
    /// the collector variant.
    pub fn set_publish_interval(&self, interval: Duration) {
        match self {
            Self::Collector(publisher) => publisher.set_publish_interval(interval),
            Self::Null(publisher) => publisher.set_publish_interval(interval),
        }
    }

    /// Stops future publish beats. Safe to call repeatedly.
    pub fn close(&self) {
        if let Self::Collector(publisher) = self {
            publisher.close();
        }
    }
}

// =============================================================================
// Process-wide lifecycle
// =============================================================================

static INSTANCE: OnceLock<Mutex<Arc<AnalyticsPublisher>>> = OnceLock::new();

fn instance_cell() -> &'static Mutex<Arc<AnalyticsPublisher>> {
    INSTANCE.get_or_init(|| {
        Mutex::new(Arc::new(AnalyticsPublisher::Null(NullPublisher::new(
            AnalyticsSettings::new(),
            None,
        ))))
    })
}

/// The publisher installed for this process. Never absent: before
/// [`initialize`] runs, a placeholder null publisher is installed.
#[must_use]
pub fn get_instance() -> Arc<AnalyticsPublisher> {
    instance_cell()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Installs the publisher matching `settings`: the collector variant
/// for opted-in users, unless publishing is disabled for debugging;
/// the null variant otherwise.
///
/// # Errors
///
/// Fails when the collector publisher cannot be constructed.
pub fn initialize(
    settings: &AnalyticsSettings,
    scheduler: &Arc<dyn Scheduler>,
) -> Result<Arc<AnalyticsPublisher>, PublishError> {
    let publisher = if settings.has_opted_in() && !settings.debug_disable_publishing() {
        AnalyticsPublisher::Collector(CollectorPublisher::new(
            settings.clone(),
            Arc::clone(scheduler),
            paths::spool_directory(),
        )?)
    } else {
        AnalyticsPublisher::Null(NullPublisher::new(
            settings.clone(),
            Some(Arc::clone(scheduler)),
        ))
    };
    let publisher = Arc::new(publisher);
    *instance_cell()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&publisher);
    Ok(publisher)
}

/// Closes the current publisher and installs a fresh one matching
/// `settings`. Close failures cannot happen (close is infallible), so
/// the swap always proceeds.
///
/// # Errors
///
/// Fails when the replacement collector publisher cannot be
/// constructed.
pub fn update_publisher(
    settings: &AnalyticsSettings,
    scheduler: &Arc<dyn Scheduler>,
) -> Result<Arc<AnalyticsPublisher>, PublishError> {
    get_instance().close();
    initialize(settings, scheduler)
}

/// Replaces the process-wide publisher, bypassing settings resolution.
pub fn set_instance_for_test(publisher: Arc<AnalyticsPublisher>) {
    *instance_cell()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = publisher;
}
