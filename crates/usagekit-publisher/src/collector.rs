//! Collector publisher: scans the spool and uploads completed files.
//!
//! On a periodic beat (10 minutes by default) the publisher walks the
//! spool directory for `.trk` files. A file whose exclusive lock cannot
//! be taken is still being written by a tracker and is skipped — lock
//! contention is a benign signal here, never an error. A lockable file
//! is parsed, uploaded as a single [`LogRequest`] with a freshly built
//! meta-metric event at index 0, and deleted once the collector
//! accepts it. Deletion happens only after the lock is released;
//! deleting a locked file does not work on every platform.
//!
//! A failed upload ends the cycle and doubles the delay to the next
//! beat (capped at one day); any success resets the backoff and the
//! failure counters that the next meta-metric reports. Beats are a
//! self-rescheduling chain guarded by a schedule version, so
//! reconfiguration and close orphan stale chains instead of cancelling
//! running work.

use std::cmp;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fs2::FileExt;
use prost::Message as _;
use reqwest::Url;

use usagekit_core::date::{DateProvider, SystemDateProvider};
use usagekit_core::host_info;
use usagekit_core::scheduler::{ScheduledHandle, Scheduler};
use usagekit_core::settings::AnalyticsSettings;
use usagekit_core::wire::{
    ClientInfo, ClientType, DesktopClientInfo, EventCategory, EventKind, LogEvent, LogRequest,
    LogSource, MetaMetrics, UsageEvent,
};

use crate::{PublishError, Transport};

/// Address uploads go to unless the host overrides it.
pub const DEFAULT_SERVER_URL: &str = "https://play.google.com/log?format=raw";

/// Default delay between publish beats.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Ceiling on the backoff-stretched delay between beats.
const MAX_PUBLISH_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Spool file extension scanned for.
const TRACK_FILE_EXTENSION: &str = "trk";

struct PublishState {
    spool_dir: PathBuf,
    base_request: LogRequest,
    server_url: Url,
    transport: Arc<dyn Transport>,
    date_provider: Arc<dyn DateProvider>,
    publish_interval: Duration,
    publish_job: Option<ScheduledHandle>,
    schedule_version: u64,
    start_time_ms: i64,
    bytes_sent_in_last_publish: i64,
    failed_connections: i32,
    failed_server_replies: i32,
    backoff_ratio: u32,
}

/// Publishes spooled analytics to the collector.
pub struct CollectorPublisher {
    settings: AnalyticsSettings,
    scheduler: Arc<dyn Scheduler>,
    inner: Arc<Mutex<PublishState>>,
}

impl CollectorPublisher {
    /// Creates a publisher and schedules the first publish beat after
    /// the default interval.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP transport cannot be constructed or the
    /// default server URL does not parse.
    pub fn new(
        settings: AnalyticsSettings,
        scheduler: Arc<dyn Scheduler>,
        spool_dir: PathBuf,
    ) -> Result<Self, PublishError> {
        Self::new_with_date_provider(settings, scheduler, spool_dir, Arc::new(SystemDateProvider))
    }

    /// Creates a publisher reading time from the given provider; the
    /// provider's clock at construction becomes the uptime origin.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP transport cannot be constructed or the
    /// default server URL does not parse.
    pub fn new_with_date_provider(
        settings: AnalyticsSettings,
        scheduler: Arc<dyn Scheduler>,
        spool_dir: PathBuf,
        date_provider: Arc<dyn DateProvider>,
    ) -> Result<Self, PublishError> {
        let server_url = Url::parse(DEFAULT_SERVER_URL).map_err(|err| PublishError::Config {
            message: format!("default server url: {err}"),
        })?;
        let transport = crate::HttpTransport::new().map_err(|err| PublishError::Config {
            message: format!("building http transport: {err}"),
        })?;
        let start_time_ms = date_provider.now().timestamp_millis();
        let state = PublishState {
            spool_dir,
            base_request: base_request(&settings),
            server_url,
            transport: Arc::new(transport),
            date_provider,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            publish_job: None,
            schedule_version: 0,
            start_time_ms,
            bytes_sent_in_last_publish: 0,
            failed_connections: 0,
            failed_server_replies: 0,
            backoff_ratio: 1,
        };
        let publisher = Self {
            settings,
            scheduler,
            inner: Arc::new(Mutex::new(state)),
        };
        {
            let mut state = lock(&publisher.inner);
            let interval = state.publish_interval;
            schedule_publish_locked(&mut state, &publisher.inner, &publisher.scheduler, interval);
        }
        Ok(publisher)
    }

    /// The settings this publisher was installed with.
    #[must_use]
    pub fn settings(&self) -> &AnalyticsSettings {
        &self.settings
    }

    /// The delay between publish beats (before backoff stretching).
    #[must_use]
    pub fn publish_interval(&self) -> Duration {
        lock(&self.inner).publish_interval
    }

    /// Updates the publish interval and reschedules the pending beat.
    pub fn set_publish_interval(&self, interval: Duration) {
        let mut state = lock(&self.inner);
        state.publish_interval = interval;
        schedule_publish_locked(&mut state, &self.inner, &self.scheduler, interval);
    }

    /// The collector address uploads currently go to.
    #[must_use]
    pub fn server_url(&self) -> Url {
        lock(&self.inner).server_url.clone()
    }

    /// Points uploads at a different collector.
    ///
    /// # Errors
    ///
    /// Fails when `url` is not a valid URL; a malformed address is a
    /// host configuration error.
    pub fn set_server_url(&self, url: &str) -> Result<(), PublishError> {
        let parsed = Url::parse(url).map_err(|err| PublishError::Config {
            message: format!("server url {url:?}: {err}"),
        })?;
        lock(&self.inner).server_url = parsed;
        Ok(())
    }

    /// Replaces the transport used for uploads. Hosts plug in custom
    /// connection handling (e.g. proxies) here.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        lock(&self.inner).transport = transport;
    }

    /// Replaces the wall-clock source used for request timestamps.
    pub fn set_date_provider(&self, date_provider: Arc<dyn DateProvider>) {
        lock(&self.inner).date_provider = date_provider;
    }

    /// Stops future publish beats. A beat that is already running
    /// finishes its current upload. Safe to call repeatedly.
    pub fn close(&self) {
        let mut state = lock(&self.inner);
        state.schedule_version += 1;
        if let Some(job) = state.publish_job.take() {
            job.cancel();
        }
    }
}

fn lock(inner: &Arc<Mutex<PublishState>>) -> MutexGuard<'_, PublishState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The request template every upload is cloned from: client identity
/// and OS description never change within a process.
fn base_request(settings: &AnalyticsSettings) -> LogRequest {
    let os_full_version = host_info::os_full_version();
    LogRequest {
        client_info: Some(ClientInfo {
            client_type: ClientType::Desktop as i32,
            desktop_client_info: Some(DesktopClientInfo {
                logging_id: settings.user_id(),
                os: host_info::os_name(),
                os_major_version: host_info::major_version_of(&os_full_version)
                    .unwrap_or_default(),
                os_full_version,
            }),
        }),
        log_source: LogSource::DesktopToolSuite as i32,
        request_time_ms: 0,
        request_uptime_ms: 0,
        log_event: Vec::new(),
    }
}

/// (Re)arms the publish beat. Each call bumps the schedule version so
/// stale chains stop rearming; the delay stretches with the current
/// backoff ratio up to [`MAX_PUBLISH_DELAY`].
fn schedule_publish_locked(
    state: &mut PublishState,
    inner: &Arc<Mutex<PublishState>>,
    scheduler: &Arc<dyn Scheduler>,
    interval: Duration,
) {
    state.schedule_version += 1;
    let version = state.schedule_version;
    if let Some(job) = state.publish_job.take() {
        job.cancel();
    }
    let delay = cmp::min(interval * state.backoff_ratio, MAX_PUBLISH_DELAY);
    let task_inner = Arc::clone(inner);
    let task_scheduler = Arc::clone(scheduler);
    let handle = scheduler.schedule(
        delay,
        Box::new(move || {
            let mut state = lock(&task_inner);
            publish_queued(&mut state);
            // Only rearm while this chain is still the authority.
            if state.schedule_version == version {
                schedule_publish_locked(&mut state, &task_inner, &task_scheduler, interval);
            }
        }),
    );
    state.publish_job = Some(handle);
}

/// One publish beat: walk the spool and upload until done or a hard
/// failure ends the cycle.
fn publish_queued(state: &mut PublishState) {
    let entries = match std::fs::read_dir(&state.spool_dir) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::error!(%error, "failure reading analytics spool directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(TRACK_FILE_EXTENSION) {
            continue;
        }
        // A failed upload ends this cycle; the remaining files wait
        // for the next (backed-off) beat.
        if !try_publish(state, &path) {
            return;
        }
    }
}

/// Tries to upload one track file.
///
/// Returns `true` when the cycle may continue: the file was uploaded,
/// was empty, or was skipped because a writer still holds its lock.
/// Returns `false` on connection or server failures.
fn try_publish(state: &mut PublishState, path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(error) => return record_connection_failure(state, path, &error),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
            // A tracker is appending to this file; keep it for a later
            // cycle and move on.
            return true;
        }
        Err(error) => return record_connection_failure(state, path, &error),
    }

    let mut bytes = Vec::new();
    if let Err(error) = (&file).read_to_end(&mut bytes) {
        let _ = FileExt::unlock(&file);
        return record_connection_failure(state, path, &error);
    }
    let events = match usagekit_core::wire::read_delimited_events(&bytes) {
        Ok(events) => events,
        Err(error) => {
            let _ = FileExt::unlock(&file);
            return record_connection_failure(state, path, &error);
        }
    };

    let success = if events.is_empty() {
        // Nothing to upload; just drop the file.
        true
    } else {
        let now = state.date_provider.now().timestamp_millis();
        let mut log_event = Vec::with_capacity(events.len() + 1);
        log_event.push(meta_metric_event(state, now));
        log_event.extend(events);
        let request = LogRequest {
            request_time_ms: now,
            request_uptime_ms: now - state.start_time_ms,
            log_event,
            ..state.base_request.clone()
        };
        let body = request.encode_to_vec();
        let transport = Arc::clone(&state.transport);
        match transport.send(&state.server_url, &body) {
            Err(error) => {
                tracing::error!(%error, "failure publishing analytics, unable to connect to server");
                state.failed_connections += 1;
                state.backoff_ratio = state.backoff_ratio.saturating_mul(2);
                let _ = FileExt::unlock(&file);
                return false;
            }
            Ok(response) => {
                if let Some(bytes_sent) = response.bytes_sent {
                    state.bytes_sent_in_last_publish =
                        i64::try_from(bytes_sent).unwrap_or(i64::MAX);
                }
                if (200..300).contains(&response.status) {
                    // The file can go, and the backoff state resets.
                    state.backoff_ratio = 1;
                    state.failed_connections = 0;
                    state.failed_server_replies = 0;
                    true
                } else {
                    tracing::error!(
                        status = response.status,
                        message = %response.message,
                        "failure publishing metrics, server replied with an error"
                    );
                    state.failed_server_replies += 1;
                    state.backoff_ratio = state.backoff_ratio.saturating_mul(2);
                    false
                }
            }
        }
    };

    let _ = FileExt::unlock(&file);
    drop(file);
    // Delete outside the lock; in-lock deletion fails on some
    // platforms.
    if success {
        let _ = std::fs::remove_file(path);
    }
    success
}

fn record_connection_failure(state: &mut PublishState, path: &Path, error: &dyn std::fmt::Display) -> bool {
    tracing::error!(path = %path.display(), %error, "failure publishing analytics spool file");
    state.failed_connections += 1;
    state.backoff_ratio = state.backoff_ratio.saturating_mul(2);
    false
}

/// Builds the meta-metric event reporting the publisher's own health;
/// always the first event of an upload.
fn meta_metric_event(state: &PublishState, now_ms: i64) -> LogEvent {
    let event = UsageEvent {
        category: EventCategory::Meta as i32,
        kind: EventKind::MetaMetrics as i32,
        session_id: String::new(),
        meta_metrics: Some(MetaMetrics {
            bytes_sent_in_last_upload: state.bytes_sent_in_last_publish,
            failed_connections: state.failed_connections,
            failed_server_replies: state.failed_server_replies,
        }),
    };
    LogEvent {
        event_time_ms: now_ms,
        source_extension: event.encode_to_vec(),
    }
}
