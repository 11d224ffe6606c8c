//! Journaling tracker: durable, append-only, rotating spool writer.
//!
//! Events are written length-delimited to an *active* spool file named
//! `<uuid>.trk`, held under a non-blocking exclusive file lock for as
//! long as it is active. Releasing the lock is what completes a file:
//! the publisher detects activity purely by lock-acquisition failure,
//! so a record is flushed and synced to disk before the lock can ever
//! be released.
//!
//! Rotation closes the active file and immediately opens a fresh one,
//! triggered by a record-count limit, by a timeout on non-empty files,
//! or by [`JournalingTracker::close`]. The timeout is a
//! self-rescheduling chain: each (re)configuration bumps a schedule
//! version, and a fired task only rearms itself while its captured
//! version is still current, which orphans stale chains without
//! cancelling mid-execution work.
//!
//! All writes happen on the tracker's scheduler. Write failures inside
//! a scheduled task are not recoverable by the caller and surface as
//! panics into the scheduler's uncaught-error path; the tracker never
//! retries or silently drops a record.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fs2::FileExt;
use uuid::Uuid;

use usagekit_core::scheduler::Scheduler;
use usagekit_core::settings::AnalyticsSettings;
use usagekit_core::wire::{self, LogEvent};

use crate::TrackerError;

/// Spool file extension.
const TRACK_FILE_EXTENSION: &str = "trk";

struct ActiveSpoolFile {
    file: File,
    path: PathBuf,
}

struct Journal {
    spool_dir: PathBuf,
    active: Option<ActiveSpoolFile>,
    current_count: u32,
    max_journal_size: u32,
    max_journal_time: Duration,
    timeout: Option<usagekit_core::scheduler::ScheduledHandle>,
    schedule_version: u64,
    closed: bool,
}

impl Journal {
    /// Creates a new track file with a random name and locks it for
    /// writing.
    fn open_track_file(&mut self) -> Result<(), TrackerError> {
        let path = self
            .spool_dir
            .join(format!("{}.{TRACK_FILE_EXTENSION}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TrackerError::io(format!("opening spool file {}", path.display()), e))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(TrackerError::Lock { path });
            }
            Err(e) => {
                return Err(TrackerError::io(
                    format!("locking spool file {}", path.display()),
                    e,
                ));
            }
        }
        self.active = Some(ActiveSpoolFile { file, path });
        self.current_count = 0;
        Ok(())
    }

    /// Releases and closes the active track file. Safe to call when
    /// none is open.
    fn close_track_file(&mut self) -> Result<(), TrackerError> {
        if let Some(active) = self.active.take() {
            FileExt::unlock(&active.file).map_err(|e| {
                TrackerError::io(format!("unlocking spool file {}", active.path.display()), e)
            })?;
        }
        Ok(())
    }

    /// Completes the active track file and opens a fresh one. Runs
    /// inside scheduled tasks, where a rotation failure is fatal.
    fn switch_track_file(&mut self) {
        if let Err(error) = self
            .close_track_file()
            .and_then(|()| self.open_track_file())
        {
            panic!("failure switching to new usage spool file: {error}");
        }
    }
}

/// A tracker that journals events to locked, rotating spool files.
pub struct JournalingTracker {
    settings: AnalyticsSettings,
    scheduler: Arc<dyn Scheduler>,
    inner: Arc<Mutex<Journal>>,
}

impl JournalingTracker {
    /// Creates the tracker: ensures the spool directory exists and
    /// opens and locks the first track file.
    ///
    /// # Errors
    ///
    /// Fails when the spool directory cannot be created or the first
    /// track file cannot be opened and locked.
    pub fn create(
        settings: AnalyticsSettings,
        scheduler: Arc<dyn Scheduler>,
        spool_dir: PathBuf,
    ) -> Result<Self, TrackerError> {
        std::fs::create_dir_all(&spool_dir).map_err(|e| {
            TrackerError::io(format!("creating spool directory {}", spool_dir.display()), e)
        })?;
        let mut journal = Journal {
            spool_dir,
            active: None,
            current_count: 0,
            max_journal_size: 0,
            max_journal_time: Duration::ZERO,
            timeout: None,
            schedule_version: 0,
            closed: false,
        };
        journal.open_track_file()?;
        Ok(Self {
            settings,
            scheduler,
            inner: Arc::new(Mutex::new(journal)),
        })
    }

    /// The settings this tracker was installed with.
    #[must_use]
    pub fn settings(&self) -> &AnalyticsSettings {
        &self.settings
    }

    /// The scheduler all spool writes run on.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Submits a record for writing to the active spool file.
    ///
    /// The write itself happens on the scheduler; submission order is
    /// write order.
    ///
    /// # Errors
    ///
    /// Fails with [`TrackerError::Closed`] after [`close`](Self::close).
    pub fn log_details(&self, event: LogEvent) -> Result<(), TrackerError> {
        if lock(&self.inner).closed {
            return Err(TrackerError::Closed);
        }
        let inner = Arc::clone(&self.inner);
        let scheduler = Arc::clone(&self.scheduler);
        self.scheduler.submit(Box::new(move || {
            write_event(&inner, &scheduler, &event);
        }));
        Ok(())
    }

    /// Sets the record count at which the active file rotates. Zero
    /// disables size-based rotation. Takes effect on the next write.
    pub fn set_max_journal_size(&self, max_size: u32) {
        lock(&self.inner).max_journal_size = max_size;
    }

    /// Sets the timeout after which a non-empty active file rotates,
    /// replacing any previously scheduled timeout. Zero disables
    /// time-based rotation.
    pub fn set_max_journal_time(&self, max_time: Duration) {
        let mut journal = lock(&self.inner);
        journal.max_journal_time = max_time;
        schedule_timeout_locked(&mut journal, &self.inner, &self.scheduler, max_time);
    }

    /// Closes the tracker: completes the active spool file, cancels
    /// the rotation timeout and rejects further logging. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails when the active spool file cannot be released.
    pub fn close(&self) -> Result<(), TrackerError> {
        let mut journal = lock(&self.inner);
        journal.closed = true;
        journal.schedule_version += 1;
        if let Some(timeout) = journal.timeout.take() {
            timeout.cancel();
        }
        journal.close_track_file()
    }
}

fn lock(inner: &Arc<Mutex<Journal>>) -> MutexGuard<'_, Journal> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduled write path. Failures here are fatal: the panic reaches
/// the scheduler's uncaught-error handling rather than losing records
/// silently.
fn write_event(inner: &Arc<Mutex<Journal>>, scheduler: &Arc<dyn Scheduler>, event: &LogEvent) {
    let mut journal = lock(inner);
    {
        let Some(active) = journal.active.as_mut() else {
            panic!("usage tracker spool file closed with writes pending");
        };
        if let Err(error) = write_record(&mut active.file, event) {
            panic!("failure writing event to usage spool file: {error}");
        }
    }
    journal.current_count += 1;
    if journal.max_journal_size > 0 && journal.current_count >= journal.max_journal_size {
        journal.switch_track_file();
        if journal.timeout.is_some() {
            // The spool file just rotated; restart the journal timeout.
            let delay = journal.max_journal_time;
            schedule_timeout_locked(&mut journal, inner, scheduler, delay);
        }
    }
}

fn write_record(file: &mut File, event: &LogEvent) -> io::Result<()> {
    wire::write_delimited(file, event)?;
    file.flush()?;
    file.sync_data()
}

/// (Re)arms the rotation timeout. Each call bumps the schedule version
/// so previously armed chains stop rearming themselves; a zero delay
/// only cancels.
fn schedule_timeout_locked(
    journal: &mut Journal,
    inner: &Arc<Mutex<Journal>>,
    scheduler: &Arc<dyn Scheduler>,
    delay: Duration,
) {
    journal.schedule_version += 1;
    let version = journal.schedule_version;
    if let Some(previous) = journal.timeout.take() {
        previous.cancel();
    }
    if delay.is_zero() {
        return;
    }
    let task_inner = Arc::clone(inner);
    let task_scheduler = Arc::clone(scheduler);
    let handle = scheduler.schedule(
        delay,
        Box::new(move || {
            let mut journal = lock(&task_inner);
            if journal.current_count > 0 {
                journal.switch_track_file();
            }
            // Only rearm while this chain is still the authority.
            if journal.schedule_version == version {
                schedule_timeout_locked(&mut journal, &task_inner, &task_scheduler, delay);
            }
        }),
    );
    journal.timeout = Some(handle);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use prost::Message as _;
    use tempfile::TempDir;

    use usagekit_core::scheduler::{Scheduler, VirtualTimeScheduler};
    use usagekit_core::wire::UsageEvent;

    use crate::testutil::{marker_event, spool_details};
    use crate::{session_id, UsageTracker};

    use super::*;

    fn new_tracker(spool_dir: &TempDir, scheduler: &Arc<VirtualTimeScheduler>) -> UsageTracker {
        let scheduler: Arc<dyn Scheduler> = scheduler.clone();
        UsageTracker::Journaling(
            JournalingTracker::create(
                AnalyticsSettings::new(),
                scheduler,
                spool_dir.path().to_path_buf(),
            )
            .unwrap(),
        )
    }

    fn stamped(event: UsageEvent) -> UsageEvent {
        UsageEvent {
            session_id: session_id().to_string(),
            ..event
        }
    }

    fn decode_usage(log_event: &LogEvent) -> UsageEvent {
        UsageEvent::decode(log_event.source_extension.as_slice()).unwrap()
    }

    #[test]
    fn tracker_basic_write_and_close() {
        let spool_dir = TempDir::new().unwrap();
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let tracker = new_tracker(&spool_dir, &scheduler);

        let logged = marker_event(42);
        tracker.log(logged.clone()).unwrap();
        assert_eq!(scheduler.actions_queued(), 1);
        scheduler.advance_by(Duration::ZERO);
        assert_eq!(scheduler.actions_queued(), 0);

        // The write went to the still-locked spool file.
        let before_close = spool_details(spool_dir.path());
        assert_eq!(before_close.locked_files.len(), 1);
        assert_eq!(before_close.completed_logs.len(), 0);

        tracker.close().unwrap();

        // Closing released the spool file without opening a new one.
        let after_close = spool_details(spool_dir.path());
        assert_eq!(after_close.locked_files.len(), 0);
        assert_eq!(after_close.completed_logs.len(), 1);
        for events in after_close.completed_logs.values() {
            assert_eq!(events.len(), 1);
            assert_eq!(decode_usage(&events[0]), stamped(logged.clone()));
        }
    }

    #[test]
    fn tracker_timeout_rotation() {
        let spool_dir = TempDir::new().unwrap();
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let tracker = new_tracker(&spool_dir, &scheduler);

        tracker.set_max_journal_time(Duration::from_secs(60));
        assert_eq!(scheduler.actions_queued(), 1);

        let logged1 = marker_event(22);
        tracker.log(logged1.clone()).unwrap();
        scheduler.advance_by(Duration::ZERO);

        let before_timeout = spool_details(spool_dir.path());
        assert_eq!(before_timeout.locked_files.len(), 1);
        assert_eq!(before_timeout.completed_logs.len(), 0);

        // The timeout completes the non-empty file and rearms itself.
        assert_eq!(scheduler.advance_by(Duration::from_secs(60)), 1);
        assert_eq!(scheduler.actions_queued(), 1);

        let after_timeout = spool_details(spool_dir.path());
        assert_eq!(after_timeout.locked_files.len(), 1);
        assert_eq!(after_timeout.completed_logs.len(), 1);
        for events in after_timeout.completed_logs.values() {
            assert_eq!(events.len(), 1);
            assert_eq!(decode_usage(&events[0]), stamped(logged1.clone()));
        }

        let logged2 = marker_event(33);
        tracker.log(logged2.clone()).unwrap();
        scheduler.advance_by(Duration::ZERO);
        tracker.close().unwrap();

        assert_eq!(scheduler.actions_executed(), 3);
        assert_eq!(scheduler.actions_queued(), 0);

        // Two completed files whose union is both events.
        let after_close = spool_details(spool_dir.path());
        assert_eq!(after_close.locked_files.len(), 0);
        assert_eq!(after_close.completed_logs.len(), 2);
        let mut remaining = after_close.completed_logs.clone();
        for (path, events) in &after_timeout.completed_logs {
            assert_eq!(remaining.remove(path).as_ref(), Some(events));
        }
        for events in remaining.values() {
            assert_eq!(events.len(), 1);
            assert_eq!(decode_usage(&events[0]), stamped(logged2.clone()));
        }

        // Closing again is a no-op.
        tracker.close().unwrap();
    }

    #[test]
    fn idle_timeout_does_not_create_empty_files() {
        let spool_dir = TempDir::new().unwrap();
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let tracker = new_tracker(&spool_dir, &scheduler);

        tracker.set_max_journal_time(Duration::from_secs(60));
        assert_eq!(scheduler.actions_queued(), 1);

        let before_timeout = spool_details(spool_dir.path());
        assert_eq!(before_timeout.locked_files.len(), 1);
        assert_eq!(before_timeout.completed_logs.len(), 0);

        assert_eq!(scheduler.advance_by(Duration::from_secs(60)), 1);
        assert_eq!(scheduler.actions_queued(), 1);

        // Nothing was logged, so the timeout produced no completed file.
        let after_timeout = spool_details(spool_dir.path());
        assert_eq!(after_timeout.locked_files.len(), 1);
        assert_eq!(after_timeout.completed_logs.len(), 0);

        tracker.close().unwrap();
    }

    #[test]
    fn tracker_size_rotation() {
        let spool_dir = TempDir::new().unwrap();
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let tracker = new_tracker(&spool_dir, &scheduler);

        tracker.set_max_journal_size(3);
        assert_eq!(scheduler.actions_queued(), 0);

        let events: Vec<UsageEvent> = (1..=5).map(marker_event).collect();
        for event in &events[..2] {
            tracker.log(event.clone()).unwrap();
            scheduler.advance_by(Duration::ZERO);
        }

        // Below the limit: one locked file, nothing completed.
        let before_max = spool_details(spool_dir.path());
        assert_eq!(before_max.locked_files.len(), 1);
        assert_eq!(before_max.completed_logs.len(), 0);

        tracker.log(events[2].clone()).unwrap();
        scheduler.advance_by(Duration::ZERO);

        // Hitting the limit completed the file and locked a fresh one.
        let after_max = spool_details(spool_dir.path());
        assert_eq!(after_max.locked_files.len(), 1);
        assert_eq!(after_max.completed_logs.len(), 1);
        for file_events in after_max.completed_logs.values() {
            assert_eq!(file_events.len(), 3);
            for (decoded, expected) in file_events.iter().zip(&events[..3]) {
                assert_eq!(decode_usage(decoded), stamped(expected.clone()));
            }
        }

        for event in &events[3..] {
            tracker.log(event.clone()).unwrap();
            scheduler.advance_by(Duration::ZERO);
        }
        tracker.close().unwrap();

        // Two completed files: the first three events, then the rest.
        let after_close = spool_details(spool_dir.path());
        assert_eq!(after_close.locked_files.len(), 0);
        assert_eq!(after_close.completed_logs.len(), 2);
        let mut remaining = after_close.completed_logs.clone();
        for (path, file_events) in &after_max.completed_logs {
            assert_eq!(remaining.remove(path).as_ref(), Some(file_events));
        }
        for file_events in remaining.values() {
            assert_eq!(file_events.len(), 2);
            for (decoded, expected) in file_events.iter().zip(&events[3..]) {
                assert_eq!(decode_usage(decoded), stamped(expected.clone()));
            }
        }
    }

    #[test]
    fn updating_the_timeout_orphans_the_old_chain() {
        let spool_dir = TempDir::new().unwrap();
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let tracker = new_tracker(&spool_dir, &scheduler);

        tracker.log(marker_event(1)).unwrap();
        scheduler.advance_by(Duration::ZERO);

        tracker.set_max_journal_time(Duration::from_secs(60));
        assert_eq!(scheduler.actions_executed(), 1);
        assert_eq!(scheduler.actions_queued(), 1);

        // Not yet due.
        scheduler.advance_by(Duration::from_secs(30));
        assert_eq!(scheduler.actions_executed(), 1);
        assert_eq!(scheduler.actions_queued(), 1);

        // Re-setting the timeout replaces the pending rotation.
        tracker.set_max_journal_time(Duration::from_secs(60));
        assert_eq!(scheduler.actions_executed(), 1);
        assert_eq!(scheduler.actions_queued(), 1);

        // The original deadline passes without firing.
        scheduler.advance_by(Duration::from_secs(30));
        assert_eq!(scheduler.actions_executed(), 1);
        assert_eq!(scheduler.actions_queued(), 1);

        // The replacement deadline fires.
        scheduler.advance_by(Duration::from_secs(30));
        assert_eq!(scheduler.actions_executed(), 2);
        assert_eq!(scheduler.actions_queued(), 1);

        let after_timeout = spool_details(spool_dir.path());
        assert_eq!(after_timeout.locked_files.len(), 1);
        assert_eq!(after_timeout.completed_logs.len(), 1);

        tracker.close().unwrap();
    }

    #[test]
    fn zero_timeout_disables_rotation() {
        let spool_dir = TempDir::new().unwrap();
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let tracker = new_tracker(&spool_dir, &scheduler);

        tracker.set_max_journal_time(Duration::from_secs(60));
        assert_eq!(scheduler.actions_queued(), 1);
        tracker.set_max_journal_time(Duration::ZERO);
        assert_eq!(scheduler.actions_queued(), 0);

        tracker.log(marker_event(9)).unwrap();
        scheduler.advance_by(Duration::ZERO);
        scheduler.advance_by(Duration::from_secs(3600));
        let details = spool_details(spool_dir.path());
        assert_eq!(details.locked_files.len(), 1);
        assert_eq!(details.completed_logs.len(), 0);

        tracker.close().unwrap();
    }

    #[test]
    fn log_after_close_is_rejected() {
        let spool_dir = TempDir::new().unwrap();
        let scheduler = Arc::new(VirtualTimeScheduler::new());
        let tracker = new_tracker(&spool_dir, &scheduler);

        tracker.close().unwrap();
        let error = tracker.log(marker_event(1)).unwrap_err();
        assert!(matches!(error, TrackerError::Closed));
    }
}
