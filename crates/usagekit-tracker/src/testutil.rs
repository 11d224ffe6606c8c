//! Test helpers: spool inspection and event construction.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use usagekit_core::wire::{self, EventCategory, EventKind, LogEvent, MetaMetrics, UsageEvent};

/// Classification of a spool directory: files still locked by a writer
/// versus completed files, with the parsed records of the latter.
#[derive(Debug, Default, Clone)]
pub(crate) struct SpoolDetails {
    pub locked_files: Vec<PathBuf>,
    pub completed_logs: BTreeMap<PathBuf, Vec<LogEvent>>,
}

/// Examines the spool directory the way the publisher does: try-lock
/// each `.trk` file, parse the ones whose lock we can take, and report
/// the rest as locked.
pub(crate) fn spool_details(spool_dir: &Path) -> SpoolDetails {
    let mut details = SpoolDetails::default();
    let entries = match std::fs::read_dir(spool_dir) {
        Ok(entries) => entries,
        Err(_) => return details,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("trk") {
            continue;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("spool file opens");
        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut bytes = Vec::new();
                (&file).read_to_end(&mut bytes).expect("spool file reads");
                let events = wire::read_delimited_events(&bytes).expect("spool file parses");
                let _ = FileExt::unlock(&file);
                details.completed_logs.insert(path, events);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                details.locked_files.push(path);
            }
            Err(e) => panic!("unexpected lock failure on {}: {e}", path.display()),
        }
    }
    details
}

/// Builds a usage event with a marker value so tests can tell events
/// apart after a round trip through the spool.
pub(crate) fn marker_event(marker: i64) -> UsageEvent {
    UsageEvent {
        category: EventCategory::Meta as i32,
        kind: EventKind::MetaMetrics as i32,
        session_id: String::new(),
        meta_metrics: Some(MetaMetrics {
            bytes_sent_in_last_upload: marker,
            failed_connections: 0,
            failed_server_replies: 0,
        }),
    }
}
