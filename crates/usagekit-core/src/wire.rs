//! Wire format for spool records and collector uploads.
//!
//! Spool files are sequences of length-delimited [`LogEvent`] messages
//! (varint length prefix, then the message bytes), the streaming
//! framing protobuf defines for appending records to a file. Uploads
//! are a single [`LogRequest`] carrying the client description and the
//! spooled events, with the publisher's meta-metric event prepended.
//!
//! The payload of a [`LogEvent`] is opaque to the spool machinery: the
//! tracker writes whatever bytes the host serialized. [`UsageEvent`] is
//! the envelope hosts (and the publisher's meta-metric) encode into
//! that payload.

use std::io::{self, Write};

use prost::bytes::Buf;
use prost::Message;

/// One spooled record: a timestamp plus the serialized host event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEvent {
    /// Wall-clock time the event was logged, in milliseconds since the
    /// Unix epoch.
    #[prost(int64, tag = "1")]
    pub event_time_ms: i64,
    /// Serialized host event, typically a [`UsageEvent`].
    #[prost(bytes = "vec", tag = "2")]
    pub source_extension: Vec<u8>,
}

/// Health counters describing the publisher itself, shipped as the
/// first event of every upload.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct MetaMetrics {
    /// Size in bytes of the last upload that reached the collector.
    #[prost(int64, tag = "1")]
    pub bytes_sent_in_last_upload: i64,
    /// Consecutive uploads that failed to establish a connection.
    #[prost(int32, tag = "2")]
    pub failed_connections: i32,
    /// Consecutive uploads the collector rejected with a non-2xx reply.
    #[prost(int32, tag = "3")]
    pub failed_server_replies: i32,
}

/// Category of a [`UsageEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventCategory {
    /// Unclassified.
    UnknownCategory = 0,
    /// Events about the analytics pipeline itself.
    Meta = 1,
    /// Liveness pings from the host tool.
    Ping = 2,
}

/// Kind of a [`UsageEvent`], refining its category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventKind {
    /// Unclassified.
    UnknownKind = 0,
    /// Publisher health counters.
    MetaMetrics = 1,
    /// Liveness ping.
    ToolPing = 2,
}

/// The event envelope hosts log through the tracker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UsageEvent {
    /// Event category.
    #[prost(enumeration = "EventCategory", tag = "1")]
    pub category: i32,
    /// Event kind.
    #[prost(enumeration = "EventKind", tag = "2")]
    pub kind: i32,
    /// Random id of the host process session that logged the event.
    #[prost(string, tag = "3")]
    pub session_id: ::prost::alloc::string::String,
    /// Publisher health counters, set on meta-metric events only.
    #[prost(message, optional, tag = "4")]
    pub meta_metrics: ::core::option::Option<MetaMetrics>,
}

/// Client type carried in [`ClientInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClientType {
    /// Unclassified client.
    UnknownClient = 0,
    /// A desktop development tool.
    Desktop = 1,
}

/// Log stream the collector files uploads under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum LogSource {
    /// Unclassified source.
    UnknownSource = 0,
    /// The desktop tool suite; every upload from this pipeline uses it.
    DesktopToolSuite = 1,
}

/// Description of a desktop client, sent with every upload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DesktopClientInfo {
    /// Pseudo-anonymous user id from the settings store.
    #[prost(string, tag = "1")]
    pub logging_id: ::prost::alloc::string::String,
    /// Normalized operating system name.
    #[prost(string, tag = "2")]
    pub os: ::prost::alloc::string::String,
    /// Major OS version in `major.minor` form.
    #[prost(string, tag = "3")]
    pub os_major_version: ::prost::alloc::string::String,
    /// Full OS version string.
    #[prost(string, tag = "4")]
    pub os_full_version: ::prost::alloc::string::String,
}

/// Client description envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientInfo {
    /// The kind of client uploading.
    #[prost(enumeration = "ClientType", tag = "1")]
    pub client_type: i32,
    /// Desktop-specific details.
    #[prost(message, optional, tag = "2")]
    pub desktop_client_info: ::core::option::Option<DesktopClientInfo>,
}

/// One upload to the collector: the contents of a single spool file
/// plus client and timing metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogRequest {
    /// Description of the uploading client.
    #[prost(message, optional, tag = "1")]
    pub client_info: ::core::option::Option<ClientInfo>,
    /// Log stream the upload is filed under.
    #[prost(enumeration = "LogSource", tag = "2")]
    pub log_source: i32,
    /// Wall-clock time of the upload, in milliseconds since epoch.
    #[prost(int64, tag = "3")]
    pub request_time_ms: i64,
    /// Milliseconds since the publisher started.
    #[prost(int64, tag = "4")]
    pub request_uptime_ms: i64,
    /// The spooled events, meta-metric first.
    #[prost(message, repeated, tag = "5")]
    pub log_event: Vec<LogEvent>,
}

/// Appends one length-delimited [`LogEvent`] record to `writer`.
///
/// The record is written in full or not at all from the caller's point
/// of view; callers flush and sync before releasing the spool lock.
///
/// # Errors
///
/// Returns any I/O error from the underlying writer.
pub fn write_delimited<W: Write>(writer: &mut W, event: &LogEvent) -> io::Result<()> {
    let buf = event.encode_length_delimited_to_vec();
    writer.write_all(&buf)
}

/// Decodes every length-delimited [`LogEvent`] record in `bytes`.
///
/// # Errors
///
/// Returns a decode error when the buffer ends inside a record or a
/// record is not a valid message; completed spool files never contain
/// partial trailing records.
pub fn read_delimited_events(bytes: &[u8]) -> Result<Vec<LogEvent>, prost::DecodeError> {
    let mut buf = bytes;
    let mut events = Vec::new();
    while buf.has_remaining() {
        events.push(LogEvent::decode_length_delimited(&mut buf)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_event(marker: i64) -> LogEvent {
        let usage = UsageEvent {
            category: EventCategory::Ping as i32,
            kind: EventKind::ToolPing as i32,
            session_id: "session".to_string(),
            meta_metrics: Some(MetaMetrics {
                bytes_sent_in_last_upload: marker,
                failed_connections: 0,
                failed_server_replies: 0,
            }),
        };
        LogEvent {
            event_time_ms: marker,
            source_extension: usage.encode_to_vec(),
        }
    }

    #[test]
    fn delimited_records_round_trip_in_order() {
        let events: Vec<LogEvent> = (1..=3).map(ping_event).collect();
        let mut spool = Vec::new();
        for event in &events {
            write_delimited(&mut spool, event).unwrap();
        }
        let decoded = read_delimited_events(&spool).unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn empty_buffer_decodes_to_no_events() {
        assert_eq!(read_delimited_events(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn truncated_trailing_record_is_a_decode_error() {
        let mut spool = Vec::new();
        write_delimited(&mut spool, &ping_event(7)).unwrap();
        spool.truncate(spool.len() - 1);
        assert!(read_delimited_events(&spool).is_err());
    }
}
