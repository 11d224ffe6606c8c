//! # usagekit-core
//!
//! Core library for the usagekit analytics pipeline: the client-side
//! machinery that records structured usage events from desktop tooling
//! into a durable on-disk spool and uploads them to a remote collector.
//!
//! This crate provides the shared building blocks consumed by the
//! tracker and publisher crates:
//!
//! - **Settings**: the persistent opt-in record, pseudo-anonymous user
//!   id and the time-rotating anonymization salt
//! - **Anonymizer**: salted SHA-256 hashing of user-provided strings
//! - **Paths**: resolution of the settings home and spool directory
//! - **Wire format**: length-delimited protobuf spool records and the
//!   upload request envelope
//! - **Scheduler**: a serial task scheduler abstraction with a
//!   production single-thread implementation and a virtual-time
//!   implementation for tests
//! - **Environment**: an overridable environment-variable indirection
//!   so tests can inject configuration

pub mod anonymizer;
pub mod date;
pub mod environment;
pub mod host_info;
pub mod paths;
pub mod scheduler;
pub mod settings;
pub mod wire;

pub use anonymizer::anonymize_utf8;
pub use date::{DateProvider, StubDateProvider, SystemDateProvider, VirtualTimeDateProvider};
pub use scheduler::{ScheduledHandle, Scheduler, SingleThreadScheduler, VirtualTimeScheduler};
pub use settings::{AnalyticsSettings, SettingsError};
