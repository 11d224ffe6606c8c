//! Persistent analytics settings.
//!
//! Settings live in `<settings-home>/analytics.settings` as a small
//! JSON document shared by every process of the tool suite. All reads
//! and writes take a non-blocking exclusive file lock; contention is an
//! error the caller may retry, never a wait.
//!
//! The document carries the pseudo-anonymous user id, the opt-in flag,
//! a debug switch that suppresses publishing, and the anonymization
//! salt together with the index of the 28-day window it belongs to.
//! The salt rotates automatically: whenever the current window index
//! differs from the stored one, 24 fresh random bytes are generated and
//! persisted before the salt is handed out.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::NaiveDate;
use fs2::FileExt;
use num_bigint::BigInt;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::date::{DateProvider, SystemDateProvider};
use crate::paths;

/// Settings file name under the settings home.
const SETTINGS_FILE_NAME: &str = "analytics.settings";

/// Legacy user-id file consulted when creating fresh settings.
const LEGACY_UID_FILE_NAME: &str = "uid.txt";

/// Length in bytes of the anonymization salt.
const SALT_LENGTH: usize = 24;

/// Days in one salt window. The window size supports both 4-week and
/// 1-week analyses.
const SALT_WINDOW_DAYS: i64 = 28;

/// Offset added to the epoch day index before dividing into windows.
/// The Unix epoch was a Thursday; the offset moves window boundaries to
/// Mondays. Changing this phase would invalidate every existing salt.
const SALT_WINDOW_PHASE_DAYS: i64 = 3;

// =============================================================================
// Error type
// =============================================================================

/// Errors from settings load, save and salt rotation.
///
/// Every failure is an I/O-kind error: lock contention carries a
/// `WouldBlock` source, and parse failures carry an `InvalidData`
/// source with the original parser message attached.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Filesystem I/O failure.
    #[error("settings I/O error: {context}: {source}")]
    Io {
        /// Human-readable context for the error.
        context: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl SettingsError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The settings file is locked by another process (or another
    /// handle in this one).
    fn lock_contention(path: &std::path::Path) -> Self {
        Self::io(
            format!("unable to lock settings file {}", path.display()),
            io::Error::new(io::ErrorKind::WouldBlock, "file is already locked"),
        )
    }

    /// The settings file content is not a valid settings document.
    fn parse(path: &std::path::Path, message: String) -> Self {
        Self::io(
            format!("unable to parse settings file {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidData, message),
        )
    }
}

// =============================================================================
// Salt value
// =============================================================================

/// The salt blob, persisted as an arbitrary-precision signed integer.
///
/// The JSON document stores the salt as a plain integer literal (the
/// two's-complement big-endian interpretation of the salt bytes), so
/// leading bytes that are redundant in integer form are not preserved:
/// reading the blob back can yield fewer than 24 bytes. [`salt`]
/// restores the fixed length by zero-padding on the right.
///
/// [`salt`]: AnalyticsSettings::salt
#[derive(Debug, Clone, PartialEq, Eq)]
struct SaltValue(BigInt);

impl SaltValue {
    fn from_random_bytes(bytes: &[u8]) -> Self {
        Self(BigInt::from_signed_bytes_be(bytes))
    }

    fn to_blob(&self) -> Vec<u8> {
        self.0.to_signed_bytes_be()
    }
}

impl Serialize for SaltValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let number: serde_json::Number = self
            .0
            .to_string()
            .parse()
            .map_err(|_| S::Error::custom("salt value is not a valid JSON number"))?;
        number.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SaltValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let number = serde_json::Number::deserialize(deserializer)?;
        let value: BigInt = number
            .to_string()
            .parse()
            .map_err(|_| D::Error::custom("salt value is not an integer"))?;
        Ok(Self(value))
    }
}

// =============================================================================
// Persisted record
// =============================================================================

/// The on-disk settings document. Field names are the wire contract
/// shared with every tool that reads the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct SettingsData {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "hasOptedIn")]
    has_opted_in: bool,
    #[serde(rename = "debugDisablePublishing")]
    debug_disable_publishing: bool,
    #[serde(rename = "saltValue", skip_serializing_if = "Option::is_none")]
    salt_value: Option<SaltValue>,
    #[serde(rename = "saltSkew")]
    salt_skew: i32,
}

// =============================================================================
// AnalyticsSettings
// =============================================================================

struct Shared {
    data: Mutex<SettingsData>,
    date_provider: Mutex<Arc<dyn DateProvider>>,
}

/// Handle to the analytics settings record.
///
/// Clones share state; mutating operations serialize on an internal
/// lock and persisting operations additionally take the exclusive
/// on-disk file lock.
#[derive(Clone)]
pub struct AnalyticsSettings {
    shared: Arc<Shared>,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for AnalyticsSettings {
    /// Handle identity: two settings are equal when they share state.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for AnalyticsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data();
        f.debug_struct("AnalyticsSettings")
            .field("user_id", &data.user_id)
            .field("has_opted_in", &data.has_opted_in)
            .field("debug_disable_publishing", &data.debug_disable_publishing)
            .field("salt_skew", &data.salt_skew)
            .finish_non_exhaustive()
    }
}

static INSTANCE: OnceLock<Mutex<Option<AnalyticsSettings>>> = OnceLock::new();

fn instance_cell() -> &'static Mutex<Option<AnalyticsSettings>> {
    INSTANCE.get_or_init(|| Mutex::new(None))
}

impl AnalyticsSettings {
    /// Creates an in-memory settings value that has not been persisted.
    #[must_use]
    pub fn new() -> Self {
        Self::from_data(SettingsData::default())
    }

    fn from_data(data: SettingsData) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(data),
                date_provider: Mutex::new(Arc::new(SystemDateProvider)),
            }),
        }
    }

    fn data(&self) -> MutexGuard<'_, SettingsData> {
        self.shared
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the settings file from disk, updating the process-wide
    /// cached instance on success.
    ///
    /// Returns `Ok(None)` when no settings file exists yet.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or locked, or when its
    /// content does not parse as a settings document.
    pub fn load() -> Result<Option<Self>, SettingsError> {
        let loaded = Self::load_without_caching()?;
        if let Some(settings) = &loaded {
            *instance_cell()
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        }
        Ok(loaded)
    }

    /// Creates fresh settings and writes them to disk.
    ///
    /// When a legacy `uid.txt` exists next to the settings file, its
    /// first line carries over as the user id so existing installs keep
    /// their reporting identity; otherwise a random id is generated.
    ///
    /// # Errors
    ///
    /// Fails when the settings file cannot be written.
    pub fn create_new() -> Result<Self, SettingsError> {
        let settings = Self::new();
        {
            let mut data = settings.data();
            data.user_id = legacy_uid().unwrap_or_else(|| Uuid::new_v4().to_string());
        }
        settings.save()?;
        Ok(settings)
    }

    /// Returns the process-wide settings instance.
    ///
    /// Resolution order: cached instance, then the on-disk file, then
    /// freshly created settings, and as a last resort an in-memory
    /// value with a random user id. Failures along the way are logged
    /// and never surfaced to the caller.
    #[must_use]
    pub fn get_instance() -> Self {
        let mut cached = instance_cell()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(settings) = cached.as_ref() {
            return settings.clone();
        }
        // `load` also fills the cache; assign through the guard we
        // already hold instead.
        let loaded = match Self::load_without_caching() {
            Ok(loaded) => loaded,
            Err(error) => {
                tracing::error!(%error, "unable to load analytics settings");
                None
            }
        };
        let settings = loaded.or_else(|| match Self::create_new() {
            Ok(created) => Some(created),
            Err(error) => {
                tracing::error!(%error, "unable to create new analytics settings");
                None
            }
        });
        let settings = settings.unwrap_or_else(|| {
            let fallback = Self::new();
            fallback.set_user_id(Uuid::new_v4().to_string());
            fallback
        });
        *cached = Some(settings.clone());
        settings
    }

    fn load_without_caching() -> Result<Option<Self>, SettingsError> {
        let path = settings_file();
        if !path.exists() {
            return Ok(None);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SettingsError::io(format!("opening {}", path.display()), e))?;
        lock_exclusive(&file, &path)?;
        let mut content = String::new();
        let read_result = (&file)
            .read_to_string(&mut content)
            .map_err(|e| SettingsError::io(format!("reading {}", path.display()), e));
        let _ = FileExt::unlock(&file);
        read_result?;
        let data: SettingsData = serde_json::from_str(&content)
            .map_err(|e| SettingsError::parse(&path, e.to_string()))?;
        Ok(Some(Self::from_data(data)))
    }

    /// Replaces the process-wide cached instance. Pass `None` to force
    /// the next [`get_instance`](Self::get_instance) through the full
    /// resolution chain again.
    pub fn set_instance_for_test(settings: Option<Self>) {
        *instance_cell()
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Writes this settings value to disk under the exclusive file
    /// lock, truncating any previous content.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created, locked or written.
    pub fn save(&self) -> Result<(), SettingsError> {
        let data = self.data();
        self.save_locked(&data)
    }

    fn save_locked(&self, data: &SettingsData) -> Result<(), SettingsError> {
        let path = settings_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettingsError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SettingsError::io(format!("opening {}", path.display()), e))?;
        lock_exclusive(&file, &path)?;
        let result = write_document(&file, data, &path);
        let _ = FileExt::unlock(&file);
        result
    }

    /// The pseudo-anonymous user id reported with analytics.
    #[must_use]
    pub fn user_id(&self) -> String {
        self.data().user_id.clone()
    }

    /// Sets the user id. The id should be pseudo-anonymous.
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.data().user_id = user_id.into();
    }

    /// Whether the user opted in to sending analytics.
    #[must_use]
    pub fn has_opted_in(&self) -> bool {
        self.data().has_opted_in
    }

    /// Records the user's opt-in choice (in memory; call
    /// [`save`](Self::save) to persist).
    pub fn set_opted_in(&self, opted_in: bool) {
        self.data().has_opted_in = opted_in;
    }

    /// Whether publishing is disabled for debugging purposes.
    #[must_use]
    pub fn debug_disable_publishing(&self) -> bool {
        self.data().debug_disable_publishing
    }

    /// Sets the debug switch that suppresses publishing.
    pub fn set_debug_disable_publishing(&self, disabled: bool) {
        self.data().debug_disable_publishing = disabled;
    }

    /// Returns the per-user anonymization salt for the current 28-day
    /// window, regenerating and persisting it first when the window has
    /// rolled over since the stored value.
    ///
    /// The returned blob is at least 24 bytes: shorter stored values
    /// are zero-padded on the right. Stored values longer than 24
    /// bytes are returned unchanged.
    ///
    /// # Errors
    ///
    /// Fails when a rotated salt cannot be persisted.
    pub fn salt(&self) -> Result<Vec<u8>, SettingsError> {
        let mut data = self.data();
        let current_skew = self.current_salt_skew();
        if data.salt_skew != current_skew {
            data.salt_skew = current_skew;
            let mut bytes = [0_u8; SALT_LENGTH];
            OsRng.fill_bytes(&mut bytes);
            data.salt_value = Some(SaltValue::from_random_bytes(&bytes));
            self.save_locked(&data)?;
        }
        let blob = data
            .salt_value
            .as_ref()
            .map(SaltValue::to_blob)
            .unwrap_or_default();
        if blob.len() < SALT_LENGTH {
            let mut full = vec![0_u8; SALT_LENGTH];
            full[..blob.len()].copy_from_slice(&blob);
            Ok(full)
        } else {
            Ok(blob)
        }
    }

    /// The salt-window index for the date provider's current date.
    #[must_use]
    pub fn current_salt_skew(&self) -> i32 {
        let provider = self
            .shared
            .date_provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        salt_skew_for_date(provider.now().date_naive())
    }

    /// Replaces the wall-clock source used for salt-window decisions.
    pub fn set_date_provider(&self, provider: Arc<dyn DateProvider>) {
        *self
            .shared
            .date_provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = provider;
    }
}

/// The salt-window index for a given UTC date: the number of complete
/// 28-day windows since the Monday-aligned phase origin.
#[must_use]
pub fn salt_skew_for_date(date: NaiveDate) -> i32 {
    let days_since_epoch = date
        .signed_duration_since(NaiveDate::default())
        .num_days();
    let windows = (days_since_epoch + SALT_WINDOW_PHASE_DAYS).div_euclid(SALT_WINDOW_DAYS);
    i32::try_from(windows).unwrap_or(i32::MAX)
}

// =============================================================================
// Internal helpers
// =============================================================================

fn settings_file() -> PathBuf {
    paths::android_settings_home().join(SETTINGS_FILE_NAME)
}

/// Non-blocking exclusive lock; contention surfaces as an I/O-kind
/// error with a `WouldBlock` source, never as a wait.
fn lock_exclusive(file: &std::fs::File, path: &std::path::Path) -> Result<(), SettingsError> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(SettingsError::lock_contention(path))
        }
        Err(e) => Err(SettingsError::io(
            format!("locking {}", path.display()),
            e,
        )),
    }
}

fn write_document(
    mut file: &std::fs::File,
    data: &SettingsData,
    path: &std::path::Path,
) -> Result<(), SettingsError> {
    let json = serde_json::to_string(data)
        .map_err(|e| SettingsError::parse(path, e.to_string()))?;
    file.set_len(0)
        .map_err(|e| SettingsError::io(format!("truncating {}", path.display()), e))?;
    file.write_all(json.as_bytes())
        .map_err(|e| SettingsError::io(format!("writing {}", path.display()), e))?;
    file.flush()
        .map_err(|e| SettingsError::io(format!("flushing {}", path.display()), e))
}

/// First line of the legacy `uid.txt`, if the file exists and is
/// readable. Read errors fall through to a fresh id.
fn legacy_uid() -> Option<String> {
    let path = paths::android_settings_home().join(LEGACY_UID_FILE_NAME);
    let content = std::fs::read_to_string(path).ok()?;
    let first_line = content.lines().next()?.trim();
    if first_line.is_empty() {
        None
    } else {
        Some(first_line.to_string())
    }
}
