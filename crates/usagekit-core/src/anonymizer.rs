//! Anonymization of user-provided strings.
//!
//! Values that could identify a user or their machine (paths, project
//! names, host names) are hashed before they leave the process. The
//! hash is keyed with the per-user salt from the settings store, which
//! rotates every 28 days, so identical inputs correlate within a salt
//! window but not across windows or across users.

use sha2::{Digest, Sha256};

use crate::settings::{AnalyticsSettings, SettingsError};

/// Anonymizes a UTF-8 string: SHA-256 over the current salt followed by
/// the input bytes, rendered as lowercase hex.
///
/// Empty input maps to the empty string without touching the salt.
///
/// # Errors
///
/// Fails when the salt cannot be read or rotated; the failure is logged
/// before it is returned.
pub fn anonymize_utf8(data: &str) -> Result<String, SettingsError> {
    if data.is_empty() {
        return Ok(String::new());
    }
    let salt = match AnalyticsSettings::get_instance().salt() {
        Ok(salt) => salt,
        Err(error) => {
            tracing::error!(%error, "unable to read anonymization salt");
            return Err(error);
        }
    };
    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(data.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
