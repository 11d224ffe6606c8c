//! Path resolution for analytics settings and the event spool.
//!
//! Both helpers are pure derivations over the environment indirection;
//! they perform no filesystem I/O and do not create directories.

use std::path::PathBuf;

use crate::environment;

/// Environment variable that overrides the settings home directory.
const SETTINGS_HOME_VAR: &str = "ANDROID_SDK_HOME";

/// Returns the directory holding analytics settings.
///
/// `ANDROID_SDK_HOME` wins when set to a non-empty value; otherwise the
/// settings live in `.android` under the user's home directory.
#[must_use]
pub fn android_settings_home() -> PathBuf {
    if let Some(home) = environment::instance().variable(SETTINGS_HOME_VAR) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    user_home().join(".android")
}

/// Returns the spool directory used for temporary storage of analytics
/// data, `<settings-home>/metrics/spool`.
#[must_use]
pub fn spool_directory() -> PathBuf {
    android_settings_home().join("metrics").join("spool")
}

/// The user's home directory, read through the environment indirection
/// so tests can redirect it. Falls back to the current directory when
/// no home is configured.
fn user_home() -> PathBuf {
    let env = environment::instance();
    for key in ["HOME", "USERPROFILE"] {
        if let Some(value) = env.variable(key) {
            if !value.is_empty() {
                return PathBuf::from(value);
            }
        }
    }
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use crate::environment::fakes::EnvironmentOverride;

    use super::*;

    #[test]
    fn settings_home_honors_override_variable() {
        let _guard = EnvironmentOverride::settings_home(Path::new("/custom/home"));
        assert_eq!(android_settings_home(), Path::new("/custom/home"));
        assert_eq!(
            spool_directory(),
            Path::new("/custom/home/metrics/spool")
        );
    }

    #[test]
    fn settings_home_falls_back_to_dot_android_under_home() {
        let mut vars = HashMap::new();
        vars.insert("HOME".to_string(), "/users/someone".to_string());
        let _guard = EnvironmentOverride::custom(vars);
        assert_eq!(
            android_settings_home(),
            Path::new("/users/someone/.android")
        );
    }

    #[test]
    fn empty_override_is_treated_as_unset() {
        let mut vars = HashMap::new();
        vars.insert("ANDROID_SDK_HOME".to_string(), String::new());
        vars.insert("HOME".to_string(), "/users/other".to_string());
        let _guard = EnvironmentOverride::custom(vars);
        assert_eq!(android_settings_home(), Path::new("/users/other/.android"));
    }
}
