//! Environment-variable indirection.
//!
//! The process environment cannot be rewritten safely once threads are
//! running, so everything in this workspace reads environment variables
//! through a swappable [`Environment`] instance instead of
//! `std::env::var`. Tests install a map-backed fake through
//! [`fakes::EnvironmentOverride`] to control path resolution without
//! touching the real environment.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Read access to environment variables.
pub trait Environment: Send + Sync {
    /// Returns the value of the named variable, or `None` when unset.
    fn variable(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    fn variable(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

static INSTANCE: OnceLock<RwLock<Arc<dyn Environment>>> = OnceLock::new();

fn cell() -> &'static RwLock<Arc<dyn Environment>> {
    INSTANCE.get_or_init(|| RwLock::new(Arc::new(SystemEnvironment)))
}

/// Returns the currently installed environment indirection.
pub fn instance() -> Arc<dyn Environment> {
    cell()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replaces the process-wide environment indirection.
pub fn set_instance(environment: Arc<dyn Environment>) {
    *cell().write().unwrap_or_else(PoisonError::into_inner) = environment;
}

/// Fake environments for tests.
pub mod fakes {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use super::{set_instance, Environment, SystemEnvironment};

    /// An environment backed by a fixed map. Variables not present in
    /// the map read as unset.
    #[derive(Debug, Clone, Default)]
    pub struct MapEnvironment {
        vars: HashMap<String, String>,
    }

    impl MapEnvironment {
        /// Creates a map-backed environment from the given variables.
        #[must_use]
        pub fn new(vars: HashMap<String, String>) -> Self {
            Self { vars }
        }
    }

    impl Environment for MapEnvironment {
        fn variable(&self, name: &str) -> Option<String> {
            self.vars.get(name).cloned()
        }
    }

    // Overrides are process-global; the gate serializes tests that
    // install one so parallel test threads cannot observe each other's
    // fake environment.
    static OVERRIDE_GATE: Mutex<()> = Mutex::new(());

    /// RAII override of the process-wide environment. The system
    /// environment is restored when the guard drops.
    pub struct EnvironmentOverride {
        _gate: MutexGuard<'static, ()>,
    }

    impl EnvironmentOverride {
        /// Installs a map-backed fake with the given variables.
        #[must_use]
        pub fn custom(vars: HashMap<String, String>) -> Self {
            let gate = OVERRIDE_GATE
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            set_instance(Arc::new(MapEnvironment::new(vars)));
            Self { _gate: gate }
        }

        /// Installs a fake where `ANDROID_SDK_HOME` points at the given
        /// directory, redirecting all settings and spool paths there.
        #[must_use]
        pub fn settings_home(home: &Path) -> Self {
            let mut vars = HashMap::new();
            vars.insert(
                "ANDROID_SDK_HOME".to_string(),
                home.display().to_string(),
            );
            Self::custom(vars)
        }
    }

    impl Drop for EnvironmentOverride {
        fn drop(&mut self) {
            set_instance(Arc::new(SystemEnvironment));
        }
    }
}
