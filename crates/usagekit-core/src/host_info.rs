//! Host OS and CPU classification for upload metadata.
//!
//! The collector expects a small, normalized vocabulary for OS names
//! and CPU architectures; everything here reduces the host's raw
//! strings to that vocabulary. Environment lookups go through the
//! environment indirection so tests can exercise the
//! 32-bit-runtime-on-64-bit-host paths.

use std::sync::OnceLock;

use regex::Regex;

use crate::environment;

/// Maximum length of an unrecognized OS name before truncation.
const MAX_OS_NAME_LENGTH: usize = 32;

/// CPU architecture vocabulary reported to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArchitecture {
    /// Anything not recognized below.
    Unknown,
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X8664,
}

/// Classifies a raw architecture string (`x86_64`, `amd64`, `i686`, …).
#[must_use]
pub fn cpu_architecture_from_string(value: &str) -> CpuArchitecture {
    if value.is_empty() {
        return CpuArchitecture::Unknown;
    }
    if value.eq_ignore_ascii_case("x86_64")
        || value.eq_ignore_ascii_case("ia64")
        || value.eq_ignore_ascii_case("amd64")
    {
        return CpuArchitecture::X8664;
    }
    if value.eq_ignore_ascii_case("x86") {
        return CpuArchitecture::X86;
    }
    // Any iX86 variant counts as x86 (i386, i486, i686).
    let bytes = value.as_bytes();
    if value.len() == 4 && bytes[0] == b'i' && &value[2..] == "86" {
        return CpuArchitecture::X86;
    }
    CpuArchitecture::Unknown
}

/// Detects the architecture of the host OS, which can differ from the
/// runtime's: a 32-bit build can run on a 64-bit OS.
///
/// On Windows, WOW64 sets `PROCESSOR_ARCHITEW6432` when emulating a
/// 32-bit environment on a 64-bit host. On Linux, `HOSTTYPE` carries
/// the host architecture in common shells.
#[must_use]
pub fn os_architecture() -> CpuArchitecture {
    let runtime = cpu_architecture_from_string(std::env::consts::ARCH);
    if runtime == CpuArchitecture::X86 {
        if cfg!(windows) {
            if let Some(wow64) = environment::instance().variable("PROCESSOR_ARCHITEW6432") {
                if wow64.contains("64") {
                    return CpuArchitecture::X8664;
                }
            }
        } else if cfg!(target_os = "linux") {
            let host_type = environment::instance()
                .variable("HOSTTYPE")
                .unwrap_or_default();
            return cpu_architecture_from_string(&host_type);
        }
    }
    runtime
}

/// Normalized OS name: `linux`, `windows` or `macosx`; anything else is
/// reported verbatim, truncated to a bounded length.
#[must_use]
pub fn os_name() -> String {
    let os = std::env::consts::OS;
    match os {
        "linux" => "linux".to_string(),
        "windows" => "windows".to_string(),
        "macos" => "macosx".to_string(),
        other if other.is_empty() => "unknown".to_string(),
        other => other.chars().take(MAX_OS_NAME_LENGTH).collect(),
    }
}

/// The full OS version string, e.g. a kernel release on Linux.
#[must_use]
pub fn os_full_version() -> String {
    #[cfg(unix)]
    {
        match nix::sys::utsname::uname() {
            Ok(info) => info.release().to_string_lossy().into_owned(),
            Err(_) => "unknown".to_string(),
        }
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

/// Extracts the `major.minor` prefix of a version string, or `None`
/// when the string has no such prefix.
#[must_use]
pub fn major_version_of(full_version: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+).*$").unwrap_or_else(|_| unreachable!())
    });
    let captures = pattern.captures(full_version)?;
    Some(format!("{}.{}", &captures[1], &captures[2]))
}

/// The `major.minor` prefix of the host OS version, or `None` when the
/// version string is not of that shape.
#[must_use]
pub fn major_os_version() -> Option<String> {
    major_version_of(&os_full_version())
}
