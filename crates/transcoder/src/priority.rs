//! Priority adapter for the encoder process.
//!
//! Windows changes the priority class of the running process through the
//! process API, which needs a live handle, so it can only happen after the
//! process has started. Linux and macOS launch the encoder through `nice`,
//! so the niceness is in place from the first instruction. Anything else
//! runs the encoder at the default priority.
//!
//! Every failure here is logged and swallowed: priority only affects how
//! polite the encoder is to the rest of the machine, never correctness.

use crate::config::PriorityLevel;
use std::ffi::OsString;
use tracing::{debug, warn};

/// Launcher used to establish niceness at spawn time.
pub const NICE_LAUNCHER: &str = "nice";

/// Win32 priority class values (`IDLE_PRIORITY_CLASS` and friends).
pub const IDLE_PRIORITY_CLASS: u32 = 0x0000_0040;
pub const BELOW_NORMAL_PRIORITY_CLASS: u32 = 0x0000_4000;
pub const NORMAL_PRIORITY_CLASS: u32 = 0x0000_0020;
pub const ABOVE_NORMAL_PRIORITY_CLASS: u32 = 0x0000_8000;

/// How priority gets applied for a given platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Spawn the encoder directly, then set its priority class.
    PriorityAfterStart { level: PriorityLevel },
    /// Spawn `nice -n <value> <encoder> ...`.
    NiceLauncher { niceness: i32 },
    /// Spawn the encoder directly and leave its priority alone.
    Unmanaged,
}

impl LaunchStrategy {
    /// Strategy for the platform this binary was built for.
    pub fn for_current_platform(level: PriorityLevel) -> Self {
        Self::for_os(std::env::consts::OS, level)
    }

    /// Strategy for a named OS (values of `std::env::consts::OS`).
    pub fn for_os(os: &str, level: PriorityLevel) -> Self {
        match os {
            "windows" => LaunchStrategy::PriorityAfterStart { level },
            "linux" | "macos" => LaunchStrategy::NiceLauncher {
                niceness: niceness(level),
            },
            other => {
                warn!(
                    "Priority control is not supported on {}; encoder runs at default priority",
                    other
                );
                LaunchStrategy::Unmanaged
            }
        }
    }

    /// Arguments placed before the encoder program, if any.
    pub fn launcher_prefix(&self) -> Vec<OsString> {
        match self {
            LaunchStrategy::NiceLauncher { niceness } => vec![
                OsString::from(NICE_LAUNCHER),
                OsString::from("-n"),
                OsString::from(niceness.to_string()),
            ],
            _ => Vec::new(),
        }
    }
}

/// Niceness for the launcher-based platforms.
///
/// `AboveNormal` stays negative but well clear of the range that is
/// normally reserved for administrators.
pub fn niceness(level: PriorityLevel) -> i32 {
    match level {
        PriorityLevel::Idle => 19,
        PriorityLevel::BelowNormal => 10,
        PriorityLevel::Normal => 0,
        PriorityLevel::AboveNormal => -5,
    }
}

/// Win32 priority class for the API-based platform.
pub fn priority_class(level: PriorityLevel) -> u32 {
    match level {
        PriorityLevel::Idle => IDLE_PRIORITY_CLASS,
        PriorityLevel::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
        PriorityLevel::Normal => NORMAL_PRIORITY_CLASS,
        PriorityLevel::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
    }
}

/// Apply `level` to an already running process. Best effort.
pub fn apply_after_start(pid: u32, level: PriorityLevel) {
    debug!(
        "Setting priority of pid {} to {} (class 0x{:x})",
        pid,
        level,
        priority_class(level)
    );
    match set_priority_class(pid, priority_class(level)) {
        Ok(()) => debug!("Priority of pid {} set to {}", pid, level),
        Err(e) => warn!(
            "Could not set priority of pid {} to {}: {} (continuing at default priority)",
            pid, level, e
        ),
    }
}

#[cfg(windows)]
fn set_priority_class(pid: u32, class: u32) -> std::io::Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, SetPriorityClass, PROCESS_SET_INFORMATION,
    };

    // SAFETY: the handle is checked for null and closed on every path.
    unsafe {
        let handle = OpenProcess(PROCESS_SET_INFORMATION, 0, pid);
        if handle.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        let ok = SetPriorityClass(handle, class);
        let err = std::io::Error::last_os_error();
        CloseHandle(handle);
        if ok == 0 {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(windows))]
fn set_priority_class(_pid: u32, _class: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "priority classes are only available on Windows",
    ))
}
