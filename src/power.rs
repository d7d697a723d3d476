//! Power-source probing for the pause-on-battery policy.
//!
//! The manager polls once a minute; probes are cheap reads or short-lived
//! subprocesses. When nothing conclusive can be read the previous answer is
//! returned, so a flaky probe never flips policy state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Answers "is this machine running on battery right now?".
pub trait PowerSource: Send + Sync {
    /// Returns the current battery state, or `fallback` when it cannot be
    /// determined.
    fn is_on_battery(&self, fallback: bool) -> bool;
}

/// Probes the operating system for the current power source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPower;

impl PowerSource for SystemPower {
    #[cfg(target_os = "linux")]
    fn is_on_battery(&self, fallback: bool) -> bool {
        // sysfs first, upower as a fallback.
        if let Ok(data) = std::fs::read_to_string("/sys/class/power_supply/AC/online") {
            match data.trim() {
                "1" => return false,
                "0" => return true,
                _ => {}
            }
        }
        if let Ok(output) = std::process::Command::new("upower")
            .args(["-i", "/org/freedesktop/UPower/devices/line_power_AC"])
            .output()
        {
            let text = String::from_utf8_lossy(&output.stdout).to_lowercase();
            if text.contains("online: yes") {
                return false;
            }
            if text.contains("online: no") {
                return true;
            }
        }
        fallback
    }

    #[cfg(target_os = "macos")]
    fn is_on_battery(&self, fallback: bool) -> bool {
        if let Ok(output) = std::process::Command::new("pmset").args(["-g", "batt"]).output() {
            let text = String::from_utf8_lossy(&output.stdout);
            if text.contains("Battery Power") {
                return true;
            }
            if text.contains("AC Power") {
                return false;
            }
        }
        fallback
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn is_on_battery(&self, fallback: bool) -> bool {
        fallback
    }
}

/// A power source with an externally controlled answer.
///
/// Headless deployments pin it to "on AC"; tests flip it to drive the
/// battery policy.
#[derive(Debug, Clone, Default)]
pub struct StaticPower {
    on_battery: Arc<AtomicBool>,
}

impl StaticPower {
    #[must_use]
    pub fn new(on_battery: bool) -> Self {
        Self {
            on_battery: Arc::new(AtomicBool::new(on_battery)),
        }
    }

    pub fn set_on_battery(&self, on_battery: bool) {
        self.on_battery.store(on_battery, Ordering::Relaxed);
    }
}

impl PowerSource for StaticPower {
    fn is_on_battery(&self, _fallback: bool) -> bool {
        self.on_battery.load(Ordering::Relaxed)
    }
}
