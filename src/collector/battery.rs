//! Battery level sources.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

/// Level reported when no battery can be read.
pub const UNKNOWN_BATTERY_LEVEL: u8 = 80;

/// Reports the current device battery level in percent.
pub trait BatteryAdvisor: Send + Sync {
    fn level(&self) -> u8;
}

/// Reads the battery level from `/sys/class/power_supply`.
///
/// Devices without a readable battery report [`UNKNOWN_BATTERY_LEVEL`].
#[derive(Debug, Clone)]
pub struct SystemBattery {
    root: PathBuf,
}

impl SystemBattery {
    pub fn new() -> Self {
        Self::with_root("/sys/class/power_supply")
    }

    /// Read from a different power-supply directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_level(&self) -> Option<u8> {
        let entries = std::fs::read_dir(&self.root).ok()?;
        let mut batteries: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("BAT"))
            })
            .collect();
        batteries.sort();

        batteries.iter().find_map(|dir| read_capacity(dir))
    }
}

impl Default for SystemBattery {
    fn default() -> Self {
        Self::new()
    }
}

fn read_number(path: &Path) -> Option<f64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_capacity(dir: &Path) -> Option<u8> {
    if let Some(capacity) = read_number(&dir.join("capacity")) {
        return Some(capacity.clamp(0.0, 100.0) as u8);
    }

    let now = read_number(&dir.join("energy_now"))?;
    let full = read_number(&dir.join("energy_full"))?;
    if full <= 0.0 {
        return None;
    }
    Some((now / full * 100.0).clamp(0.0, 100.0) as u8)
}

impl BatteryAdvisor for SystemBattery {
    fn level(&self) -> u8 {
        match self.read_level() {
            Some(level) => level,
            None => {
                tracing::debug!(
                    root = %self.root.display(),
                    "No battery found, assuming {}%",
                    UNKNOWN_BATTERY_LEVEL
                );
                UNKNOWN_BATTERY_LEVEL
            }
        }
    }
}

/// A battery level set by hand, for tests and simulations.
#[derive(Debug)]
pub struct FixedBattery {
    level: AtomicU8,
}

impl FixedBattery {
    pub fn new(level: u8) -> Self {
        Self {
            level: AtomicU8::new(level.min(100)),
        }
    }

    pub fn set(&self, level: u8) {
        self.level.store(level.min(100), Ordering::Relaxed);
    }
}

impl BatteryAdvisor for FixedBattery {
    fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "consent-collector-battery-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_fixed_battery() {
        let battery = FixedBattery::new(50);
        assert_eq!(battery.level(), 50);
        battery.set(150);
        assert_eq!(battery.level(), 100);
    }

    #[test]
    fn test_reads_capacity_file() {
        let root = temp_root("capacity");
        std::fs::create_dir_all(root.join("BAT0")).unwrap();
        std::fs::write(root.join("BAT0").join("capacity"), "42\n").unwrap();
        std::fs::create_dir_all(root.join("AC")).unwrap();

        assert_eq!(SystemBattery::with_root(&root).level(), 42);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_reads_energy_ratio() {
        let root = temp_root("energy");
        let bat = root.join("BAT1");
        std::fs::create_dir_all(&bat).unwrap();
        std::fs::write(bat.join("energy_now"), "25000").unwrap();
        std::fs::write(bat.join("energy_full"), "50000").unwrap();

        assert_eq!(SystemBattery::with_root(&root).level(), 50);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_missing_battery_falls_back() {
        let root = temp_root("missing");
        assert_eq!(
            SystemBattery::with_root(&root).level(),
            UNKNOWN_BATTERY_LEVEL
        );
        let _ = std::fs::remove_dir_all(root);
    }
}
