//! Filesystem flags: kill switch, router pause, pipeline fast-path.
//!
//! These stay files (not DB rows) on purpose: they must be writable by
//! operators and crash-recovery tooling with nothing but a shell, and must
//! survive process death.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Process-wide halt flag. A file whose contents spell `TRUE` halts every
/// write path; anything else (or no file) means trading is allowed.
#[derive(Clone)]
pub struct KillSwitch {
    path: PathBuf,
}

impl KillSwitch {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    /// Fail closed: an unreadable flag file counts as active.
    pub fn is_active(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => content.trim().eq_ignore_ascii_case("TRUE"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                error!("Cannot read kill switch file: {e} — treating as ACTIVE");
                true
            }
        }
    }

    pub fn activate(&self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        error!("EMERGENCY: Activating kill switch — {reason}");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create kill switch directory")?;
        }
        std::fs::write(&self.path, "TRUE").context("Cannot write kill switch file")?;
        // The flag file carries only TRUE; the reason lives in a sidecar.
        let meta = self.path.with_extension("reason");
        let _ = std::fs::write(&meta, format!("{}\n{reason}\n", now.to_rfc3339()));
        Ok(())
    }

    pub fn deactivate(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Kill switch deactivated");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Cannot remove kill switch file"),
        }
    }

    pub fn reason(&self) -> Option<String> {
        std::fs::read_to_string(self.path.with_extension("reason")).ok()
    }
}

/// Presence-only flag file (router pause, pipeline fast-path).
#[derive(Clone)]
pub struct FlagFile {
    path: PathBuf,
}

impl FlagFile {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    pub fn set(&self, note: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create flag directory")?;
        }
        std::fs::write(&self.path, note).context("Cannot write flag file")?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Cannot remove flag file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}_{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn kill_switch_requires_literal_true() {
        let path = temp_path("kill_switch");
        let ks = KillSwitch::new(&path);
        assert!(!ks.is_active());

        std::fs::write(&path, "FALSE").unwrap();
        assert!(!ks.is_active());

        std::fs::write(&path, "true\n").unwrap();
        assert!(ks.is_active());

        ks.deactivate().unwrap();
        assert!(!ks.is_active());
    }

    #[test]
    fn activate_records_reason() {
        let path = temp_path("kill_switch");
        let ks = KillSwitch::new(&path);
        ks.activate("Flash crash: BTCUSDT -30.0%", Utc::now()).unwrap();
        assert!(ks.is_active());
        assert!(ks.reason().unwrap().contains("Flash crash"));
    }

    #[test]
    fn flag_file_set_and_clear() {
        let flag = FlagFile::new(&temp_path("pause"));
        assert!(!flag.is_set());
        flag.set("paused by watchdog tier 4").unwrap();
        assert!(flag.is_set());
        flag.clear().unwrap();
        assert!(!flag.is_set());
    }
}
