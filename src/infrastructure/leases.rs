//! Worker lease files.
//!
//! Each worker writes `leases/<name>.json` at cycle start, refreshes
//! `heartbeat_at` while running, and stamps `completed_at` on exit. Lease
//! files are write-only by the owning worker; the watchdog only reads them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ttl_seconds: i64,
}

impl Lease {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.heartbeat_at).num_seconds() <= self.ttl_seconds
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.heartbeat_at).num_seconds()
    }
}

pub struct LeaseWriter {
    path: PathBuf,
    lease: Lease,
}

impl LeaseWriter {
    /// Begin a cycle: write a fresh lease for this worker.
    pub fn begin(leases_dir: &Path, owner: &str, ttl_seconds: i64, now: DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(leases_dir).context("Failed to create leases directory")?;
        let lease = Lease {
            owner: owner.to_string(),
            started_at: now,
            heartbeat_at: now,
            completed_at: None,
            ttl_seconds,
        };
        let writer = Self { path: leases_dir.join(format!("{owner}.json")), lease };
        writer.flush()?;
        Ok(writer)
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.lease.heartbeat_at = now;
        self.flush()
    }

    pub fn complete(mut self, now: DateTime<Utc>) -> Result<()> {
        self.lease.heartbeat_at = now;
        self.lease.completed_at = Some(now);
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.lease)?)
            .context("Failed to write lease")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace lease")?;
        Ok(())
    }
}

/// Watchdog-side read of another worker's lease.
pub fn read_lease(leases_dir: &Path, owner: &str) -> Option<Lease> {
    let raw = std::fs::read_to_string(leases_dir.join(format!("{owner}.json"))).ok()?;
    serde_json::from_str(&raw).ok()
}
