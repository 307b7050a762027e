//! Watchdog: tiered self-healing for stalled components.
//!
//! A component is healthy iff its lease is fresh OR its output files are
//! fresh within the TTL. When both are stale, remediation escalates through
//! tiers; attempt counters persist to disk because cron restarts must not
//! reset them. Counters reset only when a later cycle observes the
//! component healthy again.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::application::context::RuntimeContext;
use crate::application::router::SignalRouter;
use crate::domain::ports::NotifyLevel;
use crate::infrastructure::feeds::{load_json_or_default, save_json_atomic};
use crate::infrastructure::leases::read_lease;
use crate::infrastructure::notify::notify_best_effort;

/// Stale `.lock` marker files are reclaimed after this many minutes.
const LOCK_TTL_MINUTES: i64 = 15;
/// Operator gets this long to answer a Tier-3.5 diagnostic package.
const ESCALATION_DEADLINE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    /// Kill process, clear stale lock file.
    Tier1,
    /// Kill plus a forced synchronous run.
    Tier2,
    /// Kill plus the emergency fast-path flag.
    Tier3,
    /// Diagnostic package for the external operator agent.
    Tier3_5,
    /// Pause flag and a high-urgency page.
    Tier4,
}

impl Tier {
    fn for_attempt(attempt: u32) -> Tier {
        match attempt {
            0 | 1 => Tier::Tier1,
            2 => Tier::Tier2,
            3 => Tier::Tier3,
            4 => Tier::Tier3_5,
            _ => Tier::Tier4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_tier: Option<Tier>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptLedger {
    #[serde(flatten)]
    pub components: BTreeMap<String, AttemptRecord>,
}

impl AttemptLedger {
    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("watchdog_attempts.json")
    }

    pub fn load(state_dir: &Path) -> Self {
        load_json_or_default(&Self::path(state_dir))
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        save_json_atomic(&Self::path(state_dir), self)
    }

    pub fn track(&mut self, component: &str, now: DateTime<Utc>) -> u32 {
        let record = self.components.entry(component.to_string()).or_default();
        record.count += 1;
        record.last_attempt = Some(now);
        record.count
    }

    /// Explicit recovery signal: observed health resets the counter.
    pub fn reset(&mut self, component: &str) {
        if let Some(record) = self.components.get_mut(component)
            && record.count > 0
        {
            info!("Watchdog: {component} healthy again — resetting attempts (was {})", record.count);
            record.count = 0;
            record.last_tier = None;
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResetRequest {
    job: String,
    reason: String,
    requested_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResetQueue {
    #[serde(default)]
    requests: Vec<ResetRequest>,
}

/// Worker names the watchdog supervises, with the process pattern used for
/// tier kills.
const SUPERVISED: [(&str, &str, u64); 3] = [
    ("signal_router", "sanad-trader run router", 2700),
    ("position_monitor", "sanad-trader run monitor", 1200),
    ("cold_path", "sanad-trader run cold-path", 3600),
];

pub struct Watchdog<'a> {
    ctx: &'a RuntimeContext,
}

impl<'a> Watchdog<'a> {
    pub fn new(ctx: &'a RuntimeContext) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<()> {
        let state_dir = self.ctx.config.state_dir();
        let mut ledger = AttemptLedger::load(&state_dir);

        self.reclaim_stale_locks(now)?;

        for (component, kill_pattern, ttl_seconds) in SUPERVISED {
            if self.is_healthy(component, ttl_seconds, now) {
                ledger.reset(component);
                continue;
            }

            let attempt = ledger.track(component, now);
            let tier = Tier::for_attempt(attempt);
            warn!("Watchdog: {component} is stale (attempt {attempt}, {tier:?})");
            if let Some(record) = ledger.components.get_mut(component) {
                record.last_tier = Some(tier);
            }
            ledger.save(&state_dir)?;

            self.remediate(component, kill_pattern, tier, now).await?;
        }

        ledger.save(&state_dir)?;
        Ok(())
    }

    /// Lease fresh OR output fresh ⇒ healthy. Both stale ⇒ remediate and
    /// queue a reset request for the reset daemon.
    fn is_healthy(&self, component: &str, ttl_seconds: u64, now: DateTime<Utc>) -> bool {
        let leases_dir = self.ctx.config.leases_dir();
        if let Some(lease) = read_lease(&leases_dir, component)
            && lease.is_fresh(now)
        {
            return true;
        }

        if let Some(age) = self.latest_output_age_seconds(component) {
            if age <= ttl_seconds {
                return true;
            }
        }

        let _ = self.queue_reset(component, now);
        false
    }

    /// Newest mtime across the component's output tree.
    fn latest_output_age_seconds(&self, component: &str) -> Option<u64> {
        let dir = match component {
            "signal_router" => self.ctx.config.state_dir(),
            "position_monitor" => self.ctx.config.state_dir(),
            _ => self.ctx.config.logs_dir(),
        };
        let mut newest: Option<std::time::SystemTime> = None;
        for entry in std::fs::read_dir(dir).ok()?.flatten() {
            if let Ok(meta) = entry.metadata()
                && let Ok(mtime) = meta.modified()
                && newest.is_none_or(|best| mtime > best)
            {
                newest = Some(mtime);
            }
        }
        newest.and_then(|t| t.elapsed().ok()).map(|d| d.as_secs())
    }

    async fn remediate(
        &self,
        component: &str,
        kill_pattern: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match tier {
            Tier::Tier1 => {
                self.kill_process(kill_pattern);
                self.clear_component_lock(component);
            }
            Tier::Tier2 => {
                self.kill_process(kill_pattern);
                if component == "signal_router" {
                    info!("Watchdog Tier 2: forcing synchronous router run");
                    if let Err(e) = SignalRouter::new(self.ctx).run_cycle(now).await {
                        warn!("Forced router run failed: {e}");
                    }
                }
            }
            Tier::Tier3 => {
                self.kill_process(kill_pattern);
                self.ctx.fast_path_flag.set(&format!("set by watchdog for {component}"))?;
                info!("Watchdog Tier 3: emergency fast-path flag set");
            }
            Tier::Tier3_5 => {
                self.write_diagnostic_package(component, now)?;
            }
            Tier::Tier4 => {
                self.ctx.pause_flag.set(&format!("paused by watchdog: {component} unrecoverable"))?;
                notify_best_effort(
                    self.ctx.notifier.as_ref(),
                    &format!("Watchdog Tier 4: {component} unrecoverable after repeated remediation. Router paused — operator intervention required."),
                    NotifyLevel::L4,
                    Some("WATCHDOG"),
                )
                .await;
            }
        }
        Ok(())
    }

    fn kill_process(&self, pattern: &str) {
        match std::process::Command::new("pkill").args(["-f", pattern]).status() {
            Ok(status) if status.success() => info!("Killed process matching '{pattern}'"),
            Ok(_) => info!("No process matching '{pattern}'"),
            Err(e) => warn!("pkill failed: {e}"),
        }
    }

    fn clear_component_lock(&self, component: &str) {
        let lock = self.ctx.config.state_dir().join(format!("{component}.lock"));
        if lock.exists() {
            match std::fs::remove_file(&lock) {
                Ok(()) => info!("Cleared lock file {}", lock.display()),
                Err(e) => warn!("Lock clear failed: {e}"),
            }
        }
    }

    /// `.lock` markers past their 15-minute TTL belong to dead processes.
    fn reclaim_stale_locks(&self, _now: DateTime<Utc>) -> Result<()> {
        let state_dir = self.ctx.config.state_dir();
        let Ok(entries) = std::fs::read_dir(&state_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age.as_secs() as i64 > LOCK_TTL_MINUTES * 60);
            if stale {
                match std::fs::remove_file(&path) {
                    Ok(()) => warn!("Reclaimed stale lock {}", path.display()),
                    Err(e) => warn!("Stale lock removal failed: {e}"),
                }
            }
        }
        Ok(())
    }

    /// Tier 3.5: everything an external operator agent needs, at a
    /// well-known path, with a 30-minute response deadline.
    fn write_diagnostic_package(&self, component: &str, now: DateTime<Utc>) -> Result<()> {
        let state_dir = self.ctx.config.state_dir();
        let ledger = AttemptLedger::load(&state_dir);
        let lease = read_lease(&self.ctx.config.leases_dir(), component);

        let package = serde_json::json!({
            "component": component,
            "created_at": now.to_rfc3339(),
            "deadline": (now + chrono::Duration::minutes(ESCALATION_DEADLINE_MINUTES)).to_rfc3339(),
            "attempts": ledger.components.get(component),
            "lease": lease,
            "output_age_seconds": self.latest_output_age_seconds(component),
            "open_breakers": crate::infrastructure::core::circuit_breaker::read_open_components(
                &self.ctx.breaker_state_path()
            ),
        });

        let path = state_dir.join("escalation.json");
        save_json_atomic(
            &path,
            &serde_json::json!({
                "component": component,
                "deadline": (now + chrono::Duration::minutes(ESCALATION_DEADLINE_MINUTES)).to_rfc3339(),
                "resolved": false,
                "package": package,
            }),
        )?;
        warn!("Watchdog Tier 3.5: diagnostic package written to {}", path.display());
        Ok(())
    }

    fn queue_reset(&self, component: &str, now: DateTime<Utc>) -> Result<()> {
        let state_dir = self.ctx.config.state_dir();
        let path = state_dir.join("reset_requests.json");
        let mut queue: ResetQueue = load_json_or_default(&path);
        if queue.requests.iter().any(|r| r.job == component) {
            return Ok(());
        }
        queue.requests.push(ResetRequest {
            job: component.to_string(),
            reason: "lease and output both stale".into(),
            requested_at: now,
        });
        save_json_atomic(&path, &queue)
    }
}
