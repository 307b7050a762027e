//! Heartbeat: periodic health assessment. Action first, notification second.
//!
//! Each check returns OK / WARNING / ALERT / CRITICAL. CRITICAL checks act
//! before they speak: flash crash and breached limits trigger the emergency
//! sell-all and the kill switch, then the operator hears about it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::application::context::RuntimeContext;
use crate::domain::ports::NotifyLevel;
use crate::domain::position::{ExitPayload, ExitReason, TradeRecord};
use crate::infrastructure::feeds::{
    PortfolioState, PriceCache, PriceHistory, load_json_or_default, save_json_atomic,
};
use crate::infrastructure::notify::notify_best_effort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CheckStatus {
    Ok,
    Warning,
    Alert,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

fn check(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> CheckResult {
    CheckResult { name, status, detail: detail.into() }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HeartbeatState {
    last_summary_at: Option<DateTime<Utc>>,
}

pub struct Heartbeat<'a> {
    ctx: &'a RuntimeContext,
}

impl<'a> Heartbeat<'a> {
    pub fn new(ctx: &'a RuntimeContext) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<Vec<CheckResult>> {
        let state_dir = self.ctx.config.state_dir();
        let portfolio = PortfolioState::load_or_default(&state_dir);
        let cache = PriceCache::load(&state_dir);
        let mut results = Vec::new();

        results.push(self.check_kill_switch());
        results.push(self.check_positions(&cache).await?);
        results.push(self.check_exposure(&portfolio, now).await?);
        results.push(self.check_flash_crash(&cache, now).await?);
        results.push(self.check_cron_freshness(now));
        results.push(self.check_clock_skew(now).await);
        results.push(self.check_circuit_breakers());
        results.push(self.check_learning_backlog(now).await?);
        results.push(self.check_queue_backlog(now).await?);
        results.push(self.check_escalation(now));

        for result in &results {
            match result.status {
                CheckStatus::Critical => warn!("[CRITICAL] {}: {}", result.name, result.detail),
                CheckStatus::Alert => warn!("[ALERT] {}: {}", result.name, result.detail),
                CheckStatus::Warning => info!("[WARNING] {}: {}", result.name, result.detail),
                CheckStatus::Ok => info!("[OK] {}: {}", result.name, result.detail),
            }
        }

        // Alerts notify; criticals already acted inside their check.
        for result in results.iter().filter(|r| r.status >= CheckStatus::Alert) {
            let level = if result.status == CheckStatus::Critical { NotifyLevel::L4 } else { NotifyLevel::L3 };
            notify_best_effort(
                self.ctx.notifier.as_ref(),
                &format!("{}: {}", result.name, result.detail),
                level,
                Some("Heartbeat"),
            )
            .await;
        }

        self.maybe_send_hourly_summary(&results, now).await;
        Ok(results)
    }

    fn check_kill_switch(&self) -> CheckResult {
        if self.ctx.kill_switch.is_active() {
            check("kill_switch", CheckStatus::Alert, "Kill switch active — system halted")
        } else {
            check("kill_switch", CheckStatus::Ok, "Kill switch not active")
        }
    }

    /// Positions breaching stop/TP with fresh cached prices mean the monitor
    /// is behind; surface it.
    async fn check_positions(&self, cache: &PriceCache) -> Result<CheckResult> {
        let open = self.ctx.store.get_open_positions().await?;
        let mut breaches = Vec::new();
        for position in &open {
            let Some(price) = cache.get(&position.symbol).map(|p| p.price) else { continue };
            let unrealized = position.unrealized_pct(price);
            if unrealized <= -position.stop_loss_pct {
                breaches.push(format!("{} below stop ({:.1}%)", position.token, unrealized * 100.0));
            } else if unrealized >= position.take_profit_pct {
                breaches.push(format!("{} past target ({:.1}%)", position.token, unrealized * 100.0));
            }
        }
        Ok(if breaches.is_empty() {
            check("positions", CheckStatus::Ok, format!("{} open, none breached", open.len()))
        } else {
            check("positions", CheckStatus::Alert, breaches.join("; "))
        })
    }

    /// Drawdown or daily-loss breaches are CRITICAL: the kill switch goes on
    /// here, not in a follow-up cycle.
    async fn check_exposure(&self, portfolio: &PortfolioState, now: DateTime<Utc>) -> Result<CheckResult> {
        let risk = &self.ctx.config.risk;
        let mut alerts = Vec::new();

        if portfolio.meme_allocation_pct > risk.max_meme_allocation_pct {
            alerts.push(format!(
                "Meme allocation {:.1}% > {:.0}% limit",
                portfolio.meme_allocation_pct, risk.max_meme_allocation_pct
            ));
        }

        if portfolio.current_drawdown_pct >= risk.max_drawdown_pct {
            let reason = format!("Max drawdown exceeded: {:.1}%", portfolio.current_drawdown_pct);
            self.ctx.kill_switch.activate(&reason, now)?;
            return Ok(check("exposure", CheckStatus::Critical, reason));
        }

        if portfolio.daily_pnl_pct <= -risk.daily_loss_limit_pct {
            let reason = format!("Daily loss limit hit: {:.1}%", portfolio.daily_pnl_pct);
            self.ctx.kill_switch.activate(&reason, now)?;
            return Ok(check("exposure", CheckStatus::Critical, reason));
        }

        Ok(if alerts.is_empty() {
            check(
                "exposure",
                CheckStatus::Ok,
                format!(
                    "Meme {:.1}%, drawdown {:.1}%, daily {:.1}%",
                    portfolio.meme_allocation_pct, portfolio.current_drawdown_pct, portfolio.daily_pnl_pct
                ),
            )
        } else {
            check("exposure", CheckStatus::Alert, alerts.join("; "))
        })
    }

    /// Flash crash works even with every LLM endpoint down: deterministic
    /// price-history scan, then emergency sell-all.
    async fn check_flash_crash(&self, cache: &PriceCache, now: DateTime<Utc>) -> Result<CheckResult> {
        let history = PriceHistory::load(&self.ctx.config.state_dir());
        for symbol in history.series.keys() {
            let Some(recent) = history.recent_price(symbol, now) else { continue };
            let Some(old) = history.price_near(symbol, now, 15) else { continue };
            if old <= rust_decimal::Decimal::ZERO {
                continue;
            }
            let drop = ((old - recent) / old).to_f64().unwrap_or(0.0);
            if drop > 0.10 {
                let reason = format!("Flash crash: {symbol} -{:.1}% in 15min", drop * 100.0);
                let closed = self.emergency_sell_all(&reason, cache, now).await?;
                return Ok(check(
                    "flash_crash",
                    CheckStatus::Critical,
                    format!("{reason} — {closed} positions closed"),
                ));
            }
        }
        Ok(check("flash_crash", CheckStatus::Ok, "No flash crashes detected"))
    }

    fn check_cron_freshness(&self, now: DateTime<Utc>) -> CheckResult {
        #[derive(Default, Deserialize)]
        struct CronEntry {
            last_run: Option<DateTime<Utc>>,
        }
        #[derive(Default, Deserialize)]
        struct CronHealth {
            #[serde(flatten)]
            jobs: std::collections::BTreeMap<String, CronEntry>,
        }

        let cron: CronHealth = load_json_or_default(&self.ctx.config.state_dir().join("cron_health.json"));
        if cron.jobs.is_empty() {
            return check("cron", CheckStatus::Warning, "No cron health data");
        }

        let expected = [("reconciliation", 30i64), ("signal_router", 45), ("position_monitor", 15)];
        let mut stale = Vec::new();
        for (name, max_age_min) in expected {
            match cron.jobs.get(name).and_then(|j| j.last_run) {
                Some(last) => {
                    let age = (now - last).num_minutes();
                    if age > max_age_min {
                        stale.push(format!("{name}: last ran {age}min ago (max {max_age_min}min)"));
                    }
                }
                None => stale.push(format!("{name}: never ran")),
            }
        }
        if stale.is_empty() {
            check("cron", CheckStatus::Ok, "All crons fresh")
        } else {
            check("cron", CheckStatus::Alert, stale.join("; "))
        }
    }

    /// Container-safe clock check: exchange server time is the skew
    /// reference when NTP is unreachable.
    async fn check_clock_skew(&self, now: DateTime<Utc>) -> CheckResult {
        match self.ctx.exchange.server_time().await {
            Ok(server) => {
                let skew = (now - server).num_seconds().abs();
                if skew > 30 {
                    check("clock", CheckStatus::Alert, format!("Clock skew {skew}s vs exchange"))
                } else {
                    check("clock", CheckStatus::Ok, format!("Skew {skew}s"))
                }
            }
            Err(e) => check("clock", CheckStatus::Warning, format!("No skew reference: {e}")),
        }
    }

    fn check_circuit_breakers(&self) -> CheckResult {
        let open = crate::infrastructure::core::circuit_breaker::read_open_components(
            &self.ctx.breaker_state_path(),
        );
        if open.is_empty() {
            check("breakers", CheckStatus::Ok, "All circuit breakers closed")
        } else if open.len() >= self.ctx.config.circuit_breakers.simultaneous_trip_pause {
            check("breakers", CheckStatus::Alert, format!("{} breakers open: {}", open.len(), open.join(", ")))
        } else {
            check("breakers", CheckStatus::Warning, format!("Open: {}", open.join(", ")))
        }
    }

    /// Executed positions without completed cold-path analysis, older than
    /// an hour, mean the learning loop is starving.
    async fn check_learning_backlog(&self, now: DateTime<Utc>) -> Result<CheckResult> {
        let open = self.ctx.store.get_open_positions().await?;
        let unanalyzed = open
            .iter()
            .filter(|p| !p.async_analysis_complete && (now - p.created_at).num_hours() >= 1)
            .count();
        Ok(if unanalyzed > 0 {
            check("learning_backlog", CheckStatus::Warning, format!("{unanalyzed} positions unanalyzed >1h"))
        } else {
            check("learning_backlog", CheckStatus::Ok, "No backlog")
        })
    }

    async fn check_queue_backlog(&self, now: DateTime<Utc>) -> Result<CheckResult> {
        let timeout = self.ctx.config.cold_path.timeout_seconds as i64;
        let (stale_pending, stuck_running) = self
            .ctx
            .store
            .task_backlog(
                now - chrono::Duration::minutes(30),
                now - chrono::Duration::seconds(timeout + 300),
            )
            .await?;
        Ok(if stuck_running > 0 {
            check(
                "async_queue",
                CheckStatus::Alert,
                format!("{stuck_running} RUNNING tasks stuck beyond timeout+grace, {stale_pending} stale PENDING"),
            )
        } else if stale_pending > 0 {
            check("async_queue", CheckStatus::Warning, format!("{stale_pending} PENDING tasks stale >30min"))
        } else {
            check("async_queue", CheckStatus::Ok, "Queue healthy")
        })
    }

    /// Unanswered operator escalations past their deadline page a human.
    fn check_escalation(&self, now: DateTime<Utc>) -> CheckResult {
        #[derive(Default, Deserialize)]
        struct Escalation {
            deadline: Option<DateTime<Utc>>,
            resolved: Option<bool>,
            component: Option<String>,
        }

        let escalation: Escalation =
            load_json_or_default(&self.ctx.config.state_dir().join("escalation.json"));
        match (escalation.deadline, escalation.resolved) {
            (Some(deadline), Some(false) | None) if now > deadline => check(
                "escalation",
                CheckStatus::Alert,
                format!(
                    "Escalation for {} unanswered past deadline",
                    escalation.component.unwrap_or_else(|| "unknown".into())
                ),
            ),
            (Some(_), Some(false) | None) => check("escalation", CheckStatus::Ok, "Escalation open, within deadline"),
            _ => check("escalation", CheckStatus::Ok, "No open escalations"),
        }
    }

    /// Close every open position, then flip the kill switch. Paper closes go
    /// straight through the store at the cached (or entry) price.
    pub async fn emergency_sell_all(
        &self,
        reason: &str,
        cache: &PriceCache,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let open = self.ctx.store.get_open_positions().await?;
        warn!("EMERGENCY SELL ALL: {reason} (positions={})", open.len());

        let mut closed = 0usize;
        for position in &open {
            let exit_price = cache.get(&position.symbol).map(|p| p.price).unwrap_or(position.entry_price);
            let (pnl_usd, pnl_pct, fee_usd) = crate::domain::position::compute_paper_pnl(
                position.entry_price,
                exit_price,
                position.size_token,
                rust_decimal::Decimal::new(1, 3),
            );
            let exit = ExitPayload {
                exit_price,
                exit_reason: ExitReason::EmergencySell,
                detail: reason.to_string(),
                pnl_usd,
                pnl_pct,
                fee_usd,
                closed_at: now,
            };
            match self.ctx.store.update_position_close(&position.position_id, &exit).await {
                Ok(()) => {
                    closed += 1;
                    let _ = self
                        .ctx
                        .store
                        .insert_trade(&TradeRecord {
                            position_id: position.position_id.clone(),
                            token: position.token.clone(),
                            symbol: position.symbol.clone(),
                            side: "SELL",
                            entry_price: position.entry_price,
                            exit_price,
                            size_usd: position.size_usd,
                            pnl_usd,
                            pnl_pct,
                            fee_usd,
                            exit_reason: ExitReason::EmergencySell.as_str().to_string(),
                            strategy_id: position.strategy_id.clone(),
                            timestamp: now,
                            exit_slippage_pct: None,
                        })
                        .await;
                }
                Err(e) => warn!("Emergency close failed for {}: {e}", position.position_id),
            }
        }

        self.ctx.kill_switch.activate(&format!("Emergency sell all: {reason}"), now)?;
        notify_best_effort(
            self.ctx.notifier.as_ref(),
            &format!("EMERGENCY SELL ALL: {reason}. {closed} positions closed."),
            NotifyLevel::L4,
            Some("EMERGENCY"),
        )
        .await;
        Ok(closed)
    }

    async fn maybe_send_hourly_summary(&self, results: &[CheckResult], now: DateTime<Utc>) {
        let state_dir = self.ctx.config.state_dir();
        let path = state_dir.join("heartbeat_state.json");
        let mut state: HeartbeatState = load_json_or_default(&path);

        let due = state
            .last_summary_at
            .is_none_or(|last| (now - last).num_minutes() >= 60);
        if !due {
            return;
        }

        let worst = results.iter().map(|r| r.status).max().unwrap_or(CheckStatus::Ok);
        let portfolio = PortfolioState::load_or_default(&state_dir);
        let summary = format!(
            "Heartbeat {:?}: balance ${:.0}, {} open, daily {:+.1}%, drawdown {:.1}%",
            worst,
            portfolio.current_balance_usd,
            portfolio.open_position_count,
            portfolio.daily_pnl_pct,
            portfolio.current_drawdown_pct
        );
        notify_best_effort(self.ctx.notifier.as_ref(), &summary, NotifyLevel::L1, Some("Hourly status")).await;

        state.last_summary_at = Some(now);
        if let Err(e) = save_json_atomic(&path, &state) {
            warn!("Heartbeat state write failed: {e}");
        }
    }
}
