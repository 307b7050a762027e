//! Signal router: select the best candidate each cycle and feed it to the
//! pipeline, respecting the daily run budget, cooldowns and position limits.

pub mod scoring;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::application::context::RuntimeContext;
use crate::application::pipeline;
use crate::domain::decision::{DecisionRecord, DecisionResult, PipelineStage, StageTimings};
use crate::domain::ids::{make_decision_id, make_signal_id};
use crate::domain::signal::{CorroborationQuality, Signal};
use crate::domain::token_profile::{SimpleTier, TokenProfile};
use crate::infrastructure::feeds::{
    PortfolioState, RejectionCooldowns, latest_signal_file, load_market_regime, save_json_atomic,
};

use scoring::{is_cex_listed, score_signal};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterState {
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_hashes: Vec<String>,
    #[serde(default)]
    pub daily_pipeline_runs: u32,
    pub daily_reset_date: Option<String>,
    #[serde(default)]
    pub signals_scanned: usize,
    #[serde(default)]
    pub signals_filtered: usize,
}

impl RouterState {
    fn path(state_dir: &std::path::Path) -> std::path::PathBuf {
        state_dir.join("signal_router_state.json")
    }

    pub fn load(state_dir: &std::path::Path) -> Self {
        crate::infrastructure::feeds::load_json_or_default(&Self::path(state_dir))
    }

    pub fn save(&self, state_dir: &std::path::Path) -> Result<()> {
        save_json_atomic(&Self::path(state_dir), self)
    }
}

/// Short content hash for the processed-this-day set.
fn signal_hash(signal: &Signal) -> String {
    let key = format!("{}|{}|{}", signal.token, signal.signal_type, signal.source_primary);
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

pub struct SignalRouter<'a> {
    ctx: &'a RuntimeContext,
}

impl<'a> SignalRouter<'a> {
    pub fn new(ctx: &'a RuntimeContext) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<()> {
        if self.ctx.pause_flag.is_set() {
            warn!("Router pause flag present — exiting without running");
            return Ok(());
        }

        let state_dir = self.ctx.config.state_dir();
        let mut state = RouterState::load(&state_dir);

        // Daily counters reset at midnight UTC
        let today = now.format("%Y-%m-%d").to_string();
        if state.daily_reset_date.as_deref() != Some(&today) {
            state.daily_pipeline_runs = 0;
            state.daily_reset_date = Some(today);
            state.processed_hashes.clear();
        }

        let max_runs = self.ctx.config.router.max_daily_runs;
        if state.daily_pipeline_runs >= max_runs {
            info!(
                "Daily pipeline budget exhausted ({}/{max_runs} runs). Skipping.",
                state.daily_pipeline_runs
            );
            state.last_run = Some(now);
            state.save(&state_dir)?;
            return Ok(());
        }

        // Load latest signals per feed directory
        let signals_dir = self.ctx.config.signals_dir();
        let stale = self.ctx.config.router.stale_threshold_minutes;
        let (cg_path, cg_signals, cg_age) =
            latest_signal_file(&signals_dir.join("coingecko"), stale, &["global_latest.json"]);
        let (dex_path, dex_signals, dex_age) =
            latest_signal_file(&signals_dir.join("dexscreener"), stale, &[]);
        let (be_path, be_signals, be_age) =
            latest_signal_file(&signals_dir.join("birdeye"), stale, &[]);

        let label = |name: &str, count: usize, age: f64, path: &Option<std::path::PathBuf>| {
            if count > 0 {
                format!("{name} {count} ({age:.0}min ago)")
            } else if path.is_some() {
                format!("{name} 0 ({age:.0}min ago, stale)")
            } else {
                format!("{name} no files")
            }
        };
        info!(
            "Loading signals: {}, {}, {}",
            label("CoinGecko", cg_signals.len(), cg_age, &cg_path),
            label("DexScreener", dex_signals.len(), dex_age, &dex_path),
            label("Birdeye", be_signals.len(), be_age, &be_path)
        );

        let mut all: Vec<(Signal, &'static str, f64)> = Vec::new();
        for s in cg_signals {
            all.push((s, "coingecko", cg_age));
        }
        for s in dex_signals {
            all.push((s, "dexscreener", dex_age));
        }
        for s in be_signals {
            all.push((s, "birdeye", be_age));
        }

        if all.is_empty() {
            info!("No actionable signals — no recent data from any source.");
            state.last_run = Some(now);
            state.save(&state_dir)?;
            return Ok(());
        }

        // System state
        let open_positions = self.ctx.store.get_open_positions().await?;
        let open_tokens: BTreeSet<String> =
            open_positions.iter().map(|p| p.token.to_uppercase()).collect();
        let portfolio = PortfolioState::load_or_default(&state_dir);
        let max_positions = self.ctx.config.policy_gates.max_concurrent_positions;
        let available_slots = max_positions.saturating_sub(open_tokens.len());

        info!(
            "Open positions: {} ({}). Available slots: {available_slots}",
            open_tokens.len(),
            if open_tokens.is_empty() {
                "none".to_string()
            } else {
                open_tokens.iter().cloned().collect::<Vec<_>>().join(", ")
            }
        );

        if portfolio.daily_pnl_pct <= -self.ctx.config.risk.daily_loss_limit_pct {
            warn!("Daily loss limit hit — skipping ALL signals.");
            state.last_run = Some(now);
            state.save(&state_dir)?;
            return Ok(());
        }
        if available_slots == 0 {
            info!("Max positions reached ({max_positions}). Skipping ALL signals.");
            state.last_run = Some(now);
            state.save(&state_dir)?;
            return Ok(());
        }

        // Cross-source corroboration: a token in 2+ feeds is Tawatur/Mashhur
        let per_origin_tokens: Vec<(&str, BTreeSet<String>)> = ["coingecko", "dexscreener", "birdeye"]
            .iter()
            .map(|origin| {
                let tokens = all
                    .iter()
                    .filter(|(_, o, _)| o == origin)
                    .map(|(s, _, _)| s.token.to_uppercase())
                    .collect();
                (*origin, tokens)
            })
            .collect();

        let cross_count = |token: &str| -> usize {
            per_origin_tokens.iter().filter(|(_, set)| set.contains(token)).count()
        };
        let cross_origins = |token: &str| -> Vec<String> {
            per_origin_tokens
                .iter()
                .filter(|(_, set)| set.contains(token))
                .map(|(origin, _)| origin.to_string())
                .collect()
        };

        let cross_tokens: BTreeSet<String> = per_origin_tokens
            .iter()
            .flat_map(|(_, set)| set.iter().cloned())
            .filter(|token| cross_count(token) >= 2)
            .collect();
        if !cross_tokens.is_empty() {
            info!(
                "Cross-source (Tawatur) matches: {}",
                cross_tokens.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }

        // Market regime adjustment
        let (regime, fg_value) = load_market_regime(&signals_dir);
        let adjustment = regime.score_adjustment();
        match fg_value {
            Some(value) => info!(
                "Market regime: {} ({value}) — applying {adjustment:+} to all scores",
                regime.tag()
            ),
            None => info!("Market regime: UNKNOWN (no fear/greed data)"),
        }

        // Filter and score
        let processed: BTreeSet<String> = state.processed_hashes.iter().cloned().collect();
        let rejection_cooldowns = RejectionCooldowns::load(&state_dir);
        let mut filtered_reasons: Vec<String> = Vec::new();
        let mut candidates: Vec<(Signal, i32)> = Vec::new();

        state.signals_scanned = all.len();
        for (mut signal, _origin, age) in all {
            let token = signal.token.to_uppercase();
            if token.is_empty() {
                continue;
            }

            if open_tokens.contains(&token) {
                filtered_reasons.push(format!("{token} (already open)"));
                continue;
            }
            if let Some(last) = self.ctx.store.last_trade_at(&token).await? {
                let cooldown = chrono::Duration::minutes(self.ctx.config.policy_gates.cooldown_minutes);
                let elapsed = now - last;
                if elapsed < cooldown {
                    filtered_reasons.push(format!(
                        "{token} (cooldown {}min remaining)",
                        (cooldown - elapsed).num_minutes()
                    ));
                    continue;
                }
            }
            if processed.contains(&signal_hash(&signal)) {
                continue;
            }

            signal.cex_listed = signal.cex_listed || is_cex_listed(&token);
            signal.cross_source_count = cross_count(&token).max(1);
            signal.cross_sources = cross_origins(&token);
            // Paid-placement-only corroboration earns partial credit
            signal.corroboration_quality = if signal.cross_sources.iter().any(|s| s != "dexscreener") {
                CorroborationQuality::Strong
            } else {
                CorroborationQuality::Weak
            };

            if let Some(reason) = pre_sanad_reject(
                &signal,
                &rejection_cooldowns,
                self.ctx.config.router.rejection_cooldown_minutes,
                self.ctx.config.sanad.signal_max_age_minutes,
                now,
            ) {
                filtered_reasons.push(format!("{token} ({reason})"));
                continue;
            }

            let is_cross = cross_tokens.contains(&token);
            let mut score = score_signal(&signal, age, is_cross) + adjustment;
            // RugCheck quality bonus
            if signal.rugcheck_score.is_some_and(|s| s > 70.0) {
                score += 10;
            }
            candidates.push((signal, score.max(0)));
        }

        if !filtered_reasons.is_empty() {
            info!("Filtered: {}", filtered_reasons.join(", "));
        }
        state.signals_filtered = state.signals_scanned - candidates.len();

        if candidates.is_empty() {
            info!("No actionable signals after filtering.");
            state.last_run = Some(now);
            state.save(&state_dir)?;
            return Ok(());
        }

        // Rank: score, then CEX listing, then corroboration, then survived age
        candidates.sort_by(|(a, sa), (b, sb)| {
            sb.cmp(sa)
                .then_with(|| b.cex_listed.cmp(&a.cex_listed))
                .then_with(|| b.cross_source_count.cmp(&a.cross_source_count))
                .then_with(|| {
                    b.token_age_hours
                        .partial_cmp(&a.token_age_hours)
                        .unwrap_or(Ordering::Equal)
                })
        });

        info!("Scoring {} candidates...", candidates.len());
        for (rank, (signal, score)) in candidates.iter().take(10).enumerate() {
            let mut extras: Vec<String> = Vec::new();
            if let Some(top10) = signal.top10_holder_pct.filter(|p| *p > 0.0) {
                extras.push(format!("top10={top10:.0}%"));
            }
            if let Some(holders) = signal.holder_count.filter(|h| *h > 0) {
                extras.push(format!("{holders} holders"));
            }
            if let Some(age) = signal.token_age_hours {
                extras.push(if age < 24.0 {
                    format!("age {age:.0}h")
                } else {
                    format!("age {:.0}d", age / 24.0)
                });
            }
            if let Some(vol) = signal.volume_24h {
                extras.push(format!("vol ${vol:.0}"));
            }
            let cross_tag = if cross_tokens.contains(&signal.token.to_uppercase()) {
                " <- CROSS-SOURCE"
            } else {
                ""
            };
            info!(
                "  {}. {} — score {score} ({} {}, {}){cross_tag}",
                rank + 1,
                signal.token,
                signal.source_primary,
                signal.signal_type,
                extras.join(", ")
            );
        }

        // Select and dispatch
        let (mut selected, selected_score) = candidates.swap_remove(0);
        info!("Selected: {} (score {selected_score}) -> feeding to pipeline", selected.token);
        selected
            .extras
            .insert("router_score".into(), serde_json::json!(selected_score));

        state.processed_hashes.push(signal_hash(&selected));
        state.daily_pipeline_runs += 1;
        state.last_run = Some(now);
        state.save(&state_dir)?;

        let pipeline_timeout = std::time::Duration::from_secs(self.ctx.config.router.pipeline_timeout_seconds);
        match timeout(pipeline_timeout, pipeline::run_pipeline(self.ctx, selected.clone())).await {
            Ok(Ok(record)) => {
                info!("Pipeline result: {} ({})", record.result, record.reason_code);
            }
            Ok(Err(e)) => {
                warn!("Pipeline crashed: {e} — recording SKIP");
                self.record_skip(&selected, "PIPELINE_ERROR", now).await?;
            }
            Err(_) => {
                warn!(
                    "Pipeline TIMEOUT (>{}s) — aborting. Will not retry.",
                    pipeline_timeout.as_secs()
                );
                self.record_skip(&selected, "PIPELINE_TIMEOUT", now).await?;
            }
        }

        Ok(())
    }

    /// A timed-out or crashed pipeline still leaves a decision row.
    async fn record_skip(&self, signal: &Signal, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let signal_id = make_signal_id(signal);
        let decision_id = make_decision_id(&signal_id, &self.ctx.config.policy_version);
        let record = DecisionRecord {
            decision_id,
            signal_id,
            created_at: now,
            policy_version: self.ctx.config.policy_version.clone(),
            result: DecisionResult::Skip,
            stage: PipelineStage::Intake,
            reason_code: reason.to_string(),
            token_address: signal.token_address.clone(),
            chain: signal.chain.clone(),
            source_primary: Some(signal.source_primary.clone()),
            signal_type: Some(signal.signal_type.clone()),
            score_total: None,
            strategy_id: None,
            position_usd: None,
            gate_failed: None,
            evidence_json: None,
            timings_json: serde_json::to_string(&StageTimings::default())?,
            decision_packet_json: "{}".to_string(),
        };
        self.ctx.store.insert_decision(&record).await?;
        Ok(())
    }
}

/// Deterministic pre-LLM rejection of obvious garbage. No LLM calls.
pub fn pre_sanad_reject(
    signal: &Signal,
    cooldowns: &RejectionCooldowns,
    rejection_cooldown_minutes: i64,
    signal_max_age_minutes: i64,
    now: DateTime<Utc>,
) -> Option<String> {
    // RugCheck score < 30 for non-premium tiers
    if let Some(score) = signal.rugcheck_score
        && score < 30.0
    {
        let tier = TokenProfile::from_signal(signal).simple_tier();
        if !matches!(tier, SimpleTier::Tier1 | SimpleTier::Tier2) {
            return Some(format!("RugCheck score {score:.0} too low (< 30)"));
        }
    }

    // Recently rejected tokens wait out their cooldown
    if let Some(remaining) = cooldowns.remaining_minutes(&signal.token, rejection_cooldown_minutes, now) {
        return Some(format!("rejected {0}min ago — cooldown {remaining}min remaining", rejection_cooldown_minutes - remaining));
    }

    // Paid boosts are advertising, not signal, unless corroborated elsewhere
    if signal.signal_type == "BOOSTED_TOKEN" {
        let has_non_dex = signal.cross_sources.iter().any(|s| s != "dexscreener");
        if signal.cross_source_count <= 1 || !has_non_dex {
            return Some("DexScreener boost-only (advertising)".into());
        }
    }

    // Required fields
    if signal.token.is_empty() || signal.source_primary.is_empty() || signal.thesis.is_empty() {
        return Some("Missing required fields".into());
    }

    // Stale signal
    let age = signal.age_minutes(now);
    if age > signal_max_age_minutes as f64 {
        return Some(format!("signal stale: {age:.0}min old"));
    }

    // Brand-new with unlocked LP
    if let Some(age_hours) = signal.token_age_hours
        && age_hours * 60.0 < 30.0
        && signal.onchain_evidence.as_ref().and_then(|e| e.lp_locked) == Some(false)
    {
        return Some(format!("Token age {:.0}min < 30min with LP unlocked", age_hours * 60.0));
    }

    // Dust-cap with no listing
    if let Some(mc) = signal.market_cap_usd
        && mc < rust_decimal::Decimal::from(1000)
        && !signal.cex_listed
    {
        return Some(format!("Market cap ${mc} < $1000 — not tradeable"));
    }

    None
}
