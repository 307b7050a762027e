//! The seven-stage pipeline: intake → Sanad verification → token
//! classification → strategy match → Bull/Bear debate → policy gates →
//! execute-or-log.
//!
//! Every terminal path writes a decision row. The only component that opens
//! positions is stage 7, and it does so through the atomic open.

pub mod debate;
pub mod execute;
pub mod fast_track;
pub mod prompts_hot;
pub mod sanad;
pub mod strategy;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::context::RuntimeContext;
use crate::domain::decision::{
    DecisionPacket, DecisionRecord, DecisionResult, JudgeSummary, PipelineStage, StageTimings,
};
use crate::domain::ids::{make_decision_id, make_signal_id};
use crate::domain::ports::NotifyLevel;
use crate::domain::signal::Signal;
use crate::domain::token_profile::{SimpleTier, TokenProfile};
use crate::infrastructure::feeds::RejectionCooldowns;
use crate::infrastructure::notify::notify_best_effort;

pub(crate) struct RecordSeed<'a> {
    pub ctx: &'a RuntimeContext,
    pub signal: &'a Signal,
    pub signal_id: String,
    pub decision_id: String,
    pub timings: StageTimings,
}

impl<'a> RecordSeed<'a> {
    fn new(ctx: &'a RuntimeContext, signal: &'a Signal) -> Self {
        let signal_id = make_signal_id(signal);
        let decision_id = make_decision_id(&signal_id, &ctx.config.policy_version);
        Self { ctx, signal, signal_id, decision_id, timings: StageTimings::default() }
    }

    fn record(
        &self,
        result: DecisionResult,
        stage: PipelineStage,
        reason_code: &str,
        strategy_id: Option<String>,
        position_usd: Option<Decimal>,
        gate_failed: Option<u8>,
        evidence_json: Option<String>,
        packet_json: String,
    ) -> DecisionRecord {
        let router_score = self
            .signal
            .extras
            .get("router_score")
            .and_then(|v| v.as_f64());
        DecisionRecord {
            decision_id: self.decision_id.clone(),
            signal_id: self.signal_id.clone(),
            created_at: Utc::now(),
            policy_version: self.ctx.config.policy_version.clone(),
            result,
            stage,
            reason_code: reason_code.to_string(),
            token_address: self.signal.token_address.clone(),
            chain: self.signal.chain.clone(),
            source_primary: Some(self.signal.source_primary.clone()),
            signal_type: Some(self.signal.signal_type.clone()),
            score_total: router_score,
            strategy_id,
            position_usd,
            gate_failed,
            evidence_json,
            timings_json: serde_json::to_string(&self.timings).unwrap_or_else(|_| "{}".into()),
            decision_packet_json: packet_json,
        }
    }

    /// Terminal non-execute path: persist the decision, start the rejection
    /// cooldown, and tell the channel at low priority.
    async fn finish_blocked(
        &self,
        result: DecisionResult,
        stage: PipelineStage,
        reason_code: &str,
        gate_failed: Option<u8>,
        evidence_json: Option<String>,
        packet_json: String,
    ) -> Result<DecisionRecord> {
        let record = self.record(
            result,
            stage,
            reason_code,
            None,
            None,
            gate_failed,
            evidence_json,
            packet_json,
        );
        self.ctx.store.insert_decision(&record).await?;

        if result == DecisionResult::Block {
            let state_dir = self.ctx.config.state_dir();
            let mut cooldowns = RejectionCooldowns::load(&state_dir);
            if let Err(e) = cooldowns.record(&self.signal.token, Utc::now(), &state_dir) {
                warn!("Rejection cooldown write failed: {e}");
            }
            notify_best_effort(
                self.ctx.notifier.as_ref(),
                &format!("Signal Rejected\n\nToken: {}\nReason: {reason_code}", self.signal.token),
                NotifyLevel::L1,
                Some("Signal Rejected"),
            )
            .await;
        }
        Ok(record)
    }
}

/// Run one signal through all seven stages.
pub async fn run_pipeline(ctx: &RuntimeContext, signal: Signal) -> Result<DecisionRecord> {
    let correlation_id = Uuid::new_v4().to_string();
    let mut seed = RecordSeed::new(ctx, &signal);
    info!("Pipeline start: {} [{}]", signal.token, &correlation_id[..8]);

    // ── Stage 1: intake ──
    let stage_start = Instant::now();
    if signal.token.is_empty() || signal.source_primary.is_empty() || signal.thesis.is_empty() {
        seed.timings.record(PipelineStage::Intake, stage_start.elapsed().as_millis() as u64);
        return seed
            .finish_blocked(
                DecisionResult::Block,
                PipelineStage::Intake,
                "MISSING_REQUIRED_FIELDS",
                None,
                None,
                "{}".into(),
            )
            .await;
    }
    let age_minutes = signal.age_minutes(Utc::now());
    if age_minutes > ctx.config.sanad.signal_max_age_minutes as f64 {
        seed.timings.record(PipelineStage::Intake, stage_start.elapsed().as_millis() as u64);
        return seed
            .finish_blocked(
                DecisionResult::Block,
                PipelineStage::Intake,
                "SIGNAL_STALE",
                None,
                None,
                "{}".into(),
            )
            .await;
    }
    seed.timings.record(PipelineStage::Intake, stage_start.elapsed().as_millis() as u64);

    // Kill switch fails fast before any LLM spend: the gates run against a
    // minimal packet and gate 1 records the block.
    if ctx.kill_switch.is_active() {
        let packet = DecisionPacket::empty(&correlation_id);
        let outcome = execute::run_policy(ctx, &packet).await;
        let packet_json = serde_json::to_string(&packet).unwrap_or_else(|_| "{}".into());
        return seed
            .finish_blocked(
                DecisionResult::Block,
                PipelineStage::Policy,
                outcome.gate_failed_name.as_deref().unwrap_or("Kill Switch"),
                outcome.gate_failed,
                serde_json::to_string(&outcome.all_evidence).ok(),
                packet_json,
            )
            .await;
    }

    // Fast-track short-circuit for corroborated Tier-1/2 signals
    if let Some(record) = fast_track::try_fast_track(ctx, &signal, &correlation_id).await? {
        return Ok(record);
    }

    // ── Stage 2: Sanad verification ──
    let stage_start = Instant::now();
    let sanad_outcome = match sanad::run(ctx, &signal).await {
        Ok(outcome) => outcome,
        Err(blocked) => {
            seed.timings.record(PipelineStage::Sanad, stage_start.elapsed().as_millis() as u64);
            let reason = if blocked.hard_gate { "SANAD_HARD_GATE" } else { "SANAD_FAIL_CLOSED" };
            return seed
                .finish_blocked(
                    DecisionResult::Block,
                    PipelineStage::Sanad,
                    reason,
                    None,
                    serde_json::to_string(&blocked).ok(),
                    "{}".into(),
                )
                .await;
        }
    };
    seed.timings.record(PipelineStage::Sanad, stage_start.elapsed().as_millis() as u64);

    if sanad_outcome.recommendation == "BLOCK" {
        return seed
            .finish_blocked(
                DecisionResult::Block,
                PipelineStage::Sanad,
                "SANAD_BLOCK",
                None,
                serde_json::to_string(&sanad_outcome).ok(),
                "{}".into(),
            )
            .await;
    }

    // ── Stage 3: token classification ──
    let stage_start = Instant::now();
    let profile = TokenProfile::from_signal(&signal);
    let tier = profile.simple_tier();
    info!("Tier: {} -> {tier}", profile.asset_tier.map(|t| t.to_string()).unwrap_or_default());

    if tier == SimpleTier::Skip {
        seed.timings.record(PipelineStage::Classify, stage_start.elapsed().as_millis() as u64);
        return seed
            .finish_blocked(
                DecisionResult::Skip,
                PipelineStage::Classify,
                "TIER_SKIP",
                None,
                None,
                "{}".into(),
            )
            .await;
    }
    if let Err(block_reason) = crate::domain::token_profile::meme_safety_gate(&profile) {
        warn!("TIER_3 SAFETY GATE BLOCK: {block_reason}");
        seed.timings.record(PipelineStage::Classify, stage_start.elapsed().as_millis() as u64);
        return seed
            .finish_blocked(
                DecisionResult::Block,
                PipelineStage::Classify,
                &format!("MEME_SAFETY_GATE: {block_reason}"),
                None,
                None,
                "{}".into(),
            )
            .await;
    }
    seed.timings.record(PipelineStage::Classify, stage_start.elapsed().as_millis() as u64);

    // ── Stage 4: strategy match ──
    let stage_start = Instant::now();
    let (regime, _) = crate::infrastructure::feeds::load_market_regime(&ctx.config.signals_dir());
    let strategy_outcome = strategy::run(ctx, &profile, regime).await?;
    seed.timings.record(PipelineStage::Strategy, stage_start.elapsed().as_millis() as u64);

    // ── Stage 5: debate ──
    let stage_start = Instant::now();
    let debate_outcome =
        match debate::run(ctx, &signal, &sanad_outcome, &strategy_outcome, &profile).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                seed.timings.record(PipelineStage::Debate, stage_start.elapsed().as_millis() as u64);
                return seed
                    .finish_blocked(
                        DecisionResult::Block,
                        PipelineStage::Debate,
                        &reason,
                        None,
                        None,
                        "{}".into(),
                    )
                    .await;
            }
        };
    seed.timings.record(PipelineStage::Debate, stage_start.elapsed().as_millis() as u64);

    // ── Stage 6: policy engine ──
    let stage_start = Instant::now();
    let packet = execute::build_packet(
        ctx,
        &correlation_id,
        &signal,
        &sanad_outcome,
        &strategy_outcome,
        &debate_outcome.judge,
    )
    .await;
    let policy_outcome = execute::run_policy(ctx, &packet).await;
    seed.timings.record(PipelineStage::Policy, stage_start.elapsed().as_millis() as u64);

    let packet_json = serde_json::to_string(&packet).unwrap_or_else(|_| "{}".into());
    let evidence_json = serde_json::to_string(&policy_outcome.all_evidence).ok();

    if !policy_outcome.passed() {
        let reason = policy_outcome
            .gate_evidence
            .clone()
            .unwrap_or_else(|| "policy block".into());
        return seed
            .finish_blocked(
                DecisionResult::Block,
                PipelineStage::Policy,
                &reason,
                policy_outcome.gate_failed,
                evidence_json,
                packet_json,
            )
            .await;
    }

    // ── Stage 7: execute ──
    let stage_start = Instant::now();
    let candidate = seed.record(
        DecisionResult::Execute,
        PipelineStage::Execute,
        "EXECUTED",
        Some(strategy_outcome.strategy_name.clone()),
        Some(strategy_outcome.position_usd),
        None,
        evidence_json.clone(),
        packet_json.clone(),
    );

    let result = execute::execute_trade(
        ctx,
        &correlation_id,
        &signal,
        &sanad_outcome,
        &strategy_outcome,
        &debate_outcome,
        &packet,
        &candidate,
    )
    .await?;
    seed.timings.record(PipelineStage::Execute, stage_start.elapsed().as_millis() as u64);

    if result.executed {
        info!(
            "Pipeline complete: EXECUTE {} (${}, mode={})",
            signal.token,
            candidate.position_usd.unwrap_or_default(),
            result.execution_mode
        );
        return Ok(candidate);
    }

    let reason = result.rejection_reason.unwrap_or_else(|| "execution failed".into());
    seed.finish_blocked(
        DecisionResult::Block,
        PipelineStage::Execute,
        &reason,
        None,
        evidence_json,
        packet_json,
    )
    .await
}

/// Synthetic judge used by the fast track.
pub(crate) fn fast_track_judge() -> JudgeSummary {
    JudgeSummary {
        verdict: "APPROVE".into(),
        confidence: 75.0,
        reasoning: "Paper fast-track: Tier 1/2 corroborated signal".into(),
        paper_override: false,
        tier_veto: None,
    }
}
