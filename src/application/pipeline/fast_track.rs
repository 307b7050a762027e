//! Fast-track: the deterministic short-circuit for high-confidence,
//! well-corroborated Tier-1/2 signals.
//!
//! Skips the Sanad oracle, the debate and the Judge. The trust score comes
//! deterministically from corroboration alone; strategy match and all
//! fifteen policy gates still run, and execution goes through the same
//! atomic open. Active in paper mode, or in any mode when the fast-path
//! flag is present.

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::info;

use crate::application::context::RuntimeContext;
use crate::application::pipeline::debate::DebateOutcome;
use crate::application::pipeline::sanad::SanadOutcome;
use crate::application::pipeline::{RecordSeed, execute, fast_track_judge, strategy};
use crate::domain::decision::{DecisionRecord, DecisionResult, PipelineStage};
use crate::domain::signal::Signal;
use crate::domain::token_profile::{AssetTier, TokenProfile};

const FAST_TRACK_MIN_VOLUME_USD: u64 = 1_000_000;
const FAST_TRACK_MIN_ROUTER_SCORE: f64 = 60.0;
const FAST_TRACK_BASE_TRUST: f64 = 60.0;

/// Check the gate conditions and, when they hold, run the shortened path.
/// Returns None when the signal must take the full pipeline.
pub async fn try_fast_track(
    ctx: &RuntimeContext,
    signal: &Signal,
    correlation_id: &str,
) -> Result<Option<DecisionRecord>> {
    if !ctx.config.mode.is_paper() && !ctx.fast_path_flag.is_set() {
        return Ok(None);
    }

    let profile = TokenProfile::from_signal(signal);
    if !matches!(
        profile.asset_tier,
        Some(AssetTier::Tier1Macro | AssetTier::Tier2AltLarge | AssetTier::Tier2AltMid)
    ) {
        return Ok(None);
    }
    if signal.cross_source_count < 2 {
        return Ok(None);
    }
    if signal.volume_24h.unwrap_or(Decimal::ZERO) < Decimal::from(FAST_TRACK_MIN_VOLUME_USD) {
        return Ok(None);
    }
    let router_score = signal.extras.get("router_score").and_then(|v| v.as_f64()).unwrap_or(0.0);
    if router_score < FAST_TRACK_MIN_ROUTER_SCORE {
        return Ok(None);
    }
    if let Some(evidence) = &signal.onchain_evidence
        && evidence
            .rugpull_verdict
            .as_deref()
            .is_some_and(|v| matches!(v, "RUG" | "BLACKLISTED"))
    {
        return Ok(None);
    }

    info!(
        "FAST-TRACK: {} — {}, {} sources, vol ${}, score {router_score:.0}",
        signal.token,
        profile.asset_tier.map(|t| t.to_string()).unwrap_or_default(),
        signal.cross_source_count,
        signal.volume_24h.unwrap_or_default()
    );

    // Deterministic trust from corroboration alone
    let corr_points = signal
        .corroboration_level()
        .trust_points(signal.corroboration_quality) as f64;
    let trust_score = (FAST_TRACK_BASE_TRUST + corr_points).min(100.0);

    let sanad = SanadOutcome {
        trust_score,
        grade: signal.corroboration_level().grade().to_string(),
        recommendation: "PROCEED".into(),
        rugpull_flags: vec![],
        sybil_risk: "LOW".into(),
        reasoning: "Fast-track: deterministic corroboration trust".into(),
        hard_gate: false,
        hard_gate_reason: None,
        corroboration_override: None,
        source_count: signal.cross_source_count,
    };

    let (regime, _) = crate::infrastructure::feeds::load_market_regime(&ctx.config.signals_dir());
    let strategy_outcome = strategy::run(ctx, &profile, regime).await?;

    let judge = fast_track_judge();
    let debate = DebateOutcome {
        bull_conviction: 60.0,
        bull_thesis: "Fast-track".into(),
        bull_evidence: vec![],
        bear_conviction: 40.0,
        bear_thesis: String::new(),
        bear_attack_points: vec![],
        judge: judge.clone(),
    };

    // All fifteen gates still run
    let packet =
        execute::build_packet(ctx, correlation_id, signal, &sanad, &strategy_outcome, &judge).await;
    let policy_outcome = execute::run_policy(ctx, &packet).await;

    if !policy_outcome.passed() {
        info!(
            "Fast-track blocked by policy engine: {} — falling back to full pipeline",
            policy_outcome.gate_evidence.as_deref().unwrap_or("unknown gate")
        );
        return Ok(None);
    }

    let seed = RecordSeed::new(ctx, signal);
    let packet_json = serde_json::to_string(&packet).unwrap_or_else(|_| "{}".into());
    let evidence_json = serde_json::to_string(&policy_outcome.all_evidence).ok();

    let candidate = seed.record(
        DecisionResult::Execute,
        PipelineStage::Execute,
        "FAST_TRACK_EXECUTED",
        Some(strategy_outcome.strategy_name.clone()),
        Some(strategy_outcome.position_usd),
        None,
        evidence_json.clone(),
        packet_json.clone(),
    );

    let result = execute::execute_trade(
        ctx,
        correlation_id,
        signal,
        &sanad,
        &strategy_outcome,
        &debate,
        &packet,
        &candidate,
    )
    .await?;

    if result.executed {
        info!("FAST-TRACK COMPLETE — EXECUTE");
        return Ok(Some(candidate));
    }

    let reason = result.rejection_reason.unwrap_or_else(|| "execution failed".into());
    let record = seed
        .finish_blocked(
            DecisionResult::Block,
            PipelineStage::Execute,
            &format!("FAST_TRACK: {reason}"),
            None,
            evidence_json,
            packet_json,
        )
        .await?;
    Ok(Some(record))
}
