//! Stage 5: Bull/Bear debate and the Judge.
//!
//! Tier-specific prompts frame the debate (macro for TIER_1, tokenomics for
//! TIER_2, on-chain for TIER_3, smart-money for WHALE). A failed Bull is
//! tolerated with defaults; the Bear is never skipped, and a failed Bear
//! fail-closes the pipeline. Every paper-mode override of a Judge REJECT
//! lives here and only here.

use serde_json::Value;
use tracing::{info, warn};

use crate::application::context::RuntimeContext;
use crate::application::pipeline::sanad::SanadOutcome;
use crate::application::pipeline::strategy::StrategyOutcome;
use crate::domain::decision::JudgeSummary;
use crate::domain::ports::OracleRequest;
use crate::domain::signal::Signal;
use crate::domain::token_profile::{SimpleTier, TokenProfile};
use crate::infrastructure::llm::extract_json_object;

use super::prompts_hot;

/// Evidence downgrade when the Bull cannot produce enough specifics.
const INSUFFICIENT_EVIDENCE_PENALTY: f64 = 20.0;
/// Paper-mode REJECT override floor: confidence at or above this with a
/// REJECT verdict is treated as a contradiction and forced to APPROVE.
const PAPER_OVERRIDE_CONFIDENCE_FLOOR: f64 = 60.0;

#[derive(Debug, Clone, Default)]
pub struct DebateOutcome {
    pub bull_conviction: f64,
    pub bull_thesis: String,
    pub bull_evidence: Vec<String>,
    pub bear_conviction: f64,
    pub bear_thesis: String,
    pub bear_attack_points: Vec<String>,
    pub judge: JudgeSummary,
}

fn tier_focus(tier: SimpleTier) -> &'static str {
    match tier {
        SimpleTier::Tier1 => {
            "ANALYTICAL FRAMEWORK: macro. Weigh institutional flows, market structure and \
             cross-asset correlation. Meme narratives and social hype are out of frame."
        }
        SimpleTier::Tier2 => {
            "ANALYTICAL FRAMEWORK: tokenomics. Weigh FDV vs market cap, unlock schedules, \
             circulating supply and protocol fundamentals."
        }
        SimpleTier::Tier3 => {
            "ANALYTICAL FRAMEWORK: on-chain. Weigh holder concentration, LP lock, volume \
             authenticity and rug risk. Macro-economic arguments are out of frame."
        }
        SimpleTier::Whale | SimpleTier::Skip => {
            "ANALYTICAL FRAMEWORK: smart money. Weigh the wallet's track record, position \
             size relative to the pool, and whether the move is entry or exit."
        }
    }
}

/// Bull evidence must carry at least three specific data points.
pub fn validate_evidence(evidence: &[String]) -> (bool, usize) {
    let specific = evidence
        .iter()
        .filter(|item| item.chars().any(|c| c.is_ascii_digit()))
        .count();
    (specific >= 3, specific)
}

pub async fn run(
    ctx: &RuntimeContext,
    signal: &Signal,
    sanad: &SanadOutcome,
    strategy: &StrategyOutcome,
    profile: &TokenProfile,
) -> Result<DebateOutcome, String> {
    let tier = profile.simple_tier();
    info!("Using {tier} prompts");

    let context = format!(
        "TOKEN: {}\nTHESIS: {}\nSOURCE: {}\nSANAD TRUST SCORE: {:.0}/100\nSANAD GRADE: {}\nSTRATEGY: {}\nPOSITION SIZE: ${}\n\n{}",
        signal.token,
        signal.thesis,
        signal.source_primary,
        sanad.trust_score,
        sanad.grade,
        strategy.strategy_name,
        strategy.position_usd,
        tier_focus(tier),
    );

    // Bull (Al-Baqarah)
    info!("[5a] Bull Al-Baqarah arguing FOR ({tier})...");
    let bull_message = format!(
        "{context}\n\nReturn valid JSON with these exact keys:\n{{\n  \"conviction\": <0-100>,\n  \"thesis\": \"<2-3 sentence core argument>\",\n  \"entry_price\": \"<suggested entry or 'market'>\",\n  \"target_price\": \"<target with reasoning>\",\n  \"stop_loss\": \"<stop with reasoning>\",\n  \"risk_reward_ratio\": \"<calculated R:R>\",\n  \"supporting_evidence\": [<5 specific data points with numbers>],\n  \"invalidation_point\": \"<what would make this thesis wrong>\"\n}}"
    );
    let bull_raw = call(ctx, prompts_hot::bull_system(&ctx.config.base_dir), bull_message, "bull_debate", signal, 3000).await;
    let mut bull = bull_raw.and_then(|raw| extract_json_object(&raw)).unwrap_or_else(|| {
        warn!("Bull response parse failed, using defaults");
        serde_json::json!({"conviction": 50, "thesis": "Parse failed", "supporting_evidence": []})
    });

    let bull_evidence: Vec<String> = bull["supporting_evidence"]
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let (sufficient, count) = validate_evidence(&bull_evidence);
    if !sufficient {
        let original = bull["conviction"].as_f64().unwrap_or(50.0);
        let downgraded = (original - INSUFFICIENT_EVIDENCE_PENALTY).max(0.0);
        warn!(
            "Bull evidence insufficient: {count} specific fields (need 3+). Conviction downgraded: {original:.0} -> {downgraded:.0}"
        );
        bull["conviction"] = serde_json::json!(downgraded);
    }
    let bull_conviction = bull["conviction"].as_f64().unwrap_or(50.0);
    info!("Bull Conviction: {bull_conviction:.0}/100");

    // Bear (Al-Dahhak), never skipped
    info!("[5b] Bear Al-Dahhak arguing AGAINST ({tier})...");
    let bear_message = format!(
        "{context}\n\nBULL'S ARGUMENT:\nConviction: {bull_conviction:.0}/100\nThesis: {}\nEvidence: {}\n\nAttack the Bull's thesis. Return valid JSON:\n{{\n  \"conviction\": <0-100 where 100 = absolutely DO NOT trade>,\n  \"thesis\": \"<2-3 sentence core argument against>\",\n  \"attack_points\": [<specific attacks on the evidence>],\n  \"worst_case_scenario\": \"<quantified worst case>\",\n  \"liquidity_assessment\": \"<can we actually exit?>\",\n  \"what_must_be_true\": \"<assumptions that must ALL hold>\"\n}}",
        bull["thesis"].as_str().unwrap_or(""),
        serde_json::to_string(&bull_evidence).unwrap_or_default(),
    );
    let bear_raw = call(ctx, prompts_hot::bear_system(&ctx.config.base_dir), bear_message, "bear_debate", signal, 5000).await;
    let Some(bear) = bear_raw.and_then(|raw| extract_json_object(&raw)) else {
        warn!("FAIL-CLOSED: Bear response failed — cannot proceed without opposition");
        return Err("Bear agent failed — fail closed (never skip Bear)".into());
    };
    let bear_conviction = bear["conviction"].as_f64().unwrap_or(50.0);
    info!("Bear Conviction (against): {bear_conviction:.0}/100");

    // Judge (Al-Muhasbi)
    let judge = run_judge(ctx, signal, sanad, strategy, &bull, &bear, profile).await;

    Ok(DebateOutcome {
        bull_conviction,
        bull_thesis: bull["thesis"].as_str().unwrap_or_default().to_string(),
        bull_evidence,
        bear_conviction,
        bear_thesis: bear["thesis"].as_str().unwrap_or_default().to_string(),
        bear_attack_points: bear["attack_points"]
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        judge,
    })
}

async fn run_judge(
    ctx: &RuntimeContext,
    signal: &Signal,
    sanad: &SanadOutcome,
    strategy: &StrategyOutcome,
    bull: &Value,
    bear: &Value,
    profile: &TokenProfile,
) -> JudgeSummary {
    let tier = profile.simple_tier();
    let is_paper = ctx.config.mode.is_paper();

    let judge_message = format!(
        "TRADE PROPOSAL FOR REVIEW:\n\nTOKEN: {}\nTHESIS: {}\n\nSANAD VERIFICATION:\n- Trust Score: {:.0}/100\n- Grade: {}\n- Recommendation: {}\n- Rugpull Flags: {:?}\n\nSTRATEGY:\n- Name: {}\n- Position Size: ${} ({:.1}%)\n\nBULL CASE:\n{}\n\nBEAR CASE:\n{}\n\nCurrent tier: {tier}\n\nReturn ONLY valid JSON:\n{{\n  \"verdict\": \"APPROVE|REJECT|REVISE\",\n  \"confidence_score\": <0-100>,\n  \"reasoning\": \"<5-7 sentences with specific evidence references>\",\n  \"key_concern\": \"<single most important concern>\"\n}}",
        signal.token,
        signal.thesis,
        sanad.trust_score,
        sanad.grade,
        sanad.recommendation,
        sanad.rugpull_flags,
        strategy.strategy_name,
        strategy.position_usd,
        strategy.position_pct * 100.0,
        serde_json::to_string_pretty(bull).unwrap_or_default(),
        serde_json::to_string_pretty(bear).unwrap_or_default(),
    );

    let mut system = prompts_hot::judge_system(&ctx.config.base_dir);
    if is_paper {
        system.push_str(prompts_hot::JUDGE_PAPER_CALIBRATION);
        info!("[5c] Al-Muhasbi reviewing (PAPER MODE — learning calibration)...");
    } else {
        info!("[5c] Al-Muhasbi reviewing...");
    }

    let raw = call_with_system(ctx, system, judge_message, "judge", signal, 8000, &ctx.config.cold_path.judge_model).await;
    let Some(parsed) = raw.and_then(|r| extract_json_object(&r)) else {
        warn!("FAIL-CLOSED: Al-Muhasbi returned no parseable verdict -> REJECT");
        return JudgeSummary {
            verdict: "REJECT".into(),
            confidence: 0.0,
            reasoning: "Al-Muhasbi API failure — fail closed, when in doubt REJECT".into(),
            paper_override: false,
            tier_veto: None,
        };
    };

    let mut verdict = parsed["verdict"].as_str().unwrap_or("REJECT").to_string();
    let mut confidence = parsed["confidence_score"].as_f64().unwrap_or(0.0);

    // Infer confidence from verdict when the model omitted it
    if confidence <= 0.0 {
        confidence = match verdict.as_str() {
            "APPROVE" => 65.0,
            "REVISE" => 45.0,
            _ => 0.0,
        };
        if confidence > 0.0 {
            warn!("Inferred confidence {confidence:.0} from {verdict} verdict");
        }
    }

    // The only place a paper run may override a REJECT.
    let mut paper_override = false;
    if paper_reject_override(is_paper, &verdict, confidence, &sanad.rugpull_flags) {
        info!(
            "PAPER OVERRIDE: confidence {confidence:.0} >= {PAPER_OVERRIDE_CONFIDENCE_FLOOR:.0} + no rugpulls -> forcing APPROVE"
        );
        verdict = "APPROVE".into();
        paper_override = true;
    }

    // Deterministic tier vetoes run after the override and win over it
    let tier_veto = tier_veto(tier, profile, bull);
    if let Some(reason) = &tier_veto {
        warn!("TIER VETO TRIGGERED: {reason}");
        verdict = "REJECT".into();
        confidence = 0.0;
        paper_override = false;
    }

    info!("Verdict: {verdict}, Confidence: {confidence:.0}/100");
    JudgeSummary {
        verdict,
        confidence,
        reasoning: parsed["reasoning"].as_str().unwrap_or_default().to_string(),
        paper_override,
        tier_veto,
    }
}

/// Paper-mode REJECT override. A REJECT carrying confidence at or above the
/// floor contradicts itself in paper mode and is forced to APPROVE so the
/// trade still generates learning data. Rugpull flags stay binding, and live
/// mode never overrides.
pub fn paper_reject_override(
    is_paper: bool,
    verdict: &str,
    confidence: f64,
    rugpull_flags: &[String],
) -> bool {
    is_paper
        && verdict == "REJECT"
        && confidence >= PAPER_OVERRIDE_CONFIDENCE_FLOOR
        && rugpull_flags.is_empty()
}

/// Deterministic tier-specific vetoes over the Bull's language and evidence.
pub fn tier_veto(tier: SimpleTier, profile: &TokenProfile, bull: &Value) -> Option<String> {
    let thesis_text = format!(
        "{} {}",
        bull["thesis"].as_str().unwrap_or(""),
        bull["supporting_evidence"]
            .as_array()
            .map(|items| items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(" "))
            .unwrap_or_default()
    )
    .to_lowercase();

    match tier {
        SimpleTier::Tier1 => {
            for kw in ["social media momentum", "meme narrative", "viral", "community hype"] {
                if thesis_text.contains(kw) {
                    return Some(format!("TIER_1 veto: Bull uses inappropriate language '{kw}'"));
                }
            }
        }
        SimpleTier::Tier3 => {
            for kw in ["macro-economic", "macroeconomic", "institutional flow", "etf inflow", "federal reserve"] {
                if thesis_text.contains(kw) {
                    return Some(format!("TIER_3 veto: Bull uses inappropriate language '{kw}'"));
                }
            }
            if !thesis_text.contains("holder concentration") && !thesis_text.contains("top 10") {
                return Some("TIER_3 veto: Missing holder concentration analysis".into());
            }
            if !thesis_text.contains("lp lock") && !thesis_text.contains("liquidity lock") {
                return Some("TIER_3 veto: Missing LP lock analysis".into());
            }
        }
        SimpleTier::Tier2 => {
            let circulating = profile.circulating_pct.unwrap_or(100.0);
            if circulating < 30.0
                && !thesis_text.contains("fdv")
                && !thesis_text.contains("fully diluted")
            {
                return Some(format!(
                    "TIER_2 veto: Circulating {circulating:.1}% but no FDV analysis"
                ));
            }
        }
        SimpleTier::Whale | SimpleTier::Skip => {}
    }

    // Universal veto: high conviction without evidence
    let conviction = bull["conviction"].as_f64().unwrap_or(0.0);
    let evidence_count = bull["supporting_evidence"].as_array().map(|a| a.len()).unwrap_or(0);
    if conviction > 70.0 && evidence_count < 3 {
        return Some(format!(
            "Universal veto: Conviction {conviction:.0} >70 with only {evidence_count} evidence fields"
        ));
    }
    None
}

async fn call(
    ctx: &RuntimeContext,
    system_prompt: String,
    user_message: String,
    stage: &str,
    signal: &Signal,
    max_tokens: u32,
) -> Option<String> {
    let model = ctx.config.cold_path.model.clone();
    call_with_system(ctx, system_prompt, user_message, stage, signal, max_tokens, &model).await
}

async fn call_with_system(
    ctx: &RuntimeContext,
    system_prompt: String,
    user_message: String,
    stage: &str,
    signal: &Signal,
    max_tokens: u32,
    model: &str,
) -> Option<String> {
    match ctx
        .oracle_call(OracleRequest {
            system_prompt,
            user_message,
            model: model.to_string(),
            max_tokens,
            stage: stage.to_string(),
            token_symbol: signal.token.clone(),
        })
        .await
    {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!("{stage} oracle call failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evidence_needs_three_specific_points() {
        let vague = vec!["looks strong".to_string(), "community likes it".to_string()];
        assert_eq!(validate_evidence(&vague), (false, 0));

        let specific = vec![
            "volume up 240% to $4.1M".to_string(),
            "holders grew from 1200 to 5800".to_string(),
            "top 10 hold 22%".to_string(),
        ];
        assert_eq!(validate_evidence(&specific), (true, 3));
    }

    fn tier3_profile() -> TokenProfile {
        TokenProfile { symbol: "BABYCAT".into(), ..TokenProfile::default() }
    }

    #[test]
    fn tier3_vetoes_macro_language() {
        let bull = json!({
            "conviction": 60,
            "thesis": "ETF inflow will lift all assets",
            "supporting_evidence": ["top 10 hold 20%", "lp lock 95%", "volume $2M"]
        });
        let veto = tier_veto(SimpleTier::Tier3, &tier3_profile(), &bull).unwrap();
        assert!(veto.contains("inappropriate language"));
    }

    #[test]
    fn tier3_requires_holder_and_lp_analysis() {
        let bull = json!({
            "conviction": 60,
            "thesis": "strong on-chain momentum",
            "supporting_evidence": ["volume $2M up 300%", "price +40% in 4h", "buys 2.4x sells"]
        });
        let veto = tier_veto(SimpleTier::Tier3, &tier3_profile(), &bull).unwrap();
        assert!(veto.contains("holder concentration"));
    }

    #[test]
    fn tier2_requires_fdv_when_low_float() {
        let mut profile = TokenProfile { symbol: "MOVE".into(), ..TokenProfile::default() };
        profile.circulating_pct = Some(15.0);
        let bull = json!({
            "conviction": 60,
            "thesis": "undervalued infra play",
            "supporting_evidence": ["revenue $3M", "tvl $40M", "mc $300M"]
        });
        let veto = tier_veto(SimpleTier::Tier2, &profile, &bull).unwrap();
        assert!(veto.contains("FDV"));

        let bull_with_fdv = json!({
            "conviction": 60,
            "thesis": "undervalued infra play, FDV only 2x mc",
            "supporting_evidence": ["revenue $3M", "fdv $600M vs mc $300M", "tvl $40M"]
        });
        assert!(tier_veto(SimpleTier::Tier2, &profile, &bull_with_fdv).is_none());
    }

    #[test]
    fn universal_veto_catches_overconfidence() {
        let bull = json!({
            "conviction": 85,
            "thesis": "trust me",
            "supporting_evidence": ["number 1"]
        });
        let veto = tier_veto(SimpleTier::Tier1, &TokenProfile::default(), &bull).unwrap();
        assert!(veto.contains("Universal veto"));
    }

    #[test]
    fn paper_override_fires_at_and_above_the_confidence_floor() {
        let no_flags: Vec<String> = vec![];
        // A REJECT below the floor stays binding
        assert!(!paper_reject_override(true, "REJECT", 59.0, &no_flags));
        // At the floor and all the way up, the contradiction is overridden
        assert!(paper_reject_override(true, "REJECT", 60.0, &no_flags));
        assert!(paper_reject_override(true, "REJECT", 84.0, &no_flags));
        assert!(paper_reject_override(true, "REJECT", 85.0, &no_flags));
        assert!(paper_reject_override(true, "REJECT", 100.0, &no_flags));
    }

    #[test]
    fn live_mode_never_overrides_a_reject() {
        let no_flags: Vec<String> = vec![];
        for confidence in [60.0, 85.0, 100.0] {
            assert!(!paper_reject_override(false, "REJECT", confidence, &no_flags));
        }
    }

    #[test]
    fn rugpull_flags_keep_the_reject_binding() {
        let flags = vec!["honeypot".to_string()];
        assert!(!paper_reject_override(true, "REJECT", 90.0, &flags));
        assert!(!paper_reject_override(true, "REJECT", 60.0, &flags));
    }

    #[test]
    fn only_reject_verdicts_are_overridden() {
        let no_flags: Vec<String> = vec![];
        assert!(!paper_reject_override(true, "APPROVE", 90.0, &no_flags));
        assert!(!paper_reject_override(true, "REVISE", 90.0, &no_flags));
    }
}
