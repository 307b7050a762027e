//! Stage 2: Sanad verification (Takhrij).
//!
//! Hard gates run before any LLM spend. After the oracle returns,
//! corroboration points are overridden from the engine-computed cross-source
//! count and the recommendation is re-derived from the final trust score;
//! the LLM's own corroboration claims are never trusted verbatim.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::application::context::RuntimeContext;
use crate::domain::bandit::source_grade;
use crate::domain::ports::OracleRequest;
use crate::domain::signal::{CorroborationLevel, CorroborationQuality, Signal};
use crate::infrastructure::llm::extract_json_object;

use super::prompts_hot;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorroborationOverride {
    pub llm_level: String,
    pub engine_level: String,
    pub delta: i32,
    pub quality: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanadOutcome {
    pub trust_score: f64,
    pub grade: String,
    pub recommendation: String,
    pub rugpull_flags: Vec<String>,
    pub sybil_risk: String,
    pub reasoning: String,
    pub hard_gate: bool,
    pub hard_gate_reason: Option<String>,
    pub corroboration_override: Option<CorroborationOverride>,
    pub source_count: usize,
}

impl SanadOutcome {
    pub fn blocked(reason: &str, hard_gate: bool) -> Self {
        SanadOutcome {
            trust_score: 0.0,
            grade: if hard_gate { "BLOCKED" } else { "FAILED" }.into(),
            recommendation: "BLOCK".into(),
            reasoning: reason.to_string(),
            hard_gate,
            hard_gate_reason: hard_gate.then(|| reason.to_string()),
            ..SanadOutcome::default()
        }
    }
}

/// Run the verification stage. `Err` carries a fail-closed outcome.
pub async fn run(ctx: &RuntimeContext, signal: &Signal) -> Result<SanadOutcome, SanadOutcome> {
    // Hard gates: deterministic blocks before the LLM
    if let Some(evidence) = &signal.onchain_evidence
        && let Some(reason) = evidence.is_hard_blocked()
    {
        warn!("HARD GATE BLOCK: {reason} — skipping LLM verification");
        return Err(SanadOutcome::blocked(&reason, true));
    }

    // Learned source grade feeds the scoring context
    let source_context = match ctx.store.get_source_stats(&signal.source_primary.to_lowercase()).await {
        Ok(Some((n, reward_sum))) => {
            let grade = source_grade(n, reward_sum);
            info!("UCB1 Source Grade: {} = {grade} (learned from past trades)", signal.source_primary);
            format!(
                "\nSOURCE PERFORMANCE (learned from past trades):\n- This source is graded {grade} from {n} closed trades\n"
            )
        }
        _ => String::new(),
    };

    let user_message = format!(
        "SIGNAL TO VERIFY:\nToken: {}\nSource: {}\nThesis: {}\nTimestamp: {}\n{source_context}\n\
         CROSS-SOURCE CORROBORATION (pre-verified by corroboration engine):\n\
         - Independent sources confirming this token: {}\n\
         - Sources: {}\n\
         - Corroboration level: {}\n\
         NOTE: Use this corroboration data directly in your trust score calculation.\n\n\
         Return your analysis as valid JSON with these exact keys:\n{{\n  \"trust_score\": <0-100>,\n  \"grade\": \"<Tawatur|Mashhur|Ahad>\",\n  \"source_grade\": \"<A|B|C|D|F>\",\n  \"chain_integrity\": \"<CONNECTED|BROKEN|PARTIAL>\",\n  \"corroboration_level\": \"<TAWATUR_QAWIY|TAWATUR|MASHHUR|AHAD_SAHIH|AHAD_DAIF>\",\n  \"rugpull_flags\": [<string list>] or [],\n  \"sybil_risk\": \"<LOW|MEDIUM|HIGH>\",\n  \"key_findings\": [<string list>],\n  \"recommendation\": \"<PROCEED|CAUTION|BLOCK>\",\n  \"reasoning\": \"<3-5 sentence detailed explanation>\"\n}}",
        signal.token,
        signal.source_primary,
        signal.thesis,
        signal.timestamp.to_rfc3339(),
        signal.cross_source_count,
        if signal.cross_sources.is_empty() {
            "single source only".to_string()
        } else {
            signal.cross_sources.join(", ")
        },
        signal.corroboration_level(),
    );

    let raw = match ctx
        .oracle_call(OracleRequest {
            system_prompt: prompts_hot::sanad_system(&ctx.config.base_dir),
            user_message,
            model: ctx.config.cold_path.model.clone(),
            max_tokens: 8000,
            stage: "sanad_verification".into(),
            token_symbol: signal.token.clone(),
        })
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            warn!("FAIL-CLOSED: Sanad Verifier returned no response ({e}) -> BLOCK");
            return Err(SanadOutcome::blocked("Sanad Verifier API call failed — fail closed", false));
        }
    };

    let Some(parsed) = extract_json_object(&raw) else {
        warn!("FAIL-CLOSED: Could not parse Sanad response -> BLOCK");
        return Err(SanadOutcome::blocked("Sanad Verifier response not parseable — fail closed", false));
    };

    let mut outcome = SanadOutcome {
        trust_score: parsed["trust_score"].as_f64().unwrap_or(0.0),
        grade: parsed["grade"].as_str().unwrap_or("FAILED").to_string(),
        recommendation: String::new(),
        rugpull_flags: parsed["rugpull_flags"]
            .as_array()
            .map(|flags| flags.iter().filter_map(|f| f.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        sybil_risk: parsed["sybil_risk"].as_str().unwrap_or("LOW").to_string(),
        reasoning: parsed["reasoning"].as_str().unwrap_or_default().to_string(),
        hard_gate: false,
        hard_gate_reason: None,
        corroboration_override: None,
        source_count: signal.cross_source_count.max(1),
    };

    apply_corroboration_override(&mut outcome, signal, &parsed);
    outcome.recommendation =
        derive_recommendation(&outcome, ctx.config.sanad.minimum_trade_score).to_string();

    info!(
        "Trust Score: {:.0}/100, Grade: {}, Corroboration: {} ({} sources), Recommendation: {}",
        outcome.trust_score,
        outcome.grade,
        signal.corroboration_level(),
        outcome.source_count,
        outcome.recommendation
    );
    Ok(outcome)
}

/// Corroboration points come from the engine count, never the LLM. The
/// signed delta corrects both directions.
pub fn apply_corroboration_override(
    outcome: &mut SanadOutcome,
    signal: &Signal,
    parsed: &serde_json::Value,
) {
    let engine_level = signal.corroboration_level();
    let quality = signal.corroboration_quality;

    let llm_level_raw = parsed["corroboration_level"].as_str().unwrap_or("AHAD").to_uppercase();
    let llm_level = parse_corroboration_level(&llm_level_raw);
    // The LLM is always scored on the STRONG scale; quality discounts only
    // the engine side.
    let llm_points = llm_level.trust_points(CorroborationQuality::Strong);
    let engine_points = engine_level.trust_points(quality);

    let delta = engine_points - llm_points;
    if delta != 0 {
        outcome.trust_score = (outcome.trust_score + delta as f64).clamp(0.0, 100.0);
        outcome.corroboration_override = Some(CorroborationOverride {
            llm_level: llm_level_raw,
            engine_level: engine_level.to_string(),
            delta,
            quality: format!("{quality:?}").to_uppercase(),
        });
        info!("Corroboration override: {llm_level} -> {engine_level} ({delta:+} trust points)");
    }

    // Grade recomputed from the engine source count
    outcome.grade = engine_level.grade().to_string();
    outcome.source_count = signal.cross_source_count.max(1);
}

fn parse_corroboration_level(raw: &str) -> CorroborationLevel {
    match raw {
        "TAWATUR_QAWIY" => CorroborationLevel::TawaturQawiy,
        "TAWATUR" => CorroborationLevel::Tawatur,
        "MASHHUR" => CorroborationLevel::Mashhur,
        _ => CorroborationLevel::Ahad,
    }
}

/// Recommendation is derived, not taken from the LLM. Hard blocks override
/// the score bands.
pub fn derive_recommendation(outcome: &SanadOutcome, minimum_trade_score: f64) -> &'static str {
    if !outcome.rugpull_flags.is_empty() {
        return "BLOCK";
    }
    if outcome.sybil_risk == "HIGH" {
        return "BLOCK";
    }
    if outcome.trust_score >= 80.0 {
        return "PROCEED";
    }
    if outcome.trust_score >= minimum_trade_score {
        return "CAUTION";
    }
    "BLOCK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(trust: f64) -> SanadOutcome {
        SanadOutcome { trust_score: trust, sybil_risk: "LOW".into(), ..SanadOutcome::default() }
    }

    #[test]
    fn recommendation_bands() {
        assert_eq!(derive_recommendation(&outcome(85.0), 70.0), "PROCEED");
        assert_eq!(derive_recommendation(&outcome(72.0), 70.0), "CAUTION");
        assert_eq!(derive_recommendation(&outcome(50.0), 70.0), "BLOCK");
    }

    #[test]
    fn hard_flags_override_score() {
        let mut o = outcome(95.0);
        o.rugpull_flags = vec!["mint_active".into()];
        assert_eq!(derive_recommendation(&o, 70.0), "BLOCK");

        let mut o = outcome(95.0);
        o.sybil_risk = "HIGH".into();
        assert_eq!(derive_recommendation(&o, 70.0), "BLOCK");
    }

    #[test]
    fn override_corrects_inflated_llm_corroboration() {
        // Engine says single source, LLM claims TAWATUR (25 points)
        let signal = Signal { cross_source_count: 1, ..Signal::default() };
        let mut o = outcome(70.0);
        apply_corroboration_override(&mut o, &signal, &json!({"corroboration_level": "TAWATUR"}));
        // delta = 10 - 25 = -15
        assert_eq!(o.trust_score, 55.0);
        assert_eq!(o.corroboration_override.as_ref().unwrap().delta, -15);
        assert_eq!(o.grade, "Ahad");
    }

    #[test]
    fn override_boosts_underscored_corroboration() {
        let signal = Signal {
            cross_source_count: 3,
            corroboration_quality: CorroborationQuality::Strong,
            ..Signal::default()
        };
        let mut o = outcome(60.0);
        apply_corroboration_override(&mut o, &signal, &json!({"corroboration_level": "AHAD"}));
        // delta = 25 - 10 = +15
        assert_eq!(o.trust_score, 75.0);
        assert_eq!(o.grade, "Tawatur");
    }

    #[test]
    fn weak_quality_earns_partial_engine_credit() {
        let signal = Signal {
            cross_source_count: 3,
            corroboration_quality: CorroborationQuality::Weak,
            ..Signal::default()
        };
        let mut o = outcome(60.0);
        apply_corroboration_override(&mut o, &signal, &json!({"corroboration_level": "AHAD"}));
        // weak TAWATUR = 18 points; delta = 18 - 10 = +8
        assert_eq!(o.trust_score, 68.0);
    }

    #[test]
    fn matching_levels_leave_score_untouched() {
        let signal = Signal {
            cross_source_count: 2,
            corroboration_quality: CorroborationQuality::Strong,
            ..Signal::default()
        };
        let mut o = outcome(70.0);
        apply_corroboration_override(&mut o, &signal, &json!({"corroboration_level": "MASHHUR"}));
        assert_eq!(o.trust_score, 70.0);
        assert!(o.corroboration_override.is_none());
    }
}
