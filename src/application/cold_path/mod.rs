//! Cold path: deep post-execution analysis.
//!
//! Poll → claim → process. The claim is the only attempts increment in the
//! system, and every retry decision downstream keys off the claimed row's
//! post-increment value. Bull and Bear run concurrently when configured;
//! both must return before the Judge sees anything.

pub mod prompts;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::errors::OracleError;
use crate::domain::ports::{LlmOracle, OracleRequest};
use crate::domain::position::{FLAG_JUDGE_HIGH_CONF_REJECT, Position};
use crate::domain::task::{ERR_JSON_PARSE, ERR_JUDGE_PARSE, ERR_VALIDATION};
use crate::infrastructure::llm::{dump_raw_response, extract_json_object};
use crate::infrastructure::persistence::StateStore;
use crate::infrastructure::persistence::store::ClaimedTask;

use prompts::{JSON_CONTRACT, PromptSet};

/// One stage's outcome kept in the analysis document.
#[derive(Debug, Clone)]
struct StageResult {
    raw_excerpt: String,
    parsed: Value,
    model: String,
}

impl StageResult {
    fn to_json(&self, at: DateTime<Utc>) -> Value {
        json!({
            "raw": self.raw_excerpt,
            "parsed": self.parsed,
            "model": self.model,
            "timestamp": at.to_rfc3339(),
        })
    }
}

pub struct ColdPathWorker {
    config: Config,
    store: StateStore,
    oracle: Arc<dyn LlmOracle>,
    prompts: PromptSet,
}

impl ColdPathWorker {
    pub fn new(config: Config, store: StateStore, oracle: Arc<dyn LlmOracle>) -> Result<Self> {
        let prompts = PromptSet::load(&config.base_dir.join("prompts"))?;
        Ok(Self { config, store, oracle, prompts })
    }

    /// One worker pass: claim and process every ready task.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<usize> {
        let task_ids = self.store.poll_pending_tasks(10, now).await?;
        if task_ids.is_empty() {
            info!("No pending tasks");
            return Ok(0);
        }
        info!("Found {} pending task(s)", task_ids.len());

        let mut processed = 0;
        for task_id in task_ids {
            let Some(claimed) = self.store.claim_async_task(&task_id, Utc::now()).await? else {
                info!("Task {task_id} not claimed (already taken or not ready)");
                continue;
            };
            self.process_task(&claimed).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Process one claimed task. All failure paths route through
    /// mark_task_failed with the claimed attempts value.
    pub async fn process_task(&self, claimed: &ClaimedTask) {
        let max_attempts = self.config.cold_path.max_attempts;
        info!(
            "Processing task {} (position={}, attempt={})",
            claimed.task_id, claimed.entity_id, claimed.attempts
        );

        match self.analyze_position(claimed).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_task_done(&claimed.task_id, Utc::now()).await {
                    warn!("mark_task_done failed: {e}");
                }
            }
            Err(failure) => {
                let (code, message) = match &failure {
                    TaskFailure::Oracle(e) => (e.error_code(), e.to_string()),
                    TaskFailure::Validation(msg) => (ERR_VALIDATION, msg.clone()),
                    TaskFailure::Internal(msg) => (crate::domain::task::ERR_WORKER, msg.clone()),
                };
                warn!("Task {} failed: {code}: {message}", claimed.task_id);
                if let Err(e) = self
                    .store
                    .mark_task_failed(&claimed.task_id, code, &message, claimed.attempts, max_attempts, Utc::now())
                    .await
                {
                    warn!("mark_task_failed failed: {e}");
                }
            }
        }
    }

    async fn analyze_position(&self, claimed: &ClaimedTask) -> Result<(), TaskFailure> {
        let position = self
            .store
            .get_position(&claimed.entity_id)
            .await
            .map_err(|e| TaskFailure::Internal(e.to_string()))?
            .ok_or_else(|| TaskFailure::Validation(format!("Position {} not found", claimed.entity_id)))?;

        let payload = json!({
            "token_address": position.token_address,
            "token": position.token,
            "chain": position.chain,
            "entry_price": position.entry_price.to_string(),
            "size_usd": position.size_usd.to_string(),
            "strategy_id": position.strategy_id,
        });

        let started_at = Utc::now();
        info!("Running Cold Path for {}", position.token);

        let sanad = self.run_sanad(&position, &claimed.task_id).await?;

        let (bull, bear) = if self.config.cold_path.parallel_bull_bear {
            tokio::try_join!(
                self.run_debater("bull", &payload, &position, &claimed.task_id),
                self.run_debater("bear", &payload, &position, &claimed.task_id),
            )?
        } else {
            let bull = self.run_debater("bull", &payload, &position, &claimed.task_id).await?;
            let bear = self.run_debater("bear", &payload, &position, &claimed.task_id).await?;
            (bull, bear)
        };

        let judge = self.run_judge(&payload, &sanad, &bull, &bear, &position, &claimed.task_id).await?;

        let completed_at = Utc::now();
        let verdict = judge.parsed["verdict"].as_str().unwrap_or("").to_string();
        let confidence = judge.parsed["confidence"].as_f64().unwrap_or(0.0);

        // Catastrophic flagging from the Judge JSON only.
        let risk_flag = (verdict == "REJECT"
            && confidence >= self.config.cold_path.catastrophic_confidence_threshold)
            .then_some(FLAG_JUDGE_HIGH_CONF_REJECT);
        if risk_flag.is_some() {
            warn!(
                "CATASTROPHIC: Judge rejected {} with {confidence:.0}% confidence (threshold={})",
                position.token, self.config.cold_path.catastrophic_confidence_threshold
            );
        }

        let analysis = json!({
            "sanad": sanad.to_json(completed_at),
            "bull": bull.parsed,
            "bear": bear.parsed,
            "judge": judge.to_json(completed_at),
            "meta": {
                "model": self.config.cold_path.model,
                "judge_model": self.config.cold_path.judge_model,
                "started_at": started_at.to_rfc3339(),
                "completed_at": completed_at.to_rfc3339(),
            },
        });

        self.store
            .set_position_analysis(&claimed.entity_id, &analysis.to_string(), risk_flag, completed_at)
            .await
            .map_err(|e| TaskFailure::Internal(e.to_string()))?;

        info!(
            "Task {} completed (verdict={verdict}, confidence={confidence:.0}%)",
            claimed.task_id
        );
        Ok(())
    }

    async fn run_sanad(
        &self,
        position: &Position,
        task_id: &str,
    ) -> Result<StageResult, TaskFailure> {
        let user_msg = format!(
            "Token: {}\nChain: {}\nEntry price: {}\nSize: ${}\nStrategy: {}\n\n\
             Analyze this token for Sanad verification.\n\n\
             Required JSON schema:\n{{\n  \"trust_score\": <int 0-100>,\n  \"rugpull_flags\": [<string list>],\n  \"sybil_risk\": \"<LOW|MEDIUM|HIGH>\",\n  \"source_reliability\": \"<string>\",\n  \"reasoning\": \"<string>\"\n}}",
            position.token, position.chain, position.entry_price, position.size_usd, position.strategy_id
        );

        let stage = self
            .call_stage("cold_sanad", &self.prompts.sanad, &user_msg, &self.config.cold_path.model, position, task_id)
            .await?;

        if stage.parsed.get("trust_score").is_none() {
            return Err(TaskFailure::Oracle(OracleError::Parse {
                code: ERR_JSON_PARSE,
                detail: "Sanad JSON missing trust_score".into(),
            }));
        }
        Ok(stage)
    }

    async fn run_debater(
        &self,
        side: &str,
        payload: &Value,
        position: &Position,
        task_id: &str,
    ) -> Result<StageResult, TaskFailure> {
        let (prompt, role, schema_hint) = if side == "bull" {
            (
                &self.prompts.bull,
                "Argue FOR this trade as Al-Baqarah (Bull).",
                "{\n  \"verdict\": \"<BUY|SKIP>\",\n  \"confidence\": <int 0-100>,\n  \"rationale\": \"<string>\",\n  \"key_strengths\": [<string list>]\n}",
            )
        } else {
            (
                &self.prompts.bear,
                "Argue AGAINST this trade as Al-Dahhak (Bear).",
                "{\n  \"verdict\": \"<SKIP|BUY>\",\n  \"confidence\": <int 0-100>,\n  \"rationale\": \"<string>\",\n  \"key_risks\": [<string list>]\n}",
            )
        };

        let user_msg = format!(
            "{}\n\n{role}\n\nRequired JSON schema:\n{schema_hint}",
            serde_json::to_string_pretty(payload).unwrap_or_default()
        );

        let stage = self
            .call_stage(
                &format!("cold_{side}"),
                prompt,
                &user_msg,
                &self.config.cold_path.model,
                position,
                task_id,
            )
            .await?;

        if stage.parsed.get("verdict").is_none() || stage.parsed.get("confidence").is_none() {
            return Err(TaskFailure::Oracle(OracleError::Parse {
                code: ERR_JSON_PARSE,
                detail: format!("{side} JSON missing verdict or confidence"),
            }));
        }
        Ok(stage)
    }

    async fn run_judge(
        &self,
        payload: &Value,
        sanad: &StageResult,
        bull: &StageResult,
        bear: &StageResult,
        position: &Position,
        task_id: &str,
    ) -> Result<StageResult, TaskFailure> {
        let user_msg = format!(
            "Review the following analysis for trade decision:\n\nSignal:\n{}\n\nSanad:\n{}\n\nBull:\n{}\n\nBear:\n{}\n\n\
             As Al-Muhasbi (Judge), provide your verdict.\n\n\
             Required JSON schema:\n{{\n  \"verdict\": \"<APPROVE|REJECT>\",\n  \"confidence\": <int 0-100>,\n  \"reasons\": [<string list>],\n  \"key_risks\": [<string list>],\n  \"risk_assessment\": \"<LOW|MODERATE|HIGH>\",\n  \"reasoning\": \"<string>\"\n}}",
            serde_json::to_string_pretty(payload).unwrap_or_default(),
            serde_json::to_string_pretty(&sanad.parsed).unwrap_or_default(),
            serde_json::to_string_pretty(&bull.parsed).unwrap_or_default(),
            serde_json::to_string_pretty(&bear.parsed).unwrap_or_default(),
        );

        let stage = self
            .call_stage(
                "cold_judge",
                &self.prompts.judge,
                &user_msg,
                &self.config.cold_path.judge_model,
                position,
                task_id,
            )
            .await
            .map_err(promote_to_judge_parse)?;

        validate_judge_json(&stage.parsed).map_err(|detail| {
            dump_raw_response(&self.config.logs_dir(), "judge", task_id, &stage.raw_excerpt);
            TaskFailure::Oracle(OracleError::Parse { code: ERR_JUDGE_PARSE, detail })
        })?;
        Ok(stage)
    }

    async fn call_stage(
        &self,
        stage: &str,
        system_prompt: &str,
        user_msg: &str,
        model: &str,
        position: &Position,
        task_id: &str,
    ) -> Result<StageResult, TaskFailure> {
        let raw = self
            .oracle
            .complete(OracleRequest {
                system_prompt: format!("{system_prompt}{JSON_CONTRACT}"),
                user_message: user_msg.to_string(),
                model: model.to_string(),
                max_tokens: 2000,
                stage: stage.to_string(),
                token_symbol: position.token.clone(),
            })
            .await
            .map_err(TaskFailure::Oracle)?;

        let Some(parsed) = extract_json_object(&raw) else {
            dump_raw_response(&self.config.logs_dir(), stage, task_id, &raw);
            return Err(TaskFailure::Oracle(OracleError::Parse {
                code: ERR_JSON_PARSE,
                detail: format!("Failed to extract JSON from {stage} response"),
            }));
        };

        let raw_excerpt = truncate_chars(&raw, 500);
        Ok(StageResult { raw_excerpt, parsed, model: model.to_string() })
    }
}

fn truncate_chars(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

/// Judge output is validated strictly: verdict APPROVE/REJECT, numeric
/// confidence in [0, 100].
pub fn validate_judge_json(parsed: &Value) -> Result<(), String> {
    let verdict = parsed
        .get("verdict")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "Judge JSON missing verdict field".to_string())?;
    if !matches!(verdict, "APPROVE" | "REJECT") {
        return Err(format!("Invalid verdict value: {verdict}"));
    }

    let confidence = parsed
        .get("confidence")
        .ok_or_else(|| "Judge JSON missing confidence field".to_string())?;
    let confidence = confidence
        .as_f64()
        .ok_or_else(|| format!("Invalid confidence type: {confidence}"))?;
    if !(0.0..=100.0).contains(&confidence) {
        return Err(format!("confidence out of range: {confidence}"));
    }
    Ok(())
}

enum TaskFailure {
    Oracle(OracleError),
    Validation(String),
    Internal(String),
}

/// A judge-stage parse fault carries the judge-specific error code.
fn promote_to_judge_parse(failure: TaskFailure) -> TaskFailure {
    match failure {
        TaskFailure::Oracle(OracleError::Parse { detail, .. }) => {
            TaskFailure::Oracle(OracleError::Parse { code: ERR_JUDGE_PARSE, detail })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_validation_accepts_well_formed() {
        let parsed = json!({"verdict": "REJECT", "confidence": 90, "reasoning": "x"});
        assert!(validate_judge_json(&parsed).is_ok());
    }

    #[test]
    fn judge_validation_rejects_bad_shapes() {
        assert!(validate_judge_json(&json!({"confidence": 50})).is_err());
        assert!(validate_judge_json(&json!({"verdict": "MAYBE", "confidence": 50})).is_err());
        assert!(validate_judge_json(&json!({"verdict": "APPROVE"})).is_err());
        assert!(validate_judge_json(&json!({"verdict": "APPROVE", "confidence": "high"})).is_err());
        assert!(validate_judge_json(&json!({"verdict": "APPROVE", "confidence": 140})).is_err());
    }
}
