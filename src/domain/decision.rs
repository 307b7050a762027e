//! Decision records and the packet fed to the policy engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::signal::Venue;

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionResult {
    Execute,
    Skip,
    Block,
}

impl DecisionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionResult::Execute => "EXECUTE",
            DecisionResult::Skip => "SKIP",
            DecisionResult::Block => "BLOCK",
        }
    }

    pub fn parse(s: &str) -> Option<DecisionResult> {
        Some(match s {
            "EXECUTE" => DecisionResult::Execute,
            "SKIP" => DecisionResult::Skip,
            "BLOCK" => DecisionResult::Block,
            _ => return None,
        })
    }
}

impl fmt::Display for DecisionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline stage where the decision became terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Intake,
    Sanad,
    Classify,
    Strategy,
    Debate,
    Policy,
    Execute,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Intake => "intake",
            PipelineStage::Sanad => "sanad_verification",
            PipelineStage::Classify => "token_classification",
            PipelineStage::Strategy => "strategy_match",
            PipelineStage::Debate => "debate",
            PipelineStage::Policy => "policy_engine",
            PipelineStage::Execute => "execute",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sanad verification summary carried through the pipeline and into gates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanadSummary {
    pub trust_score: f64,
    pub grade: String,
    pub recommendation: String,
    pub rugpull_flags: Vec<String>,
    pub sybil_risk: Option<String>,
    pub hard_gate: bool,
}

/// Judge verdict summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeSummary {
    pub verdict: String,
    pub confidence: f64,
    pub reasoning: String,
    pub paper_override: bool,
    pub tier_veto: Option<String>,
}

/// Slippage, spread and windowed volatility for gates 6, 7 and 9.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    pub estimated_slippage_bps: Option<i64>,
    pub spread_bps: Option<i64>,
    pub depth_sufficient: Option<bool>,
    pub price_change_pct_window: Option<f64>,
    pub liquidity_usd: Option<Decimal>,
}

/// DEX pre-flight sell simulation (gate 8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreflightSimulation {
    pub sell_simulation_success: Option<bool>,
    pub tokens_returned: f64,
    pub error: Option<String>,
}

/// Sizing intent (gate 12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeIntent {
    pub position_size_pct: f64,
    pub position_usd: Decimal,
}

/// Everything the fifteen gates need, assembled by pipeline stage 6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPacket {
    pub correlation_id: String,
    pub token_symbol: String,
    pub pair_symbol: String,
    pub venue: Venue,
    pub exchange: String,
    pub strategy_name: String,
    pub token_deployment_age_hours: Option<f64>,
    pub price_timestamp: Option<DateTime<Utc>>,
    pub onchain_timestamp: Option<DateTime<Utc>>,
    /// Raw API payloads by name; null/empty responses fail gate 3.
    pub api_responses: BTreeMap<String, serde_json::Value>,
    pub current_price: Option<Decimal>,
    pub sanad: SanadSummary,
    pub market_data: MarketDataSnapshot,
    pub preflight_simulation: Option<PreflightSimulation>,
    pub trade_intent: TradeIntent,
    pub trade_confidence_score: Option<f64>,
    pub judge: JudgeSummary,
    pub has_verified_catalyst: bool,
    pub estimated_trade_cost_usd: f64,
}

impl DecisionPacket {
    pub fn empty(correlation_id: &str) -> Self {
        DecisionPacket {
            correlation_id: correlation_id.to_string(),
            token_symbol: String::new(),
            pair_symbol: String::new(),
            venue: Venue::Cex,
            exchange: "binance".into(),
            strategy_name: String::new(),
            token_deployment_age_hours: None,
            price_timestamp: None,
            onchain_timestamp: None,
            api_responses: BTreeMap::new(),
            current_price: None,
            sanad: SanadSummary::default(),
            market_data: MarketDataSnapshot::default(),
            preflight_simulation: None,
            trade_intent: TradeIntent::default(),
            trade_confidence_score: None,
            judge: JudgeSummary::default(),
            has_verified_catalyst: false,
            estimated_trade_cost_usd: 0.0,
        }
    }
}

/// Immutable row written once per pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub signal_id: String,
    pub created_at: DateTime<Utc>,
    pub policy_version: String,
    pub result: DecisionResult,
    pub stage: PipelineStage,
    pub reason_code: String,
    pub token_address: String,
    pub chain: String,
    pub source_primary: Option<String>,
    pub signal_type: Option<String>,
    pub score_total: Option<f64>,
    pub strategy_id: Option<String>,
    pub position_usd: Option<Decimal>,
    pub gate_failed: Option<u8>,
    pub evidence_json: Option<String>,
    pub timings_json: String,
    pub decision_packet_json: String,
}

/// Per-stage wall-clock timings captured for the decision record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub stages_ms: BTreeMap<String, u64>,
}

impl StageTimings {
    pub fn record(&mut self, stage: PipelineStage, elapsed_ms: u64) {
        self.stages_ms.insert(stage.as_str().to_string(), elapsed_ms);
    }

    pub fn total_ms(&self) -> u64 {
        self.stages_ms.values().sum()
    }
}
