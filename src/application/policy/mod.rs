//! Fail-closed policy engine.
//!
//! Fifteen deterministic gates in a fixed total order. Evaluation stops at
//! the first failure; evidence for every evaluated gate, passed or failed,
//! lands in the outcome for the decision record. Missing state for a gate is
//! a BLOCK, never a pass.

mod gates;
mod state;

pub use state::PolicyState;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::domain::decision::DecisionPacket;

/// Gate verdict plus human-readable evidence.
pub(crate) type GateResult = (bool, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyResult {
    Pass,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub result: PolicyResult,
    pub gates_passed: Vec<u8>,
    pub gate_failed: Option<u8>,
    pub gate_failed_name: Option<String>,
    pub gate_evidence: Option<String>,
    pub all_evidence: BTreeMap<String, String>,
    pub correlation_id: String,
    pub evaluated_at: DateTime<Utc>,
}

impl PolicyOutcome {
    pub fn passed(&self) -> bool {
        self.result == PolicyResult::Pass
    }
}

type GateFn = fn(&Config, &DecisionPacket, &PolicyState, DateTime<Utc>) -> GateResult;

/// The fixed gate order. Gate numbers are part of the decision record
/// contract and never shift.
const GATES: [(u8, &str, GateFn); 15] = [
    (1, "Kill Switch", gates::gate_01_kill_switch),
    (2, "Capital Preservation", gates::gate_02_capital_preservation),
    (3, "Data Freshness", gates::gate_03_data_freshness),
    (4, "Token Age", gates::gate_04_token_age),
    (5, "Rugpull Safety", gates::gate_05_rugpull_safety),
    (6, "Liquidity Gate", gates::gate_06_liquidity),
    (7, "Spread Gate (CEX)", gates::gate_07_spread),
    (8, "Pre-Flight Simulation (DEX)", gates::gate_08_preflight_simulation),
    (9, "Volatility Halt", gates::gate_09_volatility_halt),
    (10, "Exchange Health", gates::gate_10_exchange_health),
    (11, "Reconciliation", gates::gate_11_reconciliation),
    (12, "Exposure Limits", gates::gate_12_exposure_limits),
    (13, "Cooldown", gates::gate_13_cooldown),
    (14, "Budget Gate", gates::gate_14_budget),
    (15, "Sanad + Audit", gates::gate_15_sanad_audit),
];

/// Evaluate the full gate sequence against a decision packet.
pub fn evaluate_gates(
    config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    now: DateTime<Utc>,
) -> PolicyOutcome {
    let mut outcome = PolicyOutcome {
        result: PolicyResult::Block,
        gates_passed: Vec::new(),
        gate_failed: None,
        gate_failed_name: None,
        gate_evidence: None,
        all_evidence: BTreeMap::new(),
        correlation_id: packet.correlation_id.clone(),
        evaluated_at: now,
    };

    // Pre-gate: system pause when too many breakers tripped at once
    let trip_pause = config.circuit_breakers.simultaneous_trip_pause;
    let tripped = &state.open_breakers;
    if tripped.len() >= trip_pause {
        let evidence = format!(
            "System PAUSED: {} circuit breakers tripped ({}) >= {} threshold",
            tripped.len(),
            tripped.join(", "),
            trip_pause
        );
        outcome.all_evidence.insert("CB".into(), evidence.clone());
        outcome.gate_failed = Some(0);
        outcome.gate_failed_name = Some("CIRCUIT_BREAKERS".into());
        outcome.gate_evidence = Some(evidence);
        return outcome;
    }
    outcome.all_evidence.insert(
        "CB".into(),
        if tripped.is_empty() {
            "All circuit breakers closed".into()
        } else {
            format!("WARNING: {} circuit breaker(s) tripped: {}", tripped.len(), tripped.join(", "))
        },
    );

    for (number, name, gate) in GATES {
        let (passed, evidence) = gate(config, packet, state, now);
        outcome.all_evidence.insert(number.to_string(), evidence.clone());

        if !passed {
            outcome.gate_failed = Some(number);
            outcome.gate_failed_name = Some(name.to_string());
            outcome.gate_evidence = Some(evidence);
            return outcome;
        }
        outcome.gates_passed.push(number);
    }

    outcome.result = PolicyResult::Pass;
    outcome
}
