//! Shared state loaded once per policy evaluation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::infrastructure::core::circuit_breaker::read_open_components;
use crate::infrastructure::feeds::{
    BudgetState, ExchangeHealthMap, PortfolioState, ReconciliationState,
};
use crate::infrastructure::flags::KillSwitch;

/// Snapshot of every state input the gates consult. Required state that
/// fails to load never reaches the gates; the loader error surfaces as a
/// gate-0 BLOCK at the call site.
pub struct PolicyState {
    pub kill_switch_active: bool,
    pub portfolio: PortfolioState,
    pub reconciliation: ReconciliationState,
    pub exchange_health: ExchangeHealthMap,
    pub budget: BudgetState,
    pub open_breakers: Vec<String>,
    /// Most recent trade time for the packet's token (cooldown gate).
    pub last_token_trade_at: Option<DateTime<Utc>>,
    pub is_paper: bool,
}

impl PolicyState {
    /// Load from the state directory. Portfolio and reconciliation are
    /// required; health, budget and breakers default to empty.
    pub fn load(
        state_dir: &Path,
        kill_switch: &KillSwitch,
        last_token_trade_at: Option<DateTime<Utc>>,
        is_paper: bool,
    ) -> Result<Self> {
        let portfolio = PortfolioState::load(state_dir)?;
        let reconciliation = ReconciliationState::load(state_dir)?;
        Ok(Self {
            kill_switch_active: kill_switch.is_active(),
            portfolio,
            reconciliation,
            exchange_health: ExchangeHealthMap::load(state_dir),
            budget: BudgetState::load(state_dir),
            open_breakers: read_open_components(&state_dir.join("circuit_breakers.json")),
            last_token_trade_at,
            is_paper,
        })
    }
}

#[cfg(test)]
impl PolicyState {
    /// A healthy baseline for gate tests: everything fresh, nothing tripped.
    pub fn healthy(is_paper: bool) -> Self {
        Self {
            kill_switch_active: false,
            portfolio: PortfolioState::default(),
            reconciliation: ReconciliationState {
                last_reconciliation_timestamp: Some(Utc::now()),
                has_mismatch: false,
                mismatch_details: None,
            },
            exchange_health: ExchangeHealthMap::default(),
            budget: BudgetState::default(),
            open_breakers: Vec::new(),
            last_token_trade_at: None,
            is_paper,
        }
    }
}
