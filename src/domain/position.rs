//! Positions and closed-trade records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk flag set when the cold path permanently fails for a position.
pub const FLAG_ASYNC_FAILED_PERMANENT: &str = "FLAG_ASYNC_FAILED_PERMANENT";
/// Risk flag set when the Judge rejects with catastrophic confidence.
pub const FLAG_JUDGE_HIGH_CONF_REJECT: &str = "FLAG_JUDGE_HIGH_CONF_REJECT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<PositionStatus> {
        Some(match s {
            "OPEN" => PositionStatus::Open,
            "CLOSED" => PositionStatus::Closed,
            _ => return None,
        })
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a position was closed; first matching exit rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    EmergencySell,
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
    MomentumDecay,
    ExternalExitSignal,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::EmergencySell => "EMERGENCY_SELL",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TimeExit => "TIME_EXIT",
            ExitReason::MomentumDecay => "MOMENTUM_DECAY",
            ExitReason::ExternalExitSignal => "EXTERNAL_EXIT_SIGNAL",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Open or closed trade. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub decision_id: String,
    pub signal_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub token: String,
    pub token_address: String,
    pub chain: String,
    pub symbol: String,
    pub strategy_id: String,
    pub entry_price: Decimal,
    pub size_usd: Decimal,
    pub size_token: Decimal,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub breakeven_activated: bool,
    pub entry_volume_24h: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pnl_usd: Option<Decimal>,
    pub pnl_pct: Option<f64>,
    pub risk_flag: Option<String>,
    pub async_analysis_complete: bool,
    pub async_analysis_json: Option<String>,
    pub regime_tag: Option<String>,
    pub source_primary: Option<String>,
    pub execution_mode: Option<String>,
}

impl Position {
    pub fn unrealized_pct(&self, current_price: Decimal) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        if self.entry_price.is_zero() {
            return 0.0;
        }
        ((current_price - self.entry_price) / self.entry_price)
            .to_f64()
            .unwrap_or(0.0)
    }

    pub fn hold_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds() as f64 / 3600.0
    }
}

/// Exit fields applied when a position closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPayload {
    pub exit_price: Decimal,
    pub exit_reason: ExitReason,
    pub detail: String,
    pub pnl_usd: Decimal,
    pub pnl_pct: f64,
    pub fee_usd: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Closed-trade record appended to trade history.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub position_id: String,
    pub token: String,
    pub symbol: String,
    pub side: &'static str,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size_usd: Decimal,
    pub pnl_usd: Decimal,
    pub pnl_pct: f64,
    pub fee_usd: Decimal,
    pub exit_reason: String,
    pub strategy_id: String,
    pub timestamp: DateTime<Utc>,
    /// Decision-price vs fill-price slippage, recorded for execution quality.
    pub exit_slippage_pct: Option<f64>,
}

/// Paper PnL net of a fixed fee rate on both legs.
pub fn compute_paper_pnl(
    entry_price: Decimal,
    exit_price: Decimal,
    size_token: Decimal,
    fee_rate: Decimal,
) -> (Decimal, f64, Decimal) {
    use rust_decimal::prelude::ToPrimitive;

    let entry_notional = entry_price * size_token;
    let exit_notional = exit_price * size_token;
    let fees = (entry_notional + exit_notional) * fee_rate;
    let pnl_usd = exit_notional - entry_notional - fees;
    let pnl_pct = if entry_notional.is_zero() {
        0.0
    } else {
        (pnl_usd / entry_notional).to_f64().unwrap_or(0.0)
    };
    (pnl_usd, pnl_pct, fees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn paper_pnl_nets_out_fees() {
        // Buy 100 tokens at $1, sell at $1.10, 0.1% fee each leg.
        let (pnl_usd, pnl_pct, fees) = compute_paper_pnl(dec!(1.00), dec!(1.10), dec!(100), dec!(0.001));
        assert_eq!(fees, dec!(0.210));
        assert_eq!(pnl_usd, dec!(9.790));
        assert!((pnl_pct - 0.0979).abs() < 1e-9);
    }

    #[test]
    fn losing_trade_is_negative_after_fees() {
        let (pnl_usd, pnl_pct, _) = compute_paper_pnl(dec!(2.00), dec!(2.00), dec!(50), dec!(0.001));
        assert!(pnl_usd < Decimal::ZERO);
        assert!(pnl_pct < 0.0);
    }

    #[test]
    fn unrealized_pct_from_entry() {
        let pos = Position {
            position_id: "p".into(),
            decision_id: "d".into(),
            signal_id: "s".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: PositionStatus::Open,
            token: "WIF".into(),
            token_address: "addr".into(),
            chain: "solana".into(),
            symbol: "WIFUSDT".into(),
            strategy_id: "meme-momentum".into(),
            entry_price: dec!(2.00),
            size_usd: dec!(200),
            size_token: dec!(100),
            stop_loss_pct: 0.15,
            take_profit_pct: 0.30,
            breakeven_activated: false,
            entry_volume_24h: None,
            exit_price: None,
            exit_reason: None,
            closed_at: None,
            pnl_usd: None,
            pnl_pct: None,
            risk_flag: None,
            async_analysis_complete: false,
            async_analysis_json: None,
            regime_tag: None,
            source_primary: None,
            execution_mode: None,
        };
        assert!((pos.unrealized_pct(dec!(2.20)) - 0.10).abs() < 1e-9);
        assert!((pos.unrealized_pct(dec!(1.80)) + 0.10).abs() < 1e-9);
    }
}
