//! Seams to external collaborators: LLM oracles, exchanges, notifications.
//!
//! Everything behind these traits is out of core scope; workers receive
//! implementations through the runtime context and tests substitute mocks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;

use crate::domain::errors::OracleError;
use crate::domain::order::{ExchangeOrderResult, Order, OrderSide};

/// A single oracle call. Output is plain text; callers extract and validate
/// JSON themselves and treat failures as parse faults.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub model: String,
    pub max_tokens: u32,
    pub stage: String,
    pub token_symbol: String,
}

#[async_trait]
pub trait LlmOracle: Send + Sync {
    async fn complete(&self, request: OracleRequest) -> Result<String, OracleError>;
}

/// Normalized exchange surface: price, book quality, order placement.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<Option<Decimal>>;

    async fn estimate_slippage_bps(
        &self,
        symbol: &str,
        side: OrderSide,
        notional_usd: Decimal,
    ) -> Result<Option<i64>>;

    async fn get_spread_bps(&self, symbol: &str) -> Result<Option<i64>>;

    /// Submit an order. Errors are classified retryable/terminal by message
    /// through the shared retry policy.
    async fn submit_order(&self, order: &Order) -> Result<ExchangeOrderResult>;

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<()>;

    /// Exchange server time, used as the container-safe clock-skew reference.
    async fn server_time(&self) -> Result<DateTime<Utc>>;
}

/// Notification urgency, L1 (info) through L4 (page the operator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotifyLevel {
    L1,
    L2,
    L3,
    L4,
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str, level: NotifyLevel, title: Option<&str>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_levels_order_by_urgency() {
        assert!(NotifyLevel::L1 < NotifyLevel::L4);
        assert_eq!(NotifyLevel::L3.to_string(), "L3");
    }
}
