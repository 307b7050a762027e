//! Order lifecycle state machine.
//!
//! ```text
//! NEW → SUBMITTED → ACKNOWLEDGED → PARTIALLY_FILLED* → FILLED
//!                               ↘  CANCELED | EXPIRED
//!                 ↘  REJECTED | FAILED
//! ```
//! SUBMITTED may short-circuit straight to FILLED or PARTIALLY_FILLED when
//! the exchange reports the fill on acknowledge.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Created locally, not yet sent.
    New,
    /// Sent to exchange, awaiting ack.
    Submitted,
    /// Exchange confirmed receipt.
    Acknowledged,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    /// Timed out without fill.
    Expired,
    /// Internal error, never reached the exchange.
    Failed,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::Canceled
                | OrderState::Rejected
                | OrderState::Expired
                | OrderState::Failed
        )
    }

    pub fn can_transition_to(self, target: OrderState) -> bool {
        use OrderState::*;
        match self {
            New => matches!(target, Submitted | Failed | Canceled),
            Submitted => matches!(
                target,
                Acknowledged | Filled | PartiallyFilled | Rejected | Failed | Canceled
            ),
            Acknowledged => matches!(target, PartiallyFilled | Filled | Canceled | Expired),
            PartiallyFilled => matches!(target, PartiallyFilled | Filled | Canceled),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderState::New => "NEW",
            OrderState::Submitted => "SUBMITTED",
            OrderState::Acknowledged => "ACKNOWLEDGED",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::Filled => "FILLED",
            OrderState::Canceled => "CANCELED",
            OrderState::Rejected => "REJECTED",
            OrderState::Expired => "EXPIRED",
            OrderState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<OrderState> {
        Some(match s {
            "NEW" => OrderState::New,
            "SUBMITTED" => OrderState::Submitted,
            "ACKNOWLEDGED" => OrderState::Acknowledged,
            "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
            "FILLED" => OrderState::Filled,
            "CANCELED" => OrderState::Canceled,
            "REJECTED" => OrderState::Rejected,
            "EXPIRED" => OrderState::Expired,
            "FAILED" => OrderState::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic client order id. Same inputs within a 5-minute bucket map to
/// the same id, so a crashed-and-rerun worker cannot double-submit.
pub fn generate_client_order_id(
    correlation_id: &str,
    strategy: &str,
    side: OrderSide,
    symbol: &str,
    now: DateTime<Utc>,
) -> String {
    let bucket = format!("{}{}", now.format("%Y%m%d%H"), now.minute() / 5);
    let raw = format!("{correlation_id}:{strategy}:{side}:{symbol}:{bucket}");
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("ST_{}", &hex::encode(hasher.finalize())[..16])
}

/// A single (partial) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub quantity: Decimal,
    pub price: Decimal,
    pub at: DateTime<Utc>,
}

/// Exchange-facing order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub correlation_id: String,
    pub strategy: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub exchange: String,
    pub paper_mode: bool,
    pub state: OrderState,
    pub fills: Vec<Fill>,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee_usd: Decimal,
    pub retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Apply a state transition; invalid transitions are refused.
    pub fn transition(&mut self, target: OrderState, now: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(target) {
            return false;
        }
        self.state = target;
        self.updated_at = now;
        true
    }

    /// Record a fill, accumulate quantity, recompute the average price and
    /// transition to FILLED exactly when cumulative quantity covers the order.
    pub fn record_fill(&mut self, quantity: Decimal, price: Decimal, now: DateTime<Utc>) {
        self.fills.push(Fill { quantity, price, at: now });

        let total_filled: Decimal = self.fills.iter().map(|f| f.quantity).sum();
        let total_cost: Decimal = self.fills.iter().map(|f| f.quantity * f.price).sum();
        self.filled_quantity = total_filled;
        self.avg_fill_price = (total_filled > Decimal::ZERO).then(|| total_cost / total_filled);

        if total_filled >= self.quantity {
            self.transition(OrderState::Filled, now);
        } else {
            self.transition(OrderState::PartiallyFilled, now);
        }
    }
}

/// Normalized exchange response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrderResult {
    pub order_id: String,
    pub status: OrderState,
    pub executed_qty: Decimal,
    pub price: Decimal,
    pub fee_usd: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(qty: Decimal) -> Order {
        Order {
            client_order_id: "ST_abc".into(),
            exchange_order_id: None,
            correlation_id: "corr-1".into(),
            strategy: "meme-momentum".into(),
            symbol: "WIFUSDT".into(),
            side: OrderSide::Buy,
            quantity: qty,
            price: None,
            time_in_force: TimeInForce::Gtc,
            exchange: "binance".into(),
            paper_mode: true,
            state: OrderState::Acknowledged,
            fills: vec![],
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fee_usd: Decimal::ZERO,
            retries: 0,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [
            OrderState::Filled,
            OrderState::Canceled,
            OrderState::Rejected,
            OrderState::Expired,
            OrderState::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(OrderState::Submitted));
            assert!(!terminal.can_transition_to(OrderState::Canceled));
        }
    }

    #[test]
    fn submitted_can_short_circuit_to_filled() {
        assert!(OrderState::Submitted.can_transition_to(OrderState::Filled));
        assert!(OrderState::Submitted.can_transition_to(OrderState::PartiallyFilled));
        assert!(!OrderState::New.can_transition_to(OrderState::Filled));
    }

    #[test]
    fn partial_fills_accumulate_to_filled() {
        let mut o = order(dec!(10));
        let now = Utc::now();

        o.record_fill(dec!(4), dec!(2.00), now);
        assert_eq!(o.state, OrderState::PartiallyFilled);
        assert_eq!(o.filled_quantity, dec!(4));

        o.record_fill(dec!(6), dec!(2.50), now);
        assert_eq!(o.state, OrderState::Filled);
        assert_eq!(o.filled_quantity, dec!(10));
        // avg = (4*2.00 + 6*2.50) / 10 = 2.30
        assert_eq!(o.avg_fill_price, Some(dec!(2.30)));
    }

    #[test]
    fn invalid_transition_is_refused() {
        let mut o = order(dec!(1));
        o.state = OrderState::Filled;
        assert!(!o.transition(OrderState::Canceled, Utc::now()));
        assert_eq!(o.state, OrderState::Filled);
    }

    #[test]
    fn client_order_id_stable_within_bucket() {
        use chrono::TimeZone;
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 11, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 14, 59).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 15, 0).unwrap();

        let a = generate_client_order_id("c1", "meme-momentum", OrderSide::Buy, "WIFUSDT", t1);
        let b = generate_client_order_id("c1", "meme-momentum", OrderSide::Buy, "WIFUSDT", t2);
        let c = generate_client_order_id("c1", "meme-momentum", OrderSide::Buy, "WIFUSDT", t3);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("ST_"));
    }
}
