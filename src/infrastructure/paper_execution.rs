//! Paper exchange: simulated fills against the shared price cache.
//!
//! Fills apply a uniform [0, 0.1%] slippage against the order side plus a
//! fixed fee rate. Live exchange clients are external collaborators wired in
//! behind the same `ExchangeClient` trait.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::path::PathBuf;
use tracing::info;

use crate::domain::order::{ExchangeOrderResult, Order, OrderSide, OrderState};
use crate::domain::ports::ExchangeClient;
use crate::infrastructure::feeds::PriceCache;

pub const PAPER_FEE_RATE: f64 = 0.001;

/// Simulated book quality reported for paper CEX pairs.
const PAPER_SLIPPAGE_BPS: i64 = 20;
const PAPER_SPREAD_BPS: i64 = 10;

pub struct PaperExchange {
    state_dir: PathBuf,
}

impl PaperExchange {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn cached_price(&self, symbol: &str) -> Option<Decimal> {
        PriceCache::load(&self.state_dir).get(symbol).map(|p| p.price)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self.cached_price(symbol))
    }

    async fn estimate_slippage_bps(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _notional_usd: Decimal,
    ) -> Result<Option<i64>> {
        Ok(Some(PAPER_SLIPPAGE_BPS))
    }

    async fn get_spread_bps(&self, _symbol: &str) -> Result<Option<i64>> {
        Ok(Some(PAPER_SPREAD_BPS))
    }

    async fn submit_order(&self, order: &Order) -> Result<ExchangeOrderResult> {
        let decision_price = match order.price.or_else(|| self.cached_price(&order.symbol)) {
            Some(p) if p > Decimal::ZERO => p,
            _ => return Err(anyhow!("Cannot determine fill price for {}", order.symbol)),
        };

        let slippage_pct: f64 = rand::rng().random_range(0.0..0.001);
        let slip = Decimal::from_f64(slippage_pct).unwrap_or(Decimal::ZERO);
        let fill_price = match order.side {
            OrderSide::Buy => decision_price * (Decimal::ONE + slip),
            OrderSide::Sell => decision_price * (Decimal::ONE - slip),
        };

        let notional = fill_price * order.quantity;
        let fee_usd = notional * Decimal::from_f64(PAPER_FEE_RATE).unwrap_or(Decimal::ZERO);

        info!(
            "Paper fill: {} {} {} @ {} (slippage {:.3}%)",
            order.side,
            order.quantity,
            order.symbol,
            fill_price,
            slippage_pct * 100.0
        );

        Ok(ExchangeOrderResult {
            order_id: format!("paper_{}", &order.client_order_id[..8.min(order.client_order_id.len())]),
            status: OrderState::Filled,
            executed_qty: order.quantity,
            price: fill_price,
            fee_usd,
        })
    }

    async fn cancel_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<()> {
        Ok(())
    }

    async fn server_time(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}
