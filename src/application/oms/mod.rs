//! Order management.
//!
//! Placement is idempotent: the client order id is deterministic over
//! (correlation id, strategy, side, symbol, 5-minute bucket), and an existing
//! non-terminal order short-circuits without touching the exchange. The
//! intent row is journaled before the submit call, so a crash between journal
//! and ack leaves evidence instead of a mystery fill.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::errors::OrderError;
use crate::domain::order::{
    Order, OrderSide, OrderState, TimeInForce, generate_client_order_id,
};
use crate::domain::ports::ExchangeClient;
use crate::infrastructure::core::retry::RetryPolicy;
use crate::infrastructure::flags::KillSwitch;
use crate::infrastructure::persistence::StateStore;

pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub strategy: String,
    pub correlation_id: String,
    pub exchange: String,
    pub paper_mode: bool,
}

pub struct OrderManager {
    store: StateStore,
    exchange: Arc<dyn ExchangeClient>,
    kill_switch: KillSwitch,
    retry: RetryPolicy,
}

impl OrderManager {
    pub fn new(store: StateStore, exchange: Arc<dyn ExchangeClient>, kill_switch: KillSwitch) -> Self {
        Self { store, exchange, kill_switch, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Place an order, or return the existing one for the same client id.
    pub async fn place_order(&self, request: PlaceOrderRequest) -> Result<Order, OrderError> {
        if request.quantity <= Decimal::ZERO {
            return Err(OrderError::Invalid {
                reason: format!("quantity must be positive, got {}", request.quantity),
            });
        }

        if !request.paper_mode && self.kill_switch.is_active() {
            return Err(OrderError::KillSwitchActive);
        }

        let now = Utc::now();
        let client_order_id = generate_client_order_id(
            &request.correlation_id,
            &request.strategy,
            request.side,
            &request.symbol,
            now,
        );

        if let Ok(Some(existing)) = self.store.get_order(&client_order_id).await
            && !existing.state.is_terminal()
        {
            info!(
                "DUPLICATE blocked: {} already in state {}",
                client_order_id, existing.state
            );
            return Ok(existing);
        }

        let mut order = Order {
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            correlation_id: request.correlation_id,
            strategy: request.strategy,
            symbol: request.symbol,
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            time_in_force: request.time_in_force,
            exchange: request.exchange,
            paper_mode: request.paper_mode,
            state: OrderState::New,
            fills: vec![],
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fee_usd: Decimal::ZERO,
            retries: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };

        // Intent before submit: persist first, call the exchange second.
        self.persist(&order).await?;
        self.store
            .record_order_intent(&order)
            .await
            .map_err(|e| OrderError::Invalid { reason: e.to_string() })?;

        info!(
            "NEW: {} {} {} @ {} [{}] id={}...",
            order.side,
            order.quantity,
            order.symbol,
            order.price.map(|p| p.to_string()).unwrap_or_else(|| "MARKET".into()),
            order.strategy,
            &client_order_id[..12.min(client_order_id.len())]
        );

        self.submit_with_retry(&mut order).await?;
        Ok(order)
    }

    async fn submit_with_retry(&self, order: &mut Order) -> Result<(), OrderError> {
        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            order.retries = attempt;
            if order.state == OrderState::New {
                order.transition(OrderState::Submitted, Utc::now());
            }
            self.persist(order).await?;

            match self.exchange.submit_order(order).await {
                Ok(result) => {
                    let now = Utc::now();
                    order.exchange_order_id = Some(result.order_id.clone());
                    self.store
                        .mark_intent_sent(&order.client_order_id, &result.order_id, now)
                        .await
                        .map_err(|e| OrderError::Invalid { reason: e.to_string() })?;

                    match result.status {
                        OrderState::Filled => {
                            order.record_fill(result.executed_qty, result.price, now);
                            order.fee_usd = result.fee_usd;
                        }
                        OrderState::PartiallyFilled => {
                            order.record_fill(result.executed_qty, result.price, now);
                            order.fee_usd = result.fee_usd;
                        }
                        _ => {
                            order.transition(OrderState::Acknowledged, now);
                        }
                    }
                    self.persist(order).await?;
                    info!(
                        "ACK: {} {} -> {} (exchange_id={})",
                        order.side, order.symbol, order.state, result.order_id
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if RetryPolicy::is_retryable(&last_error) && attempt + 1 < self.retry.max_attempts {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(
                            "RETRY {}/{}: {last_error} — waiting {:?}",
                            attempt + 1,
                            self.retry.max_attempts,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let terminal = if RetryPolicy::is_retryable(&last_error) {
                        OrderState::Failed
                    } else {
                        OrderState::Rejected
                    };
                    order.transition(terminal, Utc::now());
                    order.error = Some(last_error.clone());
                    self.persist(order).await?;
                    warn!("{}: {} — {last_error}", terminal, order.symbol);
                    return match terminal {
                        OrderState::Rejected => Err(OrderError::Rejected { reason: last_error }),
                        _ => Err(OrderError::SubmitExhausted {
                            attempts: attempt + 1,
                            last_error,
                        }),
                    };
                }
            }
        }

        Err(OrderError::SubmitExhausted { attempts: self.retry.max_attempts, last_error })
    }

    /// Apply an exchange fill callback to a persisted order.
    pub async fn apply_fill(
        &self,
        client_order_id: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Order, OrderError> {
        let mut order = self
            .store
            .get_order(client_order_id)
            .await
            .map_err(|e| OrderError::Invalid { reason: e.to_string() })?
            .ok_or_else(|| OrderError::Invalid {
                reason: format!("unknown order {client_order_id}"),
            })?;

        if order.state.is_terminal() {
            return Err(OrderError::InvalidTransition {
                from: order.state.to_string(),
                to: OrderState::PartiallyFilled.to_string(),
                client_order_id: client_order_id.to_string(),
            });
        }

        order.record_fill(quantity, price, Utc::now());
        self.persist(&order).await?;
        Ok(order)
    }

    /// Cancel one order. Cancels on the exchange when live, and always
    /// transitions locally when the current state is not terminal.
    pub async fn cancel_order(&self, client_order_id: &str) -> Result<Option<Order>, OrderError> {
        let Some(mut order) = self
            .store
            .get_order(client_order_id)
            .await
            .map_err(|e| OrderError::Invalid { reason: e.to_string() })?
        else {
            info!("Cancel: order {client_order_id} not found");
            return Ok(None);
        };

        if order.state.is_terminal() {
            return Ok(Some(order));
        }

        if !order.paper_mode
            && let Some(exchange_id) = order.exchange_order_id.clone()
            && let Err(e) = self.exchange.cancel_order(&order.symbol, &exchange_id).await
        {
            warn!("Exchange cancel failed for {client_order_id}: {e} — canceling locally");
        }

        order.transition(OrderState::Canceled, Utc::now());
        self.persist(&order).await?;
        info!("CANCELED: {} {} id={}...", order.symbol, order.side, &client_order_id[..12.min(client_order_id.len())]);
        Ok(Some(order))
    }

    /// Cancel all active orders, optionally scoped to one symbol.
    pub async fn cancel_all(&self, symbol: Option<&str>) -> Result<usize, OrderError> {
        let active = self
            .store
            .get_active_orders(symbol)
            .await
            .map_err(|e| OrderError::Invalid { reason: e.to_string() })?;

        let mut canceled = 0;
        for order in active {
            if self.cancel_order(&order.client_order_id).await?.is_some() {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn persist(&self, order: &Order) -> Result<(), OrderError> {
        self.store
            .upsert_order(order)
            .await
            .map_err(|e| OrderError::Invalid { reason: e.to_string() })
    }
}
