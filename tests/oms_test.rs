//! Order management: idempotent placement, retry classification, partial
//! fills, cancellation, and the kill-switch rule for live orders.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sanad_trader::application::oms::{OrderManager, PlaceOrderRequest};
use sanad_trader::domain::errors::OrderError;
use sanad_trader::domain::order::{ExchangeOrderResult, Order, OrderSide, OrderState, TimeInForce};
use sanad_trader::domain::ports::ExchangeClient;
use sanad_trader::infrastructure::core::retry::RetryPolicy;
use sanad_trader::infrastructure::flags::KillSwitch;
use sanad_trader::infrastructure::persistence::{Database, StateStore};

/// Exchange double that counts submissions and fails a scripted number of
/// times before succeeding.
struct FlakyExchange {
    submissions: AtomicUsize,
    failures_before_success: usize,
    error: String,
}

impl FlakyExchange {
    fn reliable() -> Self {
        Self { submissions: AtomicUsize::new(0), failures_before_success: 0, error: String::new() }
    }

    fn failing(times: usize, error: &str) -> Self {
        Self {
            submissions: AtomicUsize::new(0),
            failures_before_success: times,
            error: error.to_string(),
        }
    }
}

#[async_trait]
impl ExchangeClient for FlakyExchange {
    async fn get_price(&self, _symbol: &str) -> anyhow::Result<Option<Decimal>> {
        Ok(Some(dec!(2.50)))
    }

    async fn estimate_slippage_bps(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _notional_usd: Decimal,
    ) -> anyhow::Result<Option<i64>> {
        Ok(Some(20))
    }

    async fn get_spread_bps(&self, _symbol: &str) -> anyhow::Result<Option<i64>> {
        Ok(Some(10))
    }

    async fn submit_order(&self, order: &Order) -> anyhow::Result<ExchangeOrderResult> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            anyhow::bail!("{}", self.error);
        }
        Ok(ExchangeOrderResult {
            order_id: format!("ex_{n}"),
            status: OrderState::Filled,
            executed_qty: order.quantity,
            price: order.price.unwrap_or(dec!(2.50)),
            fee_usd: dec!(0.50),
        })
    }

    async fn cancel_order(&self, _symbol: &str, _exchange_order_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn server_time(&self) -> anyhow::Result<chrono::DateTime<Utc>> {
        Ok(Utc::now())
    }
}

async fn fresh_manager(exchange: Arc<FlakyExchange>) -> (OrderManager, StateStore, KillSwitch) {
    let dir = std::env::temp_dir().join(format!("oms_test_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = Database::new(&format!("sqlite://{}/test.db", dir.display())).await.unwrap();
    let store = StateStore::new(db);
    let kill_switch = KillSwitch::new(&dir.join("kill_switch.flag"));
    let manager = OrderManager::new(store.clone(), exchange, kill_switch.clone())
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)));
    (manager, store, kill_switch)
}

fn request(paper: bool) -> PlaceOrderRequest {
    PlaceOrderRequest {
        symbol: "WIFUSDT".into(),
        side: OrderSide::Buy,
        quantity: dec!(100),
        price: Some(dec!(2.50)),
        time_in_force: TimeInForce::Gtc,
        strategy: "meme-momentum".into(),
        correlation_id: "corr-1".into(),
        exchange: "binance".into(),
        paper_mode: paper,
    }
}

/// Idempotence law: place twice within the bucket, one submission.
#[tokio::test]
async fn duplicate_placement_returns_existing_order() {
    let exchange = Arc::new(FlakyExchange::reliable());
    let (manager, _store, _ks) = fresh_manager(exchange.clone()).await;

    let first = manager.place_order(request(true)).await.unwrap();
    let second = manager.place_order(request(true)).await.unwrap();

    assert_eq!(first.client_order_id, second.client_order_id);
    assert_eq!(exchange.submissions.load(Ordering::SeqCst), 1, "at most one exchange submission");
}

#[tokio::test]
async fn retryable_errors_are_retried_to_success() {
    let exchange = Arc::new(FlakyExchange::failing(2, "HTTP 503 Service Unavailable"));
    let (manager, store, _ks) = fresh_manager(exchange.clone()).await;

    let order = manager.place_order(request(true)).await.unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(exchange.submissions.load(Ordering::SeqCst), 3);

    // The intent journal recorded the send
    let persisted = store.get_order(&order.client_order_id).await.unwrap().unwrap();
    assert!(persisted.exchange_order_id.is_some());
}

#[tokio::test]
async fn non_retryable_errors_reject_immediately() {
    let exchange = Arc::new(FlakyExchange::failing(99, "insufficient balance"));
    let (manager, store, _ks) = fresh_manager(exchange.clone()).await;

    let result = manager.place_order(request(true)).await;
    assert!(matches!(result, Err(OrderError::Rejected { .. })));
    assert_eq!(exchange.submissions.load(Ordering::SeqCst), 1, "no retry on terminal error");

    // The order row is terminal and carries the error
    let orders = store.get_active_orders(None).await.unwrap();
    assert!(orders.is_empty(), "rejected order must not stay active");
}

#[tokio::test]
async fn retry_exhaustion_fails_the_order() {
    let exchange = Arc::new(FlakyExchange::failing(99, "connection reset by peer"));
    let (manager, _store, _ks) = fresh_manager(exchange.clone()).await;

    let result = manager.place_order(request(true)).await;
    assert!(matches!(result, Err(OrderError::SubmitExhausted { attempts: 3, .. })));
    assert_eq!(exchange.submissions.load(Ordering::SeqCst), 3);
}

/// Invariant: with the kill switch active no live order submission succeeds.
#[tokio::test]
async fn kill_switch_refuses_live_orders() {
    let exchange = Arc::new(FlakyExchange::reliable());
    let (manager, _store, kill_switch) = fresh_manager(exchange.clone()).await;
    kill_switch.activate("test halt", Utc::now()).unwrap();

    let result = manager.place_order(request(false)).await;
    assert!(matches!(result, Err(OrderError::KillSwitchActive)));
    assert_eq!(exchange.submissions.load(Ordering::SeqCst), 0, "exchange never touched");
}

#[tokio::test]
async fn partial_fills_accumulate_and_complete() {
    let exchange = Arc::new(FlakyExchange::reliable());
    let (manager, store, _ks) = fresh_manager(exchange.clone()).await;

    // Seed an acknowledged order directly
    let now = Utc::now();
    let mut order = manager.place_order(request(true)).await.unwrap();
    // Reset to ACKNOWLEDGED with no fills to exercise the callback path
    order.state = OrderState::Acknowledged;
    order.fills.clear();
    order.filled_quantity = Decimal::ZERO;
    order.avg_fill_price = None;
    order.updated_at = now;
    store.upsert_order(&order).await.unwrap();

    let after_first = manager.apply_fill(&order.client_order_id, dec!(40), dec!(2.40)).await.unwrap();
    assert_eq!(after_first.state, OrderState::PartiallyFilled);
    assert_eq!(after_first.filled_quantity, dec!(40));

    let after_second = manager.apply_fill(&order.client_order_id, dec!(60), dec!(2.60)).await.unwrap();
    assert_eq!(after_second.state, OrderState::Filled);
    assert_eq!(after_second.filled_quantity, dec!(100));
    // avg = (40*2.40 + 60*2.60) / 100 = 2.52
    assert_eq!(after_second.avg_fill_price, Some(dec!(2.52)));

    // Terminal orders refuse further fills
    let overfill = manager.apply_fill(&order.client_order_id, dec!(1), dec!(2.60)).await;
    assert!(matches!(overfill, Err(OrderError::InvalidTransition { .. })));
}

#[tokio::test]
async fn cancel_all_sweeps_non_terminal_orders() {
    let exchange = Arc::new(FlakyExchange::reliable());
    let (manager, store, _ks) = fresh_manager(exchange.clone()).await;

    let mut order = manager.place_order(request(true)).await.unwrap();
    order.state = OrderState::Acknowledged;
    store.upsert_order(&order).await.unwrap();

    let canceled = manager.cancel_all(Some("WIFUSDT")).await.unwrap();
    assert_eq!(canceled, 1);
    let after = store.get_order(&order.client_order_id).await.unwrap().unwrap();
    assert_eq!(after.state, OrderState::Canceled);

    // Canceling again is a no-op that still returns the terminal order
    let again = manager.cancel_order(&order.client_order_id).await.unwrap().unwrap();
    assert_eq!(again.state, OrderState::Canceled);
}
