//! Shared test harness: a runtime context over a temp directory with a
//! scripted oracle and healthy state files.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sanad_trader::application::context::RuntimeContext;
use sanad_trader::config::Config;
use sanad_trader::domain::errors::OracleError;
use sanad_trader::domain::ports::{LlmOracle, Notifier, NotifyLevel, OracleRequest};
use sanad_trader::infrastructure::core::circuit_breaker::CircuitBreakerPool;
use sanad_trader::infrastructure::feeds::{
    CachedPrice, ExchangeHealth, ExchangeHealthMap, PortfolioState, PriceCache,
    ReconciliationState, save_json_atomic,
};
use sanad_trader::infrastructure::flags::{FlagFile, KillSwitch};
use sanad_trader::infrastructure::paper_execution::PaperExchange;
use sanad_trader::infrastructure::persistence::{Database, StateStore};

/// Oracle scripted by stage name; counts every invocation.
pub struct ScriptedOracle {
    pub responses: HashMap<String, String>,
    pub calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(responses: HashMap<String, String>) -> Self {
        Self { responses, calls: AtomicUsize::new(0) }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmOracle for ScriptedOracle {
    async fn complete(&self, request: OracleRequest) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.get(&request.stage) {
            Some(response) => Ok(response.clone()),
            None => Err(OracleError::Transport(format!("no scripted response for stage {}", request.stage))),
        }
    }
}

pub struct SilentNotifier;

#[async_trait]
impl Notifier for SilentNotifier {
    async fn send(&self, _: &str, _: NotifyLevel, _: Option<&str>) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct TestHarness {
    pub ctx: RuntimeContext,
    pub oracle: Arc<ScriptedOracle>,
    pub base_dir: PathBuf,
}

pub fn base_config(base_dir: &PathBuf) -> Config {
    let mut config: Config =
        serde_yaml::from_str(include_str!("../../config/thresholds.yaml")).unwrap();
    config.base_dir = base_dir.clone();
    config.database_url = format!("sqlite://{}/state/test.db", base_dir.display());
    config
}

/// Healthy state files: fresh reconciliation, default portfolio, healthy
/// binance, cached prices for the symbols under test.
pub fn write_healthy_state(base_dir: &PathBuf, symbols: &[(&str, Decimal)]) {
    let state_dir = base_dir.join("state");
    std::fs::create_dir_all(&state_dir).unwrap();

    PortfolioState::default().save(&state_dir).unwrap();
    save_json_atomic(
        &state_dir.join("reconciliation.json"),
        &ReconciliationState {
            last_reconciliation_timestamp: Some(Utc::now()),
            has_mismatch: false,
            mismatch_details: None,
        },
    )
    .unwrap();

    let mut health = ExchangeHealthMap::default();
    health.exchanges.insert(
        "binance".into(),
        ExchangeHealth { error_rate_pct: 0.01, websocket_connected: Some(true) },
    );
    save_json_atomic(&state_dir.join("exchange_health.json"), &health).unwrap();

    let mut cache = PriceCache::default();
    for (symbol, price) in symbols {
        cache.entries.insert(
            symbol.to_string(),
            CachedPrice { price: *price, volume_24h: Some(dec!(5000000)), timestamp: Utc::now() },
        );
    }
    save_json_atomic(&state_dir.join("price_cache.json"), &cache).unwrap();
}

pub async fn harness_with_oracle(oracle: ScriptedOracle) -> TestHarness {
    let base_dir = std::env::temp_dir().join(format!("sanad_test_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&base_dir).unwrap();
    write_healthy_state(&base_dir, &[("WIFUSDT", dec!(2.50)), ("ONDOUSDT", dec!(1.20))]);

    let config = base_config(&base_dir);
    let database = Database::new(&config.database_url).await.unwrap();
    let store = StateStore::new(database);

    let oracle = Arc::new(oracle);
    let breakers = CircuitBreakerPool::load(
        &config.state_dir().join("circuit_breakers.json"),
        config.circuit_breakers.clone(),
    );

    let ctx = RuntimeContext {
        kill_switch: KillSwitch::new(&config.kill_switch_path()),
        pause_flag: FlagFile::new(&config.pause_flag_path()),
        fast_path_flag: FlagFile::new(&config.fast_path_flag_path()),
        breakers: tokio::sync::Mutex::new(breakers),
        oracle: oracle.clone(),
        exchange: Arc::new(PaperExchange::new(config.state_dir())),
        notifier: Arc::new(SilentNotifier),
        store,
        config,
    };

    TestHarness { ctx, oracle, base_dir }
}

pub async fn harness() -> TestHarness {
    harness_with_oracle(ScriptedOracle::empty()).await
}
