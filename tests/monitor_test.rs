//! Position monitor and heartbeat: exit rules against cached prices, the
//! breakeven ratchet, the freshness precondition, and the flash-crash
//! emergency sell-all.

mod common;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use common::{TestHarness, harness};
use sanad_trader::application::heartbeat::Heartbeat;
use sanad_trader::application::monitor::PositionMonitor;
use sanad_trader::application::oms::OrderManager;
use sanad_trader::domain::decision::{DecisionRecord, DecisionResult, PipelineStage};
use sanad_trader::domain::ids::{make_decision_id, make_position_id};
use sanad_trader::domain::position::{Position, PositionStatus};
use sanad_trader::infrastructure::feeds::{
    CachedPrice, PortfolioState, PriceCache, PriceHistory, PricePoint, save_json_atomic,
};

async fn open_position(h: &TestHarness, token: &str, entry: Decimal) -> Position {
    let signal_id = format!("sig-{token}");
    let decision_id = make_decision_id(&signal_id, "v3.1");
    let now = Utc::now();

    let record = DecisionRecord {
        decision_id: decision_id.clone(),
        signal_id: signal_id.clone(),
        created_at: now,
        policy_version: "v3.1".into(),
        result: DecisionResult::Execute,
        stage: PipelineStage::Execute,
        reason_code: "EXECUTED".into(),
        token_address: "addr".into(),
        chain: "solana".into(),
        source_primary: Some("birdeye".into()),
        signal_type: Some("MEME_GAINER".into()),
        score_total: Some(80.0),
        strategy_id: Some("meme-momentum".into()),
        position_usd: Some(dec!(200)),
        gate_failed: None,
        evidence_json: None,
        timings_json: "{}".into(),
        decision_packet_json: "{}".into(),
    };
    let position = Position {
        position_id: make_position_id(&decision_id, 1),
        decision_id,
        signal_id,
        created_at: now,
        updated_at: now,
        status: PositionStatus::Open,
        token: token.to_string(),
        token_address: "addr".into(),
        chain: "solana".into(),
        symbol: format!("{token}USDT"),
        strategy_id: "meme-momentum".into(),
        entry_price: entry,
        size_usd: dec!(200),
        size_token: dec!(200) / entry,
        stop_loss_pct: 0.15,
        take_profit_pct: 0.30,
        breakeven_activated: false,
        entry_volume_24h: Some(dec!(5000000)),
        exit_price: None,
        exit_reason: None,
        closed_at: None,
        pnl_usd: None,
        pnl_pct: None,
        risk_flag: None,
        async_analysis_complete: false,
        async_analysis_json: None,
        regime_tag: Some("NEUTRAL".into()),
        source_primary: Some("birdeye".into()),
        execution_mode: Some("paper_standard".into()),
    };
    let (stored, _) = h.ctx.store.try_open_position_atomic(&record, &position).await.unwrap();
    stored
}

fn set_price(h: &TestHarness, symbol: &str, price: Decimal) {
    let state_dir = h.ctx.config.state_dir();
    let mut cache = PriceCache::load(&state_dir);
    cache.entries.insert(
        symbol.to_string(),
        CachedPrice { price, volume_24h: Some(dec!(5000000)), timestamp: Utc::now() },
    );
    save_json_atomic(&state_dir.join("price_cache.json"), &cache).unwrap();
}

fn monitor(h: &TestHarness) -> PositionMonitor {
    let oms = OrderManager::new(h.ctx.store.clone(), h.ctx.exchange.clone(), h.ctx.kill_switch.clone());
    PositionMonitor::new(h.ctx.config.clone(), h.ctx.store.clone(), oms, h.ctx.notifier.clone())
}

#[tokio::test]
async fn stop_loss_breach_closes_position() {
    let h = harness().await;
    let position = open_position(&h, "WIF", dec!(2.50)).await;
    // Stop at 2.50 * 0.85 = 2.125
    set_price(&h, "WIFUSDT", dec!(2.00));

    let closed = monitor(&h).run_cycle(Utc::now()).await.unwrap();
    assert_eq!(closed, 1);

    let after = h.ctx.store.get_position(&position.position_id).await.unwrap().unwrap();
    assert_eq!(after.status, PositionStatus::Closed);
    assert_eq!(after.exit_reason.as_deref(), Some("STOP_LOSS"));
    assert!(after.pnl_usd.unwrap() < Decimal::ZERO);

    // Closed trade row feeds the learning loops
    assert!(h.ctx.store.last_trade_at("WIF").await.unwrap().is_some());

    // Portfolio aggregates reflect the realized loss
    let portfolio = PortfolioState::load_or_default(&h.ctx.config.state_dir());
    assert!(portfolio.current_balance_usd < dec!(10000));
    assert_eq!(portfolio.open_position_count, 0);
}

#[tokio::test]
async fn take_profit_closes_with_positive_pnl() {
    let h = harness().await;
    let position = open_position(&h, "WIF", dec!(2.00)).await;
    set_price(&h, "WIFUSDT", dec!(2.70));

    monitor(&h).run_cycle(Utc::now()).await.unwrap();
    let after = h.ctx.store.get_position(&position.position_id).await.unwrap().unwrap();
    assert_eq!(after.exit_reason.as_deref(), Some("TAKE_PROFIT"));
    assert!(after.pnl_usd.unwrap() > Decimal::ZERO);
}

/// The breakeven ratchet tightens the stop in place without closing, and
/// the tightening survives in the store.
#[tokio::test]
async fn breakeven_ratchet_tightens_stop_without_closing() {
    let h = harness().await;
    let position = open_position(&h, "WIF", dec!(2.00)).await;
    set_price(&h, "WIFUSDT", dec!(2.11)); // +5.5%

    let closed = monitor(&h).run_cycle(Utc::now()).await.unwrap();
    assert_eq!(closed, 0);

    let after = h.ctx.store.get_position(&position.position_id).await.unwrap().unwrap();
    assert_eq!(after.status, PositionStatus::Open);
    assert!(after.breakeven_activated);
    assert!(after.stop_loss_pct < 0.01);

    // Next cycle at entry: price 2.00 <= 2.00 * (1 - 0.001) is false, but a
    // dip below breakeven closes at roughly entry
    set_price(&h, "WIFUSDT", dec!(1.99));
    let closed = monitor(&h).run_cycle(Utc::now()).await.unwrap();
    assert_eq!(closed, 1);
    let after = h.ctx.store.get_position(&position.position_id).await.unwrap().unwrap();
    assert_eq!(after.exit_reason.as_deref(), Some("STOP_LOSS"));
}

#[tokio::test]
async fn stale_price_cache_skips_the_cycle() {
    let h = harness().await;
    open_position(&h, "WIF", dec!(2.50)).await;

    let state_dir = h.ctx.config.state_dir();
    let mut cache = PriceCache::default();
    cache.entries.insert(
        "WIFUSDT".into(),
        CachedPrice {
            price: dec!(1.00), // would trip every stop if evaluated
            volume_24h: None,
            timestamp: Utc::now() - chrono::Duration::minutes(20),
        },
    );
    save_json_atomic(&state_dir.join("price_cache.json"), &cache).unwrap();

    let closed = monitor(&h).run_cycle(Utc::now()).await.unwrap();
    assert_eq!(closed, 0);
    assert_eq!(h.ctx.store.get_open_positions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn time_exit_closes_old_positions() {
    let h = harness().await;
    let position = open_position(&h, "WIF", dec!(2.50)).await;
    set_price(&h, "WIFUSDT", dec!(2.50));

    // paper_max_hold_hours is 12; evaluate 13 hours in the future
    let later = Utc::now() + chrono::Duration::hours(13);
    // Refresh cache timestamp so the freshness precondition holds at `later`
    let state_dir = h.ctx.config.state_dir();
    let mut cache = PriceCache::load(&state_dir);
    cache.entries.get_mut("WIFUSDT").unwrap().timestamp = later;
    save_json_atomic(&state_dir.join("price_cache.json"), &cache).unwrap();

    monitor(&h).run_cycle(later).await.unwrap();
    let after = h.ctx.store.get_position(&position.position_id).await.unwrap().unwrap();
    assert_eq!(after.exit_reason.as_deref(), Some("TIME_EXIT"));
}

/// Boundary scenario: BTCUSDT at 95000 fifteen minutes ago and 66500 now is
/// a 30% drop. With three open meme positions the heartbeat triggers the
/// emergency sell-all: every position closes with EMERGENCY_SELL and the
/// kill switch activates with a flash-crash reason.
#[tokio::test]
async fn flash_crash_triggers_emergency_sell_all() {
    let h = harness().await;
    let now = Utc::now();

    for (token, price) in [("WIF", dec!(2.50)), ("BONK", dec!(0.00003)), ("PEPE", dec!(0.00001))] {
        open_position(&h, token, price).await;
        set_price(&h, &format!("{token}USDT"), price);
    }

    let state_dir = h.ctx.config.state_dir();
    let mut history = PriceHistory::default();
    history.series.insert(
        "BTCUSDT".into(),
        vec![
            PricePoint { timestamp: now - chrono::Duration::minutes(15), price: dec!(95000) },
            PricePoint { timestamp: now - chrono::Duration::seconds(10), price: dec!(66500) },
        ],
    );
    save_json_atomic(&state_dir.join("price_history.json"), &history).unwrap();

    let results = Heartbeat::new(&h.ctx).run_cycle(now).await.unwrap();
    let flash = results.iter().find(|r| r.name == "flash_crash").unwrap();
    assert_eq!(flash.status, sanad_trader::application::heartbeat::CheckStatus::Critical);

    // All three positions closed with EMERGENCY_SELL
    assert!(h.ctx.store.get_open_positions().await.unwrap().is_empty());
    for token in ["WIF", "BONK", "PEPE"] {
        let decision_id = make_decision_id(&format!("sig-{token}"), "v3.1");
        let position = h
            .ctx
            .store
            .get_position(&make_position_id(&decision_id, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.exit_reason.as_deref(), Some("EMERGENCY_SELL"));
    }

    // Kill switch active with the flash-crash reason
    assert!(h.ctx.kill_switch.is_active());
    assert!(h.ctx.kill_switch.reason().unwrap().contains("Flash crash"));
}
