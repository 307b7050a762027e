//! Router cycles: selection, state persistence, the processed set, the pause
//! flag and the daily budget.

mod common;

use chrono::Utc;
use serde_json::json;

use common::{TestHarness, harness};
use sanad_trader::application::router::{RouterState, SignalRouter};

fn write_feed(h: &TestHarness, source_dir: &str, signals: serde_json::Value) {
    let dir = h.ctx.config.signals_dir().join(source_dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("latest.json"), json!({ "signals": signals }).to_string()).unwrap();
}

fn ondo_feed_signal() -> serde_json::Value {
    json!({
        "token": "ONDO",
        "token_address": "",
        "chain": "",
        "source_primary": "coingecko",
        "signal_type": "TRENDING_GAINER",
        "thesis": "RWA narrative accelerating with rising institutional volume",
        "timestamp": Utc::now().to_rfc3339(),
        "volume_24h": "5000000",
        "market_cap_usd": "900000000",
        "token_age_hours": 2000.0,
        "cex_listed": true
    })
}

#[tokio::test]
async fn pause_flag_exits_without_running() {
    let h = harness().await;
    write_feed(&h, "coingecko", json!([ondo_feed_signal()]));
    h.ctx.pause_flag.set("operator pause").unwrap();

    SignalRouter::new(&h.ctx).run_cycle(Utc::now()).await.unwrap();

    let state = RouterState::load(&h.ctx.config.state_dir());
    assert_eq!(state.daily_pipeline_runs, 0);
    assert!(state.last_run.is_none());
}

#[tokio::test]
async fn router_selects_scores_and_feeds_the_pipeline_once() {
    let h = harness().await;
    write_feed(&h, "coingecko", json!([ondo_feed_signal()]));
    // Same token in a second feed: cross-source corroboration
    write_feed(&h, "birdeye", json!([ondo_feed_signal()]));
    let now = Utc::now();

    SignalRouter::new(&h.ctx).run_cycle(now).await.unwrap();

    let state = RouterState::load(&h.ctx.config.state_dir());
    assert_eq!(state.daily_pipeline_runs, 1);
    assert_eq!(state.processed_hashes.len(), 1);
    assert!(state.last_run.is_some());

    // Cross-source + fast-track conditions hold: the pipeline executed
    assert_eq!(h.ctx.store.get_open_positions().await.unwrap().len(), 1);
    assert_eq!(h.ctx.store.count_decisions().await.unwrap(), 1);

    // Second cycle: the same signal is in the processed set, nothing new runs
    SignalRouter::new(&h.ctx).run_cycle(Utc::now()).await.unwrap();
    let state = RouterState::load(&h.ctx.config.state_dir());
    assert_eq!(state.daily_pipeline_runs, 1);
    assert_eq!(h.ctx.store.count_decisions().await.unwrap(), 1);
}

#[tokio::test]
async fn daily_budget_stops_dispatch() {
    let h = harness().await;
    write_feed(&h, "coingecko", json!([ondo_feed_signal()]));

    let now = Utc::now();
    let mut state = RouterState::load(&h.ctx.config.state_dir());
    state.daily_pipeline_runs = h.ctx.config.router.max_daily_runs;
    state.daily_reset_date = Some(now.format("%Y-%m-%d").to_string());
    state.save(&h.ctx.config.state_dir()).unwrap();

    SignalRouter::new(&h.ctx).run_cycle(now).await.unwrap();

    assert_eq!(h.ctx.store.count_decisions().await.unwrap(), 0);
    let state = RouterState::load(&h.ctx.config.state_dir());
    assert_eq!(state.daily_pipeline_runs, h.ctx.config.router.max_daily_runs);
}

#[tokio::test]
async fn stale_feed_files_yield_no_candidates() {
    let h = harness().await;
    let dir = h.ctx.config.signals_dir().join("coingecko");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("old.json");
    std::fs::write(&path, json!({ "signals": [ondo_feed_signal()] }).to_string()).unwrap();
    // Age the file past the stale threshold
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(45 * 60);
    let times = std::fs::File::options().write(true).open(&path).unwrap();
    times.set_modified(old).unwrap();

    SignalRouter::new(&h.ctx).run_cycle(Utc::now()).await.unwrap();

    assert_eq!(h.ctx.store.count_decisions().await.unwrap(), 0);
    let state = RouterState::load(&h.ctx.config.state_dir());
    assert_eq!(state.daily_pipeline_runs, 0);
}

/// Daily counters reset at midnight UTC: a stale reset date clears the
/// processed set and the run counter.
#[tokio::test]
async fn midnight_reset_clears_daily_counters() {
    let h = harness().await;
    write_feed(&h, "coingecko", json!([ondo_feed_signal()]));
    write_feed(&h, "birdeye", json!([ondo_feed_signal()]));

    let mut state = RouterState::default();
    state.daily_pipeline_runs = 20;
    state.processed_hashes = vec!["aaaaaaaaaaaa".into()];
    state.daily_reset_date = Some("2020-01-01".into());
    state.save(&h.ctx.config.state_dir()).unwrap();

    SignalRouter::new(&h.ctx).run_cycle(Utc::now()).await.unwrap();

    let state = RouterState::load(&h.ctx.config.state_dir());
    // Reset happened, then this cycle consumed one run
    assert_eq!(state.daily_pipeline_runs, 1);
    assert_eq!(state.processed_hashes.len(), 1);
}
