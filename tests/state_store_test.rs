//! State store invariants: atomic opens, exactly-once claims, the retry
//! ladder, and guarded transitions.

use chrono::Utc;
use rust_decimal_macros::dec;
use sqlx::Row;

use sanad_trader::domain::decision::{DecisionRecord, DecisionResult, PipelineStage};
use sanad_trader::domain::errors::StoreError;
use sanad_trader::domain::ids::{make_decision_id, make_position_id};
use sanad_trader::domain::position::{
    ExitPayload, ExitReason, FLAG_ASYNC_FAILED_PERMANENT, Position, PositionStatus,
};
use sanad_trader::domain::task::TaskStatus;
use sanad_trader::infrastructure::persistence::{Database, StateStore};

fn decision(decision_id: &str, signal_id: &str) -> DecisionRecord {
    DecisionRecord {
        decision_id: decision_id.to_string(),
        signal_id: signal_id.to_string(),
        created_at: Utc::now(),
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
    }
}

fn position(decision_id: &str, signal_id: &str) -> Position {
    let now = Utc::now();
    Position {
        position_id: make_position_id(decision_id, 1),
        decision_id: decision_id.to_string(),
        signal_id: signal_id.to_string(),
        created_at: now,
        updated_at: now,
        status: PositionStatus::Open,
        token: "WIF".into(),
        token_address: "addr".into(),
        chain: "solana".into(),
        symbol: "WIFUSDT".into(),
        strategy_id: "meme-momentum".into(),
        entry_price: dec!(2.50),
        size_usd: dec!(200),
        size_token: dec!(80),
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
    }
}

async fn fresh_store() -> (StateStore, Database) {
    let dir = std::env::temp_dir().join(format!("store_test_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = Database::new(&format!("sqlite://{}/test.db", dir.display())).await.unwrap();
    (StateStore::new(db.clone()), db)
}

#[tokio::test]
async fn open_position_enqueues_exactly_one_task() {
    let (store, db) = fresh_store().await;
    let decision_id = make_decision_id("sig-1", "v3.1");
    let record = decision(&decision_id, "sig-1");
    let pos = position(&decision_id, "sig-1");

    let (stored, already_existed) = store.try_open_position_atomic(&record, &pos).await.unwrap();
    assert!(!already_existed);
    assert_eq!(stored.position_id, pos.position_id);

    let tasks: i64 = sqlx::query("SELECT COUNT(*) AS c FROM async_tasks")
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(tasks, 1);
}

/// Boundary scenario: two workers racing on the same decision_id yield one
/// position, one decision, one task — the loser receives the winner's row.
#[tokio::test]
async fn concurrent_open_race_is_idempotent() {
    let (store, db) = fresh_store().await;
    let decision_id = make_decision_id("sig-race", "v3.1");
    let record = decision(&decision_id, "sig-race");
    let pos = position(&decision_id, "sig-race");

    let store_a = store.clone();
    let store_b = store.clone();
    let (record_a, pos_a) = (record.clone(), pos.clone());
    let (record_b, pos_b) = (record.clone(), pos.clone());

    let (left, right) = tokio::join!(
        tokio::spawn(async move { store_a.try_open_position_atomic(&record_a, &pos_a).await }),
        tokio::spawn(async move { store_b.try_open_position_atomic(&record_b, &pos_b).await }),
    );
    let left = left.unwrap().unwrap();
    let right = right.unwrap().unwrap();

    // Exactly one creation
    assert_ne!(left.1, right.1, "exactly one call must report already_existed=false");
    assert_eq!(left.0.position_id, right.0.position_id);

    for (table, expected) in [("decisions", 1i64), ("positions", 1), ("async_tasks", 1)] {
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS c FROM {table}"))
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, expected, "{table} row count");
    }
}

/// Invariant: N concurrent claims on one task, exactly one wins.
#[tokio::test]
async fn claim_is_exactly_once_under_contention() {
    let (store, _db) = fresh_store().await;
    let decision_id = make_decision_id("sig-claim", "v3.1");
    let pos = position(&decision_id, "sig-claim");
    store
        .try_open_position_atomic(&decision(&decision_id, "sig-claim"), &pos)
        .await
        .unwrap();

    let task_id = store.poll_pending_tasks(10, Utc::now()).await.unwrap().remove(0);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let task_id = task_id.clone();
        handles.push(tokio::spawn(async move {
            store.claim_async_task(&task_id, Utc::now()).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if let Some(claimed) = handle.await.unwrap() {
            winners += 1;
            assert_eq!(claimed.attempts, 1, "first successful claim sees attempts=1");
        }
    }
    assert_eq!(winners, 1, "exactly one worker may claim the task");
}

/// Boundary scenario: the cold-path retry ladder. Attempts increment only on
/// claim; backoff is 300s, 900s, 3600s; the fourth failure is permanent and
/// flags the position.
#[tokio::test]
async fn retry_ladder_escalates_to_permanent_failure() {
    let (store, _db) = fresh_store().await;
    let decision_id = make_decision_id("sig-ladder", "v3.1");
    let pos = position(&decision_id, "sig-ladder");
    store
        .try_open_position_atomic(&decision(&decision_id, "sig-ladder"), &pos)
        .await
        .unwrap();

    let mut now = Utc::now();
    let task_id = store.poll_pending_tasks(10, now).await.unwrap().remove(0);

    for (cycle, expected_delay) in [(1u32, 300i64), (2, 900), (3, 3600)] {
        let claimed = store.claim_async_task(&task_id, now).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, cycle);

        store
            .mark_task_failed(&task_id, "ERR_JUDGE_PARSE", "no verdict", claimed.attempts, 4, now)
            .await
            .unwrap();

        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, cycle, "attempts stays at claim value after failure");
        assert_eq!((task.next_run_at - now).num_seconds(), expected_delay);

        // Not claimable before next_run_at
        assert!(store.claim_async_task(&task_id, now).await.unwrap().is_none());
        now = task.next_run_at + chrono::Duration::seconds(1);
    }

    // Fourth attempt: permanent failure
    let claimed = store.claim_async_task(&task_id, now).await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 4);
    store
        .mark_task_failed(&task_id, "ERR_JUDGE_PARSE", "no verdict", claimed.attempts, 4, now)
        .await
        .unwrap();

    let task = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 4);

    let flagged = store.get_position(&pos.position_id).await.unwrap().unwrap();
    assert_eq!(flagged.risk_flag.as_deref(), Some(FLAG_ASYNC_FAILED_PERMANENT));
}

#[tokio::test]
async fn mark_failed_without_running_is_a_noop() {
    let (store, _db) = fresh_store().await;
    let decision_id = make_decision_id("sig-noop", "v3.1");
    let pos = position(&decision_id, "sig-noop");
    store
        .try_open_position_atomic(&decision(&decision_id, "sig-noop"), &pos)
        .await
        .unwrap();
    let task_id = store.poll_pending_tasks(10, Utc::now()).await.unwrap().remove(0);

    // Task is PENDING, not RUNNING: the guarded update must not fire, and the
    // position must stay unflagged.
    store
        .mark_task_failed(&task_id, "ERR_WORKER", "boom", 4, 4, Utc::now())
        .await
        .unwrap();

    let task = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    let unflagged = store.get_position(&pos.position_id).await.unwrap().unwrap();
    assert!(unflagged.risk_flag.is_none());
}

#[tokio::test]
async fn double_close_races_to_single_winner() {
    let (store, _db) = fresh_store().await;
    let decision_id = make_decision_id("sig-close", "v3.1");
    let pos = position(&decision_id, "sig-close");
    store
        .try_open_position_atomic(&decision(&decision_id, "sig-close"), &pos)
        .await
        .unwrap();

    let exit = ExitPayload {
        exit_price: dec!(3.00),
        exit_reason: ExitReason::TakeProfit,
        detail: "target hit".into(),
        pnl_usd: dec!(39.56),
        pnl_pct: 0.198,
        fee_usd: dec!(0.44),
        closed_at: Utc::now(),
    };

    store.update_position_close(&pos.position_id, &exit).await.unwrap();
    let second = store.update_position_close(&pos.position_id, &exit).await;
    assert!(matches!(second, Err(StoreError::RacedTransition { .. })));

    let closed = store.get_position(&pos.position_id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_reason.as_deref(), Some("TAKE_PROFIT"));
    assert_eq!(closed.exit_price, Some(dec!(3.00)));
}

#[tokio::test]
async fn decision_insert_is_idempotent() {
    let (store, _db) = fresh_store().await;
    let decision_id = make_decision_id("sig-idem", "v3.1");
    let record = decision(&decision_id, "sig-idem");

    assert!(store.insert_decision(&record).await.unwrap());
    let mut replay = record.clone();
    replay.reason_code = "DIFFERENT".into();
    assert!(!store.insert_decision(&replay).await.unwrap());
    assert_eq!(store.count_decisions().await.unwrap(), 1);
}

#[tokio::test]
async fn tighten_stop_loss_is_one_way() {
    let (store, _db) = fresh_store().await;
    let decision_id = make_decision_id("sig-ratchet", "v3.1");
    let pos = position(&decision_id, "sig-ratchet");
    store
        .try_open_position_atomic(&decision(&decision_id, "sig-ratchet"), &pos)
        .await
        .unwrap();

    assert!(store.tighten_stop_loss(&pos.position_id, 0.001, Utc::now()).await.unwrap());
    // Widening is refused
    assert!(!store.tighten_stop_loss(&pos.position_id, 0.15, Utc::now()).await.unwrap());

    let updated = store.get_position(&pos.position_id).await.unwrap().unwrap();
    assert_eq!(updated.stop_loss_pct, 0.001);
    assert!(updated.breakeven_activated);
}
