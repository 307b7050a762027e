//! State store: the single source of truth.
//!
//! Every guarded transition is a conditional UPDATE on the expected current
//! state; `rows_affected() == 0` means another worker raced and the caller
//! treats it as a no-op or a warning, never a crash.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::str::FromStr;
use tracing::{info, warn};

use crate::domain::bandit::{BanditStat, TradeStats};
use crate::domain::decision::DecisionRecord;
use crate::domain::errors::StoreError;
use crate::domain::order::{Fill, Order, OrderSide, OrderState, TimeInForce};
use crate::domain::position::{
    ExitPayload, FLAG_ASYNC_FAILED_PERMANENT, Position, PositionStatus, TradeRecord,
};
use crate::domain::task::{AsyncTask, FailureDisposition, TASK_TYPE_ANALYZE, TaskStatus, failure_disposition};
use crate::infrastructure::persistence::database::{BUSY_TIMEOUT_MS, Database};

pub type StoreResult<T> = Result<T, StoreError>;

/// Authoritative task view returned by a successful claim. The attempts value
/// here is post-increment and is the only input to retry decisions.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: String,
    pub task_type: String,
    pub entity_id: String,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct StateStore {
    db: Database,
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        let msg = db_err.message().to_lowercase();
        if msg.contains("database is locked") || msg.contains("database is busy") {
            return StoreError::Busy { timeout_ms: BUSY_TIMEOUT_MS };
        }
    }
    StoreError::Database(e)
}

fn parse_dt(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn parse_dec(raw: &str) -> StoreResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| StoreError::Corrupt(format!("bad decimal '{raw}': {e}")))
}

fn parse_opt_dec(raw: Option<String>) -> StoreResult<Option<Decimal>> {
    raw.map(|s| parse_dec(&s)).transpose()
}

fn parse_opt_dt(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|s| parse_dt(&s)).transpose()
}

impl StateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Decisions ────────────────────────────────────────────────

    /// Insert a decision. Idempotent on decision_id: a replayed pipeline run
    /// leaves the original row untouched.
    pub async fn insert_decision(&self, record: &DecisionRecord) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO decisions (
                decision_id, signal_id, created_at, policy_version, result, stage,
                reason_code, token_address, chain, source_primary, signal_type,
                score_total, strategy_id, position_usd, gate_failed, evidence_json,
                timings_json, decision_packet_json
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT(decision_id) DO NOTHING
            "#,
        )
        .bind(&record.decision_id)
        .bind(&record.signal_id)
        .bind(record.created_at.to_rfc3339())
        .bind(&record.policy_version)
        .bind(record.result.as_str())
        .bind(record.stage.as_str())
        .bind(&record.reason_code)
        .bind(&record.token_address)
        .bind(&record.chain)
        .bind(&record.source_primary)
        .bind(&record.signal_type)
        .bind(record.score_total)
        .bind(&record.strategy_id)
        .bind(record.position_usd.map(|d| d.to_string()))
        .bind(record.gate_failed.map(|g| g as i64))
        .bind(&record.evidence_json)
        .bind(&record.timings_json)
        .bind(&record.decision_packet_json)
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn count_decisions(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM decisions")
            .fetch_one(&self.db.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get::<i64, _>("c"))
    }

    // ── Positions ────────────────────────────────────────────────

    /// Single transaction: upsert the decision, insert the position guarded
    /// by the decision_id UNIQUE constraint, and enqueue the ANALYZE task.
    /// When the position already exists the existing row is returned and no
    /// task is enqueued. Two workers racing on the same decision produce
    /// exactly one position and one task.
    pub async fn try_open_position_atomic(
        &self,
        decision: &DecisionRecord,
        position: &Position,
    ) -> StoreResult<(Position, bool)> {
        let mut tx = self.db.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            r#"
            INSERT INTO decisions (
                decision_id, signal_id, created_at, policy_version, result, stage,
                reason_code, token_address, chain, source_primary, signal_type,
                score_total, strategy_id, position_usd, gate_failed, evidence_json,
                timings_json, decision_packet_json
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT(decision_id) DO NOTHING
            "#,
        )
        .bind(&decision.decision_id)
        .bind(&decision.signal_id)
        .bind(decision.created_at.to_rfc3339())
        .bind(&decision.policy_version)
        .bind(decision.result.as_str())
        .bind(decision.stage.as_str())
        .bind(&decision.reason_code)
        .bind(&decision.token_address)
        .bind(&decision.chain)
        .bind(&decision.source_primary)
        .bind(&decision.signal_type)
        .bind(decision.score_total)
        .bind(&decision.strategy_id)
        .bind(decision.position_usd.map(|d| d.to_string()))
        .bind(decision.gate_failed.map(|g| g as i64))
        .bind(&decision.evidence_json)
        .bind(&decision.timings_json)
        .bind(&decision.decision_packet_json)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO positions (
                position_id, decision_id, signal_id, created_at, updated_at, status,
                token, token_address, chain, symbol, strategy_id, entry_price,
                size_usd, size_token, stop_loss_pct, take_profit_pct,
                breakeven_activated, entry_volume_24h, regime_tag, source_primary,
                execution_mode
            )
            VALUES ($1, $2, $3, $4, $5, 'OPEN', $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, 0, $16, $17, $18, $19)
            ON CONFLICT(decision_id) DO NOTHING
            "#,
        )
        .bind(&position.position_id)
        .bind(&position.decision_id)
        .bind(&position.signal_id)
        .bind(position.created_at.to_rfc3339())
        .bind(position.updated_at.to_rfc3339())
        .bind(&position.token)
        .bind(&position.token_address)
        .bind(&position.chain)
        .bind(&position.symbol)
        .bind(&position.strategy_id)
        .bind(position.entry_price.to_string())
        .bind(position.size_usd.to_string())
        .bind(position.size_token.to_string())
        .bind(position.stop_loss_pct)
        .bind(position.take_profit_pct)
        .bind(position.entry_volume_24h.map(|d| d.to_string()))
        .bind(&position.regime_tag)
        .bind(&position.source_primary)
        .bind(&position.execution_mode)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if inserted.rows_affected() == 0 {
            // Lost the race: hand back the winner's row, enqueue nothing.
            let existing = Self::fetch_position_by_decision(&mut tx, &decision.decision_id).await?;
            tx.commit().await.map_err(map_sqlx)?;
            warn!(
                "Position for decision {} already existed — returning existing row",
                &decision.decision_id[..16.min(decision.decision_id.len())]
            );
            return Ok((existing, true));
        }

        let task_id = format!("task_{}", &position.position_id[..32.min(position.position_id.len())]);
        let now = position.created_at;
        sqlx::query(
            r#"
            INSERT INTO async_tasks (task_id, task_type, entity_id, status, attempts, next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'PENDING', 0, $4, $4, $4)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(&task_id)
        .bind(TASK_TYPE_ANALYZE)
        .bind(&position.position_id)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        info!(
            "Opened position {} ({} ${})",
            &position.position_id[..16.min(position.position_id.len())],
            position.token,
            position.size_usd
        );
        Ok((position.clone(), false))
    }

    async fn fetch_position_by_decision(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        decision_id: &str,
    ) -> StoreResult<Position> {
        let row = sqlx::query("SELECT * FROM positions WHERE decision_id = $1")
            .bind(decision_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "position",
                id: decision_id.to_string(),
            })?;
        row_to_position(&row)
    }

    /// Close a position. Guarded by status='OPEN'; a second closer races to a
    /// no-op and gets `RacedTransition`.
    pub async fn update_position_close(
        &self,
        position_id: &str,
        exit: &ExitPayload,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'CLOSED',
                exit_price = $2,
                exit_reason = $3,
                closed_at = $4,
                pnl_usd = $5,
                pnl_pct = $6,
                updated_at = $4
            WHERE position_id = $1
              AND status = 'OPEN'
            "#,
        )
        .bind(position_id)
        .bind(exit.exit_price.to_string())
        .bind(exit.exit_reason.as_str())
        .bind(exit.closed_at.to_rfc3339())
        .bind(exit.pnl_usd.to_string())
        .bind(exit.pnl_pct)
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RacedTransition {
                entity: "position",
                id: position_id.to_string(),
                expected: "OPEN",
            });
        }
        Ok(())
    }

    pub async fn get_position(&self, position_id: &str) -> StoreResult<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE position_id = $1")
            .bind(position_id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_position).transpose()
    }

    pub async fn get_open_positions(&self) -> StoreResult<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status = 'OPEN' ORDER BY created_at")
            .fetch_all(&self.db.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_position).collect()
    }

    /// Persist a breakeven-ratchet tightening. One-way: the update is guarded
    /// so the stop distance can only shrink.
    pub async fn tighten_stop_loss(
        &self,
        position_id: &str,
        new_stop_loss_pct: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET stop_loss_pct = $2, breakeven_activated = 1, updated_at = $3
            WHERE position_id = $1
              AND status = 'OPEN'
              AND stop_loss_pct > $2
            "#,
        )
        .bind(position_id)
        .bind(new_stop_loss_pct)
        .bind(now.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_position_analysis(
        &self,
        position_id: &str,
        analysis_json: &str,
        risk_flag: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET async_analysis_json = $2,
                async_analysis_complete = 1,
                risk_flag = COALESCE($3, risk_flag),
                updated_at = $4
            WHERE position_id = $1
            "#,
        )
        .bind(position_id)
        .bind(analysis_json)
        .bind(risk_flag)
        .bind(now.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    // ── Async tasks ──────────────────────────────────────────────

    /// Task ids ready to run, oldest first. Full rows come from the claim.
    pub async fn poll_pending_tasks(&self, limit: i64, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id FROM async_tasks
            WHERE status = 'PENDING'
              AND task_type = $1
              AND next_run_at <= $2
            ORDER BY next_run_at ASC
            LIMIT $3
            "#,
        )
        .bind(TASK_TYPE_ANALYZE)
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("task_id")).collect())
    }

    /// Atomic claim: PENDING→RUNNING with `attempts := attempts + 1`.
    /// Returns the authoritative post-increment row, or None if another
    /// worker won or the task is not ready.
    pub async fn claim_async_task(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ClaimedTask>> {
        let mut conn = self.db.pool.acquire().await.map_err(map_sqlx)?;

        let updated = sqlx::query(
            r#"
            UPDATE async_tasks
            SET status = 'RUNNING',
                attempts = attempts + 1,
                updated_at = $2
            WHERE task_id = $1
              AND status = 'PENDING'
              AND task_type = $3
              AND next_run_at <= $2
            "#,
        )
        .bind(task_id)
        .bind(now.to_rfc3339())
        .bind(TASK_TYPE_ANALYZE)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT task_id, task_type, entity_id, attempts FROM async_tasks WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let claimed = ClaimedTask {
            task_id: row.get("task_id"),
            task_type: row.get("task_type"),
            entity_id: row.get("entity_id"),
            attempts: row.get::<i64, _>("attempts") as u32,
        };
        info!("Claimed task {} (attempt {})", claimed.task_id, claimed.attempts);
        Ok(Some(claimed))
    }

    /// RUNNING→DONE, guarded.
    pub async fn mark_task_done(&self, task_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE async_tasks
            SET status = 'DONE', updated_at = $2, last_error = NULL
            WHERE task_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(task_id)
        .bind(now.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            warn!("mark_task_done({task_id}) — task was not RUNNING (race?)");
        }
        Ok(())
    }

    /// RUNNING→PENDING (retry with backoff) or RUNNING→FAILED.
    ///
    /// `attempts_now` is the authoritative post-claim value and is NOT
    /// incremented here. On permanent failure the associated position is
    /// flagged only if the guarded task update actually won.
    pub async fn mark_task_failed(
        &self,
        task_id: &str,
        error_code: &str,
        error_msg: &str,
        attempts_now: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let full_error = format!("{error_code}: {error_msg}");

        match failure_disposition(attempts_now, max_attempts) {
            FailureDisposition::GiveUp => {
                let mut tx = self.db.pool.begin().await.map_err(map_sqlx)?;
                let updated = sqlx::query(
                    r#"
                    UPDATE async_tasks
                    SET status = 'FAILED', last_error = $2, updated_at = $3
                    WHERE task_id = $1 AND status = 'RUNNING'
                    "#,
                )
                .bind(task_id)
                .bind(&full_error)
                .bind(now.to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;

                if updated.rows_affected() == 0 {
                    warn!("mark_task_failed({task_id}) — task was not RUNNING (race?), skipping position flag");
                    tx.commit().await.map_err(map_sqlx)?;
                    return Ok(());
                }

                let entity: Option<String> =
                    sqlx::query("SELECT entity_id FROM async_tasks WHERE task_id = $1")
                        .bind(task_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(map_sqlx)?
                        .map(|r| r.get("entity_id"));

                if let Some(position_id) = entity {
                    sqlx::query(
                        "UPDATE positions SET risk_flag = $2, updated_at = $3 WHERE position_id = $1",
                    )
                    .bind(&position_id)
                    .bind(FLAG_ASYNC_FAILED_PERMANENT)
                    .bind(now.to_rfc3339())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                    warn!(
                        "Task {task_id} FAILED permanently after {attempts_now} attempts ({error_code}); position {position_id} flagged"
                    );
                }
                tx.commit().await.map_err(map_sqlx)?;
            }
            FailureDisposition::Retry { delay_secs } => {
                let next_run = now + chrono::Duration::seconds(delay_secs);
                let updated = sqlx::query(
                    r#"
                    UPDATE async_tasks
                    SET status = 'PENDING', last_error = $2, next_run_at = $3, updated_at = $4
                    WHERE task_id = $1 AND status = 'RUNNING'
                    "#,
                )
                .bind(task_id)
                .bind(&full_error)
                .bind(next_run.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&self.db.pool)
                .await
                .map_err(map_sqlx)?;

                if updated.rows_affected() == 0 {
                    warn!("mark_task_failed({task_id}) — task was not RUNNING (race?)");
                } else {
                    info!(
                        "Task {task_id} retry scheduled in {delay_secs}s (attempt {attempts_now}/{max_attempts}, {error_code})"
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> StoreResult<Option<AsyncTask>> {
        let row = sqlx::query("SELECT * FROM async_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// Backlog counts for the heartbeat: stale PENDING and stuck RUNNING.
    pub async fn task_backlog(
        &self,
        pending_stale_after: DateTime<Utc>,
        running_stuck_after: DateTime<Utc>,
    ) -> StoreResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
              SUM(CASE WHEN status = 'PENDING' AND next_run_at <= $1 THEN 1 ELSE 0 END) AS stale_pending,
              SUM(CASE WHEN status = 'RUNNING' AND updated_at <= $2 THEN 1 ELSE 0 END) AS stuck_running
            FROM async_tasks
            "#,
        )
        .bind(pending_stale_after.to_rfc3339())
        .bind(running_stuck_after.to_rfc3339())
        .fetch_one(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok((
            row.get::<Option<i64>, _>("stale_pending").unwrap_or(0),
            row.get::<Option<i64>, _>("stuck_running").unwrap_or(0),
        ))
    }

    // ── Orders ───────────────────────────────────────────────────

    pub async fn upsert_order(&self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                client_order_id, exchange_order_id, correlation_id, strategy, symbol,
                side, quantity, price, time_in_force, exchange, paper_mode, state,
                fills_json, filled_quantity, avg_fill_price, fee_usd, retries, error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT(client_order_id) DO UPDATE SET
                exchange_order_id = excluded.exchange_order_id,
                state = excluded.state,
                fills_json = excluded.fills_json,
                filled_quantity = excluded.filled_quantity,
                avg_fill_price = excluded.avg_fill_price,
                fee_usd = excluded.fee_usd,
                retries = excluded.retries,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&order.client_order_id)
        .bind(&order.exchange_order_id)
        .bind(&order.correlation_id)
        .bind(&order.strategy)
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.quantity.to_string())
        .bind(order.price.map(|p| p.to_string()))
        .bind(order.time_in_force.to_string())
        .bind(&order.exchange)
        .bind(order.paper_mode)
        .bind(order.state.as_str())
        .bind(serde_json::to_string(&order.fills)?)
        .bind(order.filled_quantity.to_string())
        .bind(order.avg_fill_price.map(|p| p.to_string()))
        .bind(order.fee_usd.to_string())
        .bind(order.retries as i64)
        .bind(&order.error)
        .bind(order.created_at.to_rfc3339())
        .bind(order.updated_at.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn get_order(&self, client_order_id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE client_order_id = $1")
            .bind(client_order_id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_order).transpose()
    }

    pub async fn get_active_orders(&self, symbol: Option<&str>) -> StoreResult<Vec<Order>> {
        let rows = match symbol {
            Some(sym) => {
                sqlx::query(
                    r#"
                    SELECT * FROM orders
                    WHERE symbol = $1
                      AND state NOT IN ('FILLED','CANCELED','REJECTED','EXPIRED','FAILED')
                    "#,
                )
                .bind(sym)
                .fetch_all(&self.db.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM orders
                    WHERE state NOT IN ('FILLED','CANCELED','REJECTED','EXPIRED','FAILED')
                    "#,
                )
                .fetch_all(&self.db.pool)
                .await
            }
        }
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_order).collect()
    }

    /// Journal the intent before the exchange call ever happens.
    pub async fn record_order_intent(&self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_intents (client_order_id, symbol, side, quantity, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(client_order_id) DO NOTHING
            "#,
        )
        .bind(&order.client_order_id)
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.quantity.to_string())
        .bind(order.created_at.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn mark_intent_sent(
        &self,
        client_order_id: &str,
        exchange_order_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE order_intents SET sent_at = $2, exchange_order_id = $3 WHERE client_order_id = $1",
        )
        .bind(client_order_id)
        .bind(now.to_rfc3339())
        .bind(exchange_order_id)
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    // ── Trades ───────────────────────────────────────────────────

    pub async fn insert_trade(&self, trade: &TradeRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                position_id, token, symbol, side, entry_price, exit_price, size_usd,
                pnl_usd, pnl_pct, fee_usd, exit_reason, strategy_id, timestamp,
                exit_slippage_pct
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&trade.position_id)
        .bind(&trade.token)
        .bind(&trade.symbol)
        .bind(trade.side)
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.size_usd.to_string())
        .bind(trade.pnl_usd.to_string())
        .bind(trade.pnl_pct)
        .bind(trade.fee_usd.to_string())
        .bind(&trade.exit_reason)
        .bind(&trade.strategy_id)
        .bind(trade.timestamp.to_rfc3339())
        .bind(trade.exit_slippage_pct)
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// Most recent trade time for a token, for the cooldown gate.
    pub async fn last_trade_at(&self, token: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT timestamp FROM trades WHERE token = $1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(token)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        parse_opt_dt(row.map(|r| r.get::<String, _>("timestamp")))
    }

    /// Realized PnL summed over trades, optionally limited to trades after
    /// `since`.
    pub async fn realized_pnl_usd(&self, since: Option<DateTime<Utc>>) -> StoreResult<Decimal> {
        let rows = match since {
            Some(cutoff) => {
                sqlx::query("SELECT pnl_usd FROM trades WHERE timestamp >= $1")
                    .bind(cutoff.to_rfc3339())
                    .fetch_all(&self.db.pool)
                    .await
            }
            None => sqlx::query("SELECT pnl_usd FROM trades").fetch_all(&self.db.pool).await,
        }
        .map_err(map_sqlx)?;

        let mut total = Decimal::ZERO;
        for row in rows {
            total += parse_dec(&row.get::<String, _>("pnl_usd"))?;
        }
        Ok(total)
    }

    /// Win rate and average win/loss magnitudes across closed trades, for
    /// Kelly sizing.
    pub async fn trade_stats(&self) -> StoreResult<TradeStats> {
        let rows = sqlx::query("SELECT pnl_pct FROM trades")
            .fetch_all(&self.db.pool)
            .await
            .map_err(map_sqlx)?;

        let pnls: Vec<f64> = rows.iter().map(|r| r.get::<f64, _>("pnl_pct")).collect();
        if pnls.is_empty() {
            return Ok(TradeStats::default());
        }

        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p <= 0.0).collect();
        let avg = |xs: &[f64]| {
            if xs.is_empty() { 0.0 } else { xs.iter().map(|x| x.abs()).sum::<f64>() / xs.len() as f64 }
        };

        Ok(TradeStats {
            closed_trades: pnls.len(),
            win_rate: wins.len() as f64 / pnls.len() as f64,
            avg_win_pct: avg(&wins),
            avg_loss_pct: avg(&losses),
        })
    }

    // ── Bandit statistics ───────────────────────────────────────

    pub async fn load_bandit_stats(&self, regime_tag: &str) -> StoreResult<Vec<BanditStat>> {
        let rows = sqlx::query(
            "SELECT strategy_id, regime_tag, alpha, beta, n FROM bandit_strategy_stats WHERE regime_tag = $1",
        )
        .bind(regime_tag)
        .fetch_all(&self.db.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .iter()
            .map(|r| BanditStat {
                strategy_id: r.get("strategy_id"),
                regime_tag: r.get("regime_tag"),
                alpha: r.get("alpha"),
                beta: r.get("beta"),
                n: r.get::<i64, _>("n") as u64,
            })
            .collect())
    }

    pub async fn record_strategy_outcome(
        &self,
        strategy_id: &str,
        regime_tag: &str,
        win: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (da, db_) = if win { (1.0, 0.0) } else { (0.0, 1.0) };
        sqlx::query(
            r#"
            INSERT INTO bandit_strategy_stats (strategy_id, regime_tag, alpha, beta, n, last_updated)
            VALUES ($1, $2, 1.0 + $3, 1.0 + $4, 1, $5)
            ON CONFLICT(strategy_id, regime_tag) DO UPDATE SET
                alpha = alpha + $3,
                beta = beta + $4,
                n = n + 1,
                last_updated = $5
            "#,
        )
        .bind(strategy_id)
        .bind(regime_tag)
        .bind(da)
        .bind(db_)
        .bind(now.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn record_source_outcome(
        &self,
        source_id: &str,
        reward: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO source_ucb_stats (source_id, n, reward_sum, last_updated)
            VALUES ($1, 1, $2, $3)
            ON CONFLICT(source_id) DO UPDATE SET
                n = n + 1,
                reward_sum = reward_sum + $2,
                last_updated = $3
            "#,
        )
        .bind(source_id)
        .bind(reward)
        .bind(now.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn get_source_stats(&self, source_id: &str) -> StoreResult<Option<(u64, f64)>> {
        let row = sqlx::query("SELECT n, reward_sum FROM source_ucb_stats WHERE source_id = $1")
            .bind(source_id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|r| (r.get::<i64, _>("n") as u64, r.get::<f64, _>("reward_sum"))))
    }
}

fn row_to_position(row: &SqliteRow) -> StoreResult<Position> {
    let status_raw: String = row.get("status");
    let status = PositionStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("bad position status '{status_raw}'")))?;

    Ok(Position {
        position_id: row.get("position_id"),
        decision_id: row.get("decision_id"),
        signal_id: row.get("signal_id"),
        created_at: parse_dt(&row.get::<String, _>("created_at"))?,
        updated_at: parse_dt(&row.get::<String, _>("updated_at"))?,
        status,
        token: row.get("token"),
        token_address: row.get("token_address"),
        chain: row.get("chain"),
        symbol: row.get("symbol"),
        strategy_id: row.get("strategy_id"),
        entry_price: parse_dec(&row.get::<String, _>("entry_price"))?,
        size_usd: parse_dec(&row.get::<String, _>("size_usd"))?,
        size_token: parse_dec(&row.get::<String, _>("size_token"))?,
        stop_loss_pct: row.get("stop_loss_pct"),
        take_profit_pct: row.get("take_profit_pct"),
        breakeven_activated: row.get::<i64, _>("breakeven_activated") != 0,
        entry_volume_24h: parse_opt_dec(row.get("entry_volume_24h"))?,
        exit_price: parse_opt_dec(row.get("exit_price"))?,
        exit_reason: row.get("exit_reason"),
        closed_at: parse_opt_dt(row.get("closed_at"))?,
        pnl_usd: parse_opt_dec(row.get("pnl_usd"))?,
        pnl_pct: row.get("pnl_pct"),
        risk_flag: row.get("risk_flag"),
        async_analysis_complete: row.get::<i64, _>("async_analysis_complete") != 0,
        async_analysis_json: row.get("async_analysis_json"),
        regime_tag: row.get("regime_tag"),
        source_primary: row.get("source_primary"),
        execution_mode: row.get("execution_mode"),
    })
}

fn row_to_task(row: &SqliteRow) -> StoreResult<AsyncTask> {
    let status_raw: String = row.get("status");
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("bad task status '{status_raw}'")))?;

    Ok(AsyncTask {
        task_id: row.get("task_id"),
        task_type: row.get("task_type"),
        entity_id: row.get("entity_id"),
        status,
        attempts: row.get::<i64, _>("attempts") as u32,
        next_run_at: parse_dt(&row.get::<String, _>("next_run_at"))?,
        last_error: row.get("last_error"),
        created_at: parse_dt(&row.get::<String, _>("created_at"))?,
        updated_at: parse_dt(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_order(row: &SqliteRow) -> StoreResult<Order> {
    let state_raw: String = row.get("state");
    let state = OrderState::parse(&state_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("bad order state '{state_raw}'")))?;
    let side_raw: String = row.get("side");
    let side = match side_raw.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => return Err(StoreError::Corrupt(format!("bad order side '{other}'"))),
    };
    let tif_raw: String = row.get("time_in_force");
    let time_in_force = match tif_raw.as_str() {
        "GTC" => TimeInForce::Gtc,
        "IOC" => TimeInForce::Ioc,
        "FOK" => TimeInForce::Fok,
        other => return Err(StoreError::Corrupt(format!("bad time in force '{other}'"))),
    };
    let fills: Vec<Fill> = serde_json::from_str(&row.get::<String, _>("fills_json"))?;

    Ok(Order {
        client_order_id: row.get("client_order_id"),
        exchange_order_id: row.get("exchange_order_id"),
        correlation_id: row.get("correlation_id"),
        strategy: row.get("strategy"),
        symbol: row.get("symbol"),
        side,
        quantity: parse_dec(&row.get::<String, _>("quantity"))?,
        price: parse_opt_dec(row.get("price"))?,
        time_in_force,
        exchange: row.get("exchange"),
        paper_mode: row.get("paper_mode"),
        state,
        fills,
        filled_quantity: parse_dec(&row.get::<String, _>("filled_quantity"))?,
        avg_fill_price: parse_opt_dec(row.get("avg_fill_price"))?,
        fee_usd: parse_dec(&row.get::<String, _>("fee_usd"))?,
        retries: row.get::<i64, _>("retries") as u32,
        error: row.get("error"),
        created_at: parse_dt(&row.get::<String, _>("created_at"))?,
        updated_at: parse_dt(&row.get::<String, _>("updated_at"))?,
    })
}
