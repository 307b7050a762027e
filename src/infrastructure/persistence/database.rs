use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::info;

/// Shared SQLite handle. Writes fail fast: the busy timeout is 250ms and a
/// locked database surfaces as `StoreError::Busy` instead of blocking the
/// worker cycle.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

pub const BUSY_TIMEOUT_MS: u64 = 250;

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Initialize schema. Idempotent.
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                decision_id TEXT PRIMARY KEY,
                signal_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                policy_version TEXT NOT NULL,
                result TEXT NOT NULL CHECK (result IN ('EXECUTE','SKIP','BLOCK')),
                stage TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                token_address TEXT NOT NULL,
                chain TEXT NOT NULL,
                source_primary TEXT,
                signal_type TEXT,
                score_total REAL,
                strategy_id TEXT,
                position_usd TEXT,
                gate_failed INTEGER,
                evidence_json TEXT,
                timings_json TEXT NOT NULL,
                decision_packet_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create decisions table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_decisions_signal_id ON decisions(signal_id)",
        )
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_decisions_token ON decisions(token_address)",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL UNIQUE,
                signal_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('OPEN','CLOSED')),
                token TEXT NOT NULL,
                token_address TEXT NOT NULL,
                chain TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                size_usd TEXT NOT NULL,
                size_token TEXT NOT NULL,
                stop_loss_pct REAL NOT NULL,
                take_profit_pct REAL NOT NULL,
                breakeven_activated INTEGER NOT NULL DEFAULT 0,
                entry_volume_24h TEXT,
                exit_price TEXT,
                exit_reason TEXT,
                closed_at TEXT,
                pnl_usd TEXT,
                pnl_pct REAL,
                risk_flag TEXT,
                async_analysis_complete INTEGER NOT NULL DEFAULT 0,
                async_analysis_json TEXT,
                regime_tag TEXT,
                source_primary TEXT,
                execution_mode TEXT
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create positions table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&mut *conn)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_token ON positions(token)")
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS async_tasks (
                task_id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('PENDING','RUNNING','DONE','FAILED')),
                attempts INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create async_tasks table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_next ON async_tasks(status, next_run_at)",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                client_order_id TEXT PRIMARY KEY,
                exchange_order_id TEXT,
                correlation_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                time_in_force TEXT NOT NULL,
                exchange TEXT NOT NULL,
                paper_mode INTEGER NOT NULL,
                state TEXT NOT NULL,
                fills_json TEXT NOT NULL DEFAULT '[]',
                filled_quantity TEXT NOT NULL DEFAULT '0',
                avg_fill_price TEXT,
                fee_usd TEXT NOT NULL DEFAULT '0',
                retries INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_symbol_state ON orders(symbol, state)")
            .execute(&mut *conn)
            .await?;

        // Intent journal: written before the exchange call, marked sent after ack
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_intents (
                client_order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sent_at TEXT,
                exchange_order_id TEXT
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create order_intents table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL,
                token TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                size_usd TEXT NOT NULL,
                pnl_usd TEXT NOT NULL,
                pnl_pct REAL NOT NULL,
                fee_usd TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                exit_slippage_pct REAL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_token_time ON trades(token, timestamp)")
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bandit_strategy_stats (
                strategy_id TEXT NOT NULL,
                regime_tag TEXT NOT NULL,
                alpha REAL NOT NULL,
                beta REAL NOT NULL,
                n INTEGER NOT NULL,
                last_updated TEXT NOT NULL,
                PRIMARY KEY(strategy_id, regime_tag)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create bandit_strategy_stats table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_ucb_stats (
                source_id TEXT PRIMARY KEY,
                n INTEGER NOT NULL,
                reward_sum REAL NOT NULL,
                last_updated TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create source_ucb_stats table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
