//! Position monitor: exit rules over open positions.
//!
//! Rules run in a fixed order per position and the first match closes it.
//! If the price cache is older than ten minutes the whole cycle is skipped:
//! exits on blind prices are worse than no exits.

pub mod exit_rules;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::oms::{OrderManager, PlaceOrderRequest};
use crate::config::Config;
use crate::domain::order::{OrderSide, OrderState, TimeInForce};
use crate::domain::ports::{Notifier, NotifyLevel};
use crate::domain::position::{
    ExitPayload, ExitReason, Position, TradeRecord, compute_paper_pnl,
};
use crate::domain::token_profile::looks_like_meme;
use crate::infrastructure::feeds::{ExitSignals, PortfolioState, PriceCache, PriceHistory};
use crate::infrastructure::notify::notify_best_effort;
use crate::infrastructure::paper_execution::PAPER_FEE_RATE;
use crate::infrastructure::persistence::StateStore;

use exit_rules::{
    ExitTrigger, FLASH_CRASH_WINDOW_MIN, TrailingStops, breakeven_ratchet, check_momentum_decay,
    check_stop_loss, check_take_profit, check_time_exit, check_trailing_stop, detect_flash_crash,
};

/// Monitor skips the cycle entirely beyond this cache age.
const PRICE_CACHE_MAX_AGE_MIN: f64 = 10.0;

pub struct PositionMonitor {
    config: Config,
    store: StateStore,
    oms: OrderManager,
    notifier: Arc<dyn Notifier>,
}

impl PositionMonitor {
    pub fn new(config: Config, store: StateStore, oms: OrderManager, notifier: Arc<dyn Notifier>) -> Self {
        Self { config, store, oms, notifier }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<usize> {
        let state_dir = self.config.state_dir();
        let cache = PriceCache::load(&state_dir);

        match cache.newest_age_minutes(now) {
            Some(age) if age <= PRICE_CACHE_MAX_AGE_MIN => {}
            Some(age) => {
                warn!("Price cache {age:.0}min old (max {PRICE_CACHE_MAX_AGE_MIN:.0}min) — skipping exit checks");
                return Ok(0);
            }
            None => {
                warn!("Price cache empty — skipping exit checks");
                return Ok(0);
            }
        }

        let open = self.store.get_open_positions().await?;
        if open.is_empty() {
            info!("No open positions");
            return Ok(0);
        }

        let history = PriceHistory::load(&state_dir);
        let exit_signals = ExitSignals::load(&state_dir);
        let mut trailing = TrailingStops::load(&state_dir);
        let mut closed = 0usize;

        // Rule 1: flash-crash override closes every meme-tier position.
        let samples: Vec<(String, Decimal, Decimal)> = history
            .series
            .keys()
            .filter_map(|symbol| {
                let recent = history.recent_price(symbol, now)?;
                let old = history.price_near(symbol, now, FLASH_CRASH_WINDOW_MIN)?;
                Some((symbol.clone(), recent, old))
            })
            .collect();
        let crashes = detect_flash_crash(&samples);

        if let Some((symbol, change)) = crashes.first() {
            let detail = format!("Flash crash: {symbol} {:.1}% in {FLASH_CRASH_WINDOW_MIN}min", change * 100.0);
            warn!("{detail} — closing all meme-tier positions");
            for position in &open {
                if looks_like_meme(&position.token) {
                    let price = cache.get(&position.symbol).map(|p| p.price);
                    if self
                        .close_position(position, price, ExitReason::EmergencySell, &detail, &mut trailing, now)
                        .await?
                    {
                        closed += 1;
                    }
                }
            }
        }

        let still_open = self.store.get_open_positions().await?;
        for position in &still_open {
            let Some(cached) = cache.get(&position.symbol) else {
                warn!("No cached price for {} — skipping", position.symbol);
                continue;
            };
            let current = cached.price;

            if let Some(trigger) = check_stop_loss(position, current) {
                if self.close_with(position, current, &trigger, &mut trailing, now).await? {
                    closed += 1;
                }
                continue;
            }
            if let Some(trigger) = check_take_profit(position, current) {
                if self.close_with(position, current, &trigger, &mut trailing, now).await? {
                    closed += 1;
                }
                continue;
            }

            // Rule 4 is a stateful side effect, not an exit: tighten and keep going.
            if !position.breakeven_activated
                && let Some(new_stop) = breakeven_ratchet(position, current)
                && self.store.tighten_stop_loss(&position.position_id, new_stop, now).await?
            {
                info!(
                    "[BREAKEVEN] {}: +{:.1}% — stop moved to entry",
                    position.token,
                    position.unrealized_pct(current) * 100.0
                );
            }

            if let Some(trigger) = check_trailing_stop(position, current, &mut trailing, now) {
                if self.close_with(position, current, &trigger, &mut trailing, now).await? {
                    closed += 1;
                }
                continue;
            }
            if let Some(trigger) = check_time_exit(position, self.config.max_hold_hours(), now) {
                if self.close_with(position, current, &trigger, &mut trailing, now).await? {
                    closed += 1;
                }
                continue;
            }

            let price_2h_ago = history.price_near(&position.symbol, now, 120);
            let current_vol = cached.volume_24h;
            if let Some(trigger) = check_momentum_decay(position, current, price_2h_ago, current_vol) {
                if self.close_with(position, current, &trigger, &mut trailing, now).await? {
                    closed += 1;
                }
                continue;
            }

            if let Some(signal) = exit_signals.urgent_exit_for(&position.token, now) {
                let trigger = ExitTrigger {
                    reason: ExitReason::ExternalExitSignal,
                    detail: format!("High-urgency exit from {}", signal.source),
                };
                if self.close_with(position, current, &trigger, &mut trailing, now).await? {
                    closed += 1;
                }
                continue;
            }
        }

        trailing.save(&state_dir)?;
        self.update_portfolio(now).await?;
        Ok(closed)
    }

    async fn close_with(
        &self,
        position: &Position,
        current: Decimal,
        trigger: &ExitTrigger,
        trailing: &mut TrailingStops,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.close_position(position, Some(current), trigger.reason, &trigger.detail, trailing, now)
            .await
    }

    /// Close one position: sell through the OMS, persist the close, append
    /// the trade record and feed the learning loops. Notification failures
    /// never abort the close.
    async fn close_position(
        &self,
        position: &Position,
        current: Option<Decimal>,
        reason: ExitReason,
        detail: &str,
        trailing: &mut TrailingStops,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let decision_price = current.unwrap_or(position.entry_price);

        let fill_price = match self
            .oms
            .place_order(PlaceOrderRequest {
                symbol: position.symbol.clone(),
                side: OrderSide::Sell,
                quantity: position.size_token,
                price: Some(decision_price),
                time_in_force: TimeInForce::Ioc,
                strategy: position.strategy_id.clone(),
                correlation_id: position.position_id.clone(),
                exchange: "binance".into(),
                paper_mode: self.config.mode.is_paper(),
            })
            .await
        {
            Ok(order) if order.state == OrderState::Filled => {
                order.avg_fill_price.unwrap_or(decision_price)
            }
            Ok(order) => {
                warn!(
                    "Exit order for {} ended {} — closing at decision price",
                    position.token, order.state
                );
                decision_price
            }
            Err(e) => {
                warn!("Exit order for {} failed ({e}) — closing at decision price", position.token);
                decision_price
            }
        };

        let fee_rate = Decimal::from_f64(PAPER_FEE_RATE).unwrap_or(Decimal::ZERO);
        let (pnl_usd, pnl_pct, fee_usd) =
            compute_paper_pnl(position.entry_price, fill_price, position.size_token, fee_rate);

        let exit = ExitPayload {
            exit_price: fill_price,
            exit_reason: reason,
            detail: detail.to_string(),
            pnl_usd,
            pnl_pct,
            fee_usd,
            closed_at: now,
        };

        match self.store.update_position_close(&position.position_id, &exit).await {
            Ok(()) => {}
            Err(crate::domain::errors::StoreError::RacedTransition { .. }) => {
                warn!("Position {} already closed by another worker", position.position_id);
                return Ok(false);
            }
            Err(e) => return Err(e).context("Failed to close position"),
        }

        let exit_slippage_pct = if decision_price > Decimal::ZERO {
            ((fill_price - decision_price) / decision_price).to_f64()
        } else {
            None
        };

        self.store
            .insert_trade(&TradeRecord {
                position_id: position.position_id.clone(),
                token: position.token.clone(),
                symbol: position.symbol.clone(),
                side: "SELL",
                entry_price: position.entry_price,
                exit_price: fill_price,
                size_usd: position.size_usd,
                pnl_usd,
                pnl_pct,
                fee_usd,
                exit_reason: reason.as_str().to_string(),
                strategy_id: position.strategy_id.clone(),
                timestamp: now,
                exit_slippage_pct,
            })
            .await?;

        // Post-trade learning: strategy posterior and source reward.
        let win = pnl_usd > Decimal::ZERO;
        let regime = position.regime_tag.as_deref().unwrap_or("UNKNOWN");
        if let Err(e) = self.store.record_strategy_outcome(&position.strategy_id, regime, win, now).await {
            warn!("Bandit update failed (non-fatal): {e}");
        }
        if let Some(source) = &position.source_primary
            && let Err(e) = self
                .store
                .record_source_outcome(source, if win { 1.0 } else { 0.0 }, now)
                .await
        {
            warn!("Source UCB update failed (non-fatal): {e}");
        }

        trailing.remove(&position.symbol);

        info!(
            "CLOSED {} [{}] entry ${} exit ${} pnl ${:.2} ({:.1}%) — {detail}",
            position.token,
            reason,
            position.entry_price,
            fill_price,
            pnl_usd,
            pnl_pct * 100.0
        );

        let level = if reason == ExitReason::EmergencySell { NotifyLevel::L3 } else { NotifyLevel::L2 };
        notify_best_effort(
            self.notifier.as_ref(),
            &format!(
                "SELL {}\n\nExit: {fill_price}\nPnL: ${pnl_usd:.2} ({:.1}%)\nReason: {reason}\n{detail}",
                position.token,
                pnl_pct * 100.0
            ),
            level,
            Some(&format!("SELL {}", position.token)),
        )
        .await;

        Ok(true)
    }

    /// Recompute portfolio aggregates from the store. The monitor is the
    /// single writer of `portfolio.json`.
    async fn update_portfolio(&self, now: DateTime<Utc>) -> Result<()> {
        let state_dir = self.config.state_dir();
        let mut portfolio = PortfolioState::load_or_default(&state_dir);

        let open = self.store.get_open_positions().await?;

        // Balance = starting balance + realized PnL across all closed trades.
        let realized = self.store.realized_pnl_usd(None).await?;
        portfolio.current_balance_usd = portfolio.starting_balance_usd + realized;

        if portfolio.current_balance_usd > portfolio.equity_high_water_usd {
            portfolio.equity_high_water_usd = portfolio.current_balance_usd;
        }
        let hwm = portfolio.equity_high_water_usd;
        portfolio.current_drawdown_pct = if hwm > Decimal::ZERO {
            ((hwm - portfolio.current_balance_usd) / hwm)
                .to_f64()
                .unwrap_or(0.0)
                * 100.0
        } else {
            0.0
        };

        // Daily PnL resets at midnight UTC.
        let today = now.format("%Y-%m-%d").to_string();
        if portfolio.daily_reset_date.as_deref() != Some(&today) {
            portfolio.daily_reset_date = Some(today);
            portfolio.daily_pnl_pct = 0.0;
        } else {
            let daily = self
                .store
                .realized_pnl_usd(Some(now - chrono::Duration::hours(24)))
                .await?;
            portfolio.daily_pnl_pct = if portfolio.starting_balance_usd > Decimal::ZERO {
                (daily / portfolio.starting_balance_usd).to_f64().unwrap_or(0.0) * 100.0
            } else {
                0.0
            };
        }

        portfolio.open_position_count = open.len();
        portfolio.token_exposure_pct.clear();
        let balance = portfolio.current_balance_usd;
        let mut meme_usd = Decimal::ZERO;
        for position in &open {
            let pct = if balance > Decimal::ZERO {
                (position.size_usd / balance).to_f64().unwrap_or(0.0) * 100.0
            } else {
                0.0
            };
            *portfolio.token_exposure_pct.entry(position.token.clone()).or_insert(0.0) += pct;
            if looks_like_meme(&position.token) {
                meme_usd += position.size_usd;
            }
        }
        portfolio.meme_allocation_pct = if balance > Decimal::ZERO {
            (meme_usd / balance).to_f64().unwrap_or(0.0) * 100.0
        } else {
            0.0
        };
        portfolio.updated_at = Some(now);

        portfolio.save(&state_dir)?;
        Ok(())
    }
}
