//! Stage 4: strategy match and position sizing.
//!
//! Strategies are filtered by tier constraints, then Thompson sampling picks
//! an arm from the (strategy, regime) posteriors with a deterministic
//! registry fallback. Sizing is fractional Kelly (cold-start default until
//! enough closed trades exist), bounded by mode caps and modulated by the
//! regime factor.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::application::context::RuntimeContext;
use crate::domain::bandit::{kelly_position_pct, thompson_select, TradeStats};
use crate::domain::signal::MarketRegime;
use crate::domain::token_profile::{DEFAULT_STRATEGY, TokenProfile, eligible_strategies};
use crate::infrastructure::feeds::PortfolioState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub strategy_name: String,
    pub position_pct: f64,
    pub position_usd: Decimal,
    pub balance_usd: Decimal,
    pub sizing_mode: String,
    pub trade_count: usize,
    pub regime_tag: String,
    pub regime_size_modifier: f64,
    pub thompson_mode: String,
    pub eligible_strategies: Vec<String>,
}

pub async fn run(
    ctx: &RuntimeContext,
    profile: &TokenProfile,
    regime: MarketRegime,
) -> anyhow::Result<StrategyOutcome> {
    let eligible = eligible_strategies(profile);
    if eligible.is_empty() {
        warn!(
            "No strategies eligible for tier={}, regime={}",
            profile.simple_tier(),
            regime.tag()
        );
    } else {
        info!("Eligible strategies by tier: {eligible:?}");
    }

    // Thompson over the (strategy, regime) posteriors
    let arms = ctx.store.load_bandit_stats(regime.tag()).await.unwrap_or_default();
    let mut rng = StdRng::from_os_rng();
    let (strategy_name, thompson_mode) = match thompson_select(&mut rng, &arms, &eligible) {
        Some((picked, score)) => {
            info!("Thompson selected: {picked} (score={score:.4})");
            (picked, "thompson".to_string())
        }
        None => {
            info!("Thompson: no eligible strategies — falling back to registry default");
            (DEFAULT_STRATEGY.to_string(), "fallback".to_string())
        }
    };

    // Kelly sizing from closed-trade history
    let stats = ctx.store.trade_stats().await.unwrap_or_else(|e| {
        warn!("Trade stats unavailable ({e}) — cold-start sizing");
        TradeStats::default()
    });
    let sizing = &ctx.config.sizing;
    let mut position_pct = kelly_position_pct(
        stats,
        sizing.kelly_min_trades,
        sizing.kelly_fraction,
        sizing.kelly_default_pct,
    );
    let sizing_mode = if stats.closed_trades < sizing.kelly_min_trades {
        info!(
            "Kelly: cold start ({}/{} trades) -> {:.1}%",
            stats.closed_trades,
            sizing.kelly_min_trades,
            position_pct * 100.0
        );
        "cold_start"
    } else {
        info!(
            "Kelly: WR={:.0}% AvgW={:.1}% AvgL={:.1}% -> {:.2}%",
            stats.win_rate * 100.0,
            stats.avg_win_pct * 100.0,
            stats.avg_loss_pct * 100.0,
            position_pct * 100.0
        );
        "fractional_kelly"
    };

    let is_paper = ctx.config.mode.is_paper();
    if is_paper {
        position_pct = position_pct.min(sizing.paper_default_pct);
    }
    let max_pct = ctx.config.max_position_pct();
    position_pct = position_pct.min(max_pct);

    // Regime modulation, floored in paper mode so sizing stays meaningful
    let mut modifier = regime.size_modifier();
    if is_paper {
        modifier = modifier.max(sizing.paper_regime_floor);
    }
    if modifier < 1.0 && regime != MarketRegime::Unknown {
        let adjusted = position_pct * modifier;
        info!(
            "Regime sizing: {:.1}% x {modifier:.1} = {:.1}%",
            position_pct * 100.0,
            adjusted * 100.0
        );
        position_pct = adjusted;
    }
    position_pct = position_pct.min(max_pct);

    let balance = PortfolioState::load_or_default(&ctx.config.state_dir()).current_balance_usd;
    let position_usd = balance * Decimal::from_f64(position_pct).unwrap_or(Decimal::ZERO);

    info!(
        "Strategy: {strategy_name}, Position Size: {:.1}% = ${position_usd:.2}",
        position_pct * 100.0
    );

    Ok(StrategyOutcome {
        strategy_name,
        position_pct,
        position_usd: position_usd.round_dp(2),
        balance_usd: balance,
        sizing_mode: sizing_mode.to_string(),
        trade_count: stats.closed_trades,
        regime_tag: regime.tag().to_string(),
        regime_size_modifier: modifier,
        thompson_mode,
        eligible_strategies: eligible.iter().map(|s| s.to_string()).collect(),
    })
}
