//! Stages 6 and 7: policy gates, then execute-or-log.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use tracing::{info, warn};

use crate::application::context::RuntimeContext;
use crate::application::oms::{OrderManager, PlaceOrderRequest};
use crate::application::pipeline::debate::DebateOutcome;
use crate::application::pipeline::sanad::SanadOutcome;
use crate::application::pipeline::strategy::StrategyOutcome;
use crate::application::policy::{PolicyOutcome, PolicyResult, PolicyState, evaluate_gates};
use crate::domain::decision::{
    DecisionPacket, JudgeSummary, MarketDataSnapshot, SanadSummary, TradeIntent,
};
use crate::domain::order::{OrderSide, OrderState, TimeInForce};
use crate::domain::ports::NotifyLevel;
use crate::domain::position::{Position, PositionStatus};
use crate::domain::signal::Signal;
use crate::infrastructure::notify::notify_best_effort;

/// REVISE verdicts in paper mode execute as micro-probes.
pub const PAPER_REVISE_PROBE_USD: u32 = 25;
/// An order expecting less than half its size to fill is skipped.
pub const MIN_FILL_FRACTION: f64 = 0.5;

/// Expected fill fraction: an order can absorb about a tenth of hourly
/// traded liquidity before it starts walking the book.
pub fn simulate_fill_fraction(order_usd: Decimal, volume_24h: Option<Decimal>) -> f64 {
    let Some(volume) = volume_24h.filter(|v| *v > Decimal::ZERO) else {
        return 1.0;
    };
    let hourly = volume / Decimal::from(24);
    let absorbable = hourly * Decimal::from_f64(0.1).unwrap_or(Decimal::ZERO);
    if order_usd <= Decimal::ZERO {
        return 1.0;
    }
    (absorbable / order_usd).to_f64().unwrap_or(1.0).min(1.0)
}

/// Stage 6: assemble the decision packet from every prior stage and the
/// exchange snapshot.
pub async fn build_packet(
    ctx: &RuntimeContext,
    correlation_id: &str,
    signal: &Signal,
    sanad: &SanadOutcome,
    strategy: &StrategyOutcome,
    judge: &JudgeSummary,
) -> DecisionPacket {
    let pair_symbol = signal.symbol();
    let now = Utc::now();

    let current_price = match ctx.exchange.get_price(&pair_symbol).await {
        Ok(price) => price,
        Err(e) => {
            warn!("Price fetch failed for {pair_symbol}: {e}");
            None
        }
    };
    let slippage = ctx
        .exchange
        .estimate_slippage_bps(&pair_symbol, OrderSide::Buy, strategy.position_usd)
        .await
        .unwrap_or(None);
    let spread = ctx.exchange.get_spread_bps(&pair_symbol).await.unwrap_or(None);

    let mut packet = DecisionPacket::empty(correlation_id);
    packet.token_symbol = signal.token.to_uppercase();
    packet.pair_symbol = pair_symbol;
    packet.venue = signal.venue();
    packet.exchange = if signal.venue() == crate::domain::signal::Venue::Dex {
        "raydium".into()
    } else {
        "binance".into()
    };
    packet.strategy_name = strategy.strategy_name.clone();
    packet.token_deployment_age_hours = signal.token_age_hours;
    packet.price_timestamp = current_price.is_some().then_some(now);
    packet.onchain_timestamp = signal.onchain_evidence.as_ref().and_then(|e| e.checked_at);
    packet.current_price = current_price;
    packet.sanad = SanadSummary {
        trust_score: sanad.trust_score,
        grade: sanad.grade.clone(),
        recommendation: sanad.recommendation.clone(),
        rugpull_flags: sanad.rugpull_flags.clone(),
        sybil_risk: Some(sanad.sybil_risk.clone()),
        hard_gate: sanad.hard_gate,
    };
    packet.market_data = MarketDataSnapshot {
        estimated_slippage_bps: slippage,
        spread_bps: spread,
        depth_sufficient: slippage.map(|bps| bps < 99_999),
        price_change_pct_window: Some(signal.volatility_30min_pct.unwrap_or(0.0)),
        liquidity_usd: signal.liquidity_usd,
    };
    packet.trade_intent = TradeIntent {
        position_size_pct: strategy.position_pct,
        position_usd: strategy.position_usd,
    };
    packet.trade_confidence_score = if judge.verdict == "REJECT" {
        Some(0.0)
    } else {
        Some(judge.confidence)
    };
    packet.judge = judge.clone();
    packet.has_verified_catalyst = signal.verified_catalyst;
    packet
}

/// Stage 6 evaluation. State-load failures surface as a gate-0 BLOCK.
pub async fn run_policy(ctx: &RuntimeContext, packet: &DecisionPacket) -> PolicyOutcome {
    let now = Utc::now();
    let last_trade = ctx
        .store
        .last_trade_at(&packet.token_symbol)
        .await
        .unwrap_or(None);

    let state = match PolicyState::load(
        &ctx.config.state_dir(),
        &ctx.kill_switch,
        last_trade,
        ctx.config.mode.is_paper(),
    ) {
        Ok(state) => state,
        Err(e) => {
            warn!("Policy state unavailable: {e} — BLOCK");
            return PolicyOutcome {
                result: PolicyResult::Block,
                gates_passed: Vec::new(),
                gate_failed: Some(0),
                gate_failed_name: Some("STATE".into()),
                gate_evidence: Some(e.to_string()),
                all_evidence: Default::default(),
                correlation_id: packet.correlation_id.clone(),
                evaluated_at: now,
            };
        }
    };

    let outcome = evaluate_gates(&ctx.config, packet, &state, now);
    match outcome.result {
        PolicyResult::Pass => info!("RESULT: PASS — All 15 gates cleared"),
        PolicyResult::Block => info!(
            "RESULT: BLOCK — gate {} ({}): {}",
            outcome.gate_failed.unwrap_or(0),
            outcome.gate_failed_name.as_deref().unwrap_or("?"),
            outcome.gate_evidence.as_deref().unwrap_or("")
        ),
    }
    outcome
}

pub struct ExecutionResult {
    pub executed: bool,
    pub position: Option<Position>,
    pub execution_mode: String,
    pub rejection_reason: Option<String>,
    pub fill_price: Option<Decimal>,
}

/// Stage 7 when the gates passed: size, simulate fill sufficiency, place the
/// order and open the position atomically.
pub async fn execute_trade(
    ctx: &RuntimeContext,
    correlation_id: &str,
    signal: &Signal,
    sanad: &SanadOutcome,
    strategy: &StrategyOutcome,
    debate: &DebateOutcome,
    packet: &DecisionPacket,
    decision: &crate::domain::decision::DecisionRecord,
) -> Result<ExecutionResult> {
    let now = Utc::now();

    if ctx.kill_switch.is_active() {
        return Ok(ExecutionResult {
            executed: false,
            position: None,
            execution_mode: "none".into(),
            rejection_reason: Some("Kill switch active".into()),
            fill_price: None,
        });
    }

    let Some(current_price) = packet.current_price.filter(|p| *p > Decimal::ZERO) else {
        warn!("CRITICAL: invalid price — cannot calculate quantity");
        return Ok(ExecutionResult {
            executed: false,
            position: None,
            execution_mode: "none".into(),
            rejection_reason: Some("Invalid price".into()),
            fill_price: None,
        });
    };

    // REVISE in paper mode trades micro-size for learning data
    let is_paper = ctx.config.mode.is_paper();
    let is_revise_probe = debate.judge.verdict == "REVISE" && is_paper;
    let (position_usd, execution_mode) = if is_revise_probe {
        let capped = strategy.position_usd.min(Decimal::from(PAPER_REVISE_PROBE_USD));
        info!("REVISE PROBE: Micro-sizing {} -> ${capped} (learning mode)", strategy.position_usd);
        (capped, "paper_probe_revise".to_string())
    } else {
        (strategy.position_usd, "paper_standard".to_string())
    };

    let fill_fraction = simulate_fill_fraction(position_usd, signal.volume_24h);
    if fill_fraction < MIN_FILL_FRACTION {
        info!("Partial fill sim: only {:.0}% fill expected — SKIPPING", fill_fraction * 100.0);
        return Ok(ExecutionResult {
            executed: false,
            position: None,
            execution_mode,
            rejection_reason: Some("Partial fill too low".into()),
            fill_price: None,
        });
    }

    let quantity = position_usd / current_price;
    info!(
        "EXECUTING {} TRADE: BUY {quantity:.6} {} @ ${current_price}",
        if is_paper { "PAPER" } else { "LIVE" },
        packet.pair_symbol
    );

    let oms = OrderManager::new(ctx.store.clone(), ctx.exchange.clone(), ctx.kill_switch.clone());
    let order = match oms
        .place_order(PlaceOrderRequest {
            symbol: packet.pair_symbol.clone(),
            side: OrderSide::Buy,
            quantity,
            price: Some(current_price),
            time_in_force: TimeInForce::Gtc,
            strategy: strategy.strategy_name.clone(),
            correlation_id: correlation_id.to_string(),
            exchange: packet.exchange.clone(),
            paper_mode: is_paper,
        })
        .await
    {
        Ok(order) => order,
        Err(e) => {
            warn!("Order placement failed: {e}");
            return Ok(ExecutionResult {
                executed: false,
                position: None,
                execution_mode,
                rejection_reason: Some(format!("Order failed: {e}")),
                fill_price: None,
            });
        }
    };

    if order.state != OrderState::Filled && order.state != OrderState::PartiallyFilled {
        return Ok(ExecutionResult {
            executed: false,
            position: None,
            execution_mode,
            rejection_reason: Some(format!("Order ended in state {}", order.state)),
            fill_price: None,
        });
    }

    let fill_price = order.avg_fill_price.unwrap_or(current_price);
    let position = Position {
        position_id: crate::domain::ids::make_position_id(&decision.decision_id, 1),
        decision_id: decision.decision_id.clone(),
        signal_id: decision.signal_id.clone(),
        created_at: now,
        updated_at: now,
        status: PositionStatus::Open,
        token: signal.token.to_uppercase(),
        token_address: signal.token_address.clone(),
        chain: signal.chain.clone(),
        symbol: packet.pair_symbol.clone(),
        strategy_id: strategy.strategy_name.clone(),
        entry_price: fill_price,
        size_usd: position_usd,
        size_token: order.filled_quantity,
        stop_loss_pct: ctx.config.risk.stop_loss_default_pct,
        take_profit_pct: ctx.config.risk.take_profit_default_pct,
        breakeven_activated: false,
        entry_volume_24h: signal.volume_24h,
        exit_price: None,
        exit_reason: None,
        closed_at: None,
        pnl_usd: None,
        pnl_pct: None,
        risk_flag: None,
        async_analysis_complete: false,
        async_analysis_json: None,
        regime_tag: Some(strategy.regime_tag.clone()),
        source_primary: Some(signal.source_primary.to_lowercase()),
        execution_mode: Some(execution_mode.clone()),
    };

    let (stored, already_existed) = ctx.store.try_open_position_atomic(decision, &position).await?;
    if already_existed {
        warn!("Position already existed for decision — idempotent replay");
    }

    notify_best_effort(
        ctx.notifier.as_ref(),
        &format!(
            "BUY {}/USDT\n\nEntry: {fill_price}\nSize: ${position_usd} ({:.2} units)\n\nStrategy: {}\nSanad Score: {:.0}\nFee: {:.2}\n\nAll 15 policy gates passed",
            signal.token, order.filled_quantity, strategy.strategy_name, sanad.trust_score, order.fee_usd
        ),
        NotifyLevel::L2,
        Some(&format!("BUY {}", signal.token)),
    )
    .await;

    Ok(ExecutionResult {
        executed: true,
        position: Some(stored),
        execution_mode,
        rejection_reason: None,
        fill_price: Some(fill_price),
    })
}
