//! The fifteen gates. Each returns (passed, evidence); every failure path is
//! a BLOCK and missing inputs fail closed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::state::PolicyState;
use super::GateResult;
use crate::config::Config;
use crate::domain::decision::DecisionPacket;
use crate::domain::signal::Venue;

/// Gate 1: manual or automatic system halt. Overrides everything.
pub(crate) fn gate_01_kill_switch(
    _config: &Config,
    _packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    if state.kill_switch_active {
        (false, "Kill switch is ACTIVE".into())
    } else {
        (true, "Kill switch not active".into())
    }
}

/// Gate 2: daily loss limit and max drawdown.
pub(crate) fn gate_02_capital_preservation(
    config: &Config,
    _packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let daily_pnl = state.portfolio.daily_pnl_pct;
    let drawdown = state.portfolio.current_drawdown_pct;
    let daily_limit = config.risk.daily_loss_limit_pct;
    let max_dd = config.risk.max_drawdown_pct;

    if daily_pnl <= -daily_limit {
        return (false, format!("Daily loss limit hit: {daily_pnl:.2}% <= -{daily_limit:.0}%"));
    }
    if drawdown >= max_dd {
        return (false, format!("Max drawdown exceeded: {drawdown:.2}% >= {max_dd:.0}%"));
    }
    (true, format!("Daily PnL: {daily_pnl:.2}%, Drawdown: {drawdown:.2}%"))
}

/// Gate 3: stale or missing data means blind trading.
pub(crate) fn gate_03_data_freshness(
    config: &Config,
    packet: &DecisionPacket,
    _state: &PolicyState,
    now: DateTime<Utc>,
) -> GateResult {
    let Some(price_ts) = packet.price_timestamp else {
        return (false, "Price timestamp missing — cannot verify freshness".into());
    };
    let price_age = (now - price_ts).num_seconds();
    if price_age > config.policy_gates.price_max_age_sec {
        return (
            false,
            format!(
                "Price data stale: {price_age}s old (max {}s)",
                config.policy_gates.price_max_age_sec
            ),
        );
    }

    if let Some(onchain_ts) = packet.onchain_timestamp {
        let onchain_age = (now - onchain_ts).num_seconds();
        if onchain_age > config.policy_gates.onchain_max_age_sec {
            return (
                false,
                format!(
                    "On-chain data stale: {onchain_age}s old (max {}s)",
                    config.policy_gates.onchain_max_age_sec
                ),
            );
        }
    }

    for (api_name, response) in &packet.api_responses {
        let empty = match response {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            _ => false,
        };
        if empty {
            return (false, format!("API {api_name} returned empty/null response"));
        }
    }

    (true, format!("Price age: {price_age}s, all data fresh"))
}

/// Gate 4: very young contracts only trade under the early-launch strategy.
pub(crate) fn gate_04_token_age(
    config: &Config,
    packet: &DecisionPacket,
    _state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let min_age = config.policy_gates.token_min_age_hours;
    let Some(age_hours) = packet.token_deployment_age_hours else {
        return (false, "Token deployment timestamp unknown — cannot verify age".into());
    };

    if age_hours < min_age {
        if packet.strategy_name == "early-launch" {
            return (
                true,
                format!("Token age {age_hours:.1}h < {min_age:.0}h but early-launch strategy permitted"),
            );
        }
        return (false, format!("Token too young: {age_hours:.1}h < {min_age:.0}h minimum"));
    }
    (true, format!("Token age: {age_hours:.1}h (minimum {min_age:.0}h)"))
}

const HARD_RUGPULL_FLAGS: [&str; 4] = ["honeypot", "blacklisted", "rug_confirmed", "mint_authority_active"];

/// Gate 5: hard rugpull flags never pass; paper mode tolerates soft flags.
pub(crate) fn gate_05_rugpull_safety(
    _config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let flags = &packet.sanad.rugpull_flags;
    if flags.is_empty() {
        return (true, "All rugpull safety checks passed".into());
    }

    let normalized: Vec<String> = flags
        .iter()
        .map(|f| f.to_lowercase().replace(' ', "_"))
        .collect();
    let hard_hits: Vec<&String> = normalized
        .iter()
        .filter(|f| HARD_RUGPULL_FLAGS.contains(&f.as_str()))
        .collect();

    if !hard_hits.is_empty() {
        let joined = hard_hits.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
        return (false, format!("Rugpull HARD flags: {joined}"));
    }

    if state.is_paper {
        return (true, format!("PAPER MODE: soft rugpull flags allowed: {}", flags.join(", ")));
    }
    (false, format!("Rugpull flags triggered: {}", flags.join(", ")))
}

/// Gate 6: a position we cannot exit is not a position.
pub(crate) fn gate_06_liquidity(
    config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let max_slippage = config.policy_gates.max_slippage_bps;

    let estimated = match packet.market_data.estimated_slippage_bps {
        Some(bps) => bps,
        None => {
            // Paper DEX tokens have no order book; estimate from pool size.
            if state.is_paper && packet.venue == Venue::Dex {
                let liquidity = packet.market_data.liquidity_usd.unwrap_or(Decimal::ZERO);
                let position = packet.trade_intent.position_usd;
                if liquidity > Decimal::ZERO {
                    let bps = ((position / liquidity) * Decimal::from(10_000))
                        .to_i64()
                        .unwrap_or(i64::MAX);
                    if bps <= max_slippage {
                        return (
                            true,
                            format!("DEX paper mode: estimated slippage {bps}bps from ${liquidity:.0} liquidity"),
                        );
                    }
                    return (
                        false,
                        format!("DEX slippage too high: {bps}bps > {max_slippage}bps (liquidity ${liquidity:.0})"),
                    );
                }
                return (
                    true,
                    "DEX paper mode: no liquidity data — allowing with simulated 100bps slippage".into(),
                );
            }
            return (false, "Slippage estimate not provided — cannot verify liquidity".into());
        }
    };

    if estimated > max_slippage {
        return (false, format!("Slippage too high: {estimated}bps > {max_slippage}bps max"));
    }

    if packet.market_data.depth_sufficient == Some(false) {
        if state.is_paper && packet.venue == Venue::Dex {
            return (
                true,
                format!("DEX paper mode: slippage OK ({estimated}bps), depth check skipped"),
            );
        }
        return (false, "Order book / pool depth insufficient for position size".into());
    }

    (true, format!("Slippage: {estimated}bps (max {max_slippage}bps)"))
}

/// Gate 7: wide spread means thin liquidity or manipulation. CEX only.
pub(crate) fn gate_07_spread(
    config: &Config,
    packet: &DecisionPacket,
    _state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    if packet.venue == Venue::Dex {
        return (true, "Spread gate skipped — DEX trade (no order book spread)".into());
    }

    let max_spread = config.policy_gates.max_spread_bps;
    let Some(spread) = packet.market_data.spread_bps else {
        return (false, "Spread data not provided — cannot verify".into());
    };
    if spread > max_spread {
        return (false, format!("Spread too wide: {spread}bps > {max_spread}bps max"));
    }
    (true, format!("Spread: {spread}bps (max {max_spread}bps)"))
}

/// Gate 8: dynamic honeypot detection by simulated sell. DEX only.
pub(crate) fn gate_08_preflight_simulation(
    _config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    if packet.venue == Venue::Cex {
        return (true, "Pre-flight simulation skipped — CEX trade".into());
    }

    let Some(preflight) = &packet.preflight_simulation else {
        if state.is_paper {
            return (true, "DEX paper mode: pre-flight simulation skipped (no on-chain access)".into());
        }
        return (false, "Pre-flight simulation results missing for DEX trade".into());
    };

    match preflight.sell_simulation_success {
        None => (false, "Pre-flight simulation not executed — cannot verify".into()),
        Some(false) => {
            let detail = preflight.error.as_deref().unwrap_or("unknown error");
            (false, format!("Simulated sell REVERTED: {detail}"))
        }
        Some(true) if preflight.tokens_returned == 0.0 => {
            (false, "Simulated sell returned 0 tokens — likely honeypot".into())
        }
        Some(true) => (
            true,
            format!("Pre-flight simulation passed, tokens returned: {}", preflight.tokens_returned),
        ),
    }
}

/// Gate 9: extreme unexplained volatility is manipulation risk.
pub(crate) fn gate_09_volatility_halt(
    config: &Config,
    packet: &DecisionPacket,
    _state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let threshold = config.policy_gates.volatility_halt_pct;
    let window = config.policy_gates.volatility_halt_window_minutes;
    let Some(change) = packet.market_data.price_change_pct_window else {
        return (false, format!("Price change over {window}min window not provided"));
    };

    if change.abs() > threshold && !packet.has_verified_catalyst {
        return (
            false,
            format!(
                "Volatility halt: {:.1}% move in {window}min (>{:.0}%) with no verified catalyst",
                change.abs() * 100.0,
                threshold * 100.0
            ),
        );
    }
    (true, format!("Price change: {:.1}% in {window}min", change.abs() * 100.0))
}

/// Gate 10: unreliable execution environment.
pub(crate) fn gate_10_exchange_health(
    config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let max_error_rate = config.policy_gates.exchange_error_rate_pct;
    let exchange = &packet.exchange;

    let Some(health) = state.exchange_health.exchanges.get(exchange) else {
        if state.is_paper && packet.venue == Venue::Dex {
            return (true, format!("DEX paper mode: health check skipped for {exchange}"));
        }
        return (false, format!("No health data for exchange {exchange}"));
    };

    if health.error_rate_pct > max_error_rate {
        return (
            false,
            format!(
                "Exchange {exchange} error rate: {:.1}% > {:.0}%",
                health.error_rate_pct * 100.0,
                max_error_rate * 100.0
            ),
        );
    }
    if health.websocket_connected == Some(false) {
        return (false, format!("Exchange {exchange} WebSocket disconnected"));
    }
    (
        true,
        format!("Exchange {exchange} healthy (error rate: {:.1}%)", health.error_rate_pct * 100.0),
    )
}

/// Gate 11: unknown state means do not add complexity.
pub(crate) fn gate_11_reconciliation(
    config: &Config,
    _packet: &DecisionPacket,
    state: &PolicyState,
    now: DateTime<Utc>,
) -> GateResult {
    let max_age = config.policy_gates.reconciliation_max_age_sec;
    let Some(last) = state.reconciliation.last_reconciliation_timestamp else {
        return (false, "No reconciliation has been performed".into());
    };

    let age_sec = (now - last).num_seconds();
    if age_sec > max_age {
        return (false, format!("Reconciliation stale: {age_sec}s ago (max {max_age}s)"));
    }
    if state.reconciliation.has_mismatch {
        let detail = state.reconciliation.mismatch_details.as_deref().unwrap_or("unknown");
        return (false, format!("Reconciliation mismatch detected: {detail}"));
    }
    (true, format!("Reconciliation clean, {age_sec}s ago"))
}

/// Gate 12: portfolio concentration limits.
pub(crate) fn gate_12_exposure_limits(
    config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let max_single = config.risk.max_single_token_pct;
    let max_meme = config.risk.max_meme_allocation_pct;
    let max_positions = config.policy_gates.max_concurrent_positions;

    let position_pct = packet.trade_intent.position_size_pct * 100.0;
    let existing_token_pct = state
        .portfolio
        .token_exposure_pct
        .get(&packet.token_symbol)
        .copied()
        .unwrap_or(0.0);
    let total_token_pct = existing_token_pct + position_pct;

    if total_token_pct > max_single {
        return (
            false,
            format!("Single-token exposure: {total_token_pct:.2}% > {max_single:.0}% max"),
        );
    }

    let new_meme_pct = state.portfolio.meme_allocation_pct + position_pct;
    if new_meme_pct > max_meme {
        return (false, format!("Meme allocation: {new_meme_pct:.2}% > {max_meme:.0}% max"));
    }

    let open = state.portfolio.open_position_count;
    if open >= max_positions {
        return (false, format!("Max concurrent positions: {open} >= {max_positions}"));
    }

    (
        true,
        format!(
            "Token: {total_token_pct:.2}%/{max_single:.0}%, Meme: {new_meme_pct:.2}%/{max_meme:.0}%, Positions: {open}/{max_positions}"
        ),
    )
}

/// Gate 13: no revenge trading.
pub(crate) fn gate_13_cooldown(
    config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    now: DateTime<Utc>,
) -> GateResult {
    if packet.token_symbol.is_empty() {
        return (false, "Token symbol missing from decision packet".into());
    }

    let cooldown_min = config.policy_gates.cooldown_minutes;
    if let Some(last) = state.last_token_trade_at {
        let elapsed_min = (now - last).num_minutes();
        if elapsed_min < cooldown_min {
            return (
                false,
                format!(
                    "Cooldown active for {}: last traded {elapsed_min}min ago ({}min remaining)",
                    packet.token_symbol,
                    cooldown_min - elapsed_min
                ),
            );
        }
    }
    (true, format!("No cooldown active for {}", packet.token_symbol))
}

/// Gate 14: LLM cost control.
pub(crate) fn gate_14_budget(
    config: &Config,
    packet: &DecisionPacket,
    state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let daily_limit = config.budget.daily_llm_spend_limit_usd;
    let monthly_limit = config.budget.monthly_llm_spend_limit_usd;
    let daily = state.budget.daily_llm_spend_usd;
    let monthly = state.budget.monthly_llm_spend_usd;

    if daily >= daily_limit {
        return (false, format!("Daily LLM spend exceeded: ${daily:.2} >= ${daily_limit:.2}"));
    }
    if monthly >= monthly_limit {
        return (false, format!("Monthly LLM spend exceeded: ${monthly:.2} >= ${monthly_limit:.2}"));
    }

    let mut evidence = format!(
        "Budget OK: daily ${daily:.2}/${daily_limit:.2}, monthly ${monthly:.2}/${monthly_limit:.2}"
    );
    if packet.estimated_trade_cost_usd > config.budget.cost_per_trade_alert_usd {
        evidence.push_str(&format!(
            " WARNING: trade cost ${:.2} > ${:.2} alert",
            packet.estimated_trade_cost_usd, config.budget.cost_per_trade_alert_usd
        ));
    }
    (true, evidence)
}

/// Gate 15: the intelligence layers agree, or no trade. The paper-mode
/// REJECT override is applied upstream in the debate stage; this gate sees
/// the post-override verdict.
pub(crate) fn gate_15_sanad_audit(
    config: &Config,
    packet: &DecisionPacket,
    _state: &PolicyState,
    _now: DateTime<Utc>,
) -> GateResult {
    let min_trust = config.scoring.min_trust_score;
    let min_confidence = config.scoring.min_confidence_score;

    let trust = packet.sanad.trust_score;
    if trust < min_trust {
        return (false, format!("Trust score too low: {trust:.0} < {min_trust:.0}"));
    }

    let Some(confidence) = packet.trade_confidence_score else {
        return (false, "Trade confidence score missing from decision packet".into());
    };
    if confidence < min_confidence {
        return (false, format!("Confidence score too low: {confidence:.0} < {min_confidence:.0}"));
    }

    match packet.judge.verdict.as_str() {
        "APPROVE" | "REVISE" => {
            let override_tag = if packet.judge.paper_override { " [paper override]" } else { "" };
            (
                true,
                format!(
                    "Trust: {trust:.0}, Confidence: {confidence:.0}, Audit: {}{override_tag}",
                    packet.judge.verdict
                ),
            )
        }
        "REJECT" => (
            false,
            format!("Al-Muhasbi verdict: REJECT (confidence {:.0}%)", packet.judge.confidence),
        ),
        other => (false, format!("Al-Muhasbi verdict invalid or missing: '{other}'")),
    }
}
