//! Deterministic signal scoring.
//!
//! Priority hierarchy: execution feasibility (CEX listing), volume and
//! liquidity, cross-source confirmation, fundamentals, measured momentum,
//! source type. Penalties for infancy, thin books and rug flags. The score
//! floors at zero.

use rust_decimal::Decimal;

use crate::domain::signal::Signal;

/// Tokens tradable on a real order book. Everything else carries DEX
/// execution risk and starts with a penalty.
const CEX_LISTED: &[&str] = &[
    "BONK", "WIF", "PEPE", "FLOKI", "RAY", "ORCA", "SOL", "JUP", "DOGE", "SHIB", "PENGU",
    "TAO", "SUI", "VIRTUAL", "BTC", "ETH", "AAVE", "UNI", "LINK", "ATOM", "HBAR", "XRP",
    "INIT", "ONDO", "MOVE", "LDO", "RPL", "FOGO",
];

pub fn is_cex_listed(token: &str) -> bool {
    CEX_LISTED.contains(&token.to_uppercase().as_str())
}

fn dec(n: u64) -> Decimal {
    Decimal::from(n)
}

pub fn score_signal(signal: &Signal, source_age_minutes: f64, is_cross_source: bool) -> i32 {
    let mut score = 0i32;
    let token = signal.token.to_uppercase();

    // 1. CEX listing
    if is_cex_listed(&token) {
        score += 40;
    } else {
        score -= 10;
    }

    // 2. Volume & liquidity
    let vol = signal.volume_24h.unwrap_or(Decimal::ZERO);
    score += if vol > dec(10_000_000) {
        30
    } else if vol > dec(5_000_000) {
        25
    } else if vol > dec(1_000_000) {
        20
    } else if vol > dec(500_000) {
        10
    } else if vol > dec(100_000) {
        5
    } else {
        -10
    };

    let liq = signal.liquidity_usd.unwrap_or(Decimal::ZERO);
    if liq > dec(500_000) {
        score += 10;
    } else if liq > dec(200_000) {
        score += 5;
    }

    // 3. Cross-source confirmation
    if is_cross_source {
        score += 30;
    }

    // 4. Fundamentals
    if let Some(age_hours) = signal.token_age_hours {
        score += if age_hours < 1.0 {
            -30
        } else if age_hours < 6.0 {
            -15
        } else if age_hours < 24.0 {
            -5
        } else if age_hours > 720.0 {
            15
        } else if age_hours > 168.0 {
            10
        } else {
            0
        };
    }

    if let Some(top10) = signal.top10_holder_pct.filter(|p| *p > 0.0) {
        score += if top10 < 25.0 {
            10
        } else if top10 < 40.0 {
            5
        } else if top10 > 70.0 {
            -25
        } else if top10 > 50.0 {
            -10
        } else {
            0
        };
    }

    let holders = signal.holder_count.unwrap_or(0);
    if holders > 5000 {
        score += 10;
    } else if holders > 1000 {
        score += 5;
    } else if holders > 0 && holders < 100 {
        score -= 15;
    }

    let meaningful_flags = signal
        .rug_flags
        .iter()
        .any(|f| !f.contains("not_checked") && !f.contains("not_enriched"));
    if meaningful_flags {
        score -= 25;
    }

    if signal.smart_money_signal {
        score += 20;
    }

    // 5. Momentum: measured beats insane
    let momentum = signal
        .price_change_1h_pct
        .filter(|p| *p != 0.0)
        .unwrap_or_else(|| signal.price_change_24h_pct.unwrap_or(0.0) / 4.0);
    score += if momentum > 1000.0 {
        -25
    } else if momentum > 100.0 {
        -10
    } else if momentum > 50.0 {
        5
    } else if momentum > 15.0 {
        10
    } else if momentum >= 5.0 {
        15
    } else {
        0
    };

    if let Some(bsr) = signal.buy_sell_ratio {
        if bsr > 2.0 {
            score += 10;
        } else if bsr > 1.5 {
            score += 5;
        }
    }

    // 6. Source type
    let source = signal.source_primary.to_lowercase();
    let stype = signal.signal_type.as_str();
    if source.contains("birdeye") && matches!(stype, "MEME_GAINER" | "TRENDING") {
        score += 10;
    } else if stype == "BOOSTED_TOKEN" {
        score += 5;
    } else if matches!(stype, "TRENDING_GAINER" | "MAJOR_GAINER") {
        score += 10;
    } else if stype == "COMMUNITY_TAKEOVER" {
        score += 5;
    }

    // Signal recency
    if source_age_minutes < 10.0 {
        score += 5;
    } else if source_age_minutes < 20.0 {
        score += 3;
    }

    score.max(0)
}
