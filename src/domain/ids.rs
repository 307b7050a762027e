//! Canonical id generation.
//!
//! Ids are content fingerprints: full 64-char hex SHA-256 over stable fields
//! only. Computed metrics (rugcheck score, volume) are excluded because they
//! change across enrichment cycles and would break idempotency.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::domain::signal::Signal;

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize free text for fingerprinting: lowercase, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic signal id.
///
/// Priority: source event id when present, otherwise a content fingerprint
/// over chain, token, source, type and normalized thesis. A sparse thesis
/// (< 10 chars) folds in a 10-minute time bucket so near-empty signals from
/// the same source do not all collapse to one id.
pub fn make_signal_id(signal: &Signal) -> String {
    if let Some(event_id) = signal.source_event_id.as_deref().filter(|s| !s.is_empty()) {
        return sha256_hex(&format!("event|{event_id}"));
    }

    let thesis = normalize_text(&signal.thesis);
    let mut composite = format!(
        "{}|{}|{}|{}|{}",
        signal.chain, signal.token_address, signal.source_primary, signal.signal_type, thesis
    );

    if thesis.len() < 10 {
        let bucket = time_bucket_10min(signal.timestamp);
        composite.push('|');
        composite.push_str(&bucket.to_rfc3339());
    }

    sha256_hex(&composite)
}

/// decision_id = sha256(signal_id | policy_version)
pub fn make_decision_id(signal_id: &str, policy_version: &str) -> String {
    sha256_hex(&format!("{signal_id}|{policy_version}"))
}

/// position_id = sha256(decision_id | execution_ordinal)
///
/// The ordinal is a compatibility hook; the store enforces one position per
/// decision, so callers always pass 1 today.
pub fn make_position_id(decision_id: &str, execution_ordinal: u32) -> String {
    sha256_hex(&format!("{decision_id}|{execution_ordinal}"))
}

fn time_bucket_10min(ts: DateTime<Utc>) -> DateTime<Utc> {
    let bucket = (ts.timestamp() / 600) * 600;
    Utc.timestamp_opt(bucket, 0).single().unwrap_or(ts)
}
