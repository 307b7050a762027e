use thiserror::Error;

/// Errors surfaced by the state store.
///
/// Writes run with a 250ms busy timeout and fail with `Busy` instead of
/// blocking; the caller abandons the cycle and retries on the next run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database busy beyond {timeout_ms}ms timeout")]
    Busy { timeout_ms: u64 },

    #[error("guarded update matched no row: {entity} {id} (expected status {expected})")]
    RacedTransition {
        entity: &'static str,
        id: String,
        expected: &'static str,
    },

    #[error("row not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors related to order placement and lifecycle.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid order: {reason}")]
    Invalid { reason: String },

    #[error("invalid state transition: {from} -> {to} for {client_order_id}")]
    InvalidTransition {
        from: String,
        to: String,
        client_order_id: String,
    },

    #[error("order rejected by exchange: {reason}")]
    Rejected { reason: String },

    #[error("submission failed after {attempts} attempts: {last_error}")]
    SubmitExhausted { attempts: u32, last_error: String },

    #[error("kill switch active — live order submission refused")]
    KillSwitchActive,
}

/// Errors from the LLM oracle boundary.
///
/// Parse faults carry a stable error code so the cold-path task row can
/// record `ERR_JUDGE_PARSE` / `ERR_JSON_PARSE` verbatim.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle call failed: {0}")]
    Transport(String),

    #[error("oracle call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("oracle returned empty response for stage {stage}")]
    Empty { stage: String },

    #[error("{code}: {detail}")]
    Parse { code: &'static str, detail: String },
}

impl OracleError {
    pub fn error_code(&self) -> &'static str {
        match self {
            OracleError::Parse { code, .. } => code,
            _ => "ERR_WORKER",
        }
    }
}

/// Errors from feed directories and cached state files.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("no signal files in {directory}")]
    NoFiles { directory: String },

    #[error("signal file stale: {age_minutes:.0}min old (max {max_minutes})")]
    Stale { age_minutes: f64, max_minutes: u64 },

    #[error("malformed feed payload: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_error_formats_timeout() {
        let err = StoreError::Busy { timeout_ms: 250 };
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn parse_error_exposes_code() {
        let err = OracleError::Parse {
            code: "ERR_JUDGE_PARSE",
            detail: "missing verdict".into(),
        };
        assert_eq!(err.error_code(), "ERR_JUDGE_PARSE");
        assert!(err.to_string().starts_with("ERR_JUDGE_PARSE"));
    }

    #[test]
    fn transport_error_maps_to_worker_code() {
        let err = OracleError::Transport("connection reset".into());
        assert_eq!(err.error_code(), "ERR_WORKER");
    }
}
