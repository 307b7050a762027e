//! Runtime dependency container.
//!
//! Workers receive everything they touch (configuration, store handles,
//! flags, breaker pool, oracle/exchange/notifier ports) through one context
//! built at process entry. No process-wide singletons.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::domain::errors::OracleError;
use crate::domain::ports::{ExchangeClient, LlmOracle, Notifier, OracleRequest};
use crate::infrastructure::core::circuit_breaker::CircuitBreakerPool;
use crate::infrastructure::flags::{FlagFile, KillSwitch};
use crate::infrastructure::persistence::StateStore;

pub struct RuntimeContext {
    pub config: Config,
    pub store: StateStore,
    pub kill_switch: KillSwitch,
    pub pause_flag: FlagFile,
    pub fast_path_flag: FlagFile,
    pub breakers: Mutex<CircuitBreakerPool>,
    pub oracle: Arc<dyn LlmOracle>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub notifier: Arc<dyn Notifier>,
}

impl RuntimeContext {
    pub fn breaker_state_path(&self) -> std::path::PathBuf {
        self.config.state_dir().join("circuit_breakers.json")
    }

    /// Oracle call guarded by the gateway circuit breaker. An open breaker
    /// short-circuits without touching the endpoint; outcomes feed the
    /// shared breaker snapshot the gates read.
    pub async fn oracle_call(&self, request: OracleRequest) -> Result<String, OracleError> {
        const COMPONENT: &str = "llm_gateway";

        {
            let mut breakers = self.breakers.lock().await;
            if !breakers.allow_request(COMPONENT, Utc::now()) {
                return Err(OracleError::Transport("llm_gateway circuit breaker is open".into()));
            }
        }

        match self.oracle.complete(request).await {
            Ok(raw) => {
                self.breakers.lock().await.record_success(COMPONENT, Utc::now());
                Ok(raw)
            }
            Err(e) => {
                self.breakers
                    .lock()
                    .await
                    .record_failure(COMPONENT, &e.to_string(), Utc::now());
                Err(e)
            }
        }
    }
}
