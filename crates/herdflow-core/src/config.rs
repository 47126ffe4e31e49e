//! Engine configuration
//!
//! Defaults can be overridden from `HERDFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::action::TargetModule;
use crate::CoreError;

/// Runtime configuration for the workflow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delivery attempts before a module update is marked FAILED
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in seconds, doubled on each further attempt
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// Upper bound for the retry delay in seconds
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// Timeout for a single call to an external module
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Re-read attempts when a transition loses a compare-and-swap
    #[serde(default = "default_max_transition_retries")]
    pub max_transition_retries: u32,

    /// Tick of the background worker
    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,

    /// Maximum module updates delivered per dispatch pass
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,

    /// Module that receives escalation notifications
    #[serde(default = "default_escalation_module")]
    pub escalation_module: TargetModule,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    30
}

fn default_retry_max_delay_secs() -> u64 {
    3600
}

fn default_dispatch_timeout_ms() -> u64 {
    10_000
}

fn default_max_transition_retries() -> u32 {
    3
}

fn default_worker_interval_ms() -> u64 {
    1000
}

fn default_dispatch_batch_size() -> usize {
    100
}

fn default_escalation_module() -> TargetModule {
    TargetModule::Internal
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            max_transition_retries: default_max_transition_retries(),
            worker_interval_ms: default_worker_interval_ms(),
            dispatch_batch_size: default_dispatch_batch_size(),
            escalation_module: default_escalation_module(),
        }
    }
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", key, raw),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();

        override_from_env("HERDFLOW_MAX_ATTEMPTS", &mut config.max_attempts);
        override_from_env("HERDFLOW_RETRY_BASE_DELAY_SECS", &mut config.retry_base_delay_secs);
        override_from_env("HERDFLOW_RETRY_MAX_DELAY_SECS", &mut config.retry_max_delay_secs);
        override_from_env("HERDFLOW_DISPATCH_TIMEOUT_MS", &mut config.dispatch_timeout_ms);
        override_from_env(
            "HERDFLOW_MAX_TRANSITION_RETRIES",
            &mut config.max_transition_retries,
        );
        override_from_env("HERDFLOW_WORKER_INTERVAL_MS", &mut config.worker_interval_ms);
        override_from_env("HERDFLOW_DISPATCH_BATCH_SIZE", &mut config.dispatch_batch_size);

        if let Ok(module) = env::var("HERDFLOW_ESCALATION_MODULE") {
            match serde_json::from_value::<TargetModule>(serde_json::Value::String(
                module.to_uppercase(),
            )) {
                Ok(parsed) => config.escalation_module = parsed,
                Err(_) => warn!("Invalid HERDFLOW_ESCALATION_MODULE value: {}", module),
            }
        }

        config.validate()?;
        info!("Loaded engine configuration");
        Ok(config)
    }

    /// Reject combinations the engine cannot operate with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::ConfigurationError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            return Err(CoreError::ConfigurationError(format!(
                "retry base delay {}s exceeds the cap {}s",
                self.retry_base_delay_secs, self.retry_max_delay_secs
            )));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "dispatch_timeout_ms must be positive".to_string(),
            ));
        }
        if self.dispatch_batch_size == 0 {
            return Err(CoreError::ConfigurationError(
                "dispatch_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before the next delivery attempt after `attempts` failures
    pub fn backoff(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .retry_base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_secs);
        chrono::Duration::seconds(delay as i64)
    }

    /// Timeout applied to each external module call
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Tick of the background worker
    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }
}
