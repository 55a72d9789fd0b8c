//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::retry::RetryConfig;
use crate::errors::OrgflowError;

const ENV_STAGE_TIMEOUT_MS: &str = "ORGFLOW_STAGE_TIMEOUT_MS";
const ENV_STAGE_MAX_ATTEMPTS: &str = "ORGFLOW_STAGE_MAX_ATTEMPTS";
const ENV_STAGE_RETRY_BASE_MS: &str = "ORGFLOW_STAGE_RETRY_BASE_MS";
const ENV_CHECKPOINT_MAX_ATTEMPTS: &str = "ORGFLOW_CHECKPOINT_MAX_ATTEMPTS";
const ENV_RESUME_POLICY: &str = "ORGFLOW_RESUME_POLICY";

/// How a run treats an already completed synthesis record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// A completed synthesis record is returned as-is, whatever the state of
    /// the upstream records.
    CacheFirst,
    /// The cached artifact is returned only when every record is completed
    /// and fresh; otherwise failed and stale stages are retried.
    #[default]
    RetryFailed,
}

impl fmt::Display for ResumePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheFirst => write!(f, "cache_first"),
            Self::RetryFailed => write!(f, "retry_failed"),
        }
    }
}

impl FromStr for ResumePolicy {
    type Err = OrgflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cache_first" => Ok(Self::CacheFirst),
            "retry_failed" => Ok(Self::RetryFailed),
            other => Err(OrgflowError::Config(format!(
                "unknown resume policy '{other}' (expected cache_first or retry_failed)"
            ))),
        }
    }
}

/// Runtime settings for a [`PipelineController`](super::PipelineController).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bound on each stage processor attempt.
    pub stage_timeout_ms: u64,
    /// Retry policy for stage processor attempts.
    pub stage_retry: RetryConfig,
    /// Retry policy for checkpoint writes.
    pub checkpoint_retry: RetryConfig,
    /// Cache behavior when a synthesis record exists.
    pub resume_policy: ResumePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 120_000,
            stage_retry: RetryConfig::for_stages(),
            checkpoint_retry: RetryConfig::for_checkpoints(),
            resume_policy: ResumePolicy::RetryFailed,
        }
    }
}

impl PipelineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt stage timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the stage retry policy.
    #[must_use]
    pub fn with_stage_retry(mut self, retry: RetryConfig) -> Self {
        self.stage_retry = retry;
        self
    }

    /// Sets the checkpoint write retry policy.
    #[must_use]
    pub fn with_checkpoint_retry(mut self, retry: RetryConfig) -> Self {
        self.checkpoint_retry = retry;
        self
    }

    /// Sets the resume policy.
    #[must_use]
    pub fn with_resume_policy(mut self, policy: ResumePolicy) -> Self {
        self.resume_policy = policy;
        self
    }

    /// Per-attempt stage timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, OrgflowError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OrgflowError::Config(format!("invalid pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from `ORGFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, OrgflowError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from a variable lookup, starting from defaults.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, OrgflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_STAGE_TIMEOUT_MS) {
            config.stage_timeout_ms = parse_number(ENV_STAGE_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_STAGE_MAX_ATTEMPTS) {
            config.stage_retry.max_attempts = parse_number(ENV_STAGE_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_STAGE_RETRY_BASE_MS) {
            config.stage_retry.base_delay_ms = parse_number(ENV_STAGE_RETRY_BASE_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_CHECKPOINT_MAX_ATTEMPTS) {
            config.checkpoint_retry.max_attempts =
                parse_number(ENV_CHECKPOINT_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_RESUME_POLICY) {
            config.resume_policy = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), OrgflowError> {
        if self.stage_timeout_ms == 0 {
            return Err(OrgflowError::Config(
                "stage_timeout_ms must be greater than zero".to_string(),
            ));
        }
        for (name, retry) in [
            ("stage_retry", &self.stage_retry),
            ("checkpoint_retry", &self.checkpoint_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(OrgflowError::Config(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
            if retry.max_delay_ms < retry.base_delay_ms {
                return Err(OrgflowError::Config(format!(
                    "{name}.max_delay_ms must not be below base_delay_ms"
                )));
            }
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, OrgflowError> {
    value
        .trim()
        .parse()
        .map_err(|_| OrgflowError::Config(format!("{key} must be a non-negative integer, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.stage_timeout(), Duration::from_secs(120));
        assert_eq!(config.stage_retry.max_attempts, 2);
        assert_eq!(config.stage_retry.base_delay_ms, 500);
        assert_eq!(config.checkpoint_retry.max_attempts, 3);
        assert_eq!(config.resume_policy, ResumePolicy::RetryFailed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = PipelineConfig::from_json_str(
            r#"{"stage_timeout_ms": 5000, "resume_policy": "cache_first"}"#,
        )
        .unwrap();

        assert_eq!(config.stage_timeout_ms, 5000);
        assert_eq!(config.resume_policy, ResumePolicy::CacheFirst);
        assert_eq!(config.stage_retry, PipelineConfig::default().stage_retry);
    }

    #[test]
    fn test_from_json_rejects_zero_timeout() {
        let err = PipelineConfig::from_json_str(r#"{"stage_timeout_ms": 0}"#).unwrap_err();
        assert_eq!(err.kind(), "CONFIG");
    }

    #[test]
    fn test_from_env_overrides() {
        let config = PipelineConfig::from_env_with(lookup(&[
            ("ORGFLOW_STAGE_TIMEOUT_MS", "3000"),
            ("ORGFLOW_STAGE_MAX_ATTEMPTS", "4"),
            ("ORGFLOW_RESUME_POLICY", "cache-first"),
        ]))
        .unwrap();

        assert_eq!(config.stage_timeout_ms, 3000);
        assert_eq!(config.stage_retry.max_attempts, 4);
        assert_eq!(config.resume_policy, ResumePolicy::CacheFirst);
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let err = PipelineConfig::from_env_with(lookup(&[("ORGFLOW_STAGE_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("ORGFLOW_STAGE_MAX_ATTEMPTS"));

        let err = PipelineConfig::from_env_with(lookup(&[("ORGFLOW_RESUME_POLICY", "always")]))
            .unwrap_err();
        assert!(err.to_string().contains("always"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = PipelineConfig::default();
        config.checkpoint_retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
