//! Bounded invocation of a stage processor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use super::{PriorOutputs, StageProcessor, StageRequest};
use crate::cancellation::CancellationToken;
use crate::core::Organization;
use crate::pipeline::RetryConfig;
use crate::registry::StageDefinition;

/// Why a stage invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The processor did not answer within the stage timeout.
    Timeout,
    /// The processor reported failure.
    Processor,
    /// The processor succeeded but the payload broke the stage contract.
    InvalidPayload,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Processor => write!(f, "processor"),
            Self::InvalidPayload => write!(f, "invalid_payload"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed stage invocation, after retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage '{stage_id}' failed ({kind}) after {attempts} attempt(s): {message}")]
pub struct StageFailure {
    /// Stage that failed.
    pub stage_id: String,
    /// Failure class of the last attempt.
    pub kind: FailureKind,
    /// Message of the last attempt.
    pub message: String,
    /// Attempts made.
    pub attempts: u32,
    /// Elapsed time across attempts.
    pub duration_ms: u64,
}

impl StageFailure {
    /// Returns true if the failure came from cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

/// A successful stage invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSuccess {
    /// Validated payload.
    pub payload: serde_json::Value,
    /// Attempts made.
    pub attempts: u32,
    /// Elapsed time across attempts.
    pub duration_ms: u64,
}

/// Wraps a [`StageProcessor`] with a per-attempt timeout, retry and
/// cancellation.
#[derive(Clone)]
pub struct StageExecutor {
    processor: Arc<dyn StageProcessor>,
    timeout: Duration,
    retry: RetryConfig,
}

impl fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecutor")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(processor: Arc<dyn StageProcessor>, timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            processor,
            timeout,
            retry,
        }
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executes one stage with the outputs of every completed upstream stage.
    pub async fn execute(
        &self,
        stage: &StageDefinition,
        organization: &Organization,
        prior_outputs: PriorOutputs,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StageSuccess, StageFailure> {
        let started = Instant::now();
        let mut request = StageRequest {
            stage: stage.clone(),
            organization: organization.clone(),
            prior_stage_outputs: prior_outputs,
            run_id: run_id.to_string(),
            attempt: 0,
        };
        let failure = |kind: FailureKind, message: String, attempts: u32| StageFailure {
            stage_id: stage.id().to_string(),
            kind,
            message,
            attempts,
            duration_ms: elapsed_ms(started),
        };
        let cancelled = |attempts: u32| {
            failure(
                FailureKind::Cancelled,
                format!("cancelled: {}", cancel.reason().unwrap_or_default()),
                attempts,
            )
        };

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(request.attempt));
            }
            request.attempt += 1;

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(request.attempt)),
                outcome = self.attempt(&request) => outcome,
            };

            match outcome {
                Ok(payload) => {
                    debug!(stage_id = stage.id(), attempt = request.attempt, "Stage attempt succeeded");
                    return Ok(StageSuccess {
                        payload,
                        attempts: request.attempt,
                        duration_ms: elapsed_ms(started),
                    });
                }
                Err((kind, message)) if self.retry.allows_another(request.attempt) => {
                    let delay = self.retry.delay_for(request.attempt - 1);
                    warn!(
                        stage_id = stage.id(),
                        attempt = request.attempt,
                        %kind,
                        error = %message,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Stage attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(cancelled(request.attempt)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err((kind, message)) => return Err(failure(kind, message, request.attempt)),
            }
        }
    }

    async fn attempt(&self, request: &StageRequest) -> Result<serde_json::Value, (FailureKind, String)> {
        let stage = &request.stage;
        let Ok(response) = tokio::time::timeout(self.timeout, self.processor.process(request)).await
        else {
            return Err((
                FailureKind::Timeout,
                format!(
                    "stage '{}' timed out after {} ms",
                    stage.id(),
                    self.timeout.as_millis()
                ),
            ));
        };

        if !response.success {
            return Err((
                FailureKind::Processor,
                response
                    .error
                    .unwrap_or_else(|| "stage processor reported failure".to_string()),
            ));
        }

        let payload = response.data.unwrap_or(serde_json::Value::Null);
        stage
            .validate_payload(&payload)
            .map_err(|e| (FailureKind::InvalidPayload, e.to_string()))?;
        Ok(payload)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
