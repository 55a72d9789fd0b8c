//! Error types for the orgflow pipeline.
//!
//! Only two failure classes surface to callers as run-level errors: a
//! checkpoint read that fails before the resume point can be decided, and a
//! failed synthesis stage. Failures of upstream stages are absorbed by the
//! controller and show up as missing sections in the final artifact.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for orgflow operations.
///
/// Variants carry owned strings so a single outcome can be cloned to every
/// handle attached to the same run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrgflowError {
    /// The stage registry is invalid.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The checkpoint store could not be read at run start.
    #[error("Checkpoint read failed for organization '{organization_id}': {message}")]
    CheckpointRead {
        /// Organization whose records could not be read.
        organization_id: String,
        /// Backend error message.
        message: String,
    },

    /// An out-of-band checkpoint change failed.
    #[error("Checkpoint write failed for organization '{organization_id}': {message}")]
    CheckpointWrite {
        /// Organization whose records could not be changed.
        organization_id: String,
        /// Backend error message.
        message: String,
    },

    /// The terminal synthesis stage failed.
    #[error("Synthesis stage '{stage_id}' failed for organization '{organization_id}': {message}")]
    TerminalStage {
        /// Organization being analysed.
        organization_id: String,
        /// The synthesis stage id.
        stage_id: String,
        /// Failure message from the stage executor.
        message: String,
    },

    /// The run was cancelled before completion.
    #[error("Run for organization '{organization_id}' cancelled at stage '{stage_id}': {reason}")]
    Cancelled {
        /// Organization being analysed.
        organization_id: String,
        /// Stage that was in flight (or next) when cancellation was observed.
        stage_id: String,
        /// Cancellation reason.
        reason: String,
    },

    /// Another process holds the run lease for this organization.
    #[error("A run for organization '{organization_id}' is already active")]
    AlreadyRunning {
        /// Organization whose lease is held.
        organization_id: String,
    },

    /// The run lock backend failed.
    #[error("Run lock error: {0}")]
    Lock(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrgflowError {
    /// Creates a checkpoint read error.
    #[must_use]
    pub fn checkpoint_read(organization_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CheckpointRead {
            organization_id: organization_id.into(),
            message: message.into(),
        }
    }

    /// Creates a terminal stage error.
    #[must_use]
    pub fn terminal_stage(
        organization_id: impl Into<String>,
        stage_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TerminalStage {
            organization_id: organization_id.into(),
            stage_id: stage_id.into(),
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(
        organization_id: impl Into<String>,
        stage_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Cancelled {
            organization_id: organization_id.into(),
            stage_id: stage_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns a stable, machine-readable code for the error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry(_) => "REGISTRY_INVALID",
            Self::CheckpointRead { .. } => "FATAL_CHECKPOINT",
            Self::CheckpointWrite { .. } => "CHECKPOINT_WRITE",
            Self::TerminalStage { .. } => "TERMINAL_STAGE",
            Self::Cancelled { .. } => "CANCELLED",
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::Lock(_) => "LOCK",
            Self::Config(_) => "CONFIG",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns true if a later `start` can pick the run up again.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::CheckpointRead { .. }
                | Self::TerminalStage { .. }
                | Self::Cancelled { .. }
                | Self::AlreadyRunning { .. }
                | Self::Lock(_)
        )
    }

    /// Converts to a JSON representation for event payloads.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// Error raised when a stage registry fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RegistryError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl RegistryError {
    /// Creates a new registry error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}
