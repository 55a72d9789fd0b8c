//! Stage definitions and payload contracts.

use serde::{Deserialize, Serialize};

/// Error raised when a stage payload does not satisfy its contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadError {
    /// Error message.
    pub message: String,
    /// Field that caused the error, if applicable.
    pub field: Option<String>,
}

impl PayloadError {
    /// Creates a new payload error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Creates a payload error for a specific field.
    #[must_use]
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref field) = self.field {
            write!(f, "Field '{}': {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for PayloadError {}

/// One statically ordered stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    id: String,
    display_name: String,
    position: usize,
    terminal: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    required_fields: Vec<String>,
}

impl StageDefinition {
    pub(crate) fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        position: usize,
        terminal: bool,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            position,
            terminal,
            required_fields: Vec::new(),
        }
    }

    pub(crate) fn set_required_fields(&mut self, fields: Vec<String>) {
        self.required_fields = fields;
    }

    /// Stable stage id used as the checkpoint key.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Zero-based position in the sequence.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns true for the synthesis stage.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Top-level keys a successful payload must contain.
    #[must_use]
    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    /// Checks a successful payload against the stage contract.
    ///
    /// Stages without required fields accept any document.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), PayloadError> {
        if self.required_fields.is_empty() {
            return Ok(());
        }

        let Some(object) = payload.as_object() else {
            return Err(PayloadError::new(format!(
                "stage '{}' must return a JSON object",
                self.id
            )));
        };

        for field in &self.required_fields {
            if !object.contains_key(field) {
                return Err(PayloadError::for_field(field, "missing required field"));
            }
        }

        Ok(())
    }
}
