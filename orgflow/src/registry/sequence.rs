//! The ordered stage registry and its builder.

use regex::Regex;
use std::collections::HashSet;

use super::StageDefinition;
use crate::errors::RegistryError;

const STAGE_ID_PATTERN: &str = r"^[a-z][a-z0-9_-]*$";

/// An immutable, linear sequence of stages ending in synthesis.
///
/// Stage `i` always receives the outputs of stages `0..i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
}

impl StageRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::default()
    }

    /// All stages in sequence order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Stages before synthesis, in sequence order.
    #[must_use]
    pub fn upstream(&self) -> &[StageDefinition] {
        &self.stages[..self.stages.len() - 1]
    }

    /// The terminal synthesis stage.
    #[must_use]
    pub fn synthesis(&self) -> &StageDefinition {
        // Validated non-empty at build time.
        &self.stages[self.stages.len() - 1]
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn get(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id() == stage_id)
    }

    /// Returns the stage at a position.
    #[must_use]
    pub fn at(&self, position: usize) -> Option<&StageDefinition> {
        self.stages.get(position)
    }

    /// Number of stages, synthesis included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a built registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage ids in sequence order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.stages.iter().map(StageDefinition::id).collect()
    }
}

#[derive(Debug, Clone)]
struct PendingStage {
    id: String,
    display_name: String,
    required_fields: Vec<String>,
}

/// Builder for a validated [`StageRegistry`].
#[derive(Debug, Clone, Default)]
pub struct StageRegistryBuilder {
    stages: Vec<PendingStage>,
    synthesis: Option<PendingStage>,
    last_is_synthesis: bool,
}

impl StageRegistryBuilder {
    /// Appends an upstream stage.
    #[must_use]
    pub fn stage(mut self, id: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.stages.push(PendingStage {
            id: id.into(),
            display_name: display_name.into(),
            required_fields: Vec::new(),
        });
        self.last_is_synthesis = false;
        self
    }

    /// Sets the terminal synthesis stage.
    #[must_use]
    pub fn synthesis(mut self, id: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.synthesis = Some(PendingStage {
            id: id.into(),
            display_name: display_name.into(),
            required_fields: Vec::new(),
        });
        self.last_is_synthesis = true;
        self
    }

    /// Declares required payload fields for the most recently added stage.
    #[must_use]
    pub fn requires(mut self, fields: &[&str]) -> Self {
        let fields: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
        let target = if self.last_is_synthesis {
            self.synthesis.as_mut()
        } else {
            self.stages.last_mut()
        };
        if let Some(stage) = target {
            stage.required_fields = fields;
        }
        self
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the synthesis stage is missing, an id is
    /// malformed, or two stages share an id.
    pub fn build(self) -> Result<StageRegistry, RegistryError> {
        let Some(synthesis) = self.synthesis else {
            return Err(RegistryError::new("registry must end with a synthesis stage"));
        };

        let pattern = Regex::new(STAGE_ID_PATTERN)
            .map_err(|e| RegistryError::new(format!("invalid stage id pattern: {e}")))?;

        let mut seen = HashSet::new();
        let mut stages = Vec::with_capacity(self.stages.len() + 1);
        let total = self.stages.len() + 1;

        for (position, pending) in self.stages.into_iter().chain(std::iter::once(synthesis)).enumerate() {
            if !pattern.is_match(&pending.id) {
                return Err(RegistryError::new(format!(
                    "stage id '{}' must match {STAGE_ID_PATTERN}",
                    pending.id
                ))
                .with_stages(vec![pending.id]));
            }
            if !seen.insert(pending.id.clone()) {
                return Err(RegistryError::new(format!("duplicate stage id '{}'", pending.id))
                    .with_stages(vec![pending.id]));
            }

            let mut definition =
                StageDefinition::new(pending.id, pending.display_name, position, position + 1 == total);
            definition.set_required_fields(pending.required_fields);
            stages.push(definition);
        }

        Ok(StageRegistry { stages })
    }
}
