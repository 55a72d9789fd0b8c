//! Scripted collaborators for pipeline tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::core::{RecordStatus, StageRecord};
use crate::executor::{StageProcessor, StageRequest, StageResponse};

/// What a scripted stage does when invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum StageScript {
    /// Succeed with a payload.
    Succeed(serde_json::Value),
    /// Report failure with a message.
    Fail(String),
    /// Never answer.
    Hang,
    /// Wait, then behave like the inner script.
    Delay(Duration, Box<StageScript>),
}

impl StageScript {
    /// Succeeds with `payload`.
    #[must_use]
    pub fn succeed(payload: serde_json::Value) -> Self {
        Self::Succeed(payload)
    }

    /// Fails with `message`.
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }

    /// Waits `delay` before behaving like `then`.
    #[must_use]
    pub fn delayed(delay: Duration, then: StageScript) -> Self {
        Self::Delay(delay, Box::new(then))
    }
}

/// Ordered log of stage invocations and record writes, shared between a
/// [`ScriptedProcessor`] and a [`JournalingCheckpointStore`].
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// A stage processor was called.
    Invoked(String),
    /// A record was written.
    Persisted(String, RecordStatus),
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in order.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Stage ids in invocation order.
    #[must_use]
    pub fn invocations(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Invoked(stage_id) => Some(stage_id.clone()),
                JournalEntry::Persisted(..) => None,
            })
            .collect()
    }

    /// Number of record writes.
    #[must_use]
    pub fn persist_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| matches!(entry, JournalEntry::Persisted(..)))
            .count()
    }

    fn push(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }
}

/// A processor whose behaviour is scripted per stage.
///
/// Stages without a script succeed with `{"stage": id, "summary": ...}`.
/// A sequence of scripts is consumed one call at a time; its last script
/// repeats.
#[derive(Debug, Default)]
pub struct ScriptedProcessor {
    scripts: Mutex<HashMap<String, VecDeque<StageScript>>>,
    requests: Mutex<Vec<StageRequest>>,
    journal: Option<Journal>,
}

impl ScriptedProcessor {
    /// Creates a processor where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts one behaviour for a stage.
    #[must_use]
    pub fn script(self, stage_id: impl Into<String>, script: StageScript) -> Self {
        self.script_sequence(stage_id, vec![script])
    }

    /// Scripts successive behaviours for a stage.
    #[must_use]
    pub fn script_sequence(self, stage_id: impl Into<String>, scripts: Vec<StageScript>) -> Self {
        self.set_sequence(stage_id, scripts);
        self
    }

    /// Logs invocations to a journal.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Replaces a stage's script, e.g. between two runs.
    pub fn set_script(&self, stage_id: impl Into<String>, script: StageScript) {
        self.set_sequence(stage_id, vec![script]);
    }

    fn set_sequence(&self, stage_id: impl Into<String>, scripts: Vec<StageScript>) {
        self.scripts.lock().insert(stage_id.into(), scripts.into());
    }

    /// Number of calls for a stage.
    #[must_use]
    pub fn call_count(&self, stage_id: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.stage.id() == stage_id)
            .count()
    }

    /// Number of calls across all stages.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Stage ids in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.stage.id().to_string())
            .collect()
    }

    /// Requests received for a stage, in order.
    #[must_use]
    pub fn requests(&self, stage_id: &str) -> Vec<StageRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.stage.id() == stage_id)
            .cloned()
            .collect()
    }

    /// Forgets recorded calls, keeping the scripts.
    pub fn reset_calls(&self) {
        self.requests.lock().clear();
    }

    fn next_script(&self, request: &StageRequest) -> StageScript {
        let mut scripts = self.scripts.lock();
        let Some(queue) = scripts.get_mut(request.stage.id()) else {
            return StageScript::Succeed(serde_json::json!({
                "stage": request.stage.id(),
                "summary": format!("{} for {}", request.stage.display_name(), request.organization.name),
            }));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(StageScript::Hang)
        } else {
            queue.front().cloned().unwrap_or(StageScript::Hang)
        }
    }
}

#[async_trait]
impl StageProcessor for ScriptedProcessor {
    async fn process(&self, request: &StageRequest) -> StageResponse {
        self.requests.lock().push(request.clone());
        if let Some(journal) = &self.journal {
            journal.push(JournalEntry::Invoked(request.stage.id().to_string()));
        }

        let mut script = self.next_script(request);
        loop {
            match script {
                StageScript::Succeed(payload) => return StageResponse::ok(payload),
                StageScript::Fail(message) => return StageResponse::fail(message),
                StageScript::Hang => return std::future::pending().await,
                StageScript::Delay(delay, then) => {
                    tokio::time::sleep(delay).await;
                    script = *then;
                }
            }
        }
    }
}

/// Wraps a store and journals every successful write.
#[derive(Debug)]
pub struct JournalingCheckpointStore<S> {
    inner: S,
    journal: Journal,
}

impl<S: CheckpointStore> JournalingCheckpointStore<S> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: S, journal: Journal) -> Self {
        Self { inner, journal }
    }

    /// The wrapped store.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: CheckpointStore> CheckpointStore for JournalingCheckpointStore<S> {
    async fn get(&self, organization_id: &str) -> Result<HashMap<String, StageRecord>, CheckpointError> {
        self.inner.get(organization_id).await
    }

    async fn put(&self, record: StageRecord) -> Result<(), CheckpointError> {
        let entry = JournalEntry::Persisted(record.stage_id.clone(), record.status);
        self.inner.put(record).await?;
        self.journal.push(entry);
        Ok(())
    }

    async fn invalidate(&self, organization_id: &str, stage_id: &str) -> Result<bool, CheckpointError> {
        self.inner.invalidate(organization_id, stage_id).await
    }
}
