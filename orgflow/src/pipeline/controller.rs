//! The pipeline controller.
//!
//! A run for one organization moves `Idle → Checking → Running → Complete`.
//! Each run is a spawned task: it takes the organization's lease, reads the
//! stored records once, decides where to resume and then drives the
//! remaining stages strictly one after another, writing each stage's record
//! before the next stage is invoked.
//!
//! Upstream failures are written as failed records and the run carries on;
//! only a failed checkpoint read or a failed synthesis stage aborts it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::config::PipelineConfig;
use super::handle::{PipelineHandle, RunChannels, RunOutcome, RunReport};
use super::lock::{RunLease, RunLock};
use super::resume::{self, ResumeDecision};
use super::retry::with_retry_if;
use super::state::{PipelineRun, RunState};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore};
use crate::core::{
    Organization, RecordMetadata, RunStatus, StageRecord, StageStatus, SynthesisArtifact,
};
use crate::errors::{OrgflowError, RegistryError};
use crate::events::{EventKind, EventSink, NoOpEventSink, PipelineEvent};
use crate::executor::{StageExecutor, StageProcessor};
use crate::registry::StageRegistry;

struct Shared {
    registry: StageRegistry,
    store: Arc<dyn CheckpointStore>,
    executor: StageExecutor,
    lock: Option<Arc<dyn RunLock>>,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
    active: DashMap<String, RunChannels>,
}

/// Drives per-organization analysis runs.
///
/// Cheap to clone; clones share the same active-run table.
#[derive(Clone)]
pub struct PipelineController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("stages", &self.shared.registry.ids())
            .field("config", &self.shared.config)
            .field("active_runs", &self.shared.active.len())
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Starts building a controller for a registry.
    #[must_use]
    pub fn builder(registry: StageRegistry) -> PipelineControllerBuilder {
        PipelineControllerBuilder::new(registry)
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.shared.registry
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Starts a run for an organization, or attaches to the one already
    /// active in this controller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, organization: Organization) -> PipelineHandle {
        enum Start {
            Attach(RunChannels),
            Spawn(RunTask, watch::Sender<Option<RunOutcome>>, RunChannels),
        }

        let organization_id = organization.id.clone();
        let start = match self.shared.active.entry(organization_id.clone()) {
            Entry::Occupied(active) => Start::Attach(active.get().clone()),
            Entry::Vacant(slot) => {
                let run_id = Uuid::now_v7().to_string();
                let cancel = Arc::new(CancellationToken::new());
                let (state_tx, state_rx) = watch::channel(RunState::new(
                    &self.shared.registry,
                    &organization_id,
                    &run_id,
                ));
                let (outcome_tx, outcome_rx) = watch::channel(None);
                let channels = RunChannels {
                    run_id: run_id.clone(),
                    cancel: Arc::clone(&cancel),
                    state: state_rx,
                    outcome: outcome_rx,
                };
                slot.insert(channels.clone());

                let task = RunTask {
                    shared: Arc::clone(&self.shared),
                    organization,
                    run_id,
                    cancel,
                    state: state_tx,
                };
                Start::Spawn(task, outcome_tx, channels)
            }
        };

        match start {
            Start::Attach(channels) => {
                info!(
                    organization_id = %organization_id,
                    run_id = %channels.run_id,
                    "Run already active, attaching"
                );
                self.shared.events.try_emit(&PipelineEvent::new(
                    EventKind::PipelineAlreadyRunning,
                    &organization_id,
                    &channels.run_id,
                ));
                PipelineHandle::new(organization_id, channels, true)
            }
            Start::Spawn(task, outcome_tx, channels) => {
                let span = info_span!(
                    "pipeline_run",
                    organization_id = %organization_id,
                    run_id = %channels.run_id
                );
                let guard = ActiveRunGuard {
                    shared: Arc::clone(&self.shared),
                    organization_id: organization_id.clone(),
                    run_id: channels.run_id.clone(),
                };
                tokio::spawn(
                    async move {
                        let outcome = task.run().await;
                        drop(guard);
                        outcome_tx.send_replace(Some(outcome));
                    }
                    .instrument(span),
                );
                PipelineHandle::new(organization_id, channels, false)
            }
        }
    }

    /// Starts (or attaches to) a run and waits for its outcome.
    pub async fn run(&self, organization: Organization) -> Result<RunReport, OrgflowError> {
        self.start(organization).wait().await
    }

    /// Requests cancellation of an organization's active run.
    ///
    /// Returns false if no run is active or it was already cancelled.
    pub fn cancel(&self, organization_id: &str, reason: impl Into<String>) -> bool {
        let Some(channels) = self.active_channels(organization_id) else {
            return false;
        };
        channels.cancel.cancel(reason)
    }

    /// Returns true while a run for the organization is active here.
    #[must_use]
    pub fn is_running(&self, organization_id: &str) -> bool {
        self.shared.active.contains_key(organization_id)
    }

    /// Latest state of an organization's active run.
    #[must_use]
    pub fn state(&self, organization_id: &str) -> Option<RunState> {
        self.active_channels(organization_id)
            .map(|channels| channels.state.borrow().clone())
    }

    /// Organizations with an active run, sorted.
    #[must_use]
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.active.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Derives an organization's run from its stored records.
    pub async fn load_run(&self, organization_id: &str) -> Result<PipelineRun, OrgflowError> {
        let records = self
            .shared
            .store
            .get(organization_id)
            .await
            .map_err(|e| OrgflowError::checkpoint_read(organization_id, e.to_string()))?;
        let mut run = PipelineRun::derive(&self.shared.registry, organization_id, records);
        if let Some(state) = self.state(organization_id) {
            run.status = state.status;
        }
        Ok(run)
    }

    /// Removes one stored record so the next run re-executes that stage.
    ///
    /// Refused while a run for the organization is active, here or, with a
    /// [`RunLock`] configured, on another instance.
    pub async fn invalidate(&self, organization_id: &str, stage_id: &str) -> Result<bool, OrgflowError> {
        if self.shared.registry.get(stage_id).is_none() {
            return Err(RegistryError::new(format!("Unknown stage '{stage_id}'"))
                .with_stages(vec![stage_id.to_string()])
                .into());
        }
        if self.is_running(organization_id) {
            return Err(OrgflowError::AlreadyRunning {
                organization_id: organization_id.to_string(),
            });
        }

        let _lease = match &self.shared.lock {
            Some(lock) => {
                let owner = format!("invalidate-{}", Uuid::now_v7());
                let lease = lock
                    .try_acquire(organization_id, &owner)
                    .await
                    .map_err(|e| OrgflowError::Lock(e.to_string()))?;
                if lease.is_none() {
                    warn!(organization_id, stage_id, "Invalidate refused, run lease held elsewhere");
                    return Err(OrgflowError::AlreadyRunning {
                        organization_id: organization_id.to_string(),
                    });
                }
                lease
            }
            None => None,
        };

        let removed = self
            .shared
            .store
            .invalidate(organization_id, stage_id)
            .await
            .map_err(|e| OrgflowError::CheckpointWrite {
                organization_id: organization_id.to_string(),
                message: e.to_string(),
            })?;
        info!(organization_id, stage_id, removed, "Stage record invalidated");
        Ok(removed)
    }

    fn active_channels(&self, organization_id: &str) -> Option<RunChannels> {
        self.shared
            .active
            .get(organization_id)
            .map(|entry| entry.value().clone())
    }
}

/// Removes the active-run entry when the run task ends, including on panic.
struct ActiveRunGuard {
    shared: Arc<Shared>,
    organization_id: String,
    run_id: String,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.shared
            .active
            .remove_if(&self.organization_id, |_, channels| channels.run_id == self.run_id);
    }
}

struct RunTask {
    shared: Arc<Shared>,
    organization: Organization,
    run_id: String,
    cancel: Arc<CancellationToken>,
    state: watch::Sender<RunState>,
}

impl RunTask {
    async fn run(self) -> RunOutcome {
        let outcome = self.drive().await;

        match &outcome {
            Ok(_) | Err(OrgflowError::AlreadyRunning { .. }) => {}
            Err(OrgflowError::Cancelled { stage_id, reason, .. }) => {
                warn!(stage_id = %stage_id, reason = %reason, "Run cancelled");
                self.stop();
                self.emit(
                    EventKind::PipelineCancelled,
                    Some(stage_id.as_str()),
                    json!({ "reason": reason }),
                );
            }
            Err(err) => {
                error!(error = %err, kind = err.kind(), "Run failed");
                self.stop();
                self.emit(EventKind::PipelineFailed, None, err.to_json());
            }
        }

        outcome
    }

    async fn drive(&self) -> RunOutcome {
        let registry = &self.shared.registry;
        let organization_id = self.organization.id.as_str();

        let _lease = self.acquire_lease().await?;

        self.state.send_modify(|s| s.status = RunStatus::Checking);
        self.emit(EventKind::PipelineChecking, None, serde_json::Value::Null);
        let mut records = self.shared.store.get(organization_id).await.map_err(|e| {
            error!(error = %e, "Checkpoint read failed");
            OrgflowError::checkpoint_read(organization_id, e.to_string())
        })?;

        let start = match resume::plan(registry, &records, self.shared.config.resume_policy) {
            ResumeDecision::Cached => return self.cached(records),
            ResumeDecision::ResumeAt(index) => index,
        };

        info!(
            resume_index = start,
            stage_id = registry.at(start).map_or("", |s| s.id()),
            stored_records = records.len(),
            "Resuming run"
        );
        self.state.send_modify(|s| {
            s.status = RunStatus::Running;
            s.resume_index = Some(start);
            s.apply_records(&records, start);
        });
        self.emit(
            EventKind::PipelineResumed,
            registry.at(start).map(|s| s.id()),
            json!({ "resume_index": start }),
        );

        let mut executed = Vec::new();
        for stage in registry.stages().iter().skip(start) {
            let index = stage.position();

            if resume::is_fresh(registry, &records, stage) {
                debug!(stage_id = stage.id(), "Reusing completed record");
                self.state.send_modify(|s| s.set_stage(index, StageStatus::Completed));
                self.emit(EventKind::StageReused, Some(stage.id()), serde_json::Value::Null);
                continue;
            }

            let prior = resume::prior_outputs(registry, &records, index);
            let input_hash = resume::input_hash(&prior);
            self.state.send_modify(|s| {
                s.current_index = Some(index);
                s.set_stage(index, StageStatus::Running);
            });
            self.emit(
                EventKind::StageStarted,
                Some(stage.id()),
                json!({ "position": index, "prior_stages": prior.stage_ids() }),
            );

            let outcome = self
                .shared
                .executor
                .execute(stage, &self.organization, prior, &self.run_id, &self.cancel)
                .await;

            let mut metadata = RecordMetadata {
                run_id: Some(self.run_id.clone()),
                input_hash: Some(input_hash),
                ..RecordMetadata::default()
            };

            match outcome {
                Ok(success) => {
                    metadata.attempts = success.attempts;
                    metadata.duration_ms = Some(success.duration_ms);
                    let record = StageRecord::completed(organization_id, stage.id(), success.payload)
                        .with_metadata(metadata);
                    self.persist(&record).await;
                    records.insert(stage.id().to_string(), record);
                    executed.push(stage.id().to_string());

                    info!(
                        stage_id = stage.id(),
                        attempts = success.attempts,
                        duration_ms = success.duration_ms,
                        "Stage completed"
                    );
                    self.state.send_modify(|s| s.set_stage(index, StageStatus::Completed));
                    self.emit(
                        EventKind::StageCompleted,
                        Some(stage.id()),
                        json!({ "attempts": success.attempts, "duration_ms": success.duration_ms }),
                    );
                }
                Err(failure) => {
                    metadata.attempts = failure.attempts;
                    metadata.duration_ms = Some(failure.duration_ms);
                    let record = StageRecord::failed(organization_id, stage.id(), failure.message.clone())
                        .with_metadata(metadata);
                    self.persist(&record).await;
                    records.insert(stage.id().to_string(), record);
                    self.state.send_modify(|s| s.set_stage(index, StageStatus::Failed));

                    if failure.is_cancelled() {
                        return Err(OrgflowError::cancelled(
                            organization_id,
                            stage.id(),
                            self.cancel.reason().unwrap_or_default(),
                        ));
                    }

                    executed.push(stage.id().to_string());
                    warn!(
                        stage_id = stage.id(),
                        kind = %failure.kind,
                        attempts = failure.attempts,
                        error = %failure.message,
                        "Stage failed"
                    );
                    self.emit(
                        EventKind::StageFailed,
                        Some(stage.id()),
                        json!({
                            "kind": failure.kind,
                            "error": failure.message,
                            "attempts": failure.attempts,
                            "terminal": stage.is_terminal(),
                        }),
                    );

                    if stage.is_terminal() {
                        return Err(OrgflowError::terminal_stage(
                            organization_id,
                            stage.id(),
                            failure.message,
                        ));
                    }
                }
            }
        }

        let analysis = self.assemble(&records)?;
        info!(
            executed = executed.len(),
            missing_sections = analysis.missing_sections.len(),
            "Run complete"
        );
        self.state.send_modify(|s| {
            s.status = RunStatus::Complete;
            s.current_index = None;
        });
        self.emit(
            EventKind::PipelineCompleted,
            None,
            json!({
                "executed_stages": executed,
                "missing_sections": analysis.missing_sections,
            }),
        );
        Ok(self.report(analysis, records, false, executed))
    }

    async fn acquire_lease(&self) -> Result<Option<RunLease>, OrgflowError> {
        let Some(lock) = &self.shared.lock else {
            return Ok(None);
        };
        let organization_id = self.organization.id.as_str();

        match lock.try_acquire(organization_id, &self.run_id).await {
            Ok(Some(lease)) => {
                debug!("Run lease acquired");
                Ok(Some(lease))
            }
            Ok(None) => {
                warn!("Run lease held by another instance");
                self.emit(EventKind::PipelineAlreadyRunning, None, serde_json::Value::Null);
                Err(OrgflowError::AlreadyRunning {
                    organization_id: organization_id.to_string(),
                })
            }
            Err(e) => Err(OrgflowError::Lock(e.to_string())),
        }
    }

    fn cached(&self, records: HashMap<String, StageRecord>) -> RunOutcome {
        let analysis = self.assemble(&records)?;
        info!(
            missing_sections = analysis.missing_sections.len(),
            "Returning stored artifact"
        );
        let stage_count = self.shared.registry.len();
        self.state.send_modify(|s| {
            s.apply_records(&records, stage_count);
            s.status = RunStatus::Complete;
            s.from_cache = true;
        });
        self.emit(
            EventKind::PipelineCacheHit,
            None,
            json!({ "missing_sections": analysis.missing_sections }),
        );
        Ok(self.report(analysis, records, true, Vec::new()))
    }

    fn assemble(&self, records: &HashMap<String, StageRecord>) -> Result<SynthesisArtifact, OrgflowError> {
        SynthesisArtifact::assemble(&self.shared.registry, &self.organization.id, records).ok_or_else(|| {
            OrgflowError::Internal(format!(
                "no completed '{}' record to assemble",
                self.shared.registry.synthesis().id()
            ))
        })
    }

    /// Writes a record, retrying transient errors per the checkpoint policy.
    /// A write that still fails is logged and the run continues.
    async fn persist(&self, record: &StageRecord) {
        let store = &self.shared.store;
        let written = with_retry_if(
            &self.shared.config.checkpoint_retry,
            &record.stage_id,
            || store.put(record.clone()),
            CheckpointError::is_transient,
        )
        .await;

        if let Err(e) = written {
            error!(stage_id = %record.stage_id, error = %e, "Checkpoint write failed, continuing");
            self.emit(
                EventKind::CheckpointWriteFailed,
                Some(record.stage_id.as_str()),
                json!({ "error": e.to_string(), "status": record.status }),
            );
        }
    }

    fn report(
        &self,
        analysis: SynthesisArtifact,
        records: HashMap<String, StageRecord>,
        from_cache: bool,
        executed_stages: Vec<String>,
    ) -> RunReport {
        RunReport {
            success: true,
            run_id: self.run_id.clone(),
            organization_id: self.organization.id.clone(),
            analysis,
            stage_outputs: records.into_iter().collect(),
            from_cache,
            executed_stages,
        }
    }

    fn stop(&self) {
        self.state.send_modify(|s| {
            s.status = RunStatus::Failed;
            s.current_index = None;
        });
    }

    fn emit(&self, kind: EventKind, stage_id: Option<&str>, data: serde_json::Value) {
        let mut event = PipelineEvent::new(kind, &self.organization.id, &self.run_id).with_data(data);
        if let Some(stage_id) = stage_id {
            event = event.with_stage(stage_id);
        }
        self.shared.events.try_emit(&event);
    }
}

/// Builder for [`PipelineController`].
pub struct PipelineControllerBuilder {
    registry: StageRegistry,
    store: Option<Arc<dyn CheckpointStore>>,
    processor: Option<Arc<dyn StageProcessor>>,
    lock: Option<Arc<dyn RunLock>>,
    events: Option<Arc<dyn EventSink>>,
    config: PipelineConfig,
}

impl std::fmt::Debug for PipelineControllerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineControllerBuilder")
            .field("stages", &self.registry.ids())
            .field("has_store", &self.store.is_some())
            .field("has_processor", &self.processor.is_some())
            .field("has_lock", &self.lock.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineControllerBuilder {
    fn new(registry: StageRegistry) -> Self {
        Self {
            registry,
            store: None,
            processor: None,
            lock: None,
            events: None,
            config: PipelineConfig::default(),
        }
    }

    /// Sets the checkpoint store. Defaults to an in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the stage processor. Required.
    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn StageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Sets a cross-instance run lock.
    #[must_use]
    pub fn lock(mut self, lock: Arc<dyn RunLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Sets the event sink. Defaults to discarding events.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and builds the controller.
    pub fn build(self) -> Result<PipelineController, OrgflowError> {
        self.config.validate()?;
        let processor = self
            .processor
            .ok_or_else(|| OrgflowError::Config("a stage processor is required".to_string()))?;

        let executor = StageExecutor::new(
            processor,
            self.config.stage_timeout(),
            self.config.stage_retry.clone(),
        );

        Ok(PipelineController {
            shared: Arc::new(Shared {
                registry: self.registry,
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
                executor,
                lock: self.lock,
                events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
                config: self.config,
                active: DashMap::new(),
            }),
        })
    }
}
