//! End-to-end tests of the controller over real stores, locks and scripted
//! processors.

#[cfg(test)]
mod tests {
    use crate::checkpoint::{
        CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
        MockCheckpointStore,
    };
    use crate::core::{RecordStatus, RunStatus, StageStatus};
    use crate::events::{CollectingEventSink, EventKind};
    use crate::pipeline::{
        FileRunLock, InMemoryRunLock, PipelineConfig, PipelineController, ResumePolicy, RetryConfig,
        RunLock,
    };
    use crate::testing::{
        acme, completed_records, market_registry, organization, Journal, JournalEntry,
        JournalingCheckpointStore, ScriptedProcessor, StageScript,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    const ALL_STAGES: [&str; 5] = ["competitors", "media", "regulatory", "trends", "synthesis"];

    /// Single attempts everywhere so failure tests don't sleep through backoff.
    fn fast_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_stage_retry(RetryConfig::none())
            .with_checkpoint_retry(RetryConfig::none())
    }

    fn controller(
        store: Arc<dyn CheckpointStore>,
        processor: Arc<ScriptedProcessor>,
        config: PipelineConfig,
    ) -> PipelineController {
        PipelineController::builder(market_registry())
            .store(store)
            .processor(processor)
            .config(config)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_run_executes_every_stage() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new());
        let controller = controller(store.clone(), processor.clone(), fast_config());

        let report = controller.run(acme()).await.unwrap();

        assert!(report.success);
        assert!(!report.from_cache);
        assert_eq!(processor.calls(), ALL_STAGES);
        assert_eq!(report.executed_stages, ALL_STAGES);
        assert_eq!(store.record_count("acme-corp"), 5);
        assert!(!report.analysis.is_partial());
        assert_eq!(
            report.analysis.analysis["summary"],
            "Synthesis for Acme Corp"
        );
    }

    #[tokio::test]
    async fn test_resume_skips_completed_prefix() {
        let registry = market_registry();
        let seeded = completed_records(&registry, "acme-corp", &["competitors", "media", "regulatory"]);
        let store = Arc::new(InMemoryCheckpointStore::with_records(seeded));
        let processor = Arc::new(ScriptedProcessor::new());
        let controller = controller(store, processor.clone(), fast_config());

        let report = controller.run(acme()).await.unwrap();

        assert_eq!(processor.calls(), vec!["trends", "synthesis"]);
        assert_eq!(report.executed_stages, vec!["trends", "synthesis"]);
        assert_eq!(
            report.record("competitors").unwrap().metadata.run_id.as_deref(),
            Some("seed")
        );

        let synthesis_request = &processor.requests("synthesis")[0];
        assert_eq!(
            synthesis_request.prior_stage_outputs.stage_ids(),
            vec!["competitors", "media", "regulatory", "trends"]
        );
    }

    #[tokio::test]
    async fn test_completed_run_is_served_from_cache() {
        let registry = market_registry();
        let store = Arc::new(InMemoryCheckpointStore::with_records(completed_records(
            &registry,
            "acme-corp",
            &ALL_STAGES,
        )));
        let processor = Arc::new(ScriptedProcessor::new());
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::builder(registry)
            .store(store)
            .processor(processor.clone())
            .events(events.clone())
            .build()
            .unwrap();

        let handle = controller.start(acme());
        let report = handle.wait().await.unwrap();

        assert!(report.from_cache);
        assert!(report.executed_stages.is_empty());
        assert_eq!(processor.total_calls(), 0);
        assert_eq!(report.analysis.analysis["summary"], "stored synthesis");
        assert_eq!(
            events.kinds(),
            vec![EventKind::PipelineChecking, EventKind::PipelineCacheHit]
        );

        let state = handle.state();
        assert!(state.from_cache);
        assert_eq!(state.status, RunStatus::Complete);
        assert_eq!(state.completed_count(), 5);
    }

    #[tokio::test]
    async fn test_each_record_is_written_before_next_stage_runs() {
        let journal = Journal::new();
        let store = Arc::new(JournalingCheckpointStore::new(
            InMemoryCheckpointStore::new(),
            journal.clone(),
        ));
        let processor = Arc::new(
            ScriptedProcessor::new()
                .script("media", StageScript::fail("rate limited"))
                .with_journal(journal.clone()),
        );
        let controller = controller(store, processor, fast_config());

        controller.run(acme()).await.unwrap();

        let expected: Vec<JournalEntry> = ALL_STAGES
            .iter()
            .flat_map(|id| {
                let status = if *id == "media" {
                    RecordStatus::Failed
                } else {
                    RecordStatus::Completed
                };
                [
                    JournalEntry::Invoked((*id).to_string()),
                    JournalEntry::Persisted((*id).to_string(), status),
                ]
            })
            .collect();
        assert_eq!(journal.entries(), expected);
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_run() {
        let journal = Journal::new();
        let store = Arc::new(JournalingCheckpointStore::new(
            InMemoryCheckpointStore::new(),
            journal.clone(),
        ));
        let processor = Arc::new(ScriptedProcessor::new().with_journal(journal.clone()));
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::builder(market_registry())
            .store(store)
            .processor(processor.clone())
            .events(events.clone())
            .build()
            .unwrap();

        let first = controller.start(acme());
        let second = controller.start(acme());
        assert!(!first.is_attached());
        assert!(second.is_attached());
        assert_eq!(first.run_id(), second.run_id());
        assert!(controller.is_running("acme-corp"));
        assert_eq!(controller.active_runs(), vec!["acme-corp"]);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        for stage_id in ALL_STAGES {
            assert_eq!(processor.call_count(stage_id), 1, "{stage_id}");
        }
        assert_eq!(journal.persist_count(), 5);
        assert_eq!(events.of_kind(EventKind::PipelineAlreadyRunning).len(), 1);
        assert!(!controller.is_running("acme-corp"));
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_section_missing() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new().script("media", StageScript::fail("quota exceeded")));
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::builder(market_registry())
            .store(store)
            .processor(processor.clone())
            .events(events.clone())
            .config(fast_config())
            .build()
            .unwrap();

        let report = controller.run(acme()).await.unwrap();

        assert_eq!(report.analysis.missing_sections, vec!["media"]);
        assert!(report.analysis.section("media").is_none());
        assert!(report.analysis.section("competitors").is_some());

        let media = report.record("media").unwrap();
        assert!(media.is_failed());
        assert_eq!(media.error.as_deref(), Some("quota exceeded"));

        let synthesis_request = &processor.requests("synthesis")[0];
        assert!(!synthesis_request.prior_stage_outputs.contains("media"));
        assert_eq!(events.stages_of_kind(EventKind::StageFailed), vec!["media"]);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_fatal_and_resumable() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new().script("synthesis", StageScript::fail("model overloaded")));
        let controller = controller(store.clone(), processor.clone(), fast_config());

        let err = controller.run(acme()).await.unwrap_err();
        assert_eq!(err.kind(), "TERMINAL_STAGE");
        assert!(err.is_resumable());
        assert_eq!(store.record_count("acme-corp"), 5);

        let run = controller.load_run("acme-corp").await.unwrap();
        assert_eq!(run.resume_index, Some(4));
        assert_eq!(run.stages[4].status, StageStatus::Failed);

        processor.set_script("synthesis", StageScript::succeed(serde_json::json!({"summary": "recovered"})));
        processor.reset_calls();
        let report = controller.run(acme()).await.unwrap();

        assert_eq!(processor.calls(), vec!["synthesis"]);
        assert_eq!(report.analysis.analysis["summary"], "recovered");
    }

    #[tokio::test]
    async fn test_recovered_upstream_stage_recomputes_synthesis() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new().script("trends", StageScript::fail("upstream 503")));
        let controller = controller(store, processor.clone(), fast_config());

        let first = controller.run(acme()).await.unwrap();
        assert_eq!(first.analysis.missing_sections, vec!["trends"]);

        processor.set_script("trends", StageScript::succeed(serde_json::json!({"growth": "4%"})));
        processor.reset_calls();
        let second = controller.run(acme()).await.unwrap();

        assert_eq!(processor.calls(), vec!["trends", "synthesis"]);
        assert!(second.analysis.missing_sections.is_empty());
        assert_eq!(second.analysis.section("trends").unwrap()["growth"], "4%");
        assert_ne!(
            first.record("synthesis").unwrap().metadata.input_hash,
            second.record("synthesis").unwrap().metadata.input_hash
        );
    }

    #[tokio::test]
    async fn test_repeated_upstream_failure_reuses_synthesis() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new().script("trends", StageScript::fail("upstream 503")));
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::builder(market_registry())
            .store(store)
            .processor(processor.clone())
            .events(events.clone())
            .config(fast_config())
            .build()
            .unwrap();

        let first = controller.run(acme()).await.unwrap();
        processor.reset_calls();
        events.clear();

        let second = controller.run(acme()).await.unwrap();

        assert_eq!(processor.calls(), vec!["trends"]);
        assert_eq!(second.executed_stages, vec!["trends"]);
        assert_eq!(events.stages_of_kind(EventKind::StageReused), vec!["synthesis"]);
        assert_eq!(second.analysis.analysis, first.analysis.analysis);
        assert_eq!(second.analysis.missing_sections, vec!["trends"]);
    }

    #[tokio::test]
    async fn test_cache_first_returns_partial_artifact() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new().script("trends", StageScript::fail("upstream 503")));
        let controller = controller(
            store,
            processor.clone(),
            fast_config().with_resume_policy(ResumePolicy::CacheFirst),
        );

        controller.run(acme()).await.unwrap();
        processor.set_script("trends", StageScript::succeed(serde_json::json!({"growth": "4%"})));
        processor.reset_calls();

        let report = controller.run(acme()).await.unwrap();

        assert!(report.from_cache);
        assert_eq!(processor.total_calls(), 0);
        assert_eq!(report.analysis.missing_sections, vec!["trends"]);
    }

    #[tokio::test]
    async fn test_invalidated_stage_is_recomputed_alone() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new());
        let controller = controller(store.clone(), processor.clone(), fast_config());
        controller.run(acme()).await.unwrap();
        processor.reset_calls();

        assert!(controller.invalidate("acme-corp", "regulatory").await.unwrap());
        assert!(!controller.invalidate("acme-corp", "regulatory").await.unwrap());
        assert_eq!(store.record_count("acme-corp"), 4);

        // Same payload as before, so downstream hashes still match.
        let report = controller.run(acme()).await.unwrap();

        assert_eq!(processor.calls(), vec!["regulatory"]);
        assert!(!report.from_cache);
    }

    #[tokio::test]
    async fn test_checkpoint_read_failure_is_fatal() {
        let mut store = MockCheckpointStore::new();
        store
            .expect_get()
            .times(1)
            .returning(|_| Err(CheckpointError::Unavailable("connection refused".to_string())));
        store.expect_put().never();
        let processor = Arc::new(ScriptedProcessor::new());
        let controller = controller(Arc::new(store), processor.clone(), fast_config());

        let handle = controller.start(acme());
        let err = handle.wait().await.unwrap_err();

        assert_eq!(err.kind(), "FATAL_CHECKPOINT");
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(processor.total_calls(), 0);
        assert_eq!(handle.state().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_is_not_fatal() {
        let mut store = MockCheckpointStore::new();
        store.expect_get().returning(|_| Ok(HashMap::new()));
        store
            .expect_put()
            .times(5)
            .returning(|_| Err(CheckpointError::Unavailable("disk full".to_string())));
        let processor = Arc::new(ScriptedProcessor::new());
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::builder(market_registry())
            .store(Arc::new(store))
            .processor(processor.clone())
            .events(events.clone())
            .config(fast_config())
            .build()
            .unwrap();

        let report = controller.run(acme()).await.unwrap();

        assert_eq!(processor.total_calls(), 5);
        assert_eq!(report.stage_outputs.len(), 5);
        assert_eq!(
            events.stages_of_kind(EventKind::CheckpointWriteFailed),
            ALL_STAGES
        );
    }

    #[tokio::test]
    async fn test_checkpoint_write_is_retried() {
        let mut store = MockCheckpointStore::new();
        let mut failed_once = false;
        store.expect_get().returning(|_| Ok(HashMap::new()));
        store.expect_put().times(6).returning(move |_| {
            if failed_once {
                Ok(())
            } else {
                failed_once = true;
                Err(CheckpointError::Unavailable("blip".to_string()))
            }
        });
        let processor = Arc::new(ScriptedProcessor::new());
        let events = Arc::new(CollectingEventSink::new());
        let config = fast_config().with_checkpoint_retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay_ms(1)
                .with_max_delay_ms(1),
        );
        let controller = PipelineController::builder(market_registry())
            .store(Arc::new(store))
            .processor(processor)
            .events(events.clone())
            .config(config)
            .build()
            .unwrap();

        controller.run(acme()).await.unwrap();

        assert!(events.of_kind(EventKind::CheckpointWriteFailed).is_empty());
    }

    #[tokio::test]
    async fn test_permanent_write_error_is_not_retried() {
        let mut store = MockCheckpointStore::new();
        store.expect_get().returning(|_| Ok(HashMap::new()));
        store.expect_put().times(5).returning(|record| {
            Err(CheckpointError::Corrupt {
                organization_id: record.organization_id,
                message: "schema mismatch".to_string(),
            })
        });
        let controller = controller(
            Arc::new(store),
            Arc::new(ScriptedProcessor::new()),
            fast_config().with_checkpoint_retry(RetryConfig::for_checkpoints()),
        );

        controller.run(acme()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_stage_times_out_and_run_continues() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new().script("regulatory", StageScript::Hang));
        let controller = controller(
            store,
            processor,
            fast_config().with_stage_timeout(Duration::from_millis(50)),
        );

        let report = controller.run(acme()).await.unwrap();

        assert_eq!(report.analysis.missing_sections, vec!["regulatory"]);
        let record = report.record("regulatory").unwrap();
        assert!(record.is_failed());
        assert!(record.error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_run_resumes_at_interrupted_stage() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let processor = Arc::new(ScriptedProcessor::new().script("regulatory", StageScript::Hang));
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::builder(market_registry())
            .store(store)
            .processor(processor.clone())
            .events(events.clone())
            .config(fast_config())
            .build()
            .unwrap();

        let handle = controller.start(acme());
        let mut states = handle.subscribe();
        states
            .wait_for(|s| s.stage_status("regulatory") == Some(StageStatus::Running))
            .await
            .map(|_| ())
            .unwrap();
        assert_eq!(
            handle.progress().current_stage.as_deref(),
            Some("Regulatory Landscape")
        );

        assert!(controller.cancel("acme-corp", "user stop"));
        let err = handle.wait().await.unwrap_err();

        assert_eq!(
            err,
            crate::errors::OrgflowError::cancelled("acme-corp", "regulatory", "user stop")
        );
        assert_eq!(events.of_kind(EventKind::PipelineCancelled).len(), 1);
        assert_eq!(handle.progress().label, "Analysis stopped");

        let run = controller.load_run("acme-corp").await.unwrap();
        assert_eq!(run.resume_index, Some(2));
        assert_eq!(
            run.records["regulatory"].error.as_deref(),
            Some("cancelled: user stop")
        );

        processor.set_script("regulatory", StageScript::succeed(serde_json::json!({"filings": 3})));
        processor.reset_calls();
        let report = controller.run(acme()).await.unwrap();

        assert_eq!(processor.calls(), vec!["regulatory", "trends", "synthesis"]);
        assert!(report.analysis.missing_sections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_organizations_run_in_parallel() {
        let delay = Duration::from_millis(100);
        let processor = ALL_STAGES.iter().fold(ScriptedProcessor::new(), |p, id| {
            p.script(
                *id,
                StageScript::delayed(delay, StageScript::succeed(serde_json::json!({"summary": id}))),
            )
        });
        let processor = Arc::new(processor);
        let store = Arc::new(InMemoryCheckpointStore::new());
        let controller = controller(store.clone(), processor.clone(), fast_config());

        let started = tokio::time::Instant::now();
        let names = ["Acme Corp", "Globex", "Initech"];
        let reports = futures::future::join_all(
            names.iter().map(|name| controller.run(organization(name))),
        )
        .await;
        let elapsed = started.elapsed();

        for report in reports {
            assert!(report.unwrap().analysis.missing_sections.is_empty());
        }
        assert_eq!(processor.total_calls(), 15);
        assert_eq!(store.organization_count(), 3);
        // Sequential execution would take 15 delays.
        assert!(elapsed < delay * 10, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempdir().unwrap();

        let crashed = Arc::new(ScriptedProcessor::new().script("trends", StageScript::fail("network down")));
        let first = controller(
            Arc::new(FileCheckpointStore::new(dir.path())),
            crashed,
            fast_config(),
        );
        let report = first.run(acme()).await.unwrap();
        assert_eq!(report.analysis.missing_sections, vec!["trends"]);
        drop(first);

        let processor = Arc::new(ScriptedProcessor::new());
        let restarted = controller(
            Arc::new(FileCheckpointStore::new(dir.path())),
            processor.clone(),
            fast_config(),
        );
        let report = restarted.run(acme()).await.unwrap();

        assert_eq!(processor.calls(), vec!["trends", "synthesis"]);
        assert!(report.analysis.missing_sections.is_empty());
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_rejects_run() {
        let lock = Arc::new(InMemoryRunLock::new());
        let processor = Arc::new(ScriptedProcessor::new());
        let controller = PipelineController::builder(market_registry())
            .processor(processor.clone())
            .lock(lock.clone())
            .build()
            .unwrap();

        let lease = lock.try_acquire("acme-corp", "other-node").await.unwrap().unwrap();
        let err = controller.run(acme()).await.unwrap_err();
        assert_eq!(err.kind(), "ALREADY_RUNNING");
        assert_eq!(processor.total_calls(), 0);

        drop(lease);
        controller.run(acme()).await.unwrap();
        assert_eq!(processor.total_calls(), 5);
        assert!(lock.holder("acme-corp").is_none());
    }

    #[tokio::test]
    async fn test_file_lease_excludes_second_instance() {
        let dir = tempdir().unwrap();
        let checkpoints = dir.path().join("checkpoints");
        let leases = dir.path().join("leases");

        let node_a = FileRunLock::new(&leases);
        let held = node_a.try_acquire("acme-corp", "node-a").await.unwrap().unwrap();

        let processor = Arc::new(ScriptedProcessor::new());
        let node_b = PipelineController::builder(market_registry())
            .store(Arc::new(FileCheckpointStore::new(&checkpoints)))
            .processor(processor.clone())
            .lock(Arc::new(FileRunLock::new(&leases)))
            .build()
            .unwrap();

        assert_eq!(node_b.run(acme()).await.unwrap_err().kind(), "ALREADY_RUNNING");
        assert_eq!(processor.total_calls(), 0);

        drop(held);
        node_b.run(acme()).await.unwrap();
        assert!(!node_a.lease_path("acme-corp").exists());
    }

    #[tokio::test]
    async fn test_events_progress_and_load_run() {
        let processor = Arc::new(ScriptedProcessor::new());
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::builder(market_registry())
            .processor(processor)
            .events(events.clone())
            .build()
            .unwrap();

        let handle = controller.start(acme());
        let report = handle.wait().await.unwrap();

        let kinds = events.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::PipelineChecking));
        assert_eq!(kinds.get(1), Some(&EventKind::PipelineResumed));
        assert_eq!(kinds.last(), Some(&EventKind::PipelineCompleted));
        assert_eq!(events.stages_of_kind(EventKind::StageStarted), ALL_STAGES);
        assert_eq!(events.stages_of_kind(EventKind::StageCompleted), ALL_STAGES);
        assert!(events
            .events()
            .iter()
            .all(|e| e.organization_id == "acme-corp" && e.run_id == report.run_id));

        let progress = handle.progress();
        assert_eq!(progress.percent, 100);
        assert_eq!(progress.label, "Analysis complete");
        assert_eq!(progress.completed, 5);

        let run = controller.load_run("acme-corp").await.unwrap();
        assert!(run.is_complete());
        assert_eq!(run.resume_index, None);
        assert_eq!(
            run.artifact(controller.registry()).unwrap().analysis,
            report.analysis.analysis
        );
    }
}
