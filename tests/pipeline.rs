mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use chrono::Utc;
use common::*;
use mlops_pipeline::broadcast::Broadcaster;
use mlops_pipeline::error::FailureClass;
use mlops_pipeline::pipeline::{Attempt, RunOutcome, SHUTDOWN_REASON, ShutdownSignal};
use mlops_pipeline::run::{ModelDeploymentRecord, PhaseName, PhaseStatus, RunStatus};
use serde_json::json;

#[test]
fn iris_notebook_trains_registers_and_deploys() {
    let harness = Harness::iris(0.95);
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = harness.engine(publisher.clone(), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(
        serde_json::Value::Object(stored.metrics.clone()),
        json!({"accuracy": 0.95, "deployed": true})
    );
    assert!(matches!(outcome, RunOutcome::Succeeded { .. }));
    assert!(stored.started_at.is_some() && stored.finished_at.is_some());

    let names: Vec<PhaseName> = stored.phases.iter().map(|p| p.name).collect();
    assert_eq!(names, PhaseName::ALL.to_vec());
    assert!(stored.phases.iter().all(|p| p.status == PhaseStatus::Success));

    let active = harness
        .store
        .active_deployment("iris-classifier")
        .unwrap()
        .expect("active deployment");
    assert_eq!(active.version, "1");
    assert_eq!(active.accuracy, 0.95);
    assert_eq!(active.endpoint_url, "http://model-server:8001/predict/iris-classifier");
    assert_eq!(active.pipeline_id.as_deref(), Some(run.id.as_str()));

    let loads = harness.loader.loads.lock().unwrap();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].0, "iris-classifier");
    assert_eq!(loads[0].1.run_reference, "run-1");

    let events = publisher.phases();
    assert_eq!(events.last().unwrap(), &("complete".to_string(), "success".to_string()));
}

#[test]
fn tracker_receives_run_identity_and_artifact() {
    let harness = Harness::iris(0.95);
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();
    engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    let log = harness.tracker.log.lock().unwrap();
    assert_eq!(log.experiments, vec!["mlops-iris-classifier".to_string()]);
    assert_eq!(log.run_names, vec![format!("iris-classifier-{}", &run.id[..8])]);
    let tag = |key: &str| {
        log.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(tag("pipeline_id").as_deref(), Some(run.id.as_str()));
    assert_eq!(tag("commit_sha").as_deref(), Some("abc123"));
    assert_eq!(tag("model_name").as_deref(), Some("iris-classifier"));
    assert_eq!(tag("version").as_deref(), Some("1"));
    assert!(tag("artifact_sha256").is_some());
    assert_eq!(log.artifacts, vec!["model/model.json".to_string()]);

    let params = harness.runner.params.lock().unwrap();
    let keys: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["MODEL_OUTPUT_PATH", "PIPELINE_ID", "MLFLOW_TRACKING_URI"]);
    assert_eq!(params[1].1, run.id);
}

#[test]
fn missing_training_section_fails_at_validate() {
    let notebook = notebook_bytes(
        &["mlops:config", "mlops:preprocessing", "mlops:export"],
        "MODEL_NAME = 'iris-classifier'",
    );
    let harness = Harness::new(
        FakeSource::returning(notebook),
        FakeTracker::with_accuracy(0.95),
        FakeLoader::new(),
    );
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::first(2))
        .unwrap();

    match outcome {
        RunOutcome::Failed { phase, reason, class } => {
            assert_eq!(phase, Some(PhaseName::Validate));
            assert_eq!(class, FailureClass::Contract);
            assert!(reason.contains("mlops:training"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    let failed: Vec<_> = stored
        .phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, PhaseName::Validate);
    assert!(stored.phase(PhaseName::Execute).is_none());
    assert!(stored.phase(PhaseName::Register).is_none());
    assert!(stored.phase(PhaseName::Deploy).is_none());
    assert!(harness.tracker.log.lock().unwrap().run_names.is_empty());
}

#[test]
fn low_accuracy_skips_deploy_but_succeeds() {
    let harness = Harness::iris(0.5);
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = harness.engine(publisher.clone(), policy(0.7));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.metrics.get("deployed"), Some(&json!(false)));
    assert!(stored.phase(PhaseName::Deploy).is_none());
    assert!(
        !publisher
            .phases()
            .iter()
            .any(|(phase, _)| phase == "deploy")
    );
    assert!(harness.loader.loads.lock().unwrap().is_empty());
    assert!(harness.store.active_deployment("iris-classifier").unwrap().is_none());
}

#[test]
fn concurrent_promotions_leave_one_active_deployment() {
    let harness = Harness::iris(0.95);
    let handles: Vec<_> = (0..8)
        .map(|n| {
            let store = harness.store.clone();
            thread::spawn(move || {
                store
                    .promote(&ModelDeploymentRecord {
                        id: None,
                        model_name: "iris-classifier".into(),
                        version: n.to_string(),
                        accuracy: 0.9,
                        endpoint_url: "http://model-server:8001/predict/iris-classifier".into(),
                        deployed_at: Utc::now(),
                        is_active: true,
                        pipeline_id: None,
                    })
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let records = harness.store.deployments("iris-classifier").unwrap();
    assert_eq!(records.len(), 8);
    let active: Vec<_> = records.iter().filter(|r| r.is_active).collect();
    assert_eq!(active.len(), 1);
    let current = harness
        .store
        .active_deployment("iris-classifier")
        .unwrap()
        .expect("active deployment");
    assert_eq!(current.version, active[0].version);
}

#[test]
fn promotion_deactivates_previous_version() {
    let harness = Harness::iris(0.95);
    harness
        .store
        .promote(&ModelDeploymentRecord {
            id: None,
            model_name: "iris-classifier".into(),
            version: "0".into(),
            accuracy: 0.8,
            endpoint_url: "http://model-server:8001/predict/iris-classifier".into(),
            deployed_at: Utc::now(),
            is_active: true,
            pipeline_id: None,
        })
        .unwrap();
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();
    engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    let records = harness.store.deployments("iris-classifier").unwrap();
    assert_eq!(records.len(), 2);
    let active: Vec<_> = records.iter().filter(|r| r.is_active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].version, "1");
}

#[test]
fn deploy_failure_keeps_run_successful() {
    let harness = Harness::new(
        FakeSource::returning(iris_notebook()),
        FakeTracker::with_accuracy(0.95),
        FakeLoader::failing(),
    );
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::first(2))
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Succeeded { .. }));
    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.metrics.get("deployed"), Some(&json!(false)));
    assert_eq!(
        stored.phase(PhaseName::Deploy).map(|p| p.status),
        Some(PhaseStatus::Failed)
    );
    assert!(harness.store.active_deployment("iris-classifier").unwrap().is_none());
}

#[test]
fn execution_error_fails_run_without_retry() {
    let harness = Harness::iris(0.95).with_runner(FakeRunner::failing());
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::first(2))
        .unwrap();

    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            phase: Some(PhaseName::Execute),
            class: FailureClass::Contract,
            ..
        }
    ));
    let stored = harness.store.get_run(&run.id).unwrap();
    assert!(
        stored
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("ZeroDivisionError")
    );
}

#[test]
fn phases_stay_prefix_consistent() {
    let harness = Harness::iris(0.95);
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = harness.engine(publisher.clone(), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();
    engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    let mut expected = Vec::new();
    for phase in PhaseName::ALL {
        expected.push((phase.to_string(), "running".to_string()));
        expected.push((phase.to_string(), "success".to_string()));
    }
    expected.push(("complete".to_string(), "success".to_string()));
    assert_eq!(publisher.phases(), expected);
}

#[test]
fn shutdown_between_phases_interrupts_run() {
    let signal = ShutdownSignal::new();
    let harness = Harness::new(
        FakeSource::returning(iris_notebook()).triggering(signal.clone()),
        FakeTracker::with_accuracy(0.95),
        FakeLoader::new(),
    );
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = harness
        .engine(publisher.clone(), policy(0.70))
        .with_shutdown(signal);
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::first(2))
        .unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some(SHUTDOWN_REASON));
    assert_eq!(stored.phases.len(), 1);
    assert_eq!(stored.phases[0].status, PhaseStatus::Success);

    let events = publisher.phases();
    let tail: Vec<&str> = events[events.len() - 2..].iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(tail, vec!["shutdown", "complete"]);
}

#[test]
fn transient_download_failure_requests_one_retry() {
    let harness = Harness::new(
        FakeSource::sequence(vec![Err(network_error()), Ok(iris_notebook())]),
        FakeTracker::with_accuracy(0.95),
        FakeLoader::new(),
    );
    let broadcaster = Arc::new(Broadcaster::new(harness.store.clone()));
    let engine = harness.engine(broadcaster.clone(), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let first = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::first(2))
        .unwrap();
    assert!(matches!(
        first,
        RunOutcome::RetryScheduled {
            phase: PhaseName::Download,
            ..
        }
    ));
    assert_eq!(harness.store.get_run(&run.id).unwrap().status, RunStatus::Queued);

    let second = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::first(2).next())
        .unwrap();
    assert!(matches!(second, RunOutcome::Succeeded { .. }));

    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(harness.source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.attempt(), 2);
    assert_eq!(stored.phases.len(), 5);
    assert!(
        stored
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Success && p.attempt == 2)
    );

    let history = broadcaster.replay(&run.id).unwrap();
    assert_eq!(
        (history[1].phase.as_str(), history[1].status.as_str()),
        ("download", "failed")
    );
    assert!(history.iter().any(|e| e.phase == "retry"));
}

#[test]
fn shutdown_during_transient_failure_is_not_retried() {
    let signal = ShutdownSignal::new();
    let harness = Harness::new(
        FakeSource::sequence(vec![Err(network_error())]).triggering(signal.clone()),
        FakeTracker::with_accuracy(0.95),
        FakeLoader::new(),
    );
    let publisher = Arc::new(RecordingPublisher::default());
    let engine = harness
        .engine(publisher.clone(), policy(0.70))
        .with_shutdown(signal);
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::first(2))
        .unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some(SHUTDOWN_REASON));
    assert_eq!(stored.phases[0].status, PhaseStatus::Failed);
    assert!(!publisher.phases().iter().any(|(phase, _)| phase == "retry"));
    assert_eq!(engine.metrics().snapshot().runs_retried, 0);
}

#[test]
fn transient_failure_on_last_attempt_is_terminal() {
    let harness = Harness::new(
        FakeSource::returning(iris_notebook()),
        FakeTracker::unreachable(),
        FakeLoader::new(),
    );
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            phase: Some(PhaseName::Register),
            class: FailureClass::Transient,
            ..
        }
    ));
    assert_eq!(harness.store.get_run(&run.id).unwrap().status, RunStatus::Failed);
}

#[test]
fn broadcast_failure_does_not_affect_stored_run() {
    let harness = Harness::iris(0.95);
    let engine = harness.engine(Arc::new(FailingPublisher), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();

    let outcome = engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Succeeded { .. }));
    let stored = harness.store.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.phases.len(), 5);
    assert!(harness.store.events(&run.id).unwrap().is_empty());
}

#[test]
fn finished_run_cannot_be_executed_again() {
    let harness = Harness::iris(0.95);
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.70));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();
    engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    assert!(
        engine
            .execute(&run.id, &harness.repository, "abc123", Attempt::single())
            .is_err()
    );
    assert_eq!(harness.store.get_run(&run.id).unwrap().status, RunStatus::Success);
}

#[test]
fn retriggering_same_commit_creates_distinct_runs() {
    let harness = Harness::iris(0.95);
    let first = harness.store.create_run(harness.repository.id, "abc123").unwrap();
    let second = harness.store.create_run(harness.repository.id, "abc123").unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.status, RunStatus::Queued);
    assert_eq!(second.status, RunStatus::Queued);
}

#[test]
fn engine_metrics_count_phases_and_outcomes() {
    let harness = Harness::iris(0.5);
    let engine = harness.engine(Arc::new(RecordingPublisher::default()), policy(0.7));
    let run = harness.store.create_run(harness.repository.id, "abc123").unwrap();
    engine
        .execute(&run.id, &harness.repository, "abc123", Attempt::single())
        .unwrap();

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.runs_succeeded, 1);
    assert_eq!(snapshot.deploys_skipped, 1);
    assert_eq!(snapshot.deployments, 0);
    assert_eq!(snapshot.phases.get("download").map(|m| m.calls), Some(1));
    assert!(!snapshot.phases.contains_key("deploy"));
    assert!(snapshot.to_prometheus().contains("mlops_runs_total{status=\"success\"} 1"));
}
