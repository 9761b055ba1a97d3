use catalyst::engine::actions::{Action, ActionOutcome};
use catalyst::engine::{CancellationToken, Engine, EnginePaths, PlaybookState, RunOptions, RunStatus};
use catalyst::error::{CatalystError, ErrorCode};
use catalyst::logging::Logger;
use catalyst::playbook::yaml::{playbook_from_yaml_str, ShorthandRules};
use catalyst::playbook::Playbook;
use catalyst::registry::ActionRegistration;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

struct CountingAction {
    calls: Arc<AtomicU32>,
}

impl Action for CountingAction {
    fn execute(&self, config: &Value) -> Result<ActionOutcome, CatalystError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ActionOutcome::success(Some(config.clone())))
    }
}

fn counting_engine(dir: &TempDir) -> (Engine, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let shared = calls.clone();
    let mut engine = Engine::new(EnginePaths::under(dir.path()), Logger::disabled());
    engine
        .registry_mut()
        .register_action(ActionRegistration::leaf("tracked", move || {
            Box::new(CountingAction {
                calls: shared.clone(),
            })
        }))
        .expect("register tracked");
    (engine, calls)
}

fn playbook(raw: &str) -> Playbook {
    playbook_from_yaml_str(raw, &ShorthandRules::builtin()).expect("playbook yaml")
}

fn three_step_playbook() -> Playbook {
    playbook(
        r#"
name: resumable
description: three tracked steps
owner: platform
steps:
  - action: tracked
    name: a
    config:
      step: a
  - action: tracked
    name: b
    config:
      step: b
  - action: tracked
    name: c
    config:
      step: c
"#,
    )
}

fn paused_state(run_id: &str) -> PlaybookState {
    let mut variables = Map::new();
    variables.insert("a".to_string(), json!({"step": "a"}));
    PlaybookState {
        playbook_name: "resumable".to_string(),
        run_id: run_id.to_string(),
        start_time: "2025-03-09T10:00:00.000Z".to_string(),
        status: RunStatus::Paused,
        inputs: Map::new(),
        variables,
        completed_steps: vec!["a".to_string()],
        current_step_name: Some("b".to_string()),
        approved_checkpoints: BTreeSet::new(),
        early_return: None,
    }
}

#[test]
fn resume_skips_completed_steps_and_finishes_the_rest() {
    let dir = tempdir().expect("tempdir");
    let (engine, calls) = counting_engine(&dir);
    let playbook = three_step_playbook();

    let state = paused_state("20250309-100000-001");
    engine.state_store().save(&state).expect("seed paused state");

    let result = engine.resume("20250309-100000-001", &playbook, &RunOptions::default());
    assert_eq!(result.status, RunStatus::Completed, "error: {:?}", result.error);
    assert_eq!(result.steps_executed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "step `a` must not re-execute");
    assert!(!engine.state_store().has_live("20250309-100000-001"));
}

#[test]
fn resume_preserves_previously_completed_work() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    let playbook = three_step_playbook();

    let state = paused_state("20250309-100000-002");
    let before: BTreeSet<String> = state.completed_steps.iter().cloned().collect();
    engine.state_store().save(&state).expect("seed paused state");

    let result = engine.resume("20250309-100000-002", &playbook, &RunOptions::default());
    assert_eq!(result.status, RunStatus::Completed, "error: {:?}", result.error);

    // completed-before is a subset of completed-after.
    let archived: BTreeSet<String> = ["a", "b", "c"].iter().map(|v| v.to_string()).collect();
    assert!(before.is_subset(&archived));
}

#[test]
fn resume_of_an_unknown_run_fails_with_resume_failed() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    let result = engine.resume("never-ran", &three_step_playbook(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.expect("error").code, ErrorCode::ResumeFailed);
}

#[test]
fn resume_with_the_wrong_playbook_is_incompatible() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    engine
        .state_store()
        .save(&paused_state("20250309-100000-003"))
        .expect("seed");

    let other = playbook(
        r#"
name: different-playbook
description: not the original
owner: platform
steps:
  - action: tracked
    config: {}
"#,
    );
    let result = engine.resume("20250309-100000-003", &other, &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.error.expect("error").code,
        ErrorCode::PlaybookIncompatible
    );
}

#[test]
fn corrupt_state_is_surfaced_as_state_corrupted() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    let path = engine.state_store().live_path("mangled");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, b"{broken json").expect("write");

    let result = engine.resume("mangled", &three_step_playbook(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.expect("error").code, ErrorCode::StateCorrupted);
}

#[test]
fn manual_checkpoints_pause_until_approved() {
    let dir = tempdir().expect("tempdir");
    let (engine, calls) = counting_engine(&dir);
    let playbook = playbook(
        r#"
name: gated
description: manual gate before the real work
owner: platform
steps:
  - action: checkpoint
    name: gate
    config:
      message: confirm the rollout window
  - action: tracked
    name: work
    config:
      step: work
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Paused);
    assert_eq!(result.steps_executed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let state = engine.state_store().load(&result.run_id).expect("paused state");
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(state.current_step_name.as_deref(), Some("gate"));

    engine
        .approve_checkpoint(&result.run_id, "gate")
        .expect("approve");
    let resumed = engine.resume(&result.run_id, &playbook, &RunOptions::default());
    assert_eq!(resumed.status, RunStatus::Completed, "error: {:?}", resumed.error);
    assert_eq!(resumed.steps_executed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn autonomous_mode_auto_approves_checkpoints() {
    let dir = tempdir().expect("tempdir");
    let (engine, calls) = counting_engine(&dir);
    let playbook = playbook(
        r#"
name: gated-auto
description: checkpoint that self-approves
owner: platform
steps:
  - action: checkpoint
    name: gate
    config:
      message: proceed automatically
  - action: tracked
    name: work
    config:
      step: work
"#,
    );

    let options = RunOptions {
        autonomous: true,
        ..RunOptions::default()
    };
    let result = engine.run(&playbook, Map::new(), &options);
    assert_eq!(result.status, RunStatus::Completed, "error: {:?}", result.error);
    assert_eq!(result.steps_executed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn checkpoints_without_a_message_are_config_errors() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    let playbook = playbook(
        r#"
name: gated-broken
description: checkpoint without a message
owner: platform
steps:
  - action: checkpoint
    config: {}
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.error.expect("error").code,
        ErrorCode::CheckpointMessageRequired
    );
}

#[test]
fn cancellation_fails_the_run_but_still_runs_finally() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    let playbook = playbook(
        r#"
name: cancellable
description: cancelled before the first step
owner: platform
steps:
  - action: tracked
    name: work
    config: {}
finally:
  - action: tracked
    name: cleanup
    config:
      cleaned: true
"#,
    );

    let token = CancellationToken::new();
    token.cancel();
    let options = RunOptions {
        cancellation: Some(token),
        ..RunOptions::default()
    };
    let result = engine.run(&playbook, Map::new(), &options);
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.expect("error").code, ErrorCode::Cancelled);

    let state = engine.state_store().load(&result.run_id).expect("failed state");
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.variables["cleanup"], json!({"cleaned": true}));
}

#[test]
fn abandon_archives_once_and_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    let playbook = playbook(
        r#"
name: doomed
description: fails and stays live
owner: platform
steps:
  - action: throw
    config:
      code: ServiceError
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert!(engine.state_store().has_live(&result.run_id));

    assert!(engine.abandon(&result.run_id).expect("first abandon"));
    assert!(!engine.state_store().has_live(&result.run_id));
    assert!(!engine.abandon(&result.run_id).expect("second abandon"));
}

#[test]
fn cleanup_archives_stale_runs_and_reports_the_count() {
    let dir = tempdir().expect("tempdir");
    let (engine, _calls) = counting_engine(&dir);
    let playbook = playbook(
        r#"
name: doomed
description: fails and stays live
owner: platform
steps:
  - action: throw
    config:
      code: ServiceError
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);

    // With a zero-day threshold every live run is stale.
    assert_eq!(engine.cleanup_stale_runs(Some(0)).expect("cleanup"), 1);
    assert!(!engine.state_store().has_live(&result.run_id));
    assert_eq!(engine.cleanup_stale_runs(Some(0)).expect("cleanup again"), 0);
}
