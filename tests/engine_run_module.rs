use catalyst::engine::actions::{Action, ActionOutcome};
use catalyst::engine::{Engine, EnginePaths, RunOptions, RunStatus};
use catalyst::error::{CatalystError, ErrorCode};
use catalyst::logging::Logger;
use catalyst::playbook::yaml::{playbook_from_yaml_str, ShorthandRules};
use catalyst::playbook::Playbook;
use catalyst::registry::ActionRegistration;
use serde_json::{json, Map, Value};
use tempfile::{tempdir, TempDir};

struct EchoAction;

impl Action for EchoAction {
    fn execute(&self, config: &Value) -> Result<ActionOutcome, CatalystError> {
        Ok(ActionOutcome::success(Some(config.clone())))
    }
}

struct FailingAction;

impl Action for FailingAction {
    fn execute(&self, config: &Value) -> Result<ActionOutcome, CatalystError> {
        let code = config
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("ServiceError");
        Ok(ActionOutcome::failure(CatalystError::new(
            ErrorCode::parse(code),
            "action reported a failure",
        )))
    }
}

fn test_engine(dir: &TempDir) -> Engine {
    let mut engine = Engine::new(EnginePaths::under(dir.path()), Logger::disabled());
    engine
        .registry_mut()
        .register_action(ActionRegistration::leaf("echo", || Box::new(EchoAction)))
        .expect("register echo");
    engine
        .registry_mut()
        .register_action(ActionRegistration::leaf("fail-with", || Box::new(FailingAction)))
        .expect("register fail-with");
    engine
}

fn playbook(raw: &str) -> Playbook {
    playbook_from_yaml_str(raw, &ShorthandRules::builtin()).expect("playbook yaml")
}

fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert(key.to_string(), value.clone());
    }
    map
}

#[test]
fn multi_step_run_passes_variables_between_steps() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: setup-user-project
description: provision a project for a user
owner: platform
inputs:
  - name: user-email
    type: string
    required: true
outputs:
  project: object
  notification: object
steps:
  - action: echo
    name: user
    config:
      id: 123
      email: alice@example.com
  - action: echo
    name: project
    config:
      projectId: proj-456
      owner: ${user.id}
  - action: echo
    name: notification
    config:
      notified: true
      to: ${user.email}
"#,
    );

    let result = engine.run(
        &playbook,
        inputs(&[("user-email", json!("alice@example.com"))]),
        &RunOptions::default(),
    );

    assert_eq!(result.status, RunStatus::Completed, "error: {:?}", result.error);
    assert_eq!(result.steps_executed, 3);
    assert_eq!(
        result.outputs["project"],
        json!({"projectId": "proj-456", "owner": 123})
    );
    assert_eq!(
        result.outputs["notification"],
        json!({"notified": true, "to": "alice@example.com"})
    );
    // Completed runs leave the live directory for the archive.
    assert!(!engine.state_store().has_live(&result.run_id));
}

#[test]
fn missing_required_input_fails_before_any_step() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: needs-input
description: requires a field
owner: platform
inputs:
  - name: required-field
    type: string
    required: true
steps:
  - action: echo
    config: {}
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.expect("validation error");
    assert_eq!(error.code, ErrorCode::InputValidationFailed);
    assert!(error.message.contains("required-field"));
    assert_eq!(result.steps_executed, 0);
}

#[test]
fn zero_steps_is_a_structural_defect() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: empty
description: no steps
owner: platform
steps: []
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.error.expect("structure error").code,
        ErrorCode::PlaybookNotValid
    );
}

#[test]
fn catch_block_runs_recovery_without_masking_the_failure() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: guarded
description: catch a service error
owner: platform
steps:
  - action: throw
    config:
      code: ServiceError
      message: upstream exploded
catch:
  - code: ServiceError
    steps:
      - action: echo
        name: recovery
        config:
          recovered: true
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.expect("surfaced error");
    assert_eq!(error.code.as_str(), "ServiceError");

    // The recovery step ran and its binding landed in the persisted state.
    let state = engine.state_store().load(&result.run_id).expect("live state");
    assert_eq!(state.variables["recovery"], json!({"recovered": true}));
    assert!(engine.state_store().has_live(&result.run_id));
}

#[test]
fn unmatched_catch_codes_leave_the_original_error() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: guarded-miss
description: no catch code matches
owner: platform
steps:
  - action: throw
    config:
      code: ServiceError
catch:
  - code: OtherError
    steps:
      - action: echo
        name: recovery
        config: {}
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.expect("error").code.as_str(), "ServiceError");
    let state = engine.state_store().load(&result.run_id).expect("live state");
    assert!(!state.variables.contains_key("recovery"));
}

#[test]
fn finally_runs_on_both_success_and_failure() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let failing = playbook(
        r#"
name: cleanup-on-failure
description: finally after a failure
owner: platform
steps:
  - action: throw
    config:
      code: ServiceError
finally:
  - action: echo
    name: cleanup
    config:
      done: true
"#,
    );

    let result = engine.run(&failing, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    let state = engine.state_store().load(&result.run_id).expect("live state");
    assert_eq!(state.variables["cleanup"], json!({"done": true}));

    let succeeding = playbook(
        r#"
name: cleanup-on-success
description: finally after success
owner: platform
outputs:
  cleanup: object
steps:
  - action: echo
    name: work
    config:
      ok: true
finally:
  - action: echo
    name: cleanup
    config:
      done: true
"#,
    );
    let result = engine.run(&succeeding, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Completed, "error: {:?}", result.error);
    assert_eq!(result.outputs["cleanup"], json!({"done": true}));
}

#[test]
fn early_return_stops_the_run_and_feeds_outputs() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: short-circuit
description: return before the last step
owner: platform
outputs:
  result: number
steps:
  - action: echo
    name: first
    config:
      id: 123
  - action: return
    config:
      outputs:
        result: ${first.id}
  - action: echo
    name: never
    config:
      reached: true
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Completed, "error: {:?}", result.error);
    assert_eq!(result.outputs["result"], json!(123));
    assert_eq!(result.steps_executed, 2);
}

#[test]
fn declared_outputs_must_exist_with_matching_types() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: bad-outputs
description: output contract violated
owner: platform
outputs:
  report: object
steps:
  - action: echo
    name: report
    config: {}
  - action: var
    config:
      name: report
      value: plain-string
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    let error = result.error.expect("output error");
    assert_eq!(error.code, ErrorCode::OutputValidationFailed);
    assert!(error.message.contains("report"));
    // Failed runs stay in the live directory for resume.
    assert!(engine.state_store().has_live(&result.run_id));
}

#[test]
fn result_with_error_field_is_treated_as_step_failure() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: outcome-error
description: action returns an error outcome
owner: platform
steps:
  - action: fail-with
    config:
      code: UpstreamUnavailable
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.error.expect("error").code.as_str(),
        "UpstreamUnavailable"
    );
}

#[test]
fn unresolved_template_references_fail_the_step() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: bad-template
description: reference to an unset variable
owner: platform
steps:
  - action: echo
    config:
      value: ${never-set}
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.expect("error").code, ErrorCode::TemplateError);
}

#[test]
fn input_coercion_applies_before_steps_see_the_values() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: coerced
description: coerce string inputs
owner: platform
inputs:
  - name: retries
    type: number
  - name: dry-run
    type: boolean
outputs:
  snapshot: object
steps:
  - action: echo
    name: snapshot
    config:
      retries: ${retries}
      dry-run: ${dry-run}
"#,
    );

    let result = engine.run(
        &playbook,
        inputs(&[("retries", json!("3")), ("dry-run", json!("true"))]),
        &RunOptions::default(),
    );
    assert_eq!(result.status, RunStatus::Completed, "error: {:?}", result.error);
    assert_eq!(result.outputs["snapshot"], json!({"retries": 3, "dry-run": true}));
}

#[test]
fn unknown_action_types_surface_action_not_found() {
    let dir = tempdir().expect("tempdir");
    let engine = test_engine(&dir);
    let playbook = playbook(
        r#"
name: unknown-action
description: uses an unregistered action
owner: platform
steps:
  - action: transmogrify
    config: {}
"#,
    );

    let result = engine.run(&playbook, Map::new(), &RunOptions::default());
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.expect("error").code, ErrorCode::ActionNotFound);
}
