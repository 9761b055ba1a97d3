use crate::engine::actions::PlaybookCallConfig;
use crate::engine::context::{
    ExecutionContext, ExecutionResult, PlaybookState, RunOptions, RunStatus,
};
use crate::engine::executor::{BlockOutcome, StepExecutor};
use crate::error::{CatalystError, ErrorCode};
use crate::logging::Logger;
use crate::playbook::types::{Playbook, Step};
use crate::playbook::validate::{
    apply_defaults, coerce_inputs, extract_outputs, validate_inputs, validate_outputs,
    validate_playbook_structure,
};
use crate::registry::Registry;
use crate::shared::ids::run_id_for;
use crate::store::lock_manager::LockManager;
use crate::store::state_store::StateStore;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const LOG_SOURCE: &str = "engine";

/// Where the engine keeps its on-disk artifacts. Defaults to the `.xe/`
/// layout under the working directory.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub state_root: PathBuf,
    pub locks_root: PathBuf,
    pub playbook_search_paths: Vec<PathBuf>,
}

impl EnginePaths {
    pub fn under(root: impl AsRef<Path>) -> Self {
        let base = root.as_ref().join(".xe");
        Self {
            state_root: base.join("runs"),
            locks_root: base.join("locks"),
            playbook_search_paths: vec![base.join("playbooks")],
        }
    }
}

impl Default for EnginePaths {
    fn default() -> Self {
        Self::under(".")
    }
}

struct Finish {
    status: RunStatus,
    outputs: Map<String, Value>,
    error: Option<CatalystError>,
}

pub(crate) struct RunFailure {
    pub error: CatalystError,
    pub result: ExecutionResult,
}

/// Top-level orchestrator: owns the registry, the state store, the lock
/// manager and the logger, and drives runs through the step executor.
#[derive(Debug)]
pub struct Engine {
    registry: Registry,
    state_store: StateStore,
    lock_manager: LockManager,
    logger: Logger,
    last_run_id: Mutex<String>,
}

impl Engine {
    pub fn new(paths: EnginePaths, logger: Logger) -> Self {
        Self {
            registry: Registry::with_defaults(paths.playbook_search_paths),
            state_store: StateStore::new(paths.state_root),
            lock_manager: LockManager::new(paths.locks_root),
            logger,
            last_run_id: Mutex::new(String::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Executes a playbook from the top. Failures are reported inside the
    /// result rather than as an `Err`, so callers always get the run id,
    /// timing, and the surfaced error together.
    pub fn run(
        &self,
        playbook: &Playbook,
        inputs: Map<String, Value>,
        options: &RunOptions,
    ) -> ExecutionResult {
        match self.execute_internal(playbook, inputs, options, Vec::new()) {
            Ok(result) => result,
            Err(failure) => failure.result,
        }
    }

    /// Continues a paused or failed run: completed top-level steps are
    /// skipped, everything else re-executes with the same semantics as
    /// `run`.
    pub fn resume(&self, run_id: &str, playbook: &Playbook, options: &RunOptions) -> ExecutionResult {
        match self.resume_internal(run_id, playbook, options) {
            Ok(result) => result,
            Err(failure) => failure.result,
        }
    }

    /// Archives a run regardless of its status. Returns whether a live run
    /// was actually archived; a second abandon of the same run is a no-op.
    pub fn abandon(&self, run_id: &str) -> Result<bool, CatalystError> {
        if !self.state_store.has_live(run_id) {
            return Ok(false);
        }
        self.state_store.archive(run_id)?;
        self.lock_manager.release(run_id)?;
        self.logger
            .info(LOG_SOURCE, "run-abandoned", run_id, None);
        Ok(true)
    }

    /// Archives every live run whose state file is older than the threshold
    /// (default 7 days). Returns the number archived.
    pub fn cleanup_stale_runs(&self, older_than_days: Option<u64>) -> Result<usize, CatalystError> {
        let days = older_than_days.unwrap_or(7);
        let stale = self.state_store.list_stale(days)?;
        let mut archived = 0usize;
        for run_id in stale {
            if self.state_store.archive(&run_id).is_ok() {
                let _ = self.lock_manager.release(&run_id);
                archived += 1;
            }
        }
        self.logger.info(
            LOG_SOURCE,
            "cleanup-stale",
            &format!("archived {archived} stale runs"),
            Some(&json!({"olderThanDays": days})),
        );
        Ok(archived)
    }

    /// Records approval for a checkpoint step on a paused run so the next
    /// resume proceeds past it.
    pub fn approve_checkpoint(&self, run_id: &str, step_name: &str) -> Result<(), CatalystError> {
        let mut state = self.state_store.load(run_id)?;
        state.approved_checkpoints.insert(step_name.to_string());
        self.state_store.save(&state)?;
        self.logger
            .info(LOG_SOURCE, "checkpoint-approve", step_name, Some(&json!({"runId": run_id})));
        Ok(())
    }

    pub(crate) fn execute_internal(
        &self,
        playbook: &Playbook,
        inputs: Map<String, Value>,
        options: &RunOptions,
        call_stack: Vec<String>,
    ) -> Result<ExecutionResult, RunFailure> {
        let start_time = now_iso();
        let run_id = self.generate_run_id();

        if call_stack.len() >= options.max_recursion_depth {
            return Err(self.failed_without_context(
                &run_id,
                &start_time,
                CatalystError::new(
                    ErrorCode::MaxRecursionDepthExceeded,
                    format!(
                        "recursion depth {} reached while entering `{}` (max {})",
                        call_stack.len(),
                        playbook.name,
                        options.max_recursion_depth
                    ),
                )
                .with_meta("callStack", Value::from(call_stack.clone())),
            ));
        }
        if call_stack.iter().any(|name| name == &playbook.name) {
            let chain = format!("{} -> {}", call_stack.join(" -> "), playbook.name);
            return Err(self.failed_without_context(
                &run_id,
                &start_time,
                CatalystError::new(
                    ErrorCode::CircularReferenceDetected,
                    format!("playbook `{}` is already on the call stack: {chain}", playbook.name),
                )
                .with_guidance("break the cycle by removing the recursive `playbook` step"),
            ));
        }
        if let Err(err) = validate_playbook_structure(playbook) {
            return Err(self.failed_without_context(&run_id, &start_time, err));
        }

        let coerced = coerce_inputs(&inputs, &playbook.inputs);
        let inputs = apply_defaults(&coerced, &playbook.inputs);
        if let Err(err) = validate_inputs(&inputs, &playbook.inputs) {
            return Err(self.failed_without_context(&run_id, &start_time, err));
        }

        let mut lock_held = false;
        if let Some(resources) = &playbook.resources {
            if !resources.is_empty() {
                if let Err(err) = self.lock_manager.acquire(
                    &run_id,
                    resources,
                    &options.actor,
                    options.lock_ttl_seconds,
                ) {
                    return Err(self.failed_without_context(&run_id, &start_time, err));
                }
                self.logger.info(
                    LOG_SOURCE,
                    "lock-acquire",
                    &run_id,
                    Some(&json!({
                        "paths": resources.paths,
                        "branches": resources.branches,
                    })),
                );
                lock_held = true;
            }
        }

        let mut call_stack = call_stack;
        call_stack.push(playbook.name.clone());
        let context = ExecutionContext {
            state: PlaybookState {
                playbook_name: playbook.name.clone(),
                run_id: run_id.clone(),
                start_time: start_time.clone(),
                status: RunStatus::Running,
                inputs: inputs.clone(),
                variables: inputs,
                completed_steps: Vec::new(),
                current_step_name: None,
                approved_checkpoints: BTreeSet::new(),
                early_return: None,
            },
            call_stack,
            declared_outputs: playbook.outputs.clone(),
            session_steps_executed: 0,
        };
        if let Err(err) = self.persist_state(&context.state) {
            if lock_held {
                let _ = self.lock_manager.release(&run_id);
            }
            return Err(self.failed_without_context(&run_id, &start_time, err));
        }
        self.logger.info(
            LOG_SOURCE,
            "run-begin",
            &playbook.name,
            Some(&json!({"runId": run_id, "actor": options.actor})),
        );

        self.drive(playbook, context, options, lock_held)
    }

    fn resume_internal(
        &self,
        run_id: &str,
        playbook: &Playbook,
        options: &RunOptions,
    ) -> Result<ExecutionResult, RunFailure> {
        let fallback_start = now_iso();
        let state = match self.state_store.load(run_id) {
            Ok(state) => state,
            Err(err) => {
                let error = if err.code == ErrorCode::StateCorrupted {
                    err
                } else {
                    CatalystError::new(
                        ErrorCode::ResumeFailed,
                        format!("could not resume run `{run_id}`"),
                    )
                    .caused_by(err)
                };
                return Err(self.failed_without_context(run_id, &fallback_start, error));
            }
        };
        if state.playbook_name != playbook.name {
            return Err(self.failed_without_context(
                run_id,
                &fallback_start,
                CatalystError::new(
                    ErrorCode::PlaybookIncompatible,
                    format!(
                        "run `{run_id}` belongs to playbook `{}`, not `{}`",
                        state.playbook_name, playbook.name
                    ),
                ),
            ));
        }
        if let Err(err) = validate_playbook_structure(playbook) {
            return Err(self.failed_without_context(run_id, &fallback_start, err));
        }

        let mut lock_held = false;
        if let Some(resources) = &playbook.resources {
            if !resources.is_empty() {
                if let Err(err) = self.lock_manager.acquire(
                    run_id,
                    resources,
                    &options.actor,
                    options.lock_ttl_seconds,
                ) {
                    return Err(self.failed_without_context(run_id, &fallback_start, err));
                }
                lock_held = true;
            }
        }

        let mut state = state;
        state.status = RunStatus::Running;
        let context = ExecutionContext {
            state,
            call_stack: vec![playbook.name.clone()],
            declared_outputs: playbook.outputs.clone(),
            session_steps_executed: 0,
        };
        if let Err(err) = self.persist_state(&context.state) {
            if lock_held {
                let _ = self.lock_manager.release(run_id);
            }
            return Err(self.failed_without_context(run_id, &fallback_start, err));
        }
        self.logger.info(
            LOG_SOURCE,
            "run-resume",
            &playbook.name,
            Some(&json!({
                "runId": run_id,
                "completedSteps": context.state.completed_steps.len(),
            })),
        );

        self.drive(playbook, context, options, lock_held)
    }

    /// Shared back half of run and resume: top-level execution, catch and
    /// finally, output collection, terminal state transition, lock release.
    fn drive(
        &self,
        playbook: &Playbook,
        mut context: ExecutionContext,
        options: &RunOptions,
        lock_held: bool,
    ) -> Result<ExecutionResult, RunFailure> {
        let session_started = Instant::now();

        let exec = {
            let mut executor = StepExecutor::new(self, options, &mut context);
            executor.run_block(&playbook.steps)
        };

        let exec = match exec {
            Err(err) => {
                if let Some(block) = playbook
                    .catch
                    .iter()
                    .find(|block| block.code == err.code.as_str())
                {
                    self.logger.info(
                        LOG_SOURCE,
                        "catch-begin",
                        &block.code,
                        Some(&json!({"runId": context.state.run_id})),
                    );
                    self.run_recovery_steps(&block.steps, &mut context, options, "catch");
                }
                Err(err)
            }
            ok => ok,
        };

        // finally runs before lock release so finalizers can still use the
        // locked resources.
        if !playbook.finally_steps.is_empty() {
            self.run_recovery_steps(&playbook.finally_steps, &mut context, options, "finally");
        }

        let finished = match exec {
            Ok(BlockOutcome::Paused) => Finish {
                status: RunStatus::Paused,
                outputs: Map::new(),
                error: None,
            },
            Ok(_) => match self.finish_success(playbook, &mut context) {
                Ok(outputs) => Finish {
                    status: RunStatus::Completed,
                    outputs,
                    error: None,
                },
                Err(err) => self.finish_failure(&mut context, err),
            },
            Err(err) => self.finish_failure(&mut context, err),
        };

        if lock_held {
            match self.lock_manager.release(&context.state.run_id) {
                Ok(()) => {
                    self.logger
                        .verbose(LOG_SOURCE, "lock-release", &context.state.run_id, None)
                }
                Err(err) => self
                    .logger
                    .warning(LOG_SOURCE, "lock-release", &err.message, None),
            }
        }

        let result = ExecutionResult {
            run_id: context.state.run_id.clone(),
            status: finished.status,
            outputs: finished.outputs,
            error: finished.error.clone(),
            duration_ms: duration_ms(session_started.elapsed()),
            steps_executed: context.session_steps_executed,
            start_time: context.state.start_time.clone(),
            end_time: now_iso(),
        };
        match finished.error {
            Some(error) => Err(RunFailure { error, result }),
            None => Ok(result),
        }
    }

    fn finish_success(
        &self,
        playbook: &Playbook,
        context: &mut ExecutionContext,
    ) -> Result<Map<String, Value>, CatalystError> {
        let outputs = self.collect_outputs(playbook, context)?;
        context.state.status = RunStatus::Completed;
        context.state.current_step_name = None;
        self.persist_state(&context.state)?;
        self.state_store.archive(&context.state.run_id)?;
        self.logger.info(
            LOG_SOURCE,
            "run-completed",
            &context.state.playbook_name,
            Some(&json!({
                "runId": context.state.run_id,
                "stepsExecuted": context.session_steps_executed,
            })),
        );
        Ok(outputs)
    }

    fn finish_failure(&self, context: &mut ExecutionContext, error: CatalystError) -> Finish {
        context.state.status = RunStatus::Failed;
        if let Err(save_err) = self.persist_state(&context.state) {
            self.logger
                .error(LOG_SOURCE, "state-save", &save_err.message, None);
        }
        self.logger.error(
            LOG_SOURCE,
            "run-failed",
            &context.state.playbook_name,
            Some(&error.to_json()),
        );
        Finish {
            status: RunStatus::Failed,
            outputs: Map::new(),
            error: Some(error),
        }
    }

    /// Early-return outputs are the primary source; declared outputs not
    /// covered by it come from the run variables. The merged view must
    /// satisfy the declared output contract.
    fn collect_outputs(
        &self,
        playbook: &Playbook,
        context: &ExecutionContext,
    ) -> Result<Map<String, Value>, CatalystError> {
        let early_outputs = context
            .state
            .early_return
            .as_ref()
            .map(|early| early.outputs.clone())
            .unwrap_or_default();

        let mut combined = context.state.variables.clone();
        for (key, value) in &early_outputs {
            combined.insert(key.clone(), value.clone());
        }
        validate_outputs(&playbook.outputs, &combined)?;

        let mut outputs = extract_outputs(&playbook.outputs, &combined);
        for (key, value) in early_outputs {
            outputs.insert(key, value);
        }
        Ok(outputs)
    }

    fn run_recovery_steps(
        &self,
        steps: &[Step],
        context: &mut ExecutionContext,
        options: &RunOptions,
        phase: &str,
    ) {
        let run_id = context.state.run_id.clone();
        let outcome = {
            let mut executor = StepExecutor::for_recovery(self, options, context);
            executor.run_block(steps)
        };
        if let Err(err) = outcome {
            self.logger.error(
                LOG_SOURCE,
                phase,
                &format!("{phase} block failed: {}", err.message),
                Some(&json!({"runId": run_id, "error": err.to_json()})),
            );
        }
    }

    pub(crate) fn run_child(
        &self,
        call: &PlaybookCallConfig,
        parent: &mut ExecutionContext,
        options: &RunOptions,
    ) -> Result<Map<String, Value>, CatalystError> {
        let child = self.registry.load_playbook(&call.name)?;
        self.logger.info(
            LOG_SOURCE,
            "child-begin",
            &child.name,
            Some(&json!({"parentRunId": parent.state.run_id})),
        );
        let result =
            self.execute_internal(&child, call.inputs.clone(), options, parent.call_stack.clone());
        match result {
            Ok(result) if result.status == RunStatus::Completed => {
                self.logger.info(
                    LOG_SOURCE,
                    "child-end",
                    &child.name,
                    Some(&json!({"childRunId": result.run_id})),
                );
                Ok(result.outputs)
            }
            Ok(result) => Err(CatalystError::execution(format!(
                "child playbook run `{}` paused before completing",
                result.run_id
            ))
            .with_meta("childRunId", result.run_id)
            .with_guidance("resume the child run directly, or approve its pending checkpoint")),
            Err(failure) => Err(failure.error),
        }
    }

    pub(crate) fn persist_state(&self, state: &PlaybookState) -> Result<(), CatalystError> {
        self.state_store.save(state)?;
        self.logger.trace(
            "state-store",
            "save",
            &state.run_id,
            Some(&json!({
                "status": state.status.to_string(),
                "completedSteps": state.completed_steps.len(),
            })),
        );
        Ok(())
    }

    fn failed_without_context(
        &self,
        run_id: &str,
        start_time: &str,
        error: CatalystError,
    ) -> RunFailure {
        self.logger
            .error(LOG_SOURCE, "run-failed", &error.message, Some(&error.to_json()));
        RunFailure {
            result: ExecutionResult {
                run_id: run_id.to_string(),
                status: RunStatus::Failed,
                outputs: Map::new(),
                error: Some(error.clone()),
                duration_ms: 0,
                steps_executed: 0,
                start_time: start_time.to_string(),
                end_time: now_iso(),
            },
            error,
        }
    }

    fn generate_run_id(&self) -> String {
        for _ in 0..128 {
            let candidate = run_id_for(Utc::now());
            let mut last = self
                .last_run_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *last != candidate && !self.state_store.has_live(&candidate) {
                *last = candidate.clone();
                return candidate;
            }
            drop(last);
            std::thread::sleep(Duration::from_millis(1));
        }
        // Millisecond collisions for this long mean a broken clock; salt
        // with the process id to stay unique.
        format!("{}-{}", run_id_for(Utc::now()), std::process::id())
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
