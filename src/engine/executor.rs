use crate::engine::actions::{
    ActionOutcome, CheckpointConfig, ForEachConfig, IfConfig, PlaybookCallConfig, ReturnConfig,
    ThrowConfig, VarConfig,
};
use crate::engine::context::{ExecutionContext, RunOptions, RunStatus};
use crate::engine::orchestrator::Engine;
use crate::engine::policy;
use crate::error::{CatalystError, ErrorCode};
use crate::playbook::types::{EarlyReturn, ErrorPolicy, PolicyAction, Step};
use crate::registry::ActionInstance;
use crate::shared::ids::is_kebab_case;
use crate::template;
use serde_json::{json, Map, Value};

const LOG_SOURCE: &str = "executor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Completed,
    Paused,
    Broke,
    EarlyReturn,
}

/// Result of running a nested step list: how it ended and how many of its
/// steps finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedBlock {
    pub outcome: BlockOutcome,
    pub completed: usize,
}

#[derive(Debug)]
enum StepFlow {
    Normal,
    Paused,
    Broke,
}

enum Dispatch {
    Outcome(ActionOutcome),
    Pause,
}

/// Runs step lists inside one execution context. Nested-capable actions get
/// a handle to this type; the engine keeps ownership of persistence, scope
/// isolation, and the completed-step ledger.
pub struct StepExecutor<'a> {
    engine: &'a Engine,
    options: &'a RunOptions,
    context: &'a mut ExecutionContext,
    record_completed: bool,
    honor_cancellation: bool,
}

impl<'a> StepExecutor<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        options: &'a RunOptions,
        context: &'a mut ExecutionContext,
    ) -> Self {
        Self {
            engine,
            options,
            context,
            record_completed: true,
            honor_cancellation: true,
        }
    }

    /// Executor for catch and finally blocks: their steps bind variables but
    /// never extend the resume ledger, and a tripped cancellation token must
    /// not keep them from running.
    pub(crate) fn for_recovery(
        engine: &'a Engine,
        options: &'a RunOptions,
        context: &'a mut ExecutionContext,
    ) -> Self {
        Self {
            engine,
            options,
            context,
            record_completed: false,
            honor_cancellation: false,
        }
    }

    pub fn call_stack(&self) -> &[String] {
        &self.context.call_stack
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.context.state.variables.get(name)
    }

    /// Interface surfaced to nested-capable actions: run child steps with
    /// optional variable overrides. Overrides shadow the parent scope and
    /// never persist back.
    pub fn execute_steps(
        &mut self,
        steps: &[Step],
        overrides: Option<&Map<String, Value>>,
    ) -> Result<NestedBlock, CatalystError> {
        let empty = Map::new();
        self.execute_nested(steps, overrides.unwrap_or(&empty), false)
    }

    pub(crate) fn run_block(&mut self, steps: &[Step]) -> Result<BlockOutcome, CatalystError> {
        self.run_list(steps).map(|block| block.outcome)
    }

    pub(crate) fn execute_nested(
        &mut self,
        steps: &[Step],
        overrides: &Map<String, Value>,
        isolated: bool,
    ) -> Result<NestedBlock, CatalystError> {
        let snapshot = self.context.state.variables.clone();
        for (key, value) in overrides {
            self.context.state.variables.insert(key.clone(), value.clone());
        }
        let record_before = self.record_completed;
        self.record_completed = false;
        let result = self.run_list(steps);
        self.record_completed = record_before;

        let nested_variables =
            std::mem::replace(&mut self.context.state.variables, snapshot);
        if !isolated {
            for (key, value) in nested_variables {
                if overrides.contains_key(&key) {
                    continue;
                }
                if self.context.state.variables.get(&key) != Some(&value) {
                    self.context.state.variables.insert(key, value);
                }
            }
        }
        result
    }

    fn run_list(&mut self, steps: &[Step]) -> Result<NestedBlock, CatalystError> {
        let mut completed = 0usize;
        for (index, step) in steps.iter().enumerate() {
            let step_name = step.resolved_name(index);
            if self.record_completed
                && self
                    .context
                    .state
                    .completed_steps
                    .iter()
                    .any(|done| done == &step_name)
            {
                continue;
            }
            if self.honor_cancellation {
                if let Some(token) = &self.options.cancellation {
                    if token.is_cancelled() {
                        return Err(CatalystError::new(
                            ErrorCode::Cancelled,
                            format!(
                                "run `{}` was cancelled before step `{step_name}`",
                                self.context.state.run_id
                            ),
                        ));
                    }
                }
            }
            match self.execute_one(step, &step_name)? {
                StepFlow::Normal => {
                    completed += 1;
                    if self.context.state.early_return.is_some() {
                        return Ok(NestedBlock {
                            outcome: BlockOutcome::EarlyReturn,
                            completed,
                        });
                    }
                }
                StepFlow::Paused => {
                    return Ok(NestedBlock {
                        outcome: BlockOutcome::Paused,
                        completed,
                    })
                }
                StepFlow::Broke => {
                    return Ok(NestedBlock {
                        outcome: BlockOutcome::Broke,
                        completed,
                    })
                }
            }
        }
        Ok(NestedBlock {
            outcome: BlockOutcome::Completed,
            completed,
        })
    }

    fn execute_one(&mut self, step: &Step, step_name: &str) -> Result<StepFlow, CatalystError> {
        let state = &mut self.context.state;
        state.current_step_name = Some(step_name.to_string());
        self.persist()?;
        self.engine.logger().verbose(
            LOG_SOURCE,
            "step-begin",
            step_name,
            Some(&json!({"action": step.action})),
        );

        // Thrown errors and error-shaped outcomes land in the same place:
        // the step's error policy decides what happens next.
        let mut final_error = match self.dispatch(step, step_name) {
            Err(err) => err,
            Ok(Dispatch::Pause) => return self.pause(step_name),
            Ok(Dispatch::Outcome(outcome)) => match outcome.error.clone() {
                None => return self.complete_step(step_name, outcome),
                Some(err) => err,
            },
        };

        let policy = step
            .error_policy
            .clone()
            .unwrap_or(ErrorPolicy::Token(PolicyAction::Stop));
        let retries = policy::retry_count(&final_error, &policy);
        for attempt in 1..=retries {
            self.engine.logger().warning(
                LOG_SOURCE,
                "retry",
                step_name,
                Some(&json!({
                    "attempt": attempt + 1,
                    "of": retries + 1,
                    "error": final_error.code.as_str(),
                })),
            );
            std::thread::sleep(policy::backoff_delay(attempt));
            match self.dispatch(step, step_name) {
                Err(err) => final_error = err,
                Ok(Dispatch::Pause) => return self.pause(step_name),
                Ok(Dispatch::Outcome(outcome)) => match outcome.error.clone() {
                    None => return self.complete_step(step_name, outcome),
                    Some(err) => final_error = err,
                },
            }
        }

        match policy::evaluate(&final_error, &policy) {
            PolicyAction::Stop => {
                self.engine.logger().error(
                    LOG_SOURCE,
                    "step-failed",
                    step_name,
                    Some(&final_error.to_json()),
                );
                Err(final_error)
            }
            PolicyAction::Continue => {
                self.engine.logger().warning(
                    LOG_SOURCE,
                    "step-continued",
                    step_name,
                    Some(&final_error.to_json()),
                );
                self.swallow_failure(step_name)
            }
            PolicyAction::SilentlyContinue => {
                self.engine.logger().verbose(
                    LOG_SOURCE,
                    "step-continued",
                    step_name,
                    Some(&final_error.to_json()),
                );
                self.swallow_failure(step_name)
            }
            PolicyAction::Ignore => self.swallow_failure(step_name),
            PolicyAction::Suspend => {
                self.engine.logger().warning(
                    LOG_SOURCE,
                    "step-suspended",
                    step_name,
                    Some(&final_error.to_json()),
                );
                self.pause(step_name)
            }
            PolicyAction::Inquire => {
                self.context
                    .state
                    .approved_checkpoints
                    .insert(step_name.to_string());
                self.engine.logger().warning(
                    LOG_SOURCE,
                    "step-inquire",
                    step_name,
                    Some(&final_error.to_json()),
                );
                self.pause(step_name)
            }
            PolicyAction::Break => {
                self.engine
                    .logger()
                    .info(LOG_SOURCE, "step-break", step_name, None);
                Ok(StepFlow::Broke)
            }
        }
    }

    fn complete_step(
        &mut self,
        step_name: &str,
        outcome: ActionOutcome,
    ) -> Result<StepFlow, CatalystError> {
        let value = outcome.value.unwrap_or(Value::Null);
        self.context
            .state
            .variables
            .insert(step_name.to_string(), value);
        if self.record_completed {
            self.context.state.completed_steps.push(step_name.to_string());
            self.context.session_steps_executed += 1;
        }
        self.persist()?;
        self.engine
            .logger()
            .verbose(LOG_SOURCE, "step-end", step_name, None);
        Ok(StepFlow::Normal)
    }

    fn swallow_failure(&mut self, step_name: &str) -> Result<StepFlow, CatalystError> {
        self.context
            .state
            .variables
            .insert(step_name.to_string(), Value::Null);
        if self.record_completed {
            self.context.state.completed_steps.push(step_name.to_string());
            self.context.session_steps_executed += 1;
        }
        self.persist()?;
        Ok(StepFlow::Normal)
    }

    fn pause(&mut self, step_name: &str) -> Result<StepFlow, CatalystError> {
        self.context.state.status = RunStatus::Paused;
        self.persist()?;
        self.engine.logger().info(
            LOG_SOURCE,
            "run-paused",
            step_name,
            Some(&json!({"runId": self.context.state.run_id})),
        );
        Ok(StepFlow::Paused)
    }

    fn persist(&self) -> Result<(), CatalystError> {
        self.engine.persist_state(&self.context.state)
    }

    fn dispatch(&mut self, step: &Step, step_name: &str) -> Result<Dispatch, CatalystError> {
        match step.action.as_str() {
            "if" => self.run_if(step),
            "for-each" => self.run_for_each(step),
            "playbook" => self.run_child_playbook(step),
            "var" => self.run_var(step),
            "return" => self.run_return(step),
            "checkpoint" => self.run_checkpoint(step, step_name),
            "throw" => self.run_throw(step),
            _ => self.run_registered(step),
        }
    }

    /// Interpolates a step config against the current variables, leaving any
    /// nested step lists untouched so inner steps interpolate at their own
    /// execution time.
    fn interpolated_config(&self, step: &Step) -> Result<Value, CatalystError> {
        let skip = self.engine.registry().nested_step_properties(&step.action);
        let variables = &self.context.state.variables;
        if skip.is_empty() {
            return template::interpolate_object(&step.config, variables);
        }
        let Value::Object(config) = &step.config else {
            return template::interpolate_object(&step.config, variables);
        };
        let mut out = Map::new();
        for (key, value) in config {
            if skip.iter().any(|property| property == key) {
                out.insert(key.clone(), value.clone());
            } else {
                out.insert(key.clone(), template::interpolate_object(value, variables)?);
            }
        }
        Ok(Value::Object(out))
    }

    fn run_if(&mut self, step: &Step) -> Result<Dispatch, CatalystError> {
        let config = IfConfig::parse(&step.config)?;
        let condition = match &config.condition {
            Value::String(expr) => template::interpolate_value(expr, &self.context.state.variables)
                .map_err(|err| {
                    CatalystError::new(
                        ErrorCode::IfConditionEvaluationFailed,
                        format!("could not evaluate `if` condition: {}", err.message),
                    )
                    .caused_by(err)
                })?,
            other => other.clone(),
        };
        let truthy = template::is_truthy(&condition);
        let branch = if truthy {
            &config.then_steps
        } else {
            &config.else_steps
        };
        let isolated = step.isolated.unwrap_or(false);
        let block = self.execute_nested(branch, &Map::new(), isolated)?;
        if block.outcome == BlockOutcome::Paused {
            return Ok(Dispatch::Pause);
        }
        Ok(Dispatch::Outcome(ActionOutcome::success(Some(json!({
            "branch": if truthy { "then" } else { "else" },
            "completed": block.completed,
        })))))
    }

    fn run_for_each(&mut self, step: &Step) -> Result<Dispatch, CatalystError> {
        let config = ForEachConfig::parse(&step.config)?;
        let items = match &config.items {
            Value::String(expr) => {
                template::interpolate_value(expr, &self.context.state.variables)?
            }
            other => other.clone(),
        };
        let Value::Array(items) = items else {
            return Err(CatalystError::new(
                ErrorCode::ForEachInvalidArray,
                format!("`for-each` items must resolve to an array, got `{items}`"),
            ));
        };

        let isolated = step.isolated.unwrap_or(false);
        let mut iterations = 0usize;
        for (index, item) in items.iter().enumerate() {
            let mut overrides = Map::new();
            overrides.insert(config.item_name.clone(), item.clone());
            overrides.insert("index".to_string(), json!(index));
            let block = self.execute_nested(&config.steps, &overrides, isolated)?;
            match block.outcome {
                BlockOutcome::Paused => return Ok(Dispatch::Pause),
                BlockOutcome::EarlyReturn => {
                    iterations += 1;
                    break;
                }
                BlockOutcome::Completed | BlockOutcome::Broke => iterations += 1,
            }
        }
        Ok(Dispatch::Outcome(ActionOutcome::success(Some(
            json!({"completed": iterations}),
        ))))
    }

    fn run_child_playbook(&mut self, step: &Step) -> Result<Dispatch, CatalystError> {
        let config = self.interpolated_config(step)?;
        let call = PlaybookCallConfig::parse(&config)?;
        let engine = self.engine;
        let outputs = engine.run_child(&call, self.context, self.options)?;
        Ok(Dispatch::Outcome(ActionOutcome::success(Some(
            Value::Object(outputs),
        ))))
    }

    fn run_var(&mut self, step: &Step) -> Result<Dispatch, CatalystError> {
        let config = self.interpolated_config(step)?;
        let var = VarConfig::parse(&config)?;
        if !is_kebab_case(&var.name) {
            self.engine.logger().warning(
                LOG_SOURCE,
                "var-name",
                &var.name,
                Some(&json!({"code": ErrorCode::VarInvalidName.as_str()})),
            );
        }
        self.context
            .state
            .variables
            .insert(var.name.clone(), var.value.clone());
        Ok(Dispatch::Outcome(ActionOutcome::success(Some(var.value))))
    }

    fn run_return(&mut self, step: &Step) -> Result<Dispatch, CatalystError> {
        let config = self.interpolated_config(step)?;
        let ret = ReturnConfig::parse(&config)?;
        for key in ret.outputs.keys() {
            if !self.context.declared_outputs.contains_key(key) {
                self.engine.logger().warning(
                    LOG_SOURCE,
                    "return-output",
                    key,
                    Some(&json!({"reason": "not a declared output"})),
                );
            }
        }
        self.context.state.early_return = Some(EarlyReturn {
            code: ret.code,
            message: ret.message,
            outputs: ret.outputs.clone(),
        });
        Ok(Dispatch::Outcome(ActionOutcome::success(Some(
            Value::Object(ret.outputs),
        ))))
    }

    fn run_checkpoint(&mut self, step: &Step, step_name: &str) -> Result<Dispatch, CatalystError> {
        let config = self.interpolated_config(step)?;
        let checkpoint = CheckpointConfig::parse(&config)?;
        let approved = self.context.state.approved_checkpoints.contains(step_name);
        if self.options.autonomous || approved {
            if !approved {
                self.context
                    .state
                    .approved_checkpoints
                    .insert(step_name.to_string());
            }
            self.engine.logger().info(
                LOG_SOURCE,
                "checkpoint-approved",
                step_name,
                Some(&json!({"message": checkpoint.message, "autonomous": self.options.autonomous})),
            );
            return Ok(Dispatch::Outcome(ActionOutcome::success(Some(json!({
                "approved": true,
                "message": checkpoint.message,
            })))));
        }
        self.engine.logger().info(
            LOG_SOURCE,
            "checkpoint-pending",
            step_name,
            Some(&json!({"message": checkpoint.message})),
        );
        Ok(Dispatch::Pause)
    }

    fn run_throw(&mut self, step: &Step) -> Result<Dispatch, CatalystError> {
        let config = self.interpolated_config(step)?;
        let throw = ThrowConfig::parse(&config)?;
        if !is_kebab_case(&throw.code) && !is_pascal_case(&throw.code) {
            self.engine.logger().warning(
                LOG_SOURCE,
                "throw-code",
                &throw.code,
                Some(&json!({"reason": "code is neither kebab-case nor PascalCase"})),
            );
        }
        let mut error = CatalystError::new(
            ErrorCode::parse(&throw.code),
            throw
                .message
                .unwrap_or_else(|| format!("playbook raised `{}`", throw.code)),
        );
        if let Some(guidance) = throw.guidance {
            error = error.with_guidance(guidance);
        }
        if let Some(metadata) = throw.metadata {
            error = error.with_metadata(metadata);
        }
        Err(error)
    }

    fn run_registered(&mut self, step: &Step) -> Result<Dispatch, CatalystError> {
        let config = self.interpolated_config(step)?;
        let engine = self.engine;
        match engine.registry().create_action(&step.action, true)? {
            ActionInstance::Leaf(action) => Ok(Dispatch::Outcome(action.execute(&config)?)),
            ActionInstance::Nested(action) => {
                Ok(Dispatch::Outcome(action.execute(&config, self)?))
            }
            ActionInstance::Builtin(_) => Err(CatalystError::execution(format!(
                "builtin action `{}` is engine-dispatched",
                step.action
            ))),
        }
    }
}

fn is_pascal_case(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {
            chars.all(|ch| ch.is_ascii_alphanumeric())
        }
        _ => false,
    }
}
