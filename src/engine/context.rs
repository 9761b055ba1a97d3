use crate::error::CatalystError;
use crate::playbook::types::{DeclaredType, EarlyReturn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The serializable snapshot of one run. Persisted after every transition so
/// a crash between steps resumes at the beginning of the next step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookState {
    pub playbook_name: String,
    pub run_id: String,
    pub start_time: String,
    pub status: RunStatus,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    #[serde(default)]
    pub approved_checkpoints: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_return: Option<EarlyReturn>,
}

/// Runtime-only view of a run in flight: the persisted state plus the
/// transient call stack used for circular-reference detection, the declared
/// output contract, and this session's execution counter.
#[derive(Debug)]
pub struct ExecutionContext {
    pub state: PlaybookState,
    pub call_stack: Vec<String>,
    pub declared_outputs: BTreeMap<String, DeclaredType>,
    pub session_steps_executed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CatalystError>,
    pub duration_ms: u64,
    pub steps_executed: usize,
    pub start_time: String,
    pub end_time: String,
}

/// Cooperative cancellation flag shared between the caller and a run. The
/// executor checks it at every step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub actor: String,
    pub max_recursion_depth: usize,
    /// Autonomous mode auto-approves checkpoint steps; manual mode pauses at
    /// each checkpoint until it is approved on the persisted state.
    pub autonomous: bool,
    pub lock_ttl_seconds: Option<u64>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            actor: "unknown".to_string(),
            max_recursion_depth: 10,
            autonomous: false,
            lock_ttl_seconds: None,
            cancellation: None,
        }
    }
}
