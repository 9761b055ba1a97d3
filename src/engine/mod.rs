pub mod actions;
pub mod context;
pub mod executor;
pub mod orchestrator;
pub mod policy;

pub use context::{
    CancellationToken, ExecutionContext, ExecutionResult, PlaybookState, RunOptions, RunStatus,
};
pub use orchestrator::{Engine, EnginePaths};
