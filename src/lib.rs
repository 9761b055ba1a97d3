pub mod cli;
pub mod engine;
pub mod error;
pub mod logging;
pub mod playbook;
pub mod registry;
pub mod shared;
pub mod store;
pub mod template;
