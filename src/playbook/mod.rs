pub mod types;
pub mod validate;
pub mod yaml;

pub use types::{
    CatchBlock, DeclaredType, EarlyReturn, ErrorPolicy, InputParameter, InputType, Playbook,
    PolicyAction, PolicyMap, PolicyRule, ResourceSet, Step, ValidationRule,
};
