use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A declarative workflow: ordered steps plus the contract around them
/// (inputs, outputs, declared resources, catch/finally recovery blocks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playbook {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub inputs: Vec<InputParameter>,
    #[serde(default)]
    pub outputs: BTreeMap<String, DeclaredType>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchBlock>,
    #[serde(default, rename = "finally", skip_serializing_if = "Vec::is_empty")]
    pub finally_steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewers: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated: Option<bool>,
}

impl Step {
    /// Step identity within its containing array: the declared name, or
    /// `{action}-{1-based-index}` when absent.
    pub fn resolved_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}-{}", self.action, index + 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
}

impl InputType {
    pub fn as_str(self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
        }
    }

    pub fn zero_value(self) -> Value {
        match self {
            InputType::String => Value::String(String::new()),
            InputType::Number => Value::from(0),
            InputType::Boolean => Value::Bool(false),
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl DeclaredType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeclaredType::String => "string",
            DeclaredType::Number => "number",
            DeclaredType::Boolean => "boolean",
            DeclaredType::Object => "object",
            DeclaredType::Array => "array",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            DeclaredType::String => value.is_string(),
            DeclaredType::Number => value.is_number(),
            DeclaredType::Boolean => value.is_boolean(),
            DeclaredType::Object => value.is_object(),
            DeclaredType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ValidationRule {
    Regex {
        pattern: String,
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
    StringLength {
        #[serde(default)]
        min: Option<u64>,
        #[serde(default)]
        max: Option<u64>,
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
    NumberRange {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
    Custom {
        script: String,
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
}

impl ValidationRule {
    pub fn code(&self) -> &str {
        match self {
            ValidationRule::Regex { code, .. }
            | ValidationRule::StringLength { code, .. }
            | ValidationRule::NumberRange { code, .. }
            | ValidationRule::Custom { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ValidationRule::Regex { message, .. }
            | ValidationRule::StringLength { message, .. }
            | ValidationRule::NumberRange { message, .. }
            | ValidationRule::Custom { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    Stop,
    Suspend,
    Break,
    Inquire,
    Continue,
    SilentlyContinue,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub action: PolicyAction,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMap {
    pub default: PolicyRule,
    #[serde(flatten)]
    pub by_code: BTreeMap<String, PolicyRule>,
}

/// Either a bare action token (`errorPolicy: Continue`) or a per-code map
/// with a required `default` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPolicy {
    Token(PolicyAction),
    Map(PolicyMap),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSet {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub branches: Vec<String>,
}

impl ResourceSet {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.branches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchBlock {
    pub code: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Payload recorded by the `return` action: stop executing further steps and
/// succeed with these outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarlyReturn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}
