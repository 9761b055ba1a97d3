use crate::engine::executor::StepExecutor;
use crate::error::{CatalystError, ErrorCode};
use crate::playbook::types::Step;
use serde_json::{Map, Value};

/// Result shape shared by every action. A populated `error` is treated as a
/// step failure even when the action returned normally.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub code: String,
    pub message: Option<String>,
    pub value: Option<Value>,
    pub error: Option<CatalystError>,
}

impl ActionOutcome {
    pub fn success(value: Option<Value>) -> Self {
        Self {
            code: "Success".to_string(),
            message: None,
            value,
            error: None,
        }
    }

    pub fn failure(error: CatalystError) -> Self {
        Self {
            code: error.code.as_str().to_string(),
            message: Some(error.message.clone()),
            value: None,
            error: Some(error),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A leaf action: receives its interpolated config, returns an outcome.
pub trait Action: Send + Sync {
    fn execute(&self, config: &Value) -> Result<ActionOutcome, CatalystError>;
}

/// A control-flow action that runs child steps through the engine-owned
/// step executor, keeping scope isolation and persistence in engine hands.
pub trait NestedAction: Send + Sync {
    fn execute(
        &self,
        config: &Value,
        executor: &mut StepExecutor<'_>,
    ) -> Result<ActionOutcome, CatalystError>;
}

fn config_object<'a>(
    config: &'a Value,
    code: ErrorCode,
    action: &str,
) -> Result<&'a Map<String, Value>, CatalystError> {
    config.as_object().ok_or_else(|| {
        CatalystError::new(code, format!("`{action}` config must be a mapping"))
    })
}

fn steps_field(
    raw: &Value,
    code: ErrorCode,
    action: &str,
    field: &str,
) -> Result<Vec<Step>, CatalystError> {
    serde_json::from_value(raw.clone()).map_err(|err| {
        CatalystError::new(
            code,
            format!("`{action}` config field `{field}` must be a list of steps"),
        )
        .caused_by_foreign(err)
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfConfig {
    pub condition: Value,
    pub then_steps: Vec<Step>,
    pub else_steps: Vec<Step>,
}

impl IfConfig {
    pub fn parse(config: &Value) -> Result<Self, CatalystError> {
        let object = config_object(config, ErrorCode::IfConfigInvalid, "if")?;
        let condition = object
            .get("condition")
            .cloned()
            .ok_or_else(|| {
                CatalystError::new(ErrorCode::IfConfigInvalid, "`if` config requires a `condition`")
            })?;
        let then_raw = object.get("then").ok_or_else(|| {
            CatalystError::new(ErrorCode::IfConfigInvalid, "`if` config requires a `then` block")
        })?;
        let then_steps = steps_field(then_raw, ErrorCode::IfConfigInvalid, "if", "then")?;
        let else_steps = match object.get("else") {
            Some(raw) => steps_field(raw, ErrorCode::IfConfigInvalid, "if", "else")?,
            None => Vec::new(),
        };
        Ok(Self {
            condition,
            then_steps,
            else_steps,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForEachConfig {
    pub items: Value,
    pub item_name: String,
    pub steps: Vec<Step>,
}

impl ForEachConfig {
    pub fn parse(config: &Value) -> Result<Self, CatalystError> {
        let object = config_object(config, ErrorCode::ForEachConfigInvalid, "for-each")?;
        let items = object.get("items").cloned().ok_or_else(|| {
            CatalystError::new(
                ErrorCode::ForEachConfigInvalid,
                "`for-each` config requires an `items` value",
            )
        })?;
        let steps_raw = object.get("steps").ok_or_else(|| {
            CatalystError::new(
                ErrorCode::ForEachConfigInvalid,
                "`for-each` config requires a `steps` list",
            )
        })?;
        let steps = steps_field(steps_raw, ErrorCode::ForEachConfigInvalid, "for-each", "steps")?;
        let item_name = match object.get("as") {
            None => "item".to_string(),
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(_) => {
                return Err(CatalystError::new(
                    ErrorCode::ForEachConfigInvalid,
                    "`for-each` config field `as` must be a non-empty string",
                ))
            }
        };
        Ok(Self {
            items,
            item_name,
            steps,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookCallConfig {
    pub name: String,
    pub inputs: Map<String, Value>,
}

impl PlaybookCallConfig {
    pub fn parse(config: &Value) -> Result<Self, CatalystError> {
        let object = config_object(config, ErrorCode::PlaybookRunConfigInvalid, "playbook")?;
        let name = match object.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
            _ => {
                return Err(CatalystError::new(
                    ErrorCode::PlaybookRunConfigInvalid,
                    "`playbook` config requires a non-empty `name`",
                ))
            }
        };
        let inputs = match object.get("inputs") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(inputs)) => inputs.clone(),
            Some(_) => {
                return Err(CatalystError::new(
                    ErrorCode::PlaybookRunConfigInvalid,
                    "`playbook` config field `inputs` must be a mapping",
                ))
            }
        };
        Ok(Self { name, inputs })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarConfig {
    pub name: String,
    pub value: Value,
}

impl VarConfig {
    pub fn parse(config: &Value) -> Result<Self, CatalystError> {
        let object = config_object(config, ErrorCode::VarConfigInvalid, "var")?;
        let name = match object.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
            _ => {
                return Err(CatalystError::new(
                    ErrorCode::VarConfigInvalid,
                    "`var` config requires a non-empty `name`",
                ))
            }
        };
        let value = object.get("value").cloned().ok_or_else(|| {
            CatalystError::new(ErrorCode::VarConfigInvalid, "`var` config requires a `value`")
        })?;
        Ok(Self { name, value })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnConfig {
    pub code: Option<String>,
    pub message: Option<String>,
    pub outputs: Map<String, Value>,
}

impl ReturnConfig {
    pub fn parse(config: &Value) -> Result<Self, CatalystError> {
        if config.is_null() {
            return Ok(Self {
                code: None,
                message: None,
                outputs: Map::new(),
            });
        }
        let object = config_object(config, ErrorCode::ReturnConfigInvalid, "return")?;
        let outputs = match object.get("outputs") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(outputs)) => outputs.clone(),
            Some(_) => {
                return Err(CatalystError::new(
                    ErrorCode::ReturnConfigInvalid,
                    "`return` config field `outputs` must be a mapping",
                ))
            }
        };
        Ok(Self {
            code: object.get("code").and_then(Value::as_str).map(str::to_string),
            message: object
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            outputs,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointConfig {
    pub message: String,
}

impl CheckpointConfig {
    pub fn parse(config: &Value) -> Result<Self, CatalystError> {
        let message = config
            .as_object()
            .and_then(|object| object.get("message"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if message.is_empty() {
            return Err(CatalystError::new(
                ErrorCode::CheckpointMessageRequired,
                "`checkpoint` config requires a non-empty `message`",
            )
            .with_guidance("describe what the approver should verify before resuming"));
        }
        Ok(Self {
            message: message.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrowConfig {
    pub code: String,
    pub message: Option<String>,
    pub guidance: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl ThrowConfig {
    pub fn parse(config: &Value) -> Result<Self, CatalystError> {
        let object = config_object(config, ErrorCode::ThrowConfigInvalid, "throw")?;
        let code = match object.get("code") {
            Some(Value::String(code)) if !code.trim().is_empty() => code.trim().to_string(),
            _ => {
                return Err(CatalystError::new(
                    ErrorCode::ThrowConfigInvalid,
                    "`throw` config requires a non-empty string `code`",
                ))
            }
        };
        let metadata = match object.get("metadata") {
            None | Some(Value::Null) => None,
            Some(Value::Object(metadata)) => Some(metadata.clone()),
            Some(_) => {
                return Err(CatalystError::new(
                    ErrorCode::ThrowConfigInvalid,
                    "`throw` config field `metadata` must be a mapping",
                ))
            }
        };
        Ok(Self {
            code,
            message: object
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            guidance: object
                .get("guidance")
                .and_then(Value::as_str)
                .map(str::to_string),
            metadata,
        })
    }
}
