use crate::error::{CatalystError, ErrorCode};
use crate::playbook::types::Playbook;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-action metadata the YAML surface needs: which config key a shorthand
/// scalar maps to, and which config keys hold nested step lists that must be
/// transformed recursively.
#[derive(Debug, Clone, Default)]
pub struct ShorthandRules {
    primary: BTreeMap<String, String>,
    nested: BTreeMap<String, Vec<String>>,
}

impl ShorthandRules {
    pub fn builtin() -> Self {
        Self::default()
            .with_action("if", Some("condition"), &["then", "else"])
            .with_action("for-each", Some("items"), &["steps"])
            .with_action("playbook", Some("name"), &[])
            .with_action("checkpoint", Some("message"), &[])
            .with_action("throw", Some("code"), &[])
            .with_action("var", None, &[])
            .with_action("return", None, &[])
    }

    pub fn with_action(
        mut self,
        action: &str,
        primary_property: Option<&str>,
        nested_step_properties: &[&str],
    ) -> Self {
        if let Some(primary) = primary_property {
            self.primary.insert(action.to_string(), primary.to_string());
        }
        if !nested_step_properties.is_empty() {
            self.nested.insert(
                action.to_string(),
                nested_step_properties.iter().map(|v| v.to_string()).collect(),
            );
        }
        self
    }

    fn primary_property(&self, action: &str) -> Option<&str> {
        self.primary.get(action).map(String::as_str)
    }

    fn nested_step_properties(&self, action: &str) -> &[String] {
        self.nested.get(action).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Transforms a YAML document into a playbook, normalizing the
/// `<action-type>: value` step shorthand into the explicit
/// `{action, config}` form.
pub fn playbook_from_yaml_str(raw: &str, rules: &ShorthandRules) -> Result<Playbook, CatalystError> {
    let document: Value = serde_yaml::from_str(raw).map_err(|err| {
        CatalystError::new(
            ErrorCode::InvalidPlaybookConfig,
            format!("playbook document is not valid yaml: {err}"),
        )
    })?;
    let Value::Object(mut document) = document else {
        return Err(CatalystError::new(
            ErrorCode::InvalidPlaybookConfig,
            "playbook document must be a mapping",
        ));
    };

    for key in ["steps", "finally"] {
        if let Some(steps) = document.remove(key) {
            document.insert(key.to_string(), transform_step_list(steps, rules)?);
        }
    }
    if let Some(Value::Array(blocks)) = document.remove("catch") {
        let mut transformed = Vec::with_capacity(blocks.len());
        for block in blocks {
            let Value::Object(mut block) = block else {
                return Err(invalid("catch entries must be mappings"));
            };
            if let Some(steps) = block.remove("steps") {
                block.insert("steps".to_string(), transform_step_list(steps, rules)?);
            }
            transformed.push(Value::Object(block));
        }
        document.insert("catch".to_string(), Value::Array(transformed));
    }

    serde_json::from_value(Value::Object(document)).map_err(|err| {
        CatalystError::new(
            ErrorCode::InvalidPlaybookConfig,
            format!("playbook document does not match the expected shape: {err}"),
        )
    })
}

fn transform_step_list(steps: Value, rules: &ShorthandRules) -> Result<Value, CatalystError> {
    let Value::Array(steps) = steps else {
        return Err(invalid("step lists must be sequences"));
    };
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        out.push(transform_step(step, rules)?);
    }
    Ok(Value::Array(out))
}

fn transform_step(step: Value, rules: &ShorthandRules) -> Result<Value, CatalystError> {
    let Value::Object(mut step) = step else {
        return Err(invalid("each step must be a mapping"));
    };

    if step.contains_key("action") {
        let action = step
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(config) = step.remove("config") {
            step.insert(
                "config".to_string(),
                transform_nested_config(&action, config, rules)?,
            );
        }
        return Ok(Value::Object(step));
    }

    let carried = ["name", "errorPolicy", "isolated"];
    let action_keys: Vec<String> = step
        .keys()
        .filter(|key| !carried.contains(&key.as_str()))
        .cloned()
        .collect();
    let [action] = action_keys.as_slice() else {
        return Err(invalid(
            "shorthand steps must use exactly one `<action-type>: value` entry",
        ));
    };
    let action = action.clone();
    let payload = step.remove(&action).unwrap_or(Value::Null);

    let config = match payload {
        Value::Object(_) => transform_nested_config(&action, payload, rules)?,
        Value::Null => Value::Object(Map::new()),
        scalar => {
            let Some(primary) = rules.primary_property(&action) else {
                return Err(invalid(&format!(
                    "action `{action}` does not accept the scalar shorthand form"
                )));
            };
            let mut config = Map::new();
            config.insert(primary.to_string(), scalar);
            Value::Object(config)
        }
    };

    let mut out = Map::new();
    out.insert("action".to_string(), Value::String(action));
    out.insert("config".to_string(), config);
    for key in carried {
        if let Some(value) = step.remove(key) {
            out.insert(key.to_string(), value);
        }
    }
    Ok(Value::Object(out))
}

fn transform_nested_config(
    action: &str,
    config: Value,
    rules: &ShorthandRules,
) -> Result<Value, CatalystError> {
    let Value::Object(mut config) = config else {
        return Ok(config);
    };
    for property in rules.nested_step_properties(action) {
        if let Some(value) = config.remove(property) {
            let transformed = match value {
                steps @ Value::Array(_) => transform_step_list(steps, rules)?,
                other => other,
            };
            config.insert(property.clone(), transformed);
        }
    }
    Ok(Value::Object(config))
}

fn invalid(message: &str) -> CatalystError {
    CatalystError::new(ErrorCode::InvalidPlaybookConfig, message)
}
