use crate::error::{CatalystError, ErrorCode};
use crate::playbook::types::{DeclaredType, InputParameter, Playbook, Step, ValidationRule};
use crate::template;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Structural checks on a playbook definition. Every defect is collected so
/// the author sees the whole list in one `PlaybookNotValid` failure.
pub fn validate_playbook_structure(playbook: &Playbook) -> Result<(), CatalystError> {
    let mut defects = Vec::new();

    if playbook.name.trim().is_empty() {
        defects.push("`name` is missing".to_string());
    }
    if playbook.description.trim().is_empty() {
        defects.push("`description` is missing".to_string());
    }
    if playbook.owner.trim().is_empty() {
        defects.push("`owner` is missing".to_string());
    }
    if playbook.steps.is_empty() {
        defects.push("`steps` must contain at least one step".to_string());
    }

    collect_step_defects("steps", &playbook.steps, &mut defects);
    for (index, block) in playbook.catch.iter().enumerate() {
        if block.code.trim().is_empty() {
            defects.push(format!("catch block {} is missing a `code`", index + 1));
        }
        collect_step_defects(&format!("catch[{}].steps", block.code), &block.steps, &mut defects);
    }
    collect_step_defects("finally", &playbook.finally_steps, &mut defects);

    if defects.is_empty() {
        Ok(())
    } else {
        Err(CatalystError::new(
            ErrorCode::PlaybookNotValid,
            format!(
                "playbook `{}` is not valid: {}",
                playbook.name,
                defects.join("; ")
            ),
        )
        .with_guidance("fix the listed defects in the playbook definition"))
    }
}

fn collect_step_defects(location: &str, steps: &[Step], defects: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for (index, step) in steps.iter().enumerate() {
        if step.action.trim().is_empty() {
            defects.push(format!("{location}[{}] is missing an `action`", index + 1));
        }
        let name = step.resolved_name(index);
        if !seen.insert(name.clone()) {
            defects.push(format!("{location} contains duplicate step name `{name}`"));
        }
    }
}

/// Coerces raw input values toward their declared types. Unconvertible
/// values pass through unchanged so `validate_inputs` reports them.
/// Idempotent: coercing a coerced map is a no-op.
pub fn coerce_inputs(inputs: &Map<String, Value>, parameters: &[InputParameter]) -> Map<String, Value> {
    let mut out = inputs.clone();
    for parameter in parameters {
        if let Some(value) = out.get(&parameter.name) {
            let coerced = coerce_value(value, parameter);
            out.insert(parameter.name.clone(), coerced);
        }
    }
    out
}

fn coerce_value(value: &Value, parameter: &InputParameter) -> Value {
    use crate::playbook::types::InputType;
    match (parameter.param_type, value) {
        (InputType::Number, Value::String(raw)) => {
            let trimmed = raw.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                return Value::Number(Number::from(int));
            }
            if let Ok(float) = trimmed.parse::<f64>() {
                if let Some(number) = Number::from_f64(float) {
                    return Value::Number(number);
                }
            }
            value.clone()
        }
        (InputType::Boolean, Value::String(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Fills missing or null inputs: explicit defaults first, then the type's
/// zero value for non-required parameters. Required parameters without a
/// default stay absent so validation fails. Idempotent.
pub fn apply_defaults(inputs: &Map<String, Value>, parameters: &[InputParameter]) -> Map<String, Value> {
    let mut out = inputs.clone();
    for parameter in parameters {
        let missing = match out.get(&parameter.name) {
            None => true,
            Some(Value::Null) => true,
            Some(_) => false,
        };
        if !missing {
            continue;
        }
        if let Some(default) = &parameter.default {
            out.insert(parameter.name.clone(), default.clone());
        } else if !parameter.required {
            out.insert(parameter.name.clone(), parameter.param_type.zero_value());
        } else {
            out.remove(&parameter.name);
        }
    }
    out
}

pub fn validate_inputs(
    inputs: &Map<String, Value>,
    parameters: &[InputParameter],
) -> Result<(), CatalystError> {
    let mut defects = Vec::new();

    for parameter in parameters {
        let Some(value) = inputs.get(&parameter.name) else {
            if parameter.required {
                defects.push(format!("required input `{}` is missing", parameter.name));
            }
            continue;
        };

        if !parameter.param_type.matches(value) {
            defects.push(format!(
                "input `{}` must be a {}, got `{}`",
                parameter.name,
                parameter.param_type.as_str(),
                value
            ));
            continue;
        }

        if let Some(allowed) = &parameter.allowed {
            if !allowed.contains(value) {
                defects.push(format!(
                    "input `{}` must be one of {:?}, got `{}`",
                    parameter.name, allowed, value
                ));
                continue;
            }
        }

        for rule in &parameter.validation {
            if let Some(defect) = apply_rule(rule, &parameter.name, value, inputs) {
                defects.push(defect);
            }
        }
    }

    if defects.is_empty() {
        Ok(())
    } else {
        Err(CatalystError::new(
            ErrorCode::InputValidationFailed,
            format!("input validation failed: {}", defects.join("; ")),
        )
        .with_guidance("supply the listed inputs with values matching their declarations"))
    }
}

fn apply_rule(
    rule: &ValidationRule,
    input_name: &str,
    value: &Value,
    inputs: &Map<String, Value>,
) -> Option<String> {
    let failed = match rule {
        ValidationRule::Regex { pattern, .. } => match regex::Regex::new(pattern) {
            Ok(regex) => match value.as_str() {
                Some(text) => !regex.is_match(text),
                None => true,
            },
            Err(err) => {
                return Some(format!(
                    "input `{input_name}` has an invalid regex pattern `{pattern}`: {err}"
                ))
            }
        },
        ValidationRule::StringLength { min, max, .. } => match value.as_str() {
            Some(text) => {
                let length = text.chars().count() as u64;
                min.is_some_and(|min| length < min) || max.is_some_and(|max| length > max)
            }
            None => true,
        },
        ValidationRule::NumberRange { min, max, .. } => match value.as_f64() {
            Some(number) => {
                min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max)
            }
            None => true,
        },
        ValidationRule::Custom { script, .. } => {
            let mut scope = inputs.clone();
            scope.insert("value".to_string(), value.clone());
            match template::interpolate_value(script, &scope) {
                Ok(result) => !template::is_truthy(&result),
                Err(_) => true,
            }
        }
    };

    if !failed {
        return None;
    }
    let code = if rule.code().is_empty() {
        "ValidationRuleFailed"
    } else {
        rule.code()
    };
    let message = if rule.message().is_empty() {
        format!("input `{input_name}` failed a validation rule")
    } else {
        rule.message().to_string()
    };
    Some(format!("{code}: {message}"))
}

pub fn validate_outputs(
    declared: &BTreeMap<String, DeclaredType>,
    variables: &Map<String, Value>,
) -> Result<(), CatalystError> {
    let mut defects = Vec::new();
    for (name, declared_type) in declared {
        match variables.get(name) {
            None => defects.push(format!("declared output `{name}` was never produced")),
            Some(value) => {
                if !declared_type.matches(value) {
                    defects.push(format!(
                        "output `{name}` must be a {}, got `{value}`",
                        declared_type.as_str()
                    ));
                }
            }
        }
    }

    if defects.is_empty() {
        Ok(())
    } else {
        Err(CatalystError::new(
            ErrorCode::OutputValidationFailed,
            format!("output validation failed: {}", defects.join("; ")),
        )
        .with_guidance("ensure every declared output is assigned a value of the declared type"))
    }
}

pub fn extract_outputs(
    declared: &BTreeMap<String, DeclaredType>,
    variables: &Map<String, Value>,
) -> Map<String, Value> {
    let mut outputs = Map::new();
    for name in declared.keys() {
        if let Some(value) = variables.get(name) {
            outputs.insert(name.clone(), value.clone());
        }
    }
    outputs
}
