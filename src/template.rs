use crate::error::{CatalystError, ErrorCode};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(String),
}

/// Evaluates `${expr}` and `${{expr}}` references against a read-only scope.
/// Expressions are dotted paths (`user.id`, `items.0.name`); an unresolvable
/// reference raises `TemplateError`.
pub fn interpolate(template: &str, scope: &Map<String, Value>) -> Result<String, CatalystError> {
    let segments = scan(template)?;
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Expr(expr) => out.push_str(&stringify(&resolve(&expr, scope)?)),
        }
    }
    Ok(out)
}

/// Like `interpolate`, but a template that is exactly one expression yields
/// the referenced value itself, so numbers and objects survive substitution
/// into step configs.
pub fn interpolate_value(template: &str, scope: &Map<String, Value>) -> Result<Value, CatalystError> {
    let segments = scan(template)?;
    if let [Segment::Expr(expr)] = segments.as_slice() {
        return resolve(expr, scope);
    }
    interpolate(template, scope).map(Value::String)
}

pub fn interpolate_object(value: &Value, scope: &Map<String, Value>) -> Result<Value, CatalystError> {
    match value {
        Value::String(template) => interpolate_value(template, scope),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_object(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), interpolate_object(item, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Truthiness used by conditional steps. Strings are falsy only for
/// `"false"`, `""`, `"null"` and `"undefined"` (case-insensitive); `"0"` is
/// truthy. JSON `false` and `null` are falsy; numbers, arrays and objects
/// are truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => {
            let lowered = text.trim().to_ascii_lowercase();
            !matches!(lowered.as_str(), "false" | "" | "null" | "undefined")
        }
        Value::Number(_) | Value::Array(_) | Value::Object(_) => true,
    }
}

fn scan(template: &str) -> Result<Vec<Segment>, CatalystError> {
    let mut segments = Vec::new();
    let mut rest = template;
    loop {
        let Some(start) = rest.find("${") else {
            if !rest.is_empty() {
                segments.push(Segment::Literal(rest.to_string()));
            }
            break;
        };
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let (expr, consumed) = if let Some(inner) = after.strip_prefix('{') {
            let end = inner.find("}}").ok_or_else(|| unterminated(template))?;
            (&inner[..end], 3 + end + 2)
        } else {
            let end = after.find('}').ok_or_else(|| unterminated(template))?;
            (&after[..end], 2 + end + 1)
        };
        segments.push(Segment::Expr(expr.trim().to_string()));
        rest = &rest[start + consumed..];
    }
    Ok(segments)
}

fn resolve(expr: &str, scope: &Map<String, Value>) -> Result<Value, CatalystError> {
    if expr.is_empty() {
        return Err(CatalystError::new(
            ErrorCode::TemplateError,
            "empty expression in template",
        ));
    }
    let mut parts = expr.split('.');
    let head = parts.next().unwrap_or_default();
    let mut current = scope.get(head).ok_or_else(|| undefined(expr, head))?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part).ok_or_else(|| undefined(expr, part))?,
            Value::Array(items) => part
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index))
                .ok_or_else(|| undefined(expr, part))?,
            _ => return Err(undefined(expr, part)),
        };
    }
    Ok(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn undefined(expr: &str, part: &str) -> CatalystError {
    CatalystError::new(
        ErrorCode::TemplateError,
        format!("`{part}` is not defined while evaluating `${{{expr}}}`"),
    )
    .with_guidance("reference an input, a completed step name, or a variable set earlier in the run")
}

fn unterminated(template: &str) -> CatalystError {
    CatalystError::new(
        ErrorCode::TemplateError,
        format!("unterminated expression in template `{template}`"),
    )
}
