use chrono::{DateTime, Utc};

pub fn is_kebab_case(value: &str) -> bool {
    if value.is_empty() || value.starts_with('-') || value.ends_with('-') || value.contains("--") {
        return false;
    }
    value
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
}

pub fn validate_kebab_identifier(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if is_kebab_case(value) {
        return Ok(());
    }
    Err(format!(
        "{kind} `{value}` must be kebab-case (lowercase ASCII letters, digits and single dashes)"
    ))
}

pub fn run_id_for(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S-%3f").to_string()
}
