use crate::error::CatalystError;
use crate::playbook::types::{ErrorPolicy, PolicyAction, PolicyMap, PolicyRule};
use std::time::Duration;

/// Resolves the disposition for a failed step: bare tokens apply to every
/// error; maps look up the error code and fall back to `default`.
pub fn evaluate(error: &CatalystError, policy: &ErrorPolicy) -> PolicyAction {
    match policy {
        ErrorPolicy::Token(action) => *action,
        ErrorPolicy::Map(map) => rule_for(error, map).action,
    }
}

pub fn retry_count(error: &CatalystError, policy: &ErrorPolicy) -> u32 {
    match policy {
        ErrorPolicy::Token(_) => 0,
        ErrorPolicy::Map(map) => rule_for(error, map).retry_count,
    }
}

fn rule_for<'a>(error: &CatalystError, map: &'a PolicyMap) -> &'a PolicyRule {
    map.by_code
        .get(error.code.as_str())
        .unwrap_or(&map.default)
}

/// Sleep before the attempt after `completed_attempts` failures:
/// 1s, 4s, 9s, ... (k^2 seconds).
pub fn backoff_delay(completed_attempts: u32) -> Duration {
    let k = u64::from(completed_attempts);
    Duration::from_millis(k * k * 1000)
}

/// Runs `op` up to `retries + 1` times, sleeping the quadratic backoff
/// between attempts. The first success wins; the last failure is re-raised.
/// Re-execution side effects are the author's responsibility.
pub fn retry_with_backoff<T, F>(mut op: F, retries: u32) -> Result<T, CatalystError>
where
    F: FnMut() -> Result<T, CatalystError>,
{
    let mut last_error = match op() {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    for attempt in 1..=retries {
        std::thread::sleep(backoff_delay(attempt));
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => last_error = err,
        }
    }
    Err(last_error)
}
