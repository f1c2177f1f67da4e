//! Deep-merge semantics for device object values, plus the fan-timer
//! preservation rule applied before a merged value is committed.

use serde_json::Value;

/// Fields re-injected from the previous value when an active fan timer
/// would otherwise be clobbered by a partial update.
pub const FAN_TIMER_FIELDS: [&str; 5] = [
    "fan_timer_timeout",
    "fan_control_state",
    "fan_timer_duration",
    "fan_current_speed",
    "fan_mode",
];

/// Recursive per-key mapping merge. Non-mappings (scalars, sequences,
/// null) replace wholesale; sequences are never concatenated.
pub fn deep_merge(current: &Value, incoming: &Value) -> Value {
    match (current, incoming) {
        (Value::Object(cur), Value::Object(inc)) => {
            let mut out = cur.clone();
            for (key, inc_val) in inc {
                match out.get(key) {
                    Some(cur_val) => {
                        let merged = deep_merge(cur_val, inc_val);
                        out.insert(key.clone(), merged);
                    }
                    None => {
                        out.insert(key.clone(), inc_val.clone());
                    }
                }
            }
            Value::Object(out)
        }
        _ => incoming.clone(),
    }
}

/// True when `value` carries a fan timer that has not yet expired:
/// `fan_timer_timeout` is a non-zero number strictly greater than
/// `now_secs` (epoch seconds).
pub fn fan_timer_active(value: &Value, now_secs: i64) -> bool {
    match value.get("fan_timer_timeout").and_then(Value::as_f64) {
        Some(timeout) => timeout != 0.0 && timeout > now_secs as f64,
        None => false,
    }
}

/// True when the incoming payload explicitly turns the fan off, either by
/// setting `fan_timer_timeout` to literal `0` or `fan_control_state` to
/// literal `false`. Explicit fan-off defeats preservation.
pub fn is_explicit_fan_off(incoming: &Value) -> bool {
    if let Some(timeout) = incoming.get("fan_timer_timeout").and_then(Value::as_f64) {
        if timeout == 0.0 {
            return true;
        }
    }
    matches!(
        incoming.get("fan_control_state"),
        Some(Value::Bool(false))
    )
}

/// Copy the fan-timer fields from `existing` over `merged`. Only the five
/// fan fields are overwritten; everything else in `merged` stands.
pub fn preserve_fan_timer(existing: &Value, merged: &mut Value) {
    let Value::Object(out) = merged else { return };
    for field in FAN_TIMER_FIELDS {
        if let Some(prev) = existing.get(field) {
            out.insert(field.to_string(), prev.clone());
        }
    }
}

/// The `«type»` half of an `«type».«id»` object key.
pub fn key_type(object_key: &str) -> &str {
    object_key
        .split_once('.')
        .map(|(t, _)| t)
        .unwrap_or(object_key)
}
