//! Argument validation against a JSON Schema subset.
//!
//! Supported keywords: `type`, `enum`, `const`, `properties`, `required`,
//! `additionalProperties`, `items`, `minItems`, `maxItems`, `minLength`,
//! `maxLength`, `pattern`, `minimum`, `maximum`, `exclusiveMinimum`,
//! `exclusiveMaximum`. Other keywords are ignored.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

/// One way an instance failed its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    /// Location in the instance, e.g. `$.reply_to` or `$.items[2]`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validates `instance` against `schema`.
///
/// # Errors
///
/// Returns every violation found, in document order.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), Vec<SchemaViolation>> {
    let mut violations = Vec::new();
    check(schema, instance, "$", &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Checks that a tool input schema describes an object.
///
/// # Errors
///
/// Returns a description of the problem.
pub fn check_tool_schema(schema: &Value) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Err("input schema must be a JSON object".to_string());
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("object") => {}
        _ => return Err("input schema must have \"type\": \"object\"".to_string()),
    }
    if let Some(pattern_error) = first_bad_pattern(schema) {
        return Err(pattern_error);
    }
    Ok(())
}

fn first_bad_pattern(schema: &Value) -> Option<String> {
    match schema {
        Value::Object(obj) => {
            if let Some(Value::String(pattern)) = obj.get("pattern") {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Some(format!("invalid pattern {pattern:?}: {e}"));
                }
            }
            obj.values().find_map(first_bad_pattern)
        }
        Value::Array(items) => items.iter().find_map(first_bad_pattern),
        _ => None,
    }
}

fn push(out: &mut Vec<SchemaViolation>, path: &str, message: impl Into<String>) {
    out.push(SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    });
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        "number" => value.is_number(),
        other => type_name(value) == other,
    }
}

fn check(schema: &Value, instance: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    let schema = match schema {
        Value::Bool(true) => return,
        Value::Bool(false) => {
            push(out, path, "no value is allowed here");
            return;
        }
        Value::Object(obj) => obj,
        _ => return,
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, instance)) {
            push(
                out,
                path,
                format!(
                    "expected {}, found {}",
                    allowed.join(" or "),
                    type_name(instance)
                ),
            );
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(instance) {
            push(out, path, format!("value must be one of {}", Value::Array(options.clone())));
        }
    }

    if let Some(expected) = schema.get("const") {
        if expected != instance {
            push(out, path, format!("value must equal {expected}"));
        }
    }

    match instance {
        Value::String(s) => check_string(schema, s, path, out),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                check_number(schema, f, path, out);
            }
        }
        Value::Object(obj) => check_object(schema, obj, path, out),
        Value::Array(items) => check_array(schema, items, path, out),
        Value::Null | Value::Bool(_) => {}
    }
}

fn check_string(schema: &Map<String, Value>, s: &str, path: &str, out: &mut Vec<SchemaViolation>) {
    let len = s.chars().count() as u64;

    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            push(out, path, format!("must be at least {min} characters"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            push(out, path, format!("must be at most {max} characters"));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        match regex::Regex::new(pattern) {
            Ok(re) if re.is_match(s) => {}
            Ok(_) => push(out, path, format!("does not match pattern {pattern:?}")),
            Err(_) => push(out, path, format!("schema pattern {pattern:?} is invalid")),
        }
    }
}

fn check_number(schema: &Map<String, Value>, n: f64, path: &str, out: &mut Vec<SchemaViolation>) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            push(out, path, format!("must be >= {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            push(out, path, format!("must be <= {max}"));
        }
    }
    if let Some(min) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
        if n <= min {
            push(out, path, format!("must be > {min}"));
        }
    }
    if let Some(max) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
        if n >= max {
            push(out, path, format!("must be < {max}"));
        }
    }
}

fn check_object(
    schema: &Map<String, Value>,
    obj: &Map<String, Value>,
    path: &str,
    out: &mut Vec<SchemaViolation>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(name) {
                push(out, &format!("{path}.{name}"), "is required");
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);

    for (name, value) in obj {
        let child = format!("{path}.{name}");
        match properties.and_then(|p| p.get(name)) {
            Some(sub) => check(sub, value, &child, out),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => push(out, &child, "is not an allowed property"),
                Some(sub @ Value::Object(_)) => check(sub, value, &child, out),
                _ => {}
            },
        }
    }
}

fn check_array(schema: &Map<String, Value>, items: &[Value], path: &str, out: &mut Vec<SchemaViolation>) {
    let len = items.len() as u64;

    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if len < min {
            push(out, path, format!("must have at least {min} items"));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if len > max {
            push(out, path, format!("must have at most {max} items"));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{path}[{i}]"), out);
        }
    }
}
