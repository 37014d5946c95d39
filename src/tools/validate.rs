//! Argument checks against the subset of JSON schema tools declare:
//! `required` and shallow `type`.

use serde_json::Value;

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Numeric declarations accept any number; unknown declarations accept anything.
fn matches_type(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" | "number" => value.is_number(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// A `type` may be a single name or a list of alternatives
fn matches_declared(declared: &Value, value: &Value) -> bool {
    match declared {
        Value::String(name) => matches_type(name, value),
        Value::Array(names) => {
            names.is_empty()
                || names
                    .iter()
                    .any(|n| n.as_str().map_or(true, |name| matches_type(name, value)))
        }
        _ => true,
    }
}

/// Check `args` against `schema`. Returns the first violation.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    // absent arguments are an empty object
    let no_args = Value::Object(serde_json::Map::new());
    let args = if args.is_null() { &no_args } else { args };

    if let Some(declared) = schema.get("type") {
        if !matches_declared(declared, args) {
            return Err(format!("arguments must be {}, got {}", declared, type_name(args)));
        }
    }

    let empty = serde_json::Map::new();
    let fields = args.as_object().unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                return Err(format!("missing required argument '{}'", name));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in fields {
            let Some(declared) = properties.get(name).and_then(|p| p.get("type")) else {
                continue;
            };
            if !matches_declared(declared, value) {
                return Err(format!(
                    "argument '{}' must be {}, got {}",
                    name,
                    declared,
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}
