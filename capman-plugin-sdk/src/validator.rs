//! # Input Validation
//!
//! Pure validation of caller-provided inputs against a handler's input
//! definitions: alias mapping to canonical names, required-input checks,
//! and lossless type coercion. No I/O, no side effects; the same inputs
//! always produce the same result.

use crate::error::{ErrorCode, StructuredError};
use crate::manifest::IoDefinition;
use crate::models::{InputValue, ValueType};
use std::collections::HashMap;

const COMPONENT: &str = "validator";

/// Why validation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    /// A required input is absent after alias mapping.
    Missing,
    /// A provided value cannot be losslessly coerced to the declared type.
    Schema,
}

/// Outcome of [`validate_and_standardize_inputs`].
#[derive(Debug)]
pub struct ValidationResult {
    pub success: bool,
    /// Normalized inputs keyed by canonical name. Meaningful only on
    /// success.
    pub inputs: HashMap<String, InputValue>,
    pub error: Option<StructuredError>,
    pub failure: Option<ValidationFailure>,
}

impl ValidationResult {
    fn ok(inputs: HashMap<String, InputValue>) -> Self {
        Self {
            success: true,
            inputs,
            error: None,
            failure: None,
        }
    }

    fn fail(failure: ValidationFailure, error: StructuredError) -> Self {
        Self {
            success: false,
            inputs: HashMap::new(),
            error: Some(error),
            failure: Some(failure),
        }
    }
}

/// Validate `provided` against `definitions`.
///
/// Alias mapping happens first: a provided key matching a definition's
/// alias is rewritten to the canonical name, unless the canonical name was
/// also provided (the canonical entry wins). Unknown inputs pass through
/// verbatim. On success every `required` definition has a canonical-name
/// entry in the result.
pub fn validate_and_standardize_inputs(
    definitions: &[IoDefinition],
    provided: &HashMap<String, InputValue>,
    trace_id: &str,
) -> ValidationResult {
    let mut canonical: HashMap<String, InputValue> = HashMap::with_capacity(provided.len());

    for (key, value) in provided {
        let target = definitions
            .iter()
            .find(|d| d.aliases.iter().any(|a| a == key))
            .map(|d| d.name.as_str())
            .unwrap_or(key.as_str());
        // An explicitly-provided canonical key wins over an aliased one.
        if target != key && provided.contains_key(target) {
            continue;
        }
        let mut input = value.clone();
        input.input_name = target.to_string();
        canonical.insert(target.to_string(), input);
    }

    for def in definitions {
        match canonical.get_mut(&def.name) {
            None if def.required => {
                let error = StructuredError::report(
                    ErrorCode::InputValidationFailed,
                    COMPONENT,
                    format!("required input '{}' is missing", def.name),
                )
                .trace(trace_id)
                .with("input", serde_json::Value::String(def.name.clone()))
                .build();
                return ValidationResult::fail(ValidationFailure::Missing, error);
            }
            None => {}
            Some(input) => match coerce(&input.value, def.value_type) {
                Some(value) => {
                    input.value = value;
                    input.value_type = def.value_type;
                }
                None => {
                    let error = StructuredError::report(
                        ErrorCode::InputValidationFailed,
                        COMPONENT,
                        format!(
                            "input '{}' is not a {} and cannot be coerced to one",
                            def.name, def.value_type
                        ),
                    )
                    .trace(trace_id)
                    .with("input", serde_json::Value::String(def.name.clone()))
                    .with(
                        "expectedType",
                        serde_json::Value::String(def.value_type.to_string()),
                    )
                    .build();
                    return ValidationResult::fail(ValidationFailure::Schema, error);
                }
            },
        }
    }

    ValidationResult::ok(canonical)
}

/// Lossless coercion of `value` to `expected`, or `None` on an
/// irreversible mismatch.
fn coerce(value: &serde_json::Value, expected: ValueType) -> Option<serde_json::Value> {
    use serde_json::Value;

    match expected {
        ValueType::Any => Some(value.clone()),
        ValueType::String => match value {
            Value::String(_) => Some(value.clone()),
            _ => None,
        },
        ValueType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Some(Value::Number(i.into()))
                } else {
                    s.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                }
            }
            _ => None,
        },
        ValueType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ValueType::Object | ValueType::Plugin => match value {
            Value::Object(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
        ValueType::Array | ValueType::Plan => match value {
            Value::Array(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
        ValueType::Error => match value {
            Value::Object(_) | Value::String(_) => Some(value.clone()),
            _ => None,
        },
    }
}
