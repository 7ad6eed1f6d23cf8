//! # Execution Data Model
//!
//! Wire-level types shared by the registry, the executor, and the service
//! surface: the step a caller submits, the typed input values a handler
//! receives, and the `PluginOutput` list every execution path produces.
//!
//! ## Conventions
//!
//! All types serialize with camelCase field names, matching the JSON the
//! HTTP surface and the subprocess stdin/stdout contract exchange. A step's
//! `input_values` map is keyed by canonical input name after alias mapping;
//! unknown keys are preserved verbatim.
//!
//! ## Output contract
//!
//! Every execution, successful or not, yields a `Vec<PluginOutput>`.
//! Failures are a single-element list with `success = false`,
//! `result_type = Error` and the structured error in `result`, so callers
//! can always inspect `error_code` without branching on transport shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The closed set of value types inputs and outputs can carry.
///
/// `Plan` and `Plugin` are produced by the meta-handler for unknown verbs:
/// a plan is a sequence of sub-steps, a plugin is a request to synthesize a
/// new handler. `Any` disables type coercion for that definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Plan,
    Plugin,
    Error,
    Any,
}

impl ValueType {
    /// Infer the closest value type for a raw JSON value.
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(_) => ValueType::String,
            serde_json::Value::Number(_) => ValueType::Number,
            serde_json::Value::Bool(_) => ValueType::Boolean,
            serde_json::Value::Array(_) => ValueType::Array,
            serde_json::Value::Object(_) => ValueType::Object,
            serde_json::Value::Null => ValueType::Any,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Plan => "plan",
            ValueType::Plugin => "plugin",
            ValueType::Error => "error",
            ValueType::Any => "any",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed input as the executor hands it to a handler.
///
/// Produced by the validator from the caller's raw map: `input_name` is the
/// canonical name after alias mapping, `value_type` the (possibly coerced)
/// type, and `args` free-form per-input arguments some handlers accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValue {
    pub input_name: String,
    pub value: serde_json::Value,
    pub value_type: ValueType,
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
}

impl InputValue {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        let value_type = ValueType::of(&value);
        Self {
            input_name: name.into(),
            value,
            value_type,
            args: HashMap::new(),
        }
    }
}

/// Reference to an exact plugin version, overriding verb-based resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDetails {
    pub plugin_id: String,
    pub plugin_version: String,
}

/// One unit of work submitted to `executeAction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub action_verb: String,
    #[serde(default)]
    pub input_values: HashMap<String, InputValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_details: Option<PluginDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Step {
    pub fn new(action_verb: impl Into<String>) -> Self {
        Self {
            action_verb: action_verb.into(),
            input_values: HashMap::new(),
            plugin_details: None,
            trace_id: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        let name = name.into();
        self.input_values
            .insert(name.clone(), InputValue::new(name, value));
        self
    }
}

/// One named result a handler produced.
///
/// Failures inside execution collapse to a single output with
/// `success = false`, `result_type = Error` and the structured error as
/// `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginOutput {
    pub success: bool,
    pub name: String,
    pub result_type: ValueType,
    pub result: serde_json::Value,
    #[serde(default)]
    pub result_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl PluginOutput {
    /// A successful output with an inferred result type.
    pub fn ok(
        name: impl Into<String>,
        result: serde_json::Value,
        description: impl Into<String>,
    ) -> Self {
        let result_type = ValueType::of(&result);
        Self {
            success: true,
            name: name.into(),
            result_type,
            result,
            result_description: description.into(),
            error: None,
            mime_type: None,
            file_name: None,
        }
    }

    pub fn with_type(mut self, result_type: ValueType) -> Self {
        self.result_type = result_type;
        self
    }

    /// The sentinel returned for `internal` handlers; the caller resolves
    /// the verb itself.
    pub fn internal_verb() -> Self {
        Self {
            success: true,
            name: "internal_verb_detected".to_string(),
            result_type: ValueType::String,
            result: serde_json::Value::String("INTERNAL_VERB".to_string()),
            result_description: "Verb is handled by the caller".to_string(),
            error: None,
            mime_type: None,
            file_name: None,
        }
    }
}

/// One sub-step of a plan returned by the meta-handler for an unknown verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub number: u32,
    pub action_verb: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

/// Request body POSTed to a container handler's execution endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerExecutionRequest {
    pub inputs: HashMap<String, InputValue>,
    pub context: ContainerExecutionContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerExecutionContext {
    pub trace_id: String,
    pub plugin_id: String,
    pub version: String,
}

/// Response body a container handler returns from its execution endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerExecutionResponse {
    pub success: bool,
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the host offers plugins, checked against manifest compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapabilities {
    pub host_version: semver::Version,
    pub host_app_name: String,
}

impl HostCapabilities {
    pub fn new(host_version: semver::Version, host_app_name: impl Into<String>) -> Self {
        Self {
            host_version,
            host_app_name: host_app_name.into(),
        }
    }
}
