//! # MCP Remote Strategy
//!
//! Executes a verb against an MCP service. The service URL is not part of
//! the manifest; it is resolved from the environment as
//! `MCP_SERVICE_<NAME>_URL`, so deployments rebind services without
//! touching stored manifests. Inputs go out as one JSON object, and named
//! response fields map back to outputs through the manifest's output
//! definitions.

use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{McpConfig, PluginManifest};
use crate::models::{InputValue, PluginOutput, ValueType};
use std::collections::HashMap;
use std::time::Duration;

const COMPONENT: &str = "executor.mcp";

pub async fn execute(
    http: &reqwest::Client,
    manifest: &PluginManifest,
    mcp: &McpConfig,
    inputs: &HashMap<String, InputValue>,
    timeout: Duration,
    trace_id: &str,
) -> EngineResult<Vec<PluginOutput>> {
    let env_var = service_env_var(&mcp.service_name);
    let base_url = std::env::var(&env_var).map_err(|_| {
        StructuredError::report(
            ErrorCode::McpServiceNotConfigured,
            COMPONENT,
            format!(
                "MCP service {} is not configured; set {env_var}",
                mcp.service_name
            ),
        )
        .trace(trace_id)
        .build()
    })?;
    let url = format!("{}{}", base_url.trim_end_matches('/'), mcp.path);

    let payload: serde_json::Map<String, serde_json::Value> = inputs
        .iter()
        .filter(|(name, _)| !name.starts_with("__"))
        .map(|(name, input)| (name.clone(), input.value.clone()))
        .collect();

    let response = http
        .post(&url)
        .timeout(timeout)
        .json(&serde_json::Value::Object(payload))
        .send()
        .await
        .map_err(|e| {
            StructuredError::report(
                ErrorCode::PluginExecutionFailed,
                COMPONENT,
                format!("MCP request to {url} failed"),
            )
            .trace(trace_id)
            .cause(e)
            .build()
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(StructuredError::report(
            ErrorCode::PluginExecutionFailed,
            COMPONENT,
            format!("MCP service {} answered {status}", mcp.service_name),
        )
        .trace(trace_id)
        .build());
    }

    let body: serde_json::Value = response.json().await.map_err(|e| {
        StructuredError::report(
            ErrorCode::PluginOutputMalformed,
            COMPONENT,
            format!("MCP service {} returned unparseable JSON", mcp.service_name),
        )
        .trace(trace_id)
        .cause(e)
        .build()
    })?;

    // With output definitions, pick the named fields; without, hand back
    // the whole body as one output.
    if manifest.output_definitions.is_empty() {
        let result_type = ValueType::of(&body);
        return Ok(vec![PluginOutput::ok(
            "result",
            body,
            format!("response of MCP service {}", mcp.service_name),
        )
        .with_type(result_type)]);
    }

    let mut outputs = Vec::with_capacity(manifest.output_definitions.len());
    for definition in &manifest.output_definitions {
        match body.get(&definition.name) {
            Some(value) => {
                outputs.push(
                    PluginOutput::ok(
                        &definition.name,
                        value.clone(),
                        definition.description.clone(),
                    )
                    .with_type(definition.value_type),
                );
            }
            None if definition.required => {
                return Err(StructuredError::report(
                    ErrorCode::PluginOutputMalformed,
                    COMPONENT,
                    format!(
                        "MCP service {} response lacks required field {}",
                        mcp.service_name, definition.name
                    ),
                )
                .trace(trace_id)
                .build())
            }
            None => {}
        }
    }
    Ok(outputs)
}

/// `web-search` resolves through `MCP_SERVICE_WEB_SEARCH_URL`.
fn service_env_var(service_name: &str) -> String {
    let normalized: String = service_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MCP_SERVICE_{normalized}_URL")
}
