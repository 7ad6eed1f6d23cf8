//! # Sandbox Strategy
//!
//! Runs a handler's entry-point source inside an in-process restricted
//! evaluator. The evaluator has no filesystem, network, or process access;
//! the only host surface is what the manifest's `allowed_apis` explicitly
//! grants, and `require` resolves nothing outside `allowed_modules`.
//!
//! The script sees a global `inputs` object (canonical name -> value) and
//! produces outputs by evaluating to either a `PluginOutput` array or a
//! plain value, which is wrapped into a single successful output.
//!
//! Evaluation happens on a blocking thread under a wall-clock timeout;
//! runaway scripts are additionally bounded by the evaluator's loop,
//! recursion, and stack limits derived from the manifest's sandbox
//! options.

use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{PluginManifest, SandboxLimits};
use crate::models::{InputValue, PluginOutput};
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsValue, NativeFunction, Source};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const COMPONENT: &str = "executor.sandbox";

/// Iterations any single loop may run before the evaluator aborts.
const LOOP_ITERATION_LIMIT: u64 = 2_000_000;

pub async fn execute(
    manifest: &PluginManifest,
    inputs: &HashMap<String, InputValue>,
    bundle_root: &Path,
    trace_id: &str,
) -> EngineResult<Vec<PluginOutput>> {
    let entry = manifest.entry_point.as_ref().ok_or_else(|| {
        StructuredError::report(
            ErrorCode::PluginPreparationFailed,
            COMPONENT,
            format!("sandbox plugin {} has no entry point", manifest.id),
        )
        .trace(trace_id)
        .build()
    })?;
    let path = bundle_root.join(&entry.main);
    let source = tokio::fs::read_to_string(&path).await.map_err(|e| {
        StructuredError::report(
            ErrorCode::PluginPreparationFailed,
            COMPONENT,
            format!("failed to read entry point {}", path.display()),
        )
        .trace(trace_id)
        .cause(e)
        .build()
    })?;

    let input_object: serde_json::Map<String, serde_json::Value> = inputs
        .iter()
        .map(|(name, input)| (name.clone(), input.value.clone()))
        .collect();
    let limits = manifest.security.sandbox.clone();
    let timeout = Duration::from_millis(limits.timeout_ms.max(1));
    let verb = manifest.verb.clone();

    let evaluation = tokio::task::spawn_blocking(move || {
        evaluate(&source, serde_json::Value::Object(input_object), &limits)
    });

    let raw = match tokio::time::timeout(timeout, evaluation).await {
        Err(_) => {
            return Err(StructuredError::report(
                ErrorCode::PluginExecutionTimeout,
                COMPONENT,
                format!("sandbox script for {verb} exceeded {}ms", limits_timeout(manifest)),
            )
            .trace(trace_id)
            .build())
        }
        Ok(Err(join_error)) => {
            return Err(StructuredError::report(
                ErrorCode::PluginExecutionFailed,
                COMPONENT,
                format!("sandbox evaluation task failed for {verb}"),
            )
            .trace(trace_id)
            .cause(join_error)
            .build())
        }
        Ok(Ok(Err(script_error))) => {
            return Err(StructuredError::report(
                ErrorCode::PluginExecutionFailed,
                COMPONENT,
                format!("sandbox script for {verb} failed: {script_error}"),
            )
            .trace(trace_id)
            .build())
        }
        Ok(Ok(Ok(value))) => value,
    };

    Ok(interpret_result(raw, &manifest.verb))
}

fn limits_timeout(manifest: &PluginManifest) -> u64 {
    manifest.security.sandbox.timeout_ms
}

/// Build a fresh evaluator, apply limits and the allowed-surface prelude,
/// and run the script to completion.
fn evaluate(
    source: &str,
    inputs: serde_json::Value,
    limits: &SandboxLimits,
) -> Result<serde_json::Value, String> {
    let mut context = Context::default();

    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
    context.runtime_limits_mut().set_recursion_limit(512);
    // The evaluator exposes no byte-accurate heap cap; the declared memory
    // budget bounds the value stack instead.
    let stack_limit = (limits.memory_bytes / 1024).clamp(1024, 1_048_576) as usize;
    context.runtime_limits_mut().set_stack_size_limit(stack_limit);

    let js_inputs =
        JsValue::from_json(&inputs, &mut context).map_err(|e| format!("inputs rejected: {e}"))?;
    context
        .register_global_property(js_string!("inputs"), js_inputs, Attribute::READONLY)
        .map_err(|e| format!("failed to install inputs: {e}"))?;

    let allowed_modules = serde_json::to_string(&limits.allowed_modules)
        .map_err(|e| format!("allowed module list rejected: {e}"))?;
    context
        .register_global_callable(
            js_string!("__host_log"),
            1,
            NativeFunction::from_fn_ptr(|_, args, context| {
                if let Some(first) = args.first() {
                    if let Ok(text) = first.to_string(context) {
                        tracing::debug!(target: "capman_plugin_sdk::sandbox", "{}", text.to_std_string_escaped());
                    }
                }
                Ok(JsValue::undefined())
            }),
        )
        .map_err(|e| format!("failed to install host log: {e}"))?;

    let console_wiring = if limits.allowed_apis.iter().any(|api| api == "console") {
        "const console = { log: __host_log, warn: __host_log, error: __host_log };"
    } else {
        ""
    };
    let prelude = format!(
        r#"
        const __allowedModules = Object.freeze({allowed_modules});
        function require(name) {{
            if (!__allowedModules.includes(name)) {{
                throw new Error("module '" + name + "' is not allowed in this sandbox");
            }}
            return Object.freeze({{}});
        }}
        {console_wiring}
        "#
    );
    context
        .eval(Source::from_bytes(prelude.as_bytes()))
        .map_err(|e| format!("sandbox prelude failed: {e}"))?;

    let result = context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| e.to_string())?;

    if result.is_undefined() || result.is_null() {
        return Ok(serde_json::Value::Null);
    }
    result
        .to_json(&mut context)
        .map_err(|e| format!("script result is not serializable: {e}"))
}

/// A `PluginOutput` array passes through; anything else becomes one
/// successful output named `result`.
fn interpret_result(value: serde_json::Value, verb: &str) -> Vec<PluginOutput> {
    if value.is_array() {
        if let Ok(outputs) = serde_json::from_value::<Vec<PluginOutput>>(value.clone()) {
            if !outputs.is_empty() {
                return outputs;
            }
        }
    }
    vec![PluginOutput::ok(
        "result",
        value,
        format!("result of {verb}"),
    )]
}
