//! # Subprocess Strategy
//!
//! Spawns a handler as a language subprocess inside its bundle: the
//! interpreter comes from the bundle's virtual environment when one was
//! materialized, the full input set goes to the child as a JSON array of
//! `[name, inputValue]` pairs on stdin, and stdout must come back as a
//! JSON array of `PluginOutput`. Stderr is captured for diagnostics.
//!
//! Every spawn is reaped on every exit path: output capture is bounded,
//! the wall-clock deadline covers write-wait-read as a whole, and a child
//! that outlives the deadline is killed.

use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{PluginManifest, SubprocessRuntime};
use crate::models::{InputValue, PluginOutput};
use crate::registry::prepare::venv_interpreter;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

const COMPONENT: &str = "executor.subprocess";

/// Upper bound on captured stdout/stderr per stream.
const MAX_CAPTURE_BYTES: u64 = 8 * 1024 * 1024;

/// Stderr carried into error reports is clipped to this many characters.
const STDERR_REPORT_CHARS: usize = 2048;

pub async fn execute(
    manifest: &PluginManifest,
    runtime: &SubprocessRuntime,
    inputs: &HashMap<String, InputValue>,
    env: &HashMap<String, String>,
    bundle_root: &Path,
    deadline: Duration,
    trace_id: &str,
) -> EngineResult<Vec<PluginOutput>> {
    let entry = manifest.entry_point.as_ref().ok_or_else(|| {
        StructuredError::report(
            ErrorCode::PluginPreparationFailed,
            COMPONENT,
            format!("subprocess plugin {} has no entry point", manifest.id),
        )
        .trace(trace_id)
        .build()
    })?;

    let pairs: Vec<(&String, &InputValue)> = inputs.iter().collect();
    let payload = serde_json::to_vec(&pairs).map_err(|e| {
        StructuredError::report(ErrorCode::JsonParseError, COMPONENT, "input encoding failed")
            .trace(trace_id)
            .cause(e)
            .build()
    })?;

    let interpreter = venv_interpreter(bundle_root, &runtime.interpreter);
    let mut child = Command::new(&interpreter)
        .arg(&entry.main)
        .arg(bundle_root)
        .current_dir(bundle_root)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            StructuredError::report(
                ErrorCode::PluginExecutionFailed,
                COMPONENT,
                format!(
                    "failed to spawn {} for plugin {}",
                    interpreter.display(),
                    manifest.id
                ),
            )
            .trace(trace_id)
            .cause(e)
            .build()
        })?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let run = async {
        stdin.write_all(&payload).await?;
        // Close the pipe so the child sees EOF on stdin.
        drop(stdin);

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut out_limited = (&mut stdout).take(MAX_CAPTURE_BYTES);
        let mut err_limited = (&mut stderr).take(MAX_CAPTURE_BYTES);
        let (out_read, err_read) = tokio::join!(
            out_limited.read_to_end(&mut out),
            err_limited.read_to_end(&mut err),
        );
        out_read?;
        err_read?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out, err))
    };

    // On deadline the future is dropped and kill_on_drop reaps the child.
    let (status, out, err) = match tokio::time::timeout(deadline, run).await {
        Err(_) => {
            return Err(StructuredError::report(
                ErrorCode::PluginExecutionTimeout,
                COMPONENT,
                format!(
                    "plugin {} exceeded its {}s deadline and was killed",
                    manifest.id,
                    deadline.as_secs()
                ),
            )
            .trace(trace_id)
            .build())
        }
        Ok(Err(io_error)) => {
            return Err(StructuredError::report(
                ErrorCode::PluginExecutionFailed,
                COMPONENT,
                format!("subprocess I/O failed for plugin {}", manifest.id),
            )
            .trace(trace_id)
            .cause(io_error)
            .build())
        }
        Ok(Ok(result)) => result,
    };

    let stderr_text = clip(&String::from_utf8_lossy(&err));
    if !status.success() {
        return Err(StructuredError::report(
            ErrorCode::PluginExecutionFailed,
            COMPONENT,
            format!(
                "plugin {} exited with {}",
                manifest.id,
                status.code().map_or_else(|| "signal".to_string(), |c| c.to_string())
            ),
        )
        .trace(trace_id)
        .with("stderr", serde_json::Value::String(stderr_text))
        .build());
    }

    let outputs: Vec<PluginOutput> = serde_json::from_slice(&out).map_err(|e| {
        StructuredError::report(
            ErrorCode::PluginOutputMalformed,
            COMPONENT,
            format!(
                "plugin {} produced output that is not a PluginOutput array",
                manifest.id
            ),
        )
        .trace(trace_id)
        .cause(e)
        .with("stderr", serde_json::Value::String(stderr_text.clone()))
        .build()
    })?;

    if !stderr_text.is_empty() {
        tracing::debug!(plugin_id = %manifest.id, stderr = %stderr_text, "plugin diagnostics");
    }
    Ok(outputs)
}

fn clip(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_REPORT_CHARS {
        trimmed.to_string()
    } else {
        let mut end = STDERR_REPORT_CHARS;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}
