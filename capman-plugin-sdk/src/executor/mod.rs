//! # Plugin Executor
//!
//! Uniform entry point for running a resolved handler:
//! `execute(manifest, inputs, bundle_root, trace_id)` always returns a
//! `Vec<PluginOutput>`, folding every failure into a single-element list
//! with `success = false` and the structured error as the result.
//!
//! Non-remote handlers flow through a fixed pipeline before dispatch:
//! input validation, permission checks, credential loading, service-token
//! minting, and service-URL injection. Dispatch itself is a `match` on the
//! manifest's [`HandlerKind`]; each strategy lives in its own module.

pub mod mcp;
pub mod openapi;
pub mod sandbox;
pub mod subprocess;

use crate::container::ContainerManager;
use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{HandlerKind, PluginManifest};
use crate::models::{
    ContainerExecutionContext, ContainerExecutionRequest, InputValue, PluginOutput, ValueType,
};
use crate::validator::validate_and_standardize_inputs;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "executor";

/// Environment variable handlers read their own service token from.
pub const TOKEN_ENV: &str = "S7_CM_TOKEN";
/// Environment variable carrying the downstream reasoning-service token.
pub const BRAIN_TOKEN_ENV: &str = "S7_BRAIN_TOKEN";
/// Reserved input key mirroring [`TOKEN_ENV`].
pub const TOKEN_INPUT: &str = "__auth_token";
/// Reserved input key mirroring [`BRAIN_TOKEN_ENV`].
pub const BRAIN_TOKEN_INPUT: &str = "__brain_auth_token";

/// Mints short-lived service tokens for handler environments.
///
/// Minting is owned by the service deployment; the engine only consumes
/// this narrow interface.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    /// A token scoped to `audience` ("capman" for the caller-facing token,
    /// "brain" for the downstream one).
    async fn mint(&self, audience: &str) -> EngineResult<String>;
}

/// One named credential a plugin is configured with.
///
/// `reference` is indirect; `env:NAME` resolves from the process
/// environment at execution time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    pub name: String,
    pub reference: String,
}

impl CredentialRef {
    /// Resolve the reference to its secret value, or `None` when the
    /// referenced source is absent.
    pub fn resolve(&self) -> Option<String> {
        resolve_credential(&self.reference)
    }
}

/// `env:NAME` references read the process environment; anything else is
/// taken literally.
pub fn resolve_credential(reference: &str) -> Option<String> {
    match reference.strip_prefix("env:") {
        Some(var) => std::env::var(var).ok(),
        None => Some(reference.to_string()),
    }
}

/// Per-plugin configuration lookup (credential list).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials_for(&self, plugin_id: &str) -> EngineResult<Vec<CredentialRef>>;
}

/// A store with no credentials for anyone.
pub struct NoCredentials;

#[async_trait]
impl CredentialStore for NoCredentials {
    async fn credentials_for(&self, _plugin_id: &str) -> EngineResult<Vec<CredentialRef>> {
        Ok(Vec::new())
    }
}

/// Service URLs and identity injected into handler inputs, plus default
/// deadlines per strategy family.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub postoffice_url: String,
    pub brain_url: String,
    pub librarian_url: String,
    pub mission_control_url: String,
    pub mission_id: String,
    /// Deadline for sandbox and subprocess scripts.
    pub script_timeout: Duration,
    /// Deadline for remote HTTP and MCP calls.
    pub remote_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            postoffice_url: String::new(),
            brain_url: String::new(),
            librarian_url: String::new(),
            mission_control_url: String::new(),
            mission_id: String::new(),
            script_timeout: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs resolved handlers. Holds the container manager for
/// container-language handlers; everything else is stateless per call.
pub struct PluginExecutor {
    containers: Arc<ContainerManager>,
    tokens: Arc<dyn TokenMinter>,
    credentials: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    config: ExecutorConfig,
}

impl PluginExecutor {
    pub fn new(
        containers: Arc<ContainerManager>,
        tokens: Arc<dyn TokenMinter>,
        credentials: Arc<dyn CredentialStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            containers,
            tokens,
            credentials,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Execute `manifest` with `inputs` from `bundle_root`.
    ///
    /// Never returns `Err`; failures become the single-element failure
    /// list so every caller sees one output shape.
    pub async fn execute(
        &self,
        manifest: &PluginManifest,
        inputs: HashMap<String, InputValue>,
        bundle_root: &Path,
        trace_id: &str,
    ) -> Vec<PluginOutput> {
        match self.run(manifest, inputs, bundle_root, trace_id).await {
            Ok(outputs) => outputs,
            Err(error) => {
                tracing::error!(
                    plugin_id = %manifest.id,
                    verb = %manifest.verb,
                    trace_id,
                    error = %error,
                    "plugin execution failed"
                );
                failure_outputs(error)
            }
        }
    }

    async fn run(
        &self,
        manifest: &PluginManifest,
        inputs: HashMap<String, InputValue>,
        bundle_root: &Path,
        trace_id: &str,
    ) -> EngineResult<Vec<PluginOutput>> {
        if matches!(manifest.handler, HandlerKind::Internal) {
            return Ok(vec![PluginOutput::internal_verb()]);
        }

        // Remote handlers run on someone else's infrastructure; the local
        // pipeline (permissions, credentials-as-env, tokens) does not
        // apply to them.
        if manifest.handler.is_remote() {
            return match &manifest.handler {
                HandlerKind::OpenApi { api } => {
                    openapi::execute(
                        &self.http,
                        manifest,
                        api,
                        &inputs,
                        self.config.remote_timeout,
                        trace_id,
                    )
                    .await
                }
                HandlerKind::Mcp { mcp } => {
                    mcp::execute(
                        &self.http,
                        manifest,
                        mcp,
                        &inputs,
                        self.config.remote_timeout,
                        trace_id,
                    )
                    .await
                }
                _ => unreachable!("is_remote covers exactly the remote variants"),
            };
        }

        // 1. Validate and standardize inputs.
        let validated = validate_and_standardize_inputs(
            &manifest.input_definitions,
            &inputs,
            trace_id,
        );
        let mut inputs = if validated.success {
            validated.inputs
        } else {
            let cause = validated
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "input validation failed".to_string());
            return Err(StructuredError::report(
                ErrorCode::InvalidInput,
                COMPONENT,
                format!("inputs rejected for verb {}: {cause}", manifest.verb),
            )
            .trace(trace_id)
            .build());
        };

        // 2. Permissions against the allow-list.
        let disallowed = manifest.disallowed_permissions();
        if !disallowed.is_empty() {
            return Err(StructuredError::report(
                ErrorCode::PluginPermissionValidationFailed,
                COMPONENT,
                format!(
                    "plugin {} requires disallowed permissions: {}",
                    manifest.id,
                    disallowed.join(", ")
                ),
            )
            .trace(trace_id)
            .build());
        }
        for permission in manifest.dangerous_permissions() {
            tracing::warn!(
                plugin_id = %manifest.id,
                permission,
                "executing plugin with a dangerous permission"
            );
        }

        // 3. Per-plugin credentials resolve into the handler environment.
        let mut env = HashMap::new();
        for credential in self.credentials.credentials_for(&manifest.id).await? {
            match credential.resolve() {
                Some(value) => {
                    env.insert(credential.name.clone(), value);
                }
                None => tracing::warn!(
                    plugin_id = %manifest.id,
                    credential = %credential.name,
                    "credential reference did not resolve"
                ),
            }
        }

        // 4. Service tokens, as environment and as reserved inputs.
        let token = self.tokens.mint("capman").await?;
        let brain_token = self.tokens.mint("brain").await?;
        env.insert(TOKEN_ENV.to_string(), token.clone());
        env.insert(BRAIN_TOKEN_ENV.to_string(), brain_token.clone());
        inputs.insert(
            TOKEN_INPUT.to_string(),
            InputValue::new(TOKEN_INPUT, serde_json::Value::String(token)),
        );
        inputs.insert(
            BRAIN_TOKEN_INPUT.to_string(),
            InputValue::new(BRAIN_TOKEN_INPUT, serde_json::Value::String(brain_token)),
        );

        // 5. Service URLs and mission identity, only where the caller did
        // not already pass them.
        for (key, value) in [
            ("postoffice_url", &self.config.postoffice_url),
            ("brain_url", &self.config.brain_url),
            ("librarian_url", &self.config.librarian_url),
            ("missioncontrol_url", &self.config.mission_control_url),
            ("mission_id", &self.config.mission_id),
        ] {
            if !value.is_empty() && !inputs.contains_key(key) {
                inputs.insert(
                    key.to_string(),
                    InputValue::new(key, serde_json::Value::String(value.clone())),
                );
            }
        }

        // 6. Dispatch on the language tag.
        match &manifest.handler {
            HandlerKind::SandboxScript => {
                sandbox::execute(manifest, &inputs, bundle_root, trace_id).await
            }
            HandlerKind::SubprocessScript { runtime } => {
                subprocess::execute(
                    manifest,
                    runtime,
                    &inputs,
                    &env,
                    bundle_root,
                    self.config.script_timeout,
                    trace_id,
                )
                .await
            }
            HandlerKind::Container { container } => {
                self.execute_container(manifest, container, inputs, env, bundle_root, trace_id)
                    .await
            }
            HandlerKind::OpenApi { .. } | HandlerKind::Mcp { .. } | HandlerKind::Internal => {
                unreachable!("handled before the pipeline")
            }
        }
    }

    /// Container handlers: build, start, execute, and stop on every exit
    /// path.
    async fn execute_container(
        &self,
        manifest: &PluginManifest,
        config: &crate::manifest::ContainerConfig,
        inputs: HashMap<String, InputValue>,
        env: HashMap<String, String>,
        bundle_root: &Path,
        trace_id: &str,
    ) -> EngineResult<Vec<PluginOutput>> {
        self.containers.build_image(config, bundle_root).await?;
        let instance = self.containers.start(&manifest.id, config, &env).await?;

        let request = ContainerExecutionRequest {
            inputs,
            context: ContainerExecutionContext {
                trace_id: trace_id.to_string(),
                plugin_id: manifest.id.clone(),
                version: manifest.version.to_string(),
            },
        };
        let deadline = Duration::from_secs(config.execution_timeout_secs.max(1));
        let result = self
            .containers
            .execute(&instance.instance_id, config, &request, deadline)
            .await;

        // The stop must run whether execute succeeded or not.
        if let Err(e) = self.containers.stop(&instance.instance_id).await {
            tracing::warn!(
                instance_id = %instance.instance_id,
                error = %e,
                "container stop after execution failed"
            );
        }

        let result = result?;
        if !result.success {
            return Err(StructuredError::report(
                ErrorCode::ContainerExecutionFailed,
                COMPONENT,
                result
                    .error
                    .unwrap_or_else(|| "container reported failure".to_string()),
            )
            .trace(trace_id)
            .with("pluginId", serde_json::Value::String(manifest.id.clone()))
            .build());
        }

        let mut outputs: Vec<PluginOutput> = result
            .outputs
            .into_iter()
            .map(|(name, value)| {
                PluginOutput::ok(name, value, format!("output of {}", manifest.verb))
            })
            .collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));
        outputs.push(
            PluginOutput::ok(
                "executionTime",
                serde_json::json!(result.execution_time.as_millis() as u64),
                "container execution time in milliseconds",
            )
            .with_type(ValueType::Number),
        );
        Ok(outputs)
    }
}

/// The single-element failure list every error collapses to.
pub fn failure_outputs(error: StructuredError) -> Vec<PluginOutput> {
    let message = error.message.clone();
    let name = error.code.as_str().to_string();
    let result = serde_json::to_value(&error).unwrap_or_else(|_| {
        serde_json::Value::String(message.clone())
    });
    vec![PluginOutput {
        success: false,
        name,
        result_type: ValueType::Error,
        result,
        result_description: message.clone(),
        error: Some(message),
        mime_type: None,
        file_name: None,
    }]
}
