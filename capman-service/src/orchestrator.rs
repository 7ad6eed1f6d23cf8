//! # Orchestrator
//!
//! Drives one `executeAction` step end to end: open an active operation,
//! resolve the verb to a compatible handler (or take the unknown-verb
//! path), validate inputs, materialize the bundle, execute, record usage,
//! and commit. Rollback releases exactly the resources commit would have
//! released, and both are idempotent.
//!
//! The orchestrator exclusively owns the active-operation table and the
//! resource-usage map; a periodic sweeper drops entries that have been
//! stale for longer than thirty minutes.

use crate::context::PluginContextManager;
use crate::workflow::UnknownVerbWorkflow;
use capman_plugin_sdk::error::{EngineResult, ErrorCode, StructuredError};
use capman_plugin_sdk::executor::{failure_outputs, PluginExecutor};
use capman_plugin_sdk::models::{HostCapabilities, PluginOutput, Step, ValueType};
use capman_plugin_sdk::registry::PluginRegistry;
use capman_plugin_sdk::validator::validate_and_standardize_inputs;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const COMPONENT: &str = "orchestrator";

/// Operations and resources untouched for this many minutes are swept.
pub const STALE_AFTER_MINUTES: i64 = 30;

/// How often the sweeper wakes up.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Caller-visible classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ValidationError,
    AuthenticationError,
    PluginExecutionError,
    UnknownVerb,
    BrainServiceError,
    JsonParseError,
    GenericError,
}

/// Classify a structured error: the code mapping always wins; only errors
/// without a mapped code fall back to message heuristics.
pub fn classify_error(error: &StructuredError) -> ErrorClass {
    use ErrorCode::*;
    let by_code = match error.code {
        InputValidationFailed | InvalidInput | PluginManifestInvalid
        | PluginSignatureInvalid | PluginPermissionValidationFailed => {
            Some(ErrorClass::ValidationError)
        }
        AuthenticationFailed | TokenMintFailed => Some(ErrorClass::AuthenticationError),
        PluginExecutionFailed | PluginExecutionTimeout | PluginOutputMalformed
        | UnsupportedLanguage | SandboxViolation | ContainerBuildFailed
        | ContainerStartFailed | ContainerHealthCheckFailed | ContainerExecutionFailed
        | ContainerStopFailed | NoAvailablePorts | PluginPreparationFailed | GitCloneFailed
        | DependencyInstallFailed => Some(ErrorClass::PluginExecutionError),
        PluginNotFound | PluginVersionNotFound | PluginNotCompatible
        | AccomplishPluginManifestNotFound => Some(ErrorClass::UnknownVerb),
        BrainServiceError => Some(ErrorClass::BrainServiceError),
        JsonParseError => Some(ErrorClass::JsonParseError),
        _ => None,
    };
    if let Some(class) = by_code {
        return class;
    }

    let message = error.message.to_lowercase();
    if message.contains("validation") || message.contains("invalid input") {
        ErrorClass::ValidationError
    } else if message.contains("auth") || message.contains("token") {
        ErrorClass::AuthenticationError
    } else if message.contains("brain") {
        ErrorClass::BrainServiceError
    } else if message.contains("json") || message.contains("parse") {
        ErrorClass::JsonParseError
    } else if message.contains("verb") || message.contains("not found") {
        ErrorClass::UnknownVerb
    } else if message.contains("execut") || message.contains("timeout") {
        ErrorClass::PluginExecutionError
    } else {
        ErrorClass::GenericError
    }
}

/// One in-flight `executeAction`.
#[derive(Debug, Clone)]
pub struct ActiveOperation {
    pub operation_id: String,
    pub trace_id: String,
    pub verb: String,
    pub started_at: DateTime<Utc>,
    pub resource_ids: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub in_use: bool,
    pub last_accessed: DateTime<Utc>,
}

pub struct Orchestrator {
    registry: Arc<PluginRegistry>,
    executor: Arc<PluginExecutor>,
    workflow: Arc<UnknownVerbWorkflow>,
    context: Arc<PluginContextManager>,
    host: HostCapabilities,
    operations: RwLock<HashMap<String, ActiveOperation>>,
    resources: RwLock<HashMap<String, ResourceRecord>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        executor: Arc<PluginExecutor>,
        workflow: Arc<UnknownVerbWorkflow>,
        context: Arc<PluginContextManager>,
        host: HostCapabilities,
    ) -> Self {
        Self {
            registry,
            executor,
            workflow,
            context,
            host,
            operations: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Execute one step and return its outputs.
    ///
    /// Failures come back as `Err`; the HTTP boundary turns them into the
    /// single-element failure list with the status the error carries.
    pub async fn execute_action(&self, step: Step) -> EngineResult<Vec<PluginOutput>> {
        let trace_id = step
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let operation_id = self.begin_transaction(&trace_id, &step).await;

        match self.run_step(&step, &trace_id, &operation_id).await {
            Ok(outputs) => {
                self.commit_transaction(&operation_id).await;
                Ok(outputs)
            }
            Err(error) => {
                self.rollback_transaction(&operation_id).await;
                tracing::warn!(
                    verb = %step.action_verb,
                    trace_id,
                    class = ?classify_error(&error),
                    error = %error,
                    "step failed"
                );
                Err(error)
            }
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        trace_id: &str,
        operation_id: &str,
    ) -> EngineResult<Vec<PluginOutput>> {
        let manifest = self.resolve_handler(step, trace_id).await?;

        let Some(manifest) = manifest else {
            // No handler anywhere: hand the verb to the meta-handler.
            let context = step
                .input_values
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            return self
                .workflow
                .handle_unknown_verb(&step.action_verb, &context, trace_id)
                .await;
        };

        let validated = validate_and_standardize_inputs(
            &manifest.input_definitions,
            &step.input_values,
            trace_id,
        );
        if !validated.success {
            return Err(validated.error.unwrap_or_else(|| {
                StructuredError::report(
                    ErrorCode::InputValidationFailed,
                    COMPONENT,
                    format!("inputs rejected for verb {}", step.action_verb),
                )
                .trace(trace_id)
                .build()
            }));
        }

        let bundle_root = self.registry.prepare_plugin_for_execution(&manifest).await?;
        if !bundle_root.as_os_str().is_empty() {
            self.track_resource(operation_id, &format!("bundle:{}", bundle_root.display()))
                .await;
        }

        let started = std::time::Instant::now();
        let outputs = self
            .executor
            .execute(&manifest, validated.inputs, &bundle_root, trace_id)
            .await;
        let elapsed = started.elapsed();

        let success = outputs.iter().all(|o| o.success);
        self.context.record_usage(&manifest.id, elapsed, success);

        // The executor folds failures into a one-element error list; lift
        // that back into an error so the boundary can set the status.
        if let [only] = outputs.as_slice() {
            if !only.success && only.result_type == ValueType::Error {
                if let Ok(error) =
                    serde_json::from_value::<StructuredError>(only.result.clone())
                {
                    return Err(error);
                }
                return Err(StructuredError::report(
                    ErrorCode::PluginExecutionFailed,
                    COMPONENT,
                    only.error
                        .clone()
                        .unwrap_or_else(|| "plugin execution failed".to_string()),
                )
                .trace(trace_id)
                .build());
            }
        }

        Ok(outputs)
    }

    /// Pick the handler for a step: an exact `(id, version)` when the step
    /// pins one, else the newest version of the verb that this host can
    /// run. `Ok(None)` means the unknown-verb path.
    async fn resolve_handler(
        &self,
        step: &Step,
        trace_id: &str,
    ) -> EngineResult<Option<Arc<capman_plugin_sdk::manifest::PluginManifest>>> {
        if let Some(details) = &step.plugin_details {
            let version = semver::Version::parse(&details.plugin_version).map_err(|e| {
                StructuredError::report(
                    ErrorCode::InvalidInput,
                    COMPONENT,
                    format!(
                        "pluginVersion {} is not a semver version",
                        details.plugin_version
                    ),
                )
                .trace(trace_id)
                .cause(e)
                .build()
            })?;
            let manifest = self
                .registry
                .fetch_one(&details.plugin_id, Some(&version), None)
                .await
                .ok_or_else(|| {
                    StructuredError::report(
                        ErrorCode::PluginVersionNotFound,
                        COMPONENT,
                        format!(
                            "plugin {} has no version {}",
                            details.plugin_id, details.plugin_version
                        ),
                    )
                    .trace(trace_id)
                    .build()
                })?;
            return Ok(Some(manifest));
        }

        let versions = self
            .registry
            .fetch_all_versions_by_verb(&step.action_verb, None)
            .await;
        if versions.is_empty() {
            return Ok(None);
        }
        for candidate in &versions {
            if PluginRegistry::check_plugin_compatibility(candidate, &self.host).is_ok() {
                return Ok(Some(candidate.clone()));
            }
        }
        Err(StructuredError::report(
            ErrorCode::PluginNotCompatible,
            COMPONENT,
            format!(
                "no version of {} is compatible with host {} {}",
                step.action_verb, self.host.host_app_name, self.host.host_version
            ),
        )
        .trace(trace_id)
        .build())
    }

    /// Open an active operation for a step.
    pub async fn begin_transaction(&self, trace_id: &str, step: &Step) -> String {
        let operation_id = uuid::Uuid::new_v4().to_string();
        let operation = ActiveOperation {
            operation_id: operation_id.clone(),
            trace_id: trace_id.to_string(),
            verb: step.action_verb.clone(),
            started_at: Utc::now(),
            resource_ids: HashSet::new(),
        };
        self.operations
            .write()
            .await
            .insert(operation_id.clone(), operation);
        operation_id
    }

    /// Attach a resource to an operation and mark it in use.
    pub async fn track_resource(&self, operation_id: &str, resource_id: &str) {
        if let Some(operation) = self.operations.write().await.get_mut(operation_id) {
            operation.resource_ids.insert(resource_id.to_string());
        }
        self.resources.write().await.insert(
            resource_id.to_string(),
            ResourceRecord {
                resource_id: resource_id.to_string(),
                in_use: true,
                last_accessed: Utc::now(),
            },
        );
    }

    /// Release the operation's resources and delete the record. A second
    /// call for the same id is a no-op.
    pub async fn commit_transaction(&self, operation_id: &str) {
        self.finish_transaction(operation_id).await;
    }

    /// Same release semantics as commit; used on the failure path.
    pub async fn rollback_transaction(&self, operation_id: &str) {
        self.finish_transaction(operation_id).await;
    }

    async fn finish_transaction(&self, operation_id: &str) {
        let Some(operation) = self.operations.write().await.remove(operation_id) else {
            return;
        };
        let mut resources = self.resources.write().await;
        for resource_id in &operation.resource_ids {
            if let Some(record) = resources.get_mut(resource_id) {
                record.in_use = false;
                record.last_accessed = Utc::now();
            }
        }
    }

    pub async fn active_operation_count(&self) -> usize {
        self.operations.read().await.len()
    }

    pub async fn resource(&self, resource_id: &str) -> Option<ResourceRecord> {
        self.resources.read().await.get(resource_id).cloned()
    }

    /// Spawn the periodic stale sweeper. Idempotent per orchestrator.
    pub async fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().await;
        if slot.is_some() {
            return;
        }
        let orchestrator = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                orchestrator
                    .sweep_stale(Utc::now() - ChronoDuration::minutes(STALE_AFTER_MINUTES))
                    .await;
            }
        }));
    }

    pub async fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
    }

    /// Drop operations started before `cutoff` (releasing their
    /// resources) and idle resource records last touched before it.
    pub async fn sweep_stale(&self, cutoff: DateTime<Utc>) {
        let stale_operations: Vec<String> = {
            let operations = self.operations.read().await;
            operations
                .values()
                .filter(|op| op.started_at < cutoff)
                .map(|op| op.operation_id.clone())
                .collect()
        };
        for operation_id in &stale_operations {
            tracing::warn!(operation_id = %operation_id, "sweeping stale operation");
            self.rollback_transaction(operation_id).await;
        }

        let mut resources = self.resources.write().await;
        let before = resources.len();
        resources.retain(|_, record| record.in_use || record.last_accessed >= cutoff);
        let dropped = before - resources.len();
        if dropped > 0 || !stale_operations.is_empty() {
            tracing::info!(
                operations = stale_operations.len(),
                resources = dropped,
                "stale sweep complete"
            );
        }
    }

    /// The boundary's user-visible failure shape.
    pub fn failure_body(error: StructuredError) -> Vec<PluginOutput> {
        failure_outputs(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::META_HANDLER_VERB;
    use capman_plugin_sdk::container::ContainerManager;
    use capman_plugin_sdk::executor::{ExecutorConfig, NoCredentials, TokenMinter};
    use capman_plugin_sdk::manifest::{
        HandlerKind, HostCompatibility, PackageSource, PluginManifest, SecurityConfig,
    };
    use capman_plugin_sdk::registry::prepare::BundleCache;
    use capman_plugin_sdk::registry::repository::LocalRepository;
    use capman_plugin_sdk::registry::AcceptUnsigned;

    struct StaticMinter;

    #[async_trait::async_trait]
    impl TokenMinter for StaticMinter {
        async fn mint(&self, _audience: &str) -> EngineResult<String> {
            Ok("token".to_string())
        }
    }

    fn internal_manifest(id: &str, verb: &str, version: &str) -> PluginManifest {
        PluginManifest {
            id: id.to_string(),
            verb: verb.to_string(),
            version: semver::Version::parse(version).unwrap(),
            handler: HandlerKind::Internal,
            description: String::new(),
            categories: Vec::new(),
            entry_point: None,
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
            package_source: PackageSource::default(),
            security: SecurityConfig::default(),
            host_compatibility: HostCompatibility::default(),
        }
    }

    async fn orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        let registry = Arc::new(PluginRegistry::new(
            vec![Arc::new(LocalRepository::new(dir.join("repo")))],
            Box::new(AcceptUnsigned),
            BundleCache::new(dir.join("cache"), dir.join("plugins")),
        ));
        let executor = Arc::new(PluginExecutor::new(
            Arc::new(ContainerManager::connect_local().unwrap()),
            Arc::new(StaticMinter),
            Arc::new(NoCredentials),
            ExecutorConfig::default(),
        ));
        let workflow = Arc::new(UnknownVerbWorkflow::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            String::new(),
        ));
        let context = Arc::new(PluginContextManager::new(Arc::clone(&registry)));
        Arc::new(Orchestrator::new(
            registry,
            executor,
            workflow,
            context,
            HostCapabilities::new(semver::Version::parse("1.5.0").unwrap(), "capman"),
        ))
    }

    fn registry_of(o: &Orchestrator) -> Arc<PluginRegistry> {
        Arc::clone(&o.registry)
    }

    #[tokio::test]
    async fn internal_verb_round_trips_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        registry_of(&orchestrator)
            .store(internal_manifest("plugin-CHAT", "CHAT", "1.0.0"))
            .await
            .unwrap();

        let outputs = orchestrator
            .execute_action(Step::new("CHAT"))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].success);
        assert_eq!(outputs[0].name, "internal_verb_detected");
        assert_eq!(outputs[0].result, serde_json::json!("INTERNAL_VERB"));
        // The operation table is empty once the call returned.
        assert_eq!(orchestrator.active_operation_count().await, 0);
    }

    #[tokio::test]
    async fn version_selection_respects_host_compatibility() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        let registry = registry_of(&orchestrator);

        let mut needs_2 = internal_manifest("plugin-X", "X", "1.0.0");
        needs_2.host_compatibility.min_host_version =
            Some(semver::Version::parse("2.0.0").unwrap());
        registry.store(needs_2).await.unwrap();

        let mut fits = internal_manifest("plugin-X", "X", "0.9.0");
        fits.host_compatibility.min_host_version =
            Some(semver::Version::parse("1.0.0").unwrap());
        registry.store(fits).await.unwrap();

        let manifest = orchestrator
            .resolve_handler(&Step::new("X"), "t-1")
            .await
            .unwrap()
            .expect("a compatible version exists");
        assert_eq!(manifest.version.to_string(), "0.9.0");
    }

    #[tokio::test]
    async fn pinned_version_misses_map_to_version_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        registry_of(&orchestrator)
            .store(internal_manifest("plugin-X", "X", "1.0.0"))
            .await
            .unwrap();

        let mut step = Step::new("X");
        step.plugin_details = Some(capman_plugin_sdk::models::PluginDetails {
            plugin_id: "plugin-X".to_string(),
            plugin_version: "9.9.9".to_string(),
        });
        let err = orchestrator.execute_action(step).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PluginVersionNotFound);
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn unknown_verb_without_meta_handler_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        let err = orchestrator
            .execute_action(Step::new("NEVER_SEEN"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AccomplishPluginManifestNotFound);
        // Rollback ran; nothing in flight.
        assert_eq!(orchestrator.active_operation_count().await, 0);
    }

    #[tokio::test]
    async fn commit_and_rollback_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;

        let operation_id = orchestrator.begin_transaction("t-1", &Step::new("X")).await;
        orchestrator.track_resource(&operation_id, "bundle:/tmp/x").await;
        assert!(orchestrator.resource("bundle:/tmp/x").await.unwrap().in_use);

        orchestrator.commit_transaction(&operation_id).await;
        assert!(!orchestrator.resource("bundle:/tmp/x").await.unwrap().in_use);
        assert_eq!(orchestrator.active_operation_count().await, 0);

        // Second commit and a late rollback are both no-ops.
        orchestrator.commit_transaction(&operation_id).await;
        orchestrator.rollback_transaction(&operation_id).await;
        assert!(!orchestrator.resource("bundle:/tmp/x").await.unwrap().in_use);
    }

    #[tokio::test]
    async fn sweeper_drops_stale_operations_and_resources() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;

        let stale_op = orchestrator.begin_transaction("t-1", &Step::new("OLD")).await;
        orchestrator.track_resource(&stale_op, "res:old").await;
        orchestrator.commit_transaction(&stale_op).await;

        let live_op = orchestrator.begin_transaction("t-2", &Step::new("NEW")).await;
        orchestrator.track_resource(&live_op, "res:live").await;

        // A cutoff in the future makes everything idle stale; the in-use
        // resource and its operation must survive only via rollback.
        let future_cutoff = Utc::now() + ChronoDuration::minutes(1);
        orchestrator.sweep_stale(future_cutoff).await;

        assert_eq!(orchestrator.active_operation_count().await, 0);
        assert!(orchestrator.resource("res:old").await.is_none());
        // The live resource was released by the sweep's rollback and then
        // retained because its release refreshed last_accessed.
        assert!(!orchestrator.resource("res:live").await.unwrap().in_use);
    }

    #[tokio::test]
    async fn unknown_verb_plans_flow_through_execute_action() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        let registry = registry_of(&orchestrator);

        // Meta-handler registered as an internal verb: its sentinel is a
        // string result, which the workflow caches like a direct answer.
        registry
            .store(internal_manifest("plugin-ACCOMPLISH", META_HANDLER_VERB, "1.0.0"))
            .await
            .unwrap();

        let first = orchestrator
            .execute_action(Step::new("NOVEL"))
            .await
            .unwrap();
        assert_eq!(first[0].result, serde_json::json!("INTERNAL_VERB"));

        let second = orchestrator
            .execute_action(Step::new("NOVEL"))
            .await
            .unwrap();
        assert_eq!(second[0].result, first[0].result);
    }

    #[test]
    fn classification_prefers_codes_over_messages() {
        let timeout = StructuredError::report(
            ErrorCode::PluginExecutionTimeout,
            "executor",
            "auth timed out", // message would classify as auth
        )
        .build();
        assert_eq!(classify_error(&timeout), ErrorClass::PluginExecutionError);

        let validation =
            StructuredError::report(ErrorCode::InputValidationFailed, "validator", "bad").build();
        assert_eq!(classify_error(&validation), ErrorClass::ValidationError);

        let unknown =
            StructuredError::report(ErrorCode::PluginNotFound, "registry", "nope").build();
        assert_eq!(classify_error(&unknown), ErrorClass::UnknownVerb);

        let fallback = StructuredError::report(
            ErrorCode::InternalError,
            "anywhere",
            "failed to parse upstream json",
        )
        .build();
        assert_eq!(classify_error(&fallback), ErrorClass::JsonParseError);

        let generic =
            StructuredError::report(ErrorCode::InternalError, "anywhere", "mystery").build();
        assert_eq!(classify_error(&generic), ErrorClass::GenericError);
    }
}
