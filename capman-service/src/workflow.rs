//! # Unknown-Verb Workflow
//!
//! When no handler exists for a verb, the meta-handler (`ACCOMPLISH`) is
//! asked to deal with it: it answers with a plan of sub-steps, a direct
//! answer, or a request to synthesize a new plugin. Results are cached per
//! verb, and a per-verb lock makes resolution single-flight: two
//! concurrent unknown-verb requests produce one meta-handler call, with
//! the second observing the cached plan.
//!
//! A verb's resolution moves through one of four terminal states:
//! resolved (a handler existed after all), planned (plan or direct answer
//! cached), synthesized (the engineer service produced a new handler), or
//! unresolvable (error).

use capman_plugin_sdk::error::{EngineResult, ErrorCode, StructuredError};
use capman_plugin_sdk::executor::PluginExecutor;
use capman_plugin_sdk::models::{InputValue, PluginOutput, ValueType};
use capman_plugin_sdk::registry::PluginRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const COMPONENT: &str = "unknown-verb-workflow";

/// Verb of the built-in meta-handler.
pub const META_HANDLER_VERB: &str = "ACCOMPLISH";

#[derive(Debug, Clone)]
struct CachedResolution {
    outputs: Vec<PluginOutput>,
    inserted_at: DateTime<Utc>,
}

/// Drives meta-handler resolution for verbs the registry cannot answer.
pub struct UnknownVerbWorkflow {
    registry: Arc<PluginRegistry>,
    executor: Arc<PluginExecutor>,
    engineer_url: String,
    http: reqwest::Client,
    plan_cache: DashMap<String, CachedResolution>,
    verb_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UnknownVerbWorkflow {
    pub fn new(
        registry: Arc<PluginRegistry>,
        executor: Arc<PluginExecutor>,
        engineer_url: String,
    ) -> Self {
        Self {
            registry,
            executor,
            engineer_url,
            http: reqwest::Client::new(),
            plan_cache: DashMap::new(),
            verb_locks: DashMap::new(),
        }
    }

    /// Resolve `verb` through the meta-handler, consulting the plan cache
    /// first.
    pub async fn handle_unknown_verb(
        &self,
        verb: &str,
        context: &str,
        trace_id: &str,
    ) -> EngineResult<Vec<PluginOutput>> {
        if let Some(cached) = self.plan_cache.get(verb) {
            let age = Utc::now() - cached.inserted_at;
            tracing::debug!(
                verb,
                trace_id,
                age_secs = age.num_seconds(),
                "unknown verb answered from plan cache"
            );
            return Ok(cached.outputs.clone());
        }

        let lock = self
            .verb_locks
            .entry(verb.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent request may have resolved the verb while this one
        // waited on the lock.
        if let Some(cached) = self.plan_cache.get(verb) {
            tracing::debug!(verb, trace_id, "unknown verb resolved while waiting");
            return Ok(cached.outputs.clone());
        }

        let outputs = self.invoke_meta_handler(verb, context, trace_id).await?;
        let first = outputs.first().cloned().ok_or_else(|| {
            StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                format!("meta-handler returned no outputs for verb {verb}"),
            )
            .trace(trace_id)
            .build()
        })?;

        if !first.success {
            return Err(StructuredError::report(
                ErrorCode::PluginExecutionFailed,
                COMPONENT,
                first
                    .error
                    .unwrap_or_else(|| format!("meta-handler failed for verb {verb}")),
            )
            .trace(trace_id)
            .build());
        }

        match first.result_type {
            ValueType::Plan | ValueType::String | ValueType::Number | ValueType::Boolean => {
                self.plan_cache.insert(
                    verb.to_string(),
                    CachedResolution {
                        outputs: outputs.clone(),
                        inserted_at: Utc::now(),
                    },
                );
                tracing::info!(verb, trace_id, result_type = %first.result_type, "unknown verb planned");
                Ok(outputs)
            }
            ValueType::Plugin => self.request_plugin(verb, &first, trace_id).await,
            other => Err(StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                format!("meta-handler returned unexpected result type {other} for verb {verb}"),
            )
            .trace(trace_id)
            .build()),
        }
    }

    /// How many verbs currently have a cached resolution.
    pub fn cached_plan_count(&self) -> usize {
        self.plan_cache.len()
    }

    async fn invoke_meta_handler(
        &self,
        verb: &str,
        context: &str,
        trace_id: &str,
    ) -> EngineResult<Vec<PluginOutput>> {
        let manifest = self
            .registry
            .fetch_one_by_verb(META_HANDLER_VERB, None)
            .await
            .ok_or_else(|| {
                StructuredError::report(
                    ErrorCode::AccomplishPluginManifestNotFound,
                    COMPONENT,
                    "the ACCOMPLISH meta-handler manifest is not registered",
                )
                .trace(trace_id)
                .build()
            })?;

        let goal = format!(
            "Handle the action verb '{verb}' with this context: {context}. \
             Return a plan of sub-steps, a direct answer, or a plugin request. \
             Do not use the verb '{verb}' itself."
        );
        let mut inputs = HashMap::new();
        inputs.insert(
            "goal".to_string(),
            InputValue::new("goal", serde_json::Value::String(goal)),
        );
        inputs.insert(
            "verbToAvoid".to_string(),
            InputValue::new("verbToAvoid", serde_json::Value::String(verb.to_string())),
        );

        let bundle_root = self.registry.prepare_plugin_for_execution(&manifest).await?;
        Ok(self
            .executor
            .execute(&manifest, inputs, &bundle_root, trace_id)
            .await)
    }

    /// The meta-handler asked for a new plugin: forward the request to the
    /// engineer service, then pick up the manifest it persisted.
    async fn request_plugin(
        &self,
        verb: &str,
        request_output: &PluginOutput,
        trace_id: &str,
    ) -> EngineResult<Vec<PluginOutput>> {
        if self.engineer_url.is_empty() {
            return Err(StructuredError::report(
                ErrorCode::EngineerServiceFailed,
                COMPONENT,
                "no engineer service configured for plugin synthesis",
            )
            .trace(trace_id)
            .build());
        }

        let response = self
            .http
            .post(format!("{}/plugins", self.engineer_url.trim_end_matches('/')))
            .json(&serde_json::json!({
                "verb": verb,
                "requirements": request_output.result,
                "traceId": trace_id,
            }))
            .send()
            .await
            .map_err(|e| {
                StructuredError::report(
                    ErrorCode::EngineerServiceFailed,
                    COMPONENT,
                    format!("engineer request for verb {verb} failed"),
                )
                .trace(trace_id)
                .cause(e)
                .build()
            })?;
        if !response.status().is_success() {
            return Err(StructuredError::report(
                ErrorCode::EngineerServiceFailed,
                COMPONENT,
                format!(
                    "engineer answered {} for verb {verb}",
                    response.status()
                ),
            )
            .trace(trace_id)
            .build());
        }

        // The engineer persists through the repository; re-index to see it.
        self.registry.initialize().await?;
        let manifest = self
            .registry
            .fetch_one_by_verb(verb, None)
            .await
            .ok_or_else(|| {
                StructuredError::report(
                    ErrorCode::EngineerServiceFailed,
                    COMPONENT,
                    format!("engineer reported success but no manifest for {verb} appeared"),
                )
                .trace(trace_id)
                .build()
            })?;

        tracing::info!(verb, plugin_id = %manifest.id, trace_id, "verb synthesized");
        Ok(vec![PluginOutput::ok(
            "plugin",
            serde_json::to_value(manifest.as_ref()).unwrap_or_default(),
            format!("a new handler for {verb} was synthesized"),
        )
        .with_type(ValueType::Plugin)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capman_plugin_sdk::container::ContainerManager;
    use capman_plugin_sdk::executor::{ExecutorConfig, NoCredentials, TokenMinter};
    use capman_plugin_sdk::manifest::{
        EntryPoint, HandlerKind, HostCompatibility, PackageSource, PluginManifest, SecurityConfig,
        SubprocessRuntime,
    };
    use capman_plugin_sdk::registry::prepare::BundleCache;
    use capman_plugin_sdk::registry::repository::{LocalRepository, Repository};
    use capman_plugin_sdk::registry::AcceptUnsigned;

    struct StaticMinter;

    #[async_trait::async_trait]
    impl TokenMinter for StaticMinter {
        async fn mint(&self, _audience: &str) -> EngineResult<String> {
            Ok("token".to_string())
        }
    }

    /// ACCOMPLISH as a subprocess handler whose script both counts its
    /// invocations and answers with the given payload.
    fn accomplish_manifest() -> PluginManifest {
        PluginManifest {
            id: "plugin-ACCOMPLISH".to_string(),
            verb: META_HANDLER_VERB.to_string(),
            version: semver::Version::parse("1.0.0").unwrap(),
            handler: HandlerKind::SubprocessScript {
                runtime: SubprocessRuntime {
                    interpreter: "sh".to_string(),
                    requirements_file: "requirements.txt".to_string(),
                },
            },
            description: "meta-handler".to_string(),
            categories: Vec::new(),
            entry_point: Some(EntryPoint {
                main: "main.sh".to_string(),
            }),
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
            package_source: PackageSource::default(),
            security: SecurityConfig::default(),
            host_compatibility: HostCompatibility::default(),
        }
    }

    async fn workflow_with_script(
        dir: &std::path::Path,
        script: &str,
        engineer_url: String,
    ) -> UnknownVerbWorkflow {
        let plugin_dir = dir.join("plugins").join(META_HANDLER_VERB);
        tokio::fs::create_dir_all(&plugin_dir).await.unwrap();
        tokio::fs::write(plugin_dir.join("main.sh"), script).await.unwrap();

        let registry = Arc::new(PluginRegistry::new(
            vec![Arc::new(LocalRepository::new(dir.join("repo")))],
            Box::new(AcceptUnsigned),
            BundleCache::new(dir.join("cache"), dir.join("plugins")),
        ));
        registry.store(accomplish_manifest()).await.unwrap();

        let executor = Arc::new(PluginExecutor::new(
            Arc::new(ContainerManager::connect_local().unwrap()),
            Arc::new(StaticMinter),
            Arc::new(NoCredentials),
            ExecutorConfig::default(),
        ));
        UnknownVerbWorkflow::new(registry, executor, engineer_url)
    }

    const PLAN_SCRIPT: &str = r#"cat > /dev/null
echo x >> calls.txt
printf '[{"success": true, "name": "plan", "resultType": "plan", "result": [{"number": 1, "actionVerb": "SEARCH", "description": "look it up"}], "resultDescription": "a plan"}]'
"#;

    #[tokio::test]
    async fn plans_are_cached_per_verb() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = workflow_with_script(dir.path(), PLAN_SCRIPT, String::new()).await;

        let first = workflow
            .handle_unknown_verb("NOVEL_VERB", "test", "t-1")
            .await
            .unwrap();
        assert_eq!(first[0].result_type, ValueType::Plan);

        let second = workflow
            .handle_unknown_verb("NOVEL_VERB", "test", "t-2")
            .await
            .unwrap();
        assert_eq!(second[0].result, first[0].result);
        assert_eq!(workflow.cached_plan_count(), 1);

        let calls = tokio::fs::read_to_string(
            dir.path().join("plugins").join(META_HANDLER_VERB).join("calls.txt"),
        )
        .await
        .unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolutions_invoke_the_meta_handler_once() {
        let dir = tempfile::tempdir().unwrap();
        let workflow =
            Arc::new(workflow_with_script(dir.path(), PLAN_SCRIPT, String::new()).await);

        let a = {
            let workflow = Arc::clone(&workflow);
            tokio::spawn(async move {
                workflow.handle_unknown_verb("RACE_VERB", "test", "t-a").await
            })
        };
        let b = {
            let workflow = Arc::clone(&workflow);
            tokio::spawn(async move {
                workflow.handle_unknown_verb("RACE_VERB", "test", "t-b").await
            })
        };
        let (a, b) = tokio::join!(a, b);
        assert!(a.unwrap().is_ok());
        assert!(b.unwrap().is_ok());

        let calls = tokio::fs::read_to_string(
            dir.path().join("plugins").join(META_HANDLER_VERB).join("calls.txt"),
        )
        .await
        .unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[tokio::test]
    async fn missing_meta_handler_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PluginRegistry::new(
            vec![Arc::new(LocalRepository::new(dir.path().join("repo")))],
            Box::new(AcceptUnsigned),
            BundleCache::new(dir.path().join("cache"), dir.path().join("plugins")),
        ));
        let executor = Arc::new(PluginExecutor::new(
            Arc::new(ContainerManager::connect_local().unwrap()),
            Arc::new(StaticMinter),
            Arc::new(NoCredentials),
            ExecutorConfig::default(),
        ));
        let workflow = UnknownVerbWorkflow::new(registry, executor, String::new());

        let err = workflow
            .handle_unknown_verb("ANY", "test", "t-1")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AccomplishPluginManifestNotFound);
        assert_eq!(
            err.severity,
            capman_plugin_sdk::error::ErrorSeverity::Critical
        );
    }

    #[tokio::test]
    async fn plugin_requests_go_to_the_engineer_exactly_once() {
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let dir = tempfile::tempdir().unwrap();
        let engineer = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/plugins"))
            .and(body_partial_json(serde_json::json!({"verb": "SYNTH_VERB"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&engineer)
            .await;

        const PLUGIN_REQUEST_SCRIPT: &str = r#"cat > /dev/null
printf '[{"success": true, "name": "plugin_request", "resultType": "plugin", "result": {"verb": "SYNTH_VERB", "purpose": "synthesize me"}, "resultDescription": "needs a new plugin"}]'
"#;
        let workflow =
            workflow_with_script(dir.path(), PLUGIN_REQUEST_SCRIPT, engineer.uri()).await;

        // Simulate the engineer persisting the new manifest through the
        // shared repository; the workflow re-indexes to find it.
        let mut synthesized = accomplish_manifest();
        synthesized.id = "plugin-SYNTH_VERB".to_string();
        synthesized.verb = "SYNTH_VERB".to_string();
        synthesized.handler = HandlerKind::Internal;
        synthesized.entry_point = None;
        LocalRepository::new(dir.path().join("repo"))
            .store(&synthesized)
            .await
            .unwrap();

        let outputs = workflow
            .handle_unknown_verb("SYNTH_VERB", "test", "t-1")
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].result_type, ValueType::Plugin);
        assert_eq!(outputs[0].result["verb"], "SYNTH_VERB");
        // Synthesized verbs are resolvable now and must not be cached as
        // plans.
        assert_eq!(workflow.cached_plan_count(), 0);
    }
}
