//! # HTTP Server Module
//!
//! Server setup for the capman service: component construction in
//! dependency order (repositories, registry, container manager, executor,
//! workflow, context manager, orchestrator), the shared `AppState`, and
//! the axum router with its middleware stack.
//!
//! ## Endpoints
//!
//! - `POST /executeAction`: run a step
//! - `POST /plugins` / `GET /plugins`: store / list handlers
//! - `GET /plugins/{id}` / `DELETE /plugins/{id}`: fetch / remove
//! - `POST /generatePluginContext`: ranked plugin summaries for a goal
//! - `GET /statistics`: per-plugin usage statistics
//! - `GET /health`, `GET /ready`: liveness and readiness
//!
//! Ownership is a DAG: the orchestrator holds the registry, executor,
//! workflow, and context manager; the executor holds the container
//! manager. Nothing points back up.

use crate::auth::{auth_middleware, TokenService};
use crate::config::Config;
use crate::context::PluginContextManager;
use crate::handlers;
use crate::orchestrator::Orchestrator;
use crate::workflow::UnknownVerbWorkflow;
use axum::routing::{get, post};
use axum::Router;
use capman_plugin_sdk::container::ContainerManager;
use capman_plugin_sdk::executor::{ExecutorConfig, NoCredentials, PluginExecutor};
use capman_plugin_sdk::models::HostCapabilities;
use capman_plugin_sdk::registry::prepare::BundleCache;
use capman_plugin_sdk::registry::repository::{
    LocalRepository, MarketplaceRepository, Repository,
};
use capman_plugin_sdk::registry::{AcceptUnsigned, PluginRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

/// Shared state behind every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<PluginRegistry>,
    pub containers: Arc<ContainerManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub context_manager: Arc<PluginContextManager>,
    pub tokens: Arc<TokenService>,
    ready: Arc<AtomicBool>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            containers: self.containers.clone(),
            orchestrator: self.orchestrator.clone(),
            context_manager: self.context_manager.clone(),
            tokens: self.tokens.clone(),
            ready: self.ready.clone(),
        }
    }
}

impl AppState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Best-effort teardown: stop every container, cancel the background
    /// tasks.
    pub async fn shutdown(&self) {
        self.orchestrator.stop_sweeper().await;
        self.containers.cleanup().await;
    }
}

/// Build every component and return the router plus the state backing it.
pub async fn create_server(config: Config) -> anyhow::Result<(Router, AppState)> {
    config.validate()?;

    let tokens = Arc::new(TokenService::new(config.auth.clone()));
    tokens.sanity_check()?;

    let mut repositories: Vec<Arc<dyn Repository>> = vec![Arc::new(LocalRepository::new(
        config.registry.manifest_root.clone(),
    ))];
    if !config.services.marketplace_url.is_empty() {
        repositories.push(Arc::new(MarketplaceRepository::new(
            config.services.marketplace_url.clone(),
            reqwest::Client::new(),
        )));
    }

    let registry = Arc::new(PluginRegistry::new(
        repositories,
        Box::new(AcceptUnsigned),
        BundleCache::new(
            config.registry.cache_root.clone(),
            config.registry.plugin_root.clone(),
        ),
    ));
    registry.initialize().await.map_err(|e| anyhow::anyhow!(e))?;

    let containers = Arc::new(ContainerManager::connect_local().map_err(|e| anyhow::anyhow!(e))?);
    containers.start_health_monitor().await;

    let executor = Arc::new(PluginExecutor::new(
        Arc::clone(&containers),
        tokens.clone(),
        Arc::new(NoCredentials),
        ExecutorConfig {
            postoffice_url: config.services.postoffice_url.clone(),
            brain_url: config.services.brain_url.clone(),
            librarian_url: config.services.librarian_url.clone(),
            mission_control_url: config.services.missioncontrol_url.clone(),
            mission_id: config.host.mission_id.clone(),
            script_timeout: config.executor.script_timeout,
            remote_timeout: config.executor.remote_timeout,
        },
    ));

    let workflow = Arc::new(UnknownVerbWorkflow::new(
        Arc::clone(&registry),
        Arc::clone(&executor),
        config.services.engineer_url.clone(),
    ));
    let context_manager = Arc::new(PluginContextManager::new(Arc::clone(&registry)));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        executor,
        workflow,
        Arc::clone(&context_manager),
        HostCapabilities::new(config.host.version.clone(), config.host.app_name.clone()),
    ));
    orchestrator.start_sweeper().await;

    let state = AppState {
        config: Arc::new(config.clone()),
        registry,
        containers,
        orchestrator,
        context_manager,
        tokens,
        ready: Arc::new(AtomicBool::new(true)),
    };

    let app = Router::new()
        .route("/executeAction", post(handlers::execute_action))
        .route(
            "/plugins",
            post(handlers::store_plugin).get(handlers::list_plugins),
        )
        .route(
            "/plugins/{id}",
            get(handlers::get_plugin).delete(handlers::delete_plugin),
        )
        .route("/generatePluginContext", post(handlers::generate_plugin_context))
        .route("/statistics", get(handlers::statistics))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    auth_middleware,
                ))
                .layer(axum::middleware::from_fn(logging_middleware))
                .layer(TimeoutLayer::new(config.server.timeout)),
        )
        .with_state(state.clone());

    Ok((app, state))
}

/// Request/response line logging with latency.
async fn logging_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = std::time::Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        %method,
        path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
