//! # Capman Service
//!
//! HTTP service of the capman capability manager: callers submit a step
//! (an action verb plus typed inputs), the service resolves the verb to a
//! plugin handler, runs it under resource and permission constraints, and
//! returns a structured result set. Handlers may be in-process sandboxed
//! scripts, language subprocesses, containers reached over HTTP, or
//! remote HTTP/MCP endpoints; verbs nobody implements go to the
//! `ACCOMPLISH` meta-handler, which plans, answers directly, or requests
//! a brand-new plugin from the engineer service.
//!
//! ## Modules
//!
//! - [`config`]: TOML + environment configuration
//! - [`server`]: component construction, `AppState`, router
//! - [`handlers`]: the endpoint implementations
//! - [`orchestrator`]: transactions, sweeping, error classification
//! - [`workflow`]: the unknown-verb workflow and plan cache
//! - [`context`]: goal-relevance ranking of plugin summaries
//! - [`auth`]: service-token minting and bearer verification
//! - [`service_error`]: HTTP error mapping
//!
//! ## Quick start
//!
//! ```bash
//! capman-service --config capman.toml --port 5060
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod handlers;
pub mod orchestrator;
pub mod server;
pub mod service_error;
pub mod workflow;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use axum::http::StatusCode;
    use axum_test::TestServer;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.registry.plugin_root = dir.join("plugins");
        config.registry.cache_root = dir.join("cache");
        config.registry.manifest_root = dir.join("manifests");
        config
    }

    #[tokio::test]
    async fn health_reports_version_and_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _state) = crate::create_server(test_config(dir.path())).await.unwrap();
        let server = TestServer::new(app).unwrap();

        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "healthy");
        assert!(body["version"].is_string());
        assert_eq!(body["initialization"], true);
    }

    #[tokio::test]
    async fn ready_answers_200_after_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _state) = crate::create_server(test_config(dir.path())).await.unwrap();
        let server = TestServer::new(app).unwrap();

        let response = server.get("/ready").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<serde_json::Value>()["ready"], true);
    }

    #[tokio::test]
    async fn auth_gate_rejects_missing_bearer_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.auth.enabled = true;
        config.auth.client_secret = "integration-secret".to_string();

        let (app, state) = crate::create_server(config).await.unwrap();
        let server = TestServer::new(app).unwrap();

        // Probes stay open.
        assert_eq!(server.get("/health").await.status_code(), StatusCode::OK);

        let denied = server.get("/plugins").await;
        assert_eq!(denied.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            denied.json::<serde_json::Value>()["error"]["error_code"],
            "AUTHENTICATION_FAILED"
        );

        let token = state.tokens.mint_for("capman").unwrap();
        let allowed = server
            .get("/plugins")
            .add_header(
                axum::http::header::AUTHORIZATION,
                format!("Bearer {token}"),
            )
            .await;
        assert_eq!(allowed.status_code(), StatusCode::OK);
    }
}
