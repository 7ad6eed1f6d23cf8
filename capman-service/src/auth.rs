//! # Token Service
//!
//! HS256 service tokens minted from the shared `CLIENT_SECRET`: one for
//! handlers to call back into the capability manager, one for the
//! downstream reasoning service. The same service verifies bearer tokens
//! on incoming requests when authentication is enabled.
//!
//! The SDK's executor consumes this through its narrow `TokenMinter`
//! trait; the engine never sees the signing secret.

use crate::config::AuthConfig;
use crate::server::AppState;
use crate::service_error::ServiceError;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use capman_plugin_sdk::error::{EngineResult, ErrorCode, StructuredError};
use capman_plugin_sdk::executor::TokenMinter;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

const COMPONENT: &str = "token-service";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Principal the token was minted for.
    pub sub: String,
    /// Audience service ("capman" or "brain").
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

/// Mints and verifies HS256 service tokens.
pub struct TokenService {
    config: AuthConfig,
}

impl TokenService {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Refuse obviously unusable secrets before the server starts.
    pub fn sanity_check(&self) -> anyhow::Result<()> {
        if self.config.enabled && self.config.client_secret.len() < 8 {
            anyhow::bail!("client secret is too short for token signing");
        }
        Ok(())
    }

    pub fn mint_for(&self, audience: &str) -> EngineResult<String> {
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: "capman-service".to_string(),
            aud: audience.to_string(),
            iat: now,
            exp: now + self.config.token_ttl.as_secs(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.client_secret.as_bytes()),
        )
        .map_err(|e| {
            StructuredError::report(
                ErrorCode::TokenMintFailed,
                COMPONENT,
                format!("failed to mint a token for {audience}"),
            )
            .cause(e)
            .build()
        })
    }

    pub fn verify(&self, token: &str) -> EngineResult<Claims> {
        let mut validation = Validation::default();
        // Tokens for any of our audiences are acceptable on the HTTP
        // surface.
        validation.validate_aud = false;
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.client_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| {
            StructuredError::report(
                ErrorCode::AuthenticationFailed,
                COMPONENT,
                "bearer token rejected",
            )
            .cause(e)
            .build()
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }
}

#[async_trait]
impl TokenMinter for TokenService {
    async fn mint(&self, audience: &str) -> EngineResult<String> {
        self.mint_for(audience)
    }
}

/// Bearer-token gate for the API surface. Health and readiness stay open
/// so orchestration platforms can probe an unauthenticated service.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    if !state.tokens.enabled() {
        return Ok(next.run(request).await);
    }
    let path = request.uri().path();
    if path == "/health" || path == "/ready" {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ServiceError::Auth {
            message: "missing bearer token".to_string(),
        })?;

    state.tokens.verify(token).map_err(|e| ServiceError::Auth {
        message: e.message,
    })?;
    Ok(next.run(request).await)
}
