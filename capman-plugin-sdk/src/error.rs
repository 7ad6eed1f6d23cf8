//! # Structured Errors
//!
//! Every failure inside the engine is represented as a [`StructuredError`]
//! value: an immutable record with a stable code from a closed namespace,
//! a severity, trace correlation, and optional cause/context. Construction
//! is purely local; nothing here logs or panics. Callers decide whether to
//! fail the invocation or surface the record to the client.
//!
//! The record implements `std::error::Error`, so it propagates through the
//! engine with `?` like any other error type, and it serializes to the JSON
//! body the HTTP boundary returns so clients can always inspect
//! `error_code`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, StructuredError>;

/// Stable, flat error-code namespace.
///
/// Codes are wire-visible (`SCREAMING_SNAKE_CASE`) and must never be
/// renamed; clients branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    InputValidationFailed,
    InvalidInput,

    // Resolution
    PluginNotFound,
    PluginVersionNotFound,
    PluginNotCompatible,
    AccomplishPluginManifestNotFound,

    // Registration
    PluginManifestInvalid,
    PluginSignatureInvalid,
    PluginPermissionValidationFailed,

    // Preparation
    PluginPreparationFailed,
    GitCloneFailed,
    DependencyInstallFailed,

    // Execution
    PluginExecutionFailed,
    PluginExecutionTimeout,
    PluginOutputMalformed,
    UnsupportedLanguage,
    SandboxViolation,
    McpServiceNotConfigured,
    ApiOperationNotFound,

    // Containers
    ContainerBuildFailed,
    ContainerStartFailed,
    ContainerHealthCheckFailed,
    ContainerExecutionFailed,
    ContainerStopFailed,
    ContainerNotFound,
    NoAvailablePorts,

    // Auth
    AuthenticationFailed,
    TokenMintFailed,

    // Downstream services
    BrainServiceError,
    EngineerServiceFailed,

    // Artifacts
    ArtifactUploadFailed,
    ArtifactNotFound,
    ArtifactFileNotFoundDespiteMetadata,

    // Internal
    JsonParseError,
    InternalError,
}

impl ErrorCode {
    /// Severity a code carries unless the reporter overrides it.
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCode::InputValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::PluginManifestInvalid => ErrorSeverity::Validation,
            ErrorCode::AccomplishPluginManifestNotFound
            | ErrorCode::ArtifactFileNotFoundDespiteMetadata
            | ErrorCode::InternalError => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// HTTP status the boundary maps a code to when the reporter did not
    /// pin one explicitly.
    pub fn default_http_status(&self) -> u16 {
        match self {
            ErrorCode::InputValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::PluginManifestInvalid
            | ErrorCode::PluginSignatureInvalid
            | ErrorCode::PluginPermissionValidationFailed => 400,
            ErrorCode::AuthenticationFailed | ErrorCode::TokenMintFailed => 401,
            ErrorCode::PluginNotFound
            | ErrorCode::PluginVersionNotFound
            | ErrorCode::PluginNotCompatible
            | ErrorCode::ContainerNotFound
            | ErrorCode::ArtifactNotFound => 404,
            _ => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        // serde produces the same strings; this avoids a serializer round
        // trip on hot error paths.
        match self {
            ErrorCode::InputValidationFailed => "INPUT_VALIDATION_FAILED",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::PluginNotFound => "PLUGIN_NOT_FOUND",
            ErrorCode::PluginVersionNotFound => "PLUGIN_VERSION_NOT_FOUND",
            ErrorCode::PluginNotCompatible => "PLUGIN_NOT_COMPATIBLE",
            ErrorCode::AccomplishPluginManifestNotFound => {
                "ACCOMPLISH_PLUGIN_MANIFEST_NOT_FOUND"
            }
            ErrorCode::PluginManifestInvalid => "PLUGIN_MANIFEST_INVALID",
            ErrorCode::PluginSignatureInvalid => "PLUGIN_SIGNATURE_INVALID",
            ErrorCode::PluginPermissionValidationFailed => {
                "PLUGIN_PERMISSION_VALIDATION_FAILED"
            }
            ErrorCode::PluginPreparationFailed => "PLUGIN_PREPARATION_FAILED",
            ErrorCode::GitCloneFailed => "GIT_CLONE_FAILED",
            ErrorCode::DependencyInstallFailed => "DEPENDENCY_INSTALL_FAILED",
            ErrorCode::PluginExecutionFailed => "PLUGIN_EXECUTION_FAILED",
            ErrorCode::PluginExecutionTimeout => "PLUGIN_EXECUTION_TIMEOUT",
            ErrorCode::PluginOutputMalformed => "PLUGIN_OUTPUT_MALFORMED",
            ErrorCode::UnsupportedLanguage => "UNSUPPORTED_LANGUAGE",
            ErrorCode::SandboxViolation => "SANDBOX_VIOLATION",
            ErrorCode::McpServiceNotConfigured => "MCP_SERVICE_NOT_CONFIGURED",
            ErrorCode::ApiOperationNotFound => "API_OPERATION_NOT_FOUND",
            ErrorCode::ContainerBuildFailed => "CONTAINER_BUILD_FAILED",
            ErrorCode::ContainerStartFailed => "CONTAINER_START_FAILED",
            ErrorCode::ContainerHealthCheckFailed => "CONTAINER_HEALTH_CHECK_FAILED",
            ErrorCode::ContainerExecutionFailed => "CONTAINER_EXECUTION_FAILED",
            ErrorCode::ContainerStopFailed => "CONTAINER_STOP_FAILED",
            ErrorCode::ContainerNotFound => "CONTAINER_NOT_FOUND",
            ErrorCode::NoAvailablePorts => "NO_AVAILABLE_PORTS",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::TokenMintFailed => "TOKEN_MINT_FAILED",
            ErrorCode::BrainServiceError => "BRAIN_SERVICE_ERROR",
            ErrorCode::EngineerServiceFailed => "ENGINEER_SERVICE_FAILED",
            ErrorCode::ArtifactUploadFailed => "ARTIFACT_UPLOAD_FAILED",
            ErrorCode::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            ErrorCode::ArtifactFileNotFoundDespiteMetadata => {
                "ARTIFACT_FILE_NOT_FOUND_DESPITE_METADATA"
            }
            ErrorCode::JsonParseError => "JSON_PARSE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
    Validation,
}

/// Immutable structured error record.
///
/// Construct through [`StructuredError::report`]; the builder fills the id,
/// timestamp, severity, and status defaults so call sites only state what
/// differs.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
#[serde(rename_all = "camelCase")]
pub struct StructuredError {
    pub error_id: uuid::Uuid,
    pub trace_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "error_code")]
    pub code: ErrorCode,
    pub severity: ErrorSeverity,
    pub message: String,
    pub source_component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_cause: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl StructuredError {
    /// Start building an error report for `code` raised by
    /// `source_component`.
    pub fn report(
        code: ErrorCode,
        source_component: impl Into<String>,
        message: impl Into<String>,
    ) -> ErrorReport {
        ErrorReport {
            code,
            severity: code.default_severity(),
            message: message.into(),
            source_component: source_component.into(),
            trace_id: String::new(),
            original_cause: None,
            context: HashMap::new(),
            http_status: Some(code.default_http_status()),
        }
    }

    /// Status the HTTP boundary should answer with.
    pub fn status(&self) -> u16 {
        self.http_status.unwrap_or_else(|| self.code.default_http_status())
    }
}

/// Builder for [`StructuredError`] records.
#[derive(Debug)]
pub struct ErrorReport {
    code: ErrorCode,
    severity: ErrorSeverity,
    message: String,
    source_component: String,
    trace_id: String,
    original_cause: Option<String>,
    context: HashMap<String, serde_json::Value>,
    http_status: Option<u16>,
}

impl ErrorReport {
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.original_cause = Some(cause.to_string());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn build(self) -> StructuredError {
        StructuredError {
            error_id: uuid::Uuid::new_v4(),
            trace_id: self.trace_id,
            timestamp: chrono::Utc::now(),
            code: self.code,
            severity: self.severity,
            message: self.message,
            source_component: self.source_component,
            original_cause: self.original_cause,
            context: self.context,
            http_status: self.http_status,
        }
    }
}
