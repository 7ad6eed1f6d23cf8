//! # Plugin Manifests
//!
//! The immutable description of a handler: identity, the action verb it
//! implements, an orderable semver version, and a tagged [`HandlerKind`]
//! that carries the configuration specific to each execution strategy.
//!
//! ## Design
//!
//! The manifest's `language` field is the serde tag of `HandlerKind`, so a
//! manifest deserializes straight into a variant with strongly-typed
//! configuration (container config for containers, API config for OpenAPI
//! remotes, and so on) and the executor dispatches with a plain `match`.
//! A `language` value outside the closed set fails deserialization; there
//! is no stringly-typed fallback path.
//!
//! ## Invariants
//!
//! - `(id, version)` is unique within the registry.
//! - `verb` may map to many `(id, version)` pairs.
//! - `entry_point.main` must exist inside the materialized bundle for
//!   non-remote handlers; [`PluginManifest::validate`] checks presence in
//!   the manifest, the registry checks presence on disk.

use crate::error::{EngineResult, ErrorCode, StructuredError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::ValueType;

const COMPONENT: &str = "manifest";

/// Permissions a manifest may declare. Anything outside this list fails
/// `storePlugin` with `PLUGIN_PERMISSION_VALIDATION_FAILED`.
pub const ALLOWED_PERMISSIONS: &[&str] = &[
    "fs.read",
    "fs.write",
    "net.fetch",
    "net.serve",
    "env.read",
    "proc.spawn",
    "artifact.read",
    "artifact.write",
];

/// Allowed, but logged at warn level when a plugin declares them.
pub const DANGEROUS_PERMISSIONS: &[&str] = &["fs.write", "proc.spawn", "net.serve"];

/// Execution strategy plus its strategy-specific configuration.
///
/// Serialized internally tagged on `language`, so the manifest JSON reads
/// `{"language": "container", "container": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "language")]
pub enum HandlerKind {
    /// Script source evaluated in the in-process restricted evaluator.
    #[serde(rename = "sandbox-script")]
    SandboxScript,

    /// Script spawned as a subprocess inside the bundle's virtual
    /// environment.
    #[serde(rename = "subprocess-script")]
    SubprocessScript {
        #[serde(default)]
        runtime: SubprocessRuntime,
    },

    /// Long-lived container reached over HTTP on an allocated host port.
    #[serde(rename = "container")]
    Container { container: ContainerConfig },

    /// Remote HTTP/OpenAPI endpoint.
    #[serde(rename = "openapi")]
    OpenApi { api: ApiConfig },

    /// Remote MCP service resolved through the environment.
    #[serde(rename = "mcp")]
    Mcp { mcp: McpConfig },

    /// Resolved by the caller itself; the executor returns a sentinel.
    #[serde(rename = "internal")]
    Internal,
}

impl HandlerKind {
    pub fn language(&self) -> &'static str {
        match self {
            HandlerKind::SandboxScript => "sandbox-script",
            HandlerKind::SubprocessScript { .. } => "subprocess-script",
            HandlerKind::Container { .. } => "container",
            HandlerKind::OpenApi { .. } => "openapi",
            HandlerKind::Mcp { .. } => "mcp",
            HandlerKind::Internal => "internal",
        }
    }

    /// Remote handlers have no bundle on disk and need no entry point.
    pub fn is_remote(&self) -> bool {
        matches!(self, HandlerKind::OpenApi { .. } | HandlerKind::Mcp { .. })
    }
}

/// Runtime settings for subprocess-script handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubprocessRuntime {
    /// Interpreter looked up inside the bundle venv, then on PATH.
    pub interpreter: String,
    /// Requirements file materialized into the venv during preparation.
    pub requirements_file: String,
}

impl Default for SubprocessRuntime {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            requirements_file: "requirements.txt".to_string(),
        }
    }
}

/// Container build and runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Tag the built image gets.
    pub image: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// Build context, relative to the bundle root.
    #[serde(default = "default_build_context")]
    pub build_context: String,
    /// Port the handler listens on inside the container.
    pub container_port: u16,
    #[serde(default)]
    pub additional_ports: Vec<u16>,
    /// Memory cap, e.g. "100m" or "1g".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU factor; multiplied by 1024 into engine CPU shares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_secs: u64,
    /// Path the executor POSTs execution requests to.
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Overall deadline for one execution request.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

fn default_execution_timeout() -> u64 {
    60
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_build_context() -> String {
    ".".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_timeout() -> u64 {
    30
}

fn default_api_endpoint() -> String {
    "/execute".to_string()
}

/// Remote OpenAPI handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub operations: Vec<ApiOperation>,
    #[serde(default)]
    pub auth: ApiAuth,
    /// Seconds before an in-flight remote call is abandoned.
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_api_timeout() -> u64 {
    30
}

/// One callable operation of a remote API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOperation {
    pub operation_id: String,
    /// Verb this operation answers when the manifest covers several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_verb: Option<String>,
    pub method: String,
    /// Path template; `{name}` segments are filled from inputs.
    pub path: String,
    #[serde(default)]
    pub parameters: Vec<ApiParameter>,
}

/// Where one input lands in the outgoing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiParameter {
    pub name: String,
    pub location: ApiParameterLocation,
    /// Input supplying the value; defaults to the parameter name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiParameterLocation {
    Path,
    Query,
    Header,
    Body,
}

/// Authentication scheme for remote API handlers.
///
/// Credential fields hold references, not secrets; `env:NAME` resolves
/// from the process environment at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApiAuth {
    #[default]
    None,
    ApiKey {
        header: String,
        credential: String,
    },
    Bearer {
        credential: String,
    },
    Basic {
        username_credential: String,
        password_credential: String,
    },
}

/// Remote MCP handler settings. The service URL comes from
/// `MCP_SERVICE_<NAME>_URL` at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    pub service_name: String,
    #[serde(default = "default_api_endpoint")]
    pub path: String,
}

/// One declared input or output of a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl IoDefinition {
    pub fn required(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: true,
            aliases: Vec::new(),
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: false,
            aliases: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Where a handler's files come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PackageSource {
    /// Files already on local disk under the service plugin root.
    Inline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Shallow-cloned from git into the content-addressed bundle cache.
    Git {
        url: String,
        branch: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_path: Option<String>,
    },
}

impl Default for PackageSource {
    fn default() -> Self {
        PackageSource::Inline { path: None }
    }
}

/// Sandbox limits for in-process script handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_bytes: u64,
    #[serde(default)]
    pub allowed_modules: Vec<String>,
    #[serde(default)]
    pub allowed_apis: Vec<String>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            memory_bytes: 64 * 1024 * 1024,
            allowed_modules: Vec::new(),
            allowed_apis: Vec::new(),
        }
    }
}

/// Declared permissions, sandbox limits, and trust information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub sandbox: SandboxLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_signature: Option<String>,
}

/// Minimum host requirements a manifest declares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCompatibility {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<semver::Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_app_name: Option<String>,
}

/// Main file of a bundle, relative to the bundle root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    pub main: String,
}

/// Immutable description of one handler version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub verb: String,
    pub version: semver::Version,
    #[serde(flatten)]
    pub handler: HandlerKind,
    #[serde(default)]
    pub description: String,
    /// Free-form grouping labels used for goal-relevance ranking.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
    #[serde(default)]
    pub input_definitions: Vec<IoDefinition>,
    #[serde(default)]
    pub output_definitions: Vec<IoDefinition>,
    #[serde(default)]
    pub package_source: PackageSource,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub host_compatibility: HostCompatibility,
}

impl PluginManifest {
    /// Structural validation applied before a manifest is stored.
    ///
    /// Field presence and the closed language set are already enforced by
    /// deserialization; what remains is the entry-point rule for non-remote
    /// handlers and non-empty identity fields.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() || self.verb.trim().is_empty() {
            return Err(StructuredError::report(
                ErrorCode::PluginManifestInvalid,
                COMPONENT,
                "manifest id and verb must be non-empty",
            )
            .build());
        }
        if !self.handler.is_remote()
            && !matches!(self.handler, HandlerKind::Internal)
            && self.entry_point.is_none()
        {
            return Err(StructuredError::report(
                ErrorCode::PluginManifestInvalid,
                COMPONENT,
                format!(
                    "manifest {} ({}): entryPoint.main is required for language {}",
                    self.id,
                    self.verb,
                    self.handler.language()
                ),
            )
            .build());
        }
        Ok(())
    }

    pub fn language(&self) -> &'static str {
        self.handler.language()
    }

    /// Permissions outside [`ALLOWED_PERMISSIONS`], if any.
    pub fn disallowed_permissions(&self) -> Vec<&str> {
        self.security
            .permissions
            .iter()
            .map(String::as_str)
            .filter(|p| !ALLOWED_PERMISSIONS.contains(p))
            .collect()
    }

    /// Declared permissions that are allowed but warrant logging.
    pub fn dangerous_permissions(&self) -> Vec<&str> {
        self.security
            .permissions
            .iter()
            .map(String::as_str)
            .filter(|p| DANGEROUS_PERMISSIONS.contains(p))
            .collect()
    }

    pub fn locator(&self, repository_type: RepositoryType) -> PluginLocator {
        PluginLocator {
            id: self.id.clone(),
            verb: self.verb.clone(),
            repository_type,
        }
    }
}

/// Which backend a manifest lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    Local,
    Marketplace,
}

/// Lightweight index entry, one per manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginLocator {
    pub id: String,
    pub verb: String,
    pub repository_type: RepositoryType,
}

/// Total order over semver strings.
///
/// `compare_versions(a, b) < 0` iff `a` is older than `b`; antisymmetric
/// and reflexive per semver precedence.
pub fn compare_versions(a: &str, b: &str) -> EngineResult<Ordering> {
    let parse = |s: &str| {
        semver::Version::parse(s).map_err(|e| {
            StructuredError::report(
                ErrorCode::PluginManifestInvalid,
                COMPONENT,
                format!("not a semver version: {s}"),
            )
            .cause(e)
            .build()
        })
    };
    Ok(parse(a)?.cmp(&parse(b)?))
}
