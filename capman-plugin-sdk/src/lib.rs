//! # Capman Plugin SDK
//!
//! Engine library for the capman capability manager. The service crate
//! drives it; everything here is also usable on its own for embedding the
//! execution pipeline in other hosts.
//!
//! ## Overview
//!
//! A caller resolves an action verb to a [`manifest::PluginManifest`]
//! through the [`registry::PluginRegistry`], materializes the handler's
//! bundle on disk, and hands both to the [`executor::PluginExecutor`],
//! which returns a uniform `Vec<PluginOutput>` whatever the handler's
//! language. Four execution strategies are built in:
//!
//! - **sandbox-script**: in-process restricted evaluator, no ambient
//!   filesystem or network access
//! - **subprocess-script**: language subprocess inside the bundle's
//!   virtual environment, JSON over stdin/stdout
//! - **container**: image build + container lifecycle through the local
//!   engine, execution over HTTP on an allocated host port
//! - **openapi / mcp**: remote HTTP endpoints, no local bundle
//!
//! plus **internal** verbs the embedding service resolves itself.
//!
//! ## Modules
//!
//! - [`models`]: steps, typed inputs, plugin outputs
//! - [`manifest`]: manifest schema with the tagged handler variant
//! - [`error`]: closed error-code namespace and structured error records
//! - [`validator`]: pure input validation and coercion
//! - [`registry`]: verb/version resolution, repositories, bundle cache
//! - [`container`]: container lifecycle, port pool, health monitoring
//! - [`executor`]: the execution pipeline and per-language strategies
//!
//! ## Failure shape
//!
//! Every execution failure collapses into a single `PluginOutput` with
//! `success = false`, `resultType = error`, the stable error code as its
//! name, and the full [`error::StructuredError`] as the result, so
//! clients always have `error_code` to branch on.

pub mod container;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod models;
pub mod registry;
pub mod validator;

pub use container::{ContainerInstance, ContainerManager, ContainerStatus, HealthState};
pub use error::{EngineResult, ErrorCode, ErrorSeverity, StructuredError};
pub use executor::{
    CredentialRef, CredentialStore, ExecutorConfig, NoCredentials, PluginExecutor, TokenMinter,
};
pub use manifest::{HandlerKind, PluginLocator, PluginManifest, RepositoryType};
pub use models::{HostCapabilities, InputValue, PluginOutput, Step, ValueType};
pub use registry::{PluginRegistry, StoreOutcome};
