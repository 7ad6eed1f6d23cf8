//! # Manifest Repositories
//!
//! Storage backends the registry enumerates manifests from. Two are
//! provided: a local directory of `manifest.json` files and an HTTP
//! marketplace. Both answer the same narrow [`Repository`] trait so the
//! registry never cares where a manifest came from.

use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{PluginManifest, RepositoryType};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "repository";

/// A backend that persists plugin manifests.
#[async_trait]
pub trait Repository: Send + Sync {
    fn repository_type(&self) -> RepositoryType;

    /// Every manifest the backend knows about.
    async fn list(&self) -> EngineResult<Vec<PluginManifest>>;

    /// Exact version when given, else whatever versions exist for `id`.
    async fn fetch(
        &self,
        id: &str,
        version: Option<&semver::Version>,
    ) -> EngineResult<Vec<PluginManifest>>;

    async fn store(&self, manifest: &PluginManifest) -> EngineResult<()>;

    /// Remove one version, or every version of `id` when `version` is
    /// `None`. Deleting something absent is not an error.
    async fn delete(&self, id: &str, version: Option<&semver::Version>) -> EngineResult<()>;
}

/// Manifests stored as `<root>/<id>/<version>/manifest.json`.
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn manifest_path(&self, id: &str, version: &semver::Version) -> PathBuf {
        self.root.join(id).join(version.to_string()).join("manifest.json")
    }

    async fn read_manifest(path: &Path) -> EngineResult<PluginManifest> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                format!("failed to read manifest at {}", path.display()),
            )
            .cause(e)
            .build()
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            StructuredError::report(
                ErrorCode::PluginManifestInvalid,
                COMPONENT,
                format!("manifest at {} does not parse", path.display()),
            )
            .cause(e)
            .build()
        })
    }

    async fn read_dir(path: &Path) -> EngineResult<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => {
                return Err(StructuredError::report(
                    ErrorCode::InternalError,
                    COMPONENT,
                    format!("failed to enumerate {}", path.display()),
                )
                .cause(e)
                .build())
            }
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| {
            StructuredError::report(ErrorCode::InternalError, COMPONENT, "directory walk failed")
                .cause(e)
                .build()
        })? {
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

#[async_trait]
impl Repository for LocalRepository {
    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Local
    }

    async fn list(&self) -> EngineResult<Vec<PluginManifest>> {
        let mut manifests = Vec::new();
        for id_dir in Self::read_dir(&self.root).await? {
            if !id_dir.is_dir() {
                continue;
            }
            for version_dir in Self::read_dir(&id_dir).await? {
                let path = version_dir.join("manifest.json");
                if !path.is_file() {
                    continue;
                }
                match Self::read_manifest(&path).await {
                    Ok(manifest) => manifests.push(manifest),
                    // One broken manifest must not hide the rest of the
                    // repository.
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable manifest"
                    ),
                }
            }
        }
        Ok(manifests)
    }

    async fn fetch(
        &self,
        id: &str,
        version: Option<&semver::Version>,
    ) -> EngineResult<Vec<PluginManifest>> {
        if let Some(version) = version {
            let path = self.manifest_path(id, version);
            if !path.is_file() {
                return Ok(Vec::new());
            }
            return Ok(vec![Self::read_manifest(&path).await?]);
        }
        let mut manifests = Vec::new();
        for version_dir in Self::read_dir(&self.root.join(id)).await? {
            let path = version_dir.join("manifest.json");
            if path.is_file() {
                manifests.push(Self::read_manifest(&path).await?);
            }
        }
        Ok(manifests)
    }

    async fn store(&self, manifest: &PluginManifest) -> EngineResult<()> {
        let path = self.manifest_path(&manifest.id, &manifest.version);
        let dir = path.parent().expect("manifest path has a parent");
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                format!("failed to create {}", dir.display()),
            )
            .cause(e)
            .build()
        })?;
        let raw = serde_json::to_vec_pretty(manifest).map_err(|e| {
            StructuredError::report(ErrorCode::InternalError, COMPONENT, "manifest serialization")
                .cause(e)
                .build()
        })?;
        tokio::fs::write(&path, raw).await.map_err(|e| {
            StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                format!("failed to write {}", path.display()),
            )
            .cause(e)
            .build()
        })
    }

    async fn delete(&self, id: &str, version: Option<&semver::Version>) -> EngineResult<()> {
        let target = match version {
            Some(version) => self.root.join(id).join(version.to_string()),
            None => self.root.join(id),
        };
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                format!("failed to delete {}", target.display()),
            )
            .cause(e)
            .build()),
        }
    }
}

/// Manifests served by a remote marketplace over HTTP.
///
/// Endpoints: `GET /plugins`, `GET /plugins/{id}` (optional `version`
/// query), `POST /plugins`, `DELETE /plugins/{id}`.
pub struct MarketplaceRepository {
    base_url: String,
    client: reqwest::Client,
}

impl MarketplaceRepository {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn request_error(&self, what: &str, e: impl std::fmt::Display) -> StructuredError {
        StructuredError::report(
            ErrorCode::InternalError,
            COMPONENT,
            format!("marketplace {what} request failed"),
        )
        .cause(e)
        .with("baseUrl", serde_json::Value::String(self.base_url.clone()))
        .build()
    }
}

#[async_trait]
impl Repository for MarketplaceRepository {
    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Marketplace
    }

    async fn list(&self) -> EngineResult<Vec<PluginManifest>> {
        let response = self
            .client
            .get(format!("{}/plugins", self.base_url))
            .send()
            .await
            .map_err(|e| self.request_error("list", e))?;
        if !response.status().is_success() {
            return Err(self.request_error("list", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| self.request_error("list decode", e))
    }

    async fn fetch(
        &self,
        id: &str,
        version: Option<&semver::Version>,
    ) -> EngineResult<Vec<PluginManifest>> {
        let mut request = self.client.get(format!("{}/plugins/{id}", self.base_url));
        if let Some(version) = version {
            request = request.query(&[("version", version.to_string())]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.request_error("fetch", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(self.request_error("fetch", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| self.request_error("fetch decode", e))
    }

    async fn store(&self, manifest: &PluginManifest) -> EngineResult<()> {
        let response = self
            .client
            .post(format!("{}/plugins", self.base_url))
            .json(manifest)
            .send()
            .await
            .map_err(|e| self.request_error("store", e))?;
        if !response.status().is_success() {
            return Err(self.request_error("store", response.status()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str, version: Option<&semver::Version>) -> EngineResult<()> {
        let mut request = self
            .client
            .delete(format!("{}/plugins/{id}", self.base_url));
        if let Some(version) = version {
            request = request.query(&[("version", version.to_string())]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.request_error("delete", e))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(self.request_error("delete", response.status()));
        }
        Ok(())
    }
}
