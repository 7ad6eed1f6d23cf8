//! # Plugin Registry
//!
//! Version-aware resolution of action verbs to plugin manifests, backed by
//! one or more [`Repository`] instances and two in-memory indices:
//! `id -> version -> manifest` and `verb -> set<id>`. Index mutation is
//! single-writer (`store`/`delete` take the write lock); resolution reads
//! concurrently.
//!
//! Bundle materialization lives in [`prepare`]; the registry exposes it as
//! [`PluginRegistry::prepare_plugin_for_execution`] so callers get the
//! bundle root in one step after resolution.

pub mod prepare;
pub mod repository;

use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{PluginLocator, PluginManifest, RepositoryType};
use crate::models::HostCapabilities;
use chrono::{DateTime, Utc};
use repository::Repository;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

const COMPONENT: &str = "registry";

/// Verifies a manifest's trust signature before it is stored.
///
/// Verification itself is delegated to the deployment: the default
/// [`AcceptUnsigned`] lets unsigned manifests through, which fits
/// development setups; production wires a real verifier.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, manifest: &PluginManifest) -> EngineResult<()>;
}

/// Accepts every manifest, signed or not.
pub struct AcceptUnsigned;

impl SignatureVerifier for AcceptUnsigned {
    fn verify(&self, _manifest: &PluginManifest) -> EngineResult<()> {
        Ok(())
    }
}

/// Outcome of [`PluginRegistry::store`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOutcome {
    pub plugin_id: String,
    pub version: String,
    pub is_update: bool,
}

#[derive(Clone)]
struct IndexedManifest {
    manifest: Arc<PluginManifest>,
    repository: RepositoryType,
    stored_at: DateTime<Utc>,
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, BTreeMap<semver::Version, IndexedManifest>>,
    by_verb: HashMap<String, HashSet<String>>,
}

impl Indices {
    fn insert(&mut self, entry: IndexedManifest) {
        let manifest = &entry.manifest;
        self.by_verb
            .entry(manifest.verb.clone())
            .or_default()
            .insert(manifest.id.clone());
        self.by_id
            .entry(manifest.id.clone())
            .or_default()
            .insert(manifest.version.clone(), entry.clone());
    }

    fn remove(&mut self, id: &str, version: Option<&semver::Version>) {
        let Some(versions) = self.by_id.get_mut(id) else {
            return;
        };
        let removed_verbs: Vec<String> = match version {
            Some(version) => versions
                .remove(version)
                .map(|e| e.manifest.verb.clone())
                .into_iter()
                .collect(),
            None => versions.values().map(|e| e.manifest.verb.clone()).collect(),
        };
        if version.is_none() || versions.is_empty() {
            self.by_id.remove(id);
        }
        for verb in removed_verbs {
            // The id stays mapped while any of its versions still serves
            // the verb.
            let still_serves = self
                .by_id
                .get(id)
                .map(|vs| vs.values().any(|e| e.manifest.verb == verb))
                .unwrap_or(false);
            if !still_serves {
                if let Some(ids) = self.by_verb.get_mut(&verb) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.by_verb.remove(&verb);
                    }
                }
            }
        }
    }
}

/// Resolves verbs to manifests and keeps handler bundles materialized.
pub struct PluginRegistry {
    repositories: Vec<Arc<dyn Repository>>,
    indices: RwLock<Indices>,
    verifier: Box<dyn SignatureVerifier>,
    bundles: prepare::BundleCache,
}

impl PluginRegistry {
    pub fn new(
        repositories: Vec<Arc<dyn Repository>>,
        verifier: Box<dyn SignatureVerifier>,
        bundles: prepare::BundleCache,
    ) -> Self {
        Self {
            repositories,
            indices: RwLock::new(Indices::default()),
            verifier,
            bundles,
        }
    }

    /// Enumerate every backend and rebuild the indices.
    pub async fn initialize(&self) -> EngineResult<()> {
        let mut fresh = Indices::default();
        for repo in &self.repositories {
            let manifests = repo.list().await?;
            tracing::info!(
                repository = ?repo.repository_type(),
                count = manifests.len(),
                "indexed plugin repository"
            );
            for manifest in manifests {
                fresh.insert(IndexedManifest {
                    manifest: Arc::new(manifest),
                    repository: repo.repository_type(),
                    stored_at: Utc::now(),
                });
            }
        }
        *self.indices.write().await = fresh;
        Ok(())
    }

    /// Every locator currently indexed, optionally filtered by backend.
    pub async fn list(&self, repository: Option<RepositoryType>) -> Vec<PluginLocator> {
        let indices = self.indices.read().await;
        let mut locators: Vec<PluginLocator> = indices
            .by_id
            .values()
            .flat_map(|versions| versions.values())
            .filter(|e| repository.map(|r| e.repository == r).unwrap_or(true))
            .map(|e| e.manifest.locator(e.repository))
            .collect();
        locators.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.verb.cmp(&b.verb)));
        locators.dedup_by(|a, b| a.id == b.id && a.verb == b.verb);
        locators
    }

    /// Exact version when specified, else the highest semver for `id`.
    pub async fn fetch_one(
        &self,
        id: &str,
        version: Option<&semver::Version>,
        repository: Option<RepositoryType>,
    ) -> Option<Arc<PluginManifest>> {
        let indices = self.indices.read().await;
        let versions = indices.by_id.get(id)?;
        let matches = |e: &IndexedManifest| repository.map(|r| e.repository == r).unwrap_or(true);
        match version {
            Some(version) => versions.get(version).filter(|e| matches(e)).map(|e| e.manifest.clone()),
            None => versions
                .values()
                .rev()
                .find(|e| matches(e))
                .map(|e| e.manifest.clone()),
        }
    }

    /// Some manifest for `verb`: the highest semver across every id mapped
    /// to it, ties broken by newest insertion.
    pub async fn fetch_one_by_verb(
        &self,
        verb: &str,
        version: Option<&semver::Version>,
    ) -> Option<Arc<PluginManifest>> {
        let indices = self.indices.read().await;
        let ids = indices.by_verb.get(verb)?;
        let mut best: Option<&IndexedManifest> = None;
        for id in ids {
            let Some(versions) = indices.by_id.get(id) else {
                continue;
            };
            let candidate = match version {
                Some(version) => versions.get(version),
                None => versions.values().next_back(),
            };
            if let Some(candidate) = candidate {
                let better = match best {
                    None => true,
                    Some(current) => {
                        match candidate.manifest.version.cmp(&current.manifest.version) {
                            std::cmp::Ordering::Greater => true,
                            std::cmp::Ordering::Equal => candidate.stored_at > current.stored_at,
                            std::cmp::Ordering::Less => false,
                        }
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
        }
        best.map(|e| e.manifest.clone())
    }

    /// All versions of `id`, newest first.
    pub async fn fetch_all_versions_of_plugin(
        &self,
        id: &str,
        repository: Option<RepositoryType>,
    ) -> Vec<Arc<PluginManifest>> {
        let indices = self.indices.read().await;
        indices
            .by_id
            .get(id)
            .map(|versions| {
                versions
                    .values()
                    .rev()
                    .filter(|e| repository.map(|r| e.repository == r).unwrap_or(true))
                    .map(|e| e.manifest.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All versions serving `verb`, newest first: resolve the verb to its
    /// best id first, then enumerate that id's versions.
    pub async fn fetch_all_versions_by_verb(
        &self,
        verb: &str,
        repository: Option<RepositoryType>,
    ) -> Vec<Arc<PluginManifest>> {
        let Some(manifest) = self.fetch_one_by_verb(verb, None).await else {
            return Vec::new();
        };
        self.fetch_all_versions_of_plugin(&manifest.id, repository)
            .await
    }

    /// Validate, verify, persist, and index a manifest.
    pub async fn store(&self, manifest: PluginManifest) -> EngineResult<StoreOutcome> {
        manifest.validate()?;
        self.verifier.verify(&manifest)?;

        let disallowed = manifest.disallowed_permissions();
        if !disallowed.is_empty() {
            return Err(StructuredError::report(
                ErrorCode::PluginPermissionValidationFailed,
                COMPONENT,
                format!(
                    "manifest {} declares disallowed permissions: {}",
                    manifest.id,
                    disallowed.join(", ")
                ),
            )
            .build());
        }
        for permission in manifest.dangerous_permissions() {
            tracing::warn!(
                plugin_id = %manifest.id,
                permission,
                "plugin declares a dangerous permission"
            );
        }

        let repo = self.repositories.first().ok_or_else(|| {
            StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                "no repository configured",
            )
            .build()
        })?;
        repo.store(&manifest).await?;

        let mut indices = self.indices.write().await;
        let is_update = indices
            .by_id
            .get(&manifest.id)
            .map(|versions| versions.contains_key(&manifest.version))
            .unwrap_or(false);
        let outcome = StoreOutcome {
            plugin_id: manifest.id.clone(),
            version: manifest.version.to_string(),
            is_update,
        };
        indices.insert(IndexedManifest {
            manifest: Arc::new(manifest),
            repository: repo.repository_type(),
            stored_at: Utc::now(),
        });
        Ok(outcome)
    }

    /// Remove `id` (one version or all) from the backing repository and
    /// the indices.
    pub async fn delete(
        &self,
        id: &str,
        version: Option<&semver::Version>,
        repository: Option<RepositoryType>,
    ) -> EngineResult<()> {
        let known = {
            let indices = self.indices.read().await;
            indices.by_id.contains_key(id)
        };
        if !known {
            return Err(StructuredError::report(
                ErrorCode::PluginNotFound,
                COMPONENT,
                format!("no plugin with id {id}"),
            )
            .build());
        }
        for repo in &self.repositories {
            if repository
                .map(|r| repo.repository_type() == r)
                .unwrap_or(true)
            {
                repo.delete(id, version).await?;
            }
        }
        self.indices.write().await.remove(id, version);
        Ok(())
    }

    /// Fail unless the host satisfies the manifest's declared minimums.
    pub fn check_plugin_compatibility(
        manifest: &PluginManifest,
        host: &HostCapabilities,
    ) -> EngineResult<()> {
        if let Some(required_app) = &manifest.host_compatibility.host_app_name {
            if required_app != &host.host_app_name {
                return Err(StructuredError::report(
                    ErrorCode::PluginNotCompatible,
                    COMPONENT,
                    format!(
                        "plugin {} targets host application {required_app}, this host is {}",
                        manifest.id, host.host_app_name
                    ),
                )
                .build());
            }
        }
        if let Some(min_version) = &manifest.host_compatibility.min_host_version {
            if &host.host_version < min_version {
                return Err(StructuredError::report(
                    ErrorCode::PluginNotCompatible,
                    COMPONENT,
                    format!(
                        "plugin {} requires host version >= {min_version}, this host is {}",
                        manifest.id, host.host_version
                    ),
                )
                .build());
            }
        }
        Ok(())
    }

    /// Materialize the manifest's bundle and return its root directory.
    pub async fn prepare_plugin_for_execution(
        &self,
        manifest: &PluginManifest,
    ) -> EngineResult<PathBuf> {
        self.bundles.prepare(manifest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{HandlerKind, HostCompatibility, PackageSource, SecurityConfig};
    use repository::LocalRepository;

    fn manifest(id: &str, verb: &str, version: &str) -> PluginManifest {
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

    fn registry(dir: &std::path::Path) -> PluginRegistry {
        let repo = Arc::new(LocalRepository::new(dir.join("repo")));
        PluginRegistry::new(
            vec![repo],
            Box::new(AcceptUnsigned),
            prepare::BundleCache::new(dir.join("cache"), dir.join("plugins")),
        )
    }

    #[tokio::test]
    async fn store_then_fetch_returns_equivalent_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.store(manifest("plugin-A", "ALPHA", "1.0.0")).await.unwrap();
        let fetched = registry
            .fetch_one("plugin-A", Some(&semver::Version::parse("1.0.0").unwrap()), None)
            .await
            .unwrap();
        assert_eq!(fetched.id, "plugin-A");
        assert_eq!(fetched.verb, "ALPHA");
        assert_eq!(fetched.version.to_string(), "1.0.0");
    }

    #[tokio::test]
    async fn fetch_one_prefers_highest_semver() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.store(manifest("plugin-A", "ALPHA", "1.2.0")).await.unwrap();
        registry.store(manifest("plugin-A", "ALPHA", "1.10.0")).await.unwrap();
        registry.store(manifest("plugin-A", "ALPHA", "1.3.1")).await.unwrap();

        let latest = registry.fetch_one("plugin-A", None, None).await.unwrap();
        assert_eq!(latest.version.to_string(), "1.10.0");

        let all = registry.fetch_all_versions_of_plugin("plugin-A", None).await;
        let versions: Vec<String> = all.iter().map(|m| m.version.to_string()).collect();
        assert_eq!(versions, vec!["1.10.0", "1.3.1", "1.2.0"]);
    }

    #[tokio::test]
    async fn verb_resolution_spans_ids_and_prefers_newest_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.store(manifest("plugin-A", "SEARCH", "1.0.0")).await.unwrap();
        registry.store(manifest("plugin-B", "SEARCH", "2.0.0")).await.unwrap();

        let best = registry.fetch_one_by_verb("SEARCH", None).await.unwrap();
        assert_eq!(best.id, "plugin-B");

        let versions = registry.fetch_all_versions_by_verb("SEARCH", None).await;
        assert!(versions.iter().all(|m| m.id == "plugin-B"));
    }

    #[tokio::test]
    async fn store_reports_updates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let first = registry.store(manifest("plugin-A", "ALPHA", "1.0.0")).await.unwrap();
        assert!(!first.is_update);
        let second = registry.store(manifest("plugin-A", "ALPHA", "1.0.0")).await.unwrap();
        assert!(second.is_update);
    }

    #[tokio::test]
    async fn disallowed_permission_fails_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let mut bad = manifest("plugin-A", "ALPHA", "1.0.0");
        bad.security.permissions = vec!["kernel.reboot".to_string()];
        let err = registry.store(bad).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PluginPermissionValidationFailed);
    }

    #[tokio::test]
    async fn delete_prunes_verb_index() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.store(manifest("plugin-A", "ALPHA", "1.0.0")).await.unwrap();
        registry.delete("plugin-A", None, None).await.unwrap();

        assert!(registry.fetch_one_by_verb("ALPHA", None).await.is_none());
        assert!(registry.list(None).await.is_empty());

        let err = registry.delete("plugin-A", None, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PluginNotFound);
    }

    #[tokio::test]
    async fn compatibility_gates_on_app_name_and_version() {
        let host = HostCapabilities::new(semver::Version::parse("1.5.0").unwrap(), "capman");

        let mut needs_newer = manifest("plugin-A", "X", "1.0.0");
        needs_newer.host_compatibility.min_host_version =
            Some(semver::Version::parse("2.0.0").unwrap());
        assert!(PluginRegistry::check_plugin_compatibility(&needs_newer, &host).is_err());

        let mut fits = manifest("plugin-A", "X", "0.9.0");
        fits.host_compatibility.min_host_version =
            Some(semver::Version::parse("1.0.0").unwrap());
        assert!(PluginRegistry::check_plugin_compatibility(&fits, &host).is_ok());

        let mut wrong_app = manifest("plugin-A", "X", "1.0.0");
        wrong_app.host_compatibility.host_app_name = Some("other-app".to_string());
        assert!(PluginRegistry::check_plugin_compatibility(&wrong_app, &host).is_err());
    }

    #[tokio::test]
    async fn initialize_rebuilds_from_repositories() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(LocalRepository::new(dir.path().join("repo")));
        repo.store(&manifest("plugin-A", "ALPHA", "1.0.0")).await.unwrap();

        let registry = PluginRegistry::new(
            vec![repo],
            Box::new(AcceptUnsigned),
            prepare::BundleCache::new(dir.path().join("cache"), dir.path().join("plugins")),
        );
        assert!(registry.fetch_one("plugin-A", None, None).await.is_none());

        registry.initialize().await.unwrap();
        assert!(registry.fetch_one("plugin-A", None, None).await.is_some());
    }
}
