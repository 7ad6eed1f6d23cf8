//! # Bundle Materialization
//!
//! Turns a manifest's package source into a directory on local disk the
//! executor can run from. Git sources are shallow-cloned into a
//! content-addressed cache (`<cache-root>/<id>/<commit-or-branch>/`) and
//! reused; inline sources already live under the service plugin root.
//! Subprocess-script bundles additionally get a virtual environment with
//! the bundle's requirements installed, tracked by a digest marker so a
//! bundle is never re-installed while its requirements are unchanged.
//!
//! Concurrent preparation of the same cache path is serialized through a
//! keyed lock map; two invocations racing on a cold bundle produce one
//! clone, one install.

use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{HandlerKind, PackageSource, PluginManifest};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

const COMPONENT: &str = "bundle-cache";

/// Marker file recording the md5 of the installed requirements file.
pub const DEPENDENCY_MARKER: &str = ".dependencies_installed";

/// Name of the virtual-environment directory inside a bundle.
pub const VENV_DIR: &str = "venv";

/// Materializes and caches handler bundles.
pub struct BundleCache {
    cache_root: PathBuf,
    inline_root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BundleCache {
    /// `cache_root` holds git clones; `inline_root` is the service plugin
    /// directory inline bundles resolve against.
    pub fn new(cache_root: impl Into<PathBuf>, inline_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            inline_root: inline_root.into(),
            locks: DashMap::new(),
        }
    }

    /// Materialize `manifest`'s bundle and return its root.
    ///
    /// Remote handlers have no bundle; their root is the empty path and
    /// nothing touches disk.
    pub async fn prepare(&self, manifest: &PluginManifest) -> EngineResult<PathBuf> {
        if manifest.handler.is_remote() || matches!(manifest.handler, HandlerKind::Internal) {
            return Ok(PathBuf::new());
        }

        let bundle_root = match &manifest.package_source {
            PackageSource::Inline { path } => {
                let dir = path.clone().unwrap_or_else(|| manifest.verb.clone());
                self.inline_root.join(dir)
            }
            PackageSource::Git {
                url,
                branch,
                commit_hash,
                sub_path,
            } => {
                let cache_path = self.cache_path(&manifest.id, branch, commit_hash.as_deref());
                self.materialize_git(url, branch, commit_hash.as_deref(), &cache_path)
                    .await?;
                match sub_path {
                    Some(sub_path) => cache_path.join(sub_path),
                    None => cache_path,
                }
            }
        };

        if let Some(entry_point) = &manifest.entry_point {
            let main = bundle_root.join(&entry_point.main);
            if !main.is_file() {
                return Err(StructuredError::report(
                    ErrorCode::PluginPreparationFailed,
                    COMPONENT,
                    format!(
                        "entry point {} does not exist in bundle {}",
                        entry_point.main,
                        bundle_root.display()
                    ),
                )
                .with("pluginId", serde_json::Value::String(manifest.id.clone()))
                .build());
            }
        }

        if let HandlerKind::SubprocessScript { runtime } = &manifest.handler {
            self.ensure_dependencies(&bundle_root, &runtime.requirements_file)
                .await?;
        }

        Ok(bundle_root)
    }

    /// `<cache-root>/<id>/<commit-hash | sanitized-branch>/`
    pub fn cache_path(&self, id: &str, branch: &str, commit_hash: Option<&str>) -> PathBuf {
        let key = match commit_hash {
            Some(commit) => commit.to_string(),
            None => sanitize_branch(branch),
        };
        self.cache_root.join(id).join(key)
    }

    async fn materialize_git(
        &self,
        url: &str,
        branch: &str,
        commit_hash: Option<&str>,
        cache_path: &Path,
    ) -> EngineResult<()> {
        let lock = self
            .locks
            .entry(cache_path.display().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A commit-addressed clone is immutable; a branch clone is reused
        // for the process lifetime.
        if cache_path.is_dir() {
            return Ok(());
        }

        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StructuredError::report(
                    ErrorCode::PluginPreparationFailed,
                    COMPONENT,
                    format!("failed to create cache directory {}", parent.display()),
                )
                .cause(e)
                .build()
            })?;
        }

        let clone = run_command(
            Command::new("git")
                .arg("clone")
                .arg("--depth")
                .arg("1")
                .arg("--branch")
                .arg(branch)
                .arg(url)
                .arg(cache_path),
            "git clone",
        )
        .await;
        if let Err(e) = clone {
            // Leave no partial clone behind to poison the cache key.
            let _ = tokio::fs::remove_dir_all(cache_path).await;
            return Err(StructuredError::report(
                ErrorCode::GitCloneFailed,
                COMPONENT,
                format!("failed to clone {url} (branch {branch})"),
            )
            .cause(e)
            .build());
        }

        if let Some(commit) = commit_hash {
            let pinned = async {
                run_command(
                    Command::new("git")
                        .current_dir(cache_path)
                        .arg("fetch")
                        .arg("--depth")
                        .arg("1")
                        .arg("origin")
                        .arg(commit),
                    "git fetch",
                )
                .await?;
                run_command(
                    Command::new("git")
                        .current_dir(cache_path)
                        .arg("checkout")
                        .arg(commit),
                    "git checkout",
                )
                .await
            }
            .await;
            if let Err(e) = pinned {
                let _ = tokio::fs::remove_dir_all(cache_path).await;
                return Err(StructuredError::report(
                    ErrorCode::GitCloneFailed,
                    COMPONENT,
                    format!("failed to pin {url} at {commit}"),
                )
                .cause(e)
                .build());
            }
        }

        tracing::info!(url, branch, commit = ?commit_hash, path = %cache_path.display(), "materialized git bundle");
        Ok(())
    }

    /// Install the bundle's requirements into its venv unless the marker
    /// already records the current requirements digest.
    ///
    /// A first failure mentioning "directory not empty" deletes the venv
    /// and retries once; anything else is fatal for the invocation.
    pub async fn ensure_dependencies(
        &self,
        bundle_root: &Path,
        requirements_file: &str,
    ) -> EngineResult<()> {
        let requirements = bundle_root.join(requirements_file);
        let requirements_bytes = match tokio::fs::read(&requirements).await {
            Ok(bytes) => bytes,
            // No requirements file means nothing to install.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StructuredError::report(
                    ErrorCode::DependencyInstallFailed,
                    COMPONENT,
                    format!("failed to read {}", requirements.display()),
                )
                .cause(e)
                .build())
            }
        };
        let digest = format!("{:x}", md5::compute(&requirements_bytes));

        let marker = bundle_root.join(DEPENDENCY_MARKER);
        if let Ok(existing) = tokio::fs::read_to_string(&marker).await {
            if existing.trim() == digest {
                return Ok(());
            }
        }

        let lock = self
            .locks
            .entry(format!("venv:{}", bundle_root.display()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check under the lock; a concurrent preparation may have just
        // finished the install.
        if let Ok(existing) = tokio::fs::read_to_string(&marker).await {
            if existing.trim() == digest {
                return Ok(());
            }
        }

        match self.install_into_venv(bundle_root, &requirements).await {
            Ok(()) => {}
            Err(e) if e.to_string().contains("directory not empty") => {
                tracing::warn!(
                    bundle = %bundle_root.display(),
                    "dependency install hit a stale venv, retrying once"
                );
                let _ = tokio::fs::remove_dir_all(bundle_root.join(VENV_DIR)).await;
                self.install_into_venv(bundle_root, &requirements).await?;
            }
            Err(e) => return Err(e),
        }

        tokio::fs::write(&marker, &digest).await.map_err(|e| {
            StructuredError::report(
                ErrorCode::DependencyInstallFailed,
                COMPONENT,
                format!("failed to write {}", marker.display()),
            )
            .cause(e)
            .build()
        })?;
        Ok(())
    }

    async fn install_into_venv(
        &self,
        bundle_root: &Path,
        requirements: &Path,
    ) -> EngineResult<()> {
        let venv = bundle_root.join(VENV_DIR);
        if !venv.is_dir() {
            run_command(
                Command::new("python3").arg("-m").arg("venv").arg(&venv),
                "venv creation",
            )
            .await
            .map_err(|e| {
                StructuredError::report(
                    ErrorCode::DependencyInstallFailed,
                    COMPONENT,
                    format!("failed to create venv in {}", bundle_root.display()),
                )
                .cause(e)
                .build()
            })?;
        }
        run_command(
            Command::new(venv.join("bin").join("pip"))
                .arg("install")
                .arg("-r")
                .arg(requirements),
            "pip install",
        )
        .await
        .map_err(|e| {
            StructuredError::report(
                ErrorCode::DependencyInstallFailed,
                COMPONENT,
                format!("dependency install failed in {}", bundle_root.display()),
            )
            .cause(e)
            .build()
        })
    }
}

/// Interpreter path for a subprocess bundle: the venv binary when the
/// bundle has one, otherwise the bare name resolved from PATH.
pub fn venv_interpreter(bundle_root: &Path, interpreter: &str) -> PathBuf {
    let candidate = bundle_root.join(VENV_DIR).join("bin").join(interpreter);
    if candidate.is_file() {
        candidate
    } else {
        PathBuf::from(interpreter)
    }
}

/// Branch names become single path components in the cache.
fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Run a short-lived command, failing with its stderr on a non-zero exit.
async fn run_command(command: &mut Command, what: &str) -> Result<(), String> {
    let output = command
        .output()
        .await
        .map_err(|e| format!("{what}: failed to spawn: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{what}: {} ({})", stderr.trim(), output.status))
    }
}
