//! # Container Manager
//!
//! Lifecycle of container-language handlers: image build from the bundle's
//! build context, host-port allocation from a fixed pool, container
//! create/start, readiness probing, execution over HTTP, and teardown that
//! runs on every exit path. A background monitor re-probes running
//! instances and records their health.
//!
//! The manager exclusively owns the instance table and the port pool.
//! `stop` releases the port before deleting the record, so a port is never
//! observed both free and attached to a live instance.

use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::ContainerConfig;
use crate::models::{ContainerExecutionRequest, ContainerExecutionResponse};
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const COMPONENT: &str = "container-manager";

/// Host ports handed to containers come from this inclusive range.
pub const PORT_RANGE_START: u16 = 8080;
pub const PORT_RANGE_END: u16 = 8999;

/// Grace given to a stopping container before the engine kills it.
const STOP_GRACE_SECS: i64 = 10;

/// Readiness probing: one probe per second, up to this many attempts.
const READY_ATTEMPTS: u32 = 30;

/// Interval of the background health monitor.
pub const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// One running (or starting) container serving a plugin invocation.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInstance {
    pub instance_id: String,
    pub engine_container_id: String,
    pub plugin_id: String,
    pub image: String,
    pub host_port: u16,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthState,
}

/// Result of POSTing an execution request to a container.
#[derive(Debug, Clone)]
pub struct ContainerExecutionResult {
    pub success: bool,
    pub outputs: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
}

/// Fixed-range pool of host ports.
///
/// `allocate` hands out the lowest free port; `release` returns it. Both
/// are atomic with respect to each other.
pub struct PortPool {
    used: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(BTreeSet::new()),
        }
    }

    pub async fn allocate(&self) -> EngineResult<u16> {
        let mut used = self.used.lock().await;
        for port in PORT_RANGE_START..=PORT_RANGE_END {
            if !used.contains(&port) {
                used.insert(port);
                return Ok(port);
            }
        }
        Err(StructuredError::report(
            ErrorCode::NoAvailablePorts,
            COMPONENT,
            format!("no available ports in {PORT_RANGE_START}..{PORT_RANGE_END}"),
        )
        .build())
    }

    pub async fn release(&self, port: u16) {
        self.used.lock().await.remove(&port);
    }

    pub async fn is_used(&self, port: u16) -> bool {
        self.used.lock().await.contains(&port)
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns container instances, their ports, and the engine connection.
pub struct ContainerManager {
    docker: Docker,
    http: reqwest::Client,
    instances: RwLock<HashMap<String, ContainerInstance>>,
    ports: PortPool,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ContainerManager {
    /// Connect to the local container engine.
    pub fn connect_local() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            StructuredError::report(
                ErrorCode::InternalError,
                COMPONENT,
                "failed to connect to the local container engine",
            )
            .cause(e)
            .build()
        })?;
        Ok(Self::new(docker))
    }

    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            http: reqwest::Client::new(),
            instances: RwLock::new(HashMap::new()),
            ports: PortPool::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub async fn active_instances(&self) -> Vec<ContainerInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Build the manifest's image from the bundle's build context.
    pub async fn build_image(
        &self,
        config: &ContainerConfig,
        bundle_root: &Path,
    ) -> EngineResult<()> {
        let context_dir = bundle_root.join(&config.build_context);
        let dockerfile = context_dir.join(&config.dockerfile);
        if !dockerfile.is_file() {
            return Err(StructuredError::report(
                ErrorCode::ContainerBuildFailed,
                COMPONENT,
                format!("dockerfile {} not found in bundle", dockerfile.display()),
            )
            .build());
        }

        let context = pack_build_context(&context_dir).await?;
        let options = BuildImageOptions {
            dockerfile: config.dockerfile.clone(),
            t: config.image.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| {
                StructuredError::report(
                    ErrorCode::ContainerBuildFailed,
                    COMPONENT,
                    format!("image build failed for {}", config.image),
                )
                .cause(e)
                .build()
            })?;
            if let Some(error) = info.error {
                return Err(StructuredError::report(
                    ErrorCode::ContainerBuildFailed,
                    COMPONENT,
                    format!("image build failed for {}: {error}", config.image),
                )
                .build());
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(image = %config.image, "{line}");
                }
            }
        }
        tracing::info!(image = %config.image, "image built");
        Ok(())
    }

    /// Create and start a container for `plugin_id`, wait until its health
    /// endpoint answers, and return the instance record.
    ///
    /// On any failure after port allocation the container is torn down and
    /// the port returned before the error propagates.
    pub async fn start(
        &self,
        plugin_id: &str,
        config: &ContainerConfig,
        extra_env: &HashMap<String, String>,
    ) -> EngineResult<ContainerInstance> {
        let host_port = self.ports.allocate().await?;
        match self.start_on_port(plugin_id, config, extra_env, host_port).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.ports.release(host_port).await;
                Err(e)
            }
        }
    }

    async fn start_on_port(
        &self,
        plugin_id: &str,
        config: &ContainerConfig,
        extra_env: &HashMap<String, String>,
        host_port: u16,
    ) -> EngineResult<ContainerInstance> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let name = container_name(plugin_id, &instance_id);

        let mut env: Vec<String> = config
            .environment
            .iter()
            .chain(extra_env.iter())
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.sort();

        let container_port_key = format!("{}/tcp", config.container_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port_key, HashMap::new());
        for extra in &config.additional_ports {
            exposed_ports.insert(format!("{extra}/tcp"), HashMap::new());
        }

        let memory = config
            .memory
            .as_deref()
            .map(parse_memory)
            .transpose()?;
        let cpu_shares = config.cpu.map(|cpu| (cpu * 1024.0) as i64);

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                memory,
                cpu_shares,
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| {
                StructuredError::report(
                    ErrorCode::ContainerStartFailed,
                    COMPONENT,
                    format!("failed to create container for {plugin_id}"),
                )
                .cause(e)
                .build()
            })?;

        let start_result = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await;
        if let Err(e) = start_result {
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(StructuredError::report(
                ErrorCode::ContainerStartFailed,
                COMPONENT,
                format!("failed to start container for {plugin_id}"),
            )
            .cause(e)
            .build());
        }

        let instance = ContainerInstance {
            instance_id: instance_id.clone(),
            engine_container_id: created.id,
            plugin_id: plugin_id.to_string(),
            image: config.image.clone(),
            host_port,
            status: ContainerStatus::Starting,
            created_at: Utc::now(),
            last_health_check: None,
            health_status: HealthState::Unknown,
        };
        self.instances
            .write()
            .await
            .insert(instance_id.clone(), instance.clone());

        if let Err(e) = self.wait_for_ready(&instance_id, config).await {
            // Ready never came; the container must not outlive the error.
            let _ = self.stop_engine_container(&instance.engine_container_id).await;
            self.instances.write().await.remove(&instance_id);
            return Err(e);
        }

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&instance_id)
            .expect("instance recorded above");
        instance.status = ContainerStatus::Running;
        instance.health_status = HealthState::Healthy;
        instance.last_health_check = Some(Utc::now());
        Ok(instance.clone())
    }

    /// Probe the health endpoint once per second until it reports healthy
    /// or the attempt budget is exhausted.
    async fn wait_for_ready(&self, instance_id: &str, config: &ContainerConfig) -> EngineResult<()> {
        let host_port = {
            let instances = self.instances.read().await;
            instances
                .get(instance_id)
                .map(|i| i.host_port)
                .ok_or_else(|| missing_instance(instance_id))?
        };
        let url = format!(
            "http://127.0.0.1:{host_port}{}",
            config.health_check_path
        );
        let probe_timeout = Duration::from_secs(config.health_check_timeout_secs.max(1));

        for attempt in 1..=READY_ATTEMPTS {
            if probe_health(&self.http, &url, probe_timeout).await {
                tracing::debug!(instance_id, attempt, "container ready");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if let Some(instance) = self.instances.write().await.get_mut(instance_id) {
            instance.status = ContainerStatus::Error;
            instance.health_status = HealthState::Unhealthy;
        }
        Err(StructuredError::report(
            ErrorCode::ContainerHealthCheckFailed,
            COMPONENT,
            format!("container {instance_id} did not become healthy after {READY_ATTEMPTS} probes"),
        )
        .build())
    }

    /// POST the execution request to the container's API endpoint.
    ///
    /// Transport failures and non-2xx answers come back as an unsuccessful
    /// result, not an error; the caller still owns the stop.
    pub async fn execute(
        &self,
        instance_id: &str,
        config: &ContainerConfig,
        request: &ContainerExecutionRequest,
        deadline: Duration,
    ) -> EngineResult<ContainerExecutionResult> {
        let host_port = {
            let instances = self.instances.read().await;
            instances
                .get(instance_id)
                .map(|i| i.host_port)
                .ok_or_else(|| missing_instance(instance_id))?
        };
        let url = format!("http://127.0.0.1:{host_port}{}", config.api_endpoint);
        let started = std::time::Instant::now();

        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(request)
            .send()
            .await;
        let execution_time = started.elapsed();

        match response {
            Ok(response) if response.status().is_success() => {
                let decoded: ContainerExecutionResponse =
                    response.json().await.map_err(|e| {
                        StructuredError::report(
                            ErrorCode::ContainerExecutionFailed,
                            COMPONENT,
                            format!("container {instance_id} returned an undecodable body"),
                        )
                        .cause(e)
                        .build()
                    })?;
                Ok(ContainerExecutionResult {
                    success: decoded.success,
                    outputs: decoded.outputs,
                    error: decoded.error,
                    execution_time,
                })
            }
            Ok(response) => Ok(ContainerExecutionResult {
                success: false,
                outputs: HashMap::new(),
                error: Some(format!("container answered {}", response.status())),
                execution_time,
            }),
            Err(e) => Ok(ContainerExecutionResult {
                success: false,
                outputs: HashMap::new(),
                error: Some(format!("container request failed: {e}")),
                execution_time,
            }),
        }
    }

    /// Stop and remove an instance, release its port, drop its record.
    ///
    /// Engine failures during stop are logged, not surfaced; the port and
    /// the record are reclaimed regardless.
    pub async fn stop(&self, instance_id: &str) -> EngineResult<()> {
        let instance = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(instance_id) else {
                return Err(missing_instance(instance_id));
            };
            instance.status = ContainerStatus::Stopping;
            instance.clone()
        };

        if let Err(e) = self.stop_engine_container(&instance.engine_container_id).await {
            tracing::warn!(
                instance_id,
                error = %e,
                "engine stop failed, reclaiming resources anyway"
            );
        }

        self.ports.release(instance.host_port).await;
        self.instances.write().await.remove(instance_id);
        tracing::info!(instance_id, plugin_id = %instance.plugin_id, "container stopped");
        Ok(())
    }

    async fn stop_engine_container(&self, engine_id: &str) -> Result<(), bollard::errors::Error> {
        self.docker
            .stop_container(engine_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await?;
        self.docker
            .remove_container(
                engine_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
    }

    /// Spawn the periodic health monitor. Idempotent per manager.
    pub async fn start_health_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.probe_active_instances().await;
            }
        }));
    }

    async fn probe_active_instances(&self) {
        let running: Vec<(String, u16, String)> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| i.status == ContainerStatus::Running)
                .map(|i| (i.instance_id.clone(), i.host_port, i.plugin_id.clone()))
                .collect()
        };
        tracing::debug!(count = running.len(), "health monitor tick");

        for (instance_id, host_port, plugin_id) in running {
            let url = format!("http://127.0.0.1:{host_port}/health");
            let healthy = probe_health(&self.http, &url, Duration::from_secs(5)).await;
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(&instance_id) {
                instance.last_health_check = Some(Utc::now());
                instance.health_status = if healthy {
                    HealthState::Healthy
                } else {
                    HealthState::Unhealthy
                };
                if !healthy {
                    tracing::warn!(instance_id, plugin_id = %plugin_id, "container unhealthy");
                }
            }
        }
    }

    /// Stop every instance in parallel and cancel the monitor. Shutdown
    /// failures are logged and do not abort the sweep.
    pub async fn cleanup(&self) {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        let ids: Vec<String> = {
            let instances = self.instances.read().await;
            instances.keys().cloned().collect()
        };
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                tracing::warn!(instance_id = %id, error = %e, "cleanup stop failed");
            }
        }
    }
}

fn missing_instance(instance_id: &str) -> StructuredError {
    StructuredError::report(
        ErrorCode::ContainerNotFound,
        COMPONENT,
        format!("no container instance {instance_id}"),
    )
    .build()
}

/// One health probe: HTTP 200 with a body reporting `status == "healthy"`.
async fn probe_health(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    let response = match client.get(url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(_) => return false,
    };
    if !response.status().is_success() {
        return false;
    }
    match response.json::<serde_json::Value>().await {
        Ok(body) => body.get("status").and_then(|s| s.as_str()) == Some("healthy"),
        Err(_) => false,
    }
}

fn container_name(plugin_id: &str, instance_id: &str) -> String {
    let safe: String = plugin_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let short = &instance_id[..instance_id.len().min(8)];
    format!("capman-{safe}-{short}")
}

/// Parse "100m" / "2g" / plain bytes into an engine memory cap.
fn parse_memory(spec: &str) -> EngineResult<i64> {
    let spec = spec.trim().to_ascii_lowercase();
    let (digits, multiplier) = match spec.chars().last() {
        Some('k') => (&spec[..spec.len() - 1], 1024i64),
        Some('m') => (&spec[..spec.len() - 1], 1024 * 1024),
        Some('g') => (&spec[..spec.len() - 1], 1024 * 1024 * 1024),
        _ => (spec.as_str(), 1),
    };
    digits
        .parse::<i64>()
        .map(|n| n * multiplier)
        .map_err(|_| {
            StructuredError::report(
                ErrorCode::ContainerStartFailed,
                COMPONENT,
                format!("unparseable memory cap: {spec}"),
            )
            .build()
        })
}

/// Tar the build context in a blocking task; contexts can be large.
async fn pack_build_context(context_dir: &Path) -> EngineResult<Vec<u8>> {
    let dir = context_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", &dir)?;
        builder.into_inner()
    })
    .await
    .map_err(|e| {
        StructuredError::report(ErrorCode::ContainerBuildFailed, COMPONENT, "tar task failed")
            .cause(e)
            .build()
    })?
    .map_err(|e| {
        StructuredError::report(
            ErrorCode::ContainerBuildFailed,
            COMPONENT,
            "failed to pack the build context",
        )
        .cause(e)
        .build()
    })
}
