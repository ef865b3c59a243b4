//! `RuntimeAdapter`: a thin, retry-aware facade over the container runtime
//! (§4.2). The production implementation wraps `bollard`'s async Docker
//! Engine API client; the rebuild-and-retry-once policy on idempotent calls
//! mirrors the original `docker.from_env()` re-creation on `APIError`.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::CreateExecOptions;
use bollard::models::{HostConfig, PortBinding, PortMap as BollardPortMap};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::error::RuntimeError;

pub const JOB_IMAGE: &str = "alpine_ssh";

#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub port_bindings: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Default)]
pub struct CpuSample {
    pub cpu_total: u64,
    pub cpu_system: u64,
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn list(&self) -> Result<Vec<RunningContainer>, RuntimeError>;
    async fn inspect(&self, id: &str) -> Result<RunningContainer, RuntimeError>;
    async fn stats(&self, id: &str) -> Result<CpuSample, RuntimeError>;
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        name: &str,
        cpu_period: i64,
        cpu_quota: i64,
        mem_bytes: i64,
        port_bindings: &BTreeMap<String, u16>,
    ) -> Result<String, RuntimeError>;
    async fn exec(&self, id: &str, command: &[&str]) -> Result<(), RuntimeError>;
    async fn put_archive(&self, id: &str, path: &str, tar_bytes: Vec<u8>) -> Result<(), RuntimeError>;
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
    async fn prune_stopped(&self) -> Result<(), RuntimeError>;
    /// Tears down and reconnects the underlying runtime handle (§4.3 dispatch
    /// step 4's middle retry rung: reconstruct the handle, retry once with
    /// the same port map, before falling back to a fresh port allocation).
    async fn reconnect(&self) -> Result<(), RuntimeError>;
}

/// Wraps the real `bollard::Docker` handle behind a lock so it can be
/// transparently rebuilt on error (§4.2 "the adapter transparently rebuilds
/// its client handle and retries once").
pub struct BollardRuntime {
    docker: RwLock<Docker>,
}

impl BollardRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker: RwLock::new(docker) })
    }

    async fn rebuild(&self) -> Result<(), RuntimeError> {
        let fresh = Docker::connect_with_local_defaults()?;
        *self.docker.write().await = fresh;
        Ok(())
    }

    /// Runs `op` against the current handle; on any error, rebuilds the
    /// handle and retries exactly once (§4.2 retry policy for idempotent
    /// calls).
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, RuntimeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(_first) => {
                self.rebuild().await?;
                op().await
            }
        }
    }

    fn container_name_to_id(&self, name_or_id: &str) -> String {
        name_or_id.trim_start_matches('/').to_string()
    }
}

fn map_docker_error(err: bollard::errors::Error) -> RuntimeError {
    if let bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } = err {
        RuntimeError::NotFound
    } else {
        RuntimeError::Transport(err)
    }
}

#[async_trait]
impl RuntimeAdapter for BollardRuntime {
    async fn list(&self) -> Result<Vec<RunningContainer>, RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            let options = ListContainersOptions::<String> { all: false, ..Default::default() };
            let containers = docker.list_containers(Some(options)).await.map_err(map_docker_error)?;
            Ok(containers
                .into_iter()
                .map(|c| {
                    let name = c
                        .names
                        .and_then(|n| n.into_iter().next())
                        .map(|n| self.container_name_to_id(&n))
                        .unwrap_or_default();
                    let mut port_bindings = BTreeMap::new();
                    for p in c.ports.unwrap_or_default() {
                        if let Some(host_port) = p.public_port {
                            port_bindings.insert(p.private_port.to_string(), host_port as u16);
                        }
                    }
                    RunningContainer {
                        id: c.id.unwrap_or_default(),
                        name,
                        created_at: c.created.unwrap_or(0),
                        port_bindings,
                    }
                })
                .collect())
        })
        .await
    }

    async fn inspect(&self, id: &str) -> Result<RunningContainer, RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            let details = docker.inspect_container(id, None).await.map_err(map_docker_error)?;
            let mut port_bindings = BTreeMap::new();
            if let Some(ports) = details
                .host_config
                .as_ref()
                .and_then(|h| h.port_bindings.as_ref())
            {
                for (container_port, bindings) in ports {
                    let port_str = container_port.split('/').next().unwrap_or(container_port);
                    if let Some(binding) = bindings.as_ref().and_then(|b| b.first()) {
                        if let Some(host_port) = binding.host_port.as_ref().and_then(|p| p.parse::<u16>().ok()) {
                            port_bindings.insert(port_str.to_string(), host_port);
                        }
                    }
                }
            }
            let created_at = details
                .created
                .as_deref()
                .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
                .map(|dt| dt.timestamp())
                .unwrap_or(0);
            Ok(RunningContainer {
                id: details.id.unwrap_or_default(),
                name: details.name.unwrap_or_default().trim_start_matches('/').to_string(),
                created_at,
                port_bindings,
            })
        })
        .await
    }

    async fn stats(&self, id: &str) -> Result<CpuSample, RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            let options = StatsOptions { stream: false, one_shot: true };
            let mut stream = docker.stats(id, Some(options));
            let stats = stream
                .next()
                .await
                .ok_or(RuntimeError::NotFound)?
                .map_err(map_docker_error)?;
            let cpu_total = stats.cpu_stats.cpu_usage.total_usage;
            let cpu_system = stats.cpu_stats.system_cpu_usage.unwrap_or(0);
            Ok(CpuSample { cpu_total, cpu_system })
        })
        .await
    }

    async fn run(
        &self,
        name: &str,
        cpu_period: i64,
        cpu_quota: i64,
        mem_bytes: i64,
        port_bindings: &BTreeMap<String, u16>,
    ) -> Result<String, RuntimeError> {
        let docker = self.docker.read().await;

        let mut bindings: BollardPortMap = BollardPortMap::new();
        let mut exposed_ports = BTreeMap::new();
        for (container_port, host_port) in port_bindings {
            let key = format!("{container_port}/tcp");
            bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
            exposed_ports.insert(key, std::collections::HashMap::new());
        }

        let host_config = HostConfig {
            cpu_period: Some(cpu_period),
            cpu_quota: Some(cpu_quota),
            memory: Some(mem_bytes),
            network_mode: Some("bridge".to_string()),
            port_bindings: Some(bindings),
            ..Default::default()
        };
        let config = Config {
            image: Some(JOB_IMAGE.to_string()),
            tty: Some(true),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions { name, platform: None };
        let created = docker
            .create_container(Some(options), config)
            .await
            .map_err(map_docker_error)?;
        docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)?;
        Ok(created.id)
    }

    async fn exec(&self, id: &str, command: &[&str]) -> Result<(), RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            let options = CreateExecOptions {
                cmd: Some(command.iter().map(|s| s.to_string()).collect()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            };
            let exec = docker.create_exec(id, options).await.map_err(map_docker_error)?;
            docker
                .start_exec(&exec.id, None)
                .await
                .map_err(map_docker_error)?;
            Ok(())
        })
        .await
    }

    async fn put_archive(&self, id: &str, path: &str, tar_bytes: Vec<u8>) -> Result<(), RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            let options = UploadToContainerOptions { path, ..Default::default() };
            docker
                .upload_to_container(id, Some(options), tar_bytes.clone().into())
                .await
                .map_err(map_docker_error)
        })
        .await
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            match docker.stop_container(id, Some(StopContainerOptions { t: 5 })).await {
                Ok(()) => Ok(()),
                Err(e) => match map_docker_error(e) {
                    RuntimeError::NotFound => Ok(()),
                    other => Err(other),
                },
            }
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            let options = RemoveContainerOptions { v: true, force: true, ..Default::default() };
            match docker.remove_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                Err(e) => match map_docker_error(e) {
                    RuntimeError::NotFound => Ok(()),
                    other => Err(other),
                },
            }
        })
        .await
    }

    async fn prune_stopped(&self) -> Result<(), RuntimeError> {
        self.with_retry(|| async {
            let docker = self.docker.read().await;
            docker.prune_containers(None).await.map_err(map_docker_error)?;
            Ok(())
        })
        .await
    }

    async fn reconnect(&self) -> Result<(), RuntimeError> {
        self.rebuild().await
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
