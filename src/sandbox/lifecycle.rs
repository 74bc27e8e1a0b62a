//! Sandbox lifecycle: startup ordering, supervision, teardown.
//!
//! Startup is strict (bridge, filter chain, proxy, sidecar, command);
//! teardown is the exact reverse and best-effort: later steps run even
//! when earlier ones fail, so a mid-startup abort never strands host
//! state. Transient Docker failures are retried up to three times with a
//! short backoff before surfacing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use ipnet::Ipv4Net;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health;
use super::{ContainerSpec, SandboxTopology};
use crate::enforce::{EnforceError, HostChainInstaller, HostCommandRunner};
use crate::policy::PolicyArtifact;

/// How long the proxy may take to accept connections.
const PROXY_START_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the sidecar may take to answer its health endpoint.
const SIDECAR_START_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period before a stop escalates to kill.
const STOP_GRACE_SECS: i64 = 5;
/// Retry attempts for transient Docker errors.
const TRANSIENT_RETRIES: u32 = 3;
/// Base backoff between retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(300);
/// Log lines included in startup-failure reports.
const FAILURE_LOG_TAIL: &str = "50";

/// Lifecycle failures, each mapped to a distinct orchestrator exit path.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The Docker daemon is unreachable.
    #[error("docker daemon unavailable: {0}")]
    DockerUnavailable(String),
    /// The chosen subnet collided with a network created since compilation.
    #[error("subnet {subnet} is already taken by another network")]
    SubnetTaken {
        /// The colliding subnet.
        subnet: String,
    },
    /// Bridge creation failed for a non-subnet reason.
    #[error("bridge network creation failed: {0}")]
    BridgeCreationFailed(String),
    /// Host filter chain could not be installed (fail-closed).
    #[error(transparent)]
    Filter(#[from] EnforceError),
    /// An image could not be found locally or pulled.
    #[error("image {image} unavailable: {detail}")]
    ImageUnavailable {
        /// Image reference.
        image: String,
        /// Pull failure detail.
        detail: String,
    },
    /// The proxy never became ready.
    #[error("egress proxy failed to become ready; last log page:\n{logs}")]
    ProxyStartTimeout {
        /// Tail of the proxy container's log.
        logs: String,
    },
    /// The credential sidecar never became ready.
    #[error("credential sidecar failed to become ready; last log page:\n{logs}")]
    SidecarStartTimeout {
        /// Tail of the sidecar container's log.
        logs: String,
    },
    /// The command container could not be created or started.
    #[error("command container failed to start: {0}")]
    CommandContainerStartFailed(String),
    /// A generated file could not be written.
    #[error("cannot materialize {path}: {source}")]
    Materialize {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Catch-all for a failed lifecycle stage.
    #[error("lifecycle stage {stage} failed: {cause}")]
    Stage {
        /// Stage name.
        stage: &'static str,
        /// Failure detail.
        cause: String,
    },
    /// Contract violation inside the manager itself.
    #[error("internal lifecycle error: {0}")]
    Internal(String),
}

/// Why supervision ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The user command exited with this status.
    CommandExited(i64),
    /// The proxy died while the command was still running; the run is
    /// invalid regardless of what the command would have returned.
    ProxyDied,
    /// Cancellation was requested (signal or run timeout).
    Cancelled,
}

/// Tracks which startup steps have observable host state to undo.
#[derive(Debug, Default)]
struct Started {
    network: bool,
    filter: bool,
    proxy: bool,
    sidecar: bool,
    command: bool,
}

/// Drives one sandbox from creation to teardown.
pub struct LifecycleManager {
    docker: Docker,
    filter: HostChainInstaller,
    topology: SandboxTopology,
    started: Started,
}

impl LifecycleManager {
    /// Build a manager for a compiled artifact and its topology.
    pub fn new(
        docker: Docker,
        runner: Arc<dyn HostCommandRunner>,
        artifact: &PolicyArtifact,
        topology: SandboxTopology,
    ) -> Self {
        Self {
            docker,
            filter: HostChainInstaller::new(runner, artifact.host_chain()),
            topology,
            started: Started::default(),
        }
    }

    /// Connect to the local Docker daemon and verify it answers.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DockerUnavailable`] when the daemon
    /// cannot be reached.
    pub async fn connect() -> Result<Docker, LifecycleError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| LifecycleError::DockerUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| LifecycleError::DockerUnavailable(e.to_string()))?;
        Ok(docker)
    }

    /// Collect the IPv4 subnets of every existing network, feeding the
    /// policy compiler's pure subnet selection.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Stage`] when networks cannot be listed.
    pub async fn subnets_in_use(docker: &Docker) -> Result<Vec<Ipv4Net>, LifecycleError> {
        let networks = docker
            .list_networks::<String>(None)
            .await
            .map_err(|e| LifecycleError::Stage {
                stage: "list-networks",
                cause: e.to_string(),
            })?;

        let mut subnets = Vec::new();
        for network in networks {
            let Some(ipam) = network.ipam else { continue };
            for config in ipam.config.unwrap_or_default() {
                if let Some(parsed) = config.subnet.and_then(|s| s.parse::<Ipv4Net>().ok()) {
                    subnets.push(parsed);
                }
            }
        }
        Ok(subnets)
    }

    /// Run the strict startup sequence. On error the caller must still
    /// invoke [`Self::teardown`]; steps that never ran are skipped there.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        self.create_bridge().await?;
        self.started.network = true;

        self.filter.install().await?;
        self.started.filter = true;
        info!(chain = "AWF_EGRESS", "host-bridge filter chain installed");

        let proxy = self.topology.proxy.clone();
        self.launch_container(&proxy).await?;
        self.started.proxy = true;
        let proxy_addr = SocketAddr::from((proxy.fixed_ip, crate::policy::PROXY_PORT));
        if !health::wait_for_tcp(proxy_addr, PROXY_START_TIMEOUT).await {
            return Err(LifecycleError::ProxyStartTimeout {
                logs: self.log_tail(&proxy.name).await,
            });
        }
        info!(container = %proxy.name, "egress proxy ready");

        if let Some(sidecar) = self.topology.sidecar.clone() {
            self.launch_container(&sidecar).await?;
            self.started.sidecar = true;
            let url = format!("http://{}:8080/healthz", sidecar.fixed_ip);
            if !health::wait_for_http_ok(&url, SIDECAR_START_TIMEOUT).await {
                return Err(LifecycleError::SidecarStartTimeout {
                    logs: self.log_tail(&sidecar.name).await,
                });
            }
            info!(container = %sidecar.name, "credential sidecar ready");
        }

        let command = self.topology.command.clone();
        self.launch_container(&command)
            .await
            .map_err(|e| LifecycleError::CommandContainerStartFailed(e.to_string()))?;
        self.started.command = true;
        info!(container = %command.name, "command container started");

        Ok(())
    }

    /// Forward the command container's output to our stdout/stderr,
    /// line-at-a-time in source order, until the stream ends or
    /// cancellation fires. Runs as its own task.
    pub fn stream_command_logs(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let docker = self.docker.clone();
        let name = self.topology.command.name.clone();
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&name, Some(options));
            let mut out = tokio::io::stdout();
            let mut err = tokio::io::stderr();
            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                            let _ = out.write_all(&message).await;
                            let _ = out.flush().await;
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            let _ = err.write_all(&message).await;
                            let _ = err.flush().await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "log stream error");
                            break;
                        }
                        None => break,
                    },
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Supervise the running sandbox until the command exits, the proxy
    /// dies, or cancellation is requested.
    pub async fn supervise(&self, cancel: &CancellationToken) -> SupervisionOutcome {
        let mut command_wait = self.docker.wait_container(
            &self.topology.command.name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let mut proxy_wait = self.docker.wait_container(
            &self.topology.proxy.name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        tokio::select! {
            result = command_wait.next() => match result {
                Some(Ok(response)) => SupervisionOutcome::CommandExited(response.status_code),
                // A wait error after startup means the container is gone;
                // recover the real code from inspect where possible.
                _ => SupervisionOutcome::CommandExited(self.inspect_exit_code().await),
            },
            _ = proxy_wait.next() => {
                warn!("egress proxy exited while the command was running");
                SupervisionOutcome::ProxyDied
            }
            () = cancel.cancelled() => SupervisionOutcome::Cancelled,
        }
    }

    /// Reverse-order, best-effort teardown. Always safe to call; only
    /// undoes steps that started.
    pub async fn teardown(&mut self) {
        if self.started.command {
            self.stop_and_remove(&self.topology.command.name).await;
            self.started.command = false;
        }
        if self.started.sidecar {
            if let Some(sidecar) = &self.topology.sidecar {
                self.stop_and_remove(&sidecar.name).await;
            }
            self.started.sidecar = false;
        }
        if self.started.proxy {
            self.stop_and_remove(&self.topology.proxy.name).await;
            self.started.proxy = false;
        }
        if self.started.network {
            if let Err(e) = self.docker.remove_network(&self.topology.bridge.name).await {
                warn!(network = %self.topology.bridge.name, error = %e, "bridge removal failed");
            }
            self.started.network = false;
        }
        if self.started.filter {
            self.filter.remove().await;
            self.started.filter = false;
        }
        info!(run_id = %self.topology.run_id, "sandbox teardown complete");
    }

    async fn create_bridge(&self) -> Result<(), LifecycleError> {
        let subnet = self.topology.bridge.subnet.to_string();
        let mut pools = vec![IpamConfig {
            subnet: Some(subnet.clone()),
            ..Default::default()
        }];
        if let Some(v6) = self.topology.bridge.subnet_v6 {
            pools.push(IpamConfig {
                subnet: Some(v6.to_string()),
                ..Default::default()
            });
        }
        let options = CreateNetworkOptions {
            name: self.topology.bridge.name.clone(),
            driver: "bridge".to_owned(),
            enable_ipv6: self.topology.bridge.subnet_v6.is_some(),
            ipam: Ipam {
                driver: Some("default".to_owned()),
                config: Some(pools),
                ..Default::default()
            },
            ..Default::default()
        };

        with_retry("create-network", || {
            self.docker.create_network(options.clone())
        })
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("overlap") {
                LifecycleError::SubnetTaken { subnet: subnet.clone() }
            } else {
                LifecycleError::BridgeCreationFailed(message)
            }
        })?;
        debug!(network = %self.topology.bridge.name, %subnet, "bridge network created");
        Ok(())
    }

    /// Pull-if-absent, create, and start one container at its fixed IP.
    async fn launch_container(&self, spec: &ContainerSpec) -> Result<(), LifecycleError> {
        self.ensure_image(&spec.image).await?;

        let config = self.container_config(spec);
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        with_retry("create-container", || {
            self.docker.create_container(Some(options.clone()), config.clone())
        })
        .await
        .map_err(|e| LifecycleError::Stage {
            stage: "create-container",
            cause: format!("{}: {e}", spec.name),
        })?;

        with_retry("start-container", || {
            self.docker
                .start_container(&spec.name, None::<StartContainerOptions<String>>)
        })
        .await
        .map_err(|e| LifecycleError::Stage {
            stage: "start-container",
            cause: format!("{}: {e}", spec.name),
        })?;

        Ok(())
    }

    fn container_config(&self, spec: &ContainerSpec) -> ContainerConfig<String> {
        let binds: Vec<String> = spec.mounts.iter().map(super::MountSpec::render).collect();

        let tmpfs: HashMap<String, String> = spec.tmpfs.iter().cloned().collect();
        let host_config = HostConfig {
            network_mode: Some(self.topology.bridge.name.clone()),
            binds: (!binds.is_empty()).then_some(binds),
            cap_drop: Some(vec!["ALL".to_owned()]),
            cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
            security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
            pids_limit: Some(4096),
            tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
            ..Default::default()
        };

        let mut endpoints = HashMap::new();
        endpoints.insert(
            self.topology.bridge.name.clone(),
            EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: Some(spec.fixed_ip.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), LifecycleError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(%image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_owned(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(%image, %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(LifecycleError::ImageUnavailable {
                        image: image.to_owned(),
                        detail: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fetch the last page of a container's log for failure reports.
    async fn log_tail(&self, name: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: FAILURE_LOG_TAIL.to_owned(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut text = String::new();
        while let Some(Ok(chunk)) = stream.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        text
    }

    async fn inspect_exit_code(&self) -> i64 {
        self.docker
            .inspect_container(&self.topology.command.name, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|state| state.state)
            .and_then(|s| s.exit_code)
            .unwrap_or(1)
    }

    async fn stop_and_remove(&self, name: &str) {
        let stop = self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }));
        if let Err(e) = stop.await {
            if !is_not_found(&e) {
                warn!(container = %name, error = %e, "stop failed; forcing removal");
            }
        }
        let remove = self.docker.remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );
        if let Err(e) = remove.await {
            if !is_not_found(&e) {
                warn!(container = %name, error = %e, "container removal failed");
            }
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Recognized-transient errors: daemon 5xx responses and socket-level I/O
/// failures during startup bursts.
fn is_transient(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code >= 500,
        BollardError::IOError { .. } => true,
        _ => false,
    }
}

/// Retry `op` up to [`TRANSIENT_RETRIES`] times with linear backoff on
/// recognized-transient errors.
async fn with_retry<T, F, Fut>(what: &'static str, mut op: F) -> Result<T, BollardError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BollardError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < TRANSIENT_RETRIES && is_transient(&e) => {
                warn!(%what, %attempt, error = %e, "transient docker error, retrying");
                tokio::time::sleep(RETRY_BACKOFF.saturating_mul(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}
