//! Docker-backed sandbox.
//!
//! Every execution gets a fresh container: created with resource limits,
//! fed the source through a tar upload, driven through `exec`, and force
//! removed afterwards. Containers are never reused between attempts.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::network::DisconnectNetworkOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RuntimeStrategy, Sandbox, SandboxError};
use crate::model::{ExecutionResult, RuntimeSpec, SourceUnit};

/// Label applied to every container this crate creates.
pub(crate) const MANAGED_LABEL: &str = "mender.managed";

/// Label carrying the unit path, for debugging leaked containers.
const UNIT_LABEL: &str = "mender.unit";

/// Label carrying the id of the run that created the container.
const RUN_LABEL: &str = "mender.run";

/// Directory inside the container holding the unit.
const WORKDIR: &str = "/workspace";

/// Extra keep-alive beyond the execution budgets, so a leaked container exits on its own.
const KEEPALIVE_GRACE_SECS: u64 = 30;

/// Exit code recorded when dependency installation runs out of time.
const INSTALL_TIMEOUT_EXIT_CODE: i64 = 124;

/// Runs source units inside throwaway Docker containers.
pub struct DockerSandbox {
    docker: Docker,
    run_id: Option<String>,
}

impl DockerSandbox {
    /// Connects to the local Docker daemon.
    ///
    /// Connecting does not talk to the daemon; use [`Sandbox::ping`] to check reachability.
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::unavailable(format!("Failed to connect to Docker: {e}"))
        })?;
        Ok(Self::with_client(docker))
    }

    /// Wraps an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            run_id: None,
        }
    }

    /// Tags every container with the given run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Creates and starts the container for one attempt.
    async fn provision(
        &self,
        unit: &SourceUnit,
        spec: &RuntimeSpec,
        network_mode: &str,
    ) -> Result<ContainerLease, SandboxError> {
        let image = spec.image_for(unit.language);
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("mender-{}", &id[..12]);
        let config =
            build_container_config(unit, spec, &image, network_mode, self.run_id.as_deref());

        // The lease exists before the create request so a cancelled or dropped
        // provision still removes whatever the daemon ended up creating.
        let lease = ContainerLease::new(self.docker.clone(), name);

        debug!("Creating container {} from {}", lease.name, image);
        if let Err(e) = self.create_with_pull(&lease.name, &image, config).await {
            lease.release().await;
            return Err(e);
        }

        if let Err(e) = self
            .docker
            .start_container::<String>(&lease.name, None)
            .await
        {
            lease.release().await;
            return Err(map_bollard_error(&e, "start container"));
        }

        Ok(lease)
    }

    /// Creates the container, pulling the image first if it is missing locally.
    async fn create_with_pull(
        &self,
        name: &str,
        image: &str,
        config: ContainerConfig<String>,
    ) -> Result<(), SandboxError> {
        match self.create_container(name, config.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => {
                info!("Image {} not present locally, pulling", image);
                self.pull_image(image).await?;
                self.create_container(name, config)
                    .await
                    .map_err(|e| map_bollard_error(&e, "create container"))
            }
            Err(e) => Err(map_bollard_error(&e, "create container")),
        }
    }

    async fn create_container(
        &self,
        name: &str,
        config: ContainerConfig<String>,
    ) -> Result<(), BollardError> {
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map(|_| ())
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", image, status);
                    }
                }
                Err(e) if e.to_string().contains("not found") || is_not_found(&e) => {
                    return Err(SandboxError::image_not_found(image));
                }
                Err(e) => return Err(map_bollard_error(&e, "pull image")),
            }
        }

        Ok(())
    }

    /// Everything that happens inside a provisioned container.
    async fn run_attempt(
        &self,
        container: &str,
        unit: &SourceUnit,
        spec: &RuntimeSpec,
        strategy: &RuntimeStrategy,
        install: Option<String>,
    ) -> Result<ExecutionResult, SandboxError> {
        let file_name = strategy.file_name(&unit.path);
        self.upload_source(container, &file_name, &unit.content)
            .await?;

        if let Some(install_cmd) = install {
            debug!("Installing dependencies: {}", install_cmd);
            let budget = spec.install_timeout();
            let output = self
                .exec_collect(
                    container,
                    vec!["sh".to_string(), "-c".to_string(), install_cmd],
                    budget,
                )
                .await?;

            if output.timed_out {
                let stderr = format!(
                    "{}\ndependency installation timed out after {}s",
                    output.stderr,
                    budget.as_secs()
                );
                return Ok(ExecutionResult::install_failed(
                    INSTALL_TIMEOUT_EXIT_CODE,
                    &output.stdout,
                    &stderr,
                    output.elapsed,
                ));
            }
            if output.exit_code != 0 {
                return Ok(ExecutionResult::install_failed(
                    output.exit_code,
                    &output.stdout,
                    &output.stderr,
                    output.elapsed,
                ));
            }

            if !spec.network_enabled {
                self.revoke_network(container).await?;
            }
        }

        let file = format!("{WORKDIR}/{file_name}");
        let cmd = strategy.command(&file, unit.entrypoint);
        debug!("Executing {:?}", cmd);

        let output = self.exec_collect(container, cmd, spec.timeout()).await?;
        if output.timed_out {
            warn!(
                "Execution of {} timed out after {}s",
                unit.path, spec.timeout_seconds
            );
            return Ok(ExecutionResult::timed_out(
                spec.timeout(),
                &output.stdout,
                &output.stderr,
                output.elapsed,
            ));
        }

        Ok(ExecutionResult::from_output(
            output.exit_code,
            &output.stdout,
            &output.stderr,
            output.elapsed,
        ))
    }

    /// Copies the source into the container's work directory.
    async fn upload_source(
        &self,
        container: &str,
        file_name: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let archive = build_archive(file_name, content)
            .map_err(|e| SandboxError::container_failed(format!("Failed to build archive: {e}")))?;

        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: WORKDIR.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| map_bollard_error(&e, "upload source"))
    }

    /// Disconnects the container from every network it is attached to.
    async fn revoke_network(&self, container: &str) -> Result<(), SandboxError> {
        let inspect = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::network_setup_failed(e.to_string()))?;

        let networks: Vec<String> = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| networks.into_keys().collect())
            .unwrap_or_default();

        for network in networks {
            debug!("Disconnecting {} from network {}", container, network);
            self.docker
                .disconnect_network(
                    &network,
                    DisconnectNetworkOptions {
                        container: container.to_string(),
                        force: true,
                    },
                )
                .await
                .map_err(|e| {
                    SandboxError::network_setup_failed(format!(
                        "Failed to disconnect from {network}: {e}"
                    ))
                })?;
        }

        Ok(())
    }

    /// Runs a command in the container and collects its output within `limit`.
    async fn exec_collect(
        &self,
        container: &str,
        cmd: Vec<String>,
        limit: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_bollard_error(&e, "create exec"))?;

        let started = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();

        let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_bollard_error(&e, "start exec"))?
        else {
            return Err(SandboxError::container_failed("exec started detached"));
        };

        let drained = tokio::time::timeout(limit, drain(&mut output, &mut stdout, &mut stderr)).await;
        let elapsed = started.elapsed();

        if drained.is_err() {
            // The process keeps running until the lease removes the container
            return Ok(ExecOutput {
                exit_code: crate::model::TIMEOUT_EXIT_CODE,
                stdout,
                stderr,
                elapsed,
                timed_out: true,
            });
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_bollard_error(&e, "inspect exec"))?;
        let exit_code = inspect
            .exit_code
            .ok_or_else(|| SandboxError::container_failed("exec finished without an exit code"))?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
            elapsed,
            timed_out: false,
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await.map(|_| ()).map_err(|e| {
            SandboxError::unavailable(format!("Cannot ping Docker daemon. Is Docker running? {e}"))
        })
    }

    async fn cleanup_orphaned(&self) -> Result<u32, SandboxError> {
        // Running containers may belong to a concurrent run; they exit on their own
        let filters = HashMap::from([
            ("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]),
            (
                "status".to_string(),
                vec![
                    "created".to_string(),
                    "exited".to_string(),
                    "dead".to_string(),
                ],
            ),
        ]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_bollard_error(&e, "list containers"))?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
            }
        }

        if removed > 0 {
            info!("Removed {} orphaned sandbox containers", removed);
        }
        Ok(removed)
    }

    async fn execute(
        &self,
        unit: &SourceUnit,
        spec: &RuntimeSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let strategy = unit.language.strategy();
        let install = strategy.install_command(spec.dependencies_for(unit.language));
        let network_mode = if spec.network_enabled || install.is_some() {
            "bridge"
        } else {
            "none"
        };

        let lease = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SandboxError::Cancelled),
            lease = self.provision(unit, spec, network_mode) => lease?,
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SandboxError::Cancelled),
            outcome = self.run_attempt(&lease.name, unit, spec, strategy, install) => outcome,
        };

        lease.release().await;
        outcome
    }
}

// -----------------------------------------------------------------------------
// Container lease
// -----------------------------------------------------------------------------

/// Owns one container; removes it on release or drop.
struct ContainerLease {
    docker: Docker,
    name: String,
    released: bool,
}

impl ContainerLease {
    fn new(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            released: false,
        }
    }

    /// Force-removes the container, killing anything still running in it.
    async fn release(mut self) {
        self.released = true;
        debug!("Removing container {}", self.name);
        if let Err(e) = remove_container(&self.docker, &self.name).await {
            warn!("Failed to remove container {}: {}", self.name, e);
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // The owning future was dropped mid-attempt (task aborted or panicked)
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = remove_container(&docker, &name).await {
                        warn!("Failed to remove container {}: {}", name, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to remove container {}; it will be cleaned up as an orphan",
                name
            ),
        }
    }
}

/// Force-removes a container. A container that was never created counts as removed.
async fn remove_container(docker: &Docker, name: &str) -> Result<(), BollardError> {
    let removed = docker
        .remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await;
    ignore_missing(removed)
}

fn ignore_missing(result: Result<(), BollardError>) -> Result<(), BollardError> {
    match result {
        Err(e) if is_not_found(&e) => Ok(()),
        other => other,
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

/// Output of one `exec`.
struct ExecOutput {
    exit_code: i64,
    stdout: String,
    stderr: String,
    elapsed: Duration,
    timed_out: bool,
}

async fn drain<S>(stream: &mut S, stdout: &mut String, stderr: &mut String)
where
    S: Stream<Item = Result<LogOutput, BollardError>> + Unpin,
{
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                stdout.push_str(&String::from_utf8_lossy(&message));
            }
            Ok(LogOutput::StdErr { message }) => {
                stderr.push_str(&String::from_utf8_lossy(&message));
            }
            Ok(LogOutput::StdIn { .. }) => {}
            Err(e) => {
                warn!("Error reading exec output: {}", e);
                break;
            }
        }
    }
}

fn build_container_config(
    unit: &SourceUnit,
    spec: &RuntimeSpec,
    image: &str,
    network_mode: &str,
    run_id: Option<&str>,
) -> ContainerConfig<String> {
    let keepalive = spec.install_timeout_seconds + spec.timeout_seconds + KEEPALIVE_GRACE_SECS;
    let memory = i64::try_from(spec.memory_limit).unwrap_or(i64::MAX);
    #[allow(clippy::cast_possible_truncation)]
    let nano_cpus = (spec.cpus * 1_000_000_000.0) as i64;

    let mut labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (UNIT_LABEL.to_string(), unit.path.clone()),
    ]);
    if let Some(run_id) = run_id {
        labels.insert(RUN_LABEL.to_string(), run_id.to_string());
    }

    ContainerConfig {
        image: Some(image.to_string()),
        cmd: Some(vec!["sleep".to_string(), keepalive.to_string()]),
        working_dir: Some(WORKDIR.to_string()),
        labels: Some(labels),
        host_config: Some(bollard::service::HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some(nano_cpus),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some(network_mode.to_string()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Packs a single file into an in-memory tar archive.
fn build_archive(file_name: &str, content: &str) -> std::io::Result<Bytes> {
    let mut tar_buf = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut tar_buf);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().try_into().unwrap_or(0));
        header.set_cksum();
        tar.append_data(&mut header, file_name, content.as_bytes())?;
        tar.finish()?;
    }
    Ok(Bytes::from(tar_buf))
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Server-side failures are container failures; anything else means the daemon is unreachable.
fn map_bollard_error(err: &BollardError, operation: &str) -> SandboxError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => SandboxError::container_failed(format!(
            "{operation} returned {status_code}: {message}"
        )),
        other => SandboxError::unavailable(format!("{operation}: {other}")),
    }
}
