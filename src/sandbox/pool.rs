//! Container pool: creates, reuses, and tears down sandbox containers.
//!
//! The pool holds at most one running persistent container per capability
//! profile and multiplexes callers onto it through per-call workspaces.
//! Ephemeral containers are created per session and removed on stop.
//! Persistent creation is singleflight: concurrent initializers for the
//! same profile block on a per-profile lock, and late arrivals reuse the
//! winner's container.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogsOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::sandbox::error::{engine_error, SandboxError};
use crate::sandbox::exec::{self, run_argv, ExecutionRecord};
use crate::sandbox::policy::{derive_constraints, Constraints, ResourceLimits};
use crate::sandbox::workspace::Workspace;
use crate::sandbox::{reclaim, transfer};

const START_POLL_INTERVAL: Duration = Duration::from_millis(250);
const START_POLL_ATTEMPTS: u32 = 40;

/// Whether a container is disposable or shared across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    /// Created for one session, destroyed on stop.
    Ephemeral,
    /// Long-lived, shared by many workspaces, survives session teardown.
    Persistent,
}

impl std::fmt::Display for ContainerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ephemeral => write!(f, "ephemeral"),
            Self::Persistent => write!(f, "persistent"),
        }
    }
}

/// Container lifecycle state. Transitions are unidirectional:
/// Creating → Running → Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Creating,
    Running,
    Stopped,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A reference to a running container plus its capability flags.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub mode: ContainerMode,
    pub gpu_enabled: bool,
    pub state: ContainerState,
}

/// Capability profile keying the persistent-container registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CapabilityProfile {
    pub gpu: bool,
}

impl CapabilityProfile {
    /// Stable engine-side name for this profile's persistent container.
    /// The fixed name is what lets a restarted process adopt a container
    /// left running by a previous instance.
    pub(crate) fn container_name(self) -> &'static str {
        if self.gpu {
            "codebox-persistent-gpu"
        } else {
            "codebox-persistent"
        }
    }
}

type PersistentSlot = Arc<AsyncMutex<Option<String>>>;

/// Process-wide registry of sandbox containers and their workspaces.
pub struct ContainerPool {
    docker: Docker,
    config: SandboxConfig,
    limits: ResourceLimits,
    gpu_available: bool,
    persistent: Mutex<HashMap<CapabilityProfile, PersistentSlot>>,
    workspaces: Mutex<HashMap<String, HashMap<String, Workspace>>>,
}

impl ContainerPool {
    /// Connects to the local container engine and probes its capabilities.
    /// Does not require the daemon to be reachable yet; operations surface
    /// engine errors individually.
    pub async fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let limits = config
            .resources
            .limits()
            .map_err(|e| SandboxError::provision(e.to_string()))?;

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::provision(format!("cannot reach container engine: {e}")))?;

        let gpu_available = detect_gpu(&docker).await;

        Ok(Self {
            docker,
            config,
            limits,
            gpu_available,
            persistent: Mutex::new(HashMap::new()),
            workspaces: Mutex::new(HashMap::new()),
        })
    }

    /// Pings the engine. Used at startup for an early availability check.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::provision(format!("cannot ping container engine: {e}")))
    }

    /// Whether the engine reported an accelerator runtime at connect time.
    pub fn gpu_available(&self) -> bool {
        self.gpu_available
    }

    /// Initializes an execution environment: reuses or creates a container
    /// and allocates a fresh workspace in it.
    pub async fn initialize(
        &self,
        image: Option<&str>,
        use_persistent: bool,
    ) -> Result<(ContainerHandle, Workspace), SandboxError> {
        if use_persistent {
            self.initialize_persistent().await
        } else {
            self.initialize_ephemeral(image).await
        }
    }

    /// Ensures the persistent container for the current capability profile
    /// exists without allocating a workspace. Used to warm the pool at
    /// startup; failures are the caller's to log.
    pub async fn warm(&self) -> Result<String, SandboxError> {
        let profile = CapabilityProfile {
            gpu: self.gpu_available,
        };
        let slot = self.persistent_slot(profile);
        let mut guard = slot.lock().await;
        let container_id = self.current_or_new_persistent(&mut guard, profile).await?;
        Ok(container_id)
    }

    async fn initialize_persistent(
        &self,
    ) -> Result<(ContainerHandle, Workspace), SandboxError> {
        let profile = CapabilityProfile {
            gpu: self.gpu_available,
        };

        // Singleflight per profile: one creation proceeds, late arrivals
        // block here and then observe the winner's container id.
        let slot = self.persistent_slot(profile);
        let mut guard = slot.lock().await;
        let container_id = self.current_or_new_persistent(&mut guard, profile).await?;
        drop(guard);

        let workspace = self.allocate_workspace(&container_id).await?;

        Ok((
            ContainerHandle {
                id: container_id,
                mode: ContainerMode::Persistent,
                gpu_enabled: profile.gpu,
                state: ContainerState::Running,
            },
            workspace,
        ))
    }

    async fn initialize_ephemeral(
        &self,
        image: Option<&str>,
    ) -> Result<(ContainerHandle, Workspace), SandboxError> {
        let image = image.unwrap_or(&self.config.image);
        self.ensure_image(image).await?;

        let constraints = derive_constraints(false, false, self.limits);
        let name = format!("codebox-{}", short_suffix());

        debug!(%image, container = %name, "creating ephemeral container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                self.container_config(image, &constraints),
            )
            .await
            .map_err(|e| SandboxError::provision(format!("failed to create container: {e}")))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| SandboxError::provision(format!("failed to start container: {e}")))?;
        self.wait_until_running(&created.id).await?;

        // The degenerate whole-container workspace: its root is the
        // container working directory, no separate subtree.
        let workspace = Workspace::new(
            Uuid::new_v4().to_string(),
            self.config.workdir.clone(),
            created.id.clone(),
        );
        self.register_workspace(workspace.clone());

        info!(container = %name, "ephemeral container running");
        Ok((
            ContainerHandle {
                id: created.id,
                mode: ContainerMode::Ephemeral,
                gpu_enabled: false,
                state: ContainerState::Running,
            },
            workspace,
        ))
    }

    /// Runs commands in a workspace, one execution record per command.
    pub async fn exec(
        &self,
        container_id: &str,
        workspace_id: Option<&str>,
        commands: &[String],
    ) -> Result<Vec<ExecutionRecord>, SandboxError> {
        let workspace = self.resolve_workspace(container_id, workspace_id)?;
        let timeout = Duration::from_secs(self.config.resources.timeout_seconds);
        exec::run_commands(&self.docker, &workspace, commands, timeout).await
    }

    /// Writes in-memory contents to a file inside a workspace.
    pub async fn write_file(
        &self,
        container_id: &str,
        workspace_id: Option<&str>,
        file_name: &str,
        file_contents: &str,
        dest_dir: Option<&str>,
    ) -> Result<String, SandboxError> {
        let workspace = self.resolve_workspace(container_id, workspace_id)?;
        transfer::push_file(&self.docker, &workspace, file_name, file_contents, dest_dir).await
    }

    /// Copies a single local file into a workspace.
    pub async fn copy_file_in(
        &self,
        container_id: &str,
        workspace_id: Option<&str>,
        local_src_file: &std::path::Path,
        dest_path: Option<&str>,
    ) -> Result<String, SandboxError> {
        let workspace = self.resolve_workspace(container_id, workspace_id)?;
        transfer::push_local_file(&self.docker, &workspace, local_src_file, dest_path).await
    }

    /// Copies a local directory tree into a workspace.
    pub async fn copy_project(
        &self,
        container_id: &str,
        workspace_id: Option<&str>,
        local_src_dir: &std::path::Path,
        dest_dir: Option<&str>,
    ) -> Result<String, SandboxError> {
        let workspace = self.resolve_workspace(container_id, workspace_id)?;
        transfer::push_tree(&self.docker, &workspace, local_src_dir, dest_dir).await
    }

    /// Copies one file out of a workspace to the local filesystem.
    pub async fn copy_file_out(
        &self,
        container_id: &str,
        workspace_id: Option<&str>,
        container_src_path: &str,
        local_dest_path: &std::path::Path,
    ) -> Result<u64, SandboxError> {
        let workspace = self.resolve_workspace(container_id, workspace_id)?;
        transfer::pull_file(&self.docker, &workspace, container_src_path, local_dest_path).await
    }

    /// Wipes a workspace subtree. Idempotent: unknown or already-clean
    /// workspace ids are not an error, so the root path is derived from
    /// the id rather than looked up.
    pub async fn clean_workspace(
        &self,
        container_id: &str,
        workspace_id: &str,
    ) -> Result<(), SandboxError> {
        let root = {
            let registry = self.workspaces.lock().expect("workspace registry poisoned");
            registry
                .get(container_id)
                .and_then(|spaces| spaces.get(workspace_id))
                .map(|ws| ws.root_path.clone())
        };
        let root = root
            .unwrap_or_else(|| Workspace::derived_root(&self.workspaces_dir(), workspace_id));

        reclaim::clean_workspace(&self.docker, container_id, &root).await?;

        let mut registry = self.workspaces.lock().expect("workspace registry poisoned");
        if let Some(spaces) = registry.get_mut(container_id) {
            spaces.remove(workspace_id);
        }
        Ok(())
    }

    /// Stops a sandbox session. Ephemeral containers are force-removed
    /// together with their workspaces; persistent containers are retained
    /// by design and this is a no-op for them.
    pub async fn stop(&self, container_id: &str, is_persistent: bool) -> Result<(), SandboxError> {
        if is_persistent || self.is_current_persistent(container_id) {
            info!(
                container = %container_id,
                "persistent container retained; stop is a no-op"
            );
            return Ok(());
        }

        reclaim::remove_container(&self.docker, container_id).await?;

        let mut registry = self.workspaces.lock().expect("workspace registry poisoned");
        registry.remove(container_id);
        Ok(())
    }

    /// Returns the container's captured log output.
    pub async fn container_logs(&self, container_id: &str) -> Result<String, SandboxError> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => logs.push_str(&String::from_utf8_lossy(&output.into_bytes())),
                Err(e) => return Err(engine_error(&e, container_id)),
            }
        }
        Ok(logs)
    }

    // ------------------------------------------------------------------
    // Persistent container management
    // ------------------------------------------------------------------

    fn persistent_slot(&self, profile: CapabilityProfile) -> PersistentSlot {
        let mut registry = self.persistent.lock().expect("persistent registry poisoned");
        registry.entry(profile).or_default().clone()
    }

    /// Returns the known-running persistent container for the profile, or
    /// provisions one. Must be called with the profile's slot locked.
    async fn current_or_new_persistent(
        &self,
        slot: &mut Option<String>,
        profile: CapabilityProfile,
    ) -> Result<String, SandboxError> {
        if let Some(id) = slot.take() {
            if self.container_running(&id).await? {
                *slot = Some(id.clone());
                return Ok(id);
            }
            warn!(container = %id, "persistent container disappeared, re-provisioning");
        }

        let id = self.ensure_persistent_container(profile).await?;
        *slot = Some(id.clone());
        Ok(id)
    }

    async fn container_running(&self, container_id: &str) -> Result<bool, SandboxError> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(matches!(
                inspect.state.and_then(|state| state.running),
                Some(true)
            )),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(SandboxError::provision(e.to_string())),
        }
    }

    /// Adopts the profile's persistent container if one already exists on
    /// the engine (left by a previous process instance), starting it if
    /// stopped; otherwise creates a fresh one.
    async fn ensure_persistent_container(
        &self,
        profile: CapabilityProfile,
    ) -> Result<String, SandboxError> {
        let name = profile.container_name();

        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(existing) => {
                let id = existing.id.unwrap_or_else(|| name.to_string());
                let running = matches!(
                    existing.state.and_then(|state| state.running),
                    Some(true)
                );
                if !running {
                    self.docker
                        .start_container::<String>(name, None)
                        .await
                        .map_err(|e| {
                            SandboxError::provision(format!(
                                "failed to start existing persistent container: {e}"
                            ))
                        })?;
                    self.wait_until_running(&id).await?;
                }
                self.ensure_workspaces_dir(&id).await?;
                info!(container = %name, "adopted existing persistent container");
                Ok(id)
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.create_persistent_container(profile).await,
            Err(e) => Err(SandboxError::provision(e.to_string())),
        }
    }

    async fn create_persistent_container(
        &self,
        profile: CapabilityProfile,
    ) -> Result<String, SandboxError> {
        let image = &self.config.image;
        self.ensure_image(image).await?;

        let constraints = derive_constraints(profile.gpu, true, self.limits);
        let name = profile.container_name();

        debug!(%image, container = %name, gpu = profile.gpu, "creating persistent container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                self.container_config(image, &constraints),
            )
            .await
            .map_err(|e| SandboxError::provision(format!("failed to create container: {e}")))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| SandboxError::provision(format!("failed to start container: {e}")))?;
        self.wait_until_running(&created.id).await?;
        self.ensure_workspaces_dir(&created.id).await?;

        info!(container = %name, gpu = profile.gpu, "persistent container running");
        Ok(created.id)
    }

    // ------------------------------------------------------------------
    // Workspace management
    // ------------------------------------------------------------------

    fn workspaces_dir(&self) -> String {
        format!("{}/workspaces", self.config.workdir.trim_end_matches('/'))
    }

    async fn ensure_workspaces_dir(&self, container_id: &str) -> Result<(), SandboxError> {
        let dir = self.workspaces_dir();
        run_argv(&self.docker, container_id, &["mkdir", "-p", &dir]).await?;
        Ok(())
    }

    /// Allocates a fresh workspace subtree in a persistent container.
    async fn allocate_workspace(&self, container_id: &str) -> Result<Workspace, SandboxError> {
        let id = Uuid::new_v4().to_string();
        let root = Workspace::derived_root(&self.workspaces_dir(), &id);

        run_argv(&self.docker, container_id, &["mkdir", "-p", &root]).await?;

        let workspace = Workspace::new(id, root, container_id);
        self.register_workspace(workspace.clone());
        debug!(container = %container_id, workspace = %workspace.id, "workspace allocated");
        Ok(workspace)
    }

    fn register_workspace(&self, workspace: Workspace) {
        let mut registry = self.workspaces.lock().expect("workspace registry poisoned");
        registry
            .entry(workspace.container_id.clone())
            .or_default()
            .insert(workspace.id.clone(), workspace);
    }

    /// Looks up a workspace. Without an id, the whole-container workspace
    /// (rooted at the working directory) is returned; it borrows the
    /// container id as its own.
    fn resolve_workspace(
        &self,
        container_id: &str,
        workspace_id: Option<&str>,
    ) -> Result<Workspace, SandboxError> {
        match workspace_id {
            Some(id) => {
                let registry = self.workspaces.lock().expect("workspace registry poisoned");
                registry
                    .get(container_id)
                    .and_then(|spaces| spaces.get(id))
                    .cloned()
                    .ok_or_else(|| SandboxError::workspace_not_found(id))
            }
            None => Ok(Workspace::new(
                container_id,
                self.config.workdir.clone(),
                container_id,
            )),
        }
    }

    fn is_current_persistent(&self, container_id: &str) -> bool {
        let registry = self.persistent.lock().expect("persistent registry poisoned");
        registry.values().any(|slot| {
            slot.try_lock()
                .is_ok_and(|current| current.as_deref() == Some(container_id))
        })
    }

    // ------------------------------------------------------------------
    // Engine plumbing
    // ------------------------------------------------------------------

    fn container_config(&self, image: &str, constraints: &Constraints) -> ContainerConfig<String> {
        ContainerConfig {
            image: Some(image.to_string()),
            working_dir: Some(self.config.workdir.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            labels: Some(constraints.labels.clone()),
            host_config: Some(constraints.host_config()),
            ..Default::default()
        }
    }

    /// Pulls the image unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(%image, "pulling image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(SandboxError::provision(format!(
                            "image pull failed: {error}"
                        )));
                    }
                }
                Err(e) => {
                    return Err(SandboxError::provision(format!("image pull failed: {e}")));
                }
            }
        }
        Ok(())
    }

    /// Waits for a freshly started container to leave Creating. The state
    /// machine is unidirectional, so observing Stopped here means startup
    /// failed rather than "not yet".
    async fn wait_until_running(&self, container_id: &str) -> Result<(), SandboxError> {
        for _ in 0..START_POLL_ATTEMPTS {
            match self.container_state(container_id).await? {
                ContainerState::Running => return Ok(()),
                ContainerState::Creating => {
                    tokio::time::sleep(START_POLL_INTERVAL).await;
                }
                ContainerState::Stopped => {
                    return Err(SandboxError::provision(format!(
                        "container {container_id} exited during startup"
                    )));
                }
            }
        }
        Err(SandboxError::provision(format!(
            "container {container_id} did not reach running state"
        )))
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::provision(e.to_string()))?;

        let (status, running) = match inspect.state {
            Some(state) => (state.status, state.running),
            None => (None, None),
        };
        Ok(state_from_inspect(status, running))
    }
}

/// Maps the engine's container status onto the pool's lifecycle states.
fn state_from_inspect(
    status: Option<ContainerStateStatusEnum>,
    running: Option<bool>,
) -> ContainerState {
    if running == Some(true) {
        return ContainerState::Running;
    }
    match status {
        Some(ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::RESTARTING) => {
            ContainerState::Creating
        }
        _ => ContainerState::Stopped,
    }
}

fn short_suffix() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

async fn detect_gpu(docker: &Docker) -> bool {
    match docker.info().await {
        Ok(info) => {
            let available = info
                .runtimes
                .is_some_and(|runtimes| runtimes.contains_key("nvidia"));
            debug!(gpu = available, "accelerator runtime probe");
            available
        }
        // Engine unreachable or too old: fall back to CPU-only silently.
        Err(e) => {
            debug!("accelerator runtime probe failed, assuming cpu-only: {e}");
            false
        }
    }
}
