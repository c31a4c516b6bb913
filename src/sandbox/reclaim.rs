//! Lifecycle reclaimer: workspace cleanup and container removal.
//!
//! Workspace cleanup wipes a subtree inside a (usually persistent)
//! container and is idempotent. Container removal is for ephemeral
//! containers only and releases the engine resource synchronously, so a
//! caller observing success may assume the resource is gone.

use bollard::container::RemoveContainerOptions;
use bollard::Docker;
use tracing::{debug, info};

use crate::sandbox::error::{engine_error, SandboxError};
use crate::sandbox::exec::run_argv;

/// Recursively deletes a workspace root and recreates it empty. Cleaning
/// an already-clean or nonexistent workspace is not an error.
pub(crate) async fn clean_workspace(
    docker: &Docker,
    container_id: &str,
    root_path: &str,
) -> Result<(), SandboxError> {
    let removed = run_argv(docker, container_id, &["rm", "-rf", root_path]).await?;
    if removed != Some(0) {
        return Err(SandboxError::container(format!(
            "failed to remove workspace directory {root_path}"
        )));
    }

    let recreated = run_argv(docker, container_id, &["mkdir", "-p", root_path]).await?;
    if recreated != Some(0) {
        return Err(SandboxError::container(format!(
            "failed to recreate workspace directory {root_path}"
        )));
    }

    debug!(container = %container_id, root = %root_path, "workspace cleaned");
    Ok(())
}

/// Force-removes a container and its anonymous volumes. Blocks until the
/// engine has released the resource.
pub(crate) async fn remove_container(
    docker: &Docker,
    container_id: &str,
) -> Result<(), SandboxError> {
    docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| engine_error(&e, container_id))?;

    info!(container = %container_id, "container removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_unknown_container() {
        // Gracefully skips when no Docker daemon is reachable.
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        if docker.ping().await.is_err() {
            return;
        }

        let err = remove_container(&docker, "no-such-container-codebox")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_clean_unknown_container() {
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        if docker.ping().await.is_err() {
            return;
        }

        let err = clean_workspace(&docker, "no-such-container-codebox", "/app/workspaces/x")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
