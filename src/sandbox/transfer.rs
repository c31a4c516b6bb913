//! Transfer gateway: file movement between the local filesystem and a
//! workspace, in both directions.
//!
//! Everything travels as in-memory tar archives through the engine's
//! archive endpoints. Every container-side path is resolved through the
//! workspace, so no transfer can read or write outside the workspace root.

use std::fs;
use std::io;
use std::path::Path;

use bollard::container::{DownloadFromContainerOptions, UploadToContainerOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::debug;

use crate::sandbox::error::{engine_error, SandboxError};
use crate::sandbox::exec::run_argv;
use crate::sandbox::workspace::Workspace;

/// Writes `contents` to `root/dest_subdir?/file_name`, creating
/// intermediate directories and overwriting any existing file. Returns
/// the container-side path written.
pub(crate) async fn push_file(
    docker: &Docker,
    workspace: &Workspace,
    file_name: &str,
    contents: &str,
    dest_subdir: Option<&str>,
) -> Result<String, SandboxError> {
    if file_name.is_empty() {
        return Err(SandboxError::transfer("file name must not be empty"));
    }

    let relative = match dest_subdir {
        Some(dir) => format!("{dir}/{file_name}"),
        None => file_name.to_string(),
    };
    let full_path = workspace.resolve(&relative)?;
    let (dir, name) = split_container_path(&full_path)?;

    upload_archive(
        docker,
        workspace,
        dir,
        file_archive(name, contents.as_bytes())?,
    )
    .await?;

    debug!(container = %workspace.container_id, path = %full_path, "wrote file");
    Ok(full_path)
}

/// Copies a single local file into the workspace at `dest_path` (relative
/// to the workspace root; defaults to the source file name).
pub(crate) async fn push_local_file(
    docker: &Docker,
    workspace: &Workspace,
    local_src_file: &Path,
    dest_path: Option<&str>,
) -> Result<String, SandboxError> {
    if !local_src_file.is_file() {
        return Err(SandboxError::transfer(format!(
            "local file does not exist: {}",
            local_src_file.display()
        )));
    }

    let fallback = local_src_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SandboxError::transfer("source file has no usable name"))?;
    let relative = dest_path.unwrap_or(fallback);
    let full_path = workspace.resolve(relative)?;
    let (dir, name) = split_container_path(&full_path)?;

    let contents = fs::read(local_src_file)
        .map_err(|e| SandboxError::transfer(format!("failed to read source file: {e}")))?;

    upload_archive(docker, workspace, dir, file_archive(name, &contents)?).await?;

    debug!(
        container = %workspace.container_id,
        src = %local_src_file.display(),
        path = %full_path,
        "copied file in"
    );
    Ok(full_path)
}

/// Recursively copies a local directory's contents into the workspace,
/// preserving relative structure.
pub(crate) async fn push_tree(
    docker: &Docker,
    workspace: &Workspace,
    local_dir: &Path,
    dest_subdir: Option<&str>,
) -> Result<String, SandboxError> {
    if !local_dir.is_dir() {
        return Err(SandboxError::transfer(format!(
            "local directory does not exist: {}",
            local_dir.display()
        )));
    }

    let target_dir = workspace.resolve(dest_subdir.unwrap_or(""))?;
    upload_archive(docker, workspace, &target_dir, dir_archive(local_dir)?).await?;

    debug!(
        container = %workspace.container_id,
        src = %local_dir.display(),
        dest = %target_dir,
        "copied directory in"
    );
    Ok(target_dir)
}

/// Copies one file out of the workspace to `local_dest_path`. The source
/// path may not escape the workspace root.
pub(crate) async fn pull_file(
    docker: &Docker,
    workspace: &Workspace,
    container_src_path: &str,
    local_dest_path: &Path,
) -> Result<u64, SandboxError> {
    let full_path = workspace.resolve(container_src_path)?;

    let mut stream = docker.download_from_container(
        &workspace.container_id,
        Some(DownloadFromContainerOptions {
            path: full_path.clone(),
        }),
    );

    let mut archive = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => archive.extend_from_slice(&bytes),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(SandboxError::transfer(format!(
                    "source path not found in workspace: {container_src_path}"
                )));
            }
            Err(e) => return Err(engine_error(&e, &workspace.container_id)),
        }
    }

    let written = unpack_single_file(&archive, local_dest_path)?;
    debug!(
        container = %workspace.container_id,
        src = %full_path,
        dest = %local_dest_path.display(),
        written,
        "copied file out"
    );
    Ok(written)
}

/// Creates the destination directory and uploads a tar archive into it.
async fn upload_archive(
    docker: &Docker,
    workspace: &Workspace,
    dir: &str,
    archive: Bytes,
) -> Result<(), SandboxError> {
    run_argv(docker, &workspace.container_id, &["mkdir", "-p", dir]).await?;

    docker
        .upload_to_container(
            &workspace.container_id,
            Some(UploadToContainerOptions {
                path: dir.to_string(),
                ..Default::default()
            }),
            archive,
        )
        .await
        .map_err(|e| engine_error(&e, &workspace.container_id))
}

/// Splits an absolute container path into (directory, file name).
fn split_container_path(path: &str) -> Result<(&str, &str), SandboxError> {
    match path.rsplit_once('/') {
        Some((dir, name)) if !name.is_empty() => {
            Ok((if dir.is_empty() { "/" } else { dir }, name))
        }
        _ => Err(SandboxError::transfer(format!(
            "path has no file component: {path}"
        ))),
    }
}

/// Builds an in-memory tar archive holding a single file entry.
fn file_archive(name: &str, contents: &[u8]) -> Result<Bytes, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder
        .append_data(&mut header, name, contents)
        .map_err(|e| SandboxError::transfer(format!("failed to build archive: {e}")))?;

    let buf = builder
        .into_inner()
        .map_err(|e| SandboxError::transfer(format!("failed to finalize archive: {e}")))?;
    Ok(Bytes::from(buf))
}

/// Builds an in-memory tar archive of a local directory's contents.
fn dir_archive(dir: &Path) -> Result<Bytes, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .map_err(|e| SandboxError::transfer(format!("failed to read source directory: {e}")))?;

    let buf = builder
        .into_inner()
        .map_err(|e| SandboxError::transfer(format!("failed to finalize archive: {e}")))?;
    Ok(Bytes::from(buf))
}

/// Extracts the first regular file from a tar archive to `dest`, creating
/// parent directories. Returns the number of bytes written.
fn unpack_single_file(archive: &[u8], dest: &Path) -> Result<u64, SandboxError> {
    let mut reader = tar::Archive::new(archive);
    let entries = reader
        .entries()
        .map_err(|e| SandboxError::transfer(format!("invalid archive: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| SandboxError::transfer(format!("invalid archive entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SandboxError::transfer(format!("failed to create destination directory: {e}"))
                })?;
            }
        }

        let mut file = fs::File::create(dest)
            .map_err(|e| SandboxError::transfer(format!("failed to create destination: {e}")))?;
        let written = io::copy(&mut entry, &mut file)
            .map_err(|e| SandboxError::transfer(format!("failed to write destination: {e}")))?;
        return Ok(written);
    }

    Err(SandboxError::transfer("archive contained no file"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_split_container_path() {
        assert_eq!(
            split_container_path("/app/workspaces/ws-1/a.txt").unwrap(),
            ("/app/workspaces/ws-1", "a.txt")
        );
        assert_eq!(split_container_path("/a.txt").unwrap(), ("/", "a.txt"));
        assert!(split_container_path("/app/").is_err());
    }

    #[test]
    fn test_file_archive_roundtrip() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.py");

        let archive = file_archive("x.py", b"print(1+1)\n").unwrap();
        let written = unpack_single_file(&archive, &dest).unwrap();

        assert_eq!(written, 11);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "print(1+1)\n");
    }

    #[test]
    fn test_file_archive_entry_name() {
        let archive = file_archive("script.py", b"pass").unwrap();
        let mut reader = tar::Archive::new(archive.as_ref());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["script.py"]);
    }

    #[test]
    fn test_dir_archive_preserves_structure() {
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("top.txt"), "top").unwrap();
        fs::write(src.path().join("sub/nested.txt"), "nested").unwrap();

        let archive = dir_archive(src.path()).unwrap();
        let mut reader = tar::Archive::new(archive.as_ref());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(names.iter().any(|n| n.ends_with("top.txt")));
        assert!(names.iter().any(|n| n.ends_with("sub/nested.txt")));
    }

    #[test]
    fn test_unpack_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("deep/nested/out.txt");

        let archive = file_archive("out.txt", b"data").unwrap();
        unpack_single_file(&archive, &dest).unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "data");
    }

    #[test]
    fn test_unpack_empty_archive_fails() {
        let builder = tar::Builder::new(Vec::new());
        let empty = builder.into_inner().unwrap();
        let dir = tempdir().unwrap();

        let err = unpack_single_file(&empty, &dir.path().join("x")).unwrap_err();
        assert_eq!(err.kind(), "transfer");
    }

    #[tokio::test]
    async fn test_push_tree_missing_source() {
        // Pure precondition check, no engine call needed; the Docker handle
        // is lazy so this runs without a daemon.
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        let workspace = Workspace::new("ws-1", "/app/workspaces/ws-1", "c-1");
        let err = push_tree(&docker, &workspace, Path::new("/no/such/dir"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transfer");
    }

    #[tokio::test]
    async fn test_pull_file_rejects_traversal() {
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        let workspace = Workspace::new("ws-1", "/app/workspaces/ws-1", "c-1");
        let dir = tempdir().unwrap();
        let dest = dir.path().join("passwd");

        let err = pull_file(&docker, &workspace, "../../etc/passwd", &dest)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transfer");
        assert!(!dest.exists(), "no copy may happen on a rejected path");
    }
}
