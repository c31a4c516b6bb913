//! Tool-call surface: typed requests, routing, and the response envelope.
//!
//! This is the contract the transport layer consumes. Requests arrive as
//! JSON tagged with a `tool` field; every response is an object with a
//! `success` flag, either the operation payload or an `error` +
//! `error_kind` pair, and the caller's `id` echoed back when present.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::sandbox::{ContainerPool, SandboxError};

/// One request frame: an optional correlation id plus the tool invocation.
#[derive(Debug, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: ToolRequest,
}

/// The tool invocations the sandbox core satisfies.
#[derive(Debug, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    /// Create or reuse a container and allocate a fresh workspace.
    Initialize {
        /// Defaults to the configured image; ignored in persistent mode
        /// once the shared container exists.
        #[serde(default)]
        image: Option<String>,
        #[serde(default = "default_true")]
        use_persistent: bool,
    },
    /// Run commands in order inside a workspace.
    Exec {
        container_id: String,
        #[serde(default)]
        workspace_id: Option<String>,
        commands: Vec<String>,
    },
    /// Write in-memory contents to a file in a workspace.
    WriteFile {
        container_id: String,
        #[serde(default)]
        workspace_id: Option<String>,
        file_name: String,
        file_contents: String,
        #[serde(default)]
        dest_dir: Option<String>,
    },
    /// Copy a single local file into a workspace.
    CopyFile {
        container_id: String,
        local_src_file: String,
        #[serde(default)]
        workspace_id: Option<String>,
        #[serde(default)]
        dest_path: Option<String>,
    },
    /// Copy a local directory tree into a workspace.
    CopyProject {
        container_id: String,
        local_src_dir: String,
        #[serde(default)]
        workspace_id: Option<String>,
        #[serde(default)]
        dest_dir: Option<String>,
    },
    /// Copy one file out of a workspace to the local filesystem.
    CopyFileFromSandbox {
        container_id: String,
        #[serde(default)]
        workspace_id: Option<String>,
        container_src_path: String,
        #[serde(default)]
        local_dest_path: Option<String>,
    },
    /// Wipe a workspace subtree (idempotent).
    CleanWorkspace {
        container_id: String,
        workspace_id: String,
    },
    /// Tear down a session. No-op for persistent containers.
    Stop {
        container_id: String,
        #[serde(default)]
        is_persistent: bool,
    },
    /// Fetch a container's log output.
    ContainerLogs { container_id: String },
}

fn default_true() -> bool {
    true
}

/// Routes one tool call to the pool and wraps the outcome in the
/// response envelope.
pub async fn dispatch(pool: &ContainerPool, call: ToolCall) -> Value {
    let ToolCall { id, request } = call;
    envelope(id, route(pool, request).await)
}

/// Response for a frame that could not be parsed as a tool call.
pub fn invalid_request(message: &str) -> Value {
    json!({
        "success": false,
        "error": format!("invalid request: {message}"),
        "error_kind": "invalid_request",
    })
}

async fn route(pool: &ContainerPool, request: ToolRequest) -> Result<Value, SandboxError> {
    match request {
        ToolRequest::Initialize {
            image,
            use_persistent,
        } => {
            let (handle, workspace) = pool.initialize(image.as_deref(), use_persistent).await?;
            Ok(json!({
                "container_id": handle.id,
                "workspace_id": workspace.id,
                "workspace_path": workspace.root_path,
                "mode": handle.mode.to_string(),
                "state": handle.state.to_string(),
                "gpu_enabled": handle.gpu_enabled,
            }))
        }
        ToolRequest::Exec {
            container_id,
            workspace_id,
            commands,
        } => {
            let records = pool
                .exec(&container_id, workspace_id.as_deref(), &commands)
                .await?;
            Ok(json!({ "results": records }))
        }
        ToolRequest::WriteFile {
            container_id,
            workspace_id,
            file_name,
            file_contents,
            dest_dir,
        } => {
            let path = pool
                .write_file(
                    &container_id,
                    workspace_id.as_deref(),
                    &file_name,
                    &file_contents,
                    dest_dir.as_deref(),
                )
                .await?;
            Ok(json!({ "file_path": path }))
        }
        ToolRequest::CopyFile {
            container_id,
            local_src_file,
            workspace_id,
            dest_path,
        } => {
            let path = pool
                .copy_file_in(
                    &container_id,
                    workspace_id.as_deref(),
                    std::path::Path::new(&local_src_file),
                    dest_path.as_deref(),
                )
                .await?;
            Ok(json!({ "file_path": path }))
        }
        ToolRequest::CopyProject {
            container_id,
            local_src_dir,
            workspace_id,
            dest_dir,
        } => {
            let dest = pool
                .copy_project(
                    &container_id,
                    workspace_id.as_deref(),
                    std::path::Path::new(&local_src_dir),
                    dest_dir.as_deref(),
                )
                .await?;
            Ok(json!({ "dest_dir": dest }))
        }
        ToolRequest::CopyFileFromSandbox {
            container_id,
            workspace_id,
            container_src_path,
            local_dest_path,
        } => {
            let dest = match local_dest_path {
                Some(path) => PathBuf::from(path),
                None => local_dest_for(&container_src_path)?,
            };
            let file_size = pool
                .copy_file_out(
                    &container_id,
                    workspace_id.as_deref(),
                    &container_src_path,
                    &dest,
                )
                .await?;
            Ok(json!({
                "local_path": dest.display().to_string(),
                "file_size": file_size,
            }))
        }
        ToolRequest::CleanWorkspace {
            container_id,
            workspace_id,
        } => {
            pool.clean_workspace(&container_id, &workspace_id).await?;
            Ok(json!({ "message": format!("workspace {workspace_id} cleaned") }))
        }
        ToolRequest::Stop {
            container_id,
            is_persistent,
        } => {
            pool.stop(&container_id, is_persistent).await?;
            let message = if is_persistent {
                format!("container {container_id} is persistent and was retained")
            } else {
                format!("container {container_id} stopped and removed")
            };
            Ok(json!({ "message": message }))
        }
        ToolRequest::ContainerLogs { container_id } => {
            let logs = pool.container_logs(&container_id).await?;
            Ok(json!({ "logs": logs }))
        }
    }
}

/// Derives a local destination file name from the container-side source
/// path when the caller did not give one.
fn local_dest_for(container_src_path: &str) -> Result<PathBuf, SandboxError> {
    container_src_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            SandboxError::transfer(format!(
                "cannot derive a local file name from: {container_src_path}"
            ))
        })
}

fn envelope(id: Option<Value>, result: Result<Value, SandboxError>) -> Value {
    let mut response = Map::new();
    if let Some(id) = id {
        response.insert("id".to_string(), id);
    }

    match result {
        Ok(Value::Object(payload)) => {
            response.insert("success".to_string(), Value::Bool(true));
            response.extend(payload);
        }
        Ok(other) => {
            response.insert("success".to_string(), Value::Bool(true));
            response.insert("result".to_string(), other);
        }
        Err(error) => {
            response.insert("success".to_string(), Value::Bool(false));
            response.insert("error".to_string(), Value::String(error.to_string()));
            response.insert(
                "error_kind".to_string(),
                Value::String(error.kind().to_string()),
            );
        }
    }

    Value::Object(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_initialize_defaults() {
        let call: ToolCall = serde_json::from_str(r#"{"tool": "initialize"}"#).unwrap();
        assert!(call.id.is_none());
        match call.request {
            ToolRequest::Initialize {
                image,
                use_persistent,
            } => {
                assert!(image.is_none());
                assert!(use_persistent);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_initialize_overrides() {
        let call: ToolCall = serde_json::from_str(
            r#"{"tool": "initialize", "image": "python:3.12-slim", "use_persistent": false}"#,
        )
        .unwrap();
        match call.request {
            ToolRequest::Initialize {
                image,
                use_persistent,
            } => {
                assert_eq!(image.as_deref(), Some("python:3.12-slim"));
                assert!(!use_persistent);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_exec_with_id() {
        let call: ToolCall = serde_json::from_str(
            r#"{"id": 7, "tool": "exec", "container_id": "c1", "workspace_id": "w1", "commands": ["python x.py"]}"#,
        )
        .unwrap();
        assert_eq!(call.id, Some(json!(7)));
        match call.request {
            ToolRequest::Exec {
                container_id,
                workspace_id,
                commands,
            } => {
                assert_eq!(container_id, "c1");
                assert_eq!(workspace_id.as_deref(), Some("w1"));
                assert_eq!(commands, vec!["python x.py"]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_tool_fails() {
        let parsed = serde_json::from_str::<ToolCall>(r#"{"tool": "reboot"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_stop_defaults_not_persistent() {
        let call: ToolCall =
            serde_json::from_str(r#"{"tool": "stop", "container_id": "c1"}"#).unwrap();
        match call.request {
            ToolRequest::Stop { is_persistent, .. } => assert!(!is_persistent),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_local_dest_for() {
        assert_eq!(
            local_dest_for("out/result.json").unwrap(),
            PathBuf::from("result.json")
        );
        assert_eq!(local_dest_for("a.txt").unwrap(), PathBuf::from("a.txt"));
        assert!(local_dest_for("").is_err());
        assert!(local_dest_for("/").is_err());
    }

    #[test]
    fn test_envelope_success_merges_payload() {
        let value = envelope(Some(json!(3)), Ok(json!({ "container_id": "c1" })));
        assert_eq!(value["id"], json!(3));
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["container_id"], json!("c1"));
    }

    #[test]
    fn test_envelope_error() {
        let value = envelope(None, Err(SandboxError::workspace_not_found("w9")));
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error_kind"], json!("not_found"));
        assert_eq!(value["error"], json!("unknown workspace: w9"));
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_invalid_request_envelope() {
        let value = invalid_request("expected value at line 1");
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error_kind"], json!("invalid_request"));
    }
}
