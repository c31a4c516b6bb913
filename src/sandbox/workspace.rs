//! Workspace model: an isolated filesystem subtree inside a container.
//!
//! Persistent containers multiplex many workspaces as disjoint subtrees
//! under a shared mount point; an ephemeral container has a single
//! degenerate workspace whose root is the container working directory.
//! Every container-side path handed to exec or transfer operations is
//! resolved through [`Workspace::resolve`], which rejects anything that
//! would escape the workspace root.

use crate::sandbox::error::SandboxError;

/// An isolated execution directory inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Opaque identifier, unique within the owning container's lifetime.
    pub id: String,
    /// Absolute container-side path of the workspace root.
    pub root_path: String,
    /// The container this workspace lives in (lookup reference, not
    /// ownership).
    pub container_id: String,
}

impl Workspace {
    pub(crate) fn new(
        id: impl Into<String>,
        root_path: impl Into<String>,
        container_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            root_path: root_path.into(),
            container_id: container_id.into(),
        }
    }

    /// Derives a workspace root from its id, under the shared mount point.
    pub(crate) fn derived_root(workspaces_dir: &str, id: &str) -> String {
        format!("{}/{id}", workspaces_dir.trim_end_matches('/'))
    }

    /// Resolves a caller-supplied path against the workspace root.
    ///
    /// Relative paths are joined to the root; absolute paths are accepted
    /// only when they already lie under the root. `.` and `..` segments are
    /// normalized, and any path that would climb above the root is rejected
    /// with a `Transfer` error.
    pub(crate) fn resolve(&self, path: &str) -> Result<String, SandboxError> {
        let root = self.root_path.trim_end_matches('/');

        let relative = if let Some(stripped) = path.strip_prefix('/') {
            // Absolute: must already be inside this workspace.
            let Some(inside) = strip_root(stripped, root.trim_start_matches('/')) else {
                return Err(SandboxError::transfer(format!(
                    "path {path} is outside workspace {}",
                    self.id
                )));
            };
            inside
        } else {
            path
        };

        let mut normalized: Vec<&str> = Vec::new();
        for segment in relative.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if normalized.pop().is_none() {
                        return Err(SandboxError::transfer(format!(
                            "path {path} escapes workspace {}",
                            self.id
                        )));
                    }
                }
                other => normalized.push(other),
            }
        }

        if normalized.is_empty() {
            Ok(root.to_string())
        } else {
            Ok(format!("{root}/{}", normalized.join("/")))
        }
    }
}

/// Strips `root` (both given without leading slash) from the front of
/// `path`, returning the remainder. `None` if `path` is not under `root`.
fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::new("ws-1", "/app/workspaces/ws-1", "container-1")
    }

    #[test]
    fn test_derived_root() {
        assert_eq!(
            Workspace::derived_root("/app/workspaces", "ws-1"),
            "/app/workspaces/ws-1"
        );
        assert_eq!(
            Workspace::derived_root("/app/workspaces/", "ws-2"),
            "/app/workspaces/ws-2"
        );
    }

    #[test]
    fn test_resolve_relative() {
        let ws = workspace();
        assert_eq!(
            ws.resolve("out/result.json").unwrap(),
            "/app/workspaces/ws-1/out/result.json"
        );
        assert_eq!(ws.resolve("a.txt").unwrap(), "/app/workspaces/ws-1/a.txt");
    }

    #[test]
    fn test_resolve_empty_is_root() {
        let ws = workspace();
        assert_eq!(ws.resolve("").unwrap(), "/app/workspaces/ws-1");
        assert_eq!(ws.resolve(".").unwrap(), "/app/workspaces/ws-1");
    }

    #[test]
    fn test_resolve_normalizes_dot_segments() {
        let ws = workspace();
        assert_eq!(
            ws.resolve("./a/./b//c").unwrap(),
            "/app/workspaces/ws-1/a/b/c"
        );
        assert_eq!(ws.resolve("a/b/../c").unwrap(), "/app/workspaces/ws-1/a/c");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let ws = workspace();
        let err = ws.resolve("../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), "transfer");

        assert!(ws.resolve("..").is_err());
        assert!(ws.resolve("a/../../b").is_err());
    }

    #[test]
    fn test_resolve_absolute_inside_root() {
        let ws = workspace();
        assert_eq!(
            ws.resolve("/app/workspaces/ws-1/data.csv").unwrap(),
            "/app/workspaces/ws-1/data.csv"
        );
        assert_eq!(
            ws.resolve("/app/workspaces/ws-1").unwrap(),
            "/app/workspaces/ws-1"
        );
    }

    #[test]
    fn test_resolve_rejects_absolute_outside_root() {
        let ws = workspace();
        assert!(ws.resolve("/etc/passwd").is_err());
        assert!(ws.resolve("/app/workspaces/ws-2/a.txt").is_err());
        // Sibling directory sharing the root as a string prefix
        assert!(ws.resolve("/app/workspaces/ws-10/a.txt").is_err());
    }

    #[test]
    fn test_resolve_rejects_absolute_then_traversal() {
        let ws = workspace();
        assert!(ws.resolve("/app/workspaces/ws-1/../ws-2/x").is_err());
    }

    #[test]
    fn test_degenerate_workspace_is_container_root() {
        let ws = Workspace::new("session", "/app", "container-1");
        assert_eq!(ws.resolve("x.py").unwrap(), "/app/x.py");
        assert!(ws.resolve("../etc/passwd").is_err());
    }
}
