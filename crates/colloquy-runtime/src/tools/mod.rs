//! Built-in default tools
//!
//! Filesystem and process tools are confined to a [`Workspace`] root.

mod clock;
mod fs;
mod shell;
mod web;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use colloquy_core::{
    error::{AgentError, Result},
    registry::ToolRegistry,
    tool::{Tool, ToolArguments},
};

use crate::search::SearxngClient;

pub use clock::CurrentTimeTool;
pub use fs::{DeleteFileTool, ListDirectoryTool, ReadFileTool, WriteFileTool};
pub use shell::ExecuteCommandTool;
pub use web::{FetchUrlTool, WebSearchTool};

/// Root directory the filesystem and shell tools operate in
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// The root must exist; it is canonicalized once here
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = std::fs::canonicalize(root.as_ref()).map_err(|e| {
            AgentError::Config(format!("workspace {}: {e}", root.as_ref().display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` against the root, rejecting anything that escapes it
    pub async fn resolve(&self, path: &str) -> Result<PathBuf> {
        let joined = self.root.join(path);
        let mut resolved = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir => {}
                other => resolved.push(other),
            }
        }

        // symlinks may point outside even when the lexical path does not
        let mut checked = None;
        for ancestor in resolved.ancestors() {
            if let Ok(canonical) = tokio::fs::canonicalize(ancestor).await {
                checked = Some(canonical);
                break;
            }
        }
        let checked = checked.unwrap_or_else(|| resolved.clone());
        if !resolved.starts_with(&self.root) || !checked.starts_with(&self.root) {
            return Err(AgentError::ToolValidation(format!(
                "path '{path}' is outside the workspace"
            )));
        }
        Ok(resolved)
    }

    /// Display a path relative to the root
    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map_or_else(|_| path.display().to_string(), |p| p.display().to_string())
    }
}

fn str_arg<'a>(arguments: &'a ToolArguments, name: &str) -> Result<&'a str> {
    arguments
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::ToolValidation(format!("'{name}' must be a string")))
}

fn u64_arg(arguments: &ToolArguments, name: &str) -> Option<u64> {
    arguments.get(name).and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

/// Every default tool; web tools only when a SearxNG client is given
pub fn default_tools(
    workspace: &Workspace,
    search: Option<SearxngClient>,
    http: reqwest::Client,
) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ReadFileTool::new(workspace.clone())),
        Arc::new(WriteFileTool::new(workspace.clone())),
        Arc::new(DeleteFileTool::new(workspace.clone())),
        Arc::new(ListDirectoryTool::new(workspace.clone())),
        Arc::new(ExecuteCommandTool::new(workspace.clone())),
        Arc::new(FetchUrlTool::new(http)),
        Arc::new(CurrentTimeTool),
    ];
    if let Some(search) = search {
        tools.push(Arc::new(WebSearchTool::new(search)));
    }
    tools
}

/// Registry preloaded with the default tools as built-ins
pub fn default_registry(workspace: &Workspace, search: Option<SearxngClient>, http: reqwest::Client) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in default_tools(workspace, search, http) {
        registry.register_builtin_arc(tool);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::registry::ToolSource;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_confines_to_root() {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();

        let inside = workspace.resolve("notes/a.txt").await.unwrap();
        assert!(inside.starts_with(workspace.root()));
        assert_eq!(workspace.relative(&inside), "notes/a.txt");

        assert!(workspace.resolve("notes/../a.txt").await.is_ok());
        assert!(matches!(
            workspace.resolve("../outside.txt").await,
            Err(AgentError::ToolValidation(_))
        ));
        assert!(workspace.resolve("/etc/passwd").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_rejects_symlink_escape() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        assert!(workspace.resolve("link").await.is_err());
        assert!(workspace.resolve("link/nested/new.txt").await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_resolve_runs_on_current_thread_runtime() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("deep")).unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();

        let resolved = workspace.resolve("deep/missing/file.txt").await.unwrap();
        assert_eq!(workspace.relative(&resolved), "deep/missing/file.txt");
    }

    #[test]
    fn test_missing_root_is_config_error() {
        assert!(matches!(
            Workspace::new("/nonexistent/colloquy-root"),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_default_registry() {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        let registry = default_registry(&workspace, None, reqwest::Client::new());

        assert_eq!(registry.source_of("read_file"), Some(ToolSource::Builtin));
        assert_eq!(registry.source_of("execute_command"), Some(ToolSource::Builtin));
        assert_eq!(registry.source_of("web_search"), None);

        let search = SearxngClient::new("http://localhost:8888", 5).unwrap();
        let registry = default_registry(&workspace, Some(search), reqwest::Client::new());
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn test_numeric_args_accept_strings() {
        let mut args = ToolArguments::new();
        args.insert("n".into(), serde_json::json!("12"));
        args.insert("m".into(), serde_json::json!(7));
        assert_eq!(u64_arg(&args, "n"), Some(12));
        assert_eq!(u64_arg(&args, "m"), Some(7));
        assert_eq!(u64_arg(&args, "missing"), None);
        assert!(str_arg(&args, "m").is_err());
    }
}
