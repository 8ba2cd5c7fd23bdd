//! Filesystem tools

use async_trait::async_trait;
use colloquy_core::{
    error::Result,
    tool::{Tool, ToolArguments, ToolResult, ToolSchema},
};
use serde_json::json;

use super::{Workspace, str_arg};

/// Read a UTF-8 file inside the workspace
pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub const fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder("read_file", "Read the contents of a text file in the workspace.")
            .param("file_path", "string", "Path relative to the workspace root", true)
            .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let path = self.workspace.resolve(str_arg(arguments, "file_path")?).await?;
        Ok(match tokio::fs::read_to_string(&path).await {
            Ok(content) => ToolResult::success(content),
            Err(e) => ToolResult::failure(format!(
                "Failed to read {}: {e}",
                self.workspace.relative(&path)
            )),
        })
    }
}

/// Create or overwrite a file, creating parent directories
pub struct WriteFileTool {
    workspace: Workspace,
}

impl WriteFileTool {
    pub const fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder("write_file", "Create or overwrite a file in the workspace.")
            .param("file_path", "string", "Path relative to the workspace root", true)
            .param("content", "string", "Full file contents", true)
            .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let path = self.workspace.resolve(str_arg(arguments, "file_path")?).await?;
        let content = str_arg(arguments, "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "Wrote file");

        Ok(ToolResult::success(format!(
            "Wrote {} bytes to {}",
            content.len(),
            self.workspace.relative(&path)
        )))
    }
}

/// Remove a single file
pub struct DeleteFileTool {
    workspace: Workspace,
}

impl DeleteFileTool {
    pub const fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder("delete_file", "Delete a file in the workspace.")
            .param("file_path", "string", "Path relative to the workspace root", true)
            .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let path = self.workspace.resolve(str_arg(arguments, "file_path")?).await?;
        let shown = self.workspace.relative(&path);
        if !path.is_file() {
            return Ok(ToolResult::failure(format!("Not a file: {shown}")));
        }
        tokio::fs::remove_file(&path).await?;
        Ok(ToolResult::success(format!("Deleted {shown}")))
    }
}

/// List a directory; directories carry a trailing `/`
pub struct ListDirectoryTool {
    workspace: Workspace,
}

impl ListDirectoryTool {
    pub const fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder("list_directory", "List the entries of a directory in the workspace.")
            .param("path", "string", "Directory relative to the workspace root (default: root)", false)
            .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let requested = arguments.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = self.workspace.resolve(requested).await?;

        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(reader) => reader,
            Err(e) => {
                return Ok(ToolResult::failure(format!(
                    "Failed to list {}: {e}",
                    self.workspace.relative(&path)
                )));
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        Ok(ToolResult::success(json!(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::error::AgentError;
    use tempfile::TempDir;

    fn args(pairs: &[(&str, &str)]) -> ToolArguments {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect()
    }

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        (dir, workspace)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, ws) = workspace();

        let written = WriteFileTool::new(ws.clone())
            .execute(&args(&[("file_path", "notes/todo.txt"), ("content", "hello")]))
            .await
            .unwrap();
        assert!(written.success);

        let read = ReadFileTool::new(ws)
            .execute(&args(&[("file_path", "notes/todo.txt")]))
            .await
            .unwrap();
        assert_eq!(read.content, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_read_missing_file_fails_softly() {
        let (_dir, ws) = workspace();
        let result = ReadFileTool::new(ws)
            .execute(&args(&[("file_path", "nope.txt")]))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("nope.txt"));
    }

    #[tokio::test]
    async fn test_escape_is_rejected() {
        let (_dir, ws) = workspace();
        let err = WriteFileTool::new(ws)
            .execute(&args(&[("file_path", "../escape.txt"), ("content", "x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("old.log"), "x").unwrap();

        let tool = DeleteFileTool::new(ws);
        let result = tool.execute(&args(&[("file_path", "old.log")])).await.unwrap();
        assert!(result.success);
        assert!(!dir.path().join("old.log").exists());

        let again = tool.execute(&args(&[("file_path", "old.log")])).await.unwrap();
        assert!(!again.success);
    }

    #[tokio::test]
    async fn test_list_directory_sorted_with_dir_suffix() {
        let (dir, ws) = workspace();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let result = ListDirectoryTool::new(ws).execute(&ToolArguments::new()).await.unwrap();
        assert_eq!(result.content, Some(json!(["a.txt", "b.txt", "src/"])));
    }
}
