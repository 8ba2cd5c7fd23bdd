//! Tool Registry & Dispatcher
//!
//! Aggregates three tool sources under one namespace. Execution priority is
//! custom (registered at runtime) → external capability servers → built-in;
//! the first source that knows a name serves it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{AgentError, Result};
use crate::tool::{FnTool, Tool, ToolArguments, ToolResult, ToolSchema};

/// Where a tool comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    /// Registered in-process at runtime
    Custom,
    /// Proxied through a connected capability server
    External,
    /// Shipped default tool
    Builtin,
}

/// One segment of a capability server's reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplySegment {
    Text(String),
    Image { mime_type: String },
    Resource { uri: String },
    Other(String),
}

impl ReplySegment {
    fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Image { .. } => "[image content]".into(),
            Self::Resource { uri } => format!("[resource: {uri}]"),
            Self::Other(kind) => format!("[{kind} content]"),
        }
    }
}

/// Raw reply of a capability server tool call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerReply {
    pub segments: Vec<ReplySegment>,
    pub is_error: bool,
}

impl ServerReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            segments: vec![ReplySegment::Text(text.into())],
            is_error: false,
        }
    }

    /// Concatenate segments, replacing non-text ones with placeholders
    pub fn into_tool_result(self) -> ToolResult {
        let text = self
            .segments
            .iter()
            .map(ReplySegment::render)
            .collect::<Vec<_>>()
            .join("\n");
        if self.is_error {
            ToolResult::failure(text)
        } else {
            ToolResult::success(text)
        }
    }
}

/// An external process exposing additional tools
#[async_trait]
pub trait CapabilityServer: Send + Sync {
    /// Server name, used in logs and transport errors
    fn name(&self) -> &str;

    /// Discover the tools this server exposes
    async fn list_tools(&self) -> Result<Vec<ToolSchema>>;

    /// Forward one call
    async fn call_tool(&self, name: &str, arguments: &ToolArguments) -> Result<ServerReply>;
}

/// Snapshot of all connected servers; replaced as a whole on reconnect
#[derive(Default)]
struct ExternalTools {
    servers: Vec<Arc<dyn CapabilityServer>>,
    schemas: Vec<ToolSchema>,
    routes: HashMap<String, usize>,
}

/// Registry for available tools
pub struct ToolRegistry {
    custom: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
    external: RwLock<Arc<ExternalTools>>,
    builtin: BTreeMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(BTreeMap::new()),
            external: RwLock::new(Arc::new(ExternalTools::default())),
            builtin: BTreeMap::new(),
        }
    }

    /// Add a built-in default tool
    pub fn register_builtin<T: Tool + 'static>(&mut self, tool: T) {
        self.register_builtin_arc(Arc::new(tool));
    }

    /// Add a shared built-in default tool
    pub fn register_builtin_arc(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        self.builtin.insert(schema.name, tool);
    }

    /// Register a custom tool from an explicit schema and an async executor
    pub fn register<F, Fut>(&self, schema: ToolSchema, executor: F) -> Result<()>
    where
        F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        self.register_tool(Arc::new(FnTool::new(schema, executor)))
    }

    /// Register a custom tool. Names are immutable once registered.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.schema().name;
        let mut custom = self.custom.write().unwrap_or_else(PoisonError::into_inner);
        if custom.contains_key(&name) {
            return Err(AgentError::Config(format!("tool '{name}' is already registered")));
        }
        tracing::debug!(tool = %name, "Registered custom tool");
        custom.insert(name, tool);
        Ok(())
    }

    /// Connect a new set of capability servers, replacing the previous set.
    ///
    /// Servers whose tool listing fails are skipped. Returns the number of
    /// external tools now routable.
    pub async fn connect_servers(&self, servers: Vec<Arc<dyn CapabilityServer>>) -> usize {
        let mut next = ExternalTools::default();

        for server in servers {
            let tools = match server.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server = %server.name(), error = %e, "Skipping capability server");
                    continue;
                }
            };

            let index = next.servers.len();
            for schema in tools {
                if next.routes.contains_key(&schema.name) {
                    tracing::warn!(
                        server = %server.name(),
                        tool = %schema.name,
                        "Tool already provided by another server; ignoring"
                    );
                    continue;
                }
                next.routes.insert(schema.name.clone(), index);
                next.schemas.push(schema);
            }
            tracing::info!(server = %server.name(), "Connected capability server");
            next.servers.push(server);
        }

        let count = next.routes.len();
        *self.external.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        count
    }

    /// Names of the connected capability servers
    pub fn servers(&self) -> Vec<String> {
        self.external_snapshot()
            .servers
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn external_snapshot(&self) -> Arc<ExternalTools> {
        Arc::clone(&self.external.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn custom_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Which source would serve `name`
    pub fn source_of(&self, name: &str) -> Option<ToolSource> {
        if self.custom_tool(name).is_some() {
            Some(ToolSource::Custom)
        } else if self.external_snapshot().routes.contains_key(name) {
            Some(ToolSource::External)
        } else if self.builtin.contains_key(name) {
            Some(ToolSource::Builtin)
        } else {
            None
        }
    }

    /// Every reachable schema, once per name, in priority order
    pub fn all_schemas(&self) -> Vec<ToolSchema> {
        let custom: Vec<ToolSchema> = self
            .custom
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| t.schema())
            .collect();
        let external = self.external_snapshot();
        let builtin = self.builtin.values().map(|t| t.schema());

        let mut seen = HashSet::new();
        custom
            .into_iter()
            .chain(external.schemas.iter().cloned())
            .chain(builtin)
            .filter(|schema| seen.insert(schema.name.clone()))
            .collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<String> {
        self.all_schemas().into_iter().map(|s| s.name).collect()
    }

    /// Number of reachable tools
    pub fn len(&self) -> usize {
        self.all_schemas().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute a tool by name.
    ///
    /// A failing capability server yields a failed [`ToolResult`], not an
    /// error; unresolved names yield [`AgentError::UnknownTool`].
    pub async fn execute(&self, name: &str, arguments: &ToolArguments) -> Result<ToolResult> {
        if let Some(tool) = self.custom_tool(name) {
            tool.validate(arguments)?;
            return tool.execute(arguments).await;
        }

        let external = self.external_snapshot();
        if let Some(&index) = external.routes.get(name) {
            let server = &external.servers[index];
            return Ok(match server.call_tool(name, arguments).await {
                Ok(reply) => reply.into_tool_result(),
                Err(e) => {
                    let err = AgentError::ExternalToolTransport {
                        server: server.name().to_string(),
                        message: e.to_string(),
                    };
                    tracing::warn!(tool = %name, error = %err, "External tool call failed");
                    ToolResult::failure(err.to_string())
                }
            });
        }

        if let Some(tool) = self.builtin.get(name) {
            tool.validate(arguments)?;
            return tool.execute(arguments).await;
        }

        Err(AgentError::UnknownTool(name.to_string()))
    }
}
