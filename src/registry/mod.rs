//! Tool registry
//!
//! Maps tool names to a declared input schema and a handler. Populated once
//! at startup from [`ToolProvider`]s, then shared read-only behind an `Arc`.

mod schema;

pub use schema::{InputSchema, PropertySchema, PropertyType, SchemaViolation};

use crate::backend::BackendError;
use crate::mcp::protocol::{ToolDefinition, ToolsCallResult};
use crate::session::ClientSession;
use crate::types::McpError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Per-call context handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Snapshot of the calling session, taken when the call was accepted.
    pub session: ClientSession,
}

impl ToolContext {
    pub fn new(session: ClientSession) -> Self {
        Self { session }
    }
}

/// Failures a handler reports. Converted to a JSON-RPC error at the
/// dispatch boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Filesystem(String),

    #[error("{0}")]
    Internal(String),
}

impl From<ToolError> for McpError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidArguments(msg) => McpError::InvalidParams(msg),
            ToolError::Backend(e) => e.into(),
            ToolError::Filesystem(msg) => McpError::ToolExecutionFailed(msg),
            ToolError::Internal(msg) => McpError::ToolExecutionFailed(msg),
        }
    }
}

pub type ToolResult = Result<ToolsCallResult, ToolError>;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: ToolContext) -> ToolResult;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult> + Send,
{
    async fn call(&self, args: Value, ctx: ToolContext) -> ToolResult {
        (self.0)(args, ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: InputSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.to_json(),
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A source of tools registered at startup.
pub trait ToolProvider {
    fn name(&self) -> &'static str;
    fn tools(&self) -> Vec<ToolDescriptor>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        debug!(tool = %descriptor.name, "Registered tool");
        self.index.insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(descriptor);
        Ok(())
    }

    /// Register every tool of `provider`. Stops at the first duplicate.
    pub fn register_provider(&mut self, provider: &dyn ToolProvider) -> Result<(), RegistryError> {
        for tool in provider.tools() {
            self.register(tool)?;
        }
        debug!(provider = provider.name(), total = self.tools.len(), "Provider registered");
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, McpError> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))
    }

    /// Tool summaries in registration order.
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolDescriptor::definition).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
