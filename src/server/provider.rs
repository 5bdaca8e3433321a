//! Registrable tools, resources and prompts.
//!
//! Each provider pairs its public metadata with an async handler. Handlers
//! are reference counted so the dispatcher can call them without holding a
//! registry lock.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::protocol::{GetPromptResult, PromptArgument, PromptInfo, ResourceInfo, ToolInfo};

// ============================================================================
// Types
// ============================================================================

/// Owned, sendable future returned by provider handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Tool handler: arguments in, JSON result out.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Resource reader: produces the current text content.
pub type ResourceReader = Arc<dyn Fn() -> BoxFuture<Result<String>> + Send + Sync>;

/// Prompt handler: arguments in, generated messages out.
pub type PromptHandler = Arc<dyn Fn(Value) -> BoxFuture<Result<GetPromptResult>> + Send + Sync>;

// ============================================================================
// Tool
// ============================================================================

/// A callable tool.
#[derive(Clone)]
pub struct Tool {
    info: ToolInfo,
    handler: ToolHandler,
}

impl Tool {
    /// Creates a tool from an async closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            info: ToolInfo {
                name: name.into(),
                description: description.into(),
                input_schema,
            },
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Returns the public metadata.
    #[inline]
    #[must_use]
    pub fn info(&self) -> &ToolInfo {
        &self.info
    }

    /// Runs the handler.
    pub fn call(&self, arguments: Value) -> BoxFuture<Result<Value>> {
        (self.handler)(arguments)
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Resource
// ============================================================================

/// A readable resource addressed by URI.
#[derive(Clone)]
pub struct Resource {
    info: ResourceInfo,
    reader: ResourceReader,
}

impl Resource {
    /// Creates a resource whose content is produced on every read.
    pub fn new<F, Fut>(info: ResourceInfo, reader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            info,
            reader: Arc::new(move || Box::pin(reader())),
        }
    }

    /// Returns the resource URI.
    #[inline]
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.info.uri
    }

    /// Returns the public metadata.
    #[inline]
    #[must_use]
    pub fn info(&self) -> &ResourceInfo {
        &self.info
    }

    /// Reads the current content.
    pub fn read(&self) -> BoxFuture<Result<String>> {
        (self.reader)()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("uri", &self.info.uri)
            .field("mime_type", &self.info.mime_type)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Prompt
// ============================================================================

/// A prompt template.
#[derive(Clone)]
pub struct Prompt {
    info: PromptInfo,
    handler: PromptHandler,
}

impl Prompt {
    /// Creates a prompt from an async closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        arguments: Vec<PromptArgument>,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResult>> + Send + 'static,
    {
        Self {
            info: PromptInfo {
                name: name.into(),
                description: description.into(),
                arguments,
            },
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Returns the prompt name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Returns the public metadata.
    #[inline]
    #[must_use]
    pub fn info(&self) -> &PromptInfo {
        &self.info
    }

    /// Generates the prompt.
    pub fn get(&self, arguments: Value) -> BoxFuture<Result<GetPromptResult>> {
        (self.handler)(arguments)
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prompt")
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}
