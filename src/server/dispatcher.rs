//! Tool, resource and prompt dispatcher.
//!
//! Holds the three provider registries and maps JSON-RPC methods onto them.
//! A dispatcher is transport agnostic; [`Dispatcher::serve`] attaches it to
//! any [`Connection`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::protocol::{
    CallToolParams, GetPromptParams, GetPromptResult, InitializeResult, Message, PromptInfo,
    ReadResourceParams, Request, ResourceContent, ResourceInfo, Response, RpcError,
    ServerCapabilities, ServerInfo, ToolInfo, codes,
};
use crate::transport::Connection;

use super::provider::{BoxFuture, Prompt, Resource, Tool};

// ============================================================================
// Constants
// ============================================================================

/// Protocol revision reported when the client does not ask for one.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ============================================================================
// Dispatcher
// ============================================================================

/// Registry of tools, resources and prompts plus the method router.
pub struct Dispatcher {
    info: ServerInfo,
    ready: AtomicBool,
    tools: RwLock<FxHashMap<String, Tool>>,
    resources: RwLock<FxHashMap<String, Resource>>,
    prompts: RwLock<FxHashMap<String, Prompt>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.info.name)
            .field("ready", &self.is_ready())
            .field("tools", &self.tools.read().len())
            .field("resources", &self.resources.read().len())
            .field("prompts", &self.prompts.read().len())
            .finish()
    }
}

// ============================================================================
// Dispatcher - Lifecycle
// ============================================================================

impl Dispatcher {
    /// Creates an empty, not yet initialized dispatcher.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: ServerInfo {
                name: name.into(),
                version: version.into(),
            },
            ready: AtomicBool::new(false),
            tools: RwLock::new(FxHashMap::default()),
            resources: RwLock::new(FxHashMap::default()),
            prompts: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the server identity.
    #[inline]
    #[must_use]
    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    /// Returns `true` between [`initialize`](Self::initialize) and
    /// [`shutdown`](Self::shutdown).
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Marks the dispatcher ready and reports its capabilities.
    pub fn initialize(&self) -> InitializeResult {
        self.initialize_with(PROTOCOL_VERSION)
    }

    fn initialize_with(&self, protocol_version: &str) -> InitializeResult {
        self.ready.store(true, Ordering::Release);
        debug!(name = %self.info.name, protocol_version, "Dispatcher initialized");

        InitializeResult {
            protocol_version: protocol_version.to_string(),
            server_info: self.info.clone(),
            capabilities: ServerCapabilities::all(),
        }
    }

    /// Clears every registry and marks the dispatcher not ready.
    pub fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.tools.write().clear();
        self.resources.write().clear();
        self.prompts.write().clear();
        debug!(name = %self.info.name, "Dispatcher shut down");
    }
}

// ============================================================================
// Dispatcher - Registration
// ============================================================================

impl Dispatcher {
    /// Registers a tool, replacing any tool of the same name.
    pub fn register_tool(&self, tool: Tool) {
        trace!(name = tool.name(), "Registering tool");
        self.tools.write().insert(tool.name().to_string(), tool);
    }

    /// Removes a tool. Returns `false` if absent.
    pub fn unregister_tool(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    /// Registers a resource, replacing any resource with the same URI.
    pub fn register_resource(&self, resource: Resource) {
        trace!(uri = resource.uri(), "Registering resource");
        self.resources.write().insert(resource.uri().to_string(), resource);
    }

    /// Removes a resource. Returns `false` if absent.
    pub fn unregister_resource(&self, uri: &str) -> bool {
        self.resources.write().remove(uri).is_some()
    }

    /// Registers a prompt, replacing any prompt of the same name.
    pub fn register_prompt(&self, prompt: Prompt) {
        trace!(name = prompt.name(), "Registering prompt");
        self.prompts.write().insert(prompt.name().to_string(), prompt);
    }

    /// Removes a prompt. Returns `false` if absent.
    pub fn unregister_prompt(&self, name: &str) -> bool {
        self.prompts.write().remove(name).is_some()
    }

    /// Lists tool metadata sorted by name.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self.tools.read().values().map(|t| t.info().clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Lists resource metadata sorted by URI.
    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut infos: Vec<ResourceInfo> =
            self.resources.read().values().map(|r| r.info().clone()).collect();
        infos.sort_by(|a, b| a.uri.cmp(&b.uri));
        infos
    }

    /// Lists prompt metadata sorted by name.
    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptInfo> {
        let mut infos: Vec<PromptInfo> =
            self.prompts.read().values().map(|p| p.info().clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

// ============================================================================
// Dispatcher - Execution
// ============================================================================

impl Dispatcher {
    /// Runs a tool and returns its result verbatim.
    ///
    /// # Errors
    ///
    /// - [`Error::ToolNotFound`] if no tool has that name
    /// - whatever the tool handler returns
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = self
            .tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::tool_not_found(name))?;

        guarded(move || tool.call(arguments), "tool", name).await
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceNotFound`] if no resource has that URI
    /// - whatever the resource reader returns
    pub async fn get_resource_content(&self, uri: &str) -> Result<ResourceContent> {
        let resource = self
            .resources
            .read()
            .get(uri)
            .cloned()
            .ok_or_else(|| Error::resource_not_found(uri))?;

        let text = guarded(|| resource.read(), "resource", uri).await?;
        Ok(ResourceContent {
            uri: resource.info().uri.clone(),
            mime_type: resource.info().mime_type.clone(),
            text,
        })
    }

    /// Generates a prompt.
    ///
    /// # Errors
    ///
    /// - [`Error::PromptNotFound`] if no prompt has that name
    /// - whatever the prompt handler returns
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult> {
        let prompt = self
            .prompts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::prompt_not_found(name))?;

        guarded(move || prompt.get(arguments), "prompt", name).await
    }
}

/// Runs a provider handler, turning a panic into a provider error.
///
/// Covers panics raised while building the future as well as while
/// polling it.
async fn guarded<T, F>(start: F, kind: &str, name: &str) -> Result<T>
where
    F: FnOnce() -> BoxFuture<Result<T>>,
{
    let outcome = match catch_unwind(AssertUnwindSafe(start)) {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    outcome.unwrap_or_else(|_| {
        warn!(kind, name, "Provider panicked");
        Err(Error::provider(format!("{kind} '{name}' panicked")))
    })
}

// ============================================================================
// Dispatcher - JSON-RPC
// ============================================================================

impl Dispatcher {
    /// Answers one request. Never fails; errors become error responses.
    pub async fn handle_request(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        let params = params.unwrap_or(Value::Null);

        trace!(%id, method = %method, "Dispatching request");

        let outcome = match method.as_str() {
            "" => {
                return Response::error(
                    Some(id),
                    RpcError::new(codes::INVALID_REQUEST, "Invalid request: empty method"),
                );
            }
            "initialize" => {
                let version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION);
                to_value(self.initialize_with(version))
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.list_tools() })),
            "tools/call" => match parse_params::<CallToolParams>(&method, params) {
                Ok(p) => self.execute_tool(&p.name, p.arguments).await,
                Err(e) => Err(e),
            },
            "resources/list" => Ok(json!({ "resources": self.list_resources() })),
            "resources/read" => match parse_params::<ReadResourceParams>(&method, params) {
                Ok(p) => self
                    .get_resource_content(&p.uri)
                    .await
                    .map(|content| json!({ "contents": [content] })),
                Err(e) => Err(e),
            },
            "prompts/list" => Ok(json!({ "prompts": self.list_prompts() })),
            "prompts/get" => match parse_params::<GetPromptParams>(&method, params) {
                Ok(p) => self.get_prompt(&p.name, p.arguments).await.and_then(to_value),
                Err(e) => Err(e),
            },
            _ => {
                debug!(method = %method, "Unknown method");
                return Response::error(
                    Some(id),
                    RpcError::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
                        .with_data(json!({ "kind": "method", "name": method })),
                );
            }
        };

        match outcome {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                debug!(%id, method = %method, error = %e, "Request failed");
                Response::from_error(id, &e)
            }
        }
    }

    /// Handles any message. Only requests produce a response.
    pub async fn handle_message(&self, message: Message) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.handle_request(request).await),
            Message::Notification(notification) => {
                trace!(method = %notification.method, "Notification accepted");
                None
            }
            Message::Response(response) => {
                trace!(id = ?response.id, "Ignoring unsolicited response");
                None
            }
        }
    }

    /// Answers requests arriving on `connection`.
    ///
    /// Each request runs on its own task; the response goes back on the
    /// same connection.
    pub fn serve(self: &Arc<Self>, connection: &Connection) -> SubscriptionId {
        let dispatcher = Arc::clone(self);
        let responder = connection.clone();

        connection.on_message(move |message| {
            let Message::Request(request) = message else {
                if let Message::Notification(n) = message {
                    trace!(method = %n.method, "Notification accepted");
                }
                return;
            };

            let dispatcher = Arc::clone(&dispatcher);
            let responder = responder.clone();
            let request = request.clone();

            tokio::spawn(async move {
                let response = dispatcher.handle_request(request).await;
                if let Err(e) = responder.send(response) {
                    debug!(error = %e, "Response dropped, connection closed");
                }
            });
        })
    }
}

fn parse_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::invalid_argument(format!("Invalid params for {method}: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{duplex, split};

    use crate::protocol::{PromptArgument, PromptMessage};

    fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new("browser-bridge", "0.1.0");
        dispatcher.register_tool(Tool::new(
            "echo",
            "Echo arguments",
            json!({"type": "object"}),
            |args| async move { Ok(args) },
        ));
        dispatcher.register_tool(Tool::new(
            "fail",
            "Always fails",
            json!({"type": "object"}),
            |_| async move { Err(Error::provider("tab has no DOM snapshot yet")) },
        ));
        dispatcher
    }

    fn call(id: i64, method: &str, params: Value) -> Request {
        Request::new(id, method, Some(params))
    }

    #[tokio::test]
    async fn test_unknown_tool_is_method_not_found() {
        let d = dispatcher();
        let response = d
            .handle_request(call(1, "tools/call", json!({"name": "missing"})))
            .await;

        let error = response.outcome.expect_err("error response");
        assert_eq!(error.code, codes::METHOD_NOT_FOUND);
        assert_eq!(error.data, Some(json!({"kind": "tool", "name": "missing"})));
    }

    #[tokio::test]
    async fn test_echo_passthrough() {
        let d = dispatcher();
        let response = d
            .handle_request(call(2, "tools/call", json!({"name": "echo", "arguments": {"x": 1}})))
            .await;

        let result = response.into_result().expect("success");
        assert_eq!(result["x"], 1);
    }

    #[tokio::test]
    async fn test_provider_error_is_internal() {
        let d = dispatcher();
        let response = d
            .handle_request(call(3, "tools/call", json!({"name": "fail"})))
            .await;

        let error = response.outcome.expect_err("error response");
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert_eq!(error.message, "tab has no DOM snapshot yet");
    }

    #[tokio::test]
    async fn test_panicking_tool_is_internal() {
        let d = dispatcher();
        d.register_tool(Tool::new("boom", "Panics on arguments", json!({}), |args: Value| async move {
            assert!(args.is_null(), "boom");
            Ok(args)
        }));

        let response = d
            .handle_request(call(4, "tools/call", json!({"name": "boom", "arguments": {"x": 1}})))
            .await;
        assert_eq!(response.outcome.expect_err("error").code, codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_tool_panicking_before_await_is_internal() {
        let d = dispatcher();
        d.register_tool(Tool::new("eager", "Panics while building", json!({}), |args: Value| {
            assert!(args.is_null(), "eager");
            async move { Ok(args) }
        }));

        let err = d.execute_tool("eager", json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert!(d.execute_tool("eager", Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_params_and_unknown_method() {
        let d = dispatcher();

        let response = d.handle_request(call(5, "tools/call", json!({"nope": true}))).await;
        assert_eq!(response.outcome.expect_err("error").code, codes::INVALID_PARAMS);

        let response = d.handle_request(call(6, "tools/explode", json!({}))).await;
        assert_eq!(response.outcome.expect_err("error").code, codes::METHOD_NOT_FOUND);

        let response = d.handle_request(call(7, "", json!({}))).await;
        assert_eq!(response.outcome.expect_err("error").code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let d = dispatcher();
        assert!(!d.is_ready());

        let response = d
            .handle_request(call(1, "initialize", json!({"protocolVersion": "2025-03-26"})))
            .await;
        let result = response.into_result().expect("success");
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["capabilities"]["tools"], true);
        assert!(d.is_ready());

        d.shutdown();
        assert!(!d.is_ready());
        assert!(d.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_resources_read_and_list() {
        let d = dispatcher();
        d.register_resource(Resource::new(
            ResourceInfo {
                uri: "browser://tab-localhost-3000/dom/html".into(),
                name: "DOM".into(),
                description: "Page markup".into(),
                mime_type: "text/html".into(),
            },
            || async { Ok("<html></html>".to_string()) },
        ));

        let content = d
            .get_resource_content("browser://tab-localhost-3000/dom/html")
            .await
            .expect("read");
        assert_eq!(content.text, "<html></html>");
        assert_eq!(content.mime_type, "text/html");

        let response = d
            .handle_request(call(1, "resources/read", json!({"uri": "browser://nope/dom/html"})))
            .await;
        let error = response.outcome.expect_err("error");
        assert_eq!(error.code, codes::METHOD_NOT_FOUND);
        assert_eq!(error.data.expect("data")["kind"], "resource");

        assert!(d.unregister_resource("browser://tab-localhost-3000/dom/html"));
        assert!(d.list_resources().is_empty());
    }

    #[tokio::test]
    async fn test_prompts() {
        let d = dispatcher();
        d.register_prompt(Prompt::new(
            "greet",
            "Greets someone",
            vec![PromptArgument {
                name: "who".into(),
                description: "Name".into(),
                required: true,
            }],
            |args| async move {
                let who = args["who"].as_str().unwrap_or("nobody").to_string();
                Ok(GetPromptResult {
                    description: None,
                    messages: vec![PromptMessage::user(format!("Hello {who}"))],
                })
            },
        ));

        let response = d
            .handle_request(call(1, "prompts/get", json!({"name": "greet", "arguments": {"who": "tab"}})))
            .await;
        let result = response.into_result().expect("success");
        assert_eq!(result["messages"][0]["content"]["text"], "Hello tab");

        let listed = d.handle_request(call(2, "prompts/list", json!({}))).await;
        assert_eq!(listed.into_result().expect("success")["prompts"][0]["name"], "greet");
    }

    #[tokio::test]
    async fn test_notifications_not_answered() {
        let d = dispatcher();
        let message = Message::Notification(crate::protocol::Notification::new(
            "notifications/initialized",
            None,
        ));
        assert!(d.handle_message(message).await.is_none());
    }

    #[tokio::test]
    async fn test_serve_over_line_transport() {
        let d = Arc::new(dispatcher());

        let (client_io, server_io) = duplex(64 * 1024);
        let (sr, sw) = split(server_io);
        let (cr, cw) = split(client_io);

        let server = Connection::line(sr, sw);
        d.serve(&server);

        let client = Connection::line(cr, cw).with_request_timeout(Duration::from_secs(5));
        let result = client
            .request("tools/call", Some(json!({"name": "echo", "arguments": {"x": 1}})))
            .await
            .expect("echo");
        assert_eq!(result, json!({"x": 1}));

        let err = client
            .request("tools/call", Some(json!({"name": "missing"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { code: codes::METHOD_NOT_FOUND, .. }));
    }
}
