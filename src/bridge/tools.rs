//! Built-in tools and prompts.
//!
//! | Tool | Arguments |
//! |------|-----------|
//! | `list_tabs` | - |
//! | `activate_tab` | `tabId`, `url`, `title?`, `port?` |
//! | `deactivate_tab` | `tabId` |
//! | `pin_tab` | `sessionId`, `tabId` |
//! | `unpin_tab` | `sessionId` |
//! | `get_pinned_tab` | `sessionId` |
//! | `get_tab_uri` | `tabId?`, `sessionId?` |
//! | `update_snapshot` | target, `html?`, `title?`, console/network lists, `frameworks?` |
//! | `detect_capabilities` | target (needs a detector) |
//! | `browser_command` | `method`, `params?` (needs an adapter) |
//!
//! "target" means `tabId` and/or `sessionId`, resolved through
//! [`TabRegistry::resolve_tab`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::adapter::CapabilityInfo;
use crate::error::{Error, Result};
use crate::identifiers::{SessionId, TabId};
use crate::protocol::{GetPromptResult, PromptArgument, PromptMessage};
use crate::resources::{ConsoleEntry, NetworkEntry, ResourceMapper};
use crate::server::{Prompt, Tool};
use crate::session::{PortAllocator, TabRecord, TabRegistry};

use super::core::BridgeInner;

// ============================================================================
// Arguments
// ============================================================================

/// Tab selection shared by several tools.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Target {
    #[serde(default)]
    tab_id: Option<TabId>,
    #[serde(default)]
    session_id: Option<SessionId>,
}

impl Target {
    fn resolve(&self, tabs: &TabRegistry) -> Result<TabId> {
        tabs.resolve_tab(self.session_id.as_ref(), self.tab_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateArgs {
    tab_id: TabId,
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TabArgs {
    tab_id: TabId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinArgs {
    session_id: SessionId,
    tab_id: TabId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionArgs {
    session_id: SessionId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotArgs {
    #[serde(flatten)]
    target: Target,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    console_logs: Option<Vec<ConsoleEntry>>,
    #[serde(default)]
    append_console_logs: Vec<ConsoleEntry>,
    #[serde(default)]
    network_requests: Option<Vec<NetworkEntry>>,
    #[serde(default)]
    append_network_requests: Vec<NetworkEntry>,
    #[serde(default)]
    frameworks: Option<Vec<CapabilityInfo>>,
}

#[derive(Debug, Deserialize)]
struct CommandArgs {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Parses tool arguments; absent arguments count as `{}`.
fn parse<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments)
        .map_err(|e| Error::invalid_argument(format!("Invalid arguments for {tool}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ============================================================================
// Schemas
// ============================================================================

fn target_schema() -> Value {
    json!({
        "tabId": { "type": "integer", "minimum": 1 },
        "sessionId": { "type": "string" }
    })
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

// ============================================================================
// Activation
// ============================================================================

/// Reserves a port for `tab_id` (allocating one unless given) and activates it.
///
/// Activations are serialized. If activation fails, a reservation made here
/// is released and a reservation it displaced is restored.
pub(crate) async fn activate(
    ports: &PortAllocator,
    tabs: &TabRegistry,
    tab_id: TabId,
    url: String,
    title: String,
    port: Option<u16>,
) -> Result<TabRecord> {
    let _guard = tabs.lock_activation().await;

    if tabs.is_active(tab_id) {
        return Err(Error::TabAlreadyActive { tab_id });
    }

    let previous = ports.port_for(tab_id);
    let port = match (port, previous) {
        (Some(port), _) => {
            ports.reserve_port(tab_id, port)?;
            port
        }
        (None, Some(port)) => port,
        (None, None) => ports.allocate(tab_id).await?,
    };

    tabs.activate_tab(tab_id, url, title, port)
        .inspect_err(|_| roll_back(ports, tab_id, port, previous))
}

/// Undoes the reservation of `port` made by a failed activation.
fn roll_back(ports: &PortAllocator, tab_id: TabId, port: u16, previous: Option<u16>) {
    if previous == Some(port) {
        return;
    }
    ports.release_if(tab_id, port);
    if let Some(old) = previous
        && let Err(e) = ports.reserve_port(tab_id, old)
    {
        warn!(tab_id = %tab_id, port = old, error = %e, "Could not restore previous port");
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Registers every built-in tool and prompt on the bridge's dispatcher.
pub(crate) fn register_builtins(inner: &BridgeInner) {
    let dispatcher = &inner.dispatcher;

    for tool in tab_tools(&inner.ports, &inner.tabs) {
        dispatcher.register_tool(tool);
    }
    for tool in session_tools(&inner.tabs) {
        dispatcher.register_tool(tool);
    }
    dispatcher.register_tool(snapshot_tool(&inner.tabs, &inner.mapper));

    if let Some(detector) = &inner.detector {
        let tabs = Arc::clone(&inner.tabs);
        let mapper = inner.mapper.clone();
        let detector = Arc::clone(detector);

        dispatcher.register_tool(Tool::new(
            "detect_capabilities",
            "Detect frameworks on a tab and store them in its snapshot",
            object_schema(target_schema(), &[]),
            move |args| {
                let tabs = Arc::clone(&tabs);
                let mapper = mapper.clone();
                let detector = Arc::clone(&detector);
                async move {
                    let target: Target = parse("detect_capabilities", args)?;
                    let tab_id = target.resolve(&tabs)?;
                    let found = detector.detect_all().await?;

                    tabs.set_detected_capability(tab_id, found.first().map(|c| c.name.clone()))?;
                    mapper.set_frameworks(tab_id, found.clone());
                    debug!(tab_id = %tab_id, count = found.len(), "Capabilities detected");

                    Ok(json!({ "tabId": tab_id, "frameworks": found }))
                }
            },
        ));
    }

    if let Some(adapter) = &inner.adapter {
        let adapter = Arc::clone(adapter);

        dispatcher.register_tool(Tool::new(
            "browser_command",
            "Send a raw debugging protocol command to the browser",
            object_schema(
                json!({
                    "method": { "type": "string" },
                    "params": { "type": "object" }
                }),
                &["method"],
            ),
            move |args| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let args: CommandArgs = parse("browser_command", args)?;
                    if args.method.is_empty() {
                        return Err(Error::invalid_argument("method must not be empty"));
                    }
                    adapter.send_command(&args.method, args.params).await
                }
            },
        ));
    }

    dispatcher.register_prompt(debug_tab_prompt(&inner.tabs, &inner.mapper));
}

// ============================================================================
// Tab Tools
// ============================================================================

fn tab_tools(ports: &Arc<PortAllocator>, tabs: &Arc<TabRegistry>) -> Vec<Tool> {
    let list = {
        let tabs = Arc::clone(tabs);
        Tool::new(
            "list_tabs",
            "List active tabs",
            object_schema(json!({}), &[]),
            move |_| {
                let tabs = Arc::clone(&tabs);
                async move { Ok(json!({ "tabs": tabs.active_tabs() })) }
            },
        )
    };

    let activate_tool = {
        let ports = Arc::clone(ports);
        let tabs = Arc::clone(tabs);
        Tool::new(
            "activate_tab",
            "Start debugging a tab; allocates a port unless one is given",
            object_schema(
                json!({
                    "tabId": { "type": "integer", "minimum": 1 },
                    "url": { "type": "string" },
                    "title": { "type": "string" },
                    "port": { "type": "integer" }
                }),
                &["tabId", "url"],
            ),
            move |args| {
                let ports = Arc::clone(&ports);
                let tabs = Arc::clone(&tabs);
                async move {
                    let args: ActivateArgs = parse("activate_tab", args)?;
                    let record =
                        activate(&ports, &tabs, args.tab_id, args.url, args.title, args.port).await?;
                    to_json(&record)
                }
            },
        )
    };

    let deactivate = {
        let tabs = Arc::clone(tabs);
        Tool::new(
            "deactivate_tab",
            "Stop debugging a tab and release its port",
            object_schema(json!({ "tabId": { "type": "integer", "minimum": 1 } }), &["tabId"]),
            move |args| {
                let tabs = Arc::clone(&tabs);
                async move {
                    let args: TabArgs = parse("deactivate_tab", args)?;
                    let removed = tabs.deactivate_tab(args.tab_id).is_some();
                    Ok(json!({ "tabId": args.tab_id, "deactivated": removed }))
                }
            },
        )
    };

    let uri = {
        let tabs = Arc::clone(tabs);
        Tool::new(
            "get_tab_uri",
            "Return the virtual resource root of a tab",
            object_schema(target_schema(), &[]),
            move |args| {
                let tabs = Arc::clone(&tabs);
                async move {
                    let target: Target = parse("get_tab_uri", args)?;
                    let tab_id = target.resolve(&tabs)?;
                    let uri = tabs
                        .get_virtual_filesystem_uri(tab_id)
                        .ok_or_else(|| Error::tab_not_found(tab_id))?;
                    Ok(json!({ "tabId": tab_id, "uri": uri }))
                }
            },
        )
    };

    vec![list, activate_tool, deactivate, uri]
}

// ============================================================================
// Session Tools
// ============================================================================

fn session_tools(tabs: &Arc<TabRegistry>) -> Vec<Tool> {
    let pin = {
        let tabs = Arc::clone(tabs);
        Tool::new(
            "pin_tab",
            "Bind a session to a tab",
            object_schema(
                json!({
                    "sessionId": { "type": "string" },
                    "tabId": { "type": "integer", "minimum": 1 }
                }),
                &["sessionId", "tabId"],
            ),
            move |args| {
                let tabs = Arc::clone(&tabs);
                async move {
                    let args: PinArgs = parse("pin_tab", args)?;
                    to_json(&tabs.pin_tab(args.session_id, args.tab_id))
                }
            },
        )
    };

    let unpin = {
        let tabs = Arc::clone(tabs);
        Tool::new(
            "unpin_tab",
            "Remove a session's tab binding",
            object_schema(json!({ "sessionId": { "type": "string" } }), &["sessionId"]),
            move |args| {
                let tabs = Arc::clone(&tabs);
                async move {
                    let args: SessionArgs = parse("unpin_tab", args)?;
                    Ok(json!({ "tabId": tabs.unpin_tab(&args.session_id) }))
                }
            },
        )
    };

    let pinned = {
        let tabs = Arc::clone(tabs);
        Tool::new(
            "get_pinned_tab",
            "Return the tab a session is pinned to",
            object_schema(json!({ "sessionId": { "type": "string" } }), &["sessionId"]),
            move |args| {
                let tabs = Arc::clone(&tabs);
                async move {
                    let args: SessionArgs = parse("get_pinned_tab", args)?;
                    Ok(json!({ "tabId": tabs.get_pinned_tab(&args.session_id) }))
                }
            },
        )
    };

    vec![pin, unpin, pinned]
}

// ============================================================================
// Snapshot Tool
// ============================================================================

fn snapshot_tool(tabs: &Arc<TabRegistry>, mapper: &ResourceMapper) -> Tool {
    let tabs = Arc::clone(tabs);
    let mapper = mapper.clone();

    let mut properties = target_schema();
    if let Some(map) = properties.as_object_mut() {
        map.insert("html".into(), json!({ "type": "string" }));
        map.insert("title".into(), json!({ "type": "string" }));
        map.insert("consoleLogs".into(), json!({ "type": "array" }));
        map.insert("appendConsoleLogs".into(), json!({ "type": "array" }));
        map.insert("networkRequests".into(), json!({ "type": "array" }));
        map.insert("appendNetworkRequests".into(), json!({ "type": "array" }));
        map.insert("frameworks".into(), json!({ "type": "array" }));
    }

    Tool::new(
        "update_snapshot",
        "Update the captured state of an active tab",
        object_schema(properties, &[]),
        move |args| {
            let tabs = Arc::clone(&tabs);
            let mapper = mapper.clone();
            async move {
                let args: SnapshotArgs = parse("update_snapshot", args)?;
                let tab_id = args.target.resolve(&tabs)?;
                if !tabs.is_active(tab_id) {
                    return Err(Error::tab_not_found(tab_id));
                }

                if let Some(title) = args.title {
                    tabs.update_title(tab_id, title)?;
                }
                if let Some(html) = args.html {
                    mapper.set_html(tab_id, html);
                }
                if let Some(logs) = args.console_logs {
                    mapper.set_console_logs(tab_id, logs);
                }
                for entry in args.append_console_logs {
                    mapper.push_console_log(tab_id, entry);
                }
                if let Some(requests) = args.network_requests {
                    mapper.set_network_requests(tab_id, requests);
                }
                for entry in args.append_network_requests {
                    mapper.push_network_request(tab_id, entry);
                }
                if let Some(frameworks) = args.frameworks {
                    tabs.set_detected_capability(tab_id, frameworks.first().map(|c| c.name.clone()))?;
                    mapper.set_frameworks(tab_id, frameworks);
                }

                Ok(json!({ "tabId": tab_id, "updated": true }))
            }
        },
    )
}

// ============================================================================
// Prompts
// ============================================================================

fn debug_tab_prompt(tabs: &Arc<TabRegistry>, mapper: &ResourceMapper) -> Prompt {
    let tabs = Arc::clone(tabs);
    let mapper = mapper.clone();

    Prompt::new(
        "debug_tab",
        "Ask the assistant to investigate a tab using its resources",
        vec![
            PromptArgument {
                name: "tabId".into(),
                description: "Tab to debug; defaults to the pinned or only active tab".into(),
                required: false,
            },
            PromptArgument {
                name: "sessionId".into(),
                description: "Session whose pinned tab to debug".into(),
                required: false,
            },
        ],
        move |args| {
            let tabs = Arc::clone(&tabs);
            let mapper = mapper.clone();
            async move {
                let target: Target = parse("debug_tab", args)?;
                let tab_id = target.resolve(&tabs)?;
                let record = tabs.get_tab(tab_id).ok_or_else(|| Error::tab_not_found(tab_id))?;

                let mut text = format!(
                    "Debug the browser tab \"{}\" at {} (tab {}).\n",
                    record.title, record.url, record.tab_id
                );
                if let Some(capability) = &record.detected_capability {
                    text.push_str(&format!("The page uses {capability}.\n"));
                }
                text.push_str("Read these resources before answering:\n");
                for uri in ResourceMapper::resource_uris(&record.url) {
                    text.push_str(&format!("- {uri}\n"));
                }
                if !mapper.has_tab(tab_id) {
                    text.push_str("No snapshot has been captured yet.\n");
                }
                text.push_str("Start with console errors, then failed network requests.");

                Ok(GetPromptResult {
                    description: Some(format!("Debug tab {tab_id}")),
                    messages: vec![PromptMessage::user(text)],
                })
            }
        },
    )
}

// ============================================================================
// Tests
// ============================================================================
