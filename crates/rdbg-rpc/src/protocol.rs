//! Web Inspector RPC vocabulary.
//!
//! The native endpoint speaks binary property lists whose top-level dictionary
//! carries a `__selector` string and an `__argument` dictionary. Page-level
//! traffic is a JSON document tunnelled inside those plists
//! (`WIRSocketDataKey` outbound, `WIRMessageDataKey` inbound). The WebKit
//! variant exchanges the same JSON documents directly over a WebSocket.
//!
//! This module defines:
//! - [`Selector`] - closed set of inbound selectors (plus `Unknown`)
//! - [`SpecialEvent`] / [`SpecialPayload`] / [`Dispatch`] - special handler vocabulary
//! - [`DataEnvelope`] - the decoded JSON data document
//! - [`RpcMessage`] / [`InspectorCommand`] - outbound message builders
//! - [`app_info_from_dict`] / [`page_array_from_dict`] - WIR dictionary decoding

use plist::{Dictionary, Value as PlistValue};
use serde::Deserialize;
use serde_json::{json, Value};

use rdbg_core::{Application, Page, SimulatorInfo};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub const SELECTOR_KEY: &str = "__selector";
pub const ARGUMENT_KEY: &str = "__argument";

pub mod keys {
    pub const CONNECTION_ID: &str = "WIRConnectionIdentifierKey";
    pub const SENDER: &str = "WIRSenderKey";
    pub const APPLICATION_ID: &str = "WIRApplicationIdentifierKey";
    pub const APPLICATION_NAME: &str = "WIRApplicationNameKey";
    pub const APPLICATION_BUNDLE_ID: &str = "WIRApplicationBundleIdentifierKey";
    pub const APPLICATION_DICTIONARY: &str = "WIRApplicationDictionaryKey";
    pub const IS_PROXY: &str = "WIRIsApplicationProxyKey";
    pub const HOST_APPLICATION_ID: &str = "WIRHostApplicationIdentifierKey";
    pub const IS_ACTIVE: &str = "WIRIsApplicationActiveKey";
    pub const LISTING: &str = "WIRListingKey";
    pub const PAGE_ID: &str = "WIRPageIdentifierKey";
    pub const TITLE: &str = "WIRTitleKey";
    pub const URL: &str = "WIRURLKey";
    pub const TYPE: &str = "WIRTypeKey";
    pub const TYPE_WEB: &str = "WIRTypeWeb";
    pub const MESSAGE_DATA: &str = "WIRMessageDataKey";
    pub const SOCKET_DATA: &str = "WIRSocketDataKey";
    pub const AUTOMATICALLY_PAUSE: &str = "WIRAutomaticallyPause";
    pub const INDICATE_ENABLED: &str = "WIRIndicateEnabledKey";
    pub const DRIVER_DICTIONARY: &str = "WIRDriverDictionaryKey";
    pub const SIMULATOR_NAME: &str = "WIRSimulatorNameKey";
    pub const SIMULATOR_BUILD: &str = "WIRSimulatorBuildKey";
    pub const SIMULATOR_PRODUCT_VERSION: &str = "WIRSimulatorProductVersionKey";
}

// ---------------------------------------------------------------------------
// Inbound selectors
// ---------------------------------------------------------------------------

/// Inbound protocol selectors the router knows how to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    ReportSetup,
    ReportConnectedApplicationList,
    ReportConnectedDriverList,
    ApplicationSentListing,
    ApplicationConnected,
    ApplicationDisconnected,
    ApplicationUpdated,
    ApplicationSentData,
    /// Selectors from newer endpoints; dropped without failing.
    Unknown(String),
}

impl Selector {
    pub fn parse(selector: &str) -> Self {
        match selector {
            "_rpc_reportSetup:" => Selector::ReportSetup,
            "_rpc_reportConnectedApplicationList:" => Selector::ReportConnectedApplicationList,
            "_rpc_reportConnectedDriverList:" => Selector::ReportConnectedDriverList,
            "_rpc_applicationSentListing:" => Selector::ApplicationSentListing,
            "_rpc_applicationConnected:" => Selector::ApplicationConnected,
            "_rpc_applicationDisconnected:" => Selector::ApplicationDisconnected,
            "_rpc_applicationUpdated:" => Selector::ApplicationUpdated,
            "_rpc_applicationSentData:" => Selector::ApplicationSentData,
            other => Selector::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Selector::ReportSetup => "_rpc_reportSetup:",
            Selector::ReportConnectedApplicationList => "_rpc_reportConnectedApplicationList:",
            Selector::ReportConnectedDriverList => "_rpc_reportConnectedDriverList:",
            Selector::ApplicationSentListing => "_rpc_applicationSentListing:",
            Selector::ApplicationConnected => "_rpc_applicationConnected:",
            Selector::ApplicationDisconnected => "_rpc_applicationDisconnected:",
            Selector::ApplicationUpdated => "_rpc_applicationUpdated:",
            Selector::ApplicationSentData => "_rpc_applicationSentData:",
            Selector::Unknown(s) => s,
        }
    }
}

// ---------------------------------------------------------------------------
// Special handler vocabulary
// ---------------------------------------------------------------------------

/// Logical lifecycle events a special handler can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialEvent {
    ReportIdentifier,
    ConnectedApplicationList,
    ConnectedDriverList,
    ApplicationListing,
    ApplicationConnected,
    ApplicationDisconnected,
    ApplicationUpdated,
    /// A frame navigated away without the caller expecting it.
    PageUnload,
}

/// Whether a special handler stays armed after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    OneShot,
    Persistent,
}

/// Sub-fields extracted from an inbound plist for a special handler.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecialPayload {
    ReportIdentifier(SimulatorInfo),
    ConnectedApplicationList(Dictionary),
    ConnectedDriverList(Dictionary),
    ApplicationListing { app_id: String, listing: Dictionary },
    ApplicationConnected(Dictionary),
    ApplicationDisconnected(Dictionary),
    ApplicationUpdated(Dictionary),
    PageUnload,
}

impl SpecialPayload {
    pub fn event(&self) -> SpecialEvent {
        match self {
            SpecialPayload::ReportIdentifier(_) => SpecialEvent::ReportIdentifier,
            SpecialPayload::ConnectedApplicationList(_) => SpecialEvent::ConnectedApplicationList,
            SpecialPayload::ConnectedDriverList(_) => SpecialEvent::ConnectedDriverList,
            SpecialPayload::ApplicationListing { .. } => SpecialEvent::ApplicationListing,
            SpecialPayload::ApplicationConnected(_) => SpecialEvent::ApplicationConnected,
            SpecialPayload::ApplicationDisconnected(_) => SpecialEvent::ApplicationDisconnected,
            SpecialPayload::ApplicationUpdated(_) => SpecialEvent::ApplicationUpdated,
            SpecialPayload::PageUnload => SpecialEvent::PageUnload,
        }
    }
}

// ---------------------------------------------------------------------------
// Data channel
// ---------------------------------------------------------------------------

/// Protocol notifications on the data channel that are not correlated by id.
pub mod methods {
    pub const PROFILER_RESET_PROFILES: &str = "Profiler.resetProfiles";
    pub const PAGE_FRAME_NAVIGATED: &str = "Page.frameNavigated";
    pub const PAGE_LOAD_EVENT_FIRED: &str = "Page.loadEventFired";
    pub const TIMELINE_EVENT_RECORDED: &str = "Timeline.eventRecorded";
}

/// A JSON data document from `WIRMessageDataKey` or a WebKit text frame.
#[derive(Debug, Default, Deserialize)]
pub struct DataEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl DataEnvelope {
    pub fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// The correlation id as a string; numeric ids are stringified.
    pub fn correlation_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// The message the remote side threw, when `result.wasThrown` is set.
    pub fn thrown_message(&self) -> Option<String> {
        let result = self.result.as_ref()?;
        if !result.get("wasThrown").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        Some(thrown_value_message(result.get("result")))
    }

    /// Text of an explicit `error` field.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => Some(
                obj.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
            ),
            other => Some(other.to_string()),
        }
    }
}

/// Describe a thrown remote object: its `value`, else its `description`.
pub fn thrown_value_message(thrown: Option<&Value>) -> String {
    let Some(thrown) = thrown else {
        return "unknown remote exception".to_string();
    };
    let pick = thrown
        .get("value")
        .filter(|v| !v.is_null())
        .or_else(|| thrown.get("description"));
    match pick {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => thrown.to_string(),
    }
}

// ---------------------------------------------------------------------------
// WIR dictionary decoding
// ---------------------------------------------------------------------------

fn dict_string(dict: &Dictionary, key: &str) -> Option<String> {
    match dict.get(key)? {
        PlistValue::String(s) => Some(s.clone()),
        PlistValue::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn dict_bool(dict: &Dictionary, key: &str) -> bool {
    match dict.get(key) {
        Some(PlistValue::Boolean(b)) => *b,
        Some(PlistValue::Integer(i)) => i.as_signed().map(|n| n != 0).unwrap_or(false),
        Some(PlistValue::String(s)) => s == "true" || s == "1",
        _ => false,
    }
}

/// Decode an application dictionary. Returns `None` without an identifier.
pub fn app_info_from_dict(dict: &Dictionary) -> Option<Application> {
    let id = dict_string(dict, keys::APPLICATION_ID)?;
    let mut app = Application::new(
        id,
        dict_string(dict, keys::APPLICATION_NAME).unwrap_or_default(),
        dict_string(dict, keys::APPLICATION_BUNDLE_ID).unwrap_or_default(),
    );
    app.is_proxy = dict_bool(dict, keys::IS_PROXY);
    app.host_id = dict_string(dict, keys::HOST_APPLICATION_ID);
    app.is_active = dict_bool(dict, keys::IS_ACTIVE);
    Some(app)
}

fn page_from_dict(dict: &Dictionary) -> Option<Page> {
    let id = dict_string(dict, keys::PAGE_ID)?;
    Some(
        Page::new(
            id,
            dict_string(dict, keys::TITLE).unwrap_or_default(),
            dict_string(dict, keys::URL).unwrap_or_default(),
        )
        .with_key(dict.contains_key(keys::CONNECTION_ID)),
    )
}

/// Decode a `WIRListingKey` dictionary into pages, in listing order.
///
/// Entries with a `WIRTypeKey` other than `WIRTypeWeb` are not pages and are
/// skipped. A listing that is itself a single page dictionary yields that page.
pub fn page_array_from_dict(listing: &Dictionary) -> Vec<Page> {
    if listing.contains_key(keys::PAGE_ID) {
        return page_from_dict(listing).into_iter().collect();
    }

    listing
        .values()
        .filter_map(PlistValue::as_dictionary)
        .filter(|entry| match entry.get(keys::TYPE) {
            None => true,
            Some(kind) => kind.as_string() == Some(keys::TYPE_WEB),
        })
        .filter_map(page_from_dict)
        .collect()
}

/// Decode `_rpc_reportSetup:` arguments.
pub fn simulator_info_from_dict(dict: &Dictionary) -> SimulatorInfo {
    SimulatorInfo {
        name: dict_string(dict, keys::SIMULATOR_NAME),
        build: dict_string(dict, keys::SIMULATOR_BUILD),
        product_version: dict_string(dict, keys::SIMULATOR_PRODUCT_VERSION),
    }
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// Identifiers that scope every outbound message to this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIds {
    pub connection_id: String,
    pub sender_id: String,
}

impl ConnectionIds {
    /// Generate fresh random identifiers in uppercase UUID format.
    pub fn generate() -> Self {
        Self {
            connection_id: random_uuid(),
            sender_id: random_uuid(),
        }
    }
}

fn random_uuid() -> String {
    let n: u128 = rand::random();
    let hex = format!("{:032X}", n);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Page identifiers travel as integers when they look like one.
fn page_id_value(page_id: &str) -> PlistValue {
    match page_id.parse::<u64>() {
        Ok(n) => PlistValue::Integer(n.into()),
        Err(_) => PlistValue::String(page_id.to_string()),
    }
}

/// Outbound selector-level messages for the native variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    ReportIdentifier,
    GetConnectedApplications,
    ForwardGetListing {
        app_id: String,
    },
    ForwardSocketSetup {
        app_id: String,
        page_id: String,
    },
    ForwardSocketData {
        app_id: String,
        page_id: String,
        data: Vec<u8>,
    },
    ForwardIndicateWebView {
        app_id: String,
        page_id: String,
        enabled: bool,
    },
}

impl RpcMessage {
    pub fn selector(&self) -> &'static str {
        match self {
            RpcMessage::ReportIdentifier => "_rpc_reportIdentifier:",
            RpcMessage::GetConnectedApplications => "_rpc_getConnectedApplications:",
            RpcMessage::ForwardGetListing { .. } => "_rpc_forwardGetListing:",
            RpcMessage::ForwardSocketSetup { .. } => "_rpc_forwardSocketSetup:",
            RpcMessage::ForwardSocketData { .. } => "_rpc_forwardSocketData:",
            RpcMessage::ForwardIndicateWebView { .. } => "_rpc_forwardIndicateWebView:",
        }
    }

    /// Build the plist for this message, scoped to `ids`.
    pub fn to_plist(&self, ids: &ConnectionIds) -> PlistValue {
        let mut argument = Dictionary::new();
        argument.insert(
            keys::CONNECTION_ID.to_string(),
            PlistValue::String(ids.connection_id.clone()),
        );

        let mut page_scope = |app_id: &str, page_id: &str| {
            argument.insert(
                keys::APPLICATION_ID.to_string(),
                PlistValue::String(app_id.to_string()),
            );
            argument.insert(keys::PAGE_ID.to_string(), page_id_value(page_id));
            argument.insert(
                keys::SENDER.to_string(),
                PlistValue::String(ids.sender_id.clone()),
            );
        };

        match self {
            RpcMessage::ReportIdentifier | RpcMessage::GetConnectedApplications => {}
            RpcMessage::ForwardGetListing { app_id } => {
                argument.insert(
                    keys::APPLICATION_ID.to_string(),
                    PlistValue::String(app_id.clone()),
                );
            }
            RpcMessage::ForwardSocketSetup { app_id, page_id } => {
                page_scope(app_id, page_id);
                argument.insert(
                    keys::AUTOMATICALLY_PAUSE.to_string(),
                    PlistValue::Boolean(false),
                );
            }
            RpcMessage::ForwardSocketData {
                app_id,
                page_id,
                data,
            } => {
                page_scope(app_id, page_id);
                argument.insert(keys::SOCKET_DATA.to_string(), PlistValue::Data(data.clone()));
            }
            RpcMessage::ForwardIndicateWebView {
                app_id,
                page_id,
                enabled,
            } => {
                page_scope(app_id, page_id);
                argument.insert(
                    keys::INDICATE_ENABLED.to_string(),
                    PlistValue::Boolean(*enabled),
                );
            }
        }

        let mut message = Dictionary::new();
        message.insert(
            SELECTOR_KEY.to_string(),
            PlistValue::String(self.selector().to_string()),
        );
        message.insert(ARGUMENT_KEY.to_string(), PlistValue::Dictionary(argument));
        PlistValue::Dictionary(message)
    }
}

/// A page-level inspector command carried on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectorCommand {
    pub method: String,
    pub params: Value,
}

impl InspectorCommand {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// `Runtime.evaluate` returning the result by value.
    pub fn evaluate(expression: impl Into<String>) -> Self {
        Self::new(
            "Runtime.evaluate",
            json!({ "expression": expression.into(), "returnByValue": true }),
        )
    }

    pub fn page_enable() -> Self {
        Self::new("Page.enable", json!({}))
    }

    pub fn page_navigate(url: impl Into<String>) -> Self {
        Self::new("Page.navigate", json!({ "url": url.into() }))
    }

    pub fn timeline_start() -> Self {
        Self::new("Timeline.start", json!({}))
    }

    pub fn timeline_stop() -> Self {
        Self::new("Timeline.stop", json!({}))
    }

    /// Serialize with the given correlation id.
    pub fn to_json(&self, id: u64) -> String {
        json!({
            "id": id,
            "method": self.method,
            "params": self.params,
        })
        .to_string()
    }
}

/// Short human-readable description of a plist message for traffic logs.
pub fn summarize_plist(message: &PlistValue) -> String {
    let Some(dict) = message.as_dictionary() else {
        return "<non-dictionary plist>".to_string();
    };
    let selector = dict
        .get(SELECTOR_KEY)
        .and_then(PlistValue::as_string)
        .unwrap_or("<no selector>");
    let app = dict
        .get(ARGUMENT_KEY)
        .and_then(PlistValue::as_dictionary)
        .and_then(|arg| dict_string(arg, keys::APPLICATION_ID));
    match app {
        Some(app) => format!("{selector} ({app})"),
        None => selector.to_string(),
    }
}
