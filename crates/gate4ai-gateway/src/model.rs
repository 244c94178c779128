//! The subset of the MCP schema the gateway speaks, plus the JSON-RPC 2.0
//! envelope used on the upstream wire. Everything serializes camelCase, the
//! way the protocol schema spells it.

mod annotated;
mod capabilities;
mod content;
mod prompt;
mod resource;
mod tool;

use std::{borrow::Cow, fmt::Display, sync::Arc};

pub use annotated::{AnnotateAble, Annotated, Annotations, Role};
pub use capabilities::{
    ClientCapabilities, CompletionsCapability, PromptsCapability, ResourcesCapability,
    RootsCapability, ServerCapabilities, ToolsCapability,
};
pub use content::{Content, EmbeddedResource, RawContent, RawEmbeddedResource, RawImageContent,
    RawTextContent};
pub use prompt::{Prompt, PromptArgument, PromptMessage, PromptMessageContent, PromptMessageRole};
pub use resource::{RawResource, RawResourceTemplate, Resource, ResourceContents,
    ResourceTemplate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
pub use tool::{Tool, ToolAnnotations};

pub type JsonObject = serde_json::Map<String, Value>;

/// The `_meta` bag attached to some schema objects.
pub type Meta = JsonObject;

pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
pub const NOTIFICATION_RESOURCES_UPDATED: &str = "notifications/resources/updated";
pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// An MCP protocol revision, compared as its date string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(Cow<'static, str>);

impl ProtocolVersion {
    pub const V_2024_11_05: Self = Self(Cow::Borrowed("2024-11-05"));
    pub const V_2025_03_26: Self = Self(Cow::Borrowed("2025-03-26"));
    /// What the gateway advertises in `initialize`.
    pub const LATEST: Self = Self::V_2025_03_26;
    /// Whitelist of revisions the gateway accepts from an upstream. Anything
    /// else is a fatal handshake error.
    pub const SUPPORTED: [Self; 2] = [Self::V_2024_11_05, Self::V_2025_03_26];

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON-RPC request id. The gateway allocates numbers; servers may answer
/// with strings, so both spellings round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(Arc<str>),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => Display::fmt(n, f),
            RequestId::String(s) => Display::fmt(s, f),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

/// The literal `"2.0"` version marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version != "2.0" {
            return Err(serde::de::Error::custom(format!(
                "unsupported JSON-RPC version: {version}"
            )));
        }
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

impl JsonRpcError {
    pub fn new(id: RequestId, error: ErrorData) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        }
    }
}

/// Any JSON-RPC message, either direction.
///
/// Variant order matters for the untagged deserializer: a response carries
/// `result`, an error carries `error`, a request carries `id` + `method`, and
/// only then a bare `method` parses as a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Response(JsonRpcResponse),
    Error(JsonRpcError),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

/// Error object of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    pub const RESOURCE_NOT_FOUND: Self = Self(-32002);
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn internal_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, None)
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, None)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }

    pub fn resource_not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::RESOURCE_NOT_FOUND, message, None)
    }
}

/// Name and version of one protocol party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: String,
}

impl Implementation {
    pub fn from_crate() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            title: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Icon {
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParam {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedRequestParam {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    pub prompts: Vec<Prompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    pub resources: Vec<Resource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesResult {
    pub resource_templates: Vec<ResourceTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolRequestParam {
    pub name: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Semantic failure flag. This is payload, not a transport error: the
    /// gateway forwards it verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn success(content: Vec<Content>) -> Self {
        Self {
            content,
            structured_content: None,
            is_error: Some(false),
        }
    }

    pub fn error(content: Vec<Content>) -> Self {
        Self {
            content,
            structured_content: None,
            is_error: Some(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptRequestParam {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceRequestParam {
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequestParam {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequestParam {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdatedNotificationParam {
    pub uri: String,
}

/// What a completion request points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reference {
    #[serde(rename = "ref/prompt")]
    Prompt(PromptReference),
    #[serde(rename = "ref/resource")]
    Resource(ResourceReference),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptReference {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentInfo {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequestParam {
    #[serde(rename = "ref")]
    pub reference: Reference,
    pub argument: ArgumentInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResult {
    pub completion: CompletionInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionInfo {
    pub values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

/// A request the gateway can send upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeRequestParam),
    ListTools(PaginatedRequestParam),
    CallTool(CallToolRequestParam),
    ListPrompts(PaginatedRequestParam),
    GetPrompt(GetPromptRequestParam),
    ListResources(PaginatedRequestParam),
    ListResourceTemplates(PaginatedRequestParam),
    ReadResource(ReadResourceRequestParam),
    Subscribe(SubscribeRequestParam),
    Unsubscribe(UnsubscribeRequestParam),
    Complete(CompleteRequestParam),
}

impl ClientRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::Initialize(_) => "initialize",
            ClientRequest::ListTools(_) => "tools/list",
            ClientRequest::CallTool(_) => "tools/call",
            ClientRequest::ListPrompts(_) => "prompts/list",
            ClientRequest::GetPrompt(_) => "prompts/get",
            ClientRequest::ListResources(_) => "resources/list",
            ClientRequest::ListResourceTemplates(_) => "resources/templates/list",
            ClientRequest::ReadResource(_) => "resources/read",
            ClientRequest::Subscribe(_) => "resources/subscribe",
            ClientRequest::Unsubscribe(_) => "resources/unsubscribe",
            ClientRequest::Complete(_) => "completion/complete",
        }
    }

    pub fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        let params = match self {
            ClientRequest::Initialize(p) => serde_json::to_value(p)?,
            ClientRequest::ListTools(p) => serde_json::to_value(p)?,
            ClientRequest::CallTool(p) => serde_json::to_value(p)?,
            ClientRequest::ListPrompts(p) => serde_json::to_value(p)?,
            ClientRequest::GetPrompt(p) => serde_json::to_value(p)?,
            ClientRequest::ListResources(p) => serde_json::to_value(p)?,
            ClientRequest::ListResourceTemplates(p) => serde_json::to_value(p)?,
            ClientRequest::ReadResource(p) => serde_json::to_value(p)?,
            ClientRequest::Subscribe(p) => serde_json::to_value(p)?,
            ClientRequest::Unsubscribe(p) => serde_json::to_value(p)?,
            ClientRequest::Complete(p) => serde_json::to_value(p)?,
        };
        Ok(Some(params))
    }
}

/// A notification the gateway can send upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientNotification {
    Initialized,
}

impl ClientNotification {
    pub fn method(&self) -> &'static str {
        match self {
            ClientNotification::Initialized => NOTIFICATION_INITIALIZED,
        }
    }
}

/// Notifications a server pushes down the SSE stream, pre-routed by method.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    ResourceUpdated(ResourceUpdatedNotificationParam),
    ResourcesListChanged,
    PromptsListChanged,
    ToolsListChanged,
}

impl ServerNotification {
    /// `None` for methods the gateway does not route; `Some(Err(_))` for a
    /// routed method with a malformed payload.
    pub fn parse(
        method: &str,
        params: Option<&Value>,
    ) -> Option<Result<Self, serde_json::Error>> {
        match method {
            NOTIFICATION_RESOURCES_UPDATED => {
                let params = params.cloned().unwrap_or(Value::Null);
                Some(serde_json::from_value(params).map(ServerNotification::ResourceUpdated))
            }
            NOTIFICATION_RESOURCES_LIST_CHANGED => {
                Some(Ok(ServerNotification::ResourcesListChanged))
            }
            NOTIFICATION_PROMPTS_LIST_CHANGED => Some(Ok(ServerNotification::PromptsListChanged)),
            NOTIFICATION_TOOLS_LIST_CHANGED => Some(Ok(ServerNotification::ToolsListChanged)),
            _ => None,
        }
    }
}
