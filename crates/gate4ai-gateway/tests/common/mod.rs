//! Test fixtures: an in-process mock MCP backend speaking the SSE + POST
//! wire protocol, and a mock downstream session that records notifications.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use gate4ai_gateway::{
    downstream::{DownstreamSession, NotificationError},
    model::{
        CallToolResult, CompleteResult, CompletionInfo, Content, GetPromptResult, JsonObject,
        JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
        Prompt, RawResource, RawResourceTemplate, ReadResourceResult, Resource, ResourceContents,
        ResourceTemplate, Tool,
    },
    timeouts::Timeouts,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Short durations so TTL expiries and retries are observable in tests.
pub fn short_timeouts() -> Timeouts {
    Timeouts {
        open: Duration::from_secs(5),
        request: Duration::from_secs(5),
        list_fetch: Duration::from_secs(3),
        cache_ttl: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(50),
        sse_retry_min: Duration::from_millis(100),
        sse_retry_max: Duration::from_millis(400),
    }
}

pub fn tool(name: &str) -> Tool {
    let schema: JsonObject = json!({"type": "object"})
        .as_object()
        .expect("object literal")
        .clone();
    Tool::new(name.to_string(), format!("tool {name}"), schema)
}

pub fn tools(names: &[&str]) -> Vec<Tool> {
    names.iter().map(|name| tool(name)).collect()
}

pub fn prompt(name: &str) -> Prompt {
    Prompt::new(name, Some(format!("prompt {name}")), None)
}

pub fn resource(uri: &str, name: &str) -> Resource {
    use gate4ai_gateway::model::AnnotateAble;
    RawResource::new(uri, name).no_annotation()
}

pub fn template(uri_template: &str, name: &str) -> ResourceTemplate {
    use gate4ai_gateway::model::AnnotateAble;
    RawResourceTemplate {
        uri_template: uri_template.to_string(),
        name: name.to_string(),
        title: None,
        description: None,
        mime_type: None,
    }
    .no_annotation()
}

#[derive(Clone)]
pub struct MockBackendConfig {
    pub name: String,
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub templates: Vec<ResourceTemplate>,
    /// When set, list responses paginate with this page size.
    pub page_size: Option<usize>,
    pub protocol_version: String,
    pub reject_initialize: bool,
    /// Answer the SSE GET with this status instead of a stream.
    pub reject_sse_status: Option<u16>,
    /// Emit the endpoint event twice; the second one must be ignored.
    pub duplicate_endpoint: bool,
    /// Emit an unknown SSE event before the endpoint event.
    pub emit_unknown_event: bool,
    /// Delay tool-call responses, for cancellation tests.
    pub call_delay: Option<Duration>,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            page_size: None,
            protocol_version: "2025-03-26".to_string(),
            reject_initialize: false,
            reject_sse_status: None,
            duplicate_endpoint: false,
            emit_unknown_event: false,
            call_delay: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct Recorded {
    pub initialize_count: usize,
    pub initialized_notifications: usize,
    /// method → request count, e.g. "tools/list" → 3 under pagination.
    pub list_requests: HashMap<String, usize>,
    /// (tool name, arguments) exactly as the gateway sent them.
    pub calls: Vec<(String, Option<JsonObject>)>,
    pub prompt_gets: Vec<String>,
    pub reads: Vec<String>,
    pub subscribes: Vec<String>,
    pub unsubscribes: Vec<String>,
    pub completes: Vec<Value>,
    pub last_post_headers: HashMap<String, String>,
    pub sse_headers: HashMap<String, String>,
}

struct MockState {
    config: MockBackendConfig,
    sessions: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_session: AtomicU64,
    recorded: Mutex<Recorded>,
}

/// An in-process MCP server: `GET /sse` streams the endpoint event plus
/// JSON-RPC messages, `POST /message?sessionId=N` accepts client messages.
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

#[derive(serde::Deserialize)]
struct PostQuery {
    #[serde(rename = "sessionId")]
    session_id: u64,
}

impl MockBackend {
    pub async fn start(config: MockBackendConfig) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            config,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            recorded: Mutex::new(Recorded::default()),
        });
        let router = Router::new()
            .route("/sse", get(sse_handler))
            .route("/message", post(post_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self { addr, state })
    }

    pub fn url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    pub fn recorded(&self) -> Recorded {
        self.state.recorded.lock().expect("recorded lock").clone()
    }

    pub fn list_request_count(&self, method: &str) -> usize {
        self.recorded()
            .list_requests
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    /// Push `notifications/resources/updated` to every connected session.
    pub async fn notify_resource_updated(&self, uri: &str) {
        self.notify(
            "notifications/resources/updated",
            Some(json!({ "uri": uri })),
        )
        .await;
    }

    pub async fn notify_prompts_list_changed(&self) {
        self.notify("notifications/prompts/list_changed", None).await;
    }

    pub async fn notify_resources_list_changed(&self) {
        self.notify("notifications/resources/list_changed", None)
            .await;
    }

    async fn notify(&self, method: &str, params: Option<Value>) {
        let message = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_string(&message).expect("encode notification");
        let senders: Vec<mpsc::Sender<String>> = self
            .state
            .sessions
            .lock()
            .expect("sessions lock")
            .values()
            .cloned()
            .collect();
        for sender in senders {
            let _ = sender.send(payload.clone()).await;
        }
    }
}

async fn sse_handler(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if let Some(status) = state.config.reject_sse_status {
        return (
            StatusCode::from_u16(status).expect("valid status"),
            "rejected",
        )
            .into_response();
    }
    {
        let mut recorded = state.recorded.lock().expect("recorded lock");
        recorded.sse_headers = header_map(&headers);
    }

    let session = state.next_session.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel::<String>(64);
    state
        .sessions
        .lock()
        .expect("sessions lock")
        .insert(session, tx);

    let endpoint = format!("/message?sessionId={session}");
    let mut head: Vec<Result<Event, Infallible>> = Vec::new();
    if state.config.emit_unknown_event {
        head.push(Ok(Event::default().event("mystery").data("??")));
    }
    head.push(Ok(Event::default().event("endpoint").data(&endpoint)));
    if state.config.duplicate_endpoint {
        head.push(Ok(Event::default()
            .event("endpoint")
            .data("/somewhere-else")));
    }

    let stream = futures::stream::iter(head).chain(
        ReceiverStream::new(rx).map(|payload| Ok(Event::default().event("message").data(payload))),
    );
    Sse::new(stream).into_response()
}

async fn post_handler(
    State(state): State<Arc<MockState>>,
    Query(PostQuery { session_id }): Query<PostQuery>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> StatusCode {
    {
        let mut recorded = state.recorded.lock().expect("recorded lock");
        recorded.last_post_headers = header_map(&headers);
    }
    let message: JsonRpcMessage = match serde_json::from_value(message) {
        Ok(message) => message,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    match message {
        JsonRpcMessage::Request(request) => {
            let state = state.clone();
            tokio::spawn(async move { answer(state, session_id, request).await });
            StatusCode::ACCEPTED
        }
        JsonRpcMessage::Notification(notification) => {
            if notification.method == "notifications/initialized" {
                let mut recorded = state.recorded.lock().expect("recorded lock");
                recorded.initialized_notifications += 1;
            }
            StatusCode::ACCEPTED
        }
        // responses to server-initiated requests; the mock sends none
        _ => StatusCode::ACCEPTED,
    }
}

async fn answer(state: Arc<MockState>, session_id: u64, request: JsonRpcRequest) {
    let config = &state.config;
    let params = request.params.clone().unwrap_or(Value::Null);
    let outcome: Result<Value, (i32, String)> = match request.method.as_str() {
        "initialize" => {
            {
                let mut recorded = state.recorded.lock().expect("recorded lock");
                recorded.initialize_count += 1;
            }
            if config.reject_initialize {
                Err((-32603, "initialize rejected".to_string()))
            } else {
                Ok(json!({
                    "protocolVersion": config.protocol_version,
                    "capabilities": {
                        "tools": {},
                        "prompts": {"listChanged": true},
                        "resources": {"subscribe": true, "listChanged": true}
                    },
                    "serverInfo": {"name": config.name, "version": "0.1.0"}
                }))
            }
        }
        "tools/list" => Ok(page(&state, "tools/list", &config.tools, &params, "tools")),
        "prompts/list" => Ok(page(
            &state,
            "prompts/list",
            &config.prompts,
            &params,
            "prompts",
        )),
        "resources/list" => Ok(page(
            &state,
            "resources/list",
            &config.resources,
            &params,
            "resources",
        )),
        "resources/templates/list" => Ok(page(
            &state,
            "resources/templates/list",
            &config.templates,
            &params,
            "resourceTemplates",
        )),
        "tools/call" => {
            if let Some(delay) = config.call_delay {
                tokio::time::sleep(delay).await;
            }
            let name = params["name"].as_str().unwrap_or_default().to_string();
            let arguments = params["arguments"].as_object().cloned();
            {
                let mut recorded = state.recorded.lock().expect("recorded lock");
                recorded.calls.push((name.clone(), arguments));
            }
            if name == "broken" {
                // semantic failure: isError payload, not a protocol error
                let result = CallToolResult::error(vec![Content::text("tool exploded")]);
                Ok(serde_json::to_value(result).expect("encode"))
            } else {
                let result =
                    CallToolResult::success(vec![Content::text(format!("ran {name}"))]);
                Ok(serde_json::to_value(result).expect("encode"))
            }
        }
        "prompts/get" => {
            let name = params["name"].as_str().unwrap_or_default().to_string();
            {
                let mut recorded = state.recorded.lock().expect("recorded lock");
                recorded.prompt_gets.push(name.clone());
            }
            match config.prompts.iter().find(|p| p.name == name) {
                Some(_) => {
                    let result = GetPromptResult {
                        description: Some(name),
                        messages: Vec::new(),
                    };
                    Ok(serde_json::to_value(result).expect("encode"))
                }
                None => Err((-32602, format!("unknown prompt: {name}"))),
            }
        }
        "resources/read" => {
            let uri = params["uri"].as_str().unwrap_or_default().to_string();
            {
                let mut recorded = state.recorded.lock().expect("recorded lock");
                recorded.reads.push(uri.clone());
            }
            match config.resources.iter().find(|r| r.uri == uri) {
                Some(_) => {
                    let result = ReadResourceResult {
                        contents: vec![ResourceContents::text(format!("contents of {uri}"), uri)],
                    };
                    Ok(serde_json::to_value(result).expect("encode"))
                }
                None => Err((-32002, format!("unknown resource: {uri}"))),
            }
        }
        "resources/subscribe" => {
            let uri = params["uri"].as_str().unwrap_or_default().to_string();
            let mut recorded = state.recorded.lock().expect("recorded lock");
            recorded.subscribes.push(uri);
            Ok(json!({}))
        }
        "resources/unsubscribe" => {
            let uri = params["uri"].as_str().unwrap_or_default().to_string();
            let mut recorded = state.recorded.lock().expect("recorded lock");
            recorded.unsubscribes.push(uri);
            Ok(json!({}))
        }
        "completion/complete" => {
            {
                let mut recorded = state.recorded.lock().expect("recorded lock");
                recorded.completes.push(params.clone());
            }
            let result = CompleteResult {
                completion: CompletionInfo {
                    values: vec!["alpha".to_string(), "beta".to_string()],
                    total: Some(2),
                    has_more: Some(false),
                },
            };
            Ok(serde_json::to_value(result).expect("encode"))
        }
        "ping" => Ok(json!({})),
        other => Err((-32601, format!("method not found: {other}"))),
    };

    let payload = match outcome {
        Ok(result) => serde_json::to_string(&JsonRpcResponse::new(request.id, result)),
        Err((code, message)) => serde_json::to_string(&JsonRpcError::new(
            request.id,
            gate4ai_gateway::model::ErrorData::new(
                gate4ai_gateway::model::ErrorCode(code),
                message,
                None,
            ),
        )),
    }
    .expect("encode response");

    let sender = state
        .sessions
        .lock()
        .expect("sessions lock")
        .get(&session_id)
        .cloned();
    if let Some(sender) = sender {
        let _ = sender.send(payload).await;
    }
}

/// Slice one page out of a fixture list and count the request.
fn page<T: serde::Serialize>(
    state: &MockState,
    method: &str,
    items: &[T],
    params: &Value,
    field: &str,
) -> Value {
    {
        let mut recorded = state.recorded.lock().expect("recorded lock");
        *recorded.list_requests.entry(method.to_string()).or_insert(0) += 1;
    }
    let start: usize = params["cursor"]
        .as_str()
        .and_then(|cursor| cursor.parse().ok())
        .unwrap_or(0);
    let (slice, next_cursor) = match state.config.page_size {
        Some(size) => {
            let end = (start + size).min(items.len());
            let next = (end < items.len()).then(|| end.to_string());
            (&items[start..end], next)
        }
        None => (items, None),
    };
    let mut body = serde_json::Map::new();
    body.insert(
        field.to_string(),
        serde_json::to_value(slice).expect("encode page"),
    );
    if let Some(cursor) = next_cursor {
        body.insert("nextCursor".to_string(), json!(cursor));
    }
    Value::Object(body)
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Downstream session that records every notification it receives.
pub struct MockDownstream {
    id: String,
    user_id: Option<String>,
    remote_addr: Option<SocketAddr>,
    forwarded_for: Option<String>,
    tx: mpsc::UnboundedSender<(String, Value)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, Value)>>,
}

impl MockDownstream {
    pub fn new(id: &str, user_id: Option<&str>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: id.to_string(),
            user_id: user_id.map(String::from),
            remote_addr: Some("10.1.2.3:4444".parse().expect("static addr")),
            forwarded_for: None,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub async fn next_notification(&self, timeout: Duration) -> Option<(String, Value)> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

#[async_trait]
impl DownstreamSession for MockDownstream {
    fn id(&self) -> &str {
        &self.id
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn forwarded_for(&self) -> Option<String> {
        self.forwarded_for.clone()
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), NotificationError> {
        self.tx
            .send((method.to_string(), params))
            .map_err(|error| NotificationError(error.to_string()))
    }
}
