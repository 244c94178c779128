//! The upstream MCP client session: one live connection to one backend on
//! behalf of one downstream client.
//!
//! The read side is an SSE stream; the write side is HTTP POSTs to the
//! endpoint the server announces in its first `endpoint` event. A session is
//! `Connected` only after the `initialize` handshake succeeds on a
//! whitelisted protocol version. `Closed` is terminal: retrying a backend
//! means constructing a new session.

mod correlator;
mod signal;
mod sse;

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicI64, Ordering},
    },
    time::Instant,
};

use futures::StreamExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    ServiceError, SessionError,
    config::Slug,
    headers::ComposedHeaders,
    model::{
        CallToolRequestParam, CallToolResult, ClientCapabilities, ClientNotification,
        ClientRequest, CompleteRequestParam, CompleteResult, ErrorData, GetPromptRequestParam,
        GetPromptResult, Implementation, InitializeRequestParam, InitializeResult,
        JsonObject, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
        JsonRpcResponse, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
        ListToolsResult, PaginatedRequestParam, Prompt, ProtocolVersion,
        ReadResourceRequestParam, ReadResourceResult, RequestId, Resource, ResourceTemplate,
        ServerNotification, SubscribeRequestParam, Tool, UnsubscribeRequestParam,
    },
    timeouts::Timeouts,
};
use correlator::Correlator;
use signal::OnceSignal;
use sse::{Backoff, ConnectError, SseConnector, SseEvents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Connecting,
    Connected,
    Closed,
}

/// Which upstream list a `*/list_changed` notification invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangedList {
    Prompts,
    Resources,
}

struct State {
    status: SessionStatus,
    /// POST endpoint learned from the first `endpoint` event. Write-once;
    /// later endpoint events are ignored.
    endpoint: Option<Url>,
    protocol_version: Option<ProtocolVersion>,
    server_info: Option<Implementation>,
}

#[derive(Default)]
struct Callbacks {
    resource_updated: Vec<Box<dyn Fn(&str) + Send + Sync>>,
    list_changed: Vec<Box<dyn Fn(ChangedList) + Send + Sync>>,
}

/// Cached list, populated once per session after full pagination. Reset only
/// by a `list_changed` notification or `close()`.
struct ListCache<T> {
    slot: Mutex<Option<Arc<Vec<T>>>>,
}

impl<T> ListCache<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn get(&self) -> Option<Arc<Vec<T>>> {
        self.lock().clone()
    }

    fn set(&self, value: Arc<Vec<T>>) {
        *self.lock() = Some(value);
    }

    fn invalidate(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<Vec<T>>>> {
        self.slot.lock().expect("list cache lock poisoned")
    }
}

pub struct UpstreamSession {
    slug: Slug,
    downstream_id: Arc<str>,
    base_url: Url,
    headers: ComposedHeaders,
    http: reqwest::Client,
    timeouts: Timeouts,
    state: RwLock<State>,
    correlator: Correlator,
    init: OnceSignal<Result<(), Arc<SessionError>>>,
    ct: CancellationToken,
    request_counter: AtomicI64,
    callbacks: RwLock<Callbacks>,
    tools: ListCache<Tool>,
    prompts: ListCache<Prompt>,
    resources: ListCache<Resource>,
    resource_templates: ListCache<ResourceTemplate>,
}

impl UpstreamSession {
    pub fn new(
        slug: Slug,
        base_url: Url,
        headers: ComposedHeaders,
        downstream_id: Arc<str>,
        http: reqwest::Client,
        timeouts: Timeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            slug,
            downstream_id,
            base_url,
            headers,
            http,
            timeouts,
            state: RwLock::new(State {
                status: SessionStatus::New,
                endpoint: None,
                protocol_version: None,
                server_info: None,
            }),
            correlator: Correlator::new(),
            init: OnceSignal::new(),
            ct: CancellationToken::new(),
            request_counter: AtomicI64::new(0),
            callbacks: RwLock::new(Callbacks::default()),
            tools: ListCache::new(),
            prompts: ListCache::new(),
            resources: ListCache::new(),
            resource_templates: ListCache::new(),
        })
    }

    pub fn slug(&self) -> &Slug {
        &self.slug
    }

    pub fn downstream_id(&self) -> &Arc<str> {
        &self.downstream_id
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    /// Valid only once `Connected`.
    pub fn server_info(&self) -> Option<Implementation> {
        self.state().server_info.clone()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.state().protocol_version.clone()
    }

    /// Register a callback for inbound `notifications/resources/updated`.
    /// Callbacks run serially in arrival order on the session's read task and
    /// must not block.
    pub fn on_resource_updated(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks_mut().resource_updated.push(Box::new(callback));
    }

    /// Register a callback for upstream prompt/resource list changes.
    pub fn on_list_changed(&self, callback: impl Fn(ChangedList) + Send + Sync + 'static) {
        self.callbacks_mut().list_changed.push(Box::new(callback));
    }

    /// Connect and handshake. Idempotent: the first caller starts the work,
    /// every concurrent and later caller observes the identical outcome.
    pub async fn open(self: &Arc<Self>) -> Result<(), Arc<SessionError>> {
        let spawn = {
            let mut state = self.state_mut();
            match state.status {
                SessionStatus::New => {
                    state.status = SessionStatus::Connecting;
                    true
                }
                _ => false,
            }
        };
        if spawn {
            let session = self.clone();
            tokio::spawn(async move { session.run().await });
            let session = self.clone();
            tokio::spawn(async move { session.sweep_loop().await });
        }
        match tokio::time::timeout(self.timeouts.open, self.init.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // the first outcome set wins, so a racing success still
                // reaches every waiter
                self.init.set(Err(Arc::new(SessionError::OpenTimeout)));
                self.close();
                self.init.wait().await
            }
        }
    }

    /// Idempotent, non-blocking teardown. Pending requests fail with a
    /// cancellation error; the read task unwinds on the session token.
    pub fn close(&self) {
        {
            let mut state = self.state_mut();
            if state.status == SessionStatus::Closed {
                return;
            }
            state.status = SessionStatus::Closed;
        }
        debug!(slug = %self.slug, "closing upstream session");
        self.ct.cancel();
        self.correlator.cancel_all(ServiceError::Cancelled);
        self.init.set(Err(Arc::new(SessionError::Closed)));
        self.tools.invalidate();
        self.prompts.invalidate();
        self.resources.invalidate();
        self.resource_templates.invalidate();
    }

    // ---- typed operations -------------------------------------------------

    pub async fn tools(&self) -> Result<Arc<Vec<Tool>>, ServiceError> {
        self.ensure_connected()?;
        if let Some(cached) = self.tools.get() {
            return Ok(cached);
        }
        let fetched = self
            .fetch_paged(ClientRequest::ListTools, |page: ListToolsResult| {
                (page.tools, page.next_cursor)
            })
            .await?;
        self.tools.set(fetched.clone());
        Ok(fetched)
    }

    pub async fn prompts(&self) -> Result<Arc<Vec<Prompt>>, ServiceError> {
        self.ensure_connected()?;
        if let Some(cached) = self.prompts.get() {
            return Ok(cached);
        }
        let fetched = self
            .fetch_paged(ClientRequest::ListPrompts, |page: ListPromptsResult| {
                (page.prompts, page.next_cursor)
            })
            .await?;
        self.prompts.set(fetched.clone());
        Ok(fetched)
    }

    pub async fn resources(&self) -> Result<Arc<Vec<Resource>>, ServiceError> {
        self.ensure_connected()?;
        if let Some(cached) = self.resources.get() {
            return Ok(cached);
        }
        let fetched = self
            .fetch_paged(ClientRequest::ListResources, |page: ListResourcesResult| {
                (page.resources, page.next_cursor)
            })
            .await?;
        self.resources.set(fetched.clone());
        Ok(fetched)
    }

    pub async fn resource_templates(&self) -> Result<Arc<Vec<ResourceTemplate>>, ServiceError> {
        self.ensure_connected()?;
        if let Some(cached) = self.resource_templates.get() {
            return Ok(cached);
        }
        let fetched = self
            .fetch_paged(
                ClientRequest::ListResourceTemplates,
                |page: ListResourceTemplatesResult| (page.resource_templates, page.next_cursor),
            )
            .await?;
        self.resource_templates.set(fetched.clone());
        Ok(fetched)
    }

    /// Never touches the list caches.
    pub async fn call_tool(
        &self,
        params: CallToolRequestParam,
        ct: &CancellationToken,
    ) -> Result<CallToolResult, ServiceError> {
        self.ensure_connected()?;
        self.request(ClientRequest::CallTool(params), Some(ct)).await
    }

    pub async fn get_prompt(
        &self,
        params: GetPromptRequestParam,
        ct: &CancellationToken,
    ) -> Result<GetPromptResult, ServiceError> {
        self.ensure_connected()?;
        self.request(ClientRequest::GetPrompt(params), Some(ct)).await
    }

    pub async fn read_resource(
        &self,
        uri: impl Into<String>,
        ct: &CancellationToken,
    ) -> Result<ReadResourceResult, ServiceError> {
        self.ensure_connected()?;
        self.request(
            ClientRequest::ReadResource(ReadResourceRequestParam { uri: uri.into() }),
            Some(ct),
        )
        .await
    }

    /// Forwards the URI verbatim; the caller is responsible for translating
    /// gateway-visible URIs back to the backend's own namespace first.
    pub async fn subscribe_resource(
        &self,
        uri: impl Into<String>,
        ct: &CancellationToken,
    ) -> Result<(), ServiceError> {
        self.ensure_connected()?;
        self.request_raw(
            ClientRequest::Subscribe(SubscribeRequestParam { uri: uri.into() }),
            Some(ct),
        )
        .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(
        &self,
        uri: impl Into<String>,
        ct: &CancellationToken,
    ) -> Result<(), ServiceError> {
        self.ensure_connected()?;
        self.request_raw(
            ClientRequest::Unsubscribe(UnsubscribeRequestParam { uri: uri.into() }),
            Some(ct),
        )
        .await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        params: CompleteRequestParam,
        ct: &CancellationToken,
    ) -> Result<CompleteResult, ServiceError> {
        self.ensure_connected()?;
        self.request(ClientRequest::Complete(params), Some(ct)).await
    }

    // ---- request plumbing -------------------------------------------------

    async fn request<R: DeserializeOwned>(
        &self,
        request: ClientRequest,
        ct: Option<&CancellationToken>,
    ) -> Result<R, ServiceError> {
        let value = self.request_raw(request, ct).await?;
        serde_json::from_value(value).map_err(ServiceError::decode)
    }

    /// POST one request and wait for its correlated response. Returns only
    /// after the POST has been accepted or has failed; cancelling `ct` tears
    /// down the in-flight POST and removes the correlator entry without
    /// touching the session.
    async fn request_raw(
        &self,
        request: ClientRequest,
        ct: Option<&CancellationToken>,
    ) -> Result<Value, ServiceError> {
        let id = self.next_request_id();
        let deadline = Instant::now() + self.timeouts.request;
        let rx = self.correlator.register(id.clone(), deadline);

        let params = request.params().map_err(ServiceError::decode)?;
        let message = JsonRpcRequest::new(id.clone(), request.method(), params);

        let posted = match ct {
            Some(ct) => tokio::select! {
                _ = ct.cancelled() => Err(ServiceError::Cancelled),
                result = self.post(&message) => result,
            },
            None => self.post(&message).await,
        };
        if let Err(error) = posted {
            self.correlator.remove(&id);
            return Err(error);
        }

        let wait = async {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ServiceError::Closed),
            }
        };
        match ct {
            Some(ct) => tokio::select! {
                _ = ct.cancelled() => {
                    self.correlator.remove(&id);
                    Err(ServiceError::Cancelled)
                }
                outcome = wait => outcome,
            },
            None => wait.await,
        }
    }

    async fn notify(&self, notification: ClientNotification) -> Result<(), ServiceError> {
        self.post(&JsonRpcNotification::new(notification.method(), None))
            .await
    }

    async fn post<B: Serialize>(&self, body: &B) -> Result<(), ServiceError> {
        let endpoint = self
            .state()
            .endpoint
            .clone()
            .ok_or(ServiceError::NotConnected)?;
        let builder = self.http.post(endpoint).json(body);
        let response = self
            .headers
            .apply(builder)
            .send()
            .await
            .map_err(ServiceError::transport)?;
        if !response.status().is_success() {
            return Err(ServiceError::Http(response.status().as_u16()));
        }
        Ok(())
    }

    async fn fetch_paged<R, T>(
        &self,
        make: impl Fn(PaginatedRequestParam) -> ClientRequest,
        split: impl Fn(R) -> (Vec<T>, Option<String>),
    ) -> Result<Arc<Vec<T>>, ServiceError>
    where
        R: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor = None;
        loop {
            let page: R = self
                .request(make(PaginatedRequestParam { cursor }), None)
                .await?;
            let (mut page_items, next_cursor) = split(page);
            items.append(&mut page_items);
            cursor = next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(Arc::new(items))
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.request_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_connected(&self) -> Result<(), ServiceError> {
        match self.state().status {
            SessionStatus::Connected => Ok(()),
            SessionStatus::Closed => Err(ServiceError::Closed),
            _ => Err(ServiceError::NotConnected),
        }
    }

    // ---- read side --------------------------------------------------------

    async fn run(self: Arc<Self>) {
        let connector = SseConnector::new(
            self.http.clone(),
            self.base_url.clone(),
            self.headers.clone(),
        );
        let error = match self.read_loop(&connector).await {
            Ok(()) => {
                debug!(slug = %self.slug, "SSE stream closed by upstream");
                Arc::new(SessionError::Closed)
            }
            Err(error) => {
                if !matches!(*error, SessionError::Cancelled | SessionError::Closed) {
                    warn!(slug = %self.slug, %error, "upstream session failed");
                }
                error
            }
        };
        self.init.set(Err(error));
        self.close();
    }

    async fn read_loop(self: &Arc<Self>, connector: &SseConnector) -> Result<(), Arc<SessionError>> {
        let mut backoff = Backoff::new(&self.timeouts);
        let mut events = self.connect_with_retry(connector, &mut backoff).await?;
        loop {
            let event = tokio::select! {
                _ = self.ct.cancelled() => return Err(Arc::new(SessionError::Cancelled)),
                event = events.next() => event,
            };
            match event {
                Some(Ok(event)) => self.handle_event(event)?,
                Some(Err(error)) => {
                    warn!(slug = %self.slug, %error, "SSE stream error, reconnecting");
                    events = self.connect_with_retry(connector, &mut backoff).await?;
                }
                None => return Ok(()),
            }
        }
    }

    async fn connect_with_retry(
        &self,
        connector: &SseConnector,
        backoff: &mut Backoff,
    ) -> Result<SseEvents, Arc<SessionError>> {
        loop {
            if self.ct.is_cancelled() {
                return Err(Arc::new(SessionError::Cancelled));
            }
            match connector.connect().await {
                Ok(events) => {
                    backoff.reset();
                    return Ok(events);
                }
                Err(ConnectError::Fatal(error)) => return Err(Arc::new(error)),
                Err(ConnectError::Transient(error)) => {
                    let delay = backoff.delay();
                    warn!(slug = %self.slug, %error, ?delay, "transient SSE failure, retrying");
                    tokio::select! {
                        _ = self.ct.cancelled() => return Err(Arc::new(SessionError::Cancelled)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: sse_stream::Sse) -> Result<(), Arc<SessionError>> {
        match event.event.as_deref().unwrap_or("message") {
            "endpoint" => self.on_endpoint(event.data)?,
            "message" => self.on_message(event.data),
            "ping" => {}
            name => warn!(slug = %self.slug, event = name, "ignoring unknown SSE event"),
        }
        Ok(())
    }

    fn on_endpoint(self: &Arc<Self>, data: Option<String>) -> Result<(), Arc<SessionError>> {
        let Some(data) = data else {
            return Err(Arc::new(SessionError::EndpointWithoutData));
        };
        let endpoint = self
            .base_url
            .join(data.trim())
            .map_err(|error| Arc::new(SessionError::Endpoint(error)))?;
        {
            let mut state = self.state_mut();
            if state.endpoint.is_some() {
                warn!(slug = %self.slug, "ignoring subsequent endpoint event");
                return Ok(());
            }
            state.endpoint = Some(endpoint);
        }
        let session = self.clone();
        tokio::spawn(async move { session.handshake().await });
        Ok(())
    }

    async fn handshake(self: Arc<Self>) {
        match self.do_handshake().await {
            Ok(()) => {
                debug!(slug = %self.slug, "upstream session connected");
                self.init.set(Ok(()));
            }
            Err(error) => {
                let error = Arc::new(error);
                warn!(slug = %self.slug, %error, "upstream handshake failed");
                self.init.set(Err(error));
                self.close();
            }
        }
    }

    async fn do_handshake(&self) -> Result<(), SessionError> {
        let params = InitializeRequestParam {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::from_crate(),
        };
        let result: InitializeResult = self
            .request(ClientRequest::Initialize(params), None)
            .await
            .map_err(SessionError::Initialize)?;

        if !result.protocol_version.is_supported() {
            return Err(SessionError::UnsupportedProtocolVersion(
                result.protocol_version,
            ));
        }
        {
            let mut state = self.state_mut();
            if state.status == SessionStatus::Closed {
                return Err(SessionError::Closed);
            }
            state.protocol_version = Some(result.protocol_version);
            state.server_info = Some(result.server_info);
            state.status = SessionStatus::Connected;
        }
        self.notify(ClientNotification::Initialized)
            .await
            .map_err(SessionError::Initialize)?;
        Ok(())
    }

    fn on_message(self: &Arc<Self>, data: Option<String>) {
        let Some(data) = data else {
            return;
        };
        match serde_json::from_str::<JsonRpcMessage>(&data) {
            Ok(JsonRpcMessage::Response(response)) => {
                self.correlator.deliver(&response.id, Ok(response.result));
            }
            Ok(JsonRpcMessage::Error(error)) => {
                self.correlator
                    .deliver(&error.id, Err(ServiceError::ErrorResponse(error.error)));
            }
            Ok(JsonRpcMessage::Notification(notification)) => self.on_notification(notification),
            Ok(JsonRpcMessage::Request(request)) => self.on_server_request(request),
            Err(error) => {
                warn!(slug = %self.slug, %error, "failed to parse server message, skipping")
            }
        }
    }

    fn on_notification(&self, notification: JsonRpcNotification) {
        match ServerNotification::parse(&notification.method, notification.params.as_ref()) {
            Some(Ok(ServerNotification::ResourceUpdated(params))) => {
                let callbacks = self.callbacks_ref();
                for callback in &callbacks.resource_updated {
                    callback(&params.uri);
                }
            }
            Some(Ok(ServerNotification::ResourcesListChanged)) => {
                self.resources.invalidate();
                self.resource_templates.invalidate();
                self.fire_list_changed(ChangedList::Resources);
            }
            Some(Ok(ServerNotification::PromptsListChanged)) => {
                self.prompts.invalidate();
                self.fire_list_changed(ChangedList::Prompts);
            }
            Some(Ok(ServerNotification::ToolsListChanged)) => {
                // not announced downstream; refresh our own copy silently
                self.tools.invalidate();
                debug!(slug = %self.slug, "upstream tool list changed");
            }
            Some(Err(error)) => {
                warn!(slug = %self.slug, method = %notification.method, %error, "malformed notification")
            }
            None => {
                debug!(slug = %self.slug, method = %notification.method, "ignoring notification")
            }
        }
    }

    fn fire_list_changed(&self, kind: ChangedList) {
        let callbacks = self.callbacks_ref();
        for callback in &callbacks.list_changed {
            callback(kind);
        }
    }

    /// Servers may send requests of their own down the stream. The gateway
    /// exposes no client capabilities, so everything except `ping` is
    /// answered with a method-not-found error.
    fn on_server_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let session = self.clone();
        tokio::spawn(async move {
            let result = if request.method == "ping" {
                session
                    .post(&JsonRpcResponse::new(
                        request.id,
                        Value::Object(JsonObject::new()),
                    ))
                    .await
            } else {
                debug!(slug = %session.slug, method = %request.method, "rejecting server request");
                session
                    .post(&JsonRpcError::new(
                        request.id,
                        ErrorData::method_not_found(&request.method),
                    ))
                    .await
            };
            if let Err(error) = result {
                debug!(slug = %session.slug, %error, "failed to answer server request");
            }
        });
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timeouts.sweep_interval);
        loop {
            tokio::select! {
                _ = self.ct.cancelled() => return,
                _ = interval.tick() => self.correlator.sweep(Instant::now()),
            }
        }
    }

    // ---- lock helpers -----------------------------------------------------

    fn state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().expect("session state lock poisoned")
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().expect("session state lock poisoned")
    }

    fn callbacks_ref(&self) -> std::sync::RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().expect("callbacks lock poisoned")
    }

    fn callbacks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().expect("callbacks lock poisoned")
    }
}
