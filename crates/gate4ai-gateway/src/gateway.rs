//! The downstream-facing core: method dispatch, per-session state and the
//! server capability surface.

mod handlers;
pub(crate) mod subscriptions;

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::ConfigSource,
    downstream::{DownstreamSession, SessionId, SessionRegistry, SessionState},
    model::{
        CompletionsCapability, ErrorData, Implementation, PromptsCapability, ResourcesCapability,
        ServerCapabilities, ToolsCapability,
    },
    pool::SessionPool,
    timeouts::Timeouts,
};

pub(crate) struct GatewayShared {
    pub config: Arc<dyn ConfigSource>,
    pub http: reqwest::Client,
    pub timeouts: Timeouts,
    pub registry: SessionRegistry,
}

/// The aggregation engine. One per process; downstream sessions register on
/// connect, route their parsed MCP requests through [`Gateway::handle`] and
/// deregister on disconnect. Cloning shares the same engine.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<GatewayShared>,
}

impl Gateway {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self::with_timeouts(config, Timeouts::default())
    }

    pub fn with_timeouts(config: Arc<dyn ConfigSource>, timeouts: Timeouts) -> Self {
        Self {
            shared: Arc::new(GatewayShared {
                config,
                http: reqwest::Client::new(),
                timeouts,
                registry: SessionRegistry::new(),
            }),
        }
    }

    /// What the gateway announces when the downstream layer asks.
    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            prompts: Some(PromptsCapability {
                list_changed: Some(true),
            }),
            resources: Some(ResourcesCapability {
                subscribe: Some(true),
                list_changed: Some(true),
            }),
            completions: Some(CompletionsCapability::default()),
            ..Default::default()
        }
    }

    pub fn server_info(&self) -> Implementation {
        Implementation::from_crate()
    }

    /// Attach core state to a freshly connected downstream session. The core
    /// never keeps the session alive: everything it stores is weak.
    pub fn register_session(&self, session: Arc<dyn DownstreamSession>) {
        let id: SessionId = session.id().into();
        debug!(session = %id, "registering downstream session");
        let pool = SessionPool::new(Arc::downgrade(&session), self.shared.clone());
        let state = Arc::new(SessionState::new(
            Arc::downgrade(&session),
            pool,
            self.shared.timeouts.cache_ttl,
        ));
        self.shared.registry.insert(id, state);
    }

    /// Tear down a downstream session: its upstream sessions close and their
    /// pending requests fail.
    pub async fn close_session(&self, id: &str) {
        if let Some(state) = self.shared.registry.remove(id) {
            debug!(session = %id, "closing downstream session");
            state.pool.close_all().await;
        }
    }

    /// Dispatch one parsed downstream request. `ct` scopes this call only:
    /// cancelling it aborts the in-flight upstream work without touching the
    /// session or pool.
    pub async fn handle(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
        ct: CancellationToken,
    ) -> Result<Value, ErrorData> {
        let state = self.shared.registry.get(session_id).ok_or_else(|| {
            ErrorData::invalid_request(format!("unknown session: {session_id}"))
        })?;
        match method {
            "tools/list" => to_value(self.list_tools(&state).await?),
            "tools/call" => to_value(self.call_tool(&state, parse_params(params)?, &ct).await?),
            "prompts/list" => to_value(self.list_prompts(&state).await?),
            "prompts/get" => to_value(self.get_prompt(&state, parse_params(params)?, &ct).await?),
            "resources/list" => to_value(self.list_resources(&state).await?),
            "resources/read" => {
                to_value(self.read_resource(&state, parse_params(params)?, &ct).await?)
            }
            "resources/subscribe" => self.subscribe(&state, parse_params(params)?, &ct).await,
            "resources/unsubscribe" => self.unsubscribe(&state, parse_params(params)?, &ct).await,
            "completion/complete" => {
                to_value(self.complete(&state, parse_params(params)?, &ct).await?)
            }
            other => Err(ErrorData::method_not_found(other)),
        }
    }

}

fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, ErrorData> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|error| ErrorData::invalid_params(error.to_string()))
}

fn to_value<T: Serialize>(result: T) -> Result<Value, ErrorData> {
    serde_json::to_value(result)
        .map_err(|error| ErrorData::internal_error(format!("failed to encode result: {error}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{config::MemoryConfig, model::ErrorCode};

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(MemoryConfig::new()))
    }

    #[test]
    fn test_capability_announcement_shape() {
        let capabilities = serde_json::to_value(gateway().capabilities()).unwrap();
        assert_eq!(
            capabilities,
            json!({
                "tools": {},
                "prompts": {"listChanged": true},
                "resources": {"listChanged": true, "subscribe": true},
                "completions": {}
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_session_is_invalid_request() {
        let error = gateway()
            .handle("nope", "tools/list", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::INVALID_REQUEST);
    }

    #[test]
    fn test_server_info_names_the_gateway() {
        let info = gateway().server_info();
        assert_eq!(info.name, "gate4ai-gateway");
        assert!(!info.version.is_empty());
    }
}
