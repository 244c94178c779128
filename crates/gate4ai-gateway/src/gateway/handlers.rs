//! List, get, call, read and completion handlers.
//!
//! List handlers aggregate over the pool and cache the wrapped result per
//! kind; single-item handlers resolve the requested key through that cache
//! and forward the backend's ORIGINAL name or URI, never the rewritten one.
//! Upstream responses come back verbatim, `isError` flags included.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{Wrapped, fan_out},
    config::Slug,
    downstream::SessionState,
    model::{
        CallToolRequestParam, CallToolResult, CompleteRequestParam, CompleteResult, ErrorData,
        GetPromptRequestParam, GetPromptResult, ListPromptsResult, ListResourcesResult,
        ListToolsResult, Prompt, PromptReference, ReadResourceRequestParam, ReadResourceResult,
        Reference, Resource, ResourceReference, Tool,
    },
    pool::PoolError,
    upstream::UpstreamSession,
};

use super::Gateway;

impl Gateway {
    pub(crate) async fn list_tools(
        &self,
        state: &Arc<SessionState>,
    ) -> Result<ListToolsResult, ErrorData> {
        let wrapped = self.wrapped_tools(state).await?;
        Ok(ListToolsResult {
            tools: wrapped.iter().map(|w| w.item.clone()).collect(),
            next_cursor: None,
        })
    }

    pub(crate) async fn list_prompts(
        &self,
        state: &Arc<SessionState>,
    ) -> Result<ListPromptsResult, ErrorData> {
        let wrapped = self.wrapped_prompts(state).await?;
        Ok(ListPromptsResult {
            prompts: wrapped.iter().map(|w| w.item.clone()).collect(),
            next_cursor: None,
        })
    }

    pub(crate) async fn list_resources(
        &self,
        state: &Arc<SessionState>,
    ) -> Result<ListResourcesResult, ErrorData> {
        let wrapped = self.wrapped_resources(state).await?;
        Ok(ListResourcesResult {
            resources: wrapped.iter().map(|w| w.item.clone()).collect(),
            next_cursor: None,
        })
    }

    pub(crate) async fn call_tool(
        &self,
        state: &Arc<SessionState>,
        params: CallToolRequestParam,
        ct: &CancellationToken,
    ) -> Result<CallToolResult, ErrorData> {
        let wrapped = self.wrapped_tools(state).await?;
        let entry = wrapped
            .iter()
            .find(|w| w.item.name == params.name)
            .ok_or_else(|| {
                ErrorData::resource_not_found(format!("tool not found: '{}'", params.name))
            })?;
        let session = self.backend_session(state, &entry.slug).await?;
        session
            .call_tool(
                CallToolRequestParam {
                    name: entry.original_key.clone().into(),
                    arguments: params.arguments,
                },
                ct,
            )
            .await
            .map_err(|error| {
                ErrorData::internal_error(format!(
                    "backend error calling tool '{}': {error}",
                    params.name
                ))
            })
    }

    pub(crate) async fn get_prompt(
        &self,
        state: &Arc<SessionState>,
        params: GetPromptRequestParam,
        ct: &CancellationToken,
    ) -> Result<GetPromptResult, ErrorData> {
        let wrapped = self.wrapped_prompts(state).await?;
        let entry = wrapped
            .iter()
            .find(|w| w.item.name == params.name)
            .ok_or_else(|| {
                ErrorData::resource_not_found(format!("prompt not found: '{}'", params.name))
            })?;
        let session = self.backend_session(state, &entry.slug).await?;
        session
            .get_prompt(
                GetPromptRequestParam {
                    name: entry.original_key.clone(),
                    arguments: params.arguments,
                },
                ct,
            )
            .await
            .map_err(|error| {
                ErrorData::internal_error(format!(
                    "backend error getting prompt '{}': {error}",
                    params.name
                ))
            })
    }

    pub(crate) async fn read_resource(
        &self,
        state: &Arc<SessionState>,
        params: ReadResourceRequestParam,
        ct: &CancellationToken,
    ) -> Result<ReadResourceResult, ErrorData> {
        let wrapped = self.wrapped_resources(state).await?;
        let entry = wrapped
            .iter()
            .find(|w| w.item.uri == params.uri)
            .ok_or_else(|| {
                ErrorData::resource_not_found(format!("resource not found: '{}'", params.uri))
            })?;
        let session = self.backend_session(state, &entry.slug).await?;
        session
            .read_resource(entry.original_key.clone(), ct)
            .await
            .map_err(|error| {
                ErrorData::internal_error(format!(
                    "backend error reading resource '{}': {error}",
                    params.uri
                ))
            })
    }

    pub(crate) async fn complete(
        &self,
        state: &Arc<SessionState>,
        params: CompleteRequestParam,
        ct: &CancellationToken,
    ) -> Result<CompleteResult, ErrorData> {
        let argument = params.argument;
        match params.reference {
            Reference::Prompt(PromptReference { name }) => {
                let wrapped = self.wrapped_prompts(state).await?;
                let entry = wrapped.iter().find(|w| w.item.name == name).ok_or_else(|| {
                    ErrorData::resource_not_found(format!("prompt not found: '{name}'"))
                })?;
                let session = self.backend_session(state, &entry.slug).await?;
                session
                    .complete(
                        CompleteRequestParam {
                            reference: Reference::Prompt(PromptReference {
                                name: entry.original_key.clone(),
                            }),
                            argument,
                        },
                        ct,
                    )
                    .await
                    .map_err(|error| {
                        ErrorData::internal_error(format!(
                            "backend error completing prompt '{name}': {error}"
                        ))
                    })
            }
            Reference::Resource(ResourceReference { uri }) => {
                let (slug, original) = self.resolve_resource_reference(state, &uri).await?;
                let session = self.backend_session(state, &slug).await?;
                session
                    .complete(
                        CompleteRequestParam {
                            reference: Reference::Resource(ResourceReference { uri: original }),
                            argument,
                        },
                        ct,
                    )
                    .await
                    .map_err(|error| {
                        ErrorData::internal_error(format!(
                            "backend error completing resource '{uri}': {error}"
                        ))
                    })
            }
        }
    }

    /// A completion reference may name a concrete resource or a resource
    /// template; templates come from the sessions' own caches, so the extra
    /// fan-out is cheap after the first call.
    async fn resolve_resource_reference(
        &self,
        state: &Arc<SessionState>,
        uri: &str,
    ) -> Result<(Slug, String), ErrorData> {
        let wrapped = self.wrapped_resources(state).await?;
        if let Some(entry) = wrapped.iter().find(|w| w.item.uri == uri) {
            return Ok((entry.slug.clone(), entry.original_key.clone()));
        }
        let sessions = self.pool_sessions(state).await?;
        let templates = fan_out(&sessions, &self.shared.timeouts, |session| async move {
            session.resource_templates().await
        })
        .await;
        templates
            .iter()
            .find(|w| w.item.uri_template == uri)
            .map(|w| (w.slug.clone(), w.original_key.clone()))
            .ok_or_else(|| ErrorData::resource_not_found(format!("resource not found: '{uri}'")))
    }

    // ---- wrapped-list caches ---------------------------------------------

    pub(crate) async fn wrapped_tools(
        &self,
        state: &Arc<SessionState>,
    ) -> Result<Arc<Vec<Wrapped<Tool>>>, ErrorData> {
        if let Some(cached) = state.tools.get() {
            return Ok(cached);
        }
        let sessions = self.pool_sessions(state).await?;
        let wrapped = Arc::new(
            fan_out(&sessions, &self.shared.timeouts, |session| async move {
                session.tools().await
            })
            .await,
        );
        state.tools.set(wrapped.clone());
        Ok(wrapped)
    }

    pub(crate) async fn wrapped_prompts(
        &self,
        state: &Arc<SessionState>,
    ) -> Result<Arc<Vec<Wrapped<Prompt>>>, ErrorData> {
        if let Some(cached) = state.prompts.get() {
            return Ok(cached);
        }
        let sessions = self.pool_sessions(state).await?;
        let wrapped = Arc::new(
            fan_out(&sessions, &self.shared.timeouts, |session| async move {
                session.prompts().await
            })
            .await,
        );
        state.prompts.set(wrapped.clone());
        Ok(wrapped)
    }

    pub(crate) async fn wrapped_resources(
        &self,
        state: &Arc<SessionState>,
    ) -> Result<Arc<Vec<Wrapped<Resource>>>, ErrorData> {
        if let Some(cached) = state.resources.get() {
            return Ok(cached);
        }
        let sessions = self.pool_sessions(state).await?;
        let wrapped = Arc::new(
            fan_out(&sessions, &self.shared.timeouts, |session| async move {
                session.resources().await
            })
            .await,
        );
        state.resources.set(wrapped.clone());
        Ok(wrapped)
    }

    // ---- shared plumbing --------------------------------------------------

    pub(crate) async fn pool_sessions(
        &self,
        state: &Arc<SessionState>,
    ) -> Result<Vec<Arc<UpstreamSession>>, ErrorData> {
        state.pool.sessions().await.map_err(|error| match error {
            PoolError::SessionGone => ErrorData::invalid_request("downstream session is gone"),
            PoolError::Subscriptions(error) => {
                ErrorData::internal_error(format!("failed to load subscriptions: {error}"))
            }
        })
    }

    pub(crate) async fn backend_session(
        &self,
        state: &Arc<SessionState>,
        slug: &Slug,
    ) -> Result<Arc<UpstreamSession>, ErrorData> {
        match state.pool.by_slug(slug).await {
            Ok(Some(session)) => Ok(session),
            _ => Err(ErrorData::internal_error(format!(
                "failed to get backend session for '{slug}'"
            ))),
        }
    }
}
