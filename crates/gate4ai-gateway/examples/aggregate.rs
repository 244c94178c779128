//! Lists the merged tool namespace of one or more upstream MCP servers.
//!
//! ```sh
//! cargo run --example aggregate -- http://localhost:4001/sse http://localhost:4002/sse
//! ```

use std::{net::SocketAddr, sync::Arc};

use gate4ai_gateway::{
    Gateway,
    config::MemoryConfig,
    downstream::{DownstreamSession, NotificationError},
    model::ListToolsResult,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

struct CliSession;

#[async_trait::async_trait]
impl DownstreamSession for CliSession {
    fn id(&self) -> &str {
        "cli"
    }

    fn user_id(&self) -> Option<String> {
        Some("cli-user".to_string())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn forwarded_for(&self) -> Option<String> {
        None
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), NotificationError> {
        println!("<- {method}: {params}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    anyhow::ensure!(!urls.is_empty(), "usage: aggregate <sse-url> [<sse-url>...]");

    let config = Arc::new(MemoryConfig::new());
    for (index, url) in urls.iter().enumerate() {
        let slug = format!("b{}", index + 1);
        config.add_backend(&slug, url)?;
        config.subscribe("cli-user", &slug);
    }

    let gateway = Gateway::new(config);
    // the gateway only holds a weak reference; keep the session alive here
    let session = Arc::new(CliSession);
    gateway.register_session(session.clone());

    let result = gateway
        .handle("cli", "tools/list", None, CancellationToken::new())
        .await?;
    let listed: ListToolsResult = serde_json::from_value(result)?;
    println!("{} tools:", listed.tools.len());
    for tool in &listed.tools {
        println!(
            "  {}  {}",
            tool.name,
            tool.description.as_deref().unwrap_or("")
        );
    }

    gateway.close_session("cli").await;
    Ok(())
}
