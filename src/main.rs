use anyhow::{bail, Context, Result};
use rabbit_rpc::config::{self, CONFIG_FILE_NAME};
use rabbit_rpc::rabbitmq::{ApiResponse, ConnectionManager, HandlerError, Router, RpcClient, RpcServer};
use serde_json::{json, Value};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  rabbit-rpc listen <QUEUE>
  rabbit-rpc send <QUEUE> <ROUTING_KEY> <JSON>
  rabbit-rpc init-config [PATH]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let result = match args.as_slice() {
        ["listen", queue] => listen(queue).await,
        ["send", queue, routing_key, body] => send(queue, routing_key, body).await,
        ["init-config"] => config::create_default_config_file(&PathBuf::from(CONFIG_FILE_NAME)),
        ["init-config", path] => config::create_default_config_file(&PathBuf::from(path)),
        _ => bail!("{USAGE}"),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn connect() -> Result<(config::RpcSettings, Arc<ConnectionManager>)> {
    let settings = config::load_config()?;
    let connection = ConnectionManager::open(&settings)
        .await
        .context("RabbitMQ is unavailable, refusing to start")?;
    Ok((settings, Arc::new(connection)))
}

/// Domains served by a queue: `user.*` -> `user`.
fn domains(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .filter_map(|pattern| pattern.split('.').next())
        .filter(|domain| !domain.is_empty() && *domain != "*" && *domain != "#")
        .map(str::to_string)
        .collect()
}

fn demo_router(queue: &str, domains: &[String], connection: &Arc<ConnectionManager>) -> Router {
    let mut router = Router::new();
    for domain in domains {
        let health_connection = connection.clone();
        let health_queue = queue.to_string();
        router = router
            .route(&format!("{domain}.health-check"), move |_body| {
                let healthy = health_connection.is_healthy();
                let queue = health_queue.clone();
                async move {
                    let status = if healthy { "Healthy" } else { "Unhealthy" };
                    let response = ApiResponse::success(json!({ "status": status, "queue": queue }), "Health check");
                    Ok::<_, HandlerError>(Some(serde_json::to_value(response)?))
                }
            })
            .route(&format!("{domain}.echo"), |body| async move {
                let payload: Value = serde_json::from_str(&body)?;
                let response = ApiResponse::success(payload, "Echo");
                Ok::<_, HandlerError>(Some(serde_json::to_value(response)?))
            });
    }
    router
}

async fn listen(queue: &str) -> Result<()> {
    let (settings, connection) = connect().await?;

    let patterns = settings.bindings.patterns_for(queue);
    let router = demo_router(queue, &domains(&patterns), &connection);
    info!(queue, "Answering routing keys: {}", router.routing_keys().join(", "));

    let listener = RpcServer::new(connection.clone())
        .with_bindings(settings.bindings.clone())
        .with_prefetch(settings.prefetch_count)
        .listen(queue, router)
        .await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    listener.stop().await?;
    connection.close().await?;
    Ok(())
}

async fn send(queue: &str, routing_key: &str, body: &str) -> Result<()> {
    let message: Value = serde_json::from_str(body).context("Request body must be valid JSON")?;
    let (settings, connection) = connect().await?;

    let client = RpcClient::new(connection.clone()).with_timeout(settings.reply_timeout());
    let reply = client.call::<_, Value>(queue, routing_key, &message).await;
    connection.close().await?;

    let reply = reply.with_context(|| format!("No usable reply for {routing_key}"))?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
