// Tests against a live RabbitMQ broker.
// Run with: cargo test --test amqp_integration -- --ignored

use rabbit_rpc::config::{load_config_from, RpcSettings};
use rabbit_rpc::rabbitmq::{ApiResponse, ConnectionManager, HandlerError, RpcClient, RpcServer};
use serde_json::{json, Value};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "RPC_INTEGRATION_QUEUE";

fn load_test_config() -> RpcSettings {
    let mut settings = load_config_from(Path::new("tests/fixtures/rabbit-rpc.json"))
        .expect("Failed to read test config file");
    rabbit_rpc::env::apply_overrides(&mut settings).expect("Invalid RabbitMQ environment");
    settings
}

async fn open(settings: &RpcSettings) -> Arc<ConnectionManager> {
    Arc::new(
        ConnectionManager::open(settings)
            .await
            .expect("RabbitMQ must be running for integration tests"),
    )
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_round_trip_over_rabbitmq() {
    let settings = load_test_config();
    let connection = open(&settings).await;

    let listener = RpcServer::new(connection.clone())
        .with_bindings(settings.bindings.clone())
        .listen(QUEUE, |body: String, routing_key: String| async move {
            let payload: Value = serde_json::from_str(&body)?;
            let response = ApiResponse::success(json!({ "echo": payload, "key": routing_key }), "ok");
            Ok::<_, HandlerError>(Some(serde_json::to_value(response)?))
        })
        .await
        .unwrap();
    assert_eq!(listener.patterns(), ["integration.*".to_string()]);

    let client = RpcClient::new(connection.clone()).with_timeout(settings.reply_timeout());
    let response: ApiResponse<Value> = client
        .call(QUEUE, "integration.echo", &json!({ "n": 42 }))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.data, Some(json!({ "echo": { "n": 42 }, "key": "integration.echo" })));

    listener.stop().await.unwrap();
    connection.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires a local RabbitMQ with rabbitmqctl on PATH
async fn test_listener_survives_connection_drop() {
    let settings = load_test_config();
    let connection = open(&settings).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let listener = RpcServer::new(connection.clone())
        .with_bindings(settings.bindings.clone())
        .listen(QUEUE, move |_body: String, _key: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(Some(json!("pong")))
            }
        })
        .await
        .unwrap();

    let client = RpcClient::new(connection.clone()).with_timeout(settings.reply_timeout());
    let before: String = client.call(QUEUE, "integration.ping", &json!({})).await.unwrap();
    assert_eq!(before, "pong");

    let status = Command::new("rabbitmqctl")
        .args(["close_all_connections", "integration test"])
        .status()
        .expect("rabbitmqctl must be available");
    assert!(status.success());

    let mut recovered = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if connection.is_healthy() {
            recovered = true;
            break;
        }
    }
    assert!(recovered, "transport did not recover within 30s");

    let after: String = client.call(QUEUE, "integration.ping", &json!({})).await.unwrap();
    assert_eq!(after, "pong");
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    listener.stop().await.unwrap();
    connection.close().await.unwrap();
}
