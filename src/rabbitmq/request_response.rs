// src/rabbitmq/request_response.rs
// Request client and response listener over the shared topic exchange.

use futures::future::{self, FutureExt};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec;
use super::connection::ConnectionManager;
use super::dispatch::{ApiResponse, HandlerError, MessageHandler};
use super::envelope::{Delivery, Envelope};
use super::errors::{Result, RpcError};
use super::topology::BindingTable;
use super::transport::{ConsumeMode, DeliveryStream, Transport, DEFAULT_EXCHANGE};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Caller side: publish a request and wait for its correlated reply.
///
/// Every call owns a private reply queue and consumer, so concurrent calls
/// share nothing but the connection.
#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<ConnectionManager>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `message` to `queue` under `routing_key` and decode the reply.
    pub async fn call<T, R>(&self, queue: &str, routing_key: &str, message: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_until(queue, routing_key, message, future::pending::<()>())
            .await
    }

    /// Like [`call`](Self::call), but gives up with [`RpcError::Cancelled`]
    /// as soon as `cancel` completes.
    pub async fn call_until<T, R, C>(
        &self,
        queue: &str,
        routing_key: &str,
        message: &T,
        cancel: C,
    ) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
        C: Future<Output = ()>,
    {
        let transport = self.connection.transport()?;
        let body = codec::encode(message)?;

        // The callee normally owns this queue; declaring it here keeps a
        // request from being published into nothing.
        transport.declare_queue(queue).await?;
        let reply_queue = transport.declare_reply_queue().await?;
        let mut reply_guard = ReplyQueue::new(transport.clone(), reply_queue.clone());

        let correlation_id = Uuid::new_v4().to_string();
        let consumer_tag = format!("rpc-reply-{correlation_id}");

        // Consumer first, then publish: the reply cannot beat us to the queue.
        let replies = match transport
            .consume(&reply_queue, &consumer_tag, ConsumeMode::AutoAck)
            .await
        {
            Ok(replies) => replies,
            Err(e) => {
                reply_guard.release().await;
                return Err(e);
            }
        };
        reply_guard.consuming(consumer_tag);

        let request = Envelope::request(routing_key, &correlation_id, &reply_queue, body);
        let timeout = self.timeout;

        let outcome = match transport.publish(self.connection.exchange(), &request).await {
            Ok(()) => {
                debug!(queue, routing_key, correlation_id = %correlation_id, "Published RPC request");
                tokio::select! {
                    reply = tokio::time::timeout(timeout, wait_for_reply(replies, &correlation_id)) => {
                        reply.unwrap_or(Err(RpcError::Timeout(timeout)))
                    }
                    _ = cancel => Err(RpcError::Cancelled),
                }
            }
            Err(e) => Err(e),
        };

        reply_guard.release().await;

        let reply = outcome?;
        codec::decode(&reply.body).map_err(|e| {
            RpcError::DeserializationError(format!(
                "reply to {routing_key} could not be decoded: {e}"
            ))
        })
    }

    /// Compatibility form of [`call`](Self::call): every failure is logged
    /// and surfaces as `None`.
    pub async fn send<T, R>(&self, queue: &str, routing_key: &str, message: &T) -> Option<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        match self.call(queue, routing_key, message).await {
            Ok(reply) => Some(reply),
            Err(RpcError::Timeout(after)) => {
                warn!(queue, routing_key, "No reply within {:?}", after);
                None
            }
            Err(e) => {
                error!(queue, routing_key, error = %e, "RPC call failed");
                None
            }
        }
    }
}

async fn wait_for_reply(mut replies: DeliveryStream, correlation_id: &str) -> Result<Envelope> {
    while let Some(delivery) = replies.next().await {
        let envelope = delivery?.envelope;
        if envelope.correlation_id.as_deref() == Some(correlation_id) {
            return Ok(envelope);
        }
        warn!(
            expected = correlation_id,
            received = ?envelope.correlation_id,
            "Discarding reply with mismatched correlation id"
        );
    }
    Err(RpcError::ReplyStreamClosed)
}

/// Releases a call's reply queue exactly once, on whichever path ends the
/// call. Once a consumer is registered, cancelling it lets the broker
/// auto-delete the queue; before that the queue is deleted outright.
/// Dropping the guard mid-call hands the release to the runtime.
struct ReplyQueue {
    transport: Arc<dyn Transport>,
    queue: String,
    consumer_tag: Option<String>,
    released: bool,
}

impl ReplyQueue {
    fn new(transport: Arc<dyn Transport>, queue: String) -> Self {
        Self {
            transport,
            queue,
            consumer_tag: None,
            released: false,
        }
    }

    fn consuming(&mut self, consumer_tag: String) {
        self.consumer_tag = Some(consumer_tag);
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_reply_queue(self.transport.as_ref(), &self.queue, self.consumer_tag.as_deref()).await;
    }
}

async fn release_reply_queue(transport: &dyn Transport, queue: &str, consumer_tag: Option<&str>) {
    let released = match consumer_tag {
        Some(consumer_tag) => transport.cancel(consumer_tag).await,
        None => transport.delete_queue(queue).await,
    };
    if let Err(e) = released {
        debug!(queue, consumer_tag = ?consumer_tag, error = %e, "Reply queue release failed");
    }
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let transport = self.transport.clone();
        let queue = std::mem::take(&mut self.queue);
        let consumer_tag = self.consumer_tag.take();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_reply_queue(transport.as_ref(), &queue, consumer_tag.as_deref()).await;
                });
            }
            Err(_) => warn!(queue = %queue, "No runtime left to release reply queue"),
        }
    }
}

/// Callee side: binds service queues and runs listeners on them.
pub struct RpcServer {
    connection: Arc<ConnectionManager>,
    bindings: BindingTable,
    prefetch_count: u16,
}

impl RpcServer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            bindings: BindingTable::default(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }

    pub fn with_bindings(mut self, bindings: BindingTable) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Declare `queue` durable and bind every pattern it is configured for.
    pub async fn bind(&self, queue: &str) -> Result<Vec<String>> {
        let transport = self.connection.transport()?;
        transport.declare_queue(queue).await?;

        let patterns = self.bindings.patterns_for(queue);
        for pattern in &patterns {
            transport
                .bind_queue(queue, self.connection.exchange(), pattern)
                .await?;
        }

        info!(
            queue,
            explicit = self.bindings.is_explicit(queue),
            "Queue bound with patterns: {}",
            patterns.join(", ")
        );
        Ok(patterns)
    }

    /// Bind `queue`, then process its messages one at a time with `handler`.
    pub async fn listen<H: MessageHandler>(&self, queue: &str, handler: H) -> Result<Listener> {
        let transport = self.connection.transport()?;
        let patterns = self.bind(queue).await?;
        transport.set_prefetch(self.prefetch_count).await?;

        let consumer_tag = format!("rpc-server-{}", Uuid::new_v4().simple());
        let deliveries = transport
            .consume(queue, &consumer_tag, ConsumeMode::Manual)
            .await?;

        info!(queue, consumer_tag = %consumer_tag, "RPC listener started");
        let task = tokio::spawn(serve(
            transport.clone(),
            queue.to_string(),
            deliveries,
            handler,
        ));

        Ok(Listener {
            queue: queue.to_string(),
            consumer_tag,
            patterns,
            transport,
            task,
        })
    }
}

/// A running consumer started by [`RpcServer::listen`].
pub struct Listener {
    queue: String,
    consumer_tag: String,
    patterns: Vec<String>,
    transport: Arc<dyn Transport>,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the consumer and wait for the message in hand to finish.
    pub async fn stop(self) -> Result<()> {
        match self.transport.cancel(&self.consumer_tag).await {
            Ok(()) => {
                if let Err(e) = self.task.await {
                    error!(queue = %self.queue, error = %e, "Listener task ended abnormally");
                }
                info!(queue = %self.queue, "RPC listener stopped");
                Ok(())
            }
            Err(e) => {
                self.task.abort();
                Err(e)
            }
        }
    }
}

async fn serve<H: MessageHandler>(
    transport: Arc<dyn Transport>,
    queue: String,
    mut deliveries: DeliveryStream,
    handler: H,
) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => process_delivery(transport.as_ref(), &handler, delivery).await,
            Err(e) => error!(queue = %queue, error = %e, "Error receiving request"),
        }
    }
    debug!(queue = %queue, "Delivery stream ended");
}

async fn process_delivery<H: MessageHandler>(
    transport: &dyn Transport,
    handler: &H,
    delivery: Delivery,
) {
    let envelope = &delivery.envelope;
    let routing_key = envelope.routing_key.as_str();
    let body = envelope.body_text();
    debug!(routing_key, correlation_id = ?envelope.correlation_id, "Processing request");

    let outcome = match AssertUnwindSafe(handler.handle(&body, routing_key))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(HandlerError::new(panic_message(&*panic))),
    };

    let reply = match outcome {
        Ok(value) => value.map(|value| codec::encode(&value)),
        Err(e) => {
            error!(routing_key, error = %e, "Error processing message");
            Some(codec::encode(&ApiResponse::handler_failure(&e)))
        }
    };

    match (envelope.reply_address(), reply) {
        (Some(reply_to), Some(Ok(body))) => {
            let reply = Envelope::reply(reply_to, envelope.correlation_id.clone(), body);
            if let Err(e) = transport.publish(DEFAULT_EXCHANGE, &reply).await {
                error!(routing_key, reply_to, error = %e, "Failed to publish reply");
            }
        }
        (_, Some(Err(e))) => error!(routing_key, error = %e, "Failed to serialize reply"),
        (None, Some(Ok(_))) => debug!(routing_key, "Request carries no reply address, dropping result"),
        (_, None) => {}
    }

    // Ack regardless of outcome; only a crash before this point redelivers.
    if let Err(e) = delivery.ack().await {
        error!(routing_key, error = %e, "Failed to acknowledge message");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::connection::RetryPolicy;
    use crate::rabbitmq::dispatch::HandlerResult;
    use crate::rabbitmq::memory::MemoryBroker;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const EXCHANGE: &str = "microservices_exchange";

    async fn connected(broker: &MemoryBroker) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(broker.clone(), EXCHANGE, RetryPolicy::default());
        manager.connect().await.unwrap();
        Arc::new(manager)
    }

    fn reply_queues(broker: &MemoryBroker) -> Vec<String> {
        broker
            .queue_names()
            .into_iter()
            .filter(|name| name.starts_with("amq.gen-"))
            .collect()
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sum {
        total: i64,
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let server = RpcServer::new(connection.clone());
        let listener = server
            .listen("math", |body: String, _key: String| async move {
                let numbers: Vec<i64> = serde_json::from_str(&body)?;
                Ok::<_, HandlerError>(Some(json!({ "Total": numbers.iter().sum::<i64>() })))
            })
            .await
            .unwrap();
        assert_eq!(listener.patterns(), ["math.*".to_string()]);

        let client = RpcClient::new(connection);
        let sum: Sum = client.call("math", "math.add", &[1, 2, 3]).await.unwrap();
        assert_eq!(sum, Sum { total: 6 });
        assert!(reply_queues(&broker).is_empty());
        assert_eq!(broker.queue_stats("math").unwrap().unacked, 0);

        listener.stop().await.unwrap();
        assert_eq!(broker.queue_stats("math").unwrap().consumers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_listener_cleans_up() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(connected(&broker).await).with_timeout(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let err = client
            .call::<_, Value>("nobody", "nobody.ping", &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Timeout(after) if after == Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(reply_queues(&broker).is_empty());
        assert_eq!(broker.published_count(), 1);
        assert!(broker.queue_names().contains(&"nobody".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_maps_failures_to_none() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let _listener = RpcServer::new(connection.clone())
            .listen("text", |_body: String, _key: String| async move {
                Ok::<_, HandlerError>(Some(json!("not a number")))
            })
            .await
            .unwrap();

        let client = RpcClient::new(connection).with_timeout(Duration::from_secs(1));
        let parsed: Option<i64> = client.send("text", "text.get", &json!({})).await;
        assert_eq!(parsed, None);

        let err = client
            .call::<_, i64>("text", "text.get", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::DeserializationError(_)));

        let silent: Option<Value> = client.send("absent", "absent.get", &json!({})).await;
        assert_eq!(silent, None);
    }

    #[tokio::test]
    async fn test_mismatched_correlation_is_discarded() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let transport = connection.transport().unwrap();
        transport.declare_queue("manual").await.unwrap();
        transport
            .bind_queue("manual", EXCHANGE, "manual.*")
            .await
            .unwrap();
        let mut requests = transport
            .consume("manual", "responder", ConsumeMode::Manual)
            .await
            .unwrap();

        let responder = tokio::spawn({
            let transport = transport.clone();
            async move {
                let delivery = requests.next().await.unwrap().unwrap();
                let reply_to = delivery.envelope.reply_address().unwrap().to_string();
                let stale = Envelope::reply(&reply_to, Some("stale".into()), b"1".to_vec());
                let fresh = Envelope::reply(
                    &reply_to,
                    delivery.envelope.correlation_id.clone(),
                    b"2".to_vec(),
                );
                transport.publish(DEFAULT_EXCHANGE, &stale).await.unwrap();
                transport.publish(DEFAULT_EXCHANGE, &fresh).await.unwrap();
                delivery.ack().await.unwrap();
            }
        });

        let client = RpcClient::new(connection);
        let value: i64 = client.call("manual", "manual.get", &json!({})).await.unwrap();
        assert_eq!(value, 2);
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_until_cancelled() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(connected(&broker).await);

        let err = client
            .call_until::<_, Value, _>(
                "slow",
                "slow.get",
                &json!({}),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Cancelled));
        assert!(reply_queues(&broker).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_still_cleans_up() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(connected(&broker).await);

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Value>("slow", "slow.get", &json!({})).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reply_queues(&broker).len(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(reply_queues(&broker).is_empty());
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_become_failure_envelopes() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;

        struct Flaky;

        #[async_trait::async_trait]
        impl MessageHandler for Flaky {
            async fn handle(&self, _body: &str, routing_key: &str) -> HandlerResult {
                match routing_key {
                    "flaky.fail" => Err(HandlerError::new("Course not found")),
                    "flaky.panic" => panic!("index out of range"),
                    _ => Ok(Some(json!({ "success": true, "message": "ok" }))),
                }
            }
        }

        let listener = RpcServer::new(connection.clone())
            .listen("flaky", Flaky)
            .await
            .unwrap();
        let client = RpcClient::new(connection);

        let failed: ApiResponse<Value> = client.call("flaky", "flaky.fail", &json!({})).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.message, "Error processing message");
        assert_eq!(failed.errors, vec!["Course not found".to_string()]);

        let panicked: ApiResponse<Value> =
            client.call("flaky", "flaky.panic", &json!({})).await.unwrap();
        assert!(!panicked.success);
        assert!(panicked.errors[0].contains("index out of range"));

        let ok: ApiResponse<Value> = client.call("flaky", "flaky.ok", &json!({})).await.unwrap();
        assert!(ok.success);
        assert!(listener.is_running());
        assert_eq!(broker.queue_stats("flaky").unwrap().unacked, 0);
    }

    fn counting_handler(
        counter: Arc<AtomicUsize>,
        reply: Option<Value>,
    ) -> impl Fn(String, String) -> future::Ready<HandlerResult> + Send + Sync + 'static {
        move |_body: String, _key: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(reply.clone()))
        }
    }

    #[tokio::test]
    async fn test_request_without_reply_to_is_processed_and_acked() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let handled = Arc::new(AtomicUsize::new(0));
        let _listener = RpcServer::new(connection.clone())
            .listen("audit", counting_handler(handled.clone(), Some(json!("recorded"))))
            .await
            .unwrap();

        let one_way = Envelope {
            routing_key: "audit.record".into(),
            correlation_id: None,
            reply_to: None,
            persistent: true,
            body: br#"{"event":"login"}"#.to_vec(),
        };
        connection
            .transport()
            .unwrap()
            .publish(EXCHANGE, &one_way)
            .await
            .unwrap();

        for _ in 0..100 {
            if handled.load(Ordering::SeqCst) == 1
                && broker.queue_stats("audit").unwrap().unacked == 0
            {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(broker.published_count(), 1);
        assert_eq!(broker.queue_stats("audit").unwrap().unacked, 0);
        assert_eq!(broker.queue_stats("audit").unwrap().ready, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_without_result_sends_no_reply() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let handled = Arc::new(AtomicUsize::new(0));
        let _listener = RpcServer::new(connection.clone())
            .listen("notify", counting_handler(handled.clone(), None))
            .await
            .unwrap();

        let client = RpcClient::new(connection).with_timeout(Duration::from_secs(2));
        let err = client
            .call::<_, Value>("notify", "notify.send", &json!({ "to": "ada" }))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(broker.published_count(), 1);
        assert_eq!(broker.queue_stats("notify").unwrap().unacked, 0);
        assert!(reply_queues(&broker).is_empty());
    }

    #[tokio::test]
    async fn test_failed_reply_consumer_removes_reply_queue() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(connected(&broker).await);
        broker.set_refuse_consumers(true);

        let err = client
            .call::<_, Value>("locked", "locked.get", &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::ConsumeError(_)));
        assert!(reply_queues(&broker).is_empty());
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_uses_explicit_table() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let bindings = BindingTable::new().with_binding("TODO_SERVICE_QUEUE", ["todo.*", "tasks.#"]);
        let server = RpcServer::new(connection).with_bindings(bindings);

        let patterns = server.bind("TODO_SERVICE_QUEUE").await.unwrap();
        assert_eq!(patterns, vec!["todo.*", "tasks.#"]);
        server.bind("TODO_SERVICE_QUEUE").await.unwrap();
        assert_eq!(broker.bindings_for("TODO_SERVICE_QUEUE"), vec!["todo.*", "tasks.#"]);

        let courses = server.bind("COURSES_SERVICE_QUEUE").await.unwrap();
        assert_eq!(courses.len(), 11);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let manager = Arc::new(ConnectionManager::new(
            MemoryBroker::new(),
            EXCHANGE,
            RetryPolicy::default(),
        ));
        let client = RpcClient::new(manager.clone());
        let err = client
            .call::<_, Value>("q", "q.get", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NotConnected));
        assert!(RpcServer::new(manager).bind("q").await.is_err());
    }
}
