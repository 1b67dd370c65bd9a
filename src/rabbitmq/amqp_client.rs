// src/rabbitmq/amqp_client.rs
// lapin-backed transport: one connection and one channel per process,
// reopened in place when the broker drops them.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::*;
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::envelope::{Acknowledger, Delivery, Envelope, JSON_CONTENT_TYPE};
use super::errors::{Result, RpcError};
use super::transport::{ConsumeMode, Connector, DeliveryStream, Transport};
use crate::config::RpcSettings;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY: u8 = 2;

pub fn connection_properties(connection_name: &str) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(connection_name.into())
}

pub fn amqp_uri(settings: &RpcSettings) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = settings.host.clone();
    uri.authority.port = settings.port;
    uri.authority.userinfo.username = settings.username.clone();
    uri.authority.userinfo.password = settings.password.clone();
    uri.vhost = settings.vhost.clone();
    uri.query.heartbeat = Some(settings.heartbeat_secs);
    uri
}

/// Opens [`AmqpTransport`]s from settings.
pub struct AmqpConnector {
    settings: RpcSettings,
}

impl AmqpConnector {
    pub fn new(settings: RpcSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, exchange: &str) -> Result<Arc<dyn Transport>> {
        let runtime = Handle::try_current()
            .map_err(|e| RpcError::ConnectionError(format!("no tokio runtime: {e}")))?;
        let session = Session::open(&self.settings, exchange).await?;

        let transport = Arc::new(AmqpTransport {
            settings: self.settings.clone(),
            exchange: exchange.to_string(),
            runtime,
            session: RwLock::new(Arc::new(session)),
            consumers: Mutex::new(HashMap::new()),
            reply_queues: Mutex::new(HashSet::new()),
            prefetch: Mutex::new(None),
            recovering: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        transport.watch(&transport.session());
        Ok(transport)
    }
}

/// One live connection with its channel.
struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    /// Connection, channel and exchange; whatever was opened is closed again
    /// if a later step fails.
    async fn open(settings: &RpcSettings, exchange: &str) -> Result<Self> {
        info!(
            host = %settings.host,
            port = settings.port,
            vhost = %settings.vhost,
            "Attempting to connect to RabbitMQ"
        );

        let connection = Connection::connect_uri(
            amqp_uri(settings),
            connection_properties(&settings.connection_name),
        )
        .await
        .map_err(|e| RpcError::ConnectionError(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(&connection, None).await;
                return Err(RpcError::ChannelError(format!("Failed to create channel: {e}")));
            }
        };

        if let Err(e) = declare_exchange(&channel, exchange).await {
            close_quietly(&connection, Some(&channel)).await;
            return Err(e);
        }

        Ok(Self {
            connection,
            channel,
        })
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

async fn close_quietly(connection: &Connection, channel: Option<&Channel>) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close(REPLY_SUCCESS, "Connection attempt failed").await {
            debug!("Ignoring channel close error after failed attempt: {}", e);
        }
    }
    if let Err(e) = connection.close(REPLY_SUCCESS, "Connection attempt failed").await {
        debug!("Ignoring connection close error after failed attempt: {}", e);
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| RpcError::TopologyError(format!("Failed to declare exchange: {e}")))
}

async fn declare_durable_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
        .map_err(|e| RpcError::TopologyError(format!("Failed to declare queue: {e}")))
}

async fn basic_consume(
    channel: &Channel,
    queue: &str,
    consumer_tag: &str,
    mode: ConsumeMode,
) -> Result<Consumer> {
    channel
        .basic_consume(
            queue,
            consumer_tag,
            BasicConsumeOptions {
                no_ack: mode == ConsumeMode::AutoAck,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| RpcError::ConsumeError(format!("Failed to create consumer: {e}")))
}

async fn basic_qos(channel: &Channel, prefetch_count: u16) -> Result<()> {
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| RpcError::ChannelError(format!("Failed to set QoS: {e}")))
}

/// A consumer handed out by [`AmqpTransport::consume`]. The sender outlives
/// the lapin consumer feeding it, so a recovered consumer keeps writing into
/// the stream the caller already holds.
struct ConsumerRegistration {
    queue: String,
    mode: ConsumeMode,
    /// Consumers on durable queues come back after a drop; reply queues die
    /// with their connection.
    recoverable: bool,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

pub struct AmqpTransport {
    settings: RpcSettings,
    exchange: String,
    runtime: Handle,
    session: RwLock<Arc<Session>>,
    consumers: Mutex<HashMap<String, ConsumerRegistration>>,
    reply_queues: Mutex<HashSet<String>>,
    prefetch: Mutex<Option<u16>>,
    recovering: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AmqpTransport {
    fn session(&self) -> Arc<Session> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn channel(&self) -> Channel {
        self.session().channel.clone()
    }

    /// Start recovery when the broker drops `session`'s connection.
    fn watch(self: &Arc<Self>, session: &Session) {
        let transport: Weak<Self> = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        session.connection.on_error(move |error| {
            if let Some(transport) = transport.upgrade() {
                warn!(error = %error, "RabbitMQ connection lost");
                runtime.spawn(transport.recover());
            }
        });
    }

    /// Reopen connection and channel, then re-register every consumer on a
    /// durable queue. Retries with the configured backoff until it succeeds
    /// or the transport is closed.
    async fn recover(self: Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forget_reply_consumers();

        let policy = self.settings.retry_policy();
        let mut attempt: u32 = 0;
        while !self.closed.load(Ordering::SeqCst) {
            attempt += 1;
            info!(attempt, "Attempting to recover RabbitMQ connection");
            match self.reopen().await {
                Ok(restored) => {
                    info!(attempt, consumers = restored, "RabbitMQ connection recovered");
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Connection recovery attempt failed");
                    let capped = attempt.min(policy.max_attempts.max(1));
                    tokio::time::sleep(policy.delay_after(capped)).await;
                }
            }
        }
        self.recovering.store(false, Ordering::SeqCst);
    }

    fn forget_reply_consumers(&self) {
        let mut consumers = lock(&self.consumers);
        consumers.retain(|_, registration| registration.recoverable);
        lock(&self.reply_queues).clear();
    }

    async fn reopen(self: &Arc<Self>) -> Result<usize> {
        let session = Session::open(&self.settings, &self.exchange).await?;
        match self.restore_consumers(&session).await {
            Ok(restored) => {
                let session = Arc::new(session);
                self.watch(&session);
                *self
                    .session
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
                Ok(restored)
            }
            Err(e) => {
                close_quietly(&session.connection, Some(&session.channel)).await;
                Err(e)
            }
        }
    }

    async fn restore_consumers(&self, session: &Session) -> Result<usize> {
        let prefetch = *lock(&self.prefetch);
        if let Some(prefetch_count) = prefetch {
            basic_qos(&session.channel, prefetch_count).await?;
        }

        let registrations: Vec<(String, String, ConsumeMode, mpsc::UnboundedSender<Result<Delivery>>)> =
            lock(&self.consumers)
                .iter()
                .map(|(tag, r)| (tag.clone(), r.queue.clone(), r.mode, r.sender.clone()))
                .collect();

        for (consumer_tag, queue, mode, sender) in &registrations {
            declare_durable_queue(&session.channel, queue).await?;
            let consumer = basic_consume(&session.channel, queue, consumer_tag, *mode).await?;
            self.forward(consumer, *mode, sender.clone());
            debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer restored");
        }
        Ok(registrations.len())
    }

    /// Pump lapin deliveries into a caller's stream until either side ends.
    fn forward(
        &self,
        mut consumer: Consumer,
        mode: ConsumeMode,
        sender: mpsc::UnboundedSender<Result<Delivery>>,
    ) {
        self.runtime.spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = delivery
                    .map(|delivery| into_delivery(delivery, mode))
                    .map_err(RpcError::from);
                if sender.unbounded_send(delivery).is_err() {
                    break;
                }
            }
        });
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RpcError::AckError(e.to_string()))
    }
}

fn properties_for(envelope: &Envelope) -> BasicProperties {
    let mut properties =
        BasicProperties::default().with_content_type(JSON_CONTENT_TYPE.into());
    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    if envelope.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY);
    }
    properties
}

fn into_delivery(delivery: LapinDelivery, mode: ConsumeMode) -> Delivery {
    let LapinDelivery {
        routing_key,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let envelope = Envelope {
        routing_key: routing_key.as_str().to_string(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
        persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY),
        body: data,
    };

    let acker: Option<Box<dyn Acknowledger>> = match mode {
        ConsumeMode::AutoAck => None,
        ConsumeMode::Manual => Some(Box::new(AmqpAcker(acker))),
    };
    Delivery::new(envelope, acker)
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        declare_exchange(&self.channel(), exchange).await
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        declare_durable_queue(&self.channel(), queue).await
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        let queue = self
            .channel()
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::TopologyError(format!("Failed to declare reply queue: {e}")))?;
        let name = queue.name().as_str().to_string();
        lock(&self.reply_queues).insert(name.clone());
        Ok(name)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        lock(&self.reply_queues).remove(queue);
        self.channel()
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RpcError::TopologyError(format!("Failed to delete queue: {e}")))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel()
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::TopologyError(format!("Failed to bind queue: {e}")))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        mode: ConsumeMode,
    ) -> Result<DeliveryStream> {
        let consumer = basic_consume(&self.channel(), queue, consumer_tag, mode).await?;
        let (sender, receiver) = mpsc::unbounded();

        let recoverable = !lock(&self.reply_queues).contains(queue);
        lock(&self.consumers).insert(
            consumer_tag.to_string(),
            ConsumerRegistration {
                queue: queue.to_string(),
                mode,
                recoverable,
                sender: sender.clone(),
            },
        );
        self.forward(consumer, mode, sender);
        Ok(Box::pin(receiver))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let registration = lock(&self.consumers).remove(consumer_tag);
        if let Some(registration) = &registration {
            if !registration.recoverable {
                lock(&self.reply_queues).remove(&registration.queue);
            }
        }
        self.channel()
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RpcError::ConsumeError(format!("Failed to cancel consumer: {e}")))
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        self.channel()
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties_for(envelope),
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| RpcError::PublishError(e.to_string()))
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        *lock(&self.prefetch) = Some(prefetch_count);
        basic_qos(&self.channel(), prefetch_count).await
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && !self.recovering.load(Ordering::SeqCst)
            && self.session().is_connected()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.consumers).clear();
        lock(&self.reply_queues).clear();

        let session = self.session();
        if session.channel.status().connected() {
            if let Err(e) = session.channel.close(REPLY_SUCCESS, "Closing RPC channel").await {
                warn!("Failed to close channel cleanly: {}", e);
            }
        }
        if session.connection.status().connected() {
            info!("Closing RabbitMQ connection gracefully");
            session
                .connection
                .close(REPLY_SUCCESS, "Closing RPC connection")
                .await
                .map_err(|e| RpcError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }
}
