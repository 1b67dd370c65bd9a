// src/rabbitmq/memory.rs
// In-process topic broker implementing the transport seam.

use async_trait::async_trait;
use futures::channel::mpsc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::envelope::{Acknowledger, Delivery, Envelope};
use super::errors::{Result, RpcError};
use super::topology::topic_matches;
use super::transport::{ConsumeMode, Connector, DeliveryStream, Transport, DEFAULT_EXCHANGE};

/// Snapshot of one queue, for assertions and health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

/// A broker living in process memory.
///
/// Clones share state; every [`Connector::connect`] hands out a new
/// transport on the same broker, so several "processes" can be simulated
/// against one broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    refuse_consumers: bool,
    connect_attempts: u32,
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    consumer_queues: HashMap<String, String>,
    next_reply_queue: u64,
    published: u64,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

struct MemoryQueue {
    auto_delete: bool,
    ready: VecDeque<Envelope>,
    consumers: Vec<MemoryConsumer>,
    cursor: usize,
    unacked: usize,
}

struct MemoryConsumer {
    tag: String,
    mode: ConsumeMode,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

impl MemoryQueue {
    fn new(auto_delete: bool) -> Self {
        Self {
            auto_delete,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            unacked: 0,
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections until switched back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Reject `consume` on every transport until switched back.
    pub fn set_refuse_consumers(&self, refuse: bool) {
        self.lock().refuse_consumers = refuse;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn exchanges(&self) -> Vec<String> {
        let mut exchanges: Vec<String> = self.lock().exchanges.iter().cloned().collect();
        exchanges.sort();
        exchanges
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        self.lock().queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked,
            consumers: q.consumers.len(),
        })
    }

    pub fn bindings_for(&self, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    /// Total envelopes accepted by `publish`, routed or not.
    pub fn published_count(&self) -> u64 {
        self.lock().published
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BrokerState {
    fn route(&mut self, exchange: &str, envelope: &Envelope) -> Vec<String> {
        if exchange == DEFAULT_EXCHANGE {
            return vec![envelope.routing_key.clone()];
        }
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && topic_matches(&binding.pattern, &envelope.routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn enqueue(&mut self, broker: &MemoryBroker, queue_name: &str, envelope: Envelope) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            debug!(queue = queue_name, "dropping message for missing queue");
            return;
        };

        let mut envelope = envelope;
        while !queue.consumers.is_empty() {
            let index = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            let consumer = &queue.consumers[index];

            let acker: Option<Box<dyn Acknowledger>> = match consumer.mode {
                ConsumeMode::AutoAck => None,
                ConsumeMode::Manual => Some(Box::new(MemoryAcker {
                    broker: broker.clone(),
                    queue: queue_name.to_string(),
                    settled: AtomicBool::new(false),
                })),
            };
            let manual = acker.is_some();

            match consumer
                .sender
                .unbounded_send(Ok(Delivery::new(envelope, acker)))
            {
                Ok(()) => {
                    if manual {
                        queue.unacked += 1;
                    }
                    return;
                }
                Err(err) => {
                    // Receiver dropped without a cancel; forget the consumer.
                    let tag = consumer.tag.clone();
                    queue.consumers.remove(index);
                    self.consumer_queues.remove(&tag);
                    match err.into_inner() {
                        Ok(delivery) => envelope = delivery.envelope,
                        Err(_) => return,
                    }
                }
            }
        }

        queue.ready.push_back(envelope);
    }

    fn remove_consumer(&mut self, tag: &str) {
        let Some(queue_name) = self.consumer_queues.remove(tag) else {
            return;
        };
        let delete = match self.queues.get_mut(&queue_name) {
            Some(queue) => {
                queue.consumers.retain(|c| c.tag != tag);
                queue.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            debug!(queue = %queue_name, "auto-deleting queue");
            self.queues.remove(&queue_name);
            self.bindings.retain(|b| b.queue != queue_name);
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AckError("delivery already acknowledged".into()));
        }
        if let Some(queue) = self.broker.lock().queues.get_mut(&self.queue) {
            queue.unacked = queue.unacked.saturating_sub(1);
        }
        Ok(())
    }
}

/// One connection's view of a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    open: AtomicBool,
    tags: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RpcError::ChannelError("channel is closed".into()))
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, exchange: &str) -> Result<Arc<dyn Transport>> {
        {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.unreachable {
                return Err(RpcError::ConnectionError("broker unreachable".into()));
            }
        }
        let transport = MemoryTransport {
            broker: self.clone(),
            open: AtomicBool::new(true),
            tags: Mutex::new(HashSet::new()),
        };
        transport.declare_exchange(exchange).await?;
        Ok(Arc::new(transport))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .lock()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue::new(false));
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.next_reply_queue += 1;
        let name = format!("amq.gen-{}", state.next_reply_queue);
        state.queues.insert(name.clone(), MemoryQueue::new(true));
        Ok(name)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let Some(removed) = state.queues.remove(queue) else {
            return Ok(());
        };
        for consumer in &removed.consumers {
            state.consumer_queues.remove(&consumer.tag);
        }
        state.bindings.retain(|b| b.queue != queue);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(RpcError::TopologyError(format!("no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(RpcError::TopologyError(format!("no queue '{queue}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        mode: ConsumeMode,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded();
        {
            let broker = self.broker.clone();
            let mut state = self.broker.lock();
            if state.refuse_consumers {
                return Err(RpcError::ConsumeError(format!("access refused to '{queue}'")));
            }
            if state.consumer_queues.contains_key(consumer_tag) {
                return Err(RpcError::ConsumeError(format!(
                    "consumer tag '{consumer_tag}' already in use"
                )));
            }
            let backlog: Vec<Envelope> = match state.queues.get_mut(queue) {
                Some(q) => {
                    q.consumers.push(MemoryConsumer {
                        tag: consumer_tag.to_string(),
                        mode,
                        sender,
                    });
                    q.ready.drain(..).collect()
                }
                None => return Err(RpcError::ConsumeError(format!("no queue '{queue}'"))),
            };
            state
                .consumer_queues
                .insert(consumer_tag.to_string(), queue.to_string());
            for envelope in backlog {
                state.enqueue(&broker, queue, envelope);
            }
        }
        self.tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(consumer_tag.to_string());
        Ok(Box::pin(receiver))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        self.tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(consumer_tag);
        self.broker.lock().remove_consumer(consumer_tag);
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_open()?;
        let broker = self.broker.clone();
        let mut state = self.broker.lock();
        if exchange != DEFAULT_EXCHANGE && !state.exchanges.contains(exchange) {
            return Err(RpcError::PublishError(format!("no exchange '{exchange}'")));
        }
        state.published += 1;
        for queue in state.route(exchange, envelope) {
            state.enqueue(&broker, &queue, envelope.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, _prefetch_count: u16) -> Result<()> {
        self.ensure_open()
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let tags: Vec<String> = self
            .tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();
        let mut state = self.broker.lock();
        for tag in tags {
            state.remove_consumer(&tag);
        }
        Ok(())
    }
}
