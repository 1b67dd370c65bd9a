// src/rabbitmq/transport.rs

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

use super::envelope::{Delivery, Envelope};
use super::errors::Result;

/// The default (nameless) exchange routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    /// Broker settles on delivery; used by reply consumers.
    AutoAck,
    /// Consumer must ack each delivery.
    Manual,
}

/// Broker operations used by the RPC layer.
///
/// One transport wraps one connection and one channel, shared by every
/// concurrent caller in the process, so implementations must tolerate
/// concurrent publishes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a durable, non-exclusive, non-auto-delete queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Declare an exclusive, auto-delete queue and return its broker-generated name.
    async fn declare_reply_queue(&self) -> Result<String>;

    /// Delete a queue with whatever it still holds.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, mode: ConsumeMode)
        -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()>;

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Opens a transport: connection, channel and exchange in one attempt.
///
/// A failed attempt must release whatever it opened before returning.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, exchange: &str) -> Result<Arc<dyn Transport>>;
}
