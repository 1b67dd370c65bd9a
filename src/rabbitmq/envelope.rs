// src/rabbitmq/envelope.rs
// Broker-neutral message envelope shared by the request and response sides.

use async_trait::async_trait;
use std::fmt;

use super::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as it travels through the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    /// `<domain>.<action>` for requests, the reply queue name for replies.
    pub routing_key: String,
    pub correlation_id: Option<String>,
    /// Present only on requests expecting a reply.
    pub reply_to: Option<String>,
    pub persistent: bool,
    /// UTF-8 JSON payload.
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn request(
        routing_key: &str,
        correlation_id: &str,
        reply_to: &str,
        body: Vec<u8>,
    ) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(reply_to.to_string()),
            persistent: true,
            body,
        }
    }

    /// A reply goes straight to the reply queue through the default exchange.
    pub fn reply(reply_to: &str, correlation_id: Option<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: reply_to.to_string(),
            correlation_id,
            reply_to: None,
            persistent: false,
            body,
        }
    }

    /// The reply address, ignoring empty values.
    pub fn reply_address(&self) -> Option<&str> {
        self.reply_to.as_deref().filter(|reply_to| !reply_to.is_empty())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("persistent", &self.persistent)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Settles a manually acknowledged delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// An inbound envelope plus whatever is needed to acknowledge it.
pub struct Delivery {
    pub envelope: Envelope,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Option<Box<dyn Acknowledger>>) -> Self {
        Self { envelope, acker }
    }

    /// No-op for deliveries consumed in auto-ack mode.
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}
