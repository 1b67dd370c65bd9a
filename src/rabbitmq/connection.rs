// src/rabbitmq/connection.rs

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::amqp_client::AmqpConnector;
use super::errors::{Result, RpcError};
use super::transport::{Connector, Transport};
use crate::config::RpcSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport dropped while connected and is being reopened.
    Reconnecting,
    Closed,
}

/// Startup retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    /// Fraction of each delay randomly added or removed, 0 disables it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            multiplier: 2,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-based), before jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
}

/// Owns the process's single broker connection and channel.
///
/// Construct once per process and share it (`Arc`) with every client and
/// server. Only this type changes the connection state.
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    exchange: String,
    policy: RetryPolicy,
    inner: RwLock<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: impl Connector + 'static, exchange: &str, policy: RetryPolicy) -> Self {
        Self {
            connector: Box::new(connector),
            exchange: exchange.to_string(),
            policy,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                transport: None,
            }),
        }
    }

    /// Connect to RabbitMQ with the settings' retry policy.
    pub async fn open(settings: &RpcSettings) -> Result<Self> {
        info!(target_uri = %settings.display_target(), "Opening RabbitMQ connection");
        let manager = Self::new(
            AmqpConnector::new(settings.clone()),
            &settings.exchange,
            settings.retry_policy(),
        );
        manager.connect().await?;
        Ok(manager)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.read();
        match (&inner.state, &inner.transport) {
            (ConnectionState::Connected, Some(transport)) if !transport.is_connected() => {
                ConnectionState::Reconnecting
            }
            (state, _) => *state,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The connected precondition for everything above this layer.
    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.read().transport.clone().ok_or(RpcError::NotConnected)
    }

    /// Establish the connection, retrying with exponential backoff.
    ///
    /// Failing every attempt is fatal: the caller must not continue. Only
    /// one caller runs the retry loop; a concurrent call fails at once
    /// instead of reporting a connection that does not exist yet.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut inner = self.write();
            match inner.state {
                ConnectionState::Disconnected => inner.state = ConnectionState::Connecting,
                ConnectionState::Closed => {
                    return Err(RpcError::ConnectionError("connection manager is closed".into()))
                }
                ConnectionState::Connecting => {
                    return Err(RpcError::ConnectionError(
                        "connection attempt already in progress".into(),
                    ))
                }
                ConnectionState::Connected | ConnectionState::Reconnecting => return Ok(()),
            }
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(attempt, max_attempts, exchange = %self.exchange, "Attempting to connect to RabbitMQ");

            match self.connector.connect(&self.exchange).await {
                Ok(transport) => {
                    let closed = {
                        let mut inner = self.write();
                        if inner.state == ConnectionState::Closed {
                            true
                        } else {
                            inner.transport = Some(transport.clone());
                            inner.state = ConnectionState::Connected;
                            false
                        }
                    };
                    if closed {
                        transport.close().await.ok();
                        return Err(RpcError::ConnectionError("closed while connecting".into()));
                    }
                    info!(attempt, "RabbitMQ connection established");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "Failed to establish RabbitMQ connection");

                    if attempt >= max_attempts {
                        error!(max_attempts, "Failed to establish RabbitMQ connection after all attempts");
                        self.write().state = ConnectionState::Disconnected;
                        return Err(RpcError::ConnectionExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }

                    let wait = self.policy.jittered(self.policy.delay_after(attempt));
                    info!("Waiting {}ms before next connection attempt", wait.as_millis());
                    sleep(wait).await;
                }
            }
        }
    }

    /// Close channel then connection. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        let transport = {
            let mut inner = self.write();
            if inner.state == ConnectionState::Closed {
                return Ok(());
            }
            inner.state = ConnectionState::Closed;
            inner.transport.take()
        };

        if let Some(transport) = transport {
            transport.close().await?;
            info!("RabbitMQ connection closed");
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
