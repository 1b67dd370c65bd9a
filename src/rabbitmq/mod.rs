// src/rabbitmq/mod.rs
// Broker-mediated RPC over a shared RabbitMQ topic exchange

pub mod errors;
pub mod envelope;
pub mod transport;
pub mod connection;
pub mod topology;
pub mod codec;
pub mod dispatch;
pub mod request_response;

// Transport implementations
pub mod amqp_client;
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpConnector, AmqpTransport};
pub use connection::{ConnectionManager, ConnectionState, RetryPolicy};
pub use dispatch::{ApiResponse, HandlerError, HandlerResult, MessageHandler, Router};
pub use envelope::{Delivery, Envelope};
pub use errors::{Result, RpcError};
pub use memory::MemoryBroker;
pub use request_response::{Listener, RpcClient, RpcServer};
pub use topology::{topic_matches, BindingTable};
pub use transport::{ConsumeMode, Connector, Transport};
