//! Request/response messaging between services over a shared RabbitMQ
//! topic exchange.
//!
//! A process owns one [`ConnectionManager`]; callers use an [`RpcClient`]
//! and services answer through an [`RpcServer`] listener.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::{load_config, RpcSettings};
pub use rabbitmq::{
    ApiResponse, BindingTable, ConnectionManager, HandlerError, Listener, MemoryBroker,
    MessageHandler, RetryPolicy, Router, RpcClient, RpcError, RpcServer,
};
