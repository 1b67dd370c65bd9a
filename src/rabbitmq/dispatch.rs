// src/rabbitmq/dispatch.rs
// Handler abstraction for the response listener and an exact-match router.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::codec;

pub const PROCESSING_FAILED: &str = "Error processing message";

/// A failure inside business logic. The listener turns it into an
/// [`ApiResponse`] failure envelope instead of crashing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// `Ok(None)` means "nothing to reply".
pub type HandlerResult = Result<Option<Value>, HandlerError>;

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, body: &str, routing_key: &str) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, body: &str, routing_key: &str) -> HandlerResult {
        (self)(body.to_string(), routing_key.to_string()).await
    }
}

/// Standard response body exchanged between services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            errors: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            errors,
        }
    }
}

impl ApiResponse<Value> {
    /// The envelope published in place of a reply when a handler fails.
    pub fn handler_failure(error: &HandlerError) -> Self {
        Self::failure(PROCESSING_FAILED, vec![error.message().to_string()])
    }
}

type Route = Arc<dyn Fn(String) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Exact-match table from full routing key to behaviour.
///
/// Wildcard bindings only decide which messages reach a queue; every key a
/// service expects must be registered here.
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a behaviour receiving the raw JSON body.
    pub fn route<F, Fut>(mut self, routing_key: &str, behaviour: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let route: Route = Arc::new(move |body| Box::pin(behaviour(body)));
        self.routes.insert(routing_key.to_string(), route);
        self
    }

    /// Register a behaviour with a decoded request and a serialized response.
    pub fn typed<Req, Resp, F, Fut>(self, routing_key: &str, behaviour: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let behaviour = Arc::new(behaviour);
        self.route(routing_key, move |body| {
            let behaviour = behaviour.clone();
            async move {
                let request: Req = codec::decode_str(&body)?;
                let response = behaviour(request).await?;
                Ok::<_, HandlerError>(Some(serde_json::to_value(response)?))
            }
        })
    }

    pub fn routing_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, body: &str, routing_key: &str) -> HandlerResult {
        match self.routes.get(routing_key) {
            Some(route) => route(body.to_string()).await,
            None => {
                warn!(routing_key, "no route registered for routing key");
                let response =
                    ApiResponse::<Value>::error(format!("Unknown routing key: {routing_key}"));
                Ok(Some(serde_json::to_value(response)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct GetById {
        id: u64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct UserView {
        user_id: u64,
        display_name: String,
    }

    fn router() -> Router {
        Router::new()
            .route("user.health-check", |_body| async {
                let health = ApiResponse::success("UserService is healthy", "Health check successful");
                Ok::<_, HandlerError>(Some(serde_json::to_value(health)?))
            })
            .typed("user.get-by-id", |request: GetById| async move {
                if request.id == 0 {
                    return Err(HandlerError::new("Invalid ID provided"));
                }
                Ok(ApiResponse::success(
                    UserView {
                        user_id: request.id,
                        display_name: "Ada".into(),
                    },
                    "User retrieved successfully",
                ))
            })
    }

    #[tokio::test]
    async fn test_exact_key_dispatch() {
        let reply = router().handle("{}", "user.health-check").await.unwrap().unwrap();
        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["data"], json!("UserService is healthy"));
    }

    #[tokio::test]
    async fn test_typed_route_decodes_case_insensitively() {
        let reply = router()
            .handle(r#"{"Id": 42}"#, "user.get-by-id")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply["data"]["userId"], json!(42));
        assert_eq!(reply["data"]["displayName"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_typed_route_surfaces_errors() {
        let err = router().handle(r#"{"id": 0}"#, "user.get-by-id").await.unwrap_err();
        assert_eq!(err.message(), "Invalid ID provided");

        let err = router().handle("not json", "user.get-by-id").await.unwrap_err();
        assert!(!err.message().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_routing_key_is_a_structured_error() {
        let reply = router().handle("{}", "user.explode").await.unwrap().unwrap();
        assert_eq!(
            reply,
            json!({"success": false, "message": "Unknown routing key: user.explode"})
        );
    }

    #[tokio::test]
    async fn test_closures_are_handlers() {
        let handler = |body: String, key: String| async move {
            Ok::<_, HandlerError>(Some(json!({ "echo": body, "key": key })))
        };
        let reply = handler.handle("hi", "todo.echo").await.unwrap().unwrap();
        assert_eq!(reply, json!({"echo": "hi", "key": "todo.echo"}));
    }

    #[test]
    fn test_handler_failure_envelope_shape() {
        let envelope = ApiResponse::handler_failure(&HandlerError::new("boom"));
        assert_eq!(
            serde_json::to_value(envelope).unwrap(),
            json!({"success": false, "message": "Error processing message", "errors": ["boom"]})
        );
    }

    #[test]
    fn test_response_data_needs_no_default() {
        let found: ApiResponse<UserView> = crate::rabbitmq::codec::decode_str(
            r#"{"Success":true,"Message":"ok","Data":{"UserId":4,"DisplayName":"Ada"}}"#,
        )
        .unwrap();
        assert_eq!(
            found.data,
            Some(UserView {
                user_id: 4,
                display_name: "Ada".into(),
            })
        );

        let missing: ApiResponse<UserView> =
            crate::rabbitmq::codec::decode_str(r#"{"success":false,"message":"not found"}"#).unwrap();
        assert_eq!(missing.data, None);
        assert!(missing.errors.is_empty());
    }

    #[test]
    fn test_routing_keys_are_sorted() {
        assert_eq!(router().routing_keys(), vec!["user.get-by-id", "user.health-check"]);
    }
}
