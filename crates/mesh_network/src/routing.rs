//! Message router — dispatches inbound messages and system responses to
//! handlers registered by type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::message::{BroadcastDeduplicator, Message};
use crate::system::SystemResponse;
use crate::transport::HandlerFuture;

/// Handles one application message.
pub type RouteHandler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Handles one system response.
pub type ResponseHandler = Arc<dyn Fn(SystemResponse) -> HandlerFuture + Send + Sync>;

/// Box an async closure as a [`RouteHandler`].
pub fn route_handler<F, Fut>(f: F) -> RouteHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message: Message| -> HandlerFuture { Box::pin(f(message)) })
}

/// Box an async closure as a [`ResponseHandler`].
pub fn response_handler<F, Fut>(f: F) -> ResponseHandler
where
    F: Fn(SystemResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |response: SystemResponse| -> HandlerFuture { Box::pin(f(response)) })
}

/// Routes messages to the handler registered for their `message_type`.
///
/// Repeated copies of one broadcast are dropped before dispatch.
pub struct MessageRouter {
    handlers: parking_lot::RwLock<HashMap<String, RouteHandler>>,
    default_handler: parking_lot::RwLock<Option<RouteHandler>>,
    dedup: parking_lot::Mutex<BroadcastDeduplicator>,
}

impl MessageRouter {
    /// Create a new router with no handlers registered.
    pub fn new() -> Self {
        Self {
            handlers: parking_lot::RwLock::new(HashMap::new()),
            default_handler: parking_lot::RwLock::new(None),
            dedup: parking_lot::Mutex::new(BroadcastDeduplicator::default()),
        }
    }

    /// Register a handler for a message type, replacing any previous one.
    pub fn register(&self, message_type: impl Into<String>, handler: RouteHandler) {
        let key = message_type.into();
        debug!("Registering handler for message type: {key}");
        self.handlers.write().insert(key, handler);
    }

    /// Register a default handler for unmatched message types.
    pub fn set_default_handler(&self, handler: RouteHandler) {
        *self.default_handler.write() = Some(handler);
    }

    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.read().contains_key(message_type)
    }

    /// Return the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Dispatch a message. Returns `true` if a handler ran.
    pub async fn dispatch(&self, message: Message) -> bool {
        if !self.dedup.lock().accept(&message) {
            debug!("Dropping repeated broadcast {:?}", message.broadcast_id);
            return false;
        }

        let handler = self
            .handlers
            .read()
            .get(&message.message_type)
            .cloned()
            .or_else(|| self.default_handler.read().clone());

        match handler {
            Some(handler) => {
                debug!("Dispatching {} message {}", message.message_type, message.message_id);
                handler(message).await;
                true
            }
            None => {
                warn!("No handler for message type: {}", message.message_type);
                false
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes system responses to handlers keyed by command name.
#[derive(Default)]
pub struct ResponseRouter {
    handlers: parking_lot::RwLock<HashMap<String, ResponseHandler>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, command: impl Into<String>, handler: ResponseHandler) {
        self.handlers.write().insert(command.into(), handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Run the handler for `response.command`. Returns `false` when no
    /// handler is registered for it.
    pub async fn dispatch(&self, response: SystemResponse) -> bool {
        let handler = self.handlers.read().get(&response.command).cloned();
        match handler {
            Some(handler) => {
                handler(response).await;
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> RouteHandler {
        route_handler(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register("chat", counting(Arc::clone(&hits)));

        assert!(router.has_handler("chat"));
        assert_eq!(router.handler_count(), 1);

        let msg = Message::direct("a", "b", "chat", serde_json::json!({}));
        assert!(router.dispatch(msg).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_message() {
        let router = MessageRouter::new();
        let msg = Message::direct("a", "b", "task", serde_json::json!({}));
        assert!(!router.dispatch(msg).await);
    }

    #[tokio::test]
    async fn test_default_handler() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.set_default_handler(counting(Arc::clone(&hits)));

        let msg = Message::direct("a", "b", "anything", serde_json::json!({}));
        assert!(router.dispatch(msg).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_broadcast_dispatched_once() {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register("news", counting(Arc::clone(&hits)));

        let mut msg = Message::broadcast("a", "news", serde_json::json!({}));
        msg.broadcast_id = Some("b-1".into());
        assert!(router.dispatch(msg.clone()).await);
        assert!(!router.dispatch(msg).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_response_router() {
        let router = ResponseRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        router.register(
            "list_agents",
            response_handler(move |_resp| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        let resp = SystemResponse::ok("list_agents", serde_json::Map::new());
        assert!(router.dispatch(resp).await);
        assert!(!router.dispatch(SystemResponse::ok("ping_agent", serde_json::Map::new())).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
