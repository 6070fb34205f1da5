//! Method-keyed handler table

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::debug;

use super::frame::Frame;
use super::protocol::{decode_payload, encode_payload, Method, Ping, PingResponse};

/// Outcome of a handler: encoded response, or a message for the error frame.
pub type HandlerResult = std::result::Result<Bytes, String>;

type Handler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Dispatch table consulted for every inbound call stream.
#[derive(Clone, Default)]
pub struct Router {
    handlers: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router answering `ping` with this process's version and hostname.
    pub fn with_ping() -> Self {
        Self::new().route::<Ping, _, _>(|()| async { Ok::<_, String>(PingResponse::local()) })
    }

    /// Register a typed handler for method `M`.
    pub fn route<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: Method + 'static,
        F: Fn(M::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<M::Response, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |payload: Bytes| -> BoxFuture<'static, HandlerResult> {
            let handler = handler.clone();
            Box::pin(async move {
                let request = decode_payload::<M::Request>(&payload)
                    .map_err(|e| format!("bad {} request: {}", M::NAME, e))?;
                let response = handler(request).await?;
                encode_payload(&response).map_err(|e| e.to_string())
            })
        });
        self.handlers.insert(M::NAME.to_string(), erased);
        self
    }

    /// Register a handler that receives and returns opaque bytes.
    pub fn route_raw<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let erased: Handler =
            Arc::new(move |payload: Bytes| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(payload))
            });
        self.handlers.insert(method.into(), erased);
        self
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `method` and build the reply frame.
    pub async fn dispatch(&self, method: &str, payload: Bytes) -> Frame {
        let Some(handler) = self.handlers.get(method).cloned() else {
            debug!("[rpc] unknown method: {}", method);
            return Frame::Error(format!("unknown method: {}", method));
        };
        match handler(payload).await {
            Ok(data) => Frame::Response(data),
            Err(msg) => Frame::Error(msg),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_route() {
        let router = Router::with_ping();
        assert_eq!(router.methods(), vec!["ping"]);

        match router.dispatch("ping", Bytes::new()).await {
            Frame::Response(data) => {
                let resp: PingResponse = decode_payload(&data).unwrap();
                assert_eq!(resp.version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("Expected Response frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_error_frame() {
        let router = Router::new();
        match router.dispatch("nope", Bytes::new()).await {
            Frame::Error(msg) => assert!(msg.contains("nope")),
            other => panic!("Expected Error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_and_bad_request() {
        let router = Router::new()
            .route_raw("fail", |_| async { Err::<Bytes, _>("disk on fire".to_string()) })
            .route::<Ping, _, _>(|()| async { Ok::<_, String>(PingResponse::local()) });

        assert_eq!(
            router.dispatch("fail", Bytes::new()).await,
            Frame::Error("disk on fire".into())
        );

        // A string where `()` is expected
        let bad = encode_payload("surprise").unwrap();
        match router.dispatch("ping", bad).await {
            Frame::Error(msg) => assert!(msg.starts_with("bad ping request")),
            other => panic!("Expected Error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_raw_route_passes_bytes_through() {
        let router = Router::new().route_raw("echo", |payload| async move { Ok::<_, String>(payload) });
        assert_eq!(router.methods(), vec!["echo"]);
        assert_eq!(
            router.dispatch("echo", Bytes::from_static(b"\x00\xffopaque")).await,
            Frame::Response(Bytes::from_static(b"\x00\xffopaque"))
        );
    }
}
