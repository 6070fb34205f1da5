//! Call Protocol — one request/response exchange per logical stream
//!
//! ```text
//!  caller                       session                      peer
//!    │ call(method, payload)       │                           │
//!    │──────────── open_stream ───▸│──── Request frame ───────▸│ Router
//!    │                             │◂─── Response / Error ─────│
//!    │◂──────────── result ────────│  (stream closed)          │
//! ```
//!
//! - Every call uses a fresh stream, so calls never interleave
//! - The timeout bounds the whole exchange; expiry drops the stream but the
//!   session stays usable
//! - No retries; callers decide

mod frame;
mod protocol;
mod router;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{FabricError, Result};
use crate::session::{LogicalStream, Session};

pub use frame::{read_frame, write_frame, Frame, MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use protocol::{
    decode_payload, encode_payload, DirEntry, DirEntryListing, Method, Ping, PingResponse,
    RequestEnvelope,
};
pub use router::{HandlerResult, Router};

/// Default timeout for RPC calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

impl Session {
    /// Send an opaque payload to `method` and wait for the opaque reply.
    pub async fn call_raw(&self, method: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let request = Frame::Request(RequestEnvelope::new(method, payload).encode()?);

        let exchange = async {
            let mut stream = self.open_stream().await?;
            write_frame(&mut stream, &request).await?;
            let reply = read_frame(&mut stream).await?;
            let _ = stream.shutdown().await;

            match reply {
                Some(Frame::Response(data)) => Ok(data),
                Some(Frame::Error(msg)) => Err(FabricError::Remote(msg)),
                Some(Frame::Request(_)) => Err(FabricError::CallProtocol(
                    "peer answered with a request frame".into(),
                )),
                None => Err(FabricError::CallProtocol(
                    "stream closed before a response arrived".into(),
                )),
            }
        };

        tokio::select! {
            biased;
            _ = self.scope().cancelled() => Err(FabricError::Closed),
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(result) => result,
                Err(_) => {
                    debug!("[rpc] {} to {} timed out after {:?}", method, self.key(), timeout);
                    Err(FabricError::CallTimeout(timeout))
                }
            },
        }
    }

    /// Typed call of method `M`.
    pub async fn call<M: Method>(&self, request: &M::Request, timeout: Duration) -> Result<M::Response> {
        let payload = encode_payload(request)?;
        let data = self.call_raw(M::NAME, payload, timeout).await?;
        decode_payload(&data)
    }

    pub async fn ping(&self, timeout: Duration) -> Result<PingResponse> {
        self.call::<Ping>(&(), timeout).await
    }

    /// Answer inbound calls with `router` until the session closes.
    ///
    /// Each inbound stream is handled on its own task, scoped to this
    /// session's lifecycle.
    pub async fn serve(&self, router: Arc<Router>) {
        info!("[rpc] serving {:?} for {}", router.methods(), self.key());
        loop {
            let stream = match self.accept_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("[rpc] stopped serving {}: {}", self.key(), e);
                    return;
                }
            };

            let router = router.clone();
            let scope = self.scope().child_token();
            let key = self.key().to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = scope.cancelled() => {}
                    result = handle_stream(stream, router) => {
                        if let Err(e) = result {
                            debug!("[rpc] call stream from {} failed: {}", key, e);
                        }
                    }
                }
            });
        }
    }
}

/// Read one request, dispatch it, write one reply, close the stream.
///
/// The caller sends nothing after its request, so any read completing while
/// the handler runs (EOF, reset or stray bytes) means the caller abandoned
/// the call; the handler is then dropped along with the stream.
async fn handle_stream(mut stream: LogicalStream, router: Arc<Router>) -> Result<()> {
    let envelope = match read_frame(&mut stream).await? {
        Some(Frame::Request(data)) => RequestEnvelope::decode(&data)
            .map_err(|e| Frame::Error(format!("malformed request: {}", e))),
        Some(_) => Err(Frame::Error("expected a request frame".into())),
        None => return Ok(()),
    };

    let reply = match envelope {
        Ok(envelope) => {
            debug!("[rpc] dispatching {}", envelope.method);
            let mut trailing = [0u8; 1];
            tokio::select! {
                reply = router.dispatch(&envelope.method, envelope.payload) => reply,
                _ = stream.read(&mut trailing) => {
                    debug!("[rpc] caller abandoned {}", envelope.method);
                    return Ok(());
                }
            }
        }
        Err(reply) => reply,
    };

    write_frame(&mut stream, &reply).await?;
    stream.shutdown().await?;
    Ok(())
}
