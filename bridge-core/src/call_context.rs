//! Call Context (C5, §3, §4.5): the per-invocation object visible to both
//! client callbacks and server handlers. Built once per RPC and threaded
//! through the interceptor chain (§4.6) to the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};
use crate::message::MessageHandle;
use crate::metadata::MetadataBag;
use crate::stream::{Cancellation, Inbound, Outbound, RecvStep};

/// Per-call state shared between the server dispatcher, the interceptor
/// chain, and the JS handler. Fields follow §3 exactly: `method` and
/// `requestHeader` are invariant; `responseHeader` is settable once before
/// the first response message; `trailer` may be merged into any time before
/// completion.
pub struct CallContext {
    method: String,
    request_header: Option<MetadataBag>,
    deadline: Option<Instant>,
    response_header: StdMutex<Option<MetadataBag>>,
    header_sent: AtomicBool,
    header_channel: StdMutex<Option<oneshot::Sender<MetadataBag>>>,
    trailer: StdMutex<MetadataBag>,
    request: Option<MessageHandle>,
    outbound: Option<Outbound>,
    inbound: Option<Inbound>,
    cancellation: Cancellation,
}

impl CallContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: String,
        request_header: Option<MetadataBag>,
        deadline: Option<Instant>,
        request: Option<MessageHandle>,
        outbound: Option<Outbound>,
        inbound: Option<Inbound>,
        cancellation: Cancellation,
    ) -> Self {
        CallContext {
            method,
            request_header,
            deadline,
            response_header: StdMutex::new(None),
            header_sent: AtomicBool::new(false),
            header_channel: StdMutex::new(None),
            trailer: StdMutex::new(MetadataBag::create()),
            request,
            outbound,
            inbound,
            cancellation,
        }
    }

    /// `call.method` (§4.5, P6): `/<ServiceFullName>/<ProtoMethodName>`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Read-only snapshot of the request header (server side only).
    pub fn request_header(&self) -> Option<&MetadataBag> {
        self.request_header.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Populated only for unary-request modes (§3, §4.5).
    pub fn request(&self) -> Option<&MessageHandle> {
        self.request.as_ref()
    }

    /// `call.setHeader(md)` (§4.4 step 5, §4.6): must be called before the
    /// first `send`; once the header has been sent this is a no-op (the
    /// spec's "warning-equivalent error" — logged, not raised).
    pub fn set_header(&self, md: MetadataBag) {
        if self.header_sent.load(Ordering::SeqCst) {
            tracing::warn!(method = %self.method, "setHeader called after the response header was already sent");
            return;
        }
        *self.response_header.lock().expect("response header lock poisoned") = Some(md);
    }

    /// Marks the header as sent and returns it, so the dispatcher can
    /// deliver it exactly once, before the first message or the unary
    /// response (§4.3 ordering guarantees).
    pub fn take_header_for_send(&self) -> MetadataBag {
        self.header_sent.store(true, Ordering::SeqCst);
        self.response_header
            .lock()
            .expect("response header lock poisoned")
            .take()
            .unwrap_or_default()
    }

    /// Wired up by a dispatcher that needs to learn the header as soon as
    /// it is finalized, rather than polling for it after the handler
    /// returns (the in-process transport uses this to flush the header
    /// ahead of the first streamed response message).
    pub fn set_header_channel(&self, tx: oneshot::Sender<MetadataBag>) {
        *self.header_channel.lock().expect("header channel lock poisoned") = Some(tx);
    }

    fn flush_header_channel(&self) {
        if self.header_sent.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.header_channel.lock().expect("header channel lock poisoned").take() {
            let _ = tx.send(self.take_header_for_send());
        }
    }

    /// `call.setTrailer(md)` (§4.4 step 5): merges into the accumulated
    /// trailer bag.
    pub fn set_trailer(&self, md: MetadataBag) {
        self.trailer.lock().expect("trailer lock poisoned").merge(&md);
    }

    pub fn take_trailer(&self) -> MetadataBag {
        std::mem::take(&mut *self.trailer.lock().expect("trailer lock poisoned"))
    }

    /// `call.send(msg)` for server-streaming / bidi modes (§3, §4.4 step 5).
    /// Flushes the response header ahead of the message on the first call,
    /// so the client observes it before any payload (§4.3 ordering).
    pub async fn send(&self, msg: MessageHandle) -> Result<()> {
        self.flush_header_channel();
        match &self.outbound {
            Some(out) => out.send(msg).await,
            None => Err(BridgeError::InvalidState("this call has no outbound direction".into())),
        }
    }

    /// `call.end(status?)` closes the outbound direction. Also flushes the
    /// response header if the handler never sent a message, so a
    /// zero-message streaming response still delivers its header.
    pub fn end(&self) {
        self.flush_header_channel();
        if let Some(out) = &self.outbound {
            out.end();
        }
    }

    /// Delivers a terminal error to whoever is consuming this call's
    /// outbound direction, in place of a clean end of stream. Used by a
    /// dispatcher when the handler's pipeline resolves to an error after
    /// some (or no) messages were already sent.
    pub async fn fail(&self, err: crate::error::GrpcError) {
        self.flush_header_channel();
        if let Some(out) = &self.outbound {
            out.fail(err).await;
        }
    }

    /// `call.recv()` for client-streaming / bidi modes (§3, §4.5).
    pub async fn recv(&self) -> Result<RecvStep> {
        match &self.inbound {
            Some(inb) => inb.recv().await,
            None => Err(BridgeError::InvalidState("this call has no inbound direction".into())),
        }
    }

    /// `call.cancelled` (§4.5): true exactly when the transport signals
    /// cancellation or the deadline elapses.
    pub fn cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// One-shot subscription used by long-running handlers to cooperatively
    /// abort (§4.5, §5).
    pub async fn on_cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_handle(&self) -> Cancellation {
        self.cancellation.clone()
    }
}
