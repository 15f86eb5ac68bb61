//! Client Factory (C3, §4.3): given a service descriptor, drive RPCs
//! against an injected [`Transport`] and shape the result the way each of
//! the four RPC modes requires.
//!
//! This module is the engine-agnostic half of C3. The spec describes the
//! *output* as "a JS object with one method per RPC, keyed by the lower-
//! camelCase short name" -- building that literal JS object, and turning
//! these `async fn`s into promise-returning functions, is `bridge-quickjs`'s
//! job (there is no JS object here, only the dispatch a generated method
//! body would call into). [`Client`] exposes one generic entry point per
//! mode, parametrized by `short_name`, which is exactly the shape a
//! generated-per-method JS function needs to close over.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::descriptor::{MethodDescriptor, ProtoRegistry, RpcMode, ServiceDescriptor};
use crate::error::{BridgeError, GrpcError, Result};
use crate::message::{self, MessageHandle, MessageInput};
use crate::metadata::MetadataBag;
use crate::stream::{Cancellation, RecvStep};
use crate::transport::Transport;

/// A callback fired exactly once (§4.3: "`onHeader` fires exactly once...
/// `onTrailer` fires exactly once"). Boxed `FnMut` rather than `FnOnce` only
/// because it is easiest to store uniformly; each instance is in fact
/// invoked at most once, enforced by [`CallbackGate`].
pub type MetadataCallback = Box<dyn FnMut(MetadataBag) + Send>;

/// `opts` recognized by every client method (§4.3, §9 "Configuration
/// surface"). `deadline` is taken as an already-resolved absolute instant;
/// converting a caller's relative-milliseconds value into one is the JS
/// binding's job, since "now" is a wall-clock concept that belongs above
/// this engine-agnostic layer.
#[derive(Default)]
pub struct CallOptions {
    pub metadata: Option<MetadataBag>,
    pub deadline: Option<Instant>,
    pub on_header: Option<MetadataCallback>,
    pub on_trailer: Option<MetadataCallback>,
    pub signal: Option<Cancellation>,
}

impl CallOptions {
    pub fn new() -> Self {
        CallOptions::default()
    }
}

/// Fires a pending oneshot-delivered value through a callback exactly once,
/// then becomes a no-op. Used for both `onHeader` (fed by the header
/// oneshot a streaming call opens with) and `onTrailer` (fed by the trailer
/// oneshot delivered at stream end) so the ordering guarantee in §4.3 --
/// "`onHeader`, then per-message events, then `onTrailer`, then promise
/// resolution" -- holds by construction rather than by scheduler luck:
/// `recv()` awaits the header gate before returning its first step, and the
/// trailer gate before returning its terminal `{done:true}`/error step.
struct CallbackGate {
    pending: Option<(oneshot::Receiver<MetadataBag>, MetadataCallback)>,
}

impl CallbackGate {
    fn new(rx: Option<oneshot::Receiver<MetadataBag>>, cb: Option<MetadataCallback>) -> Self {
        CallbackGate {
            pending: match (rx, cb) {
                (Some(rx), cb) => Some((rx, cb.unwrap_or_else(|| Box::new(|_| {})))),
                (None, _) => None,
            },
        }
    }

    async fn fire(&mut self) {
        if let Some((rx, mut cb)) = self.pending.take() {
            if let Ok(md) = rx.await {
                cb(md);
            }
        }
    }
}

/// Client-side Stream Controller (§3, §4.3): the shared shape behind
/// server-streaming, client-streaming, and bidi calls. Built directly on
/// the `Outbound`/`Inbound` halves an `OpenStream` hands back rather than
/// reusing [`crate::stream::StreamController`], so the header/trailer
/// callback gating above has somewhere to live.
pub struct ClientStream {
    outbound: Option<crate::stream::Outbound>,
    inbound: Option<crate::stream::Inbound>,
    header_gate: AsyncMutex<CallbackGate>,
    trailer_gate: AsyncMutex<CallbackGate>,
    response_consumed: AtomicBool,
    cancellation: Cancellation,
}

impl ClientStream {
    /// `send(msg)` (§3, §4.3): accepts a handle or plain object; rejects
    /// after `end()` or cancellation.
    pub async fn send(&self, input: MessageInput, expected: &prost_reflect::MessageDescriptor) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| BridgeError::InvalidState("this call has no outbound direction".into()))?;
        let native = message::unwrap(input, expected)?;
        outbound.send(MessageHandle::wrap(native)).await
    }

    /// `end()` (§3): closes the outbound direction. Idempotent.
    pub fn end(&self) {
        if let Some(out) = &self.outbound {
            out.end();
        }
    }

    /// `recv()` (§3, §4.3): `{value, done}`. Fires `onHeader` before the
    /// first step and `onTrailer` before the terminal step, per the fixed
    /// ordering §4.3 specifies.
    pub async fn recv(&self) -> Result<RecvStep> {
        self.header_gate.lock().await.fire().await;
        let inbound = self
            .inbound
            .as_ref()
            .ok_or_else(|| BridgeError::InvalidState("this call has no inbound direction".into()))?;
        let step = inbound.recv().await;
        if matches!(step, Ok(RecvStep { done: true, .. }) | Err(_)) {
            self.trailer_gate.lock().await.fire().await;
        }
        step
    }

    /// `.response` (§3, §4.3): client-streaming calls resolve with exactly
    /// one message before the stream ends (the in-process `Transport`'s
    /// dispatcher delivers a unary-response handler's return value as a
    /// single `send`, see `transport.rs`), so `.response` is just "the one
    /// item `recv()` ever yields".
    pub async fn response(&self) -> Result<MessageHandle> {
        if self.response_consumed.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::InvalidState(".response already awaited".into()));
        }
        match self.recv().await? {
            RecvStep { value: Some(handle), .. } => {
                // Drain the terminal {done:true} so the trailer gate still
                // fires even though the caller never calls recv() again.
                let _ = self.recv().await;
                Ok(handle)
            }
            RecvStep { done: true, .. } => Err(GrpcError::new(
                crate::status::StatusCode::Internal,
                "client-streaming call ended without a response",
            )
            .into()),
            _ => unreachable!("RecvStep is always either an item or done"),
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `grpc.createClient(serviceFullName, opts?)` (§6): a handle bound to one
/// resolved service, ready to dispatch any of its methods against the
/// injected [`Transport`]. `default_metadata`, if given at construction, is
/// merged under any per-call `opts.metadata` (per-call values win on
/// conflicting keys, since they are the more specific request).
pub struct Client {
    transport: Arc<dyn Transport>,
    service: ServiceDescriptor,
    default_metadata: MetadataBag,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, registry: &dyn ProtoRegistry, full_name: &str) -> Result<Self> {
        let service = registry.resolve_service(full_name)?;
        Ok(Client { transport, service, default_metadata: MetadataBag::create() })
    }

    pub fn with_default_metadata(mut self, metadata: MetadataBag) -> Self {
        self.default_metadata = metadata;
        self
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    /// Resolve `short_name` (the lower-camelCase JS key, §4.4) to its method
    /// descriptor, NOT_FOUND if the service has no such method.
    pub fn method(&self, short_name: &str) -> Result<MethodDescriptor> {
        self.service
            .methods()
            .into_iter()
            .find(|m| m.short_name() == short_name)
            .ok_or_else(|| BridgeError::NotFound(format!("{}.{short_name}", self.service.full_name())))
    }

    fn merged_metadata(&self, opts_metadata: Option<MetadataBag>) -> MetadataBag {
        let mut merged = self.default_metadata.clone();
        if let Some(extra) = opts_metadata {
            merged.merge(&extra);
        }
        merged
    }

    fn require_mode(method: &MethodDescriptor, expected: RpcMode, label: &str) -> Result<()> {
        if method.mode() == expected {
            Ok(())
        } else {
            Err(BridgeError::TypeError(format!(
                "{} is not a {label} method (full path {})",
                method.proto_name(),
                method.full_path()
            )))
        }
    }

    /// Unary (§4.3): `method(request, opts?) -> Promise<response>`.
    pub fn unary<'a>(
        &'a self,
        short_name: &str,
        request: MessageInput,
        mut opts: CallOptions,
    ) -> BoxFuture<'a, Result<MessageHandle>> {
        let method = self.method(short_name);
        Box::pin(async move {
            let method = method?;
            Self::require_mode(&method, RpcMode::Unary, "unary")?;
            let native = message::unwrap(request, &method.input())?;
            let metadata = self.merged_metadata(opts.metadata.take());
            let cancellation = opts.signal.clone();

            let invocation = self
                .transport
                .invoke(method, MessageHandle::wrap(native), metadata, opts.deadline, cancellation)
                .await
                .map_err(BridgeError::from)?;

            // §4.3 ordering: onHeader, then (no messages for unary), then
            // onTrailer, then resolution.
            if let Some(cb) = opts.on_header.as_mut() {
                cb(invocation.response_header);
            }
            if let Some(cb) = opts.on_trailer.as_mut() {
                cb(invocation.trailer);
            }
            Ok(invocation.response)
        })
    }

    /// Server-streaming (§4.3): `method(request, opts?) -> Promise<StreamController>`.
    pub fn server_streaming<'a>(
        &'a self,
        short_name: &str,
        request: MessageInput,
        mut opts: CallOptions,
    ) -> BoxFuture<'a, Result<ClientStream>> {
        let method = self.method(short_name);
        Box::pin(async move {
            let method = method?;
            Self::require_mode(&method, RpcMode::ServerStreaming, "server-streaming")?;
            let native = message::unwrap(request, &method.input())?;
            let metadata = self.merged_metadata(opts.metadata.take());
            let cancellation = opts.signal.clone().unwrap_or_default();

            let mut open = self
                .transport
                .new_stream(method.clone(), metadata, opts.deadline, Some(cancellation.clone()))
                .await
                .map_err(BridgeError::from)?;

            // Unary-request streaming: send the single request up front and
            // close the outbound direction, mirroring how a real gRPC
            // server-streaming call has exactly one client message.
            open.outbound.send(MessageHandle::wrap(native)).await?;
            open.outbound.end();

            Ok(ClientStream {
                outbound: None,
                inbound: Some(open.inbound),
                header_gate: AsyncMutex::new(CallbackGate::new(Some(open.header), opts.on_header.take())),
                trailer_gate: AsyncMutex::new(CallbackGate::new(Some(open.trailer), opts.on_trailer.take())),
                response_consumed: AtomicBool::new(false),
                cancellation,
            })
        })
    }

    /// Client-streaming (§4.3): `method(opts?) -> StreamController`. Opening
    /// the stream has no await point a script observes (the spec's
    /// synchronous `StreamController` return, not a promise), so this
    /// resolves immediately rather than going through the `BoxFuture`
    /// shape the other three modes use.
    pub async fn client_streaming(&self, short_name: &str, mut opts: CallOptions) -> Result<ClientStream> {
        let method = self.method(short_name)?;
        Self::require_mode(&method, RpcMode::ClientStreaming, "client-streaming")?;
        let metadata = self.merged_metadata(opts.metadata.take());
        let cancellation = opts.signal.clone().unwrap_or_default();

        let open = self
            .transport
            .new_stream(method, metadata, opts.deadline, Some(cancellation.clone()))
            .await
            .map_err(BridgeError::from)?;

        Ok(ClientStream {
            outbound: Some(open.outbound),
            inbound: Some(open.inbound),
            header_gate: AsyncMutex::new(CallbackGate::new(Some(open.header), opts.on_header.take())),
            trailer_gate: AsyncMutex::new(CallbackGate::new(Some(open.trailer), opts.on_trailer.take())),
            response_consumed: AtomicBool::new(false),
            cancellation,
        })
    }

    /// Bidi (§4.3): `method(opts?) -> StreamController` with both directions.
    pub async fn bidi(&self, short_name: &str, mut opts: CallOptions) -> Result<ClientStream> {
        let method = self.method(short_name)?;
        Self::require_mode(&method, RpcMode::Bidi, "bidi")?;
        let metadata = self.merged_metadata(opts.metadata.take());
        let cancellation = opts.signal.clone().unwrap_or_default();

        let open = self
            .transport
            .new_stream(method, metadata, opts.deadline, Some(cancellation.clone()))
            .await
            .map_err(BridgeError::from)?;

        Ok(ClientStream {
            outbound: Some(open.outbound),
            inbound: Some(open.inbound),
            header_gate: AsyncMutex::new(CallbackGate::new(Some(open.header), opts.on_header.take())),
            trailer_gate: AsyncMutex::new(CallbackGate::new(Some(open.trailer), opts.on_trailer.take())),
            response_consumed: AtomicBool::new(false),
            cancellation,
        })
    }
}
