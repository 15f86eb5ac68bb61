//! Server Registry (C4, §4.4): lifecycle state machine, handler-map
//! validation, and the dispatch pipeline that turns an incoming RPC into an
//! interceptor-wrapped invocation of a JS handler.
//!
//! There is, again, no JS handler here -- a [`Handler`] is the engine-
//! agnostic shape `bridge-quickjs` adapts a JS function into (closing over
//! an `rquickjs::Function` and the loop it must run on). What this module
//! owns is everything around that: state transitions, short-name collision
//! rejection, missing-handler-is-UNIMPLEMENTED, and composing the
//! interceptor chain around the handler invocation (§4.4 steps 1-6).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::call_context::CallContext;
use crate::descriptor::{ProtoRegistry, RpcMode, ServiceDescriptor};
use crate::error::{BridgeError, GrpcError, Result};
use crate::interceptor::{compose, DispatchResult, HandlerOutcome, Interceptor, Pipeline};
use crate::message::MessageHandle;
use crate::status::StatusCode;
use crate::transport::Transport;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The four handler shapes (§3 "Handler Map"). A native `Handler` always
/// produces a [`DispatchResult`] directly; the four variants exist so the
/// dispatcher can route `call.request`/`call.recv`/`call.send` wiring
/// correctly per mode without the handler itself re-deriving its own mode.
pub enum Handler {
    /// `(request, call) -> response | promise<response>`
    Unary(Arc<dyn Fn(MessageHandle, Arc<CallContext>) -> BoxFuture<'static, DispatchResult> + Send + Sync>),
    /// `(request, call) -> void | promise<void>`; uses `call.send`.
    ServerStreaming(Arc<dyn Fn(MessageHandle, Arc<CallContext>) -> BoxFuture<'static, DispatchResult> + Send + Sync>),
    /// `(call) -> response | promise<response>`; uses `call.recv`.
    ClientStreaming(Arc<dyn Fn(Arc<CallContext>) -> BoxFuture<'static, DispatchResult> + Send + Sync>),
    /// `(call) -> void | promise<void>`; uses both `call.recv`/`call.send`.
    Bidi(Arc<dyn Fn(Arc<CallContext>) -> BoxFuture<'static, DispatchResult> + Send + Sync>),
}

impl Handler {
    fn mode(&self) -> RpcMode {
        match self {
            Handler::Unary(_) => RpcMode::Unary,
            Handler::ServerStreaming(_) => RpcMode::ServerStreaming,
            Handler::ClientStreaming(_) => RpcMode::ClientStreaming,
            Handler::Bidi(_) => RpcMode::Bidi,
        }
    }

    /// Wraps this handler into the innermost [`Pipeline`] link (§4.4 step
    /// 3): "the innermost inner is a function that invokes the actual JS
    /// handler and converts its return/throw into a uniform outcome."
    /// Throw-conversion itself lives one layer up, in `bridge-quickjs`,
    /// since only it knows what a JS throw looks like; here a native
    /// handler's `Err` is already a [`GrpcError`].
    ///
    /// Unary dispatches through `Transport::invoke`, which pre-populates
    /// `call.request()`; server-streaming dispatches through `new_stream`
    /// instead (the transport treats every streaming mode identically, per
    /// `transport.rs`), where the single request arrives over the inbound
    /// queue like any other streamed message, so its handler reads it via
    /// one `call.recv()` before invoking the JS-visible function.
    fn into_innermost(self) -> Pipeline {
        match self {
            Handler::Unary(f) => Arc::new(move |call: Arc<CallContext>| {
                let f = f.clone();
                Box::pin(async move {
                    let request = call.request().cloned().ok_or_else(|| {
                        GrpcError::new(StatusCode::Internal, "unary handler invoked without a request")
                    })?;
                    f(request, call).await
                })
            }),
            Handler::ServerStreaming(f) => Arc::new(move |call: Arc<CallContext>| {
                let f = f.clone();
                Box::pin(async move {
                    let step = call.recv().await.map_err(BridgeError::into_grpc_error)?;
                    let request = step.value.ok_or_else(|| {
                        GrpcError::new(StatusCode::InvalidArgument, "stream ended before a request was sent")
                    })?;
                    f(request, call).await
                })
            }),
            Handler::ClientStreaming(f) | Handler::Bidi(f) => Arc::new(move |call: Arc<CallContext>| {
                let f = f.clone();
                Box::pin(async move { f(call).await })
            }),
        }
    }
}

/// `addService(fullName, handlerMap)` input: short name (`echo`) to
/// handler. Validated against the resolved [`ServiceDescriptor`] in
/// [`Server::add_service`].
pub type HandlerMap = HashMap<String, Handler>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ServerState {
    Configuring,
    Started,
    Stopped,
}

struct PendingService {
    descriptor: ServiceDescriptor,
    handlers: HandlerMap,
}

/// `grpc.createServer()` (§6, §4.4): `CONFIGURING -> STARTED -> STOPPED`.
/// `addService`/`addInterceptor` only in `CONFIGURING`; `start()` registers
/// every configured service with the transport; `stop()` unregisters and
/// drains.
pub struct Server {
    transport: Arc<dyn Transport>,
    state: AtomicU8,
    pending: std::sync::Mutex<Vec<PendingService>>,
    interceptors: std::sync::Mutex<Vec<Arc<dyn Interceptor>>>,
}

const CONFIGURING: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

impl Server {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Server {
            transport,
            state: AtomicU8::new(CONFIGURING),
            pending: std::sync::Mutex::new(Vec::new()),
            interceptors: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn state(&self) -> ServerState {
        match self.state.load(Ordering::SeqCst) {
            CONFIGURING => ServerState::Configuring,
            STARTED => ServerState::Started,
            _ => ServerState::Stopped,
        }
    }

    /// `addService(fullName, handlerMap)` (§4.4): resolves the service,
    /// validates every method has a handler (missing entries become
    /// UNIMPLEMENTED at call time rather than failing `addService` --
    /// handled naturally by the dispatch pipeline below, since a missing
    /// short name is simply absent from the compiled `HashMap<String,
    /// Pipeline>`), type-checks each handler's shape against the method's
    /// mode, and rejects services with short-name collisions (§4.4
    /// "Handler resolution").
    pub fn add_service(&self, registry: &dyn ProtoRegistry, full_name: &str, handlers: HandlerMap) -> Result<()> {
        if self.state() != ServerState::Configuring {
            return Err(BridgeError::InvalidState(
                "addService is only legal while the server is CONFIGURING".into(),
            ));
        }
        let descriptor = registry.resolve_service(full_name)?;

        if let Some((a, b)) = descriptor.short_name_collision() {
            return Err(BridgeError::TypeError(format!(
                "service {full_name} has methods '{a}' and '{b}' that collide under the short-name mapping"
            )));
        }

        for method in descriptor.methods() {
            if let Some(handler) = handlers.get(&method.short_name()) {
                if handler.mode() != method.mode() {
                    return Err(BridgeError::TypeError(format!(
                        "handler for '{}' has the wrong shape for its RPC mode",
                        method.short_name()
                    )));
                }
            }
        }

        // Presence of extra entries that don't correspond to any method is
        // ignored (§4.4), so we don't validate the handler map's keys
        // against the descriptor in the other direction.

        self.pending.lock().expect("pending services lock poisoned").push(PendingService { descriptor, handlers });
        Ok(())
    }

    /// `addInterceptor(fn)` (§4.4, P4, P5): appends to the ordered chain,
    /// returns `self` for chaining parity with the JS surface's `return
    /// server`.
    pub fn add_interceptor(self: &Arc<Self>, interceptor: Arc<dyn Interceptor>) -> Result<Arc<Self>> {
        if self.state() != ServerState::Configuring {
            return Err(BridgeError::InvalidState(
                "addInterceptor is only legal while the server is CONFIGURING".into(),
            ));
        }
        self.interceptors.lock().expect("interceptors lock poisoned").push(interceptor);
        Ok(self.clone())
    }

    /// `start()` (§4.4): registers every configured service's dispatch
    /// table with the transport, each wrapped by the full interceptor
    /// chain. A second `start()` fails (§4.4: "Once STARTED ... a second
    /// `start` fails").
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(CONFIGURING, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BridgeError::InvalidState("server already started".into()));
        }

        let interceptors = self.interceptors.lock().expect("interceptors lock poisoned").clone();
        let services = std::mem::take(&mut *self.pending.lock().expect("pending services lock poisoned"));

        for pending in services {
            let mut compiled: HashMap<String, Pipeline> = HashMap::new();
            let mut handlers = pending.handlers;
            for method in pending.descriptor.methods() {
                let short_name = method.short_name();
                if let Some(handler) = handlers.remove(&short_name) {
                    let innermost = handler.into_innermost();
                    compiled.insert(method.proto_name().to_string(), compose(&interceptors, innermost));
                }
            }
            self.transport.register_service(pending.descriptor, compiled);
        }
        Ok(())
    }

    /// `stop()` (§4.4): transitions to `STOPPED`. In-flight calls are left
    /// to the transport's own drain behavior (the in-process reference
    /// `Transport` has nothing to drain beyond already-spawned tasks); the
    /// server itself simply refuses further lifecycle mutation once here.
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        match self.state.compare_exchange(STARTED, STOPPED, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(()),
            Err(CONFIGURING) => Err(BridgeError::InvalidState("server has not been started".into())),
            Err(_) => Ok(()), // already stopped: idempotent
        }
    }

    #[cfg(test)]
    fn is_started(&self) -> bool {
        self.state() == ServerState::Started
    }
}

/// `UNIMPLEMENTED` outcome for a method whose short name has no handler in
/// the compiled map. The in-process `Transport` already returns this via
/// `GrpcError::unimplemented` when a wire path has no registered pipeline
/// (see `transport.rs::lookup`), so no separate codepath is needed here --
/// documented for traceability against §4.4's explicit requirement.
pub fn unimplemented_outcome(method_full_path: &str) -> DispatchResult {
    Err(GrpcError::unimplemented(method_full_path))
}
