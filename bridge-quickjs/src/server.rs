//! JS half of the Server Registry (C4) and Interceptor Chain (C6) (§4.4,
//! §4.6, §6): `grpc.createServer()`, the call-context object (C5) a
//! handler/interceptor sees, and the adapters that let a plain JS function
//! stand in for a native `bridge_core::server::Handler` /
//! `bridge_core::interceptor::Interceptor`.
//!
//! The tension this module exists to resolve: `Handler`/`Interceptor` in
//! `bridge-core` are `Send + Sync` and produce a `BoxFuture<'static, ...>`
//! that the in-process `Transport` polls from a `tokio::spawn` task -- a
//! thread with no QuickJS `Context` and no business touching one (§5
//! "Cross-thread boundary"). Every JS value (the stored `Function`, the
//! `HandleArena`/`BagArena`) only makes sense on the loop thread. So the
//! `Send` future handed back to `bridge-core` never touches any of that
//! directly: it submits a `TaskThunk` onto the `LoopHandle` and awaits a
//! oneshot the thunk fills in once the call into JS (and whatever promise it
//! returns) has actually settled, on the thread that owns it.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use rquickjs::{Ctx, Function, IntoJs, Object, Persistent, Result as JsResult, Value};
use tokio::sync::oneshot;

use bridge_core::call_context::CallContext;
use bridge_core::descriptor::{ProtoRegistry, RpcMode};
use bridge_core::error::{BridgeError, GrpcError};
use bridge_core::eventloop::LoopHandle;
use bridge_core::interceptor::{DispatchResult, HandlerOutcome, Interceptor, Pipeline};
use bridge_core::message::MessageHandle;
use bridge_core::server::{Handler, HandlerMap, Server};
use bridge_core::status::StatusCode;
use bridge_core::transport::Transport;

use crate::async_bridge::spawn_promise;
use crate::message::{to_message_input, wrap_handle, HandleArena};
use crate::metadata::{unwrap_bag, wrap_bag, BagArena};

/// Lets a bundle of loop-thread-only state (`rquickjs::Context`, a
/// `Persistent<Function>`, the `Rc`-based arenas) cross the
/// `Arc<dyn Fn(...) + Send + Sync>` boundary `Handler`/`Interceptor`
/// require. Sound only by construction: every `JsHandlerState` this crate
/// builds is read exclusively from inside a `TaskThunk` already running on
/// the loop thread (§5 P10) -- never from the thread that happens to call
/// `submit`. Nothing here makes that true on its own; it is the same
/// invariant `eventloop::assert_on_loop` checks for at runtime in debug
/// builds elsewhere in this crate's call paths.
struct LoopAffine<T>(T);

unsafe impl<T> Send for LoopAffine<T> {}
unsafe impl<T> Sync for LoopAffine<T> {}

impl<T> LoopAffine<T> {
    fn get(&self) -> &T {
        &self.0
    }
}

/// Everything a `JsHandler`/`JsInterceptor` needs once it is actually
/// running on the loop thread.
#[derive(Clone)]
struct JsHandlerState {
    context: rquickjs::Context,
    handle_arena: HandleArena,
    bag_arena: BagArena,
    func: Persistent<Function<'static>>,
}

/// Bundles a [`JsHandlerState`] with the `LoopHandle` needed to get there.
/// `loop_handle` is genuinely `Send`/`Sync` on its own (it is an mpsc
/// sender); only `js` needs the `LoopAffine` escape hatch.
struct HandlerCell {
    loop_handle: LoopHandle,
    js: LoopAffine<JsHandlerState>,
}

fn make_cell(engine: &JsEngineHandle, func: Function<'_>) -> JsResult<Arc<HandlerCell>> {
    let persisted = Persistent::save(func.ctx().clone(), func);
    Ok(Arc::new(HandlerCell {
        loop_handle: engine.loop_handle.clone(),
        js: LoopAffine(JsHandlerState {
            context: engine.context.clone(),
            handle_arena: engine.handle_arena.clone(),
            bag_arena: engine.bag_arena.clone(),
            func: persisted,
        }),
    }))
}

/// Everything `create_client`/`create_server` need from the owning
/// `Engine` (lib.rs) to build loop-hopping adapters: the loop itself, the
/// live `Context`, and the two arenas a call-context object needs to wrap
/// messages and metadata.
#[derive(Clone)]
pub struct JsEngineHandle {
    pub loop_handle: LoopHandle,
    pub context: rquickjs::Context,
    pub handle_arena: HandleArena,
    pub bag_arena: BagArena,
}

/// `grpc.createServer()` (§4.4, §6): builds the JS object exposing
/// `addService`/`addInterceptor`/`start`/`stop`, all returning the server
/// object itself for chaining, mirroring `Server::add_interceptor`'s own
/// `-> Result<Arc<Self>>` shape.
pub fn create_server<'js>(
    ctx: Ctx<'js>,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ProtoRegistry>,
    engine: JsEngineHandle,
) -> JsResult<Object<'js>> {
    let server = Server::new(transport);
    let obj = Object::new(ctx.clone())?;

    {
        let server = server.clone();
        let registry = registry.clone();
        let engine = engine.clone();
        let self_obj = obj.clone();
        obj.set(
            "addService",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, full_name: String, handlers: Object<'js>| -> JsResult<Value<'js>> {
                    let descriptor = registry
                        .resolve_service(&full_name)
                        .map_err(|e| crate::error::throw(&ctx, e.into()))?;

                    let mut map = HandlerMap::new();
                    for method in descriptor.methods() {
                        let short_name = method.short_name();
                        let Ok(func) = handlers.get::<_, Function>(short_name.as_str()) else {
                            continue;
                        };
                        let cell = make_cell(&engine, func)?;
                        let handler = match method.mode() {
                            RpcMode::Unary => Handler::Unary(unary_fn(cell)),
                            RpcMode::ServerStreaming => Handler::ServerStreaming(server_streaming_fn(cell)),
                            RpcMode::ClientStreaming => Handler::ClientStreaming(client_streaming_fn(cell)),
                            RpcMode::Bidi => Handler::Bidi(bidi_fn(cell)),
                        };
                        map.insert(short_name, handler);
                    }

                    server
                        .add_service(registry.as_ref(), &full_name, map)
                        .map_err(|e| crate::error::throw(&ctx, e.into()))?;
                    Ok(self_obj.clone().into_value())
                },
            ),
        )?;
    }

    {
        let server = server.clone();
        let engine = engine.clone();
        let self_obj = obj.clone();
        obj.set(
            "addInterceptor",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, func: Function<'js>| -> JsResult<Value<'js>> {
                let cell = make_cell(&engine, func)?;
                server
                    .add_interceptor(Arc::new(JsInterceptor { cell }))
                    .map_err(|e| crate::error::throw(&ctx, e.into()))?;
                Ok(self_obj.clone().into_value())
            }),
        )?;
    }

    {
        let server = server.clone();
        let self_obj = obj.clone();
        obj.set(
            "start",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Value<'js>> {
                server.start().map_err(|e| crate::error::throw(&ctx, e.into()))?;
                Ok(self_obj.clone().into_value())
            }),
        )?;
    }

    {
        let self_obj = obj.clone();
        obj.set(
            "stop",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Value<'js>> {
                server.stop().map_err(|e| crate::error::throw(&ctx, e.into()))?;
                Ok(self_obj.clone().into_value())
            }),
        )?;
    }

    Ok(obj)
}

fn unary_fn(cell: Arc<HandlerCell>) -> Arc<dyn Fn(MessageHandle, Arc<CallContext>) -> bridge_core::interceptor::BoxFuture<'static, DispatchResult> + Send + Sync> {
    Arc::new(move |request, call| {
        let cell = cell.clone();
        Box::pin(dispatch(cell, Some(request), call))
    })
}

fn server_streaming_fn(cell: Arc<HandlerCell>) -> Arc<dyn Fn(MessageHandle, Arc<CallContext>) -> bridge_core::interceptor::BoxFuture<'static, DispatchResult> + Send + Sync> {
    Arc::new(move |request, call| {
        let cell = cell.clone();
        Box::pin(dispatch(cell, Some(request), call))
    })
}

fn client_streaming_fn(cell: Arc<HandlerCell>) -> Arc<dyn Fn(Arc<CallContext>) -> bridge_core::interceptor::BoxFuture<'static, DispatchResult> + Send + Sync> {
    Arc::new(move |call| {
        let cell = cell.clone();
        Box::pin(dispatch(cell, None, call))
    })
}

fn bidi_fn(cell: Arc<HandlerCell>) -> Arc<dyn Fn(Arc<CallContext>) -> bridge_core::interceptor::BoxFuture<'static, DispatchResult> + Send + Sync> {
    Arc::new(move |call| {
        let cell = cell.clone();
        Box::pin(dispatch(cell, None, call))
    })
}

/// Hops onto the loop thread, invokes the wrapped JS function, and hops
/// back with a [`DispatchResult`] -- the one codepath all four `Handler`
/// variants share (§4.4 step 3: "the innermost inner ... converts its
/// return/throw into a uniform outcome").
async fn dispatch(cell: Arc<HandlerCell>, request: Option<MessageHandle>, call: Arc<CallContext>) -> DispatchResult {
    let (tx, rx) = oneshot::channel::<DispatchResult>();
    let loop_handle = cell.loop_handle.clone();
    loop_handle.submit(Box::new(move || {
        Box::pin(async move {
            let state = cell.js.get().clone();
            let outcome = run_handler(state, request, call).await;
            let _ = tx.send(outcome);
        })
    }));
    rx.await.unwrap_or_else(|_| Err(GrpcError::new(StatusCode::Internal, "server handler task was dropped before producing a result")))
}

async fn run_handler(state: JsHandlerState, request: Option<MessageHandle>, call: Arc<CallContext>) -> DispatchResult {
    let JsHandlerState { context, handle_arena, bag_arena, func } = state;
    rquickjs::async_with!(context => |ctx| {
        async move {
            let invoke = || -> JsResult<Value> {
                let f = func.clone().restore(&ctx)?;
                let call_obj = wrap_call_context(ctx.clone(), &context, &handle_arena, &bag_arena, call.clone())?;
                match &request {
                    Some(req) => {
                        let req_obj = wrap_handle(ctx.clone(), &handle_arena, req.clone())?;
                        f.call((req_obj, call_obj))
                    }
                    None => f.call((call_obj,)),
                }
            };
            let settled = match invoke() {
                Ok(value) => await_js_value(ctx.clone(), value).await,
                Err(e) => Err(e),
            };
            match settled {
                Ok(value) if value.is_undefined() || value.is_null() => Ok(HandlerOutcome::Completed),
                Ok(value) => value_to_response_handle(&handle_arena, &value)
                    .map(HandlerOutcome::Response)
                    .map_err(BridgeError::into_grpc_error),
                Err(e) => Err(js_err_to_grpc(&ctx, e)),
            }
        }
    }).await
}

/// Adapts a JS interceptor function -- `(call, next) -> result |
/// promise<result>` (§3, §4.6) -- into a native [`Interceptor`]. `next` is
/// exposed as a JS function that ignores whatever it's called with and
/// always forwards the original `call` (an interceptor is never meant to
/// substitute a different call object for the rest of the chain); calling
/// it returns a real promise wrapping the composed inner `Pipeline`.
struct JsInterceptor {
    cell: Arc<HandlerCell>,
}

#[async_trait]
impl Interceptor for JsInterceptor {
    async fn call(&self, call: Arc<CallContext>, next: Pipeline) -> DispatchResult {
        let (tx, rx) = oneshot::channel::<DispatchResult>();
        let loop_handle = self.cell.loop_handle.clone();
        let cell = self.cell.clone();
        loop_handle.submit(Box::new(move || {
            Box::pin(async move {
                let state = cell.js.get().clone();
                let outcome = run_interceptor(state, call, next).await;
                let _ = tx.send(outcome);
            })
        }));
        rx.await.unwrap_or_else(|_| Err(GrpcError::new(StatusCode::Internal, "interceptor task was dropped before producing a result")))
    }
}

async fn run_interceptor(state: JsHandlerState, call: Arc<CallContext>, next: Pipeline) -> DispatchResult {
    let JsHandlerState { context, handle_arena, bag_arena, func } = state;
    rquickjs::async_with!(context => |ctx| {
        async move {
            let invoked = Rc::new(Cell::new(false));

            let next_fn = {
                let invoked = invoked.clone();
                let next = next.clone();
                let handle_arena = handle_arena.clone();
                let call_for_next = call.clone();
                Function::new(ctx.clone(), move |ctx: Ctx<'_>, _call_arg: rquickjs::Opt<Value<'_>>| -> JsResult<Value<'_>> {
                    invoked.set(true);
                    let next = next.clone();
                    let call = call_for_next.clone();
                    let handle_arena = handle_arena.clone();
                    spawn_promise(
                        ctx,
                        async move { next(call).await.map_err(bridge_core::error::BridgeError::Grpc) },
                        move |ctx, outcome| handler_outcome_to_js(ctx, &handle_arena, outcome),
                    )
                })
            };

            let invoke = || -> JsResult<Value> {
                let f = func.clone().restore(&ctx)?;
                let call_obj = wrap_call_context(ctx.clone(), &context, &handle_arena, &bag_arena, call.clone())?;
                f.call((call_obj, next_fn.clone()))
            };
            let settled = match invoke() {
                Ok(value) => await_js_value(ctx.clone(), value).await,
                Err(e) => Err(e),
            };

            match settled {
                Ok(value) if value.is_undefined() || value.is_null() => {
                    if invoked.get() {
                        Ok(HandlerOutcome::Completed)
                    } else {
                        Err(GrpcError::new(
                            StatusCode::Internal,
                            "interceptor returned without calling next() or producing its own response",
                        ))
                    }
                }
                Ok(value) => value_to_response_handle(&handle_arena, &value)
                    .map(HandlerOutcome::Response)
                    .map_err(BridgeError::into_grpc_error),
                Err(e) => Err(js_err_to_grpc(&ctx, e)),
            }
        }
    }).await
}

fn handler_outcome_to_js<'js>(ctx: Ctx<'js>, arena: &HandleArena, outcome: HandlerOutcome) -> JsResult<Value<'js>> {
    match outcome {
        HandlerOutcome::Response(handle) => wrap_handle(ctx, arena, handle).map(|o| o.into_value()),
        HandlerOutcome::Completed => Ok(Value::new_undefined(ctx)),
    }
}

/// If `value` is a promise (a JS handler/interceptor is free to return one
/// per §4.4/§4.6), awaits it to resolution; otherwise passes it through
/// unchanged. A rejected promise surfaces the same way a synchronous throw
/// does, as an `Err` a caller converts with [`js_err_to_grpc`].
async fn await_js_value<'js>(ctx: Ctx<'js>, value: Value<'js>) -> JsResult<Value<'js>> {
    match value.as_promise() {
        Some(promise) => promise.clone().into_future::<Value<'js>>().await,
        None => Ok(value),
    }
}

fn value_to_response_handle(arena: &HandleArena, value: &Value<'_>) -> bridge_core::error::Result<MessageHandle> {
    let obj = value
        .as_object()
        .ok_or_else(|| BridgeError::TypeError("handler must resolve to a wrapped response message".into()))?;
    if !obj.get::<_, bool>("__bridgeMessageHandle").unwrap_or(false) {
        return Err(BridgeError::TypeError("handler response is not a wrapped message".into()));
    }
    let id: u32 = obj
        .get("__handleId")
        .map_err(|_| BridgeError::TypeError("malformed wrapped message".into()))?;
    arena
        .peek(id)
        .ok_or_else(|| BridgeError::InvalidState("wrapped message handle no longer live".into()))
}

/// Converts a thrown `rquickjs::Error` into a `GrpcError` (§4.1, §7): a
/// thrown `GrpcError`-shaped object (built via `grpc.status.createError` or
/// propagated from a failed native call) carries its `code`/`message`
/// straight through; anything else becomes `UNKNOWN` with the script's own
/// string form, and a non-exception engine fault becomes `INTERNAL`.
fn js_err_to_grpc(ctx: &Ctx<'_>, err: rquickjs::Error) -> GrpcError {
    if matches!(err, rquickjs::Error::Exception) {
        let thrown = ctx.catch();
        if let Some(obj) = thrown.as_object() {
            if let (Ok(code), Ok(message)) = (obj.get::<_, i32>("code"), obj.get::<_, String>("message")) {
                return GrpcError::new(StatusCode::from_i32(code), message);
            }
            // A plain `throw new Error(...)` has no `code`, but `.message`
            // is still an own property carrying the script's string form.
            if let Ok(message) = obj.get::<_, String>("message") {
                return GrpcError::new(StatusCode::Unknown, message);
            }
        }
        let message = thrown
            .as_string()
            .and_then(|s| s.to_string().ok())
            .unwrap_or_else(|| "unknown script error".to_string());
        return GrpcError::new(StatusCode::Unknown, message);
    }
    GrpcError::new(StatusCode::Internal, err.to_string())
}

/// Builds the JS `CallContext` object (C5, §3, §4.5) a server handler or
/// interceptor sees: `method`/`requestHeader`/`deadlineMs` as plain
/// snapshots taken once, `setHeader`/`setTrailer`/`send`/`end`/`recv`/
/// `cancelled`/`onCancelled` as functions closing over the shared
/// `Arc<CallContext>`.
fn wrap_call_context<'js>(
    ctx: Ctx<'js>,
    context: &rquickjs::Context,
    handle_arena: &HandleArena,
    bag_arena: &BagArena,
    call: Arc<CallContext>,
) -> JsResult<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("method", call.method().to_string())?;

    match call.request_header() {
        Some(header) => obj.set("requestHeader", wrap_bag(ctx.clone(), bag_arena, header.clone())?)?,
        None => obj.set("requestHeader", Value::new_null(ctx.clone()))?,
    }

    match call.deadline() {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now()).as_millis() as f64;
            obj.set("deadlineMs", remaining)?;
        }
        None => obj.set("deadlineMs", Value::new_null(ctx.clone()))?,
    }

    {
        let bag_arena = bag_arena.clone();
        let call = call.clone();
        obj.set(
            "setHeader",
            Function::new(ctx.clone(), move |md: Object<'js>| {
                if let Some(bag) = unwrap_bag(&bag_arena, &md) {
                    call.set_header(bag);
                }
            }),
        )?;
    }

    {
        let bag_arena = bag_arena.clone();
        let call = call.clone();
        obj.set(
            "setTrailer",
            Function::new(ctx.clone(), move |md: Object<'js>| {
                if let Some(bag) = unwrap_bag(&bag_arena, &md) {
                    call.set_trailer(bag);
                }
            }),
        )?;
    }

    {
        let handle_arena = handle_arena.clone();
        let call = call.clone();
        obj.set(
            "send",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, msg: Value<'js>| -> JsResult<Value<'js>> {
                let input = to_message_input(ctx.clone(), &handle_arena, msg)?;
                let call = call.clone();
                spawn_promise(
                    ctx,
                    async move {
                        let handle = match input {
                            bridge_core::message::MessageInput::Handle(h) => h,
                            bridge_core::message::MessageInput::PlainObject(_) => {
                                return Err(BridgeError::TypeError(
                                    "send() needs a message already wrapped via wrapMessage, not a plain object".into(),
                                ));
                            }
                        };
                        call.send(handle).await
                    },
                    |ctx, ()| Ok(Value::new_undefined(ctx)),
                )
            }),
        )?;
    }

    {
        let call = call.clone();
        obj.set("end", Function::new(ctx.clone(), move || call.end()))?;
    }

    {
        let handle_arena = handle_arena.clone();
        let call = call.clone();
        obj.set(
            "recv",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Value<'js>> {
                let call = call.clone();
                let handle_arena = handle_arena.clone();
                spawn_promise(ctx, async move { call.recv().await }, move |ctx, step| {
                    let result = Object::new(ctx.clone())?;
                    match step.value {
                        Some(handle) => result.set("value", wrap_handle(ctx.clone(), &handle_arena, handle)?)?,
                        None => result.set("value", Value::new_undefined(ctx.clone()))?,
                    }
                    result.set("done", step.done)?;
                    result.into_js(&ctx)
                })
            }),
        )?;
    }

    {
        let call = call.clone();
        obj.set("cancelled", Function::new(ctx.clone(), move || -> bool { call.cancelled() }))?;
    }

    {
        let call = call.clone();
        let context = context.clone();
        obj.set(
            "onCancelled",
            Function::new(ctx.clone(), move |cb: Function<'js>| {
                let call = call.clone();
                let context = context.clone();
                let persisted = Persistent::save(cb.ctx().clone(), cb);
                tokio::task::spawn_local(async move {
                    call.on_cancelled().await;
                    let _: JsResult<()> = rquickjs::async_with!(context => |ctx| {
                        async move {
                            let f = persisted.clone().restore(&ctx)?;
                            f.call::<_, ()>(())
                        }
                    })
                    .await;
                });
            }),
        )?;
    }

    Ok(obj)
}
