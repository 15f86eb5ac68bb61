//! JS half of the Client Factory (C3, §4.3, §6): `grpc.createClient(serviceFullName,
//! opts?)` returns an object with one promise-returning method per RPC,
//! keyed by lower-camelCase short name (§4.4), dispatching through
//! `bridge_core::client::Client`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rquickjs::{Ctx, Function, IntoJs, Object, Result as JsResult, Value};

use bridge_core::client::{CallOptions, Client};
use bridge_core::descriptor::{ProtoRegistry, RpcMode};
use bridge_core::message::MessageHandle;
use bridge_core::stream::Cancellation;
use bridge_core::transport::Transport;
use std::sync::Arc;

use crate::async_bridge::spawn_promise;
use crate::message::{to_message_input, wrap_handle, HandleArena};
use crate::metadata::{unwrap_bag, wrap_bag, BagArena};

const SIGNAL_MARKER: &str = "__bridgeSignal";
const SIGNAL_ID: &str = "__signalId";

/// `grpc.createClient(serviceFullName, opts?)` (§6): builds the JS object;
/// one method per RPC mode is added per resolved method, per §4.4's
/// "generated per method" shape.
pub fn create_client<'js>(
    ctx: Ctx<'js>,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ProtoRegistry>,
    handle_arena: HandleArena,
    bag_arena: BagArena,
    signal_arena: SignalArena,
    service_full_name: String,
    opts: rquickjs::Opt<Object<'js>>,
) -> JsResult<Object<'js>> {
    let mut client = Client::new(transport, registry.as_ref(), &service_full_name)
        .map_err(|e| crate::error::throw(&ctx, e.into()))?;

    if let Some(opts) = &opts.0 {
        if let Ok(md_obj) = opts.get::<_, Object>("defaultMetadata") {
            if let Some(bag) = unwrap_bag(&bag_arena, &md_obj) {
                client = client.with_default_metadata(bag);
            }
        }
    }
    let client = Rc::new(client);

    let obj = Object::new(ctx.clone())?;
    for method in client.service().methods() {
        let short_name = method.short_name();
        let mode = method.mode();
        let client = client.clone();
        let handle_arena = handle_arena.clone();
        let bag_arena = bag_arena.clone();
        let signal_arena = signal_arena.clone();
        let name_for_closure = short_name.clone();

        let function = match mode {
            RpcMode::Unary => Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, request: Value<'js>, opts: rquickjs::Opt<Object<'js>>| -> JsResult<Value<'js>> {
                    let input = to_message_input(ctx.clone(), &handle_arena, request)?;
                    let call_opts = read_call_options(&ctx, &bag_arena, &signal_arena, opts.0.as_ref())?;
                    let client = client.clone();
                    let short_name = name_for_closure.clone();
                    let handle_arena_for_conv = handle_arena.clone();
                    spawn_promise(
                        ctx,
                        async move { client.unary(&short_name, input, call_opts).await },
                        move |ctx, response: MessageHandle| wrap_handle(ctx, &handle_arena_for_conv, response).map(|o| o.into_value()),
                    )
                },
            ),
            RpcMode::ServerStreaming => {
                let input_desc = method.input();
                Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'js>, request: Value<'js>, opts: rquickjs::Opt<Object<'js>>| -> JsResult<Value<'js>> {
                        let input = to_message_input(ctx.clone(), &handle_arena, request)?;
                        let call_opts = read_call_options(&ctx, &bag_arena, &signal_arena, opts.0.as_ref())?;
                        let client = client.clone();
                        let short_name = name_for_closure.clone();
                        let handle_arena_for_stream = handle_arena.clone();
                        let input_desc = input_desc.clone();
                        spawn_promise(
                            ctx,
                            async move { client.server_streaming(&short_name, input, call_opts).await },
                            move |ctx, stream| {
                                wrap_client_stream(ctx, &handle_arena_for_stream, stream, input_desc).map(|o| o.into_value())
                            },
                        )
                    },
                )
            }
            RpcMode::ClientStreaming => {
                let input_desc = method.input();
                Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'js>, opts: rquickjs::Opt<Object<'js>>| -> JsResult<Object<'js>> {
                        let call_opts = read_call_options(&ctx, &bag_arena, &signal_arena, opts.0.as_ref())?;
                        let client = client.clone();
                        let short_name = name_for_closure.clone();
                        let stream = futures_block_on_loop(&ctx, client.client_streaming(&short_name, call_opts))?;
                        wrap_client_stream(ctx, &handle_arena, stream, input_desc.clone())
                    },
                )
            }
            RpcMode::Bidi => {
                let input_desc = method.input();
                Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'js>, opts: rquickjs::Opt<Object<'js>>| -> JsResult<Object<'js>> {
                        let call_opts = read_call_options(&ctx, &bag_arena, &signal_arena, opts.0.as_ref())?;
                        let client = client.clone();
                        let short_name = name_for_closure.clone();
                        let stream = futures_block_on_loop(&ctx, client.bidi(&short_name, call_opts))?;
                        wrap_client_stream(ctx, &handle_arena, stream, input_desc.clone())
                    },
                )
            }
        };
        obj.set(short_name.as_str(), function)?;
    }

    Ok(obj)
}

/// Client-streaming/bidi opening (§4.3) has no await point a script
/// observes -- it returns the `StreamController` synchronously, not a
/// promise. Since we're already on the loop thread, opening the stream
/// involves no cross-thread hop either, so this just polls the (already-
/// ready) future to completion rather than spawning it.
fn futures_block_on_loop<'js, T>(
    ctx: &Ctx<'js>,
    fut: impl std::future::Future<Output = bridge_core::error::Result<T>>,
) -> JsResult<T> {
    // `new_stream` only awaits cheap, already-resolved local state (channel
    // creation, no network round trip -- see `transport.rs`), so driving it
    // with a trivial inline executor is sound here without pulling in
    // `futures::executor::block_on`, which assumes off-loop blocking is
    // acceptable.
    let mut fut = Box::pin(fut);
    let waker = futures::task::noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);
    loop {
        match fut.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(result) => {
                return result.map_err(|e| crate::error::throw(ctx, e.into()));
            }
            std::task::Poll::Pending => std::thread::yield_now(),
        }
    }
}

/// Builds the JS `StreamController` object (§3, §4.3):
/// `send/end/recv/response/cancel`. `input_desc` is the method's input
/// message type, the same descriptor `Client::unary` resolves against for
/// non-streaming calls -- `ClientStream::send` needs it to accept a plain
/// object exactly as its own doc comment promises, not only a handle
/// already wrapped via `wrapMessage`.
fn wrap_client_stream<'js>(
    ctx: Ctx<'js>,
    handle_arena: &HandleArena,
    stream: bridge_core::client::ClientStream,
    input_desc: prost_reflect::MessageDescriptor,
) -> JsResult<Object<'js>> {
    let stream = Rc::new(stream);
    let obj = Object::new(ctx.clone())?;

    let s = stream.clone();
    let arena = handle_arena.clone();
    let desc = input_desc.clone();
    obj.set(
        "send",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, msg: Value<'js>| -> JsResult<Value<'js>> {
            let input = to_message_input(ctx.clone(), &arena, msg)?;
            let s = s.clone();
            let desc = desc.clone();
            // `send` resolves once accepted into the outbound buffer (§4.3
            // backpressure), not once the peer acknowledges it.
            spawn_promise(ctx, async move { s.send(input, &desc).await }, |ctx, ()| Ok(Value::new_undefined(ctx)))
        }),
    )?;

    let s = stream.clone();
    obj.set("end", Function::new(ctx.clone(), move || s.end()))?;

    let s = stream.clone();
    let arena = handle_arena.clone();
    obj.set(
        "recv",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Value<'js>> {
            let s = s.clone();
            let arena = arena.clone();
            spawn_promise(ctx, async move { s.recv().await }, move |ctx, step| recv_step_to_js(ctx, &arena, step))
        }),
    )?;

    let s = stream.clone();
    let arena = handle_arena.clone();
    obj.set(
        "response",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Value<'js>> {
            let s = s.clone();
            let arena = arena.clone();
            spawn_promise(ctx, async move { s.response().await }, move |ctx, handle| {
                wrap_handle(ctx, &arena, handle).map(|o| o.into_value())
            })
        }),
    )?;

    let s = stream.clone();
    obj.set("cancel", Function::new(ctx.clone(), move || s.cancel()))?;

    Ok(obj)
}

fn recv_step_to_js<'js>(ctx: Ctx<'js>, arena: &HandleArena, step: bridge_core::stream::RecvStep) -> JsResult<Value<'js>> {
    let result = Object::new(ctx.clone())?;
    match step.value {
        Some(handle) => result.set("value", wrap_handle(ctx.clone(), arena, handle)?)?,
        None => result.set("value", Value::new_undefined(ctx.clone()))?,
    }
    result.set("done", step.done)?;
    result.into_js(&ctx)
}

/// Reads `opts` (§4.3, §9 "Configuration surface"): `metadata`,
/// `deadlineMs` (relative, converted to an absolute `Instant` here since
/// "now" is a wall-clock concept `bridge-core` deliberately stays above),
/// `onHeader`/`onTrailer`, `signal`.
fn read_call_options<'js>(
    ctx: &Ctx<'js>,
    bag_arena: &BagArena,
    signal_arena: &SignalArena,
    opts: Option<&Object<'js>>,
) -> JsResult<CallOptions> {
    let mut call_opts = CallOptions::new();
    let Some(opts) = opts else { return Ok(call_opts) };

    if let Ok(md_obj) = opts.get::<_, Object>("metadata") {
        call_opts.metadata = unwrap_bag(bag_arena, &md_obj);
    }
    if let Ok(ms) = opts.get::<_, f64>("deadlineMs") {
        call_opts.deadline = Some(Instant::now() + Duration::from_millis(ms.max(0.0) as u64));
    }
    if let Ok(cb) = opts.get::<_, Function>("onHeader") {
        let ctx = ctx.clone();
        let bag_arena = bag_arena.clone();
        call_opts.on_header = Some(Box::new(move |md| {
            if let Ok(obj) = wrap_bag(ctx.clone(), &bag_arena, md) {
                let _ = cb.call::<_, ()>((obj,));
            }
        }));
    }
    if let Ok(cb) = opts.get::<_, Function>("onTrailer") {
        let ctx = ctx.clone();
        let bag_arena = bag_arena.clone();
        call_opts.on_trailer = Some(Box::new(move |md| {
            if let Ok(obj) = wrap_bag(ctx.clone(), &bag_arena, md) {
                let _ = cb.call::<_, ()>((obj,));
            }
        }));
    }
    if let Ok(signal_obj) = opts.get::<_, Object>("signal") {
        if signal_obj.get::<_, bool>(SIGNAL_MARKER).unwrap_or(false) {
            if let Ok(id) = signal_obj.get::<_, u32>(SIGNAL_ID) {
                call_opts.signal = signal_arena.get(id);
            }
        }
    }
    Ok(call_opts)
}

/// Append-only store for `Cancellation` tokens a script holds a live
/// `signal` reference to, same shape as [`crate::message::HandleArena`].
#[derive(Clone)]
pub struct SignalArena(Rc<RefCell<Vec<Cancellation>>>);

impl SignalArena {
    pub fn new() -> Self {
        SignalArena(Rc::new(RefCell::new(Vec::new())))
    }

    fn insert(&self, cancellation: Cancellation) -> u32 {
        let mut slots = self.0.borrow_mut();
        slots.push(cancellation);
        (slots.len() - 1) as u32
    }

    fn get(&self, id: u32) -> Option<Cancellation> {
        self.0.borrow().get(id as usize).cloned()
    }
}

impl Default for SignalArena {
    fn default() -> Self {
        SignalArena::new()
    }
}

/// `grpc.createSignal()` (§4.3 `opts.signal`, §5 "Cancellation"): a plain
/// object wrapping a `Cancellation`, exposing `cancel()`/`cancelled()`.
pub fn create_signal<'js>(ctx: Ctx<'js>, arena: &SignalArena) -> JsResult<Object<'js>> {
    let id = arena.insert(Cancellation::new());
    let obj = Object::new(ctx.clone())?;
    obj.set(SIGNAL_MARKER, true)?;
    obj.set(SIGNAL_ID, id)?;

    let a = arena.clone();
    obj.set(
        "cancel",
        Function::new(ctx.clone(), move || {
            if let Some(c) = a.get(id) {
                c.cancel();
            }
        }),
    )?;
    let a = arena.clone();
    obj.set(
        "cancelled",
        Function::new(ctx.clone(), move || -> bool { a.get(id).map(|c| c.is_cancelled()).unwrap_or(false) }),
    )?;
    Ok(obj)
}
