//! Wires the `grpc` global object (§6 "JS Surface") into a freshly built
//! `rquickjs::Context`: the `status`/`metadata` namespaces, `createClient`/
//! `createServer`/`createSignal`, and the message-level `wrapMessage`/
//! `unwrapMessage`/`findDescriptor` free functions that don't belong to any
//! one namespace. `lib.rs`'s `Engine::new` is the only caller -- this module
//! just assembles what `status.rs`/`metadata.rs`/`client.rs`/`server.rs`/
//! `message.rs` already know how to build.

use std::sync::Arc;

use rquickjs::{Ctx, Function, Object, Result as JsResult, Value};

use bridge_core::descriptor::ProtoRegistry;
use bridge_core::transport::Transport;

use crate::client::{create_client, create_signal, SignalArena};
use crate::message::{to_message_input, wrap_handle};
use crate::server::{create_server, JsEngineHandle};

/// Everything a script run shares: the three arenas, the transport/registry
/// it's bound to, and the loop-hopping handle `createServer`'s adapters
/// need. `Engine` (lib.rs) owns one of these per `Context` and passes it
/// here once, at setup.
#[derive(Clone)]
pub struct GlobalsHandle {
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<dyn ProtoRegistry>,
    pub engine: JsEngineHandle,
    pub signal_arena: SignalArena,
}

/// Installs the `grpc` global (§6). Call once per `Context`, before any
/// script runs.
pub fn install<'js>(ctx: Ctx<'js>, handles: GlobalsHandle) -> JsResult<()> {
    let GlobalsHandle { transport, registry, engine, signal_arena } = handles;
    let handle_arena = engine.handle_arena.clone();
    let bag_arena = engine.bag_arena.clone();

    let grpc = Object::new(ctx.clone())?;

    grpc.set("status", crate::status::build_namespace(ctx.clone(), handle_arena.clone())?)?;
    grpc.set("metadata", crate::metadata::build_namespace(ctx.clone(), bag_arena.clone())?)?;

    {
        let transport = transport.clone();
        let registry = registry.clone();
        let handle_arena = handle_arena.clone();
        let bag_arena = bag_arena.clone();
        let signal_arena = signal_arena.clone();
        grpc.set(
            "createClient",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, service_full_name: String, opts: rquickjs::Opt<Object<'js>>| -> JsResult<Object<'js>> {
                    create_client(
                        ctx,
                        transport.clone(),
                        registry.clone(),
                        handle_arena.clone(),
                        bag_arena.clone(),
                        signal_arena.clone(),
                        service_full_name,
                        opts,
                    )
                },
            ),
        )?;
    }

    {
        let transport = transport.clone();
        let registry = registry.clone();
        let engine = engine.clone();
        grpc.set(
            "createServer",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Object<'js>> {
                create_server(ctx, transport.clone(), registry.clone(), engine.clone())
            }),
        )?;
    }

    {
        let signal_arena = signal_arena.clone();
        grpc.set(
            "createSignal",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Object<'js>> { create_signal(ctx, &signal_arena) }),
        )?;
    }

    {
        let handle_arena = handle_arena.clone();
        let registry = registry.clone();
        grpc.set(
            "wrapMessage",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, type_name: String, value: Value<'js>| -> JsResult<Value<'js>> {
                    let descriptor = crate::message::resolve_message_descriptor(&ctx, registry.as_ref(), &type_name)?;
                    let input = to_message_input(ctx.clone(), &handle_arena, value)?;
                    let native = bridge_core::message::unwrap(input, &descriptor).map_err(|e| crate::error::throw(&ctx, e.into()))?;
                    let handle = bridge_core::message::MessageHandle::wrap(native);
                    wrap_handle(ctx, &handle_arena, handle).map(|o| o.into_value())
                },
            ),
        )?;
    }

    {
        let handle_arena = handle_arena.clone();
        grpc.set(
            "unwrapMessage",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, value: Value<'js>| -> JsResult<Value<'js>> {
                let handle = match to_message_input(ctx.clone(), &handle_arena, value)? {
                    bridge_core::message::MessageInput::Handle(h) => h,
                    bridge_core::message::MessageInput::PlainObject(_) => {
                        return Err(crate::error::throw(
                            &ctx,
                            bridge_core::error::BridgeError::TypeError(
                                "unwrapMessage needs a handle from wrapMessage, not a plain object".into(),
                            )
                            .into(),
                        ));
                    }
                };
                crate::message::handle_to_plain_object(ctx, &handle)
            }),
        )?;
    }

    {
        let registry = registry.clone();
        grpc.set(
            "findDescriptor",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, full_name: String| -> JsResult<Object<'js>> {
                let descriptor = crate::message::resolve_message_descriptor(&ctx, registry.as_ref(), &full_name)?;
                let obj = Object::new(ctx.clone())?;
                obj.set("fullName", descriptor.full_name().to_string())?;
                let fields = rquickjs::Array::new(ctx.clone())?;
                for (i, field) in descriptor.fields().enumerate() {
                    fields.set(i as u32, field.name().to_string())?;
                }
                obj.set("fields", fields)?;
                Ok(obj)
            }),
        )?;
    }

    ctx.globals().set("grpc", grpc)?;
    Ok(())
}
