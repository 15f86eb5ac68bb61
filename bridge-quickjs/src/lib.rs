//! `bridge-quickjs`: the QuickJS binding over `bridge-core`'s engine-agnostic
//! Status & Metadata (C1), Message Bridge (C2), Client Factory (C3), Server
//! Registry (C4), Call Context (C5), and Interceptor Chain (C6). [`Engine`]
//! is the crate's one public entry point: it owns the loop thread, the live
//! `rquickjs::Context`, and the arenas every wrapped JS value indexes into,
//! and is where a script actually gets loaded and run.

pub mod async_bridge;
pub mod client;
pub mod error;
pub mod globals;
pub mod message;
pub mod metadata;
pub mod server;
pub mod status;

use std::sync::Arc;

use bridge_core::descriptor::ProtoRegistry;
use bridge_core::eventloop::{LocalLoop, LoopHandle};
use bridge_core::transport::Transport;

use client::SignalArena;
use globals::GlobalsHandle;
use message::HandleArena;
use metadata::BagArena;
use server::JsEngineHandle;

/// Crate-level error type: a script load/run failure, or anything
/// `error::JsBridgeError` already covers.
pub type Result<T> = std::result::Result<T, error::JsBridgeError>;

/// Owns one script run's worth of engine state (§5 "Scheduling model": all
/// JS-visible state lives behind the loop thread for the life of the
/// engine). Built once per embedding; `run_file`/`run_source` submit script
/// execution onto the loop the same way every native call dispatches
/// through it, so a script loaded after `grpc.createServer().start()` sees
/// the same single-threaded ordering guarantees as one loaded first.
pub struct Engine {
    loop_: LocalLoop,
    context: rquickjs::Context,
    handle_arena: HandleArena,
    bag_arena: BagArena,
    signal_arena: SignalArena,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ProtoRegistry>,
}

impl Engine {
    /// Spins up the dedicated loop thread, builds a fresh QuickJS runtime
    /// and context on it, and installs the `grpc` global (§6). `transport`
    /// and `registry` are the two external collaborators (§1) this
    /// embedding binds the script to -- typically `InProcessTransport`/
    /// `DescriptorPoolRegistry` for tests, or whatever fronts the real Go
    /// transport and its descriptor source in production.
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<dyn ProtoRegistry>) -> Result<Self> {
        let loop_ = LocalLoop::spawn();
        let loop_handle = loop_.handle();

        let context = build_context_on_loop(&loop_handle)?;

        let handle_arena = HandleArena::new();
        let bag_arena = BagArena::new();
        let signal_arena = SignalArena::new();

        let engine_handle =
            JsEngineHandle { loop_handle: loop_handle.clone(), context: context.clone(), handle_arena: handle_arena.clone(), bag_arena: bag_arena.clone() };

        install_globals_on_loop(
            &loop_handle,
            context.clone(),
            GlobalsHandle {
                transport: transport.clone(),
                registry: registry.clone(),
                engine: engine_handle,
                signal_arena: signal_arena.clone(),
            },
        )?;

        Ok(Engine { loop_, context, handle_arena, bag_arena, signal_arena, transport, registry })
    }

    /// A fresh [`JsEngineHandle`], for constructing additional server/client
    /// adapters outside of a script's own `grpc.*` calls (e.g. a host
    /// embedding that drives `createServer` from native code rather than
    /// from a loaded script).
    pub fn handle(&self) -> JsEngineHandle {
        JsEngineHandle {
            loop_handle: self.loop_.handle(),
            context: self.context.clone(),
            handle_arena: self.handle_arena.clone(),
            bag_arena: self.bag_arena.clone(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn registry(&self) -> Arc<dyn ProtoRegistry> {
        self.registry.clone()
    }

    /// Loads and runs `source` (named `path` for error messages) on the loop
    /// thread, blocking the calling thread until the top-level script body
    /// has finished executing. A script that wants to wait for its own
    /// async work (e.g. a client call) before returning should make its
    /// last top-level expression a promise, e.g. wrap the body in
    /// `(async () => { ... })()`; `run_source` awaits that promise the same
    /// way a handler's or interceptor's returned promise is awaited
    /// (`server.rs`'s `await_js_value`). A script that doesn't return a
    /// promise only gets its synchronous top-level evaluated; anything a
    /// prior `grpc.createServer().start()` scheduled keeps running on the
    /// loop thread regardless.
    pub fn run_source(&self, path: &str, source: &str) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();
        let context = self.context.clone();
        let path = path.to_string();
        let source = source.to_string();

        self.loop_.handle().submit(Box::new(move || {
            Box::pin(async move {
                let result = rquickjs::async_with!(context => |ctx| {
                    async move {
                        match ctx.eval::<rquickjs::Value, _>(source.as_bytes()) {
                            Ok(value) => match value.as_promise() {
                                Some(promise) => promise
                                    .clone()
                                    .into_future::<rquickjs::Value>()
                                    .await
                                    .map(|_| ())
                                    .map_err(|e| format!("{path}: {e}")),
                                None => Ok(()),
                            },
                            Err(e) => Err(format!("{path}: {e}")),
                        }
                    }
                })
                .await;
                let _ = tx.send(result);
            })
        }));

        rx.recv()
            .map_err(|_| error::JsBridgeError::TypeError("bridge loop thread terminated before responding".into()))?
            .map_err(|msg| error::JsBridgeError::TypeError(msg))
    }

    /// Convenience over [`Self::run_source`] for a script already on disk.
    pub fn run_file(&self, path: &str) -> Result<()> {
        let source = std::fs::read_to_string(path).map_err(bridge_core::error::BridgeError::from)?;
        self.run_source(path, &source)
    }
}

/// `rquickjs::Context`/`Runtime` are only safe to build and touch from the
/// thread that will own them (§5 P10); `Context::full` additionally wants
/// to run inside whatever executor ends up driving its promise jobs, so
/// construction itself is submitted onto the loop rather than done here on
/// the calling thread.
fn build_context_on_loop(loop_handle: &LoopHandle) -> Result<rquickjs::Context> {
    let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<rquickjs::Context, String>>();
    loop_handle.submit(Box::new(move || {
        Box::pin(async move {
            let built = rquickjs::Runtime::new()
                .map_err(|e| e.to_string())
                .and_then(|rt| rquickjs::Context::full(&rt).map_err(|e| e.to_string()));
            let _ = tx.send(built);
        })
    }));
    rx.recv()
        .map_err(|_| error::JsBridgeError::TypeError("bridge loop thread terminated before responding".into()))?
        .map_err(error::JsBridgeError::TypeError)
}

fn install_globals_on_loop(loop_handle: &LoopHandle, context: rquickjs::Context, handles: GlobalsHandle) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();
    loop_handle.submit(Box::new(move || {
        Box::pin(async move {
            let result = context.with(|ctx| globals::install(ctx, handles).map_err(|e| e.to_string()));
            let _ = tx.send(result);
        })
    }));
    rx.recv()
        .map_err(|_| error::JsBridgeError::TypeError("bridge loop thread terminated before responding".into()))?
        .map_err(error::JsBridgeError::TypeError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::descriptor::DescriptorPoolRegistry;
    use bridge_core::transport::InProcessTransport;
    use prost_reflect::DescriptorPool;
    use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet};

    fn empty_pool() -> DescriptorPool {
        let fds = FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some("empty.proto".into()),
                package: Some("testgrpc".into()),
                message_type: vec![DescriptorProto {
                    name: Some("Empty".into()),
                    field: vec![FieldDescriptorProto {
                        name: Some("n".into()),
                        number: Some(1),
                        r#type: Some(5),
                        label: Some(1),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        DescriptorPool::from_file_descriptor_set(fds).unwrap()
    }

    fn test_engine() -> Engine {
        let transport = Arc::new(InProcessTransport::new());
        let registry = Arc::new(DescriptorPoolRegistry::new(empty_pool()));
        Engine::new(transport, registry).unwrap()
    }

    #[test]
    fn grpc_global_is_installed() {
        let engine = test_engine();
        engine.run_source("test", "if (typeof grpc !== 'object') throw new Error('missing grpc global');").unwrap();
    }

    #[test]
    fn status_namespace_exposes_named_codes() {
        let engine = test_engine();
        engine
            .run_source(
                "test",
                "if (grpc.status.NOT_FOUND !== 5) throw new Error('unexpected NOT_FOUND value: ' + grpc.status.NOT_FOUND);",
            )
            .unwrap();
    }

    #[test]
    fn script_syntax_error_surfaces_as_result_err() {
        let engine = test_engine();
        let err = engine.run_source("test", "this is not valid javascript (((").unwrap_err();
        assert!(matches!(err, error::JsBridgeError::TypeError(_)));
    }

    #[test]
    fn metadata_bag_create_and_roundtrip_from_script() {
        let engine = test_engine();
        engine
            .run_source(
                "test",
                "const bag = grpc.metadata.create(); bag.set('x-foo', 'bar'); if (bag.get('x-foo') !== 'bar') throw new Error('bag roundtrip failed');",
            )
            .unwrap();
    }
}
