//! Demo service the bridge's own integration tests dial against: one
//! `EchoService` exercising all four RPC modes (§3 GLOSSARY), wired up with
//! native [`bridge_core::server::Handler`]s rather than any scripting
//! engine. Successor to the teacher's `testing/testserver` /
//! `testing/bankdemo`, generalized the way `bridge-core` itself was: the
//! teacher compiled `.proto` at build time into generated structs
//! (`tonic_prost_build` + `tonic::include_proto!`); this crate compiles the
//! same way the bridge consumes protobuf at runtime, reflectively, via
//! `protox::compile` feeding a `DescriptorPool` (`descriptor.rs`'s
//! `descriptor_source_from_proto_files` is the teacher precedent).

use std::path::Path;
use std::sync::Arc;

use prost_reflect::{DescriptorPool, MessageDescriptor, Value};

use bridge_core::call_context::CallContext;
use bridge_core::descriptor::ProtoRegistry;
use bridge_core::error::{BridgeError, Result as BridgeResult};
use bridge_core::interceptor::HandlerOutcome;
use bridge_core::message::MessageHandle;
use bridge_core::server::{Handler, HandlerMap, Server};
use bridge_core::transport::Transport;

pub const SERVICE_FULL_NAME: &str = "testecho.EchoService";
const REPLY_MESSAGE_NAME: &str = "testecho.EchoReply";

/// Compiles `proto/echo.proto` into a `DescriptorPool`. Intended for test
/// setup, not hot-path use -- `protox::compile` re-parses the source file
/// each call.
pub fn descriptor_pool() -> BridgeResult<DescriptorPool> {
    let proto_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("proto");
    let proto_file = proto_dir.join("echo.proto");
    let fds = protox::compile([&proto_file], [&proto_dir])
        .map_err(|e| BridgeError::Other(format!("failed to compile echo.proto: {e}").into()))?;
    DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| BridgeError::Other(format!("failed to build echo descriptor pool: {e}").into()))
}

/// Builds and starts a [`Server`] exposing [`SERVICE_FULL_NAME`] over
/// `transport`, using `registry` to resolve the service. Returns the
/// started server; callers dial through the same `transport` to reach it.
pub fn start(transport: Arc<dyn Transport>, registry: &dyn ProtoRegistry) -> BridgeResult<Arc<Server>> {
    let reply_desc = registry
        .pool()
        .get_message_by_name(REPLY_MESSAGE_NAME)
        .ok_or_else(|| BridgeError::NotFound(REPLY_MESSAGE_NAME.to_string()))?;
    let server = Server::new(transport);
    server.add_service(registry, SERVICE_FULL_NAME, handlers(reply_desc))?;
    server.start()?;
    Ok(server)
}

fn message_text(message: &MessageHandle) -> String {
    match message.get("message") {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn handlers(reply_desc: MessageDescriptor) -> HandlerMap {
    let mut handlers = HandlerMap::new();

    handlers.insert("echo".to_string(), {
        let reply_desc = reply_desc.clone();
        Handler::Unary(Arc::new(move |request, _call: Arc<CallContext>| {
            let reply_desc = reply_desc.clone();
            Box::pin(async move {
                let reply = build_reply(&reply_desc, message_text(&request));
                Ok(HandlerOutcome::Response(reply))
            })
        }))
    });

    handlers.insert("echoServerStream".to_string(), {
        let reply_desc = reply_desc.clone();
        Handler::ServerStreaming(Arc::new(move |request, call: Arc<CallContext>| {
            let reply_desc = reply_desc.clone();
            Box::pin(async move {
                let text = message_text(&request);
                for word in text.split_whitespace() {
                    let reply = build_reply(&reply_desc, word.to_string());
                    call.send(reply).await?;
                }
                Ok(HandlerOutcome::Completed)
            })
        }))
    });

    handlers.insert("echoClientStream".to_string(), {
        let reply_desc = reply_desc.clone();
        Handler::ClientStreaming(Arc::new(move |call: Arc<CallContext>| {
            let reply_desc = reply_desc.clone();
            Box::pin(async move {
                let mut parts = Vec::new();
                loop {
                    let step = call.recv().await.map_err(BridgeError::into_grpc_error)?;
                    match step.value {
                        Some(msg) => parts.push(message_text(&msg)),
                        None => break,
                    }
                }
                let joined = parts.join(" ");
                let reply = build_reply(&reply_desc, joined);
                Ok(HandlerOutcome::Response(reply))
            })
        }))
    });

    handlers.insert("echoBidi".to_string(), {
        let reply_desc = reply_desc.clone();
        Handler::Bidi(Arc::new(move |call: Arc<CallContext>| {
            let reply_desc = reply_desc.clone();
            Box::pin(async move {
                loop {
                    let step = call.recv().await.map_err(BridgeError::into_grpc_error)?;
                    match step.value {
                        Some(msg) => {
                            let reply = build_reply(&reply_desc, message_text(&msg));
                            call.send(reply).await?;
                        }
                        None => break,
                    }
                }
                Ok(HandlerOutcome::Completed)
            })
        }))
    });

    handlers
}

/// Builds an `EchoReply` carrying `text`. `reply_desc` is resolved once in
/// `start()` via the registry rather than re-derived per call.
fn build_reply(reply_desc: &MessageDescriptor, text: String) -> MessageHandle {
    let mut reply = prost_reflect::DynamicMessage::new(reply_desc.clone());
    reply.set_field_by_name("message", Value::String(text));
    MessageHandle::wrap(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::descriptor::DescriptorPoolRegistry;
    use bridge_core::metadata::MetadataBag;
    use bridge_core::transport::InProcessTransport;

    fn request(pool: &DescriptorPool, text: &str) -> MessageHandle {
        let desc = pool.get_message_by_name("testecho.EchoRequest").unwrap();
        let mut msg = prost_reflect::DynamicMessage::new(desc);
        msg.set_field_by_name("message", Value::String(text.to_string()));
        MessageHandle::wrap(msg)
    }

    #[tokio::test]
    async fn unary_echo_round_trips_the_message() {
        let pool = descriptor_pool().unwrap();
        let registry = DescriptorPoolRegistry::new(pool.clone());
        let transport = Arc::new(InProcessTransport::new());
        let _server = start(transport.clone(), &registry).unwrap();

        let service = registry.resolve_service(SERVICE_FULL_NAME).unwrap();
        let method = service.methods().into_iter().find(|m| m.proto_name() == "Echo").unwrap();

        let result = transport
            .invoke(method, request(&pool, "hello"), MetadataBag::create(), None, None)
            .await
            .unwrap();
        assert_eq!(result.response.get("message"), Some(Value::String("hello".to_string())));
    }

    #[tokio::test]
    async fn server_stream_splits_on_whitespace() {
        let pool = descriptor_pool().unwrap();
        let registry = DescriptorPoolRegistry::new(pool.clone());
        let transport = Arc::new(InProcessTransport::new());
        let _server = start(transport.clone(), &registry).unwrap();

        let service = registry.resolve_service(SERVICE_FULL_NAME).unwrap();
        let method = service.methods().into_iter().find(|m| m.proto_name() == "EchoServerStream").unwrap();

        let mut open = transport.new_stream(method, MetadataBag::create(), None, None).await.unwrap();
        open.outbound.send(request(&pool, "one two three")).await.unwrap();
        open.outbound.end();

        let mut words = Vec::new();
        loop {
            let step = open.inbound.recv().await.unwrap();
            match step.value {
                Some(msg) => words.push(msg.get("message").unwrap().as_str().unwrap().to_string()),
                None => break,
            }
        }
        assert_eq!(words, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn client_stream_joins_every_sent_message() {
        let pool = descriptor_pool().unwrap();
        let registry = DescriptorPoolRegistry::new(pool.clone());
        let transport = Arc::new(InProcessTransport::new());
        let _server = start(transport.clone(), &registry).unwrap();

        let service = registry.resolve_service(SERVICE_FULL_NAME).unwrap();
        let method = service.methods().into_iter().find(|m| m.proto_name() == "EchoClientStream").unwrap();

        let mut open = transport.new_stream(method, MetadataBag::create(), None, None).await.unwrap();
        open.outbound.send(request(&pool, "a")).await.unwrap();
        open.outbound.send(request(&pool, "b")).await.unwrap();
        open.outbound.end();

        let step = open.inbound.recv().await.unwrap();
        assert_eq!(step.value.unwrap().get("message"), Some(Value::String("a b".to_string())));
    }

    #[tokio::test]
    async fn bidi_echoes_each_message_as_it_arrives() {
        let pool = descriptor_pool().unwrap();
        let registry = DescriptorPoolRegistry::new(pool.clone());
        let transport = Arc::new(InProcessTransport::new());
        let _server = start(transport.clone(), &registry).unwrap();

        let service = registry.resolve_service(SERVICE_FULL_NAME).unwrap();
        let method = service.methods().into_iter().find(|m| m.proto_name() == "EchoBidi").unwrap();

        let mut open = transport.new_stream(method, MetadataBag::create(), None, None).await.unwrap();
        open.outbound.send(request(&pool, "ping")).await.unwrap();
        let step = open.inbound.recv().await.unwrap();
        assert_eq!(step.value.unwrap().get("message"), Some(Value::String("ping".to_string())));
        open.outbound.end();
        assert!(open.inbound.recv().await.unwrap().done);
    }
}
