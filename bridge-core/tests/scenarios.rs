//! Scenario-level tests driving the full Server Registry / Client Factory /
//! in-process Transport path together, rather than one module in isolation.
//! The per-module unit tests already cover P1-P12 and S1/S3/S4/S6's onHeader
//! ordering inline; what's missing there is S6's actual stress shape and
//! P13 (no leaks under load), both of which only make sense exercised end
//! to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prost_reflect::{DescriptorPool, DynamicMessage, Value};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto,
    ServiceDescriptorProto,
};

use bridge_core::call_context::CallContext;
use bridge_core::client::{CallOptions, Client};
use bridge_core::descriptor::DescriptorPoolRegistry;
use bridge_core::interceptor::HandlerOutcome;
use bridge_core::message::{MessageHandle, MessageInput};
use bridge_core::server::{Handler, HandlerMap, Server};
use bridge_core::transport::InProcessTransport;

fn echo_pool() -> DescriptorPool {
    let fds = FileDescriptorSet {
        file: vec![FileDescriptorProto {
            name: Some("echo.proto".into()),
            package: Some("testgrpc".into()),
            message_type: vec![DescriptorProto {
                name: Some("EchoRequest".into()),
                field: vec![FieldDescriptorProto {
                    name: Some("message".into()),
                    number: Some(1),
                    r#type: Some(9),
                    label: Some(1),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            service: vec![ServiceDescriptorProto {
                name: Some("TestService".into()),
                method: vec![MethodDescriptorProto {
                    name: Some("Echo".into()),
                    input_type: Some(".testgrpc.EchoRequest".into()),
                    output_type: Some(".testgrpc.EchoRequest".into()),
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

fn echo_request(pool: &DescriptorPool, text: &str) -> MessageInput {
    let desc = pool.get_message_by_name("testgrpc.EchoRequest").unwrap();
    let mut msg = DynamicMessage::new(desc);
    msg.set_field_by_name("message", Value::String(text.to_string()));
    MessageInput::Handle(MessageHandle::wrap(msg))
}

#[tokio::test]
async fn s6_stress_100_concurrent_calls_resolve_to_their_own_payload() {
    let pool = echo_pool();
    let registry = DescriptorPoolRegistry::new(pool.clone());
    let transport = Arc::new(InProcessTransport::new());
    let server = Server::new(transport.clone());

    let mut handlers = HandlerMap::new();
    handlers.insert(
        "echo".to_string(),
        Handler::Unary(Arc::new(|request: MessageHandle, _call: Arc<CallContext>| {
            Box::pin(async move {
                let text = match request.get("message") {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                let desc = request.descriptor();
                let mut reply = DynamicMessage::new(desc);
                reply.set_field_by_name("message", Value::String(format!("echo:{text}")));
                Ok(HandlerOutcome::Response(MessageHandle::wrap(reply)))
            })
        })),
    );
    server.add_service(&registry, "testgrpc.TestService", handlers).unwrap();
    server.start().unwrap();

    let client = Arc::new(Client::new(transport, &registry, "testgrpc.TestService").unwrap());

    let calls = (0..100).map(|i| {
        let client = client.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let payload = format!("stress-{i}");
            let request = echo_request(&pool, &payload);
            let response = client.unary("echo", request, CallOptions::new()).await.unwrap();
            match response.get("message") {
                Some(Value::String(s)) => s,
                _ => String::new(),
            }
        })
    });

    let mut results = Vec::with_capacity(100);
    for call in calls {
        results.push(call.await.unwrap());
    }

    assert_eq!(results.len(), 100);
    for i in 0..100 {
        assert!(results.contains(&format!("echo:stress-{i}")), "missing reply for stress-{i}");
    }
}

/// P13: after a batch of concurrent unary RPCs completes, nothing the
/// handler acquired per call is still outstanding. There's no global call
/// registry to inspect from outside the crate, so the handler itself
/// tracks its own in-flight count -- the same shape a leak would show up
/// as (the counter never returning to zero) if a future were dropped
/// without decrementing it.
#[tokio::test]
async fn p13_no_leaked_in_flight_calls_after_concurrent_load() {
    let pool = echo_pool();
    let registry = DescriptorPoolRegistry::new(pool.clone());
    let transport = Arc::new(InProcessTransport::new());
    let server = Server::new(transport.clone());

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handlers = HandlerMap::new();
    handlers.insert("echo".to_string(), {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        Handler::Unary(Arc::new(move |request: MessageHandle, _call: Arc<CallContext>| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Response(request))
            })
        }))
    });
    server.add_service(&registry, "testgrpc.TestService", handlers).unwrap();
    server.start().unwrap();

    let client = Arc::new(Client::new(transport, &registry, "testgrpc.TestService").unwrap());

    let calls = (0..100).map(|i| {
        let client = client.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let request = echo_request(&pool, &format!("stress-{i}"));
            client.unary("echo", request, CallOptions::new()).await.unwrap();
        })
    });
    for call in calls {
        call.await.unwrap();
    }

    assert_eq!(in_flight.load(Ordering::SeqCst), 0, "in-flight count must return to the pre-load baseline");
    assert!(peak.load(Ordering::SeqCst) > 1, "calls never actually overlapped, so this doesn't exercise concurrency");
}
