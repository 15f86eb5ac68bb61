//! Scenario-level tests: a script driving the full JS Surface (§6) against
//! a real service (`echo-service`, registered natively, not from JS) over
//! the shared in-process transport. These exercise the same round trip the
//! S1/S2/S4 scenarios in spec.md §8 describe, end to end through
//! [`bridge_quickjs::Engine`] rather than through any one module in
//! isolation.

use std::sync::Arc;

use bridge_core::descriptor::DescriptorPoolRegistry;
use bridge_core::transport::InProcessTransport;
use bridge_quickjs::Engine;

fn engine_with_echo_service() -> Engine {
    let pool = echo_service::descriptor_pool().unwrap();
    let registry = Arc::new(DescriptorPoolRegistry::new(pool));
    let transport = Arc::new(InProcessTransport::new());
    echo_service::start(transport.clone(), registry.as_ref()).unwrap();
    Engine::new(transport, registry).unwrap()
}

#[test]
fn unary_call_round_trips_through_the_js_client() {
    let engine = engine_with_echo_service();
    engine
        .run_source(
            "test",
            r#"
            (async () => {
                const client = grpc.createClient("testecho.EchoService");
                const reply = await client.echo({ message: "hello" });
                if (reply.message !== "hello") {
                    throw new Error("unexpected reply: " + reply.message);
                }
            })()
            "#,
        )
        .unwrap();
}

#[test]
fn unary_call_against_unknown_method_rejects_with_grpc_status() {
    let engine = engine_with_echo_service();
    let err = engine
        .run_source(
            "test",
            r#"
            (async () => {
                const client = grpc.createClient("testecho.EchoService");
                await client.noSuchMethod({ message: "hi" });
            })()
            "#,
        )
        .unwrap_err();
    let message = format!("{err}");
    assert!(message.contains("noSuchMethod") || message.contains("TypeError"), "{message}");
}

#[test]
fn metadata_round_trips_through_call_options() {
    let engine = engine_with_echo_service();
    engine
        .run_source(
            "test",
            r#"
            (async () => {
                const client = grpc.createClient("testecho.EchoService");
                const md = grpc.metadata.create();
                md.set("x-request-id", "abc123");
                const reply = await client.echo({ message: "ping" }, { metadata: md });
                if (reply.message !== "ping") {
                    throw new Error("unexpected reply: " + reply.message);
                }
            })()
            "#,
        )
        .unwrap();
}

#[test]
fn client_streaming_call_joins_every_sent_message() {
    let engine = engine_with_echo_service();
    engine
        .run_source(
            "test",
            r#"
            (async () => {
                const client = grpc.createClient("testecho.EchoService");
                const stream = client.echoClientStream();
                await stream.send({ message: "a" });
                await stream.send({ message: "b" });
                stream.end();
                const reply = await stream.response();
                if (reply.message !== "a b") {
                    throw new Error("unexpected joined reply: " + reply.message);
                }
            })()
            "#,
        )
        .unwrap();
}

#[test]
fn cancelling_a_signal_aborts_an_in_flight_call() {
    let engine = engine_with_echo_service();
    engine
        .run_source(
            "test",
            r#"
            (async () => {
                const client = grpc.createClient("testecho.EchoService");
                const signal = grpc.createSignal();
                signal.cancel();
                try {
                    await client.echo({ message: "hi" }, { signal });
                    throw new Error("expected cancellation to reject the call");
                } catch (e) {
                    if (e instanceof Error && e.message === "expected cancellation to reject the call") {
                        throw e;
                    }
                }
            })()
            "#,
        )
        .unwrap();
}
