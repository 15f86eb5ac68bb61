//! Transport Contract (§6): the external collaborator that actually moves
//! call data between this process and wherever the server-side handler
//! runs. In the real deployment that is the Go gRPC stack's multi-goroutine
//! transport, reached over HTTP/2 and TLS -- both explicitly out of scope
//! here (§1 Non-goals). What ships in this module is the one reference
//! implementation SPEC commits to for tests and local development: an
//! in-process dispatcher that wires a registered server handler directly to
//! a dialed call through the same `Outbound`/`Inbound` queues the Stream
//! Controller and Call Context already use (§9 "Streaming as
//! producer/consumer queues"), so no socket, no TLS, and no wire codec sit
//! on the path. [`crate::codec::DynamicCodec`] remains the piece a real
//! wire-level transport would reach for.
//!
//! Every RPC mode is modeled uniformly as a bidirectional exchange here;
//! the unary/server-streaming/client-streaming shapes the Client Factory
//! (C3) presents to a script are a presentation-layer distinction, not a
//! transport one (a unary call is simply one that sends exactly one
//! request message and reads exactly one response message off the same
//! plumbing).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::call_context::CallContext;
use crate::descriptor::{MethodDescriptor, ServiceDescriptor};
use crate::error::GrpcError;
use crate::interceptor::{HandlerOutcome, Pipeline};
use crate::message::MessageHandle;
use crate::metadata::MetadataBag;
use crate::status::StatusCode;
use crate::stream::{Cancellation, Inbound, Outbound};

const STREAM_BUFFER: usize = 16;

/// Result of `invoke` (§6): a single request/response exchange, the
/// building block unary calls use directly and streaming calls use once to
/// open the call before switching to `Outbound`/`Inbound`.
pub struct UnaryInvocation {
    pub response_header: MetadataBag,
    pub response: MessageHandle,
    pub trailer: MetadataBag,
}

/// Result of `new_stream` (§6): a bidirectional call already wired to the
/// handler's own `Outbound`/`Inbound`, plus the header/trailer the
/// dispatcher promises to deliver in order (§4.3 ordering guarantees).
pub struct OpenStream {
    pub outbound: Outbound,
    pub inbound: Inbound,
    pub header: oneshot::Receiver<MetadataBag>,
    pub trailer: oneshot::Receiver<MetadataBag>,
    pub cancellation: Cancellation,
}

/// `Transport` (§6 External Interfaces): `Invoke`, `NewStream`,
/// `RegisterService`, named exactly as the contract names them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes one service's dispatch table, keyed by proto method name
    /// (the short name, e.g. `"Echo"` not the full wire path). Called by
    /// the Server Registry (C4) once per `addService`, after handler-map
    /// validation has already happened there.
    fn register_service(&self, service: ServiceDescriptor, handlers: HashMap<String, Pipeline>);

    async fn invoke(
        &self,
        method: MethodDescriptor,
        request: MessageHandle,
        metadata: MetadataBag,
        deadline: Option<Instant>,
        cancellation: Option<Cancellation>,
    ) -> std::result::Result<UnaryInvocation, GrpcError>;

    async fn new_stream(
        &self,
        method: MethodDescriptor,
        metadata: MetadataBag,
        deadline: Option<Instant>,
        cancellation: Option<Cancellation>,
    ) -> std::result::Result<OpenStream, GrpcError>;
}

/// The in-process reference [`Transport`]: one routing table keyed by the
/// full wire path (`/<service>/<Method>`), shared between however many
/// clients dial it. Used by `testing/echo-service` and the crate's own
/// integration tests; a production embedding swaps this for whatever
/// fronts the real Go transport.
pub struct InProcessTransport {
    routes: Arc<StdMutex<HashMap<String, Pipeline>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        InProcessTransport { routes: Arc::new(StdMutex::new(HashMap::new())) }
    }

    fn lookup(&self, method: &MethodDescriptor) -> std::result::Result<Pipeline, GrpcError> {
        self.routes
            .lock()
            .expect("transport routes lock poisoned")
            .get(&method.full_path())
            .cloned()
            .ok_or_else(|| GrpcError::unimplemented(method.full_path()))
    }

    /// Arms the deadline for one call: a background task that cancels the
    /// call's `Cancellation` handle once `deadline` elapses (§5 "Timeouts",
    /// P11).
    fn arm_deadline(&self, cancellation: &Cancellation, deadline: Option<Instant>) {
        if let Some(instant) = deadline {
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(instant)).await;
                cancellation.cancel();
            });
        }
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        InProcessTransport::new()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn register_service(&self, service: ServiceDescriptor, handlers: HashMap<String, Pipeline>) {
        let mut routes = self.routes.lock().expect("transport routes lock poisoned");
        for method in service.methods() {
            if let Some(pipeline) = handlers.get(method.proto_name()) {
                routes.insert(method.full_path(), pipeline.clone());
            }
        }
    }

    async fn invoke(
        &self,
        method: MethodDescriptor,
        request: MessageHandle,
        metadata: MetadataBag,
        deadline: Option<Instant>,
        cancellation: Option<Cancellation>,
    ) -> std::result::Result<UnaryInvocation, GrpcError> {
        let pipeline = self.lookup(&method)?;
        let cancellation = cancellation.unwrap_or_default();
        self.arm_deadline(&cancellation, deadline);

        let call = Arc::new(CallContext::new(
            method.full_path(),
            Some(metadata),
            deadline,
            Some(request),
            None,
            None,
            cancellation,
        ));

        match pipeline(call.clone()).await {
            Ok(HandlerOutcome::Response(handle)) => Ok(UnaryInvocation {
                response_header: call.take_header_for_send(),
                response: handle,
                trailer: call.take_trailer(),
            }),
            Ok(HandlerOutcome::Completed) => Err(GrpcError::new(
                StatusCode::Internal,
                format!("handler for {} completed without producing a response", method.full_path()),
            )),
            Err(err) => Err(err),
        }
    }

    async fn new_stream(
        &self,
        method: MethodDescriptor,
        metadata: MetadataBag,
        deadline: Option<Instant>,
        cancellation: Option<Cancellation>,
    ) -> std::result::Result<OpenStream, GrpcError> {
        let pipeline = self.lookup(&method)?;
        let cancellation = cancellation.unwrap_or_default();
        self.arm_deadline(&cancellation, deadline);

        let (to_server_tx, to_server_rx) = mpsc::channel(STREAM_BUFFER);
        let (to_client_tx, to_client_rx) = mpsc::channel(STREAM_BUFFER);

        let server_outbound = Outbound::new(to_client_tx, cancellation.clone());
        let server_inbound = Inbound::new(to_server_rx, cancellation.clone());

        let call = Arc::new(CallContext::new(
            method.full_path(),
            Some(metadata),
            deadline,
            None,
            Some(server_outbound),
            Some(server_inbound),
            cancellation.clone(),
        ));

        let (header_tx, header_rx) = oneshot::channel();
        call.set_header_channel(header_tx);
        let (trailer_tx, trailer_rx) = oneshot::channel();

        let dispatch_call = call.clone();
        tokio::spawn(async move {
            match pipeline(dispatch_call.clone()).await {
                Ok(HandlerOutcome::Response(handle)) => {
                    // a client-streaming-shaped handler resolves with a
                    // single response instead of calling `send` itself;
                    // deliver it the same way server-streaming handlers do.
                    let _ = dispatch_call.send(handle).await;
                }
                Ok(HandlerOutcome::Completed) => {}
                Err(err) => dispatch_call.fail(err).await,
            }
            let trailer = dispatch_call.take_trailer();
            dispatch_call.end();
            let _ = trailer_tx.send(trailer);
        });

        let client_outbound = Outbound::new(to_server_tx, cancellation.clone());
        let client_inbound = Inbound::new(to_client_rx, cancellation.clone());

        Ok(OpenStream {
            outbound: client_outbound,
            inbound: client_inbound,
            header: header_rx,
            trailer: trailer_rx,
            cancellation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorPoolRegistry;
    use crate::descriptor::ProtoRegistry;
    use crate::interceptor::BoxFuture;
    use crate::stream::RecvStep;
    use prost_reflect::{DescriptorPool, DynamicMessage, Value};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto,
        ServiceDescriptorProto,
    };

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
                    name: Some("EchoService".into()),
                    method: vec![
                        MethodDescriptorProto {
                            name: Some("Echo".into()),
                            input_type: Some(".testgrpc.EchoRequest".into()),
                            output_type: Some(".testgrpc.EchoRequest".into()),
                            ..Default::default()
                        },
                        MethodDescriptorProto {
                            name: Some("EchoStream".into()),
                            input_type: Some(".testgrpc.EchoRequest".into()),
                            output_type: Some(".testgrpc.EchoRequest".into()),
                            server_streaming: Some(true),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        DescriptorPool::from_file_descriptor_set(fds).unwrap()
    }

    fn echo_request(pool: &DescriptorPool, text: &str) -> MessageHandle {
        let desc = pool.get_message_by_name("testgrpc.EchoRequest").unwrap();
        let mut msg = DynamicMessage::new(desc);
        msg.set_field_by_name("message", Value::String(text.into()));
        MessageHandle::wrap(msg)
    }

    fn echo_pipeline() -> Pipeline {
        Arc::new(|call: Arc<CallContext>| -> BoxFuture<'static, crate::interceptor::DispatchResult> {
            Box::pin(async move {
                let request = call.request().cloned().expect("unary request present");
                Ok(HandlerOutcome::Response(request))
            })
        })
    }

    #[tokio::test]
    async fn s1_unary_round_trip_through_in_process_transport() {
        let pool = echo_pool();
        let registry = DescriptorPoolRegistry::new(pool.clone());
        let service = registry.resolve_service("testgrpc.EchoService").unwrap();
        let method = service.methods().into_iter().find(|m| m.proto_name() == "Echo").unwrap();

        let transport = InProcessTransport::new();
        let mut handlers = HashMap::new();
        handlers.insert("Echo".to_string(), echo_pipeline());
        transport.register_service(service, handlers);

        let result = transport
            .invoke(method, echo_request(&pool, "hi"), MetadataBag::create(), None, None)
            .await
            .unwrap();
        assert_eq!(
            result.response.get("message"),
            Some(prost_reflect::Value::String("hi".to_string()))
        );
    }

    #[tokio::test]
    async fn unregistered_method_is_unimplemented() {
        let pool = echo_pool();
        let registry = DescriptorPoolRegistry::new(pool.clone());
        let service = registry.resolve_service("testgrpc.EchoService").unwrap();
        let method = service.methods().into_iter().find(|m| m.proto_name() == "Echo").unwrap();

        // No `register_service` call: the routing table stays empty.
        let transport = InProcessTransport::new();
        let err = transport
            .invoke(method, echo_request(&pool, "hi"), MetadataBag::create(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::Unimplemented);
    }

    #[tokio::test]
    async fn p13_streaming_response_delivers_header_before_messages() {
        let pool = echo_pool();
        let registry = DescriptorPoolRegistry::new(pool.clone());
        let service = registry.resolve_service("testgrpc.EchoService").unwrap();
        let method = service.methods().into_iter().find(|m| m.proto_name() == "EchoStream").unwrap();

        let stream_pipeline: Pipeline =
            Arc::new(|call: Arc<CallContext>| -> BoxFuture<'static, crate::interceptor::DispatchResult> {
                Box::pin(async move {
                    let mut header = MetadataBag::create();
                    header.set("x-stream", "yes");
                    call.set_header(header);
                    loop {
                        match call.recv().await? {
                            RecvStep { value: Some(msg), .. } => call.send(msg).await?,
                            RecvStep { done: true, .. } => break,
                            _ => {}
                        }
                    }
                    Ok(HandlerOutcome::Completed)
                })
            });

        let transport = InProcessTransport::new();
        let mut handlers = HashMap::new();
        handlers.insert("EchoStream".to_string(), stream_pipeline);
        transport.register_service(service, handlers);

        let mut open = transport.new_stream(method, MetadataBag::create(), None, None).await.unwrap();
        open.outbound.send(echo_request(&pool, "one")).await.unwrap();
        open.outbound.end();

        let step = open.inbound.recv().await.unwrap();
        assert_eq!(step.value.unwrap().get("message"), Some(prost_reflect::Value::String("one".to_string())));
        let header = open.header.await.unwrap();
        assert_eq!(header.get("x-stream"), Some("yes"));
    }
}
