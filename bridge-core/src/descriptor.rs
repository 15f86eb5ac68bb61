//! The descriptor-resolution half of the Message Bridge (C2, §4.2): turning
//! a fully-qualified service name into a `ServiceDescriptor`, and a method
//! descriptor into the RPC-mode/short-name facts the rest of the bridge
//! needs. The actual wrap/unwrap of message payloads lives in `message.rs`;
//! this module is the "resolve by name" half of the contract.
//!
//! The protobuf descriptor registry is an external collaborator (§1, §6):
//! the bridge never constructs descriptors itself. [`ProtoRegistry`] is that
//! contract; [`DescriptorPoolRegistry`] is the one concrete, in-process
//! implementation this crate ships so it is runnable standalone.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use prost::Message as _;
use prost_reflect::DescriptorPool;

use crate::error::{BridgeError, Result};

/// One of the four RPC modes (§3, GLOSSARY), determined by the two
/// streaming booleans on a method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMode {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidi,
}

impl RpcMode {
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => RpcMode::Unary,
            (false, true) => RpcMode::ServerStreaming,
            (true, false) => RpcMode::ClientStreaming,
            (true, true) => RpcMode::Bidi,
        }
    }

    /// Whether `call.request` is populated for this mode (§4.5): only the
    /// unary-request modes decode a single request message up front.
    pub fn has_unary_request(self) -> bool {
        matches!(self, RpcMode::Unary | RpcMode::ServerStreaming)
    }

    /// Whether the method returns exactly one response value rather than a
    /// stream of `send`s.
    pub fn has_unary_response(self) -> bool {
        matches!(self, RpcMode::Unary | RpcMode::ClientStreaming)
    }
}

/// Method Descriptor (§3): wire path, input/output types, and RPC mode.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    inner: prost_reflect::MethodDescriptor,
}

impl MethodDescriptor {
    fn new(inner: prost_reflect::MethodDescriptor) -> Self {
        MethodDescriptor { inner }
    }

    /// `/<serviceFullName>/<ProtoMethodName>`, exactly as it appears on the
    /// wire (§4.4 "Handler resolution", §6 "Wire Mapping").
    pub fn full_path(&self) -> String {
        format!(
            "/{}/{}",
            self.inner.parent_service().full_name(),
            self.inner.name()
        )
    }

    pub fn proto_name(&self) -> &str {
        self.inner.name()
    }

    /// The JS handler-map key: the proto method name with its first letter
    /// lowercased (`SayHello` -> `sayHello`), per §4.4.
    pub fn short_name(&self) -> String {
        lower_first(self.inner.name())
    }

    pub fn mode(&self) -> RpcMode {
        RpcMode::from_flags(self.inner.is_client_streaming(), self.inner.is_server_streaming())
    }

    pub fn input(&self) -> prost_reflect::MessageDescriptor {
        self.inner.input()
    }

    pub fn output(&self) -> prost_reflect::MessageDescriptor {
        self.inner.output()
    }
}

fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) => c.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Service descriptor resolved via [`ProtoRegistry::resolve_service`].
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    inner: prost_reflect::ServiceDescriptor,
}

impl ServiceDescriptor {
    fn new(inner: prost_reflect::ServiceDescriptor) -> Self {
        ServiceDescriptor { inner }
    }

    pub fn full_name(&self) -> &str {
        self.inner.full_name()
    }

    pub fn methods(&self) -> Vec<MethodDescriptor> {
        self.inner.methods().map(MethodDescriptor::new).collect()
    }

    /// §4.4: "services that intentionally include methods whose names
    /// collide under this mapping are rejected at `addService` time."
    /// Returns the first colliding pair of proto names, if any.
    pub fn short_name_collision(&self) -> Option<(String, String)> {
        let methods = self.methods();
        for (i, a) in methods.iter().enumerate() {
            for b in &methods[i + 1..] {
                if a.short_name() == b.short_name() {
                    return Some((a.proto_name().to_string(), b.proto_name().to_string()));
                }
            }
        }
        None
    }
}

/// The Message & Descriptor Contract consumed from the protobuf
/// collaborator (§6): `findDescriptor`/`resolveService` by fully-qualified
/// name. The bridge treats the collaborator as the source of truth for
/// type identity and never constructs descriptors itself (§4.2).
#[async_trait]
pub trait ProtoRegistry: Send + Sync {
    /// `resolveService(fullName) -> ServiceDescriptor` (§4.2). Resolution
    /// failure raises a NOT_FOUND-class error.
    fn resolve_service(&self, full_name: &str) -> Result<ServiceDescriptor>;

    /// The message descriptor for a fully-qualified message type name, used
    /// by `unwrap` to validate a plain-object payload against the expected
    /// shape.
    fn resolve_message(&self, full_name: &str) -> Result<prost_reflect::MessageDescriptor>;

    fn pool(&self) -> &DescriptorPool;
}

/// The one concrete, in-process [`ProtoRegistry`]: a `DescriptorPool` loaded
/// once at startup (no hot reload, per spec Non-goals).
pub struct DescriptorPoolRegistry {
    pool: DescriptorPool,
}

impl DescriptorPoolRegistry {
    pub fn new(pool: DescriptorPool) -> Self {
        DescriptorPoolRegistry { pool }
    }

    /// Load from a binary-encoded `FileDescriptorSet`, as produced by
    /// `protoc --descriptor_set_out` or `protox::compile`.
    pub fn from_file_descriptor_set(fds: prost_types::FileDescriptorSet) -> Result<Self> {
        let pool = DescriptorPool::from_file_descriptor_set(fds)
            .map_err(|e| BridgeError::Other(format!("failed to build descriptor pool: {e}").into()))?;
        Ok(DescriptorPoolRegistry::new(pool))
    }

    /// Load one or more protoset files (binary `FileDescriptorSet`s) from
    /// disk and merge them into a single pool.
    pub fn from_protoset_files(paths: &[String]) -> Result<Self> {
        let mut pool = DescriptorPool::new();
        for path in paths {
            let bytes = fs::read(Path::new(path))?;
            let fds = prost_types::FileDescriptorSet::decode(bytes.as_slice())
                .map_err(|e| BridgeError::Other(format!("failed to decode protoset '{path}': {e}").into()))?;
            pool.add_file_descriptor_set(fds)
                .map_err(|e| BridgeError::Other(format!("failed to add descriptors from '{path}': {e}").into()))?;
        }
        Ok(DescriptorPoolRegistry::new(pool))
    }
}

#[async_trait]
impl ProtoRegistry for DescriptorPoolRegistry {
    fn resolve_service(&self, full_name: &str) -> Result<ServiceDescriptor> {
        self.pool
            .get_service_by_name(full_name)
            .map(ServiceDescriptor::new)
            .ok_or_else(|| BridgeError::NotFound(full_name.to_string()))
    }

    fn resolve_message(&self, full_name: &str) -> Result<prost_reflect::MessageDescriptor> {
        self.pool
            .get_message_by_name(full_name)
            .ok_or_else(|| BridgeError::NotFound(full_name.to_string()))
    }

    fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_pool() -> DescriptorPool {
        let fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("test.proto".into()),
                package: Some("testgrpc".into()),
                message_type: vec![prost_types::DescriptorProto {
                    name: Some("EchoRequest".into()),
                    field: vec![prost_types::FieldDescriptorProto {
                        name: Some("message".into()),
                        number: Some(1),
                        r#type: Some(9),
                        label: Some(1),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                service: vec![prost_types::ServiceDescriptorProto {
                    name: Some("TestService".into()),
                    method: vec![prost_types::MethodDescriptorProto {
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

    #[test]
    fn resolve_service_by_name() {
        let registry = DescriptorPoolRegistry::new(make_test_pool());
        let svc = registry.resolve_service("testgrpc.TestService").unwrap();
        assert_eq!(svc.full_name(), "testgrpc.TestService");
    }

    #[test]
    fn resolve_service_not_found() {
        let registry = DescriptorPoolRegistry::new(make_test_pool());
        let err = registry.resolve_service("testgrpc.Missing").unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[test]
    fn p6_method_full_path_matches_wire_format() {
        let registry = DescriptorPoolRegistry::new(make_test_pool());
        let svc = registry.resolve_service("testgrpc.TestService").unwrap();
        let method = &svc.methods()[0];
        assert_eq!(method.full_path(), "/testgrpc.TestService/Echo");
    }

    #[test]
    fn short_name_lowercases_first_letter_only() {
        let registry = DescriptorPoolRegistry::new(make_test_pool());
        let svc = registry.resolve_service("testgrpc.TestService").unwrap();
        assert_eq!(svc.methods()[0].short_name(), "echo");
    }

    #[test]
    fn unary_mode_from_flags() {
        let registry = DescriptorPoolRegistry::new(make_test_pool());
        let svc = registry.resolve_service("testgrpc.TestService").unwrap();
        assert_eq!(svc.methods()[0].mode(), RpcMode::Unary);
        assert!(svc.methods()[0].mode().has_unary_request());
        assert!(svc.methods()[0].mode().has_unary_response());
    }

    #[test]
    fn no_collision_for_distinct_methods() {
        let registry = DescriptorPoolRegistry::new(make_test_pool());
        let svc = registry.resolve_service("testgrpc.TestService").unwrap();
        assert!(svc.short_name_collision().is_none());
    }
}
