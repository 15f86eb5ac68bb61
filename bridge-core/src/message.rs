//! Message Handles (§3) and the wrap/unwrap half of the Message Bridge
//! (C2, §4.2): JS-visible wrappers over reflective protobuf messages, and
//! conversion to/from the plain-object form a script may pass instead of a
//! wrapped handle.
//!
//! JSON is the plain-object interchange form, the way the teacher's
//! `format.rs` bridges `DynamicMessage` to/from `serde_json::Value` for its
//! request/response formatters; here the same `prost_reflect` serde support
//! stands in for "whatever plain-object shape the JS engine hands us".

use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};

use crate::error::{BridgeError, Result};

/// `wrap(nativeMsg) -> MessageHandle` (§4.2): a JS wrapper over a reflective
/// message for a specific descriptor, supporting `get`/`set`/`has`/`clear`.
#[derive(Debug, Clone)]
pub struct MessageHandle {
    inner: DynamicMessage,
}

impl MessageHandle {
    pub fn wrap(native: DynamicMessage) -> Self {
        MessageHandle { inner: native }
    }

    pub fn descriptor(&self) -> MessageDescriptor {
        self.inner.descriptor()
    }

    pub fn get(&self, field: &str) -> Option<prost_reflect::Value> {
        let field_desc = self.inner.descriptor().get_field_by_name(field)?;
        Some(self.inner.get_field(&field_desc).into_owned())
    }

    pub fn has(&self, field: &str) -> bool {
        match self.inner.descriptor().get_field_by_name(field) {
            Some(field_desc) => self.inner.has_field(&field_desc),
            None => false,
        }
    }

    pub fn clear(&mut self, field: &str) {
        if let Some(field_desc) = self.inner.descriptor().get_field_by_name(field) {
            self.inner.clear_field(&field_desc);
        }
    }

    pub fn set(&mut self, field: &str, value: prost_reflect::Value) -> Result<()> {
        let field_desc = self.inner.descriptor().get_field_by_name(field).ok_or_else(|| {
            BridgeError::TypeError(format!(
                "unknown field '{field}' on message {}",
                self.inner.descriptor().full_name()
            ))
        })?;
        self.inner.set_field(&field_desc, value);
        Ok(())
    }

    pub fn into_inner(self) -> DynamicMessage {
        self.inner
    }

    pub fn as_inner(&self) -> &DynamicMessage {
        &self.inner
    }
}

/// What a script may hand the bridge where a message is expected: either an
/// already-wrapped handle, or a plain object whose keys correspond to proto
/// field names (§4.2: "unknown keys are ignored").
pub enum MessageInput {
    Handle(MessageHandle),
    PlainObject(serde_json::Value),
}

/// `unwrap(handle | plainObject, expectedDescriptor) -> nativeMsg` (§4.2).
/// Accepts either a wrapped handle of the matching descriptor or a plain
/// object; unknown keys in a plain object are ignored, values of the wrong
/// type raise (§6 "Errors at the JS boundary").
pub fn unwrap(input: MessageInput, expected: &MessageDescriptor) -> Result<DynamicMessage> {
    match input {
        MessageInput::Handle(handle) => {
            if handle.descriptor().full_name() != expected.full_name() {
                return Err(BridgeError::TypeError(format!(
                    "expected message of type {}, got {}",
                    expected.full_name(),
                    handle.descriptor().full_name()
                )));
            }
            Ok(handle.into_inner())
        }
        MessageInput::PlainObject(value) => {
            let options = DeserializeOptions::new().deny_unknown_fields(false);
            DynamicMessage::deserialize_with_options(expected.clone(), value, &options)
                .map_err(|e| BridgeError::TypeError(format!("invalid message payload: {e}")))
        }
    }
}

/// `wrap(nativeMsg) -> MessageHandle`, trivial but named to mirror the
/// contract in §4.2/§6.
pub fn wrap(native: DynamicMessage) -> MessageHandle {
    MessageHandle::wrap(native)
}

/// Render a message as a plain JSON value, the inverse of the plain-object
/// branch of `unwrap`. Used when a script reads a Message Handle as a plain
/// object rather than calling `get` field-by-field.
pub fn to_plain_object(handle: &MessageHandle) -> Result<serde_json::Value> {
    let options = SerializeOptions::new().stringify_64_bit_integers(false);
    let mut out = serde_json::Serializer::new(Vec::new());
    handle
        .as_inner()
        .serialize_with_options(&mut out, &options)
        .map_err(|e| BridgeError::Other(format!("failed to serialize message: {e}").into()))?;
    serde_json::from_slice(&out.into_inner())
        .map_err(|e| BridgeError::Other(format!("failed to parse serialized message: {e}").into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;

    fn echo_request_descriptor() -> MessageDescriptor {
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
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        let pool = DescriptorPool::from_file_descriptor_set(fds).unwrap();
        pool.get_message_by_name("testgrpc.EchoRequest").unwrap()
    }

    #[test]
    fn unwrap_plain_object_ignores_unknown_keys() {
        let desc = echo_request_descriptor();
        let value = serde_json::json!({"message": "hi", "bogus": 1});
        let msg = unwrap(MessageInput::PlainObject(value), &desc).unwrap();
        let handle = MessageHandle::wrap(msg);
        assert_eq!(
            handle.get("message"),
            Some(prost_reflect::Value::String("hi".to_string()))
        );
    }

    #[test]
    fn unwrap_handle_with_matching_descriptor_passes_through() {
        let desc = echo_request_descriptor();
        let mut msg = DynamicMessage::new(desc.clone());
        msg.set_field_by_name("message", prost_reflect::Value::String("x".into()));
        let handle = MessageHandle::wrap(msg);
        let result = unwrap(MessageInput::Handle(handle), &desc);
        assert!(result.is_ok());
    }

    #[test]
    fn unwrap_handle_wrong_descriptor_is_type_error() {
        let desc = echo_request_descriptor();
        let other_fds = prost_types::FileDescriptorSet {
            file: vec![prost_types::FileDescriptorProto {
                name: Some("other.proto".into()),
                package: Some("testgrpc".into()),
                message_type: vec![prost_types::DescriptorProto {
                    name: Some("Other".into()),
                    ..Default::default()
                }],
                syntax: Some("proto3".into()),
                ..Default::default()
            }],
        };
        let other_pool = DescriptorPool::from_file_descriptor_set(other_fds).unwrap();
        let other_desc = other_pool.get_message_by_name("testgrpc.Other").unwrap();
        let handle = MessageHandle::wrap(DynamicMessage::new(other_desc));
        let err = unwrap(MessageInput::Handle(handle), &desc).unwrap_err();
        assert!(matches!(err, BridgeError::TypeError(_)));
    }

    #[test]
    fn get_set_has_clear_round_trip() {
        let desc = echo_request_descriptor();
        let mut handle = MessageHandle::wrap(DynamicMessage::new(desc));
        assert!(!handle.has("message"));
        handle
            .set("message", prost_reflect::Value::String("hello".into()))
            .unwrap();
        assert!(handle.has("message"));
        assert_eq!(
            handle.get("message"),
            Some(prost_reflect::Value::String("hello".to_string()))
        );
        handle.clear("message");
        assert!(!handle.has("message"));
    }

    #[test]
    fn set_unknown_field_is_type_error() {
        let desc = echo_request_descriptor();
        let mut handle = MessageHandle::wrap(DynamicMessage::new(desc));
        let err = handle.set("nope", prost_reflect::Value::Bool(true)).unwrap_err();
        assert!(matches!(err, BridgeError::TypeError(_)));
    }

    #[test]
    fn to_plain_object_round_trips_through_unwrap() {
        let desc = echo_request_descriptor();
        let mut msg = DynamicMessage::new(desc.clone());
        msg.set_field_by_name("message", prost_reflect::Value::String("round-trip".into()));
        let handle = MessageHandle::wrap(msg);
        let json = to_plain_object(&handle).unwrap();
        assert_eq!(json["message"], serde_json::json!("round-trip"));
    }
}
