//! Wire marshaling for dynamic (reflective) protobuf messages (§4.2, §6
//! Wire Mapping). Unlike `tonic`'s `ProstCodec`, which is generated against
//! compile-time message types, this codec is built from a pair of
//! runtime-resolved `MessageDescriptor`s — the same descriptors the Message
//! Bridge resolves via `ProtoRegistry`, no generated stubs involved.
//!
//! One [`DynamicCodec`] serves one direction of one call: client calls
//! build it `(request_descriptor, response_descriptor)` to encode requests
//! and decode responses; the server dispatcher builds it with the two
//! descriptors swapped to encode responses and decode requests.

use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::codec::{BufferSettings, Codec, Decoder, Encoder};
use tonic::Status;

pub struct DynamicCodec {
    decode_desc: MessageDescriptor,
}

impl DynamicCodec {
    /// `encode_desc` is unused at the type level (a `DynamicMessage` already
    /// carries its own descriptor) but kept as a parameter so call sites
    /// read symmetrically with `decode_desc`.
    pub fn new(_encode_desc: MessageDescriptor, decode_desc: MessageDescriptor) -> Self {
        DynamicCodec { decode_desc }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            decode_desc: self.decode_desc.clone(),
        }
    }
}

pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut tonic::codec::EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))?;
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct DynamicDecoder {
    decode_desc: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut tonic::codec::DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.decode_desc.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode message: {e}")))?;
        Ok(Some(msg))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;

    fn echo_descriptor() -> MessageDescriptor {
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

    /// Exercises the same `prost::Message::encode`/`DynamicMessage::decode`
    /// pair the encoder/decoder delegate to, without depending on tonic's
    /// internal buffer types (those are exercised end-to-end by the
    /// in-process transport tests instead).
    #[test]
    fn encode_decode_round_trip() {
        let desc = echo_descriptor();
        let mut msg = DynamicMessage::new(desc.clone());
        msg.set_field_by_name("message", prost_reflect::Value::String("hi".into()));

        let mut buf = Vec::new();
        prost::Message::encode(&msg, &mut buf).unwrap();
        let decoded = DynamicMessage::decode(desc, buf.as_slice()).unwrap();

        assert_eq!(
            decoded.get_field_by_name("message").map(|v| v.into_owned()),
            Some(prost_reflect::Value::String("hi".to_string()))
        );
    }
}
