use std::fmt;

use prost_reflect::DynamicMessage;
use prost_types::Any;

use crate::status::StatusCode;

/// The JS-visible Typed Error (§3, §4.1): `{name:"GrpcError", code, message,
/// details}`. `details` is carried twice — the JS-visible message list, and
/// (when the error originates from script) a pre-encoded `Any` list so the
/// server dispatcher can transmit it without re-marshaling (§9 "Details on
/// errors").
#[derive(Debug, Clone)]
pub struct GrpcError {
    pub code: StatusCode,
    pub message: String,
    pub details: Vec<DynamicMessage>,
    pub native_details: Vec<Any>,
}

impl GrpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        GrpcError {
            code,
            message: message.into(),
            details: Vec::new(),
            native_details: Vec::new(),
        }
    }

    /// `createError(code, message, details?)` (§4.1). Each detail is packed
    /// into an `Any`; a detail that fails to encode is silently dropped —
    /// the resulting error still carries the remaining details and the
    /// primary code/message, per §4.1.
    pub fn with_details(code: StatusCode, message: impl Into<String>, details: Vec<DynamicMessage>) -> Self {
        let mut native_details = Vec::with_capacity(details.len());
        let mut kept = Vec::with_capacity(details.len());
        for detail in details {
            match pack_any(&detail) {
                Ok(any) => {
                    native_details.push(any);
                    kept.push(detail);
                }
                Err(_) => continue,
            }
        }
        GrpcError {
            code,
            message: message.into(),
            details: kept,
            native_details,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        GrpcError::new(StatusCode::NotFound, message)
    }

    pub fn cancelled() -> Self {
        GrpcError::new(StatusCode::Cancelled, "call cancelled")
    }

    pub fn deadline_exceeded() -> Self {
        GrpcError::new(StatusCode::DeadlineExceeded, "deadline exceeded")
    }

    pub fn unimplemented(method: impl fmt::Display) -> Self {
        GrpcError::new(StatusCode::Unimplemented, format!("method not implemented: {method}"))
    }

    /// Map a non-`GrpcError` handler throw to UNKNOWN with the thrown
    /// value's string form (§4.4 step 4, §7).
    pub fn from_thrown(display: impl fmt::Display) -> Self {
        GrpcError::new(StatusCode::Unknown, display.to_string())
    }
}

fn pack_any(message: &DynamicMessage) -> Result<Any, prost::EncodeError> {
    let mut buf = Vec::new();
    prost::Message::encode(message, &mut buf)?;
    Ok(Any {
        type_url: format!("type.googleapis.com/{}", message.descriptor().full_name()),
        value: buf,
    })
}

impl fmt::Display for GrpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GrpcError: {}: {}", self.code, self.message)
    }
}

impl std::error::Error for GrpcError {}

impl From<tonic::Status> for GrpcError {
    fn from(status: tonic::Status) -> Self {
        GrpcError::new(status.code().into(), status.message().to_string())
    }
}

impl From<GrpcError> for tonic::Status {
    fn from(err: GrpcError) -> Self {
        if err.native_details.is_empty() {
            tonic::Status::new(err.code.into(), err.message)
        } else {
            // tonic has no first-class status-details constructor without the
            // `richer-error` surface; encode as the standard google.rpc.Status
            // wire bytes so a real peer still decodes the details correctly.
            let mut buf = Vec::new();
            let rpc_status = prost_types::Status {
                code: err.code.value(),
                message: err.message.clone(),
                details: err.native_details,
            };
            let _ = prost::Message::encode(&rpc_status, &mut buf);
            let mut status = tonic::Status::new(err.code.into(), err.message);
            status.metadata_mut().insert_bin(
                "grpc-status-details-bin",
                tonic::metadata::MetadataValue::from_bytes(&buf),
            );
            status
        }
    }
}

/// Errors that stop at the bridge boundary rather than the peer (§7):
/// argument-shape violations, lifecycle misuse, descriptor lookups that
/// precede any RPC, and anything else not already a [`GrpcError`]. Kept as a
/// single hand-rolled enum with manual `Display`/`Error`/`From`, the style
/// the rest of this crate's error handling already follows.
#[derive(Debug)]
pub enum BridgeError {
    /// Argument shape violation (§6 "Errors at the JS boundary"): a
    /// non-function passed to `addInterceptor`, a value of the wrong native
    /// type handed to `unwrap`, etc. Surfaced to script as a TypeError.
    TypeError(String),

    /// Lifecycle violation: `addService`/`addInterceptor` after `start()`,
    /// a second `start()`, `stop()` before `start()`.
    InvalidState(String),

    /// Descriptor lookup failure (`resolveService`, `messageType`).
    NotFound(String),

    /// A fully gRPC-shaped error: peer-originated failure, handler throw,
    /// cancellation, or deadline expiry (§7). Carries the Typed Error as-is.
    Grpc(GrpcError),

    /// Transport-level I/O failure underneath the in-process channel.
    Io(std::io::Error),

    /// Anything else (protobuf encode/decode failures, descriptor pool
    /// build errors).
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl BridgeError {
    /// Collapse into the Typed Error that crosses the JS boundary: used at
    /// every promise-rejection / recv-rejection site (§7).
    pub fn into_grpc_error(self) -> GrpcError {
        match self {
            BridgeError::TypeError(msg) => GrpcError::new(StatusCode::InvalidArgument, msg),
            BridgeError::InvalidState(msg) => GrpcError::new(StatusCode::FailedPrecondition, msg),
            BridgeError::NotFound(msg) => GrpcError::not_found(msg),
            BridgeError::Grpc(err) => err,
            BridgeError::Io(err) => GrpcError::new(StatusCode::Unavailable, err.to_string()),
            BridgeError::Other(err) => GrpcError::new(StatusCode::Internal, err.to_string()),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::TypeError(msg) => write!(f, "TypeError: {msg}"),
            BridgeError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            BridgeError::NotFound(msg) => write!(f, "not found: {msg}"),
            BridgeError::Grpc(err) => write!(f, "{err}"),
            BridgeError::Io(err) => write!(f, "I/O error: {err}"),
            BridgeError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Io(err) => Some(err),
            BridgeError::Grpc(err) => Some(err),
            BridgeError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err)
    }
}

impl From<GrpcError> for BridgeError {
    fn from(err: GrpcError) -> Self {
        BridgeError::Grpc(err)
    }
}

/// Lets handler code written against `DispatchResult` (§4.6) use `?`
/// directly on `call.send`/`call.recv`, collapsing through the same
/// mapping `into_grpc_error` defines.
impl From<BridgeError> for GrpcError {
    fn from(err: BridgeError) -> Self {
        err.into_grpc_error()
    }
}

impl From<tonic::Status> for BridgeError {
    fn from(status: tonic::Status) -> Self {
        BridgeError::Grpc(status.into())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
