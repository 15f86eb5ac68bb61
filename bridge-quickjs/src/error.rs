//! Hand-rolled error enum for this crate, in the same style as
//! `bridge_core::error::BridgeError`: manual `Display`/`Error`/`From` impls
//! rather than a derive-macro crate.

use std::fmt;

use bridge_core::error::{BridgeError, GrpcError};
use rquickjs::{Ctx, Error as JsError, Exception};

#[derive(Debug)]
pub enum JsBridgeError {
    /// A `bridge-core` operation failed; carried through unchanged so the
    /// JS-visible message still names the gRPC status it maps to.
    Bridge(BridgeError),
    /// The QuickJS engine itself raised (a syntax error, an uncaught
    /// exception escaping `Context::with`, out-of-memory, ...).
    Engine(JsError),
    /// A script-facing argument violated its documented shape (§6 "Errors
    /// at the JS boundary": "TypeError for argument shape violations").
    TypeError(String),
}

impl fmt::Display for JsBridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsBridgeError::Bridge(e) => write!(f, "{e}"),
            JsBridgeError::Engine(e) => write!(f, "quickjs error: {e}"),
            JsBridgeError::TypeError(msg) => write!(f, "TypeError: {msg}"),
        }
    }
}

impl std::error::Error for JsBridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JsBridgeError::Bridge(e) => Some(e),
            JsBridgeError::Engine(_) => None,
            JsBridgeError::TypeError(_) => None,
        }
    }
}

impl From<BridgeError> for JsBridgeError {
    fn from(e: BridgeError) -> Self {
        JsBridgeError::Bridge(e)
    }
}

impl From<JsError> for JsBridgeError {
    fn from(e: JsError) -> Self {
        JsBridgeError::Engine(e)
    }
}

pub type Result<T> = std::result::Result<T, JsBridgeError>;

/// Raises `err` as a thrown JS exception in `ctx` and returns the
/// `rquickjs::Error` a native function hands back as its own `Err` to
/// propagate the throw. §7/§6 draw the line between TypeError (argument
/// shape), a plain invalid-state error (lifecycle misuse), and a `GrpcError`
/// object (everything gRPC-status-shaped) -- `crate::status::grpc_error`
/// builds the latter; this function covers the other two plus engine faults
/// that have nothing JS-shaped to carry.
pub fn throw(ctx: &Ctx<'_>, err: JsBridgeError) -> JsError {
    match err {
        JsBridgeError::TypeError(msg) => Exception::throw_type(ctx, &msg),
        JsBridgeError::Bridge(BridgeError::TypeError(msg)) => Exception::throw_type(ctx, &msg),
        JsBridgeError::Bridge(BridgeError::InvalidState(msg)) => Exception::throw_message(ctx, &msg),
        JsBridgeError::Bridge(BridgeError::NotFound(msg)) => Exception::throw_message(ctx, &format!("not found: {msg}")),
        JsBridgeError::Bridge(BridgeError::Grpc(e)) => throw_grpc(ctx, &e),
        JsBridgeError::Bridge(BridgeError::Io(e)) => Exception::throw_message(ctx, &e.to_string()),
        JsBridgeError::Bridge(BridgeError::Other(e)) => Exception::throw_message(ctx, &e.to_string()),
        JsBridgeError::Engine(e) => e,
    }
}

/// Throws a `GrpcError`-shaped value (§3, §4.1 `createError`), for a
/// `BridgeError::Grpc` that originated on the Rust side (a transport
/// failure, a handler's native error) rather than from a script calling
/// `grpc.status.createError` itself.
pub fn throw_grpc(ctx: &Ctx<'_>, err: &GrpcError) -> JsError {
    match crate::status::build_grpc_error_no_details(ctx.clone(), err) {
        Ok(obj) => ctx.throw(obj.into_value()),
        Err(e) => e,
    }
}
