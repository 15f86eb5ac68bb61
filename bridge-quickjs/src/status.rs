//! JS half of Status & Metadata (C1, §4.1, §6): the `grpc.status`
//! namespace -- 17 named constants plus `createError` -- and the
//! `GrpcError` object shape every rejection/throw across this crate uses.

use rquickjs::{Ctx, IntoJs, Object, Result as JsResult, Value};

use bridge_core::error::GrpcError;
use bridge_core::status::{StatusCode, ALL};

use crate::message::HandleArena;

/// Builds the `grpc.status` namespace object (§6): one integer constant
/// per code name, plus `createError`.
pub fn build_namespace<'js>(ctx: Ctx<'js>, arena: HandleArena) -> JsResult<Object<'js>> {
    let ns = Object::new(ctx.clone())?;
    for code in ALL {
        ns.set(code.name(), code.value())?;
    }

    ns.set(
        "createError",
        rquickjs::Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, code: i32, message: String, details: rquickjs::Opt<rquickjs::Array<'js>>| -> JsResult<Object<'js>> {
                let native_details = collect_details(&arena, &details);
                build_grpc_error(ctx, StatusCode::from_i32(code), message, native_details, details.0)
            },
        ),
    )?;

    Ok(ns)
}

/// Reads an optional JS array of wrapped message handles into their native
/// reflective form, skipping anything that isn't a handle from `arena`
/// (§4.1: "conversion failures for an individual detail are silently
/// skipped").
fn collect_details(arena: &HandleArena, details: &rquickjs::Opt<rquickjs::Array<'_>>) -> Vec<prost_reflect::DynamicMessage> {
    let Some(array) = &details.0 else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in array.iter::<Value>() {
        let Ok(value) = item else { continue };
        let Some(obj) = value.as_object() else { continue };
        let Ok(true) = obj.get::<_, bool>("__bridgeMessageHandle") else { continue };
        let Ok(id) = obj.get::<_, u32>("__handleId") else { continue };
        if let Some(handle) = arena.peek(id) {
            out.push(handle.into_inner());
        }
    }
    out
}

/// Builds the JS-visible `GrpcError` object (§4.1): `{code, message,
/// details, toString()}` where `toString()` yields `GrpcError:
/// <CodeName>: <message>`, matching `bridge_core::error::GrpcError`'s own
/// `Display` impl.
pub fn build_grpc_error<'js>(
    ctx: Ctx<'js>,
    code: StatusCode,
    message: String,
    details: Vec<prost_reflect::DynamicMessage>,
    original_details_array: Option<rquickjs::Array<'js>>,
) -> JsResult<Object<'js>> {
    let err = GrpcError::with_details(code, message, details);
    let obj = Object::new(ctx.clone())?;
    obj.set("name", "GrpcError")?;
    obj.set("code", err.code.value())?;
    obj.set("codeName", err.code.name())?;
    obj.set("message", err.message.clone())?;

    let display = err.to_string();
    obj.set(
        "toString",
        rquickjs::Function::new(ctx.clone(), move || -> String { display.clone() }),
    )?;

    // `details` mirrors whatever the caller originally handed in (minus
    // anything `with_details` dropped as unencodable, per §4.1); the wire
    // form those details take is `err.native_details`, consulted only when
    // this error crosses into a transport status, not here.
    match original_details_array {
        Some(array) => obj.set("details", array)?,
        None => obj.set("details", rquickjs::Array::new(ctx.clone())?)?,
    }

    Ok(obj)
}

/// Rebuilds the JS-visible error object for a `GrpcError` that originated
/// on the Rust side (no details array to mirror back).
pub fn build_grpc_error_no_details<'js>(ctx: Ctx<'js>, err: &GrpcError) -> JsResult<Object<'js>> {
    build_grpc_error(ctx, err.code, err.message.clone(), Vec::new(), None)
}
