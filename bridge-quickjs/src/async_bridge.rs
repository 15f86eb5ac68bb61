//! Turns a `bridge-core` `Future` into a real JS `Promise` (§6 Event Loop
//! Contract: "`NewPromise`... is a JS-engine primitive this crate has no
//! engine for"; this is where that primitive actually gets used).
//!
//! Every call site here already runs on the loop thread (a native function
//! only ever fires from inside a `Context::with`/`async_with!` block
//! executing there), so `tokio::task::spawn_local` is the right way to let
//! the awaited future run alongside the rest of the loop's work without
//! blocking it.

use std::future::Future;

use rquickjs::{Ctx, IntoJs, Promise, Result as JsResult, Value};

use bridge_core::error::Result as BridgeResult;

/// Spawns `fut` on the loop, converting its eventual `Ok`/`Err` into the
/// promise's resolve/reject. `into_js` converts the success value; failure
/// always becomes the `GrpcError`-shaped object `status::build_grpc_error_no_details`
/// builds, mirroring how a thrown native error surfaces at the JS boundary
/// (§7).
pub fn spawn_promise<'js, F, T, C>(ctx: Ctx<'js>, fut: F, into_js: C) -> JsResult<Value<'js>>
where
    F: Future<Output = BridgeResult<T>> + 'static,
    T: 'static,
    C: FnOnce(Ctx<'_>, T) -> JsResult<Value<'_>> + 'static,
{
    let (promise, resolve, reject) = Promise::new(&ctx)?;
    let ctx_for_task = ctx.clone();

    tokio::task::spawn_local(async move {
        match fut.await {
            Ok(value) => {
                let converted = into_js(ctx_for_task.clone(), value);
                match converted {
                    Ok(js_value) => {
                        let _ = resolve.call::<_, ()>((js_value,));
                    }
                    Err(e) => {
                        let _ = reject.call::<_, ()>((e.into_value(ctx_for_task.clone()),));
                    }
                }
            }
            Err(e) => {
                let grpc = e.into_grpc_error();
                match crate::status::build_grpc_error_no_details(ctx_for_task.clone(), &grpc) {
                    Ok(obj) => {
                        let _ = reject.call::<_, ()>((obj,));
                    }
                    Err(err) => {
                        let _ = reject.call::<_, ()>((err.into_value(ctx_for_task),));
                    }
                }
            }
        }
    });

    Ok(promise.into_value())
}

/// Converts a plain (non-fallible) `rquickjs::Error` into a JS-visible
/// value, for the rare path above where even building the rejection object
/// itself failed.
trait IntoValueLossy<'js> {
    fn into_value(self, ctx: Ctx<'js>) -> Value<'js>;
}

impl<'js> IntoValueLossy<'js> for rquickjs::Error {
    fn into_value(self, ctx: Ctx<'js>) -> Value<'js> {
        self.to_string().into_js(&ctx).unwrap_or_else(|_| Value::new_undefined(ctx))
    }
}
