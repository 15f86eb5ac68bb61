//! JS half of the Message Bridge (C2, §4.2, §6 "Message & Descriptor
//! Contract"): wraps a `bridge_core::message::MessageHandle` as a plain JS
//! object exposing `get`/`set`/`has`/`clear`, and converts between a wrapped
//! handle (or a plain JS object) and the native reflective form `unwrap`
//! needs.
//!
//! There is no `#[rquickjs::class]` here: every JS-visible object in this
//! crate is an ordinary `Object` with function-valued properties. A
//! `MessageHandle` itself can't be stored as a JS property value directly
//! (it isn't `IntoJs`), so [`HandleArena`] holds the real handles and a
//! wrapped object only ever carries its arena index. A handle never
//! crosses the loop thread (§5 P10), so neither the arena nor the
//! `Rc<RefCell<_>>`s closures capture need to be `Send`.

use std::cell::RefCell;
use std::rc::Rc;

use prost_reflect::{MessageDescriptor, Value as ProstValue};
use rquickjs::{Ctx, IntoJs, Object, Result as JsResult, Value};

use bridge_core::message::{MessageHandle, MessageInput};

const HANDLE_MARKER: &str = "__bridgeMessageHandle";
const HANDLE_ID: &str = "__handleId";

/// Append-only store for the `MessageHandle`s a script has live wrapped
/// references to, indexed by a small integer a wrapped JS object carries.
/// One arena is shared by every module in a given script run (`Engine`
/// owns it) so a handle produced by a server handler and later passed into
/// a client call, or returned from `recv()`, all resolve through the same
/// table.
#[derive(Clone)]
pub struct HandleArena(Rc<RefCell<Vec<MessageHandle>>>);

impl HandleArena {
    pub fn new() -> Self {
        HandleArena(Rc::new(RefCell::new(Vec::new())))
    }

    fn insert(&self, handle: MessageHandle) -> u32 {
        let mut slots = self.0.borrow_mut();
        slots.push(handle);
        (slots.len() - 1) as u32
    }

    fn get(&self, id: u32) -> Option<MessageHandle> {
        self.0.borrow().get(id as usize).cloned()
    }

    /// Same lookup as `get`, public for callers outside this module (e.g.
    /// `status::collect_details`) that only need a read, not the
    /// id-to-handle resolution `to_message_input` performs.
    pub fn peek(&self, id: u32) -> Option<MessageHandle> {
        self.get(id)
    }
}

impl Default for HandleArena {
    fn default() -> Self {
        HandleArena::new()
    }
}

/// `wrap(nativeMsg) -> MessageHandle` (§4.2, §6): builds the JS object a
/// script sees, with `get`/`set`/`has`/`clear` closing over the arena slot.
pub fn wrap_handle<'js>(ctx: Ctx<'js>, arena: &HandleArena, handle: MessageHandle) -> JsResult<Object<'js>> {
    let type_name = handle.descriptor().full_name().to_string();
    let id = arena.insert(handle);

    let obj = Object::new(ctx.clone())?;
    obj.set(HANDLE_MARKER, true)?;
    obj.set(HANDLE_ID, id)?;
    obj.set("typeName", type_name)?;

    let get_arena = arena.clone();
    obj.set(
        "get",
        rquickjs::Function::new(ctx.clone(), move |ctx: Ctx<'js>, field: String| -> JsResult<Value<'js>> {
            let handle = get_arena.get(id).expect("arena slot outlives its wrapped object");
            match handle.get(&field) {
                Some(value) => prost_value_to_js(ctx.clone(), &get_arena, &value),
                None => Ok(Value::new_undefined(ctx)),
            }
        }),
    )?;

    let has_arena = arena.clone();
    obj.set(
        "has",
        rquickjs::Function::new(ctx.clone(), move |field: String| -> bool {
            has_arena.get(id).map(|h| h.has(&field)).unwrap_or(false)
        }),
    )?;

    let clear_arena = arena.clone();
    obj.set(
        "clear",
        rquickjs::Function::new(ctx.clone(), move |field: String| {
            if let Some(mut handle) = clear_arena.get(id) {
                handle.clear(&field);
                clear_arena.0.borrow_mut()[id as usize] = handle;
            }
        }),
    )?;

    let set_arena = arena.clone();
    obj.set(
        "set",
        rquickjs::Function::new(ctx.clone(), move |ctx: Ctx<'js>, field: String, value: Value<'js>| -> JsResult<()> {
            let prost_value = js_to_prost_value(&ctx, &value)?;
            let mut handle = set_arena.get(id).expect("arena slot outlives its wrapped object");
            handle
                .set(&field, prost_value)
                .map_err(|e| crate::error::throw(&ctx, e.into()))?;
            set_arena.0.borrow_mut()[id as usize] = handle;
            Ok(())
        }),
    )?;

    Ok(obj)
}

/// `unwrap(handle | plainObject, expectedDescriptor) -> nativeMsg` (§4.2):
/// accepts either the object [`wrap_handle`] produced or a plain JS object
/// whose keys are proto field names.
pub fn to_message_input(ctx: Ctx<'_>, arena: &HandleArena, value: Value<'_>) -> JsResult<MessageInput> {
    if let Some(obj) = value.as_object() {
        if obj.get::<_, bool>(HANDLE_MARKER).unwrap_or(false) {
            let id: u32 = obj.get(HANDLE_ID)?;
            let handle = arena
                .get(id)
                .ok_or_else(|| crate::error::throw(&ctx, bridge_core::error::BridgeError::InvalidState(
                    "wrapped message handle no longer live".into(),
                ).into()))?;
            return Ok(MessageInput::Handle(handle));
        }
    }
    let json = js_to_json(ctx, value)?;
    Ok(MessageInput::PlainObject(json))
}

/// Converts a single reflective field value into its JS representation.
/// Covers the scalar kinds, nested messages (wrapped through the same
/// arena, so a nested message handle behaves identically to a top-level
/// one), and repeated/list fields. Map fields are not supported -- they
/// see little use in the kind of RPC payloads this bridge's own tests
/// exercise, and `Value::Map` has no natural ordered-key JS projection the
/// spec describes.
pub fn prost_value_to_js<'js>(ctx: Ctx<'js>, arena: &HandleArena, value: &ProstValue) -> JsResult<Value<'js>> {
    match value {
        ProstValue::Bool(b) => b.into_js(&ctx),
        ProstValue::I32(v) => v.into_js(&ctx),
        ProstValue::I64(v) => (*v as f64).into_js(&ctx),
        ProstValue::U32(v) => v.into_js(&ctx),
        ProstValue::U64(v) => (*v as f64).into_js(&ctx),
        ProstValue::F32(v) => v.into_js(&ctx),
        ProstValue::F64(v) => v.into_js(&ctx),
        ProstValue::String(s) => s.as_str().into_js(&ctx),
        ProstValue::Bytes(b) => {
            let array = rquickjs::ArrayBuffer::new(ctx.clone(), b.to_vec())?;
            array.into_js(&ctx)
        }
        ProstValue::EnumNumber(n) => n.into_js(&ctx),
        ProstValue::Message(msg) => {
            let handle = MessageHandle::wrap(msg.clone());
            wrap_handle(ctx.clone(), arena, handle).map(|o| o.into_value())
        }
        ProstValue::List(items) => {
            let array = rquickjs::Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i as u32, prost_value_to_js(ctx.clone(), arena, item)?)?;
            }
            array.into_js(&ctx)
        }
        ProstValue::Map(_) => Err(crate::error::throw(
            &ctx,
            bridge_core::error::BridgeError::TypeError("map-typed fields are not supported across the JS boundary".into())
                .into(),
        )),
    }
}

/// The inverse of [`prost_value_to_js`] for the common JS-literal shapes a
/// script hands `set` with. Kind-checking against the field descriptor
/// happens one layer up, inside `MessageHandle::set`; numbers are handed
/// over as `F64` and let that layer narrow them, the same coercion
/// `prost_reflect`'s own JSON deserializer applies to untyped JSON numbers.
fn js_to_prost_value(ctx: &Ctx<'_>, value: &Value<'_>) -> JsResult<ProstValue> {
    if let Some(b) = value.as_bool() {
        return Ok(ProstValue::Bool(b));
    }
    if let Some(n) = value.as_float() {
        return Ok(ProstValue::F64(n));
    }
    if let Some(n) = value.as_int() {
        return Ok(ProstValue::I32(n));
    }
    if let Some(s) = value.as_string() {
        return Ok(ProstValue::String(s.to_string()?));
    }
    Err(crate::error::throw(
        ctx,
        bridge_core::error::BridgeError::TypeError("unsupported value type for a message field".into()).into(),
    ))
}

/// Renders a whole message as a plain JS object (used when a script treats
/// a response as data rather than calling `get` field-by-field).
pub fn handle_to_plain_object<'js>(ctx: Ctx<'js>, handle: &MessageHandle) -> JsResult<Value<'js>> {
    let json = bridge_core::message::to_plain_object(handle).map_err(|e| crate::error::throw(&ctx, e.into()))?;
    json_to_js(ctx, &json)
}

fn json_to_js<'js>(ctx: Ctx<'js>, value: &serde_json::Value) -> JsResult<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx)),
        serde_json::Value::Bool(b) => b.into_js(&ctx),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0).into_js(&ctx),
        serde_json::Value::String(s) => s.as_str().into_js(&ctx),
        serde_json::Value::Array(items) => {
            let array = rquickjs::Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i as u32, json_to_js(ctx.clone(), item)?)?;
            }
            array.into_js(&ctx)
        }
        serde_json::Value::Object(map) => {
            let obj = Object::new(ctx.clone())?;
            for (k, v) in map {
                obj.set(k.as_str(), json_to_js(ctx.clone(), v)?)?;
            }
            obj.into_js(&ctx)
        }
    }
}

fn js_to_json(ctx: Ctx<'_>, value: Value<'_>) -> JsResult<serde_json::Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(n) = value.as_float() {
        return Ok(serde_json::json!(n));
    }
    if let Some(n) = value.as_int() {
        return Ok(serde_json::json!(n));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }
    if let Some(arr) = value.as_array() {
        let mut out = Vec::with_capacity(arr.len());
        for item in arr.iter::<Value>() {
            out.push(js_to_json(ctx.clone(), item?)?);
        }
        return Ok(serde_json::Value::Array(out));
    }
    if let Some(obj) = value.as_object() {
        let mut out = serde_json::Map::new();
        for key in obj.keys::<String>() {
            let key = key?;
            let v: Value = obj.get(&key)?;
            out.insert(key, js_to_json(ctx.clone(), v)?);
        }
        return Ok(serde_json::Value::Object(out));
    }
    Err(crate::error::throw(
        &ctx,
        bridge_core::error::BridgeError::TypeError("unsupported value in plain-object message payload".into()).into(),
    ))
}

/// `findDescriptor(fullName)` (§6): resolves a message descriptor through
/// the same `ProtoRegistry` the rest of the bridge uses, NOT_FOUND mapped
/// to the same Typed Error every other descriptor lookup raises.
pub fn resolve_message_descriptor(
    ctx: &Ctx<'_>,
    registry: &dyn bridge_core::descriptor::ProtoRegistry,
    full_name: &str,
) -> JsResult<MessageDescriptor> {
    registry
        .resolve_message(full_name)
        .map_err(|e| crate::error::throw(ctx, e.into()))
}
