//! JS half of the Metadata Bag (§4.1, §6): `grpc.metadata.create()` and the
//! `get/getAll/set/append/delete/forEach/has/keys` accessors.
//!
//! Same shape as `message::HandleArena`: a bag can't be stored as a JS
//! property value directly, so [`BagArena`] holds the real
//! `Rc<RefCell<MetadataBag>>`s and the wrapped object only carries its
//! arena index.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::{Ctx, Function, Object, Result as JsResult};

use bridge_core::metadata::MetadataBag;

const BAG_MARKER: &str = "__bridgeMetadataBag";
const BAG_ID: &str = "__bagId";

#[derive(Clone)]
pub struct BagArena(Rc<RefCell<Vec<Rc<RefCell<MetadataBag>>>>>);

impl BagArena {
    pub fn new() -> Self {
        BagArena(Rc::new(RefCell::new(Vec::new())))
    }

    fn insert(&self, bag: MetadataBag) -> u32 {
        let mut slots = self.0.borrow_mut();
        slots.push(Rc::new(RefCell::new(bag)));
        (slots.len() - 1) as u32
    }

    fn get(&self, id: u32) -> Option<Rc<RefCell<MetadataBag>>> {
        self.0.borrow().get(id as usize).cloned()
    }
}

impl Default for BagArena {
    fn default() -> Self {
        BagArena::new()
    }
}

/// Builds the `grpc.metadata` namespace object: just `create()`.
pub fn build_namespace<'js>(ctx: Ctx<'js>, arena: BagArena) -> JsResult<Object<'js>> {
    let ns = Object::new(ctx.clone())?;
    ns.set(
        "create",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> JsResult<Object<'js>> {
            wrap_bag(ctx, &arena, MetadataBag::create())
        }),
    )?;
    Ok(ns)
}

/// Wraps a `MetadataBag` as the JS object §4.1 describes. Used both for
/// `grpc.metadata.create()` and for surfacing transport-delivered metadata
/// (request headers, client-side response headers/trailers) as a bag the
/// script reads with the same accessors.
pub fn wrap_bag<'js>(ctx: Ctx<'js>, arena: &BagArena, bag: MetadataBag) -> JsResult<Object<'js>> {
    let id = arena.insert(bag);
    let obj = Object::new(ctx.clone())?;
    obj.set(BAG_MARKER, true)?;
    obj.set(BAG_ID, id)?;

    let a = arena.clone();
    obj.set(
        "get",
        Function::new(ctx.clone(), move |name: String| -> Option<String> {
            a.get(id).and_then(|bag| bag.borrow().get(&name).map(str::to_string))
        }),
    )?;

    let a = arena.clone();
    obj.set(
        "getAll",
        Function::new(ctx.clone(), move |name: String| -> Vec<String> {
            a.get(id).map(|bag| bag.borrow().get_all(&name)).unwrap_or_default()
        }),
    )?;

    let a = arena.clone();
    obj.set(
        "set",
        Function::new(ctx.clone(), move |name: String, value: String| {
            if let Some(bag) = a.get(id) {
                bag.borrow_mut().set(&name, value);
            }
        }),
    )?;

    let a = arena.clone();
    obj.set(
        "append",
        Function::new(ctx.clone(), move |name: String, value: String| {
            if let Some(bag) = a.get(id) {
                bag.borrow_mut().append(&name, value);
            }
        }),
    )?;

    let a = arena.clone();
    obj.set(
        "delete",
        Function::new(ctx.clone(), move |name: String| {
            if let Some(bag) = a.get(id) {
                bag.borrow_mut().delete(&name);
            }
        }),
    )?;

    let a = arena.clone();
    obj.set(
        "has",
        Function::new(ctx.clone(), move |name: String| -> bool {
            a.get(id).map(|bag| bag.borrow().has(&name)).unwrap_or(false)
        }),
    )?;

    let a = arena.clone();
    obj.set(
        "keys",
        Function::new(ctx.clone(), move || -> Vec<String> {
            a.get(id).map(|bag| bag.borrow().keys()).unwrap_or_default()
        }),
    )?;

    let a = arena.clone();
    obj.set(
        "forEach",
        Function::new(ctx.clone(), move |cb: Function<'js>| -> JsResult<()> {
            // §4.1: insertion order is preserved; collect first so the
            // callback can't observe the bag mutating mid-walk.
            let Some(bag) = a.get(id) else { return Ok(()) };
            let mut pairs = Vec::new();
            bag.borrow().for_each(|k, v| pairs.push((k.to_string(), v.to_string())));
            for (key, value) in pairs {
                cb.call::<_, ()>((value, key))?;
            }
            Ok(())
        }),
    )?;

    Ok(obj)
}

/// Extracts the `MetadataBag` a wrapped object carries, e.g. to merge a
/// script-constructed bag into transport form at send time. Returns `None`
/// for anything that isn't a bag [`wrap_bag`] produced.
pub fn unwrap_bag(arena: &BagArena, obj: &Object<'_>) -> Option<MetadataBag> {
    if !obj.get::<_, bool>(BAG_MARKER).unwrap_or(false) {
        return None;
    }
    let id: u32 = obj.get(BAG_ID).ok()?;
    arena.get(id).map(|bag| bag.borrow().clone())
}
