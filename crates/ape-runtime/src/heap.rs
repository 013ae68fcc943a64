//! Heap objects and the garbage collector
//!
//! Every reference-typed [`Value`] points into the [`Heap`]: a slot arena
//! with a free list, a mark bit per object and a non-moving mark/sweep
//! collector. Collection only runs at explicit safe points (the VM calls
//! [`Heap::collect`] with its roots before allocating); host-side
//! allocations never collect, they pin instead.
//!
//! All memory is accounted through a pluggable [`Allocator`], charged once
//! per object. This gives deterministic leak checks and fault injection in
//! tests, and lets embedders cap script memory.

use crate::bytecode::CompilationResult;
use crate::error::{ApeError, ErrorKind, Traceback};
use crate::span::Pos;
use crate::value::{ObjectType, TypeMask, Value};
use indexmap::IndexMap;
use std::any::Any;
use std::cell::Cell;
use std::fmt::Write as _;
use std::io::Write;
use std::rc::Rc;

/// Memory accounting hook. Returning `false` from [`Allocator::alloc`]
/// makes the allocation fail with an [`ErrorKind::Allocation`] error.
pub trait Allocator: std::fmt::Debug {
    /// Account for an allocation of `bytes`; `false` refuses it
    fn alloc(&self, bytes: usize) -> bool;
    /// Account for releasing an allocation of `bytes`
    fn free(&self, bytes: usize);
}

/// Default allocator: accepts everything, tracks nothing
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn alloc(&self, _bytes: usize) -> bool {
        true
    }

    fn free(&self, _bytes: usize) {}
}

/// Counts live allocations; used by tests to prove zero leaks on teardown
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: Cell<i64>,
    total: Cell<u64>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding allocations (allocs minus frees)
    pub fn live_count(&self) -> i64 {
        self.live.get()
    }

    /// Allocations ever made
    pub fn total_count(&self) -> u64 {
        self.total.get()
    }
}

impl Allocator for CountingAllocator {
    fn alloc(&self, _bytes: usize) -> bool {
        self.live.set(self.live.get() + 1);
        self.total.set(self.total.get() + 1);
        true
    }

    fn free(&self, _bytes: usize) {
        self.live.set(self.live.get() - 1);
    }
}

/// Fails the n-th allocation, for partial-failure testing
#[derive(Debug)]
pub struct FailingAllocator {
    allocation_to_fail: usize,
    should_fail: Cell<bool>,
    has_failed: Cell<bool>,
    total: Cell<usize>,
    live: Cell<i64>,
}

impl FailingAllocator {
    /// Fail the `allocation_to_fail`-th allocation (0-based)
    pub fn new(allocation_to_fail: usize) -> Self {
        Self {
            allocation_to_fail,
            should_fail: Cell::new(true),
            has_failed: Cell::new(false),
            total: Cell::new(0),
            live: Cell::new(0),
        }
    }

    /// Whether the injected failure has triggered
    pub fn has_failed(&self) -> bool {
        self.has_failed.get()
    }

    /// Stop injecting failures (subsequent allocations succeed)
    pub fn disarm(&self) {
        self.should_fail.set(false);
    }

    /// Outstanding allocations
    pub fn live_count(&self) -> i64 {
        self.live.get()
    }
}

impl Allocator for FailingAllocator {
    fn alloc(&self, _bytes: usize) -> bool {
        if self.should_fail.get() && self.total.get() >= self.allocation_to_fail {
            self.has_failed.set(true);
            return false;
        }
        self.total.set(self.total.get() + 1);
        self.live.set(self.live.get() + 1);
        true
    }

    fn free(&self, _bytes: usize) {
        self.live.set(self.live.get() - 1);
    }
}

/// A compiled script function. Free variables are empty on the constant-pool
/// prototype and filled in when the VM builds a closure.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub(crate) name: Option<Rc<str>>,
    pub(crate) arity: usize,
    pub(crate) code: Rc<CompilationResult>,
    pub(crate) num_locals: usize,
    pub(crate) free: Vec<Value>,
}

/// Host callback signature for native functions and builtins
pub type NativeFnImpl = dyn Fn(&mut NativeContext<'_>, &[Value]) -> Value;

pub(crate) struct NativeFunction {
    pub(crate) name: Rc<str>,
    pub(crate) func: Rc<NativeFnImpl>,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).finish()
    }
}

/// An error value: message, kind and the traceback stamped by the VM
#[derive(Debug, Clone)]
pub(crate) struct ErrorData {
    pub(crate) kind: ErrorKind,
    pub(crate) message: String,
    pub(crate) traceback: Option<Traceback>,
}

/// Hashable projection of a map key. Strings share the heap string's `Rc`,
/// numbers hash their canonical bit pattern (`-0.0` folded to `0.0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MapKey {
    Number(u64),
    Bool(bool),
    Str(Rc<str>),
}

/// A stored map entry keeps the original key `Value` for ordered iteration
#[derive(Debug, Clone, Copy)]
pub(crate) struct MapEntry {
    pub(crate) key: Value,
    pub(crate) value: Value,
}

pub(crate) type ScriptMap = IndexMap<MapKey, MapEntry>;

/// The payload of one heap slot
pub(crate) enum HeapData {
    Str(Rc<str>),
    Array(Vec<Value>),
    Map(ScriptMap),
    Function(ScriptFunction),
    Native(NativeFunction),
    Error(ErrorData),
    External(Box<dyn Any>),
}

impl HeapData {
    fn object_type(&self) -> ObjectType {
        match self {
            HeapData::Str(_) => ObjectType::String,
            HeapData::Array(_) => ObjectType::Array,
            HeapData::Map(_) => ObjectType::Map,
            HeapData::Function(_) => ObjectType::Function,
            HeapData::Native(_) => ObjectType::NativeFunction,
            HeapData::Error(_) => ObjectType::Error,
            HeapData::External(_) => ObjectType::External,
        }
    }
}

struct HeapObject {
    data: HeapData,
    charge: usize,
}

/// Collects reachable handles during a mark phase
pub struct Marker {
    marked: Vec<bool>,
    worklist: Vec<usize>,
}

impl Marker {
    /// Mark a root value
    pub fn mark(&mut self, value: Value) {
        if let Some(handle) = value.handle() {
            if handle < self.marked.len() && !self.marked[handle] {
                self.marked[handle] = true;
                self.worklist.push(handle);
            }
        }
    }
}

const GC_INITIAL_THRESHOLD: usize = 512;

/// Owner of every reference-typed value
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free_slots: Vec<usize>,
    allocator: Rc<dyn Allocator>,
    live: usize,
    gc_threshold: usize,
    pins: Vec<Value>,
}

impl Heap {
    pub fn new(allocator: Rc<dyn Allocator>) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            allocator,
            live: 0,
            gc_threshold: GC_INITIAL_THRESHOLD,
            pins: Vec::new(),
        }
    }

    /// Number of live objects
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Whether enough garbage may have accumulated to warrant a collection.
    /// The caller (the VM, at its safe points) decides when to act on it.
    pub fn should_collect(&self) -> bool {
        self.live >= self.gc_threshold
    }

    /// Run a full mark/sweep collection. `roots` must mark everything the
    /// caller still holds; the pin stack is always treated as a root.
    pub fn collect<F: FnOnce(&mut Marker)>(&mut self, roots: F) {
        let mut marker = Marker {
            marked: vec![false; self.slots.len()],
            worklist: Vec::new(),
        };
        for pin in &self.pins {
            marker.mark(*pin);
        }
        roots(&mut marker);

        while let Some(handle) = marker.worklist.pop() {
            let children: Vec<Value> = match self.slots[handle].as_ref().map(|o| &o.data) {
                Some(HeapData::Array(values)) => values.clone(),
                Some(HeapData::Map(map)) => map
                    .values()
                    .flat_map(|e| [e.key, e.value])
                    .collect(),
                Some(HeapData::Function(f)) => f.free.clone(),
                _ => continue,
            };
            for child in children {
                marker.mark(child);
            }
        }

        let before = self.live;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !marker.marked[i] {
                let obj = slot.take().expect("slot checked above");
                self.allocator.free(obj.charge);
                self.free_slots.push(i);
                self.live -= 1;
            }
        }

        let freed = before - self.live;
        if freed < before / 2 {
            self.gc_threshold = self.gc_threshold.saturating_mul(2);
        }
    }

    /// Allocate one object. Never collects; returns an allocation error when
    /// the allocator refuses, leaving the heap unchanged.
    pub(crate) fn alloc(&mut self, data: HeapData) -> Result<Value, ApeError> {
        let charge = charge_of(&data);
        if !self.allocator.alloc(charge) {
            return Err(ApeError::allocation());
        }
        let ty = data.object_type();
        let obj = HeapObject { data, charge };
        let handle = match self.free_slots.pop() {
            Some(i) => {
                self.slots[i] = Some(obj);
                i
            }
            None => {
                self.slots.push(Some(obj));
                self.slots.len() - 1
            }
        };
        self.live += 1;
        Ok(Value::object(ty, handle))
    }

    // ── Pinning ───────────────────────────────────────────────────────────

    /// Keep a value alive across collections until the pins are cleared
    pub fn pin(&mut self, value: Value) {
        self.pins.push(value);
    }

    /// Drop all pins (the values must be rooted elsewhere by now)
    pub fn clear_pins(&mut self) {
        self.pins.clear();
    }

    // ── Constructors ──────────────────────────────────────────────────────

    pub fn make_string(&mut self, s: impl AsRef<str>) -> Result<Value, ApeError> {
        self.alloc(HeapData::Str(Rc::from(s.as_ref())))
    }

    pub fn make_array(&mut self, values: Vec<Value>) -> Result<Value, ApeError> {
        self.alloc(HeapData::Array(values))
    }

    pub fn make_map(&mut self) -> Result<Value, ApeError> {
        self.alloc(HeapData::Map(ScriptMap::new()))
    }

    pub fn make_error(&mut self, message: impl Into<String>) -> Result<Value, ApeError> {
        self.make_error_with_kind(ErrorKind::User, message)
    }

    pub(crate) fn make_error_with_kind(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<Value, ApeError> {
        self.alloc(HeapData::Error(ErrorData {
            kind,
            message: message.into(),
            traceback: None,
        }))
    }

    pub fn make_external(&mut self, data: Box<dyn Any>) -> Result<Value, ApeError> {
        self.alloc(HeapData::External(data))
    }

    pub(crate) fn make_function(&mut self, function: ScriptFunction) -> Result<Value, ApeError> {
        self.alloc(HeapData::Function(function))
    }

    pub(crate) fn make_native(
        &mut self,
        name: impl AsRef<str>,
        func: Rc<NativeFnImpl>,
    ) -> Result<Value, ApeError> {
        self.alloc(HeapData::Native(NativeFunction {
            name: Rc::from(name.as_ref()),
            func,
        }))
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    fn get(&self, value: Value) -> Option<&HeapData> {
        let handle = value.handle()?;
        self.slots.get(handle)?.as_ref().map(|o| &o.data)
    }

    fn get_mut(&mut self, value: Value) -> Option<&mut HeapData> {
        let handle = value.handle()?;
        self.slots.get_mut(handle)?.as_mut().map(|o| &mut o.data)
    }

    /// String contents, if `value` is a string
    pub fn string(&self, value: Value) -> Option<&str> {
        match self.get(value)? {
            HeapData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn string_rc(&self, value: Value) -> Option<Rc<str>> {
        match self.get(value)? {
            HeapData::Str(s) => Some(Rc::clone(s)),
            _ => None,
        }
    }

    pub fn array_len(&self, value: Value) -> Option<usize> {
        match self.get(value)? {
            HeapData::Array(values) => Some(values.len()),
            _ => None,
        }
    }

    pub fn array_values(&self, value: Value) -> Option<&[Value]> {
        match self.get(value)? {
            HeapData::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Array element; negative indices address from the rear
    pub fn array_get(&self, value: Value, index: i64) -> Option<Value> {
        let values = self.array_values(value)?;
        let idx = if index < 0 {
            index + values.len() as i64
        } else {
            index
        };
        if idx < 0 {
            return None;
        }
        values.get(idx as usize).copied()
    }

    pub fn array_push(&mut self, value: Value, item: Value) -> bool {
        match self.get_mut(value) {
            Some(HeapData::Array(values)) => {
                values.push(item);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn array_set(&mut self, value: Value, index: usize, item: Value) -> bool {
        match self.get_mut(value) {
            Some(HeapData::Array(values)) if index < values.len() => {
                values[index] = item;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn array_remove(&mut self, value: Value, index: usize) -> Option<Value> {
        match self.get_mut(value) {
            Some(HeapData::Array(values)) if index < values.len() => Some(values.remove(index)),
            _ => None,
        }
    }

    /// Hashable projection of a key value; `None` when the type can't key a map
    pub(crate) fn map_key(&self, key: Value) -> Option<MapKey> {
        match key.object_type() {
            ObjectType::Number => {
                let mut n = key.as_number()?;
                if n == 0.0 {
                    n = 0.0; // fold -0.0 into +0.0
                }
                Some(MapKey::Number(Value::number(n).to_bits()))
            }
            ObjectType::Bool => Some(MapKey::Bool(key.as_bool()?)),
            ObjectType::String => Some(MapKey::Str(self.string_rc(key)?)),
            _ => None,
        }
    }

    pub fn map_len(&self, value: Value) -> Option<usize> {
        match self.get(value)? {
            HeapData::Map(map) => Some(map.len()),
            _ => None,
        }
    }

    /// Map lookup; missing or unhashable keys read as `None`
    pub fn map_get(&self, value: Value, key: Value) -> Option<Value> {
        let map_key = self.map_key(key)?;
        match self.get(value)? {
            HeapData::Map(map) => map.get(&map_key).map(|e| e.value),
            _ => None,
        }
    }

    /// Map store; `false` when `value` is not a map or the key is unhashable
    pub fn map_set(&mut self, value: Value, key: Value, item: Value) -> bool {
        let map_key = match self.map_key(key) {
            Some(k) => k,
            None => return false,
        };
        match self.get_mut(value) {
            Some(HeapData::Map(map)) => {
                map.insert(map_key, MapEntry { key, value: item });
                true
            }
            _ => false,
        }
    }

    /// The i-th key, in insertion order
    pub fn map_key_at(&self, value: Value, index: usize) -> Option<Value> {
        match self.get(value)? {
            HeapData::Map(map) => map.get_index(index).map(|(_, e)| e.key),
            _ => None,
        }
    }

    /// The i-th value, in insertion order
    pub fn map_value_at(&self, value: Value, index: usize) -> Option<Value> {
        match self.get(value)? {
            HeapData::Map(map) => map.get_index(index).map(|(_, e)| e.value),
            _ => None,
        }
    }

    pub(crate) fn function(&self, value: Value) -> Option<&ScriptFunction> {
        match self.get(value)? {
            HeapData::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Bytecode of a compiled function constant (inspection/disassembly)
    pub fn function_code(&self, value: Value) -> Option<Rc<CompilationResult>> {
        self.function(value).map(|f| Rc::clone(&f.code))
    }

    pub fn function_name(&self, value: Value) -> Option<&str> {
        self.function(value)?.name.as_deref()
    }

    pub(crate) fn function_free(&self, value: Value, index: usize) -> Option<Value> {
        self.function(value)?.free.get(index).copied()
    }

    pub(crate) fn native(&self, value: Value) -> Option<(Rc<str>, Rc<NativeFnImpl>)> {
        match self.get(value)? {
            HeapData::Native(n) => Some((Rc::clone(&n.name), Rc::clone(&n.func))),
            _ => None,
        }
    }

    pub fn error_message(&self, value: Value) -> Option<&str> {
        match self.get(value)? {
            HeapData::Error(e) => Some(&e.message),
            _ => None,
        }
    }

    pub fn error_kind(&self, value: Value) -> Option<ErrorKind> {
        match self.get(value)? {
            HeapData::Error(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn error_traceback(&self, value: Value) -> Option<&Traceback> {
        match self.get(value)? {
            HeapData::Error(e) => e.traceback.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn set_error_traceback(&mut self, value: Value, traceback: Traceback) {
        if let Some(HeapData::Error(e)) = self.get_mut(value) {
            if e.traceback.is_none() {
                e.traceback = Some(traceback);
            }
        }
    }

    pub fn external<T: 'static>(&self, value: Value) -> Option<&T> {
        match self.get(value)? {
            HeapData::External(data) => data.downcast_ref::<T>(),
            _ => None,
        }
    }

    // ── Comparison and rendering ──────────────────────────────────────────

    /// Script equality. Same-type values compare by content (numbers,
    /// bools, strings) or identity (arrays, maps, functions, errors);
    /// across types only `null == false` holds.
    pub fn equals(&self, a: Value, b: Value) -> bool {
        let ta = a.object_type();
        let tb = b.object_type();
        if ta != tb {
            return matches!(
                (ta, tb),
                (ObjectType::Null, ObjectType::Bool) | (ObjectType::Bool, ObjectType::Null)
            ) && (a.as_bool() == Some(false) || b.as_bool() == Some(false));
        }
        match ta {
            ObjectType::Null => true,
            ObjectType::Number => a.as_number() == b.as_number(),
            ObjectType::Bool => a.as_bool() == b.as_bool(),
            ObjectType::String => self.string(a) == self.string(b),
            _ => a.handle() == b.handle(),
        }
    }

    /// Script truthiness: null and false are falsey, numbers by `!= 0`,
    /// strings by non-emptiness, every other object is truthy.
    pub fn is_truthy(&self, value: Value) -> bool {
        match value.object_type() {
            ObjectType::Null => false,
            ObjectType::Bool => value.as_bool() == Some(true),
            ObjectType::Number => value.as_number().map_or(false, |n| n != 0.0),
            ObjectType::String => self.string(value).map_or(false, |s| !s.is_empty()),
            _ => true,
        }
    }

    /// Render a value the way `println` does
    pub fn to_display_string(&self, value: Value) -> String {
        let mut out = String::new();
        self.render(value, false, 0, &mut out);
        out
    }

    fn render(&self, value: Value, quote_strings: bool, depth: usize, out: &mut String) {
        if depth > 16 {
            out.push_str("...");
            return;
        }
        match self.get(value) {
            None => match value.object_type() {
                ObjectType::Null => out.push_str("null"),
                ObjectType::Bool => {
                    let _ = write!(out, "{}", value.as_bool().unwrap_or(false));
                }
                _ => {
                    let _ = write!(out, "{}", value.as_number().unwrap_or(f64::NAN));
                }
            },
            Some(HeapData::Str(s)) => {
                if quote_strings {
                    let _ = write!(out, "\"{}\"", s);
                } else {
                    out.push_str(s);
                }
            }
            Some(HeapData::Array(values)) => {
                out.push('[');
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render(*v, true, depth + 1, out);
                }
                out.push(']');
            }
            Some(HeapData::Map(map)) => {
                out.push('{');
                for (i, entry) in map.values().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render(entry.key, true, depth + 1, out);
                    out.push_str(": ");
                    self.render(entry.value, true, depth + 1, out);
                }
                out.push('}');
            }
            Some(HeapData::Function(f)) => {
                let _ = write!(out, "fn {}", f.name.as_deref().unwrap_or("anonymous"));
            }
            Some(HeapData::Native(n)) => {
                let _ = write!(out, "native fn {}", n.name);
            }
            Some(HeapData::Error(e)) => {
                let _ = write!(out, "error: {}", e.message);
            }
            Some(HeapData::External(_)) => out.push_str("external"),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(obj) = slot.take() {
                self.allocator.free(obj.charge);
            }
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .field("gc_threshold", &self.gc_threshold)
            .finish()
    }
}

/// Approximate byte cost reported to the allocator for one object
fn charge_of(data: &HeapData) -> usize {
    let base = std::mem::size_of::<HeapObject>();
    base + match data {
        HeapData::Str(s) => s.len(),
        HeapData::Array(values) => values.len() * std::mem::size_of::<Value>(),
        HeapData::Map(map) => map.len() * 4 * std::mem::size_of::<Value>(),
        HeapData::Function(f) => f.free.len() * std::mem::size_of::<Value>() + 64,
        HeapData::Native(_) => 32,
        HeapData::Error(e) => e.message.len() + 32,
        HeapData::External(_) => 32,
    }
}

/// Context handed to native functions and builtins while they run.
///
/// Values created through the context are pinned until the surrounding call
/// completes, so a collection triggered later in the same call cannot
/// reclaim them before they reach the stack.
pub struct NativeContext<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) stdout: &'a mut dyn Write,
    pub(crate) error: Option<ApeError>,
}

impl<'a> NativeContext<'a> {
    pub(crate) fn new(heap: &'a mut Heap, stdout: &'a mut dyn Write) -> Self {
        Self {
            heap,
            stdout,
            error: None,
        }
    }

    /// Flag a runtime error; the VM raises it when the callback returns and
    /// ignores the returned value.
    pub fn set_runtime_error(&mut self, message: impl Into<String>) {
        self.error = Some(ApeError::runtime(message, Pos::unknown()));
    }

    /// Whether an error has been flagged during this call
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    // Value construction. Allocation failures flag an allocation error and
    // return null, mirroring the embedding contract.

    pub fn make_number(&self, n: f64) -> Value {
        Value::number(n)
    }

    pub fn make_bool(&self, b: bool) -> Value {
        Value::bool(b)
    }

    pub fn make_null(&self) -> Value {
        Value::null()
    }

    pub fn make_string(&mut self, s: impl AsRef<str>) -> Value {
        self.pinned(|heap| heap.make_string(s))
    }

    pub fn make_array(&mut self) -> Value {
        self.pinned(|heap| heap.make_array(Vec::new()))
    }

    pub fn make_array_with(&mut self, values: Vec<Value>) -> Value {
        self.pinned(|heap| heap.make_array(values))
    }

    pub fn make_map(&mut self) -> Value {
        self.pinned(Heap::make_map)
    }

    pub fn make_error(&mut self, message: impl Into<String>) -> Value {
        self.pinned(|heap| heap.make_error(message))
    }

    fn pinned<F: FnOnce(&mut Heap) -> Result<Value, ApeError>>(&mut self, f: F) -> Value {
        match f(self.heap) {
            Ok(v) => {
                self.heap.pin(v);
                v
            }
            Err(err) => {
                self.error = Some(err);
                Value::null()
            }
        }
    }

    // Inspection and container helpers, mirroring the heap surface

    pub fn object_type(&self, value: Value) -> ObjectType {
        value.object_type()
    }

    pub fn string(&self, value: Value) -> Option<&str> {
        self.heap.string(value)
    }

    pub fn array_len(&self, value: Value) -> Option<usize> {
        self.heap.array_len(value)
    }

    pub fn array_get(&self, value: Value, index: i64) -> Option<Value> {
        self.heap.array_get(value, index)
    }

    pub fn array_push(&mut self, value: Value, item: Value) -> bool {
        self.heap.array_push(value, item)
    }

    pub fn map_get(&self, map: Value, key: Value) -> Option<Value> {
        self.heap.map_get(map, key)
    }

    /// Convenience for string-keyed maps: `map["key"]` as a number (NaN when absent)
    pub fn map_get_number(&mut self, map: Value, key: &str) -> f64 {
        let key_value = self.make_string(key);
        self.map_get(map, key_value)
            .and_then(|v| v.as_number())
            .unwrap_or(f64::NAN)
    }

    pub fn map_set(&mut self, map: Value, key: Value, value: Value) -> bool {
        self.heap.map_set(map, key, value)
    }

    pub fn map_set_number(&mut self, map: Value, key: &str, n: f64) -> bool {
        let key_value = self.make_string(key);
        self.map_set(map, key_value, Value::number(n))
    }

    pub fn to_display_string(&self, value: Value) -> String {
        self.heap.to_display_string(value)
    }

    pub fn is_truthy(&self, value: Value) -> bool {
        self.heap.is_truthy(value)
    }

    /// Write to the configured stdout hook
    pub fn write_stdout(&mut self, bytes: &[u8]) -> usize {
        self.stdout.write(bytes).unwrap_or(0)
    }

    /// Match `args` against per-position type masks. On mismatch, flags a
    /// descriptive runtime error when `report` is set and returns false.
    pub fn check_args(&mut self, report: bool, args: &[Value], expected: &[TypeMask]) -> bool {
        if args.len() != expected.len() {
            if report {
                self.set_runtime_error(format!(
                    "invalid number of arguments, got {}, expected {}",
                    args.len(),
                    expected.len()
                ));
            }
            return false;
        }
        for (i, (arg, mask)) in args.iter().zip(expected).enumerate() {
            let ty = arg.object_type();
            if !mask.accepts(ty) {
                if report {
                    self.set_runtime_error(format!(
                        "invalid argument {} type, got {}, expected {}",
                        i,
                        ty.name(),
                        mask.describe()
                    ));
                }
                return false;
            }
        }
        true
    }
}
