//! Embedding façade
//!
//! [`Ape`] is the stable surface over the compiler, VM and heap: create an
//! instance, register native functions and global constants, compile and
//! execute source, call script functions, and inspect errors and values.
//! Dropping the instance tears everything down; with a counting allocator
//! the allocation ledger balances to zero.

use crate::bytecode::CompilationResult;
use crate::compiler::Compiler;
use crate::error::{ApeError, Traceback};
use crate::heap::{Allocator, Heap, NativeContext, NativeFnImpl, SystemAllocator};
use crate::symbol_table::SymbolScope;
use crate::value::Value;
use crate::vm::Vm;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

/// A compiled program. Opaque; may be executed any number of times against
/// the instance that compiled it, producing identical globals each run.
#[derive(Clone)]
pub struct Program {
    code: Rc<CompilationResult>,
}

impl Program {
    /// The compiled bytecode (inspection/disassembly)
    pub fn code(&self) -> &CompilationResult {
        &self.code
    }
}

/// An embeddable Ape interpreter instance
pub struct Ape {
    vm: Vm,
    compiler: Compiler,
    heap: Heap,
    errors: Vec<ApeError>,
    repl_mode: bool,
}

impl Ape {
    /// Create an instance with the default allocator
    pub fn new() -> Self {
        Self::with_allocator(Rc::new(SystemAllocator)).expect("system allocator cannot fail")
    }

    /// Create an instance whose heap is accounted through `allocator`
    pub fn with_allocator(allocator: Rc<dyn Allocator>) -> Result<Self, ApeError> {
        let mut heap = Heap::new(allocator);
        let vm = Vm::new(&mut heap)?;
        Ok(Self {
            vm,
            compiler: Compiler::new(),
            heap,
            errors: Vec::new(),
            repl_mode: false,
        })
    }

    // ── Configuration ─────────────────────────────────────────────────────

    /// In REPL mode `execute` reports the last popped top-level value
    pub fn set_repl_mode(&mut self, repl_mode: bool) {
        self.repl_mode = repl_mode;
    }

    /// Install a wall-clock execution limit in seconds; negative clears it.
    /// Returns false where no wall clock is available (never, currently).
    pub fn set_timeout(&mut self, seconds: f64) -> bool {
        if seconds < 0.0 {
            self.vm.set_timeout(None);
        } else {
            self.vm.set_timeout(Some(Duration::from_secs_f64(seconds)));
        }
        true
    }

    /// Redirect `print`/`println` output
    pub fn set_stdout(&mut self, writer: impl Write + 'static) {
        self.vm.set_stdout(Box::new(writer));
    }

    /// Register a host function callable from scripts. Host data travels in
    /// the closure's captures.
    pub fn set_native_function<F>(&mut self, name: &str, func: F) -> Result<Value, ApeError>
    where
        F: Fn(&mut NativeContext<'_>, &[Value]) -> Value + 'static,
    {
        let value = self.heap.make_native(name, Rc::new(func) as Rc<NativeFnImpl>)?;
        let symbol = self.compiler.define_global(name, false)?;
        self.vm.set_global(symbol.index, value);
        Ok(value)
    }

    /// Bind a value to a non-assignable global name
    pub fn set_global_constant(&mut self, name: &str, value: Value) -> Result<(), ApeError> {
        let symbol = self.compiler.define_global(name, false)?;
        self.vm.set_global(symbol.index, value);
        // The value is rooted in the globals now.
        self.heap.clear_pins();
        Ok(())
    }

    // ── Compilation and execution ─────────────────────────────────────────

    /// Compile source without running it
    pub fn compile(&mut self, source: &str) -> Result<Program, ApeError> {
        self.errors.clear();
        match self.compiler.compile(&mut self.heap, source) {
            Ok(code) => Ok(Program { code }),
            Err(errors) => {
                let first = errors[0].clone();
                self.errors = errors;
                Err(first)
            }
        }
    }

    /// Compile and run source text
    pub fn execute(&mut self, source: &str) -> Result<Value, ApeError> {
        let program = self.compile(source)?;
        self.execute_program(&program)
    }

    /// Run a script file
    pub fn execute_file(&mut self, path: impl AsRef<std::path::Path>) -> Result<Value, ApeError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|io_err| {
            let err = ApeError::runtime(
                format!("failed to read '{}': {}", path.display(), io_err),
                crate::span::Pos::unknown(),
            );
            self.errors.clear();
            self.errors.push(err.clone());
            err
        })?;
        self.execute(&source)
    }

    /// Run a previously compiled program
    pub fn execute_program(&mut self, program: &Program) -> Result<Value, ApeError> {
        self.errors.clear();
        match self
            .vm
            .run(&mut self.heap, self.compiler.constants(), Rc::clone(&program.code))
        {
            Ok(()) => Ok(if self.repl_mode {
                self.vm.last_popped()
            } else {
                Value::null()
            }),
            Err(err) => {
                self.errors.push(err.clone());
                Err(err)
            }
        }
    }

    /// Call a script function, native function or builtin by name
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, ApeError> {
        self.errors.clear();
        let callee = match self.compiler.resolve_global(name) {
            Some(symbol) if symbol.scope == SymbolScope::Global => self.vm.global(symbol.index),
            Some(symbol) if symbol.scope == SymbolScope::Builtin => self
                .vm
                .builtin(symbol.index)
                .unwrap_or_else(Value::null),
            _ => Value::null(),
        };
        if callee.is_null() {
            let err = ApeError::runtime(
                format!("function '{}' is not defined", name),
                crate::span::Pos::unknown(),
            );
            self.errors.push(err.clone());
            return Err(err);
        }
        match self
            .vm
            .call(&mut self.heap, self.compiler.constants(), callee, args)
        {
            Ok(value) => Ok(value),
            Err(err) => {
                self.errors.push(err.clone());
                Err(err)
            }
        }
    }

    /// Read a global by name; null when undefined
    pub fn get_object(&mut self, name: &str) -> Value {
        match self.compiler.resolve_global(name) {
            Some(symbol) if symbol.scope == SymbolScope::Global => self.vm.global(symbol.index),
            Some(symbol) if symbol.scope == SymbolScope::Builtin => self
                .vm
                .builtin(symbol.index)
                .unwrap_or_else(Value::null),
            _ => Value::null(),
        }
    }

    // ── Error access ──────────────────────────────────────────────────────

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn error(&self, index: usize) -> Option<&ApeError> {
        self.errors.get(index)
    }

    pub fn errors(&self) -> &[ApeError] {
        &self.errors
    }

    // ── Value construction ────────────────────────────────────────────────
    //
    // Heap-allocated values stay pinned until they become reachable from a
    // root (a global constant, or the stack once passed to `call`).

    pub fn make_number(&self, n: f64) -> Value {
        Value::number(n)
    }

    pub fn make_bool(&self, b: bool) -> Value {
        Value::bool(b)
    }

    pub fn make_null(&self) -> Value {
        Value::null()
    }

    pub fn make_string(&mut self, s: impl AsRef<str>) -> Result<Value, ApeError> {
        let value = self.heap.make_string(s)?;
        self.heap.pin(value);
        Ok(value)
    }

    pub fn make_array(&mut self) -> Result<Value, ApeError> {
        let value = self.heap.make_array(Vec::new())?;
        self.heap.pin(value);
        Ok(value)
    }

    pub fn make_map(&mut self) -> Result<Value, ApeError> {
        let value = self.heap.make_map()?;
        self.heap.pin(value);
        Ok(value)
    }

    pub fn make_error(&mut self, message: impl Into<String>) -> Result<Value, ApeError> {
        let value = self.heap.make_error(message)?;
        self.heap.pin(value);
        Ok(value)
    }

    pub fn make_external(&mut self, data: Box<dyn std::any::Any>) -> Result<Value, ApeError> {
        let value = self.heap.make_external(data)?;
        self.heap.pin(value);
        Ok(value)
    }

    // ── Value inspection ──────────────────────────────────────────────────

    pub fn string_value(&self, value: Value) -> Option<&str> {
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

    pub fn map_len(&self, value: Value) -> Option<usize> {
        self.heap.map_len(value)
    }

    pub fn map_get(&self, map: Value, key: Value) -> Option<Value> {
        self.heap.map_get(map, key)
    }

    pub fn map_get_number(&mut self, map: Value, key: &str) -> f64 {
        match self.make_string(key) {
            Ok(key_value) => self
                .heap
                .map_get(map, key_value)
                .and_then(|v| v.as_number())
                .unwrap_or(f64::NAN),
            Err(_) => f64::NAN,
        }
    }

    pub fn map_set(&mut self, map: Value, key: Value, value: Value) -> bool {
        self.heap.map_set(map, key, value)
    }

    pub fn map_set_number(&mut self, map: Value, key: &str, n: f64) -> bool {
        match self.make_string(key) {
            Ok(key_value) => self.heap.map_set(map, key_value, Value::number(n)),
            Err(_) => false,
        }
    }

    pub fn error_message(&self, value: Value) -> Option<&str> {
        self.heap.error_message(value)
    }

    pub fn error_traceback(&self, value: Value) -> Option<&Traceback> {
        self.heap.error_traceback(value)
    }

    pub fn to_display_string(&self, value: Value) -> String {
        self.heap.to_display_string(value)
    }

    /// Bytecode of a compiled function value (inspection)
    pub fn function_code(&self, value: Value) -> Option<Rc<CompilationResult>> {
        self.heap.function_code(value)
    }
}

impl Default for Ape {
    fn default() -> Self {
        Self::new()
    }
}
