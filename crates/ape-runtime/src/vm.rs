//! Stack-based virtual machine
//!
//! Executes a [`CompilationResult`] over a bounded value stack and call
//! frame stack. The VM owns the globals array and the builtin table, raises
//! recoverable runtime errors with traceback capture, checks the wall-clock
//! deadline at backward jumps and calls, and runs the collector at its
//! allocation safe points with the full root set.

use crate::builtins;
use crate::bytecode::{CompilationResult, Opcode};
use crate::error::{ApeError, ErrorKind, Traceback};
use crate::heap::{Heap, NativeContext, ScriptFunction};
use crate::span::Pos;
use crate::value::{ObjectType, Value};
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Value stack capacity
pub const STACK_MAX: usize = 2048;
/// Call depth limit
pub const FRAMES_MAX: usize = 1024;

/// A call activation record
struct Frame {
    /// The bound closure (null for nothing; the top-level frame holds a
    /// synthesized function wrapping the program)
    function: Value,
    code: Rc<CompilationResult>,
    name: Rc<str>,
    /// Next instruction to execute
    ip: usize,
    /// Offset of the instruction currently executing (error positions)
    src_ip: usize,
    /// Stack index of this frame's first argument slot
    base: usize,
    /// Argument slots plus locals-defined-inside slots
    num_locals: usize,
    recover_ip: Option<usize>,
    is_recovering: bool,
}

/// Virtual machine state
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Vec<Value>,
    builtins: Vec<Value>,
    last_popped: Value,
    stdout: Box<dyn Write>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Vm {
    /// Create a VM; allocates the builtin function objects on `heap`
    pub fn new(heap: &mut Heap) -> Result<Self, ApeError> {
        let mut builtin_values = Vec::with_capacity(builtins::count());
        for i in 0..builtins::count() {
            let builtin = builtins::get(i).expect("index within builtin count");
            let value = heap.make_native(builtin.name, Rc::new(builtin.func))?;
            builtin_values.push(value);
        }
        Ok(Self {
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: Vec::new(),
            builtins: builtin_values,
            last_popped: Value::null(),
            stdout: Box::new(std::io::stdout()),
            timeout: None,
            deadline: None,
        })
    }

    /// Replace the stdout hook used by `print`/`println`
    pub fn set_stdout(&mut self, writer: Box<dyn Write>) {
        self.stdout = writer;
    }

    /// Install or clear the wall-clock execution limit
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The value popped most recently at top level (the REPL result)
    pub fn last_popped(&self) -> Value {
        self.last_popped
    }

    /// Current value-stack depth; zero after every completed run
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Read a global slot
    pub fn global(&self, index: usize) -> Value {
        self.globals.get(index).copied().unwrap_or_else(Value::null)
    }

    /// Write a global slot, growing the array as needed
    pub fn set_global(&mut self, index: usize, value: Value) {
        if index >= self.globals.len() {
            self.globals.resize(index + 1, Value::null());
        }
        self.globals[index] = value;
    }

    /// All globals (GC roots, determinism checks)
    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// The builtin function object at a builtin-table index
    pub fn builtin(&self, index: usize) -> Option<Value> {
        self.builtins.get(index).copied()
    }

    /// Execute a top-level program to completion
    pub fn run(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        code: Rc<CompilationResult>,
    ) -> Result<(), ApeError> {
        self.stack.clear();
        self.frames.clear();
        self.last_popped = Value::null();
        self.deadline = self.timeout.map(|t| Instant::now() + t);

        let main = heap.make_function(ScriptFunction {
            name: Some(Rc::from("main")),
            arity: 0,
            code: Rc::clone(&code),
            num_locals: 0,
            free: Vec::new(),
        })?;
        self.frames.push(Frame {
            function: main,
            code,
            name: Rc::from("main"),
            ip: 0,
            src_ip: 0,
            base: 0,
            num_locals: 0,
            recover_ip: None,
            is_recovering: false,
        });

        self.dispatch(heap, constants, None)
    }

    /// Execute a script function, native function or builtin from the host
    pub fn call(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        callee: Value,
        args: &[Value],
    ) -> Result<Value, ApeError> {
        self.deadline = self.timeout.map(|t| Instant::now() + t);
        let depth = self.frames.len();

        self.push(callee)?;
        for arg in args {
            self.push(*arg)?;
        }
        // Callee and arguments are rooted on the stack now.
        heap.clear_pins();

        if let Err(err) = self.call_value(heap, constants, args.len()) {
            return Err(self.unwind(heap, err));
        }
        if self.frames.len() > depth {
            if let Err(err) = self.dispatch(heap, constants, Some(depth)) {
                return Err(err);
            }
        }
        self.pop()
    }

    // ── Dispatch ──────────────────────────────────────────────────────────

    fn dispatch(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        target_depth: Option<usize>,
    ) -> Result<(), ApeError> {
        loop {
            match self.step(heap, constants, target_depth) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err) => self.recover_or_unwind(heap, err)?,
            }
        }
    }

    /// Execute one instruction. `Ok(false)` means execution finished: the
    /// frame stack emptied or returned to `target_depth`.
    fn step(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        target_depth: Option<usize>,
    ) -> Result<bool, ApeError> {
        loop {
            match self.frames.last() {
                None => return Ok(false),
                Some(frame) if frame.ip >= frame.code.len() => {
                    // Top-level code has no trailing return opcode.
                    let finished = self.frames.pop().expect("frame checked above");
                    self.stack.truncate(finished.base.saturating_sub(1));
                    if self.frames.is_empty() || Some(self.frames.len()) <= target_depth {
                        return Ok(false);
                    }
                }
                Some(_) => break,
            }
        }

        {
            let frame = self.frames.last_mut().expect("frame checked above");
            frame.src_ip = frame.ip;
        }
        let op_byte = self.read_u8();
        let op = Opcode::from_byte(op_byte)
            .ok_or_else(|| self.runtime_error(format!("unknown opcode {}", op_byte)))?;

        match op {
            Opcode::None => {}
            Opcode::Constant => {
                let index = self.read_u16() as usize;
                let value = constants
                    .get(index)
                    .copied()
                    .ok_or_else(|| self.runtime_error("constant index out of range"))?;
                self.push(value)?;
            }
            Opcode::Number => {
                let imm = self.read_u32();
                self.push(Value::number(imm as f64))?;
            }
            Opcode::Pop => {
                self.last_popped = self.pop()?;
            }
            Opcode::True => self.push(Value::bool(true))?,
            Opcode::False => self.push(Value::bool(false))?,
            Opcode::Null => self.push(Value::null())?,
            Opcode::Dup => {
                let top = self.peek(0)?;
                self.push(top)?;
            }
            Opcode::Add => {
                let b = self.peek(0)?;
                let a = self.peek(1)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => {
                        self.pop()?;
                        self.pop()?;
                        self.push(Value::number(x + y))?;
                    }
                    _ => match (heap.string(a), heap.string(b)) {
                        (Some(x), Some(y)) => {
                            let joined = format!("{}{}", x, y);
                            self.collect_garbage(heap, constants);
                            let value = heap.make_string(joined)?;
                            self.pop()?;
                            self.pop()?;
                            self.push(value)?;
                        }
                        _ => {
                            return Err(self.runtime_error(format!(
                                "invalid operand types for +: {} and {}",
                                a.type_name(),
                                b.type_name()
                            )))
                        }
                    },
                }
            }
            Opcode::Sub => self.binary_numeric(op, |a, b| a - b)?,
            Opcode::Mul => self.binary_numeric(op, |a, b| a * b)?,
            Opcode::Div => self.binary_numeric(op, |a, b| a / b)?,
            Opcode::Mod => self.binary_numeric(op, |a, b| a % b)?,
            Opcode::Minus => {
                let value = self.pop()?;
                let n = value.as_number().ok_or_else(|| {
                    self.runtime_error(format!("invalid operand type for -: {}", value.type_name()))
                })?;
                self.push(Value::number(-n))?;
            }
            Opcode::Bang => {
                let value = self.pop()?;
                let truthy = heap.is_truthy(value);
                self.push(Value::bool(!truthy))?;
            }
            Opcode::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::bool(heap.equals(a, b)))?;
            }
            Opcode::NotEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::bool(!heap.equals(a, b)))?;
            }
            Opcode::GreaterThan | Opcode::GreaterThanEqual => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => {
                        if op == Opcode::GreaterThan {
                            x > y
                        } else {
                            x >= y
                        }
                    }
                    _ => match (heap.string(a), heap.string(b)) {
                        (Some(x), Some(y)) => {
                            if op == Opcode::GreaterThan {
                                x > y
                            } else {
                                x >= y
                            }
                        }
                        _ => {
                            return Err(self.runtime_error(format!(
                                "cannot compare {} and {}",
                                a.type_name(),
                                b.type_name()
                            )))
                        }
                    },
                };
                self.push(Value::bool(result))?;
            }
            Opcode::Array => {
                let count = self.read_u16() as usize;
                self.collect_garbage(heap, constants);
                let start = self.stack.len().saturating_sub(count);
                let values = self.stack[start..].to_vec();
                let array = heap.make_array(values)?;
                self.stack.truncate(start);
                self.push(array)?;
            }
            Opcode::Map => {
                let slot_count = self.read_u16() as usize;
                self.collect_garbage(heap, constants);
                let start = self.stack.len().saturating_sub(slot_count);
                let entries = self.stack[start..].to_vec();
                let map = heap.make_map()?;
                for pair in entries.chunks(2) {
                    if let [key, value] = pair {
                        if !heap.map_set(map, *key, *value) {
                            return Err(self.runtime_error(format!(
                                "cannot use {} as map key",
                                key.type_name()
                            )));
                        }
                    }
                }
                self.stack.truncate(start);
                self.push(map)?;
            }
            Opcode::GetIndex => self.op_get_index(heap, constants)?,
            Opcode::SetIndex => self.op_set_index(heap)?,
            Opcode::Len => {
                let value = self.pop()?;
                let len = match value.object_type() {
                    ObjectType::String => heap.string(value).map(str::len),
                    ObjectType::Array => heap.array_len(value),
                    ObjectType::Map => heap.map_len(value),
                    _ => None,
                };
                let len = len.ok_or_else(|| {
                    self.runtime_error(format!("cannot get length of {}", value.type_name()))
                })?;
                self.push(Value::number(len as f64))?;
            }
            Opcode::GetValueAt => self.op_get_value_at(heap, constants)?,
            Opcode::SetGlobal => {
                let index = self.read_u16() as usize;
                let value = self.pop()?;
                self.set_global(index, value);
            }
            Opcode::GetGlobal => {
                let index = self.read_u16() as usize;
                let value = self.global(index);
                self.push(value)?;
            }
            Opcode::SetLocal => {
                let index = self.read_u8() as usize;
                let base = self.frame().base;
                let value = self.pop()?;
                let slot = base + index;
                if slot >= self.stack.len() {
                    return Err(self.runtime_error("local slot out of range"));
                }
                self.stack[slot] = value;
            }
            Opcode::GetLocal => {
                let index = self.read_u8() as usize;
                let base = self.frame().base;
                let value = self
                    .stack
                    .get(base + index)
                    .copied()
                    .ok_or_else(|| self.runtime_error("local slot out of range"))?;
                self.push(value)?;
            }
            Opcode::GetBuiltin => {
                let index = self.read_u16() as usize;
                let value = self
                    .builtins
                    .get(index)
                    .copied()
                    .ok_or_else(|| self.runtime_error("builtin index out of range"))?;
                self.push(value)?;
            }
            Opcode::GetFree => {
                let index = self.read_u8() as usize;
                let function = self.frame().function;
                let value = heap
                    .function_free(function, index)
                    .ok_or_else(|| self.runtime_error("free variable index out of range"))?;
                self.push(value)?;
            }
            Opcode::CurrentFunction => {
                let function = self.frame().function;
                self.push(function)?;
            }
            Opcode::Jump => {
                let target = self.read_u16() as usize;
                if target < self.frame().src_ip {
                    self.check_deadline()?;
                }
                self.frame_mut().ip = target;
            }
            Opcode::JumpIfTrue => {
                let target = self.read_u16() as usize;
                let cond = self.pop()?;
                if heap.is_truthy(cond) {
                    self.frame_mut().ip = target;
                }
            }
            Opcode::JumpIfFalse => {
                let target = self.read_u16() as usize;
                let cond = self.pop()?;
                if !heap.is_truthy(cond) {
                    self.frame_mut().ip = target;
                }
            }
            Opcode::Call => {
                let argc = self.read_u8() as usize;
                self.check_deadline()?;
                self.call_value(heap, constants, argc)?;
            }
            Opcode::Return => {
                self.pop_frame_with(Value::null())?;
            }
            Opcode::ReturnValue => {
                let value = self.pop()?;
                self.pop_frame_with(value)?;
            }
            Opcode::Function => {
                let const_index = self.read_u16() as usize;
                let free_count = self.read_u8() as usize;
                let proto_value = constants
                    .get(const_index)
                    .copied()
                    .ok_or_else(|| self.runtime_error("constant index out of range"))?;
                self.collect_garbage(heap, constants);
                let proto = heap
                    .function(proto_value)
                    .ok_or_else(|| self.runtime_error("constant is not a function"))?;
                let mut closure = ScriptFunction {
                    name: proto.name.clone(),
                    arity: proto.arity,
                    code: Rc::clone(&proto.code),
                    num_locals: proto.num_locals,
                    free: Vec::with_capacity(free_count),
                };
                let start = self.stack.len().saturating_sub(free_count);
                closure.free.extend_from_slice(&self.stack[start..]);
                let value = heap.make_function(closure)?;
                self.stack.truncate(start);
                self.push(value)?;
            }
            Opcode::SetRecover => {
                let target = self.read_u16() as usize;
                self.frame_mut().recover_ip = Some(target);
            }
        }

        if let Some(depth) = target_depth {
            if self.frames.len() <= depth {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn op_get_index(&mut self, heap: &mut Heap, constants: &[Value]) -> Result<(), ApeError> {
        let index = self.peek(0)?;
        let left = self.peek(1)?;
        let result = match left.object_type() {
            ObjectType::Array => match index.as_number() {
                Some(n) if n.fract() == 0.0 => {
                    heap.array_get(left, n as i64).unwrap_or_else(Value::null)
                }
                _ => Value::null(),
            },
            ObjectType::Map => heap.map_get(left, index).unwrap_or_else(Value::null),
            ObjectType::String => {
                match self.string_char_at(heap, left, index) {
                    Some(ch) => {
                        self.collect_garbage(heap, constants);
                        heap.make_string(ch)?
                    }
                    None => Value::null(),
                }
            }
            _ => {
                return Err(
                    self.runtime_error(format!("type {} is not indexable", left.type_name()))
                )
            }
        };
        self.pop()?;
        self.pop()?;
        self.push(result)
    }

    fn string_char_at(&self, heap: &Heap, value: Value, index: Value) -> Option<String> {
        let n = index.as_number()?;
        if n.fract() != 0.0 {
            return None;
        }
        let s = heap.string(value)?;
        let count = s.chars().count() as i64;
        let idx = if (n as i64) < 0 { n as i64 + count } else { n as i64 };
        if idx < 0 || idx >= count {
            return None;
        }
        s.chars().nth(idx as usize).map(String::from)
    }

    fn op_set_index(&mut self, heap: &mut Heap) -> Result<(), ApeError> {
        let index = self.pop()?;
        let container = self.pop()?;
        let value = self.pop()?;
        match container.object_type() {
            ObjectType::Array => {
                let n = index.as_number().filter(|n| n.fract() == 0.0).ok_or_else(|| {
                    self.runtime_error(format!(
                        "invalid index type {} for array",
                        index.type_name()
                    ))
                })?;
                let len = heap.array_len(container).unwrap_or(0) as i64;
                let idx = if (n as i64) < 0 { n as i64 + len } else { n as i64 };
                if idx < 0 || idx >= len {
                    return Err(self.runtime_error(format!(
                        "index {} out of range (array length {})",
                        n, len
                    )));
                }
                heap.array_set(container, idx as usize, value);
                Ok(())
            }
            ObjectType::Map => {
                if heap.map_set(container, index, value) {
                    Ok(())
                } else {
                    Err(self.runtime_error(format!(
                        "cannot use {} as map key",
                        index.type_name()
                    )))
                }
            }
            _ => Err(self.runtime_error(format!(
                "type {} is not indexable",
                container.type_name()
            ))),
        }
    }

    fn op_get_value_at(&mut self, heap: &mut Heap, constants: &[Value]) -> Result<(), ApeError> {
        let index = self.peek(0)?;
        let container = self.peek(1)?;
        let n = index
            .as_number()
            .filter(|n| n.fract() == 0.0 && *n >= 0.0)
            .ok_or_else(|| self.runtime_error("invalid iteration index"))?;
        let result = match container.object_type() {
            ObjectType::Array => heap
                .array_get(container, n as i64)
                .unwrap_or_else(Value::null),
            ObjectType::Map => heap
                .map_value_at(container, n as usize)
                .unwrap_or_else(Value::null),
            ObjectType::String => match self.string_char_at(heap, container, index) {
                Some(ch) => {
                    self.collect_garbage(heap, constants);
                    heap.make_string(ch)?
                }
                None => Value::null(),
            },
            _ => {
                return Err(self.runtime_error(format!(
                    "type {} is not iterable",
                    container.type_name()
                )))
            }
        };
        self.pop()?;
        self.pop()?;
        self.push(result)
    }

    fn binary_numeric(&mut self, op: Opcode, f: impl Fn(f64, f64) -> f64) -> Result<(), ApeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.push(Value::number(f(x, y))),
            _ => Err(self.runtime_error(format!(
                "invalid operand types for {}: {} and {}",
                op.name(),
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    // ── Calls ─────────────────────────────────────────────────────────────

    /// Dispatch a call. The stack holds the callee followed by `argc`
    /// argument values.
    fn call_value(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        argc: usize,
    ) -> Result<(), ApeError> {
        let callee = self.peek(argc)?;
        match callee.object_type() {
            ObjectType::Function => {
                let (arity, num_locals, code, name) = {
                    let f = heap
                        .function(callee)
                        .ok_or_else(|| self.runtime_error("dangling function reference"))?;
                    (
                        f.arity,
                        f.num_locals,
                        Rc::clone(&f.code),
                        f.name.clone().unwrap_or_else(|| Rc::from("anonymous")),
                    )
                };
                if argc != arity {
                    return Err(self.runtime_error(format!(
                        "invalid number of arguments to \"{}\", expected {}, got {}",
                        name, arity, argc
                    )));
                }
                if self.frames.len() >= FRAMES_MAX {
                    return Err(self.runtime_error("call stack overflow"));
                }
                let base = self.stack.len() - argc;
                if base + num_locals > STACK_MAX {
                    return Err(self.runtime_error("stack overflow"));
                }
                while self.stack.len() < base + num_locals {
                    self.stack.push(Value::null());
                }
                self.frames.push(Frame {
                    function: callee,
                    code,
                    name,
                    ip: 0,
                    src_ip: 0,
                    base,
                    num_locals,
                    recover_ip: None,
                    is_recovering: false,
                });
                Ok(())
            }
            ObjectType::NativeFunction => {
                let (name, func) = heap
                    .native(callee)
                    .ok_or_else(|| self.runtime_error("dangling native reference"))?;
                let args = self.stack[self.stack.len() - argc..].to_vec();
                self.collect_garbage(heap, constants);

                let result = {
                    let mut ctx = NativeContext::new(heap, &mut *self.stdout);
                    let result = func(&mut ctx, &args);
                    match ctx.error.take() {
                        Some(err) => Err(err),
                        None => Ok(result),
                    }
                };

                match result {
                    Err(mut err) => {
                        heap.clear_pins();
                        if err.kind == ErrorKind::Runtime {
                            err.pos = self.current_pos();
                            err = err.with_traceback(self.capture_traceback(Some(&name)));
                        }
                        Err(err)
                    }
                    Ok(value) => {
                        if value.object_type() == ObjectType::Error
                            && heap.error_traceback(value).is_none()
                        {
                            let tb = self.capture_traceback(Some(&name));
                            heap.set_error_traceback(value, tb);
                        }
                        self.stack.truncate(self.stack.len() - argc - 1);
                        self.push(value)?;
                        heap.clear_pins();
                        Ok(())
                    }
                }
            }
            other => Err(self.runtime_error(format!("{} is not callable", other.name()))),
        }
    }

    fn pop_frame_with(&mut self, value: Value) -> Result<(), ApeError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| self.runtime_error("return outside of a call"))?;
        self.stack.truncate(frame.base.saturating_sub(1));
        self.push(value)
    }

    // ── Errors and recovery ───────────────────────────────────────────────

    /// Handle a raised error inside the dispatch loop: jump to the nearest
    /// recover handler, or unwind everything and surface it.
    fn recover_or_unwind(&mut self, heap: &mut Heap, err: ApeError) -> Result<(), ApeError> {
        let mut err = err;
        if err.kind == ErrorKind::Runtime {
            if err.traceback.is_none() {
                err = err.with_traceback(self.capture_traceback(None));
            }
            while let Some(frame) = self.frames.last_mut() {
                if let (Some(handler_ip), false) = (frame.recover_ip, frame.is_recovering) {
                    frame.is_recovering = true;
                    frame.recover_ip = None;
                    frame.ip = handler_ip;
                    frame.src_ip = handler_ip;
                    let floor = frame.base + frame.num_locals;
                    self.stack.truncate(floor);
                    let error_value =
                        match heap.make_error_with_kind(ErrorKind::Runtime, err.message.clone()) {
                            Ok(value) => value,
                            Err(alloc_err) => return Err(self.unwind(heap, alloc_err)),
                        };
                    if let Some(tb) = err.traceback.clone() {
                        heap.set_error_traceback(error_value, tb);
                    }
                    if let Err(push_err) = self.push(error_value) {
                        return Err(self.unwind(heap, push_err));
                    }
                    return Ok(());
                }
                let finished = self.frames.pop().expect("frame checked above");
                self.stack.truncate(finished.base.saturating_sub(1));
            }
        }
        Err(self.unwind(heap, err))
    }

    /// Tear down all execution state and hand the error to the host
    fn unwind(&mut self, heap: &mut Heap, err: ApeError) -> ApeError {
        heap.clear_pins();
        self.frames.clear();
        self.stack.clear();
        err
    }

    /// Traceback snapshot, innermost frame first. A leading native frame
    /// (position unknown) is included when the error came from one.
    fn capture_traceback(&self, native_name: Option<&str>) -> Traceback {
        let mut traceback = Traceback::new();
        if let Some(name) = native_name {
            traceback.push(name, Pos::unknown());
        }
        for frame in self.frames.iter().rev() {
            traceback.push(frame.name.as_ref(), frame.code.pos_at(frame.src_ip));
        }
        traceback
    }

    fn runtime_error(&self, message: impl Into<String>) -> ApeError {
        ApeError::runtime(message, self.current_pos())
    }

    fn current_pos(&self) -> Pos {
        self.frames
            .last()
            .map(|f| f.code.pos_at(f.src_ip))
            .unwrap_or_default()
    }

    fn check_deadline(&self) -> Result<(), ApeError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(ApeError::timeout());
            }
        }
        Ok(())
    }

    /// GC safe point: run a collection with the full root set when the heap
    /// asks for one. Called before every allocating opcode, while the
    /// operands are still rooted on the stack.
    fn collect_garbage(&self, heap: &mut Heap, constants: &[Value]) {
        if !heap.should_collect() {
            return;
        }
        heap.collect(|marker| {
            marker.mark(self.last_popped);
            for value in &self.stack {
                marker.mark(*value);
            }
            for frame in &self.frames {
                marker.mark(frame.function);
            }
            for value in &self.globals {
                marker.mark(*value);
            }
            for value in &self.builtins {
                marker.mark(*value);
            }
            for value in constants {
                marker.mark(*value);
            }
        });
    }

    // ── Stack and operand helpers ─────────────────────────────────────────

    fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.code.bytecode.get(frame.ip).copied().unwrap_or(0);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_u8() as u16;
        let low = self.read_u8() as u16;
        (high << 8) | low
    }

    fn read_u32(&mut self) -> u32 {
        let high = self.read_u16() as u32;
        let low = self.read_u16() as u32;
        (high << 16) | low
    }

    fn push(&mut self, value: Value) -> Result<(), ApeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, ApeError> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.runtime_error("stack underflow")),
        }
    }

    fn peek(&self, distance: usize) -> Result<Value, ApeError> {
        let len = self.stack.len();
        self.stack
            .get(len.checked_sub(1 + distance).ok_or_else(|| self.runtime_error("stack underflow"))?)
            .copied()
            .ok_or_else(|| self.runtime_error("stack underflow"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::CountingAllocator;

    fn assemble(ops: &[(Opcode, &[u64])]) -> Rc<CompilationResult> {
        let mut result = CompilationResult::new();
        for (op, operands) in ops {
            result.bytecode.push(*op as u8);
            result.src_positions.push(Pos::new(0, 0));
            for (operand, width) in operands.iter().zip(op.operand_widths()) {
                for i in (0..*width).rev() {
                    result.bytecode.push((operand >> (8 * i)) as u8);
                    result.src_positions.push(Pos::new(0, 0));
                }
            }
        }
        Rc::new(result)
    }

    #[test]
    fn test_hand_assembled_arithmetic() {
        let mut heap = Heap::new(Rc::new(CountingAllocator::new()));
        let mut vm = Vm::new(&mut heap).unwrap();
        let constants = vec![Value::number(1.0), Value::number(2.0)];
        let code = assemble(&[
            (Opcode::Constant, &[0]),
            (Opcode::Constant, &[1]),
            (Opcode::Add, &[]),
            (Opcode::Pop, &[]),
        ]);
        vm.run(&mut heap, &constants, code).unwrap();
        assert_eq!(vm.last_popped().as_number(), Some(3.0));
        assert_eq!(vm.stack_size(), 0);
    }

    #[test]
    fn test_unknown_opcode_is_a_runtime_error() {
        let mut heap = Heap::new(Rc::new(CountingAllocator::new()));
        let mut vm = Vm::new(&mut heap).unwrap();
        let mut result = CompilationResult::new();
        result.bytecode.push(0xff);
        result.src_positions.push(Pos::new(0, 0));
        let err = vm.run(&mut heap, &[], Rc::new(result)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
    }

    #[test]
    fn test_timeout_on_backward_jump() {
        let mut heap = Heap::new(Rc::new(CountingAllocator::new()));
        let mut vm = Vm::new(&mut heap).unwrap();
        vm.set_timeout(Some(Duration::from_millis(20)));
        // spins through a backward jump until the deadline trips
        let code = assemble(&[
            (Opcode::True, &[]),
            (Opcode::Pop, &[]),
            (Opcode::Jump, &[0]),
        ]);
        let err = vm.run(&mut heap, &[], code).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_stack_is_empty_after_error_unwind() {
        let mut heap = Heap::new(Rc::new(CountingAllocator::new()));
        let mut vm = Vm::new(&mut heap).unwrap();
        let constants = vec![Value::number(1.0)];
        let code = assemble(&[
            (Opcode::Constant, &[0]),
            (Opcode::Constant, &[0]),
            (Opcode::Call, &[0]),
        ]);
        let err = vm.run(&mut heap, &constants, code).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert!(err.message.contains("not callable"));
        assert_eq!(vm.stack_size(), 0);
    }
}
