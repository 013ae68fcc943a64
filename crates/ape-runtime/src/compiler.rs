//! AST to bytecode compiler
//!
//! Compiles statements into a flat bytecode stream plus a constants pool.
//! One compilation scope per function body; symbol tables chain alongside.
//! Loop control flow needs no patch lists: `break` jumps to the loop's
//! jump-to-end instruction and `continue` to the condition/update start,
//! both of which are known before the body compiles.

use crate::ast::*;
use crate::bytecode::{CompilationResult, Opcode};
use crate::error::ApeError;
use crate::heap::{Heap, ScriptFunction};
use crate::parser;
use crate::span::Pos;
use crate::symbol_table::{Symbol, SymbolScope, SymbolTable};
use crate::value::Value;
use std::rc::Rc;

/// Per-loop control-flow targets
struct LoopContext {
    /// Where `continue` goes: the condition (while) or update (for) start
    continue_target: usize,
    /// Where `break` goes: the address of the loop's jump-to-end instruction
    break_jump_ip: usize,
}

/// One nested bytecode buffer (a function body being compiled)
struct CompilationScope {
    result: CompilationResult,
    last_opcode: Opcode,
    loops: Vec<LoopContext>,
}

impl Default for CompilationScope {
    fn default() -> Self {
        Self {
            result: CompilationResult::new(),
            last_opcode: Opcode::None,
            loops: Vec::new(),
        }
    }
}

/// Compiler state. Survives across `compile` calls so that the global
/// symbol table and constants pool accumulate (REPL semantics).
pub struct Compiler {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
    pos: Pos,
    next_synthetic: usize,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            constants: Vec::new(),
            symbol_table: SymbolTable::new(),
            scopes: vec![CompilationScope::default()],
            pos: Pos::unknown(),
            next_synthetic: 0,
        }
    }

    /// The accumulated constants pool (a GC root)
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Full pipeline: source text to executable bytecode
    pub fn compile(
        &mut self,
        heap: &mut Heap,
        source: &str,
    ) -> Result<Rc<CompilationResult>, Vec<ApeError>> {
        let program = parser::parse(source).map_err(|e| vec![e])?;
        self.compile_ast(heap, &program).map_err(|e| vec![e])
    }

    /// Compile a pre-parsed program. On failure the symbol table and
    /// constants pool roll back so the instance stays usable.
    pub fn compile_ast(
        &mut self,
        heap: &mut Heap,
        statements: &[Stmt],
    ) -> Result<Rc<CompilationResult>, ApeError> {
        let table_snapshot = self.symbol_table.clone();
        let constants_len = self.constants.len();
        self.scopes = vec![CompilationScope::default()];

        let compiled = statements
            .iter()
            .try_for_each(|stmt| self.compile_statement(heap, stmt));

        match compiled {
            Ok(()) => {
                let scope = self.scopes.last_mut().expect("at least one scope");
                let result = std::mem::take(&mut scope.result);
                scope.last_opcode = Opcode::None;
                Ok(Rc::new(result))
            }
            Err(err) => {
                self.symbol_table = table_snapshot;
                self.constants.truncate(constants_len);
                self.scopes = vec![CompilationScope::default()];
                Err(err)
            }
        }
    }

    // ── Host bindings ─────────────────────────────────────────────────────

    /// Reserve (or look up) a global slot for a host-installed binding
    pub fn define_global(&mut self, name: &str, assignable: bool) -> Result<Symbol, ApeError> {
        if let Some(symbol) = self.symbol_table.resolve(name) {
            if symbol.scope == SymbolScope::Global {
                return Ok(symbol);
            }
        }
        self.symbol_table
            .define(name, assignable)
            .map_err(|msg| ApeError::compile(msg, Pos::unknown()))
    }

    /// Resolve a top-level name (for `get_object` / `call`)
    pub fn resolve_global(&mut self, name: &str) -> Option<Symbol> {
        self.symbol_table.resolve(name)
    }

    // ── Emission primitives ───────────────────────────────────────────────

    /// Append an instruction; records the current source position for each
    /// emitted byte. Returns the byte offset of the opcode.
    pub fn emit(&mut self, op: Opcode, operands: &[u64]) -> usize {
        let pos = self.pos;
        let scope = self.scopes.last_mut().expect("at least one scope");
        let offset = scope.result.bytecode.len();
        scope.result.bytecode.push(op as u8);
        scope.result.src_positions.push(pos);
        for (operand, width) in operands.iter().zip(op.operand_widths()) {
            for shift in (0..*width).rev() {
                scope.result.bytecode.push((operand >> (8 * shift)) as u8);
                scope.result.src_positions.push(pos);
            }
        }
        scope.last_opcode = op;
        offset
    }

    /// The opcode last emitted in the current scope
    pub fn last_opcode(&self) -> Opcode {
        self.scopes.last().expect("at least one scope").last_opcode
    }

    /// Open a nested bytecode buffer for a function body
    pub fn push_compilation_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
    }

    /// Close the current buffer; the outer scope becomes current again
    pub fn pop_compilation_scope(&mut self) -> CompilationResult {
        let scope = self.scopes.pop().expect("at least one scope");
        if self.scopes.is_empty() {
            self.scopes.push(CompilationScope::default());
        }
        scope.result
    }

    fn current_ip(&self) -> usize {
        self.scopes.last().expect("at least one scope").result.bytecode.len()
    }

    /// Emit a u16-operand instruction with a placeholder; returns the
    /// operand offset for patching.
    fn emit_placeholder(&mut self, op: Opcode) -> usize {
        self.emit(op, &[0xffff]) + 1
    }

    fn patch_u16(&mut self, operand_offset: usize, target: usize) {
        let scope = self.scopes.last_mut().expect("at least one scope");
        scope.result.bytecode[operand_offset] = (target >> 8) as u8;
        scope.result.bytecode[operand_offset + 1] = (target & 0xff) as u8;
    }

    fn add_constant(&mut self, value: Value) -> Result<u64, ApeError> {
        if self.constants.len() > u16::MAX as usize {
            return Err(ApeError::compile("constants pool overflow", self.pos));
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u64)
    }

    // ── Symbols ───────────────────────────────────────────────────────────

    fn define_symbol(
        &mut self,
        name: &str,
        pos: Pos,
        assignable: bool,
    ) -> Result<Symbol, ApeError> {
        let symbol = self
            .symbol_table
            .define(name, assignable)
            .map_err(|msg| ApeError::compile(msg, pos))?;
        match symbol.scope {
            SymbolScope::Local if symbol.index > u8::MAX as usize => {
                Err(ApeError::compile("too many locals in function", pos))
            }
            SymbolScope::Global if symbol.index > u16::MAX as usize => {
                Err(ApeError::compile("too many globals", pos))
            }
            _ => Ok(symbol),
        }
    }

    fn define_synthetic(&mut self, prefix: &str) -> Result<Symbol, ApeError> {
        let name = format!("@{}{}", prefix, self.next_synthetic);
        self.next_synthetic += 1;
        self.define_symbol(&name, self.pos, true)
    }

    fn emit_load(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index as u64]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index as u64]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index as u64]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index as u64]),
            SymbolScope::Function => self.emit(Opcode::CurrentFunction, &[]),
        };
    }

    fn emit_store(&mut self, symbol: &Symbol, pos: Pos) -> Result<(), ApeError> {
        match symbol.scope {
            SymbolScope::Global => {
                self.emit(Opcode::SetGlobal, &[symbol.index as u64]);
                Ok(())
            }
            SymbolScope::Local => {
                self.emit(Opcode::SetLocal, &[symbol.index as u64]);
                Ok(())
            }
            SymbolScope::Free => Err(ApeError::compile(
                format!("cannot assign to captured variable '{}'", symbol.name),
                pos,
            )),
            SymbolScope::Builtin | SymbolScope::Function => Err(ApeError::compile(
                format!("'{}' is not assignable", symbol.name),
                pos,
            )),
        }
    }

    // ── Statements ────────────────────────────────────────────────────────

    fn compile_statement(&mut self, heap: &mut Heap, stmt: &Stmt) -> Result<(), ApeError> {
        self.pos = stmt.pos;
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expression(heap, expr)?;
                self.pos = stmt.pos;
                self.emit(Opcode::Pop, &[]);
                Ok(())
            }
            StmtKind::Define {
                name,
                value,
                assignable,
            } => {
                self.compile_expression(heap, value)?;
                let symbol = self.define_symbol(&name.name, name.pos, *assignable)?;
                self.pos = stmt.pos;
                self.emit_store(&symbol, name.pos)
            }
            StmtKind::If { cases, alternative } => {
                self.compile_if(heap, cases, alternative.as_ref())
            }
            StmtKind::Return(value) => {
                if self.scopes.len() == 1 {
                    return Err(ApeError::compile("return outside of a function", stmt.pos));
                }
                match value {
                    Some(expr) => {
                        self.compile_expression(heap, expr)?;
                        self.pos = stmt.pos;
                        self.emit(Opcode::ReturnValue, &[]);
                    }
                    None => {
                        self.emit(Opcode::Return, &[]);
                    }
                }
                Ok(())
            }
            StmtKind::While { cond, body } => self.compile_while(heap, stmt.pos, cond, body),
            StmtKind::Break => {
                let target = self
                    .scopes
                    .last()
                    .expect("at least one scope")
                    .loops
                    .last()
                    .map(|l| l.break_jump_ip)
                    .ok_or_else(|| ApeError::compile("break outside of a loop", stmt.pos))?;
                self.emit(Opcode::Jump, &[target as u64]);
                Ok(())
            }
            StmtKind::Continue => {
                let target = self
                    .scopes
                    .last()
                    .expect("at least one scope")
                    .loops
                    .last()
                    .map(|l| l.continue_target)
                    .ok_or_else(|| ApeError::compile("continue outside of a loop", stmt.pos))?;
                self.emit(Opcode::Jump, &[target as u64]);
                Ok(())
            }
            StmtKind::Foreach { item, source, body } => {
                self.compile_foreach(heap, stmt.pos, item, source, body)
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => self.compile_for(heap, init.as_deref(), test.as_ref(), update.as_ref(), body),
            StmtKind::Block(block) => self.compile_block(heap, block),
            StmtKind::Recover { error_ident, body } => {
                self.compile_recover(heap, stmt.pos, error_ident, body)
            }
        }
    }

    /// A braced block: its own symbol scope; empty blocks still produce
    /// (and discard) a value.
    fn compile_block(&mut self, heap: &mut Heap, block: &Block) -> Result<(), ApeError> {
        self.symbol_table.push_block_scope();
        let result = if block.statements.is_empty() {
            self.pos = block.pos;
            self.emit(Opcode::Null, &[]);
            self.emit(Opcode::Pop, &[]);
            Ok(())
        } else {
            block
                .statements
                .iter()
                .try_for_each(|stmt| self.compile_statement(heap, stmt))
        };
        self.symbol_table.pop_block_scope();
        result
    }

    /// Every branch jumps to a common end address patched after all
    /// branches are emitted.
    fn compile_if(
        &mut self,
        heap: &mut Heap,
        cases: &[IfCase],
        alternative: Option<&Block>,
    ) -> Result<(), ApeError> {
        let mut end_jumps = Vec::with_capacity(cases.len());
        for case in cases {
            self.compile_expression(heap, &case.cond)?;
            self.pos = case.cond.pos;
            let next_case = self.emit_placeholder(Opcode::JumpIfFalse);
            self.compile_block(heap, &case.body)?;
            end_jumps.push(self.emit_placeholder(Opcode::Jump));
            let after = self.current_ip();
            self.patch_u16(next_case, after);
        }
        if let Some(block) = alternative {
            self.compile_block(heap, block)?;
        }
        let end = self.current_ip();
        for jump in end_jumps {
            self.patch_u16(jump, end);
        }
        Ok(())
    }

    fn compile_while(
        &mut self,
        heap: &mut Heap,
        pos: Pos,
        cond: &Expr,
        body: &Block,
    ) -> Result<(), ApeError> {
        let cond_start = self.current_ip();
        self.compile_expression(heap, cond)?;
        self.pos = pos;
        let to_body = self.emit_placeholder(Opcode::JumpIfTrue);
        let break_jump_ip = self.current_ip();
        let to_end = self.emit_placeholder(Opcode::Jump);
        let body_start = self.current_ip();
        self.patch_u16(to_body, body_start);

        self.begin_loop(cond_start, break_jump_ip);
        let body_result = self.compile_block(heap, body);
        self.end_loop();
        body_result?;

        self.emit(Opcode::Jump, &[cond_start as u64]);
        let end = self.current_ip();
        self.patch_u16(to_end, end);
        Ok(())
    }

    /// `for (init; test; update)`: the update section sits before the test
    /// and is skipped on the first iteration by the initial jump.
    fn compile_for(
        &mut self,
        heap: &mut Heap,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Block,
    ) -> Result<(), ApeError> {
        self.symbol_table.push_block_scope();
        let result = self.compile_for_inner(heap, init, test, update, body);
        self.symbol_table.pop_block_scope();
        result
    }

    fn compile_for_inner(
        &mut self,
        heap: &mut Heap,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Block,
    ) -> Result<(), ApeError> {
        if let Some(stmt) = init {
            self.compile_statement(heap, stmt)?;
        }
        let to_test = self.emit_placeholder(Opcode::Jump);

        let update_start = self.current_ip();
        if let Some(expr) = update {
            self.compile_expression(heap, expr)?;
            self.emit(Opcode::Pop, &[]);
        }
        let test_start = self.current_ip();
        self.patch_u16(to_test, test_start);

        match test {
            Some(expr) => self.compile_expression(heap, expr)?,
            None => {
                self.emit(Opcode::True, &[]);
            }
        }
        let to_body = self.emit_placeholder(Opcode::JumpIfTrue);
        let break_jump_ip = self.current_ip();
        let to_end = self.emit_placeholder(Opcode::Jump);
        let body_start = self.current_ip();
        self.patch_u16(to_body, body_start);

        self.begin_loop(update_start, break_jump_ip);
        let body_result = self.compile_block(heap, body);
        self.end_loop();
        body_result?;

        self.emit(Opcode::Jump, &[update_start as u64]);
        let end = self.current_ip();
        self.patch_u16(to_end, end);
        Ok(())
    }

    /// Lowers to a hidden index counter walked with `LEN`/`GET_VALUE_AT`.
    /// The source is evaluated into a hidden binding unless it is already a
    /// resolvable identifier.
    fn compile_foreach(
        &mut self,
        heap: &mut Heap,
        pos: Pos,
        item: &Ident,
        source: &Expr,
        body: &Block,
    ) -> Result<(), ApeError> {
        self.symbol_table.push_block_scope();
        let result = self.compile_foreach_inner(heap, pos, item, source, body);
        self.symbol_table.pop_block_scope();
        result
    }

    fn compile_foreach_inner(
        &mut self,
        heap: &mut Heap,
        pos: Pos,
        item: &Ident,
        source: &Expr,
        body: &Block,
    ) -> Result<(), ApeError> {
        self.pos = pos;
        let index_symbol = self.define_synthetic("i")?;
        self.emit(Opcode::Number, &[0]);
        self.emit_store(&index_symbol, pos)?;

        let source_symbol = match &source.kind {
            ExprKind::Ident(name) => match self.symbol_table.resolve(name) {
                Some(s) if matches!(s.scope, SymbolScope::Global | SymbolScope::Local) => s,
                _ => self.compile_foreach_source(heap, pos, source)?,
            },
            _ => self.compile_foreach_source(heap, pos, source)?,
        };

        let to_test = self.emit_placeholder(Opcode::Jump);

        let update_start = self.current_ip();
        self.emit_load(&index_symbol);
        self.emit(Opcode::Number, &[1]);
        self.emit(Opcode::Add, &[]);
        self.emit_store(&index_symbol, pos)?;

        let test_start = self.current_ip();
        self.patch_u16(to_test, test_start);
        self.emit_load(&source_symbol);
        self.emit(Opcode::Len, &[]);
        self.emit_load(&index_symbol);
        self.emit(Opcode::Equal, &[]);
        let to_body = self.emit_placeholder(Opcode::JumpIfFalse);
        let break_jump_ip = self.current_ip();
        let to_end = self.emit_placeholder(Opcode::Jump);
        let body_start = self.current_ip();
        self.patch_u16(to_body, body_start);

        self.emit_load(&source_symbol);
        self.emit_load(&index_symbol);
        self.emit(Opcode::GetValueAt, &[]);
        let item_symbol = self.define_symbol(&item.name, item.pos, true)?;
        self.emit_store(&item_symbol, item.pos)?;

        self.begin_loop(update_start, break_jump_ip);
        let body_result = self.compile_block(heap, body);
        self.end_loop();
        body_result?;

        self.emit(Opcode::Jump, &[update_start as u64]);
        let end = self.current_ip();
        self.patch_u16(to_end, end);
        Ok(())
    }

    fn compile_foreach_source(
        &mut self,
        heap: &mut Heap,
        pos: Pos,
        source: &Expr,
    ) -> Result<Symbol, ApeError> {
        self.compile_expression(heap, source)?;
        self.pos = pos;
        let symbol = self.define_synthetic("src")?;
        self.emit_store(&symbol, pos)?;
        Ok(symbol)
    }

    /// `recover (e) { ... }` registers the handler address in the current
    /// frame and jumps over the handler body. The body must return.
    fn compile_recover(
        &mut self,
        heap: &mut Heap,
        pos: Pos,
        error_ident: &Ident,
        body: &Block,
    ) -> Result<(), ApeError> {
        if self.scopes.len() == 1 {
            return Err(ApeError::compile(
                "recover statement must be inside a function",
                pos,
            ));
        }
        let handler_target = self.emit_placeholder(Opcode::SetRecover);
        let to_end = self.emit_placeholder(Opcode::Jump);
        let handler_start = self.current_ip();
        self.patch_u16(handler_target, handler_start);

        self.symbol_table.push_block_scope();
        let symbol = self.define_symbol(&error_ident.name, error_ident.pos, false)?;
        self.emit_store(&symbol, error_ident.pos)?;
        let body_result = body
            .statements
            .iter()
            .try_for_each(|stmt| self.compile_statement(heap, stmt));
        self.symbol_table.pop_block_scope();
        body_result?;

        if !matches!(self.last_opcode(), Opcode::Return | Opcode::ReturnValue) {
            return Err(ApeError::compile(
                "recover body must end with a return statement",
                pos,
            ));
        }
        let end = self.current_ip();
        self.patch_u16(to_end, end);
        Ok(())
    }

    fn begin_loop(&mut self, continue_target: usize, break_jump_ip: usize) {
        self.scopes
            .last_mut()
            .expect("at least one scope")
            .loops
            .push(LoopContext {
                continue_target,
                break_jump_ip,
            });
    }

    fn end_loop(&mut self) {
        self.scopes.last_mut().expect("at least one scope").loops.pop();
    }

    // ── Expressions ───────────────────────────────────────────────────────

    fn compile_expression(&mut self, heap: &mut Heap, expr: &Expr) -> Result<(), ApeError> {
        self.pos = expr.pos;
        match &expr.kind {
            ExprKind::NumberLit(n) => {
                let index = self.add_constant(Value::number(*n))?;
                self.emit(Opcode::Constant, &[index]);
                Ok(())
            }
            ExprKind::StringLit(s) => {
                let value = heap.make_string(s)?;
                let index = self.add_constant(value)?;
                self.emit(Opcode::Constant, &[index]);
                Ok(())
            }
            ExprKind::BoolLit(true) => {
                self.emit(Opcode::True, &[]);
                Ok(())
            }
            ExprKind::BoolLit(false) => {
                self.emit(Opcode::False, &[]);
                Ok(())
            }
            ExprKind::NullLit => {
                self.emit(Opcode::Null, &[]);
                Ok(())
            }
            ExprKind::Ident(name) => {
                let symbol = self.symbol_table.resolve(name).ok_or_else(|| {
                    ApeError::compile(format!("unknown symbol '{}'", name), expr.pos)
                })?;
                self.emit_load(&symbol);
                Ok(())
            }
            ExprKind::Prefix { op, right } => {
                self.compile_expression(heap, right)?;
                self.pos = expr.pos;
                match op {
                    PrefixOp::Minus => self.emit(Opcode::Minus, &[]),
                    PrefixOp::Bang => self.emit(Opcode::Bang, &[]),
                };
                Ok(())
            }
            ExprKind::Infix { op, left, right } => {
                // `<`/`<=` compile as swapped `>`/`>=`; no dedicated opcode.
                let (swap, opcode) = match op {
                    InfixOp::Add => (false, Opcode::Add),
                    InfixOp::Sub => (false, Opcode::Sub),
                    InfixOp::Mul => (false, Opcode::Mul),
                    InfixOp::Div => (false, Opcode::Div),
                    InfixOp::Mod => (false, Opcode::Mod),
                    InfixOp::Equal => (false, Opcode::Equal),
                    InfixOp::NotEqual => (false, Opcode::NotEqual),
                    InfixOp::GreaterThan => (false, Opcode::GreaterThan),
                    InfixOp::GreaterThanEqual => (false, Opcode::GreaterThanEqual),
                    InfixOp::LessThan => (true, Opcode::GreaterThan),
                    InfixOp::LessThanEqual => (true, Opcode::GreaterThanEqual),
                };
                if swap {
                    self.compile_expression(heap, right)?;
                    self.compile_expression(heap, left)?;
                } else {
                    self.compile_expression(heap, left)?;
                    self.compile_expression(heap, right)?;
                }
                self.pos = expr.pos;
                self.emit(opcode, &[]);
                Ok(())
            }
            ExprKind::Logical { op, left, right } => {
                self.compile_expression(heap, left)?;
                self.pos = expr.pos;
                self.emit(Opcode::Dup, &[]);
                let short_circuit = match op {
                    LogicalOp::Or => self.emit_placeholder(Opcode::JumpIfTrue),
                    LogicalOp::And => self.emit_placeholder(Opcode::JumpIfFalse),
                };
                self.emit(Opcode::Pop, &[]);
                self.compile_expression(heap, right)?;
                let end = self.current_ip();
                self.patch_u16(short_circuit, end);
                Ok(())
            }
            ExprKind::ArrayLit(elements) => {
                for element in elements {
                    self.compile_expression(heap, element)?;
                }
                self.pos = expr.pos;
                self.emit(Opcode::Array, &[elements.len() as u64]);
                Ok(())
            }
            ExprKind::MapLit(entries) => {
                for (key, value) in entries {
                    self.compile_expression(heap, key)?;
                    self.compile_expression(heap, value)?;
                }
                self.pos = expr.pos;
                self.emit(Opcode::Map, &[(entries.len() * 2) as u64]);
                Ok(())
            }
            ExprKind::Index { left, index } => {
                self.compile_expression(heap, left)?;
                self.compile_expression(heap, index)?;
                self.pos = expr.pos;
                self.emit(Opcode::GetIndex, &[]);
                Ok(())
            }
            ExprKind::Call { function, args } => {
                self.compile_expression(heap, function)?;
                for arg in args {
                    self.compile_expression(heap, arg)?;
                }
                self.pos = expr.pos;
                self.emit(Opcode::Call, &[args.len() as u64]);
                Ok(())
            }
            ExprKind::FnLit(fn_lit) => self.compile_fn_literal(heap, fn_lit, expr.pos),
            ExprKind::Assign { target, value } => {
                self.compile_assign(heap, target, value, expr.pos)
            }
        }
    }

    /// Assignment leaves the assigned value on the stack via `DUP`
    fn compile_assign(
        &mut self,
        heap: &mut Heap,
        target: &Expr,
        value: &Expr,
        pos: Pos,
    ) -> Result<(), ApeError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let symbol = self.symbol_table.resolve(name).ok_or_else(|| {
                    ApeError::compile(format!("unknown symbol '{}'", name), target.pos)
                })?;
                if !symbol.assignable {
                    return Err(ApeError::compile(
                        format!("cannot assign to constant '{}'", name),
                        target.pos,
                    ));
                }
                self.compile_expression(heap, value)?;
                self.pos = pos;
                self.emit(Opcode::Dup, &[]);
                self.emit_store(&symbol, target.pos)
            }
            ExprKind::Index { left, index } => {
                self.compile_expression(heap, value)?;
                self.pos = pos;
                self.emit(Opcode::Dup, &[]);
                self.compile_expression(heap, left)?;
                self.compile_expression(heap, index)?;
                self.pos = target.pos;
                self.emit(Opcode::SetIndex, &[]);
                Ok(())
            }
            _ => Err(ApeError::compile("invalid assignment target", target.pos)),
        }
    }

    /// Function literals compile in their own scope and symbol table; the
    /// emitted `FUNCTION` instruction is preceded by one load per captured
    /// free variable so the VM can bind them at closure construction.
    fn compile_fn_literal(
        &mut self,
        heap: &mut Heap,
        fn_lit: &FnLit,
        pos: Pos,
    ) -> Result<(), ApeError> {
        self.push_compilation_scope();
        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::enclosed(outer);
        if let Some(name) = &fn_lit.name {
            self.symbol_table.define_function_name(name);
        }

        let compiled = self.compile_fn_body(heap, fn_lit);

        let num_locals = self.symbol_table.num_definitions();
        let free_symbols = self.symbol_table.free_symbols().to_vec();
        let inner = std::mem::take(&mut self.symbol_table);
        self.symbol_table = inner.into_outer().expect("function table has an outer");
        let result = self.pop_compilation_scope();
        compiled?;

        let function = heap.make_function(ScriptFunction {
            name: fn_lit.name.as_deref().map(Rc::from),
            arity: fn_lit.params.len(),
            code: Rc::new(result),
            num_locals,
            free: Vec::new(),
        })?;
        let const_index = self.add_constant(function)?;

        for symbol in &free_symbols {
            match symbol.scope {
                SymbolScope::Local => {
                    self.emit(Opcode::GetLocal, &[symbol.index as u64]);
                }
                SymbolScope::Free => {
                    self.emit(Opcode::GetFree, &[symbol.index as u64]);
                }
                SymbolScope::Function => {
                    self.emit(Opcode::CurrentFunction, &[]);
                }
                SymbolScope::Global | SymbolScope::Builtin => {
                    return Err(ApeError::compile(
                        format!("invalid capture of '{}'", symbol.name),
                        pos,
                    ))
                }
            }
        }
        self.pos = pos;
        self.emit(Opcode::Function, &[const_index, free_symbols.len() as u64]);
        Ok(())
    }

    fn compile_fn_body(&mut self, heap: &mut Heap, fn_lit: &FnLit) -> Result<(), ApeError> {
        for param in &fn_lit.params {
            self.define_symbol(&param.name, param.pos, false)?;
        }
        // Body statements share the parameter scope; a function body with
        // no explicit trailing return returns null.
        for stmt in &fn_lit.body.statements {
            self.compile_statement(heap, stmt)?;
        }
        if !matches!(self.last_opcode(), Opcode::Return | Opcode::ReturnValue) {
            self.pos = fn_lit.body.pos;
            self.emit(Opcode::Return, &[]);
        }
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}
