//! Symbol table and name binding
//!
//! One table per function scope, chained through `outer`; block scopes nest
//! within a table. Resolving a name that lives in a strict-enclosing
//! function scope promotes it to a `Free` binding in every intermediate
//! function table and records the original symbol as the capture source.

use crate::builtins;
use std::collections::HashMap;
use std::rc::Rc;

/// Where a resolved symbol lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    /// Top-level binding, addressed by global slot index
    Global,
    /// Function-local binding (parameters first, then locals)
    Local,
    /// Captured from an enclosing function scope
    Free,
    /// Entry in the builtin table
    Builtin,
    /// The name of the function currently being compiled (self-reference)
    Function,
}

/// A resolved name
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: Rc<str>,
    pub scope: SymbolScope,
    pub index: usize,
    pub assignable: bool,
}

/// Symbol table for one function scope
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    block_scopes: Vec<HashMap<Rc<str>, Symbol>>,
    free_symbols: Vec<Symbol>,
    num_definitions: usize,
}

impl SymbolTable {
    /// The top-level (global) table
    pub fn new() -> Self {
        Self {
            outer: None,
            block_scopes: vec![HashMap::new()],
            free_symbols: Vec::new(),
            num_definitions: 0,
        }
    }

    /// A function-scope table enclosed by `outer`
    pub fn enclosed(outer: SymbolTable) -> Self {
        Self {
            outer: Some(Box::new(outer)),
            block_scopes: vec![HashMap::new()],
            free_symbols: Vec::new(),
            num_definitions: 0,
        }
    }

    /// Detach and return the enclosing table; used when a function scope closes
    pub fn into_outer(self) -> Option<SymbolTable> {
        self.outer.map(|b| *b)
    }

    pub fn is_global(&self) -> bool {
        self.outer.is_none()
    }

    /// Open a block scope within the current function
    pub fn push_block_scope(&mut self) {
        self.block_scopes.push(HashMap::new());
    }

    /// Close the innermost block scope. Slot indices are not reused.
    pub fn pop_block_scope(&mut self) {
        if self.block_scopes.len() > 1 {
            self.block_scopes.pop();
        }
    }

    /// Highest number of slots this scope ever needed (locals count)
    pub fn num_definitions(&self) -> usize {
        self.num_definitions
    }

    /// Capture sources for this function, in free-index order. Each entry is
    /// the symbol as resolvable in the *enclosing* scope.
    pub fn free_symbols(&self) -> &[Symbol] {
        &self.free_symbols
    }

    /// Define a name in the innermost block scope.
    /// Fails when the name already exists in that scope.
    pub fn define(&mut self, name: &str, assignable: bool) -> Result<Symbol, String> {
        let scope_map = self.block_scopes.last_mut().expect("at least one block scope");
        if scope_map.contains_key(name) {
            return Err(format!("symbol '{}' is already defined", name));
        }
        let symbol = Symbol {
            name: Rc::from(name),
            scope: if self.outer.is_none() {
                SymbolScope::Global
            } else {
                SymbolScope::Local
            },
            index: self.num_definitions,
            assignable,
        };
        self.num_definitions += 1;
        scope_map.insert(Rc::clone(&symbol.name), symbol.clone());
        Ok(symbol)
    }

    /// Register the name of the function whose body this table compiles, so
    /// recursive references resolve to the current function.
    pub fn define_function_name(&mut self, name: &str) {
        let symbol = Symbol {
            name: Rc::from(name),
            scope: SymbolScope::Function,
            index: 0,
            assignable: false,
        };
        self.block_scopes
            .first_mut()
            .expect("at least one block scope")
            .insert(Rc::clone(&symbol.name), symbol);
    }

    /// Resolve a name, promoting captures through intermediate scopes
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        // Innermost block scope first, for shadowing.
        for scope_map in self.block_scopes.iter().rev() {
            if let Some(symbol) = scope_map.get(name) {
                return Some(symbol.clone());
            }
        }

        // Already captured by this function?
        if let Some(i) = self.free_symbols.iter().position(|s| &*s.name == name) {
            let original = &self.free_symbols[i];
            return Some(Symbol {
                name: Rc::clone(&original.name),
                scope: SymbolScope::Free,
                index: i,
                assignable: original.assignable,
            });
        }

        match self.outer.as_mut() {
            None => builtins::lookup(name).map(|index| Symbol {
                name: Rc::from(name),
                scope: SymbolScope::Builtin,
                index,
                assignable: false,
            }),
            Some(outer) => {
                let symbol = outer.resolve(name)?;
                match symbol.scope {
                    // Globals and builtins are addressable from any depth.
                    SymbolScope::Global | SymbolScope::Builtin => Some(symbol),
                    // Anything function-scoped becomes a capture here.
                    SymbolScope::Local | SymbolScope::Free | SymbolScope::Function => {
                        Some(self.define_free(symbol))
                    }
                }
            }
        }
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        let index = self.free_symbols.len();
        let symbol = Symbol {
            name: Rc::clone(&original.name),
            scope: SymbolScope::Free,
            index,
            assignable: original.assignable,
        };
        self.free_symbols.push(original);
        symbol
    }
}
