//! Source positions

use serde::Serialize;
use std::fmt;

/// A position in source text.
///
/// Lines and columns are 0-based. `-1` means "unknown" and is used for
/// native call frames and synthesized code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pos {
    /// Line number (0-based, -1 = unknown)
    pub line: i32,
    /// Column number (0-based, -1 = unknown)
    pub column: i32,
}

impl Pos {
    /// Create a position
    pub fn new(line: i32, column: i32) -> Self {
        Self { line, column }
    }

    /// The unknown position, `(-1, -1)`
    pub fn unknown() -> Self {
        Self {
            line: -1,
            column: -1,
        }
    }

    /// Whether this position carries real source coordinates
    pub fn is_known(&self) -> bool {
        self.line >= 0 && self.column >= 0
    }
}

impl Default for Pos {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}
