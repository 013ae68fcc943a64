//! Error and traceback types
//!
//! All failures flow through the unified [`ApeError`] value, whatever phase
//! produced them; the kind discriminator tells parse errors from compile
//! errors from the various runtime failures.

use crate::span::Pos;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Source text could not be tokenized/parsed
    Parse,
    /// The AST could not be compiled
    Compile,
    /// A script operation failed at runtime
    Runtime,
    /// The wall-clock execution limit was exceeded
    Timeout,
    /// The host allocator refused an allocation
    Allocation,
    /// An error value constructed by script or host code
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Parse => "PARSE ERROR",
            ErrorKind::Compile => "COMPILATION ERROR",
            ErrorKind::Runtime => "RUNTIME ERROR",
            ErrorKind::Timeout => "TIMEOUT ERROR",
            ErrorKind::Allocation => "ALLOCATION ERROR",
            ErrorKind::User => "USER ERROR",
        };
        write!(f, "{}", s)
    }
}

/// One traceback entry: a function activation and the position it was
/// executing when the error was captured. Native frames report `(-1, -1)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracebackFrame {
    pub function_name: String,
    pub pos: Pos,
}

/// Ordered list of frames, innermost (raising) frame first
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Traceback {
    frames: Vec<TracebackFrame>,
}

impl Traceback {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Append a frame (innermost frames are appended first)
    pub fn push(&mut self, function_name: impl Into<String>, pos: Pos) {
        self.frames.push(TracebackFrame {
            function_name: function_name.into(),
            pos,
        });
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, i: usize) -> Option<&TracebackFrame> {
        self.frames.get(i)
    }

    pub fn line(&self, i: usize) -> i32 {
        self.frames.get(i).map_or(-1, |f| f.pos.line)
    }

    pub fn column(&self, i: usize) -> i32 {
        self.frames.get(i).map_or(-1, |f| f.pos.column)
    }

    pub fn function_name(&self, i: usize) -> &str {
        self.frames.get(i).map_or("", |f| f.function_name.as_str())
    }

    pub fn frames(&self) -> &[TracebackFrame] {
        &self.frames
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Traceback:")?;
        for frame in &self.frames {
            writeln!(f, "\t{}:{}: {}", frame.pos.line, frame.pos.column, frame.function_name)?;
        }
        Ok(())
    }
}

/// An Ape failure: kind, message, source position and, for runtime errors,
/// the captured traceback.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ApeError {
    pub kind: ErrorKind,
    pub message: String,
    pub pos: Pos,
    pub traceback: Option<Traceback>,
}

impl ApeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, pos: Pos) -> Self {
        Self {
            kind,
            message: message.into(),
            pos,
            traceback: None,
        }
    }

    pub fn parse(message: impl Into<String>, pos: Pos) -> Self {
        Self::new(ErrorKind::Parse, message, pos)
    }

    pub fn compile(message: impl Into<String>, pos: Pos) -> Self {
        Self::new(ErrorKind::Compile, message, pos)
    }

    pub fn runtime(message: impl Into<String>, pos: Pos) -> Self {
        Self::new(ErrorKind::Runtime, message, pos)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "execution time exceeded", Pos::unknown())
    }

    pub fn allocation() -> Self {
        Self::new(ErrorKind::Allocation, "allocation failed", Pos::unknown())
    }

    /// Attach a traceback snapshot
    pub fn with_traceback(mut self, traceback: Traceback) -> Self {
        self.traceback = Some(traceback);
        self
    }

    /// Multi-line human rendering: kind, position, message and traceback
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if self.pos.is_known() {
            out.push_str(&format!("{} at {}: {}\n", self.kind, self.pos, self.message));
        } else {
            out.push_str(&format!("{}: {}\n", self.kind, self.message));
        }
        if let Some(tb) = &self.traceback {
            out.push_str(&tb.to_string());
        }
        out
    }

    /// JSON rendering of the error (kind, message, position, traceback)
    pub fn serialize_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
