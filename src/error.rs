//! Error types returned by the memory context and the interpreter.

use std::fmt;

/// Failure modes of the memory context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// The access did not lie entirely within a single arena, or (in strict
    /// mode) entirely within a single allocated block.
    OutOfRange {
        addr: u32,
        len: u32,
        reason: &'static str,
    },
    /// A precondition of the call was violated (misaligned address, oversized
    /// pstring, overflowed free-block split, and so on).
    InvalidArgument { reason: &'static str },
    /// An internal bookkeeping invariant was violated. Always a bug, never a
    /// consequence of caller input.
    LogicError { reason: String },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfRange { addr, len, reason } => {
                write!(f, "out of range at {addr:#010X} len {len}: {reason}")
            }
            MemoryError::InvalidArgument { reason } => write!(f, "invalid argument: {reason}"),
            MemoryError::LogicError { reason } => write!(f, "logic error: {reason}"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Failure modes of the interpreter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmulatorError {
    /// A memory-context failure surfaced while executing an instruction.
    Memory(MemoryError),
    /// A decoded operand combination is invalid (e.g. a byte-sized
    /// immediate, or an effective address that cannot serve as a
    /// destination).
    InvalidArgument { reason: &'static str },
    /// The opcode or addressing form is recognized but not executed by this
    /// interpreter (full extension word, `roxl`/`roxr`, `sbcd`, and so on).
    Unimplemented { opcode: u16, reason: &'static str },
    /// `divu.w`/`divs.w` with a zero divisor.
    DivisionByZero,
    /// `trapv` with V set, or `trap #n`.
    Trap { number: Option<u8> },
    /// An internal invariant was violated.
    LogicError { reason: String },
}

impl fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorError::Memory(e) => write!(f, "{e}"),
            EmulatorError::InvalidArgument { reason } => write!(f, "invalid argument: {reason}"),
            EmulatorError::Unimplemented { opcode, reason } => {
                write!(f, "unimplemented opcode {opcode:#06X}: {reason}")
            }
            EmulatorError::DivisionByZero => write!(f, "division by zero"),
            EmulatorError::Trap { number: Some(n) } => write!(f, "trap #{n}"),
            EmulatorError::Trap { number: None } => write!(f, "overflow trap (trapv)"),
            EmulatorError::LogicError { reason } => write!(f, "logic error: {reason}"),
        }
    }
}

impl std::error::Error for EmulatorError {}

impl From<MemoryError> for EmulatorError {
    fn from(e: MemoryError) -> Self {
        EmulatorError::Memory(e)
    }
}
