//! Trace-file parsing and the instruction dispatch loop.
//!
//! One instruction per line: `<pid> switch`, `<pid> alloc <hex size>`,
//! `<pid> free <hex addr>`, `<pid> access_{heap,stack,code} <hex addr>`.
//! Malformed lines are skipped with a diagnostic; processing stops at end
//! of input or just before a second `switch`.

use core::fmt;
use std::io::{self, BufRead};

use crate::memory::{AccessKind, MemoryError, MemoryManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Switch { pid: u32 },
    Alloc { pid: u32, size: u64 },
    Free { pid: u32, address: u32 },
    Access { pid: u32, kind: AccessKind, address: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    MissingField,
    BadPid,
    BadValue,
    UnknownInstruction,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingField => write!(f, "missing field"),
            ParseError::BadPid => write!(f, "unparseable process id"),
            ParseError::BadValue => write!(f, "unparseable hex value"),
            ParseError::UnknownInstruction => write!(f, "unknown instruction"),
        }
    }
}

#[derive(Debug)]
pub enum TraceError {
    Io(io::Error),
    Memory(MemoryError),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Io(e) => write!(f, "trace read failed: {}", e),
            TraceError::Memory(e) => write!(f, "instruction failed: {}", e),
        }
    }
}

impl std::error::Error for TraceError {}

impl From<io::Error> for TraceError {
    fn from(e: io::Error) -> Self {
        TraceError::Io(e)
    }
}

impl From<MemoryError> for TraceError {
    fn from(e: MemoryError) -> Self {
        TraceError::Memory(e)
    }
}

/// Parses one trace line. The pid field is decimal; sizes and addresses
/// are hex, with or without a `0x` prefix.
pub fn parse_line(line: &str) -> Result<Instruction, ParseError> {
    let mut fields = line.split_whitespace();
    let pid = fields
        .next()
        .ok_or(ParseError::MissingField)?
        .parse::<u32>()
        .map_err(|_| ParseError::BadPid)?;
    let op = fields.next().ok_or(ParseError::MissingField)?;

    let mut hex_value = || -> Result<u64, ParseError> {
        let field = fields.next().ok_or(ParseError::MissingField)?;
        let digits = field.trim_start_matches("0x");
        u64::from_str_radix(digits, 16).map_err(|_| ParseError::BadValue)
    };

    match op {
        "switch" => Ok(Instruction::Switch { pid }),
        "alloc" => Ok(Instruction::Alloc {
            pid,
            size: hex_value()?,
        }),
        "free" => Ok(Instruction::Free {
            pid,
            address: address_value(hex_value()?)?,
        }),
        "access_heap" => Ok(Instruction::Access {
            pid,
            kind: AccessKind::Heap,
            address: address_value(hex_value()?)?,
        }),
        "access_stack" => Ok(Instruction::Access {
            pid,
            kind: AccessKind::Stack,
            address: address_value(hex_value()?)?,
        }),
        "access_code" => Ok(Instruction::Access {
            pid,
            kind: AccessKind::Code,
            address: address_value(hex_value()?)?,
        }),
        _ => Err(ParseError::UnknownInstruction),
    }
}

fn address_value(value: u64) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::BadValue)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TraceSummary {
    pub executed: u64,
    pub skipped: u64,
    pub stopped_at_switch: bool,
}

/// Runs instructions against the memory manager until end of input or the
/// second `switch` (only the first one executes).
pub fn run_trace<R: BufRead>(reader: R, mm: &mut MemoryManager) -> Result<TraceSummary, TraceError> {
    let mut summary = TraceSummary::default();
    let mut switched = false;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let instruction = match parse_line(&line) {
            Ok(instruction) => instruction,
            Err(e) => {
                log::warn!("skipping malformed trace line {:?}: {}", line, e);
                summary.skipped += 1;
                continue;
            }
        };

        if matches!(instruction, Instruction::Switch { .. }) {
            if switched {
                summary.stopped_at_switch = true;
                break;
            }
            switched = true;
        }

        dispatch(instruction, mm)?;
        summary.executed += 1;
    }

    Ok(summary)
}

/// Routes one instruction to the memory manager. Non-switch instructions
/// act on the active process; their pid field is carried but not consulted.
fn dispatch(instruction: Instruction, mm: &mut MemoryManager) -> Result<(), MemoryError> {
    match instruction {
        Instruction::Switch { pid } => mm.switch_to(pid),
        Instruction::Alloc { size, .. } => mm.allocate(size).map(|_| ()),
        Instruction::Free { address, .. } => mm.free(address).map(|_| ()),
        Instruction::Access { kind, address, .. } => mm.access(address, kind).map(|_| ()),
    }
}
