use thiserror::Error;

/// Why a symbolic run could not be completed on a structural level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolicErrorKind {
    EmptyPath,
    StackUnderflow,
    SymbolicJumpTarget,
    SymbolicMemoryRange,
    UnsupportedOpcode,
    SolverUnknown,
    MalformedPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pc={pc:#x} opcode=0x{opcode:02x} kind={kind:?}: {message}")]
pub struct SymbolicError {
    pub pc: usize,
    pub opcode: u8,
    pub kind: SymbolicErrorKind,
    pub message: String,
}

impl SymbolicError {
    pub fn new(pc: usize, opcode: u8, kind: SymbolicErrorKind, message: impl Into<String>) -> Self {
        Self {
            pc,
            opcode,
            kind,
            message: message.into(),
        }
    }
}

/// Terminal outcome of a symbolic run that did not produce a satisfiable state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolicFailure {
    /// The path constraints became unsatisfiable, or execution left the requested path.
    /// `trace` holds the executed instruction addresses, `remaining` the path suffix that
    /// was still expected when execution stopped.
    #[error("intractable path after {} instructions, {} path elements left", .trace.len(), .remaining.len())]
    IntractablePath {
        trace: Vec<usize>,
        remaining: Vec<usize>,
    },
    /// The path reads a value that only another account or a previous call can supply.
    #[error("external data read at {pc:#x} (opcode 0x{opcode:02x})")]
    ExternalData { pc: usize, opcode: u8 },
    #[error("symbolic error: {0}")]
    Symbolic(#[from] SymbolicError),
}

impl SymbolicFailure {
    pub fn intractable(trace: Vec<usize>, remaining: Vec<usize>) -> Self {
        Self::IntractablePath { trace, remaining }
    }
}
