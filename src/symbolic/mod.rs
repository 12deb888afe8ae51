//! z3-backed symbolic interpreter.
//!
//! `run_symbolic` follows a concrete block path and checks its branch conditions;
//! `run_slice` replays a straight-line backward slice without checking anything.

pub mod engine;
pub mod error;
pub mod opcodes;
pub mod state;
pub mod utils;
pub mod z3_ext;

pub use engine::{run_slice, run_symbolic, SymbolicOutcome};
pub use error::{SymbolicError, SymbolicErrorKind, SymbolicFailure};
pub use state::{CallRecord, ExecutionContext, SymbolicState};
