pub mod disassembly;
pub mod graph;
pub mod opcodes;

pub use disassembly::{Instruction, InstructionIndex};
pub use graph::{BasicBlock, Cfg};
pub use opcodes::Opcode;
