#[macro_use]
pub mod op_macros;
pub mod arithmetic;
pub mod calls;
pub mod context;
pub mod control;
pub mod memory;
pub mod stack;

use crate::cfg::disassembly::Instruction;
use crate::cfg::opcodes::Opcode;
use crate::symbolic::error::SymbolicFailure;
use crate::symbolic::state::{ExecutionContext, SymbolicState};
use z3::ast::BV;

/// What the driver does after an instruction has been applied to the state.
pub enum Step<'ctx> {
    Continue,
    Jump(usize),
    Branch { dest: usize, cond: BV<'ctx> },
    Halt,
}

/// Read-only inputs visible to the opcode handlers.
pub struct OpcodeEnv<'a> {
    pub code: &'a [u8],
    pub context: &'a ExecutionContext,
    /// Straight-line slice runs pop jump operands without resolving targets.
    pub follow_jumps: bool,
}

pub fn dispatch<'ctx>(
    state: &mut SymbolicState<'ctx>,
    ins: &Instruction,
    env: &OpcodeEnv<'_>,
) -> Result<Step<'ctx>, SymbolicFailure> {
    match ins.op {
        Opcode::Add
        | Opcode::Mul
        | Opcode::Sub
        | Opcode::Div
        | Opcode::SDiv
        | Opcode::Mod
        | Opcode::SMod
        | Opcode::AddMod
        | Opcode::MulMod
        | Opcode::Exp
        | Opcode::SignExtend
        | Opcode::Lt
        | Opcode::Gt
        | Opcode::SLt
        | Opcode::SGt
        | Opcode::Eq
        | Opcode::IsZero
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::Not
        | Opcode::Byte
        | Opcode::Shl
        | Opcode::Shr
        | Opcode::Sar => {
            arithmetic::handle_arithmetic(state, ins.op);
            Ok(Step::Continue)
        }
        Opcode::Sha3
        | Opcode::MLoad
        | Opcode::MStore
        | Opcode::MStore8
        | Opcode::SLoad
        | Opcode::SStore
        | Opcode::MSize => {
            memory::handle_memory(state, ins)?;
            Ok(Step::Continue)
        }
        Opcode::Address
        | Opcode::Balance
        | Opcode::Origin
        | Opcode::Caller
        | Opcode::CallValue
        | Opcode::CallDataLoad
        | Opcode::CallDataSize
        | Opcode::CallDataCopy
        | Opcode::CodeSize
        | Opcode::CodeCopy
        | Opcode::GasPrice
        | Opcode::ExtCodeSize
        | Opcode::ExtCodeCopy
        | Opcode::ReturnDataSize
        | Opcode::ReturnDataCopy
        | Opcode::ExtCodeHash
        | Opcode::BlockHash
        | Opcode::Coinbase
        | Opcode::Timestamp
        | Opcode::Number
        | Opcode::PrevRandao
        | Opcode::GasLimit
        | Opcode::ChainId
        | Opcode::SelfBalance
        | Opcode::BaseFee => {
            context::handle_context(state, ins, env)?;
            Ok(Step::Continue)
        }
        Opcode::Push(_) | Opcode::Dup(_) | Opcode::Swap(_) | Opcode::Pop => {
            stack::handle_stack(state, ins);
            Ok(Step::Continue)
        }
        Opcode::Create
        | Opcode::Create2
        | Opcode::Call
        | Opcode::CallCode
        | Opcode::DelegateCall
        | Opcode::StaticCall
        | Opcode::Return
        | Opcode::Revert
        | Opcode::SelfDestruct => calls::handle_calls(state, ins, env),
        Opcode::Stop
        | Opcode::Jump
        | Opcode::JumpI
        | Opcode::Pc
        | Opcode::Gas
        | Opcode::JumpDest
        | Opcode::Log(_)
        | Opcode::Invalid
        | Opcode::Unknown(_) => control::handle_control(state, ins, env),
    }
}
