use crate::cfg::disassembly::Instruction;
use crate::cfg::opcodes::Opcode;
use crate::symbolic::error::{SymbolicError, SymbolicErrorKind, SymbolicFailure};
use crate::symbolic::opcodes::{OpcodeEnv, Step};
use crate::symbolic::state::SymbolicState;
use crate::symbolic::utils::math::val;
use crate::symbolic::z3_ext::usize_from_bv;
use z3::ast::{Ast, BV};

pub fn handle_control<'ctx>(
    state: &mut SymbolicState<'ctx>,
    ins: &Instruction,
    env: &OpcodeEnv<'_>,
) -> Result<Step<'ctx>, SymbolicFailure> {
    match ins.op {
        Opcode::Stop | Opcode::Invalid => Ok(Step::Halt),
        Opcode::Unknown(byte) => Err(SymbolicError::new(
            ins.addr,
            byte,
            SymbolicErrorKind::UnsupportedOpcode,
            format!("undefined opcode 0x{byte:02x}"),
        )
        .into()),
        Opcode::Jump => {
            let dest = state.sym_stack.pop();
            if !env.follow_jumps {
                return Ok(Step::Continue);
            }
            Ok(Step::Jump(jump_target(ins, &dest)?))
        }
        Opcode::JumpI => {
            let dest = state.sym_stack.pop();
            let cond = state.sym_stack.pop();
            if !env.follow_jumps {
                return Ok(Step::Continue);
            }
            Ok(Step::Branch {
                dest: jump_target(ins, &dest)?,
                cond,
            })
        }
        Opcode::Pc => {
            state.sym_stack.push(val(state.context, ins.addr as u64));
            Ok(Step::Continue)
        }
        Opcode::Gas => {
            let gas = state.fresh_word("gas");
            state.sym_stack.push(gas);
            Ok(Step::Continue)
        }
        Opcode::JumpDest => Ok(Step::Continue),
        Opcode::Log(topics) => {
            for _ in 0..(topics as usize + 2) {
                state.sym_stack.pop();
            }
            Ok(Step::Continue)
        }
        _ => Ok(Step::Continue),
    }
}

fn jump_target(ins: &Instruction, dest: &BV<'_>) -> Result<usize, SymbolicFailure> {
    usize_from_bv(dest).ok_or_else(|| {
        SymbolicError::new(
            ins.addr,
            ins.op.byte(),
            SymbolicErrorKind::SymbolicJumpTarget,
            format!("jump target {} is not concrete", dest.simplify()),
        )
        .into()
    })
}
