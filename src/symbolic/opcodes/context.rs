use crate::cfg::disassembly::Instruction;
use crate::cfg::opcodes::Opcode;
use crate::symbolic::error::{SymbolicError, SymbolicErrorKind, SymbolicFailure};
use crate::symbolic::opcodes::OpcodeEnv;
use crate::symbolic::state::SymbolicState;
use crate::symbolic::utils::math::val;
use crate::symbolic::z3_ext::usize_from_bv;
use z3::ast::BV;

/// Largest CALLDATACOPY/CODECOPY/RETURNDATACOPY length copied byte by byte.
pub const MAX_COPY_LEN: usize = 4096;

pub fn handle_context<'ctx>(
    state: &mut SymbolicState<'ctx>,
    ins: &Instruction,
    env: &OpcodeEnv<'_>,
) -> Result<(), SymbolicFailure> {
    let ctx = state.context;
    match ins.op {
        Opcode::Address => {
            let v = state.named_address("address");
            state.sym_stack.push(v);
        }
        Opcode::Origin => {
            let v = state.named_address("origin");
            state.sym_stack.push(v);
        }
        Opcode::Caller => {
            let v = state.named_address("caller");
            state.sym_stack.push(v);
        }
        Opcode::Coinbase => {
            let v = state.named_address("coinbase");
            state.sym_stack.push(v);
        }
        Opcode::CallValue => {
            let v = state.named_word("callvalue");
            state.sym_stack.push(v);
        }
        Opcode::GasPrice => {
            let v = state.named_word("gasprice");
            state.sym_stack.push(v);
        }
        Opcode::Timestamp => {
            let v = state.named_word("timestamp");
            state.sym_stack.push(v);
        }
        Opcode::Number => {
            let v = state.named_word("number");
            state.sym_stack.push(v);
        }
        Opcode::PrevRandao => {
            let v = state.named_word("prevrandao");
            state.sym_stack.push(v);
        }
        Opcode::GasLimit => {
            let v = state.named_word("gaslimit");
            state.sym_stack.push(v);
        }
        Opcode::ChainId => {
            let v = state.named_word("chainid");
            state.sym_stack.push(v);
        }
        Opcode::BaseFee => {
            let v = state.named_word("basefee");
            state.sym_stack.push(v);
        }
        Opcode::SelfBalance => {
            let v = state.named_word("selfbalance");
            state.sym_stack.push(v);
        }
        Opcode::BlockHash => {
            state.sym_stack.pop();
            let v = state.fresh_word("blockhash");
            state.sym_stack.push(v);
        }
        Opcode::CallDataLoad => {
            let offset = state.sym_stack.pop();
            let word = state.calldata_word(&offset);
            state.sym_stack.push(word);
        }
        Opcode::CallDataSize => {
            let size = state.calldata_size.clone();
            state.sym_stack.push(size);
        }
        Opcode::CallDataCopy => {
            let dest = state.sym_stack.pop();
            let offset = state.sym_stack.pop();
            let len = copy_len(state, ins)?;
            for i in 0..len {
                let byte = state.calldata_byte(&offset.bvadd(&val(ctx, i as u64)));
                state.write_byte(&dest.bvadd(&val(ctx, i as u64)), &byte);
            }
        }
        Opcode::CodeSize => {
            state.sym_stack.push(val(ctx, env.code.len() as u64));
        }
        Opcode::CodeCopy => {
            let dest = state.sym_stack.pop();
            let offset = state.sym_stack.pop();
            let len = copy_len(state, ins)?;
            let Some(start) = usize_from_bv(&offset) else {
                return Err(range_error(ins, "code offset is symbolic"));
            };
            for i in 0..len {
                let byte = start
                    .checked_add(i)
                    .and_then(|at| env.code.get(at))
                    .copied()
                    .unwrap_or(0);
                state.write_byte(
                    &dest.bvadd(&val(ctx, i as u64)),
                    &BV::from_u64(ctx, byte as u64, 8),
                );
            }
        }
        Opcode::ReturnDataSize => {
            let Some(data) = state.return_data.as_ref() else {
                return Err(external(ins));
            };
            let size = val(ctx, data.len() as u64);
            state.sym_stack.push(size);
        }
        Opcode::ReturnDataCopy => {
            let dest = state.sym_stack.pop();
            let offset = state.sym_stack.pop();
            let len = copy_len(state, ins)?;
            let Some(data) = state.return_data.clone() else {
                return Err(external(ins));
            };
            let Some(start) = usize_from_bv(&offset) else {
                return Err(range_error(ins, "return data offset is symbolic"));
            };
            for i in 0..len {
                let byte = data.get(start + i).copied().unwrap_or(0);
                state.write_byte(
                    &dest.bvadd(&val(ctx, i as u64)),
                    &BV::from_u64(ctx, byte as u64, 8),
                );
            }
        }
        Opcode::Balance | Opcode::ExtCodeSize | Opcode::ExtCodeHash | Opcode::ExtCodeCopy => {
            return Err(external(ins));
        }
        _ => {}
    }
    Ok(())
}

fn copy_len(state: &mut SymbolicState<'_>, ins: &Instruction) -> Result<usize, SymbolicFailure> {
    let len = state.sym_stack.pop();
    usize_from_bv(&len)
        .filter(|len| *len <= MAX_COPY_LEN)
        .ok_or_else(|| range_error(ins, "copy length is symbolic or too large"))
}

fn range_error(ins: &Instruction, message: &str) -> SymbolicFailure {
    SymbolicError::new(
        ins.addr,
        ins.op.byte(),
        SymbolicErrorKind::SymbolicMemoryRange,
        message,
    )
    .into()
}

fn external(ins: &Instruction) -> SymbolicFailure {
    SymbolicFailure::ExternalData {
        pc: ins.addr,
        opcode: ins.op.byte(),
    }
}
