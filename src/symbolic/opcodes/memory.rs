use crate::cfg::disassembly::Instruction;
use crate::cfg::opcodes::Opcode;
use crate::symbolic::error::{SymbolicError, SymbolicErrorKind, SymbolicFailure};
use crate::symbolic::state::SymbolicState;
use crate::symbolic::utils::math::val;
use crate::symbolic::z3_ext::{bv_from_u256, u256_from_bv, usize_from_bv};
use alloy::primitives::{keccak256, U256};
use z3::ast::BV;

/// Largest SHA3 input the model will hash.
pub const MAX_HASH_INPUT: usize = 1024;

pub fn handle_memory<'ctx>(
    state: &mut SymbolicState<'ctx>,
    ins: &Instruction,
) -> Result<(), SymbolicFailure> {
    match ins.op {
        Opcode::Sha3 => {
            let offset = state.sym_stack.pop();
            let size = state.sym_stack.pop();
            let Some(len) = usize_from_bv(&size).filter(|len| *len <= MAX_HASH_INPUT) else {
                return Err(SymbolicError::new(
                    ins.addr,
                    ins.op.byte(),
                    SymbolicErrorKind::SymbolicMemoryRange,
                    "hash length is symbolic or too large",
                )
                .into());
            };
            let hash = sha3(state, &offset, len);
            state.sym_stack.push(hash);
        }
        Opcode::MLoad => {
            let offset = state.sym_stack.pop();
            let word = state.read_word(&offset);
            state.sym_stack.push(word);
        }
        Opcode::MStore => {
            let offset = state.sym_stack.pop();
            let value = state.sym_stack.pop();
            state.write_word(&offset, &value);
        }
        Opcode::MStore8 => {
            let offset = state.sym_stack.pop();
            let value = state.sym_stack.pop();
            state.write_byte(&offset, &value);
        }
        Opcode::SLoad => {
            let key = state.sym_stack.pop();
            let value = state.sload(&key);
            state.sym_stack.push(value);
        }
        Opcode::SStore => {
            let key = state.sym_stack.pop();
            let value = state.sym_stack.pop();
            state.sstore(&key, &value);
        }
        Opcode::MSize => {
            let msize = state.fresh_word("msize");
            state.sym_stack.push(msize);
        }
        _ => {}
    }
    Ok(())
}

fn sha3<'ctx>(state: &mut SymbolicState<'ctx>, offset: &BV<'ctx>, len: usize) -> BV<'ctx> {
    let ctx = state.context;
    if len == 0 {
        return bv_from_u256(ctx, U256::from_be_bytes(keccak256([0u8; 0]).0));
    }
    let bytes: Vec<BV<'ctx>> = (0..len)
        .map(|i| state.read_byte(&offset.bvadd(&val(ctx, i as u64))))
        .collect();

    let concrete: Option<Vec<u8>> = bytes
        .iter()
        .map(|b| u256_from_bv(b).and_then(|v| u8::try_from(v).ok()))
        .collect();
    if let Some(preimage) = concrete {
        return bv_from_u256(ctx, U256::from_be_bytes(keccak256(&preimage).0));
    }

    let mut packed = bytes[0].clone();
    for b in &bytes[1..] {
        packed = packed.concat(b);
    }
    let hashed = if len % 32 == 0 {
        let words: Vec<BV<'ctx>> = (0..len / 32)
            .map(|w| {
                let hi = (len * 8 - 1 - w * 256) as u32;
                packed.extract(hi, hi - 255)
            })
            .collect();
        state.keccak.apply_words(&words)
    } else {
        state.keccak.apply_bytes(&packed)
    };
    hashed.unwrap_or_else(|| state.fresh_word("keccak"))
}
