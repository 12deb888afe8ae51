use crate::cfg::disassembly::Instruction;
use crate::cfg::opcodes::Opcode;
use crate::symbolic::error::SymbolicFailure;
use crate::symbolic::opcodes::context::MAX_COPY_LEN;
use crate::symbolic::opcodes::{OpcodeEnv, Step};
use crate::symbolic::state::SymbolicState;
use crate::symbolic::utils::math::{clean_address_word, one, val, zero};
use crate::symbolic::z3_ext::usize_from_bv;
use z3::ast::BV;

pub fn handle_calls<'ctx>(
    state: &mut SymbolicState<'ctx>,
    ins: &Instruction,
    env: &OpcodeEnv<'_>,
) -> Result<Step<'ctx>, SymbolicFailure> {
    match ins.op {
        Opcode::Call | Opcode::CallCode | Opcode::DelegateCall | Opcode::StaticCall => {
            let _gas = state.sym_stack.pop();
            let _target = state.sym_stack.pop();
            if matches!(ins.op, Opcode::Call | Opcode::CallCode) {
                let _value = state.sym_stack.pop();
            }
            let _args_offset = state.sym_stack.pop();
            let _args_len = state.sym_stack.pop();
            let ret_offset = state.sym_stack.pop();
            let ret_len = state.sym_stack.pop();
            state.calls.push(ins.addr);
            handle_call_result(state, ins, env, &ret_offset, &ret_len);
            Ok(Step::Continue)
        }
        Opcode::Create | Opcode::Create2 => {
            let _value = state.sym_stack.pop();
            let _offset = state.sym_stack.pop();
            let _len = state.sym_stack.pop();
            if ins.op == Opcode::Create2 {
                let _salt = state.sym_stack.pop();
            }
            state.return_data = Some(Vec::new());
            let created = state.fresh_word("create");
            state.sym_stack.push(clean_address_word(&created));
            Ok(Step::Continue)
        }
        Opcode::Return | Opcode::Revert => {
            state.sym_stack.pop();
            state.sym_stack.pop();
            Ok(Step::Halt)
        }
        Opcode::SelfDestruct => {
            state.sym_stack.pop();
            Ok(Step::Halt)
        }
        _ => Ok(Step::Continue),
    }
}

/// Push the call's success flag and expose its return data.
///
/// A matching observed record makes both concrete. Otherwise success is a fresh 0/1
/// variable, the return buffer is overwritten with unconstrained bytes and later
/// return-data reads fail as external data.
fn handle_call_result<'ctx>(
    state: &mut SymbolicState<'ctx>,
    ins: &Instruction,
    env: &OpcodeEnv<'_>,
    ret_offset: &BV<'ctx>,
    ret_len: &BV<'ctx>,
) {
    let ctx = state.context;
    let ret_len = usize_from_bv(ret_len).filter(|len| *len <= MAX_COPY_LEN);

    if let Some(record) = env.context.record_for(ins.addr) {
        tracing::debug!(
            "[SYMBOLIC] using observed call result at {:#x} (success={})",
            ins.addr,
            record.success
        );
        if let Some(len) = ret_len {
            for (i, byte) in record.return_data.iter().take(len).enumerate() {
                state.write_byte(
                    &ret_offset.bvadd(&val(ctx, i as u64)),
                    &BV::from_u64(ctx, *byte as u64, 8),
                );
            }
        }
        state.return_data = Some(record.return_data.clone());
        state
            .sym_stack
            .push(if record.success { one(ctx) } else { zero(ctx) });
        return;
    }

    if let Some(len) = ret_len {
        for i in 0..len {
            let byte = state.fresh_byte("returndata");
            state.write_byte(&ret_offset.bvadd(&val(ctx, i as u64)), &byte);
        }
    }
    state.return_data = None;
    let success = state.fresh_word("call_success");
    state.assume(success.bvule(&one(ctx)));
    state.sym_stack.push(success);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::state::{CallRecord, ExecutionContext};
    use crate::symbolic::z3_ext::u256_from_bv;
    use alloy::primitives::U256;
    use z3::{Config, Context};

    fn call_at(addr: usize) -> Instruction {
        Instruction {
            addr,
            op: Opcode::StaticCall,
            arg: Vec::new(),
            block: 0,
        }
    }

    fn push_call_args<'ctx>(ctx: &'ctx Context, state: &mut SymbolicState<'ctx>) {
        // retLen, retOffset, argsLen, argsOffset, target, gas (bottom to top)
        for v in [32u64, 0x80, 0, 0, 0xdead, 10_000] {
            state.sym_stack.push(val(ctx, v));
        }
    }

    #[test]
    fn test_observed_call_record_fills_return_buffer() {
        let ctx = Context::new(&Config::new());
        let mut state = SymbolicState::new(&ctx);
        let mut data = vec![0u8; 32];
        data[31] = 9;
        let context = ExecutionContext {
            xcall: vec![CallRecord {
                pc: 0x20,
                success: true,
                return_data: data,
            }],
            ..ExecutionContext::default()
        };
        let env = OpcodeEnv {
            code: &[],
            context: &context,
            follow_jumps: true,
        };
        push_call_args(&ctx, &mut state);
        handle_calls(&mut state, &call_at(0x20), &env).unwrap();
        assert!(!state.sym_stack.take_underflowed());
        assert_eq!(u256_from_bv(&state.sym_stack.pop()), Some(U256::from(1)));
        assert_eq!(u256_from_bv(&state.read_word(&val(&ctx, 0x80))), Some(U256::from(9)));
        assert_eq!(state.return_data.as_ref().map(Vec::len), Some(32));
    }

    #[test]
    fn test_unobserved_call_has_boolean_success() {
        let ctx = Context::new(&Config::new());
        let mut state = SymbolicState::new(&ctx);
        let context = ExecutionContext::default();
        let env = OpcodeEnv {
            code: &[],
            context: &context,
            follow_jumps: true,
        };
        push_call_args(&ctx, &mut state);
        handle_calls(&mut state, &call_at(0x30), &env).unwrap();
        assert_eq!(state.sym_stack.len(), 1);
        assert_eq!(state.constraints.len(), 1);
        assert!(state.return_data.is_none());
        assert_eq!(state.calls, vec![0x30]);
    }
}
