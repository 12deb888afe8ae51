use crate::cfg::disassembly::Instruction;
use crate::cfg::opcodes::Opcode;
use crate::symbolic::state::SymbolicState;
use crate::symbolic::z3_ext::bv_from_u256;
use crate::utils::hex::be_bytes_to_u256;

pub fn handle_stack<'ctx>(state: &mut SymbolicState<'ctx>, ins: &Instruction) {
    match ins.op {
        Opcode::Push(width) => {
            // Immediates cut off by the end of code are right-padded with zeros.
            let mut bytes = ins.arg.clone();
            bytes.resize(width as usize, 0);
            let value = be_bytes_to_u256(&bytes);
            state.sym_stack.push(bv_from_u256(state.context, value));
        }
        Opcode::Dup(n) => {
            let value = state.sym_stack.peek(n as usize - 1);
            state.sym_stack.push(value);
        }
        Opcode::Swap(n) => {
            state.sym_stack.swap(n as usize);
        }
        Opcode::Pop => {
            state.sym_stack.pop();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::utils::math::val;
    use crate::symbolic::z3_ext::u256_from_bv;
    use alloy::primitives::U256;
    use z3::{Config, Context};

    fn ins(op: Opcode, arg: Vec<u8>) -> Instruction {
        Instruction {
            addr: 0,
            op,
            arg,
            block: 0,
        }
    }

    #[test]
    fn test_dup_and_swap_address_stack_from_top() {
        let ctx = Context::new(&Config::new());
        let mut state = SymbolicState::new(&ctx);
        state.sym_stack.push(val(&ctx, 1));
        state.sym_stack.push(val(&ctx, 2));
        handle_stack(&mut state, &ins(Opcode::Dup(2), Vec::new()));
        assert_eq!(u256_from_bv(&state.sym_stack.peek(0)), Some(U256::from(1)));
        handle_stack(&mut state, &ins(Opcode::Swap(2), Vec::new()));
        assert_eq!(u256_from_bv(&state.sym_stack.peek(0)), Some(U256::from(1)));
        assert_eq!(u256_from_bv(&state.sym_stack.peek(2)), Some(U256::from(1)));
        handle_stack(&mut state, &ins(Opcode::Swap(3), Vec::new()));
        assert!(state.sym_stack.take_underflowed());
    }

    #[test]
    fn test_truncated_push_is_right_padded() {
        let ctx = Context::new(&Config::new());
        let mut state = SymbolicState::new(&ctx);
        handle_stack(&mut state, &ins(Opcode::Push(2), vec![0x12]));
        assert_eq!(u256_from_bv(&state.sym_stack.pop()), Some(U256::from(0x1200)));
    }
}
