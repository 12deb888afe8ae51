use crate::cfg::opcodes::Opcode;
use crate::symbolic::state::SymbolicState;
use crate::symbolic::utils::math;
use z3::ast::Ast;

pub fn handle_arithmetic<'ctx>(state: &mut SymbolicState<'ctx>, op: Opcode) {
    match op {
        Opcode::Add => {
            binary_op!(state, bvadd);
        }
        Opcode::Mul => {
            binary_op!(state, bvmul);
        }
        Opcode::Sub => {
            binary_op!(state, bvsub);
        }
        Opcode::Div => {
            binary_op!(state, math::safe_div);
        }
        Opcode::SDiv => {
            binary_op!(state, math::safe_sdiv);
        }
        Opcode::Mod => {
            binary_op!(state, math::safe_rem);
        }
        Opcode::SMod => {
            binary_op!(state, math::safe_srem);
        }
        Opcode::AddMod | Opcode::MulMod => {
            let a = math::widen(&state.sym_stack.pop());
            let b = math::widen(&state.sym_stack.pop());
            let m = math::widen(&state.sym_stack.pop());
            let wide = if op == Opcode::AddMod {
                a.bvadd(&b)
            } else {
                a.bvmul(&b)
            };
            state
                .sym_stack
                .push(math::safe_rem(&wide, &m).extract(255, 0));
        }
        Opcode::Exp => {
            let base = state.sym_stack.pop();
            let exponent = state.sym_stack.pop();
            state
                .sym_stack
                .push(math::symbolic_exp(state.context, &base, &exponent));
        }
        Opcode::SignExtend => {
            let b = state.sym_stack.pop();
            let x = state.sym_stack.pop();
            state
                .sym_stack
                .push(math::symbolic_signextend(state.context, &b, &x));
        }
        Opcode::Lt => {
            comparison_op!(state, bvult);
        }
        Opcode::Gt => {
            comparison_op!(state, bvugt);
        }
        Opcode::SLt => {
            comparison_op!(state, bvslt);
        }
        Opcode::SGt => {
            comparison_op!(state, bvsgt);
        }
        Opcode::Eq => {
            comparison_op!(state, _eq);
        }
        Opcode::IsZero => {
            let a = state.sym_stack.pop();
            let is_zero = a._eq(&math::zero(state.context));
            state
                .sym_stack
                .push(is_zero.ite(&math::one(state.context), &math::zero(state.context)));
        }
        Opcode::And => {
            binary_op!(state, bvand);
        }
        Opcode::Or => {
            binary_op!(state, bvor);
        }
        Opcode::Xor => {
            binary_op!(state, bvxor);
        }
        Opcode::Not => {
            unary_op!(state, bvnot);
        }
        Opcode::Byte => {
            let i = state.sym_stack.pop();
            let x = state.sym_stack.pop();
            state
                .sym_stack
                .push(math::symbolic_byte(state.context, &i, &x));
        }
        Opcode::Shl => {
            shift_op!(state, bvshl);
        }
        Opcode::Shr => {
            shift_op!(state, bvlshr);
        }
        Opcode::Sar => {
            shift_op!(state, bvashr);
        }
        _ => {}
    }
}
