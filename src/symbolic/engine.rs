use crate::cfg::disassembly::{Instruction, InstructionIndex};
use crate::symbolic::error::{SymbolicError, SymbolicErrorKind, SymbolicFailure};
use crate::symbolic::opcodes::{self, OpcodeEnv, Step};
use crate::symbolic::state::{ExecutionContext, SymbolicState};
use crate::symbolic::utils::math::zero;
use crate::symbolic::z3_ext::{configure_solver, u256_from_bv};
use alloy::primitives::U256;
use std::collections::VecDeque;
use z3::ast::{Ast, BV};
use z3::{Context, Model, SatResult, Solver};

/// Longest calldata reconstructed from a model.
pub const MAX_CALLDATA_LEN: usize = 4096;

/// A satisfiable state at (or just after) the final instruction of a path or slice.
pub struct SymbolicOutcome<'ctx> {
    pub state: SymbolicState<'ctx>,
    /// Stack operands of the final instruction, top of stack first.
    pub target_operands: Vec<BV<'ctx>>,
    /// Witness for the path constraints; slice runs carry no model.
    pub model: Option<Model<'ctx>>,
}

impl<'ctx> SymbolicOutcome<'ctx> {
    /// Operand `idx` of the final instruction, if it folds to a constant on its own.
    pub fn concrete_operand(&self, idx: usize) -> Option<U256> {
        self.target_operands.get(idx).and_then(u256_from_bv)
    }

    pub fn eval(&self, term: &BV<'ctx>) -> Option<U256> {
        match &self.model {
            Some(model) => model.eval(term, true).as_ref().and_then(u256_from_bv),
            None => u256_from_bv(term),
        }
    }

    /// Transaction input satisfying the path constraints.
    pub fn calldata(&self) -> Option<Vec<u8>> {
        let model = self.model.as_ref()?;
        let size = model
            .eval(&self.state.calldata_size, true)
            .as_ref()
            .and_then(u256_from_bv)?
            .min(U256::from(MAX_CALLDATA_LEN));
        let size = usize::try_from(size).ok()?;
        (0..size)
            .map(|i| {
                let idx = crate::symbolic::utils::math::val(self.state.context, i as u64);
                let byte = self.state.calldata.select(&idx).as_bv()?;
                model
                    .eval(&byte, true)
                    .as_ref()
                    .and_then(u256_from_bv)
                    .and_then(|v| u8::try_from(v).ok())
            })
            .collect()
    }

    pub fn callvalue(&self) -> Option<U256> {
        self.eval(&self.state.named_word("callvalue"))
    }
}

fn capture_operands<'ctx>(state: &mut SymbolicState<'ctx>, ins: &Instruction) -> Vec<BV<'ctx>> {
    let (pops, _) = ins.op.stack_io();
    let available = pops.min(state.sym_stack.len());
    (0..available).map(|i| state.sym_stack.peek(i)).collect()
}

fn remaining_or_target(remaining: &VecDeque<usize>, path: &[usize]) -> Vec<usize> {
    if remaining.is_empty() {
        path.last().copied().into_iter().collect()
    } else {
        remaining.iter().copied().collect()
    }
}

/// Assert every constraint collected since the last sync.
fn sync_solver<'ctx>(solver: &Solver<'ctx>, state: &SymbolicState<'ctx>, asserted: &mut usize) {
    for c in &state.constraints[*asserted..] {
        solver.assert(c);
    }
    *asserted = state.constraints.len();
}

/// Execute `path` (block starts followed by the target address) from its first block.
///
/// With `inclusive` the target instruction itself is executed, otherwise the run stops
/// right before it. Either way the target's stack operands are captured. Jumps must
/// follow the path; branch conditions are asserted as they are taken and checked
/// incrementally so that an infeasible prefix is reported with the trace executed so far.
pub fn run_symbolic<'ctx>(
    ctx: &'ctx Context,
    index: &InstructionIndex,
    path: &[usize],
    code: &[u8],
    context: &ExecutionContext,
    inclusive: bool,
) -> Result<SymbolicOutcome<'ctx>, SymbolicFailure> {
    let Some(&start) = path.first() else {
        return Err(SymbolicError::new(0, 0, SymbolicErrorKind::EmptyPath, "empty path").into());
    };

    let solver = Solver::new(ctx);
    configure_solver(ctx, &solver, context.solver_timeout_ms);
    let env = OpcodeEnv {
        code,
        context,
        follow_jumps: true,
    };

    let mut state = SymbolicState::new(ctx);
    let mut remaining: VecDeque<usize> = path.iter().copied().collect();
    let mut asserted = 0usize;
    let mut target_operands = Vec::new();
    let mut pc = start;

    loop {
        if !inclusive && remaining.len() == 1 && remaining[0] == pc {
            if let Some(ins) = index.get(&pc) {
                target_operands = capture_operands(&mut state, ins);
            }
            break;
        }
        if inclusive && remaining.is_empty() {
            break;
        }

        let Some(ins) = index.get(&pc) else {
            // Falling off the end of the code is an implicit STOP.
            return Err(SymbolicFailure::intractable(
                state.trace,
                remaining_or_target(&remaining, path),
            ));
        };
        if remaining.front() == Some(&pc) {
            remaining.pop_front();
        } else if ins.block == pc {
            // Entered a block the path does not list.
            return Err(SymbolicFailure::intractable(
                state.trace,
                remaining_or_target(&remaining, path),
            ));
        }

        state.trace.push(pc);
        if inclusive && remaining.is_empty() {
            target_operands = capture_operands(&mut state, ins);
        }

        let step = opcodes::dispatch(&mut state, ins, &env)?;
        if state.sym_stack.take_underflowed() {
            return Err(SymbolicError::new(
                ins.addr,
                ins.op.byte(),
                SymbolicErrorKind::StackUnderflow,
                "stack underflow",
            )
            .into());
        }

        match step {
            Step::Continue => pc = ins.next_addr(),
            Step::Jump(dest) => {
                if remaining.front() != Some(&dest) {
                    return Err(SymbolicFailure::intractable(
                        state.trace,
                        remaining_or_target(&remaining, path),
                    ));
                }
                pc = dest;
            }
            Step::Branch { dest, cond } => {
                let fallthrough = ins.next_addr();
                let next = remaining.front().copied();
                if next == Some(dest) && dest != fallthrough {
                    state.assume(cond._eq(&zero(ctx)).not());
                    pc = dest;
                } else if next == Some(fallthrough) && dest != fallthrough {
                    state.assume(cond._eq(&zero(ctx)));
                    pc = fallthrough;
                } else if next == Some(dest) {
                    pc = dest;
                } else {
                    return Err(SymbolicFailure::intractable(
                        state.trace,
                        remaining_or_target(&remaining, path),
                    ));
                }
                sync_solver(&solver, &state, &mut asserted);
                if solver.check() == SatResult::Unsat {
                    tracing::debug!("[SYMBOLIC] branch at {:#x} is infeasible", ins.addr);
                    return Err(SymbolicFailure::intractable(
                        state.trace,
                        remaining_or_target(&remaining, path),
                    ));
                }
            }
            Step::Halt => {
                return Err(SymbolicFailure::intractable(
                    state.trace,
                    remaining_or_target(&remaining, path),
                ));
            }
        }
    }

    sync_solver(&solver, &state, &mut asserted);
    match solver.check() {
        SatResult::Sat => {
            let model = solver.get_model();
            Ok(SymbolicOutcome {
                state,
                target_operands,
                model,
            })
        }
        SatResult::Unsat => Err(SymbolicFailure::intractable(
            state.trace,
            remaining_or_target(&remaining, path),
        )),
        SatResult::Unknown => {
            let last = state.trace.last().copied().unwrap_or(start);
            let reason = solver
                .get_reason_unknown()
                .unwrap_or_else(|| "unknown".to_string());
            Err(SymbolicError::new(
                last,
                index.get(&last).map(|i| i.op.byte()).unwrap_or(0),
                SymbolicErrorKind::SolverUnknown,
                reason,
            )
            .into())
        }
    }
}

/// Execute a straight-line slice in order, including its final instruction.
///
/// Jumps inside the slice only consume their operands. No constraints are checked.
pub fn run_slice<'ctx>(
    ctx: &'ctx Context,
    slice: &[&Instruction],
    code: &[u8],
    context: &ExecutionContext,
) -> Result<SymbolicOutcome<'ctx>, SymbolicFailure> {
    let Some(last) = slice.last() else {
        return Err(SymbolicError::new(0, 0, SymbolicErrorKind::EmptyPath, "empty slice").into());
    };
    let env = OpcodeEnv {
        code,
        context,
        follow_jumps: false,
    };
    let mut state = SymbolicState::new(ctx);
    let mut target_operands = Vec::new();

    for (i, ins) in slice.iter().enumerate() {
        state.trace.push(ins.addr);
        if i + 1 == slice.len() {
            target_operands = capture_operands(&mut state, ins);
        }
        let step = opcodes::dispatch(&mut state, ins, &env)?;
        if state.sym_stack.take_underflowed() {
            return Err(SymbolicError::new(
                ins.addr,
                ins.op.byte(),
                SymbolicErrorKind::StackUnderflow,
                "stack underflow",
            )
            .into());
        }
        if matches!(step, Step::Halt) && i + 1 < slice.len() {
            return Err(SymbolicFailure::intractable(state.trace, vec![last.addr]));
        }
    }

    Ok(SymbolicOutcome {
        state,
        target_operands,
        model: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::graph::Cfg;
    use crate::symbolic::state::CallRecord;
    use z3::Config;

    // 0x00: PUSH1 0x00 CALLDATALOAD PUSH1 0x0b JUMPI     (0x00..0x05)
    // 0x06: STOP
    // 0x07: INVALID x4
    // 0x0b: JUMPDEST PUSH1 0x2a PUSH1 0x05 SSTORE STOP   (0x0b..0x11)
    fn store_code() -> Vec<u8> {
        vec![
            0x60, 0x00, 0x35, 0x60, 0x0b, 0x57, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0x5b, 0x60, 0x2a,
            0x60, 0x05, 0x55, 0x00,
        ]
    }

    #[test]
    fn test_taken_branch_yields_model_with_nonzero_input() {
        let code = store_code();
        let index = Cfg::from_code(&code).index();
        let ctx = Context::new(&Config::new());
        let out = run_symbolic(
            &ctx,
            &index,
            &[0x00, 0x0b, 0x10],
            &code,
            &ExecutionContext::default(),
            false,
        )
        .unwrap();
        assert_eq!(out.concrete_operand(0), Some(U256::from(5)));
        assert_eq!(out.concrete_operand(1), Some(U256::from(0x2a)));
        let calldata = out.calldata().unwrap();
        assert!(calldata.iter().take(32).any(|b| *b != 0));
        assert_eq!(out.state.trace.last(), Some(&0x0e));
    }

    #[test]
    fn test_inclusive_run_executes_target() {
        let code = store_code();
        let index = Cfg::from_code(&code).index();
        let ctx = Context::new(&Config::new());
        let out = run_symbolic(
            &ctx,
            &index,
            &[0x00, 0x0b, 0x10],
            &code,
            &ExecutionContext::default(),
            true,
        )
        .unwrap();
        assert_eq!(out.state.trace.last(), Some(&0x10));
        assert_eq!(out.state.storage_writes.len(), 1);
        assert_eq!(out.concrete_operand(0), Some(U256::from(5)));
    }

    #[test]
    fn test_path_leaving_listed_blocks_is_intractable() {
        let code = store_code();
        let index = Cfg::from_code(&code).index();
        let ctx = Context::new(&Config::new());
        // Fallthrough block 0x06 halts before 0x0b is reached.
        let err = run_symbolic(
            &ctx,
            &index,
            &[0x00, 0x06, 0x0b, 0x10],
            &code,
            &ExecutionContext::default(),
            false,
        )
        .err()
        .unwrap();
        match err {
            SymbolicFailure::IntractablePath { trace, remaining } => {
                assert_eq!(trace.last(), Some(&0x06));
                assert_eq!(remaining, vec![0x0b, 0x10]);
            }
            other => panic!("unexpected failure {other:?}"),
        }
    }

    #[test]
    fn test_contradicting_branches_are_unsat() {
        // 0x00: CALLER        0x01: PUSH1 0x09  0x03: JUMPI
        // 0x04: CALLER        0x05: PUSH1 0x0b  0x07: JUMPI
        // 0x08: STOP
        // 0x09: JUMPDEST      0x0a: STOP
        // 0x0b: JUMPDEST      0x0c: STOP
        let code = vec![
            0x33, 0x60, 0x09, 0x57, 0x33, 0x60, 0x0b, 0x57, 0x00, 0x5b, 0x00, 0x5b, 0x00,
        ];
        let index = Cfg::from_code(&code).index();
        let ctx = Context::new(&Config::new());
        // Fall through the first branch (caller == 0), then take the second (caller != 0).
        let err = run_symbolic(
            &ctx,
            &index,
            &[0x00, 0x04, 0x0b, 0x0c],
            &code,
            &ExecutionContext::default(),
            false,
        )
        .err()
        .unwrap();
        match err {
            SymbolicFailure::IntractablePath { trace, remaining } => {
                assert_eq!(trace.last(), Some(&0x07));
                assert_eq!(remaining, vec![0x0b, 0x0c]);
            }
            other => panic!("unexpected failure {other:?}"),
        }
    }

    #[test]
    fn test_external_data_without_record() {
        // 0x00: PUSH1 0 x4, ADDRESS, GAS, STATICCALL (0x0a)
        // 0x0b: RETURNDATASIZE POP STOP
        let code = vec![
            0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x30, 0x5a, 0xfa, 0x3d, 0x50, 0x00,
        ];
        let index = Cfg::from_code(&code).index();
        let ctx = Context::new(&Config::new());
        let err = run_symbolic(&ctx, &index, &[0x00, 0x0d], &code, &ExecutionContext::default(), false)
            .err()
            .unwrap();
        assert_eq!(err, SymbolicFailure::ExternalData { pc: 0x0b, opcode: 0x3d });

        let context = ExecutionContext {
            xcall: vec![CallRecord {
                pc: 0x0a,
                success: true,
                return_data: vec![0u8; 4],
            }],
            ..ExecutionContext::default()
        };
        let out = run_symbolic(&ctx, &index, &[0x00, 0x0d], &code, &context, false).unwrap();
        assert_eq!(out.state.calls, vec![0x0a]);
    }

    #[test]
    fn test_empty_path_is_symbolic_error() {
        let ctx = Context::new(&Config::new());
        let err = run_symbolic(
            &ctx,
            &InstructionIndex::new(),
            &[],
            &[],
            &ExecutionContext::default(),
            false,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            SymbolicFailure::Symbolic(SymbolicError {
                kind: SymbolicErrorKind::EmptyPath,
                ..
            })
        ));
    }

    #[test]
    fn test_run_slice_reports_store_slot() {
        let code = store_code();
        let cfg = Cfg::from_code(&code);
        let slice: Vec<&Instruction> = [0x0c, 0x0e, 0x10]
            .iter()
            .map(|a| cfg.instruction_at(*a).unwrap())
            .collect();
        let ctx = Context::new(&Config::new());
        let out = run_slice(&ctx, &slice, &code, &ExecutionContext::default()).unwrap();
        assert_eq!(out.concrete_operand(0), Some(U256::from(5)));
        assert!(out.model.is_none());
    }
}
