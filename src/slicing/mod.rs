//! Backward slicing over the CFG.
//!
//! A slice is the shortest executable suffix of some route into an instruction that
//! produces every stack operand the instruction consumes: walking backwards, an
//! instruction is kept while the suffix still needs values from below, so replaying the
//! slice from an empty stack reproduces the operands. Slices that read memory are
//! extended until a memory writer precedes the read.

use crate::cfg::disassembly::Instruction;
use crate::cfg::graph::Cfg;
use crate::cfg::opcodes::Opcode;
use std::collections::{BTreeSet, HashMap, HashSet};

pub type Slice<'a> = Vec<&'a Instruction>;

/// Instructions walked per slice before the walk is abandoned.
const MAX_SLICE_STEPS: usize = 4_096;
/// Times one slice may re-enter the same block.
const MAX_BLOCK_VISITS: usize = 2;
/// Work items kept by the data-dependence walk.
const MAX_DEPENDENCE_STATES: usize = 4_096;

#[derive(Clone)]
struct Walk<'a> {
    block: usize,
    pos: usize,
    needed: usize,
    pending_memory: bool,
    collected: Vec<&'a Instruction>,
    visits: HashMap<usize, usize>,
    steps: usize,
}

/// Lazily enumerates backward slices ending just before a target instruction.
pub struct BackwardSlicer<'a> {
    cfg: &'a Cfg,
    reachable: bool,
    remaining: usize,
    work: Vec<Walk<'a>>,
}

impl<'a> BackwardSlicer<'a> {
    pub fn new(
        cfg: &'a Cfg,
        target: &'a Instruction,
        args: Option<&[usize]>,
        reachable: bool,
        max_slices: usize,
    ) -> Self {
        let (pops, _) = target.op.stack_io();
        let needed = match args {
            Some(args) => args.iter().map(|a| a + 1).max().unwrap_or(0),
            None => pops,
        };
        let pos = cfg
            .block_of(target)
            .ok()
            .and_then(|b| b.instructions.iter().position(|i| i.addr == target.addr))
            .unwrap_or(0);
        let mut visits = HashMap::new();
        visits.insert(target.block, 1);
        let start = Walk {
            block: target.block,
            pos,
            needed,
            pending_memory: target.op.reads_memory(),
            collected: Vec::new(),
            visits,
            steps: 0,
        };
        Self {
            cfg,
            reachable,
            remaining: max_slices,
            work: vec![start],
        }
    }
}

impl<'a> Iterator for BackwardSlicer<'a> {
    type Item = Slice<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let mut walk = self.work.pop()?;
            if walk.needed == 0 && !walk.pending_memory {
                self.remaining -= 1;
                walk.collected.reverse();
                return Some(walk.collected);
            }
            if walk.steps >= MAX_SLICE_STEPS {
                continue;
            }
            let Ok(block) = self.cfg.block_at(walk.block) else {
                continue;
            };
            if walk.pos > 0 {
                walk.pos -= 1;
                walk.steps += 1;
                let ins = &block.instructions[walk.pos];
                let (pops, pushes) = ins.op.stack_io();
                walk.needed = walk.needed.saturating_sub(pushes) + pops;
                if ins.op.reads_memory() {
                    walk.pending_memory = true;
                }
                if ins.op.writes_memory() {
                    walk.pending_memory = false;
                }
                walk.collected.push(ins);
                self.work.push(walk);
                continue;
            }

            // Block exhausted: branch into every admissible predecessor. Pushed in reverse
            // so lower addresses are explored first.
            let preds: Vec<usize> = block
                .predecessors
                .iter()
                .copied()
                .filter(|p| {
                    !self.reachable
                        || self
                            .cfg
                            .block_at(*p)
                            .map(|b| b.is_reachable_from_root())
                            .unwrap_or(false)
                })
                .filter(|p| walk.visits.get(p).copied().unwrap_or(0) < MAX_BLOCK_VISITS)
                .collect();
            for pred in preds.into_iter().rev() {
                let Ok(pred_block) = self.cfg.block_at(pred) else {
                    continue;
                };
                let mut next = walk.clone();
                next.block = pred;
                next.pos = pred_block.instructions.len();
                *next.visits.entry(pred).or_default() += 1;
                self.work.push(next);
            }
        }
        None
    }
}

/// All backward slices of `target`, restricted to its `args` stack operands if given.
pub fn backward_slices<'a>(
    cfg: &'a Cfg,
    target: &'a Instruction,
    args: Option<&[usize]>,
    reachable: bool,
    max_slices: usize,
) -> BackwardSlicer<'a> {
    BackwardSlicer::new(cfg, target, args, reachable, max_slices)
}

/// Backward slices that touch at least one value a transaction sender can influence.
pub fn interesting_slices<'a>(
    cfg: &'a Cfg,
    target: &'a Instruction,
    args: Option<&[usize]>,
    reachable: bool,
    max_slices: usize,
) -> impl Iterator<Item = Slice<'a>> + 'a {
    BackwardSlicer::new(cfg, target, args, reachable, max_slices)
        .filter(|slice| slice.iter().any(|ins| ins.op.is_user_controlled()))
}

/// Instructions whose results transitively flow into the stack operands of `target`.
///
/// Stack slots are tracked precisely through DUP/SWAP; the walk follows every
/// predecessor and stops along a route once no slot is still tainted.
pub fn data_dependence<'a>(cfg: &'a Cfg, target: &Instruction) -> Vec<&'a Instruction> {
    let mut deps: BTreeSet<usize> = BTreeSet::new();
    let Ok(block) = cfg.block_of(target) else {
        return Vec::new();
    };
    let Some(pos) = block.instructions.iter().position(|i| i.addr == target.addr) else {
        return Vec::new();
    };
    let (pops, _) = target.op.stack_io();
    let initial: BTreeSet<usize> = (0..pops).collect();

    let mut seen: HashSet<(usize, BTreeSet<usize>)> = HashSet::new();
    let mut work: Vec<(usize, usize, BTreeSet<usize>)> = vec![(block.start, pos, initial)];
    let mut states = 0usize;

    while let Some((start, pos, mut taint)) = work.pop() {
        states += 1;
        if states > MAX_DEPENDENCE_STATES {
            tracing::debug!(
                "[SLICE] data dependence walk for {:#x} truncated at {} states",
                target.addr,
                MAX_DEPENDENCE_STATES
            );
            break;
        }
        let Ok(block) = cfg.block_at(start) else {
            continue;
        };
        for ins in block.instructions[..pos].iter().rev() {
            if taint.is_empty() {
                break;
            }
            taint = step_taint(ins, taint, &mut deps);
        }
        if taint.is_empty() {
            continue;
        }
        for pred in &block.predecessors {
            let Ok(pred_block) = cfg.block_at(*pred) else {
                continue;
            };
            if seen.insert((*pred, taint.clone())) {
                work.push((*pred, pred_block.instructions.len(), taint.clone()));
            }
        }
    }

    deps.into_iter()
        .filter_map(|addr| cfg.instruction_at(addr).ok())
        .collect()
}

fn step_taint(ins: &Instruction, taint: BTreeSet<usize>, deps: &mut BTreeSet<usize>) -> BTreeSet<usize> {
    match ins.op {
        Opcode::Dup(n) => {
            let n = n as usize;
            let mut out: BTreeSet<usize> = taint.iter().filter(|t| **t >= 1).map(|t| t - 1).collect();
            if taint.contains(&0) {
                out.insert(n - 1);
            }
            out
        }
        Opcode::Swap(n) => {
            let n = n as usize;
            taint
                .into_iter()
                .map(|t| match t {
                    0 => n,
                    t if t == n => 0,
                    t => t,
                })
                .collect()
        }
        op => {
            let (pops, pushes) = op.stack_io();
            let produces_tainted = taint.iter().any(|t| *t < pushes);
            let mut out: BTreeSet<usize> = taint
                .iter()
                .filter(|t| **t >= pushes)
                .map(|t| t - pushes + pops)
                .collect();
            if produces_tainted {
                deps.insert(ins.addr);
                out.extend(0..pops);
            }
            out
        }
    }
}
