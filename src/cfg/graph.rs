use crate::cfg::disassembly::{disassemble, split_blocks, Instruction, InstructionIndex};
use crate::cfg::opcodes::Opcode;
use crate::error::{PathfinderError, Result};
use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Top-of-stack window tracked while resolving jump targets.
const STACK_WINDOW: usize = 32;
/// Total (block, entry stack) states visited during jump resolution.
const MAX_RESOLUTION_STATES: usize = 20_000;
/// Distinct entry stacks analysed per block.
const MAX_ENTRY_STACKS_PER_BLOCK: usize = 128;

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: usize,
    pub instructions: Vec<Instruction>,
    pub predecessors: BTreeSet<usize>,
    /// Every block from which this block can be reached.
    pub ancestors: BTreeSet<usize>,
}

impl BasicBlock {
    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Address just past the final instruction.
    pub fn end(&self) -> usize {
        self.last().map(|i| i.next_addr()).unwrap_or(self.start)
    }

    pub fn contains_addr(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn is_reachable_from_root(&self) -> bool {
        self.start == 0 || self.ancestors.contains(&0)
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,
    block_pos: HashMap<usize, usize>,
    ins_pos: BTreeMap<usize, (usize, usize)>,
    successors: BTreeMap<usize, BTreeSet<usize>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CfgJson {
    bbs: Vec<BlockJson>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockJson {
    start: usize,
    succs: Vec<usize>,
}

type AbstractStack = Vec<Option<U256>>;

impl Cfg {
    pub fn from_code(code: &[u8]) -> Self {
        let blocks = split_blocks(disassemble(code));
        let mut cfg = Self::from_parts(blocks, BTreeMap::new());
        let edges = cfg.resolve_edges();
        cfg.install_edges(edges);
        cfg
    }

    fn from_parts(raw: Vec<Vec<Instruction>>, successors: BTreeMap<usize, BTreeSet<usize>>) -> Self {
        let mut blocks = Vec::with_capacity(raw.len());
        let mut block_pos = HashMap::with_capacity(raw.len());
        let mut ins_pos = BTreeMap::new();
        for (bi, instructions) in raw.into_iter().enumerate() {
            let start = instructions.first().map(|i| i.addr).unwrap_or_default();
            for (ii, ins) in instructions.iter().enumerate() {
                ins_pos.insert(ins.addr, (bi, ii));
            }
            block_pos.insert(start, bi);
            blocks.push(BasicBlock {
                start,
                instructions,
                predecessors: BTreeSet::new(),
                ancestors: BTreeSet::new(),
            });
        }
        let mut cfg = Self {
            blocks,
            block_pos,
            ins_pos,
            successors: BTreeMap::new(),
        };
        cfg.install_edges(successors);
        cfg
    }

    fn install_edges(&mut self, successors: BTreeMap<usize, BTreeSet<usize>>) {
        for block in &mut self.blocks {
            block.predecessors.clear();
            block.ancestors.clear();
        }
        for (from, tos) in &successors {
            for to in tos {
                if let Some(&pos) = self.block_pos.get(to) {
                    self.blocks[pos].predecessors.insert(*from);
                }
            }
        }
        self.successors = successors;

        for pos in 0..self.blocks.len() {
            let mut seen = BTreeSet::new();
            let mut queue: VecDeque<usize> =
                self.blocks[pos].predecessors.iter().copied().collect();
            while let Some(b) = queue.pop_front() {
                if !seen.insert(b) {
                    continue;
                }
                if let Some(&p) = self.block_pos.get(&b) {
                    queue.extend(self.blocks[p].predecessors.iter().copied());
                }
            }
            self.blocks[pos].ancestors = seen;
        }
    }

    fn is_jumpdest(&self, target: U256) -> Option<usize> {
        let target: usize = target.try_into().ok()?;
        let block = self.block_at(target).ok()?;
        (block.instructions.first()?.op == Opcode::JumpDest).then_some(target)
    }

    fn fingerprint(&self, stack: &AbstractStack) -> Vec<Option<usize>> {
        stack
            .iter()
            .map(|v| v.and_then(|v| self.is_jumpdest(v)))
            .collect()
    }

    /// Constant-propagate an abstract stack from the root block to discover jump targets.
    fn resolve_edges(&self) -> BTreeMap<usize, BTreeSet<usize>> {
        let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        if self.blocks.is_empty() {
            return edges;
        }
        let mut seen: HashSet<(usize, Vec<Option<usize>>)> = HashSet::new();
        let mut per_block: HashMap<usize, usize> = HashMap::new();
        let mut queue: VecDeque<(usize, AbstractStack)> = VecDeque::new();
        let mut unresolved: BTreeSet<usize> = BTreeSet::new();
        queue.push_back((0, Vec::new()));
        let mut processed = 0usize;

        while let Some((start, stack)) = queue.pop_front() {
            if processed >= MAX_RESOLUTION_STATES {
                tracing::warn!(
                    "[CFG] jump resolution budget ({}) exhausted; graph may be partial",
                    MAX_RESOLUTION_STATES
                );
                break;
            }
            let key = (start, self.fingerprint(&stack));
            if !seen.insert(key) {
                continue;
            }
            let count = per_block.entry(start).or_default();
            if *count >= MAX_ENTRY_STACKS_PER_BLOCK {
                continue;
            }
            *count += 1;
            processed += 1;

            let Ok(block) = self.block_at(start) else {
                continue;
            };
            let (exit, jump_target) = simulate_block(block, stack);
            let Some(last) = block.last() else {
                continue;
            };
            let mut succs = Vec::new();
            match last.op {
                Opcode::Jump | Opcode::JumpI => {
                    match jump_target.and_then(|t| self.is_jumpdest(t)) {
                        Some(target) => succs.push(target),
                        None => {
                            unresolved.insert(last.addr);
                        }
                    }
                    if last.op == Opcode::JumpI && self.block_pos.contains_key(&block.end()) {
                        succs.push(block.end());
                    }
                }
                op if op.ends_block() => {}
                _ => {
                    if self.block_pos.contains_key(&block.end()) {
                        succs.push(block.end());
                    }
                }
            }
            for succ in succs {
                edges.entry(start).or_default().insert(succ);
                queue.push_back((succ, exit.clone()));
            }
        }

        for addr in &unresolved {
            let resolved_elsewhere = self
                .ins_pos
                .get(addr)
                .map(|(bi, _)| {
                    let start = self.blocks[*bi].start;
                    edges.get(&start).map(|s| !s.is_empty()).unwrap_or(false)
                })
                .unwrap_or(false);
            if !resolved_elsewhere {
                tracing::debug!("[CFG] unresolved jump at {:#x}", addr);
            }
        }
        edges
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn has_block(&self, addr: usize) -> bool {
        self.block_pos.contains_key(&addr)
    }

    pub fn block_at(&self, addr: usize) -> Result<&BasicBlock> {
        self.block_pos
            .get(&addr)
            .map(|&pos| &self.blocks[pos])
            .ok_or(PathfinderError::BlockNotFound(addr))
    }

    pub fn instruction_at(&self, addr: usize) -> Result<&Instruction> {
        self.ins_pos
            .get(&addr)
            .map(|&(bi, ii)| &self.blocks[bi].instructions[ii])
            .ok_or(PathfinderError::InstructionNotFound(addr))
    }

    /// Owning block of an instruction.
    pub fn block_of(&self, ins: &Instruction) -> Result<&BasicBlock> {
        self.block_at(ins.block)
    }

    pub fn successors(&self, addr: usize) -> impl Iterator<Item = usize> + '_ {
        self.successors
            .get(&addr)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn index(&self) -> InstructionIndex {
        self.instructions().map(|i| (i.addr, i.clone())).collect()
    }

    /// Instructions with the given opcode, optionally restricted to blocks reachable from
    /// the root.
    pub fn filter_instructions(&self, op: Opcode, reachable_only: bool) -> Vec<&Instruction> {
        self.blocks
            .iter()
            .filter(|b| !reachable_only || b.is_reachable_from_root())
            .flat_map(|b| b.instructions.iter())
            .filter(|i| i.op == op)
            .collect()
    }

    /// Instructions whose values transitively feed `ins`.
    pub fn data_dependence(&self, ins: &Instruction) -> Vec<&Instruction> {
        crate::slicing::data_dependence(self, ins)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let bbs = self
            .blocks
            .iter()
            .map(|b| BlockJson {
                start: b.start,
                succs: self.successors(b.start).collect(),
            })
            .collect();
        serde_json::to_value(CfgJson { bbs }).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: &serde_json::Value, code: &[u8]) -> Result<Self> {
        let parsed: CfgJson = serde_json::from_value(value.clone())?;
        let raw = split_blocks(disassemble(code));
        let starts: BTreeSet<usize> = raw.iter().filter_map(|b| b.first()).map(|i| i.addr).collect();
        let mut successors: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for bb in parsed.bbs {
            if !starts.contains(&bb.start) {
                return Err(PathfinderError::MalformedCfg(format!(
                    "block {:#x} does not start a block of the supplied code",
                    bb.start
                )));
            }
            for succ in &bb.succs {
                if !starts.contains(succ) {
                    return Err(PathfinderError::MalformedCfg(format!(
                        "edge {:#x} -> {:#x} targets an unknown block",
                        bb.start, succ
                    )));
                }
            }
            if !bb.succs.is_empty() {
                successors.insert(bb.start, bb.succs.into_iter().collect());
            }
        }
        Ok(Self::from_parts(raw, successors))
    }
}

fn pad(stack: &mut AbstractStack, depth: usize) {
    while stack.len() < depth {
        stack.insert(0, None);
    }
}

fn trim(stack: &mut AbstractStack) {
    if stack.len() > STACK_WINDOW {
        let excess = stack.len() - STACK_WINDOW;
        stack.drain(..excess);
    }
}

/// Run one block over an abstract stack. Returns the exit stack and, for blocks ending in a
/// jump, the jump target if it is a known constant.
fn simulate_block(block: &BasicBlock, mut stack: AbstractStack) -> (AbstractStack, Option<U256>) {
    let mut target = None;
    for ins in &block.instructions {
        let (pops, pushes) = ins.op.stack_io();
        pad(&mut stack, pops);
        let len = stack.len();
        match ins.op {
            Opcode::Push(_) => stack.push(ins.arg_value()),
            Opcode::Dup(n) => {
                let v = stack[len - n as usize];
                stack.push(v);
            }
            Opcode::Swap(n) => stack.swap(len - 1, len - 1 - n as usize),
            Opcode::And => {
                let a = stack.pop().flatten();
                let b = stack.pop().flatten();
                stack.push(a.zip(b).map(|(a, b)| a & b));
            }
            Opcode::Jump | Opcode::JumpI => {
                target = stack.pop().flatten();
                if ins.op == Opcode::JumpI {
                    stack.pop();
                }
            }
            _ => {
                stack.truncate(len - pops);
                stack.extend(std::iter::repeat(None).take(pushes));
            }
        }
        trim(&mut stack);
    }
    (stack, target)
}
