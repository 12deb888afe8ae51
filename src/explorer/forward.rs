use crate::cfg::graph::Cfg;
use crate::cfg::opcodes::Opcode;
use crate::explorer::blacklist::Blacklist;
use crate::slicing::Slice;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

/// Block start addresses from the root, followed by the address of the reached target.
pub type Path = Vec<usize>;

pub type AvoidSet = BTreeSet<Opcode>;

/// Opcodes whose results the symbolic model cannot constrain.
pub fn external_data() -> AvoidSet {
    (0..=u8::MAX)
        .map(Opcode::from_byte)
        .filter(|op| op.is_external_data())
        .collect()
}

struct Node {
    cost: usize,
    seq: u64,
    slice: usize,
    /// Index of the next slice instruction still to be visited.
    next: usize,
    path: Vec<usize>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cost, self.seq).cmp(&(other.cost, other.seq))
    }
}

/// Best-first search from the root block through the blocks of each slice, in order.
///
/// Frontier nodes are ranked by path length plus the static distance to the block of the
/// next required instruction; ties fall back to insertion order, so the enumeration is
/// deterministic for a fixed graph, slice batch and blacklist.
pub struct ForwardExplorer<'a> {
    cfg: &'a Cfg,
    slices: Vec<Slice<'a>>,
    loop_limit: usize,
    avoid: AvoidSet,
    heap: BinaryHeap<Reverse<Node>>,
    distances: HashMap<usize, HashMap<usize, usize>>,
    seq: u64,
    expanded: usize,
}

impl<'a> ForwardExplorer<'a> {
    pub fn new(cfg: &'a Cfg) -> Self {
        Self {
            cfg,
            slices: Vec::new(),
            loop_limit: crate::utils::config::DEFAULT_LOOP_LIMIT,
            avoid: AvoidSet::new(),
            heap: BinaryHeap::new(),
            distances: HashMap::new(),
            seq: 0,
            expanded: 0,
        }
    }

    /// Seed a new search. Any frontier left from a previous `find` is discarded.
    pub fn find(&mut self, slices: Vec<Slice<'a>>, loop_limit: usize, avoid: AvoidSet) {
        self.heap.clear();
        self.slices = slices;
        self.loop_limit = loop_limit.max(1);
        self.avoid = avoid;
        if !self.cfg.has_block(0) {
            return;
        }
        for idx in 0..self.slices.len() {
            if self.slices[idx].is_empty() {
                continue;
            }
            self.push_node(idx, 0, vec![0]);
        }
    }

    /// Number of frontier nodes expanded so far.
    pub fn expanded(&self) -> usize {
        self.expanded
    }

    fn distances_to(&mut self, target_block: usize) -> &HashMap<usize, usize> {
        let cfg = self.cfg;
        self.distances.entry(target_block).or_insert_with(|| {
            let mut dist = HashMap::new();
            let mut queue = VecDeque::new();
            dist.insert(target_block, 0usize);
            queue.push_back(target_block);
            while let Some(b) = queue.pop_front() {
                let d = dist[&b];
                let Ok(block) = cfg.block_at(b) else {
                    continue;
                };
                for pred in &block.predecessors {
                    if !dist.contains_key(pred) {
                        dist.insert(*pred, d + 1);
                        queue.push_back(*pred);
                    }
                }
            }
            dist
        })
    }

    /// Consume the slice instructions that the block at the end of `path` satisfies.
    fn advance(&self, slice: usize, mut next: usize, block: usize) -> usize {
        let ins = &self.slices[slice];
        let mut floor = 0usize;
        while next < ins.len() && ins[next].block == block && ins[next].addr >= floor {
            floor = ins[next].addr;
            next += 1;
        }
        next
    }

    fn push_node(&mut self, slice: usize, next: usize, path: Vec<usize>) {
        let Some(&current) = path.last() else {
            return;
        };
        let next = self.advance(slice, next, current);
        // Once the slice is consumed only routes back into the target's block matter.
        let ins = &self.slices[slice];
        let goal = match ins.get(next).or_else(|| ins.last()) {
            Some(i) => i.block,
            None => return,
        };
        let Some(&remaining) = self.distances_to(goal).get(&current) else {
            return;
        };
        self.seq += 1;
        let node = Node {
            cost: path.len() + remaining,
            seq: self.seq,
            slice,
            next,
            path,
        };
        self.heap.push(Reverse(node));
    }

    fn enters_avoided(&self, block: usize, slice: usize, next: usize) -> bool {
        if self.avoid.is_empty() {
            return false;
        }
        if self.slices[slice].get(next).map(|i| i.block) == Some(block) {
            return false;
        }
        self.cfg
            .block_at(block)
            .map(|b| b.instructions.iter().any(|i| self.avoid.contains(&i.op)))
            .unwrap_or(true)
    }

    /// Next candidate path not rejected by `blacklist`, or `None` once the search space
    /// is exhausted.
    pub fn next_path(&mut self, blacklist: &Blacklist) -> Option<Path> {
        while let Some(Reverse(node)) = self.heap.pop() {
            if blacklist.rejects(&node.path) {
                continue;
            }
            self.expanded += 1;
            let Some(&current) = node.path.last() else {
                continue;
            };

            let slice_len = self.slices[node.slice].len();
            let mut found = None;
            if let Some(target) = self.slices[node.slice].last() {
                if node.next >= slice_len && current == target.block {
                    let mut path = node.path.clone();
                    path.push(target.addr);
                    if !blacklist.rejects(&path) {
                        found = Some(path);
                    }
                }
            }

            let succs: Vec<usize> = self.cfg.successors(current).collect();
            for succ in succs {
                let visits = node.path.iter().filter(|b| **b == succ).count();
                if visits >= self.loop_limit {
                    continue;
                }
                if node.next < slice_len && self.enters_avoided(succ, node.slice, node.next) {
                    continue;
                }
                let mut path = node.path.clone();
                path.push(succ);
                if blacklist.rejects(&path) {
                    continue;
                }
                self.push_node(node.slice, node.next, path);
            }

            if found.is_some() {
                return found;
            }
        }
        None
    }
}
