//! Turning an infeasible path into the blacklist entry that prunes it.

use crate::cfg::graph::Cfg;
use crate::cfg::opcodes::Opcode;
use std::collections::BTreeSet;

/// Decides which address sequence to blacklist after a path proved infeasible.
///
/// `trace` is every instruction address executed before the failure, `remaining` the path
/// elements not yet entered (never empty).
pub trait FailureDiagnoser: Send + Sync {
    fn bad_prefix(&self, cfg: &Cfg, trace: &[usize], remaining: &[usize]) -> Vec<usize>;
}

/// Block starts of `trace` followed by the first step that could not be taken.
pub fn candidate_prefix(cfg: &Cfg, trace: &[usize], remaining: &[usize]) -> Vec<usize> {
    let mut prefix: Vec<usize> = trace
        .iter()
        .copied()
        .filter(|addr| cfg.has_block(*addr))
        .collect();
    if let Some(&next) = remaining.first() {
        prefix.push(next);
    }
    prefix
}

/// Blacklists the full candidate prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTrim;

impl FailureDiagnoser for NoTrim {
    fn bad_prefix(&self, cfg: &Cfg, trace: &[usize], remaining: &[usize]) -> Vec<usize> {
        candidate_prefix(cfg, trace, remaining)
    }
}

/// Cuts the candidate prefix down to the part that feeds the failing instruction.
///
/// The prefix is kept whole when the failing value depends on an MLOAD or SLOAD, since
/// the contradiction may then come from memory or storage written on the dropped part.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDependenceTrimmer;

impl FailureDiagnoser for DataDependenceTrimmer {
    fn bad_prefix(&self, cfg: &Cfg, trace: &[usize], remaining: &[usize]) -> Vec<usize> {
        let prefix = candidate_prefix(cfg, trace, remaining);
        let Some(ins) = trace.last().and_then(|pc| cfg.instruction_at(*pc).ok()) else {
            return prefix;
        };
        let deps = cfg.data_dependence(ins);
        if deps
            .iter()
            .any(|d| matches!(d.op, Opcode::MLoad | Opcode::SLoad))
        {
            return prefix;
        }
        let dep_blocks: BTreeSet<usize> = deps.iter().map(|d| d.block).collect();
        let start = prefix
            .iter()
            .position(|addr| dep_blocks.contains(addr))
            .unwrap_or(0);
        prefix[start..].to_vec()
    }
}
