//! Path search and constraint generation over one contract's runtime bytecode.

pub mod diagnosis;
pub mod func_entries;
pub mod reachability;
pub mod runner;
pub mod search;
pub mod slices;
pub mod writes;

pub use diagnosis::{DataDependenceTrimmer, FailureDiagnoser, NoTrim};
pub use func_entries::{EntryKey, FuncEntryMap};
pub use search::{
    ConstraintSearch, PathEnumeration, SearchItem, SearchOptions, SearchSession, SearchStats,
};
pub use slices::SliceMode;
pub use writes::WriteMap;

use crate::cfg::disassembly::{Instruction, InstructionIndex};
use crate::cfg::graph::Cfg;
use crate::concrete::{self, ConcreteResult};
use crate::error::{PathfinderError, Result};
use crate::explorer::{external_data, AvoidSet, ForwardExplorer, Path};
use crate::symbolic::{self, CallRecord, ExecutionContext, SymbolicFailure, SymbolicOutcome};
use crate::utils::config::SearchParams;
use crate::utils::hex::decode_code;
use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use z3::Context;

/// Result of [`Project::is_valid_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValidity {
    Valid,
    /// A block before the end of the path halts; `prefix` ends with that block.
    Invalid { prefix: Path, suffix: Path },
}

#[derive(Serialize, Deserialize)]
struct ProjectJson {
    code: String,
    cfg: serde_json::Value,
}

/// Runtime bytecode plus the analyses derived from it.
///
/// Every derived structure is computed on first use and then shared read-only.
#[derive(Debug)]
pub struct Project {
    code: Vec<u8>,
    context: ExecutionContext,
    params: SearchParams,
    cfg: OnceLock<Cfg>,
    index: OnceLock<InstructionIndex>,
    func_entries: OnceLock<FuncEntryMap>,
    writes: OnceLock<WriteMap>,
}

impl Project {
    pub fn new(code: Vec<u8>) -> Result<Self> {
        if code.is_empty() {
            return Err(PathfinderError::EmptyCode);
        }
        let params = SearchParams::default();
        Ok(Self {
            code,
            context: ExecutionContext {
                solver_timeout_ms: params.solver_timeout_ms,
                ..ExecutionContext::default()
            },
            params,
            cfg: OnceLock::new(),
            index: OnceLock::new(),
            func_entries: OnceLock::new(),
            writes: OnceLock::new(),
        })
    }

    pub fn from_hex(raw: &str) -> Result<Self> {
        Self::new(decode_code(raw)?)
    }

    /// Read a hex dump of runtime bytecode.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_hex(&raw)
    }

    /// Read a project saved with [`Project::to_json`].
    pub fn load_json(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let parsed: ProjectJson = serde_json::from_value(value.clone())?;
        let project = Self::from_hex(&parsed.code)?;
        let cfg = Cfg::from_json(&parsed.cfg, &project.code)?;
        let _ = project.cfg.set(cfg);
        Ok(project)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": hex::encode(&self.code),
            "cfg": self.cfg().to_json(),
        })
    }

    pub fn with_params(mut self, params: SearchParams) -> Self {
        self.params = params;
        self.context.solver_timeout_ms = params.solver_timeout_ms;
        self
    }

    /// Observed external call results replayed by the symbolic interpreter.
    pub fn with_xcall(mut self, xcall: Vec<CallRecord>) -> Self {
        self.context.xcall = xcall;
        self
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn xcall(&self) -> &[CallRecord] {
        &self.context.xcall
    }

    pub fn cfg(&self) -> &Cfg {
        self.cfg.get_or_init(|| {
            let cfg = Cfg::from_code(&self.code);
            tracing::debug!("[CFG] built {} basic blocks", cfg.blocks().len());
            cfg
        })
    }

    pub fn index(&self) -> &InstructionIndex {
        self.index.get_or_init(|| self.cfg().index())
    }

    /// Execute the bytecode concretely with the given input.
    pub fn run(&self, calldata: &[u8], value: U256) -> Result<ConcreteResult> {
        concrete::run(&self.code, calldata, value)
    }

    /// Symbolically execute `path` (block starts then the target address).
    ///
    /// When the target is itself a block start the explorer emits it twice; the
    /// duplicate is dropped here.
    pub fn run_symbolic<'ctx>(
        &self,
        ctx: &'ctx Context,
        path: &[usize],
        inclusive: bool,
    ) -> std::result::Result<SymbolicOutcome<'ctx>, SymbolicFailure> {
        let path = match path {
            [.., a, b] if a == b => &path[..path.len() - 1],
            _ => path,
        };
        symbolic::run_symbolic(ctx, self.index(), path, &self.code, &self.context, inclusive)
    }

    /// Check that no block before the end of `path` halts. The final element is the
    /// target and is ignored.
    pub fn is_valid_path(&self, path: &[usize]) -> Result<PathValidity> {
        let Some((_, blocks)) = path.split_last() else {
            return Ok(PathValidity::Valid);
        };
        for (cnt, start) in blocks.iter().enumerate() {
            let bb = self.cfg().block_at(*start)?;
            let halts = bb.last().map(|ins| ins.op.is_halting()).unwrap_or(false);
            if halts && cnt + 1 != blocks.len() {
                return Ok(PathValidity::Invalid {
                    prefix: blocks[..=cnt].to_vec(),
                    suffix: blocks[cnt + 1..].to_vec(),
                });
            }
        }
        Ok(PathValidity::Valid)
    }

    fn explorer_for<'a>(
        &'a self,
        targets: &[&'a Instruction],
        options: &SearchOptions,
        avoid: AvoidSet,
    ) -> ForwardExplorer<'a> {
        let cfg = self.cfg();
        let mut explorer = ForwardExplorer::new(cfg);
        let slices = slices::select_slices(cfg, targets, &options.mode, self.params.max_slices);
        tracing::debug!(
            "[SEARCH] {} slices for {} reachable targets",
            slices.len(),
            targets.len()
        );
        let loop_limit = options.loop_limit.unwrap_or(self.params.loop_limit);
        explorer.find(slices, loop_limit, avoid);
        explorer
    }

    /// Satisfiable paths to any of `instructions`, produced lazily.
    ///
    /// Targets that cannot be reached from the root block are dropped up front; if none
    /// remain the search is empty.
    pub fn get_constraints<'ctx, 'a>(
        &'a self,
        ctx: &'ctx Context,
        instructions: &[&'a Instruction],
        options: &SearchOptions,
    ) -> ConstraintSearch<'ctx, 'a> {
        let targets = reachability::reachable_targets(self.cfg(), instructions.iter().copied());
        if targets.is_empty() {
            tracing::debug!("[SEARCH] no reachable targets among {}", instructions.len());
        }
        let explorer = self.explorer_for(&targets, options, external_data());
        ConstraintSearch::new(ctx, self, explorer, &targets, options.inclusive)
    }

    /// Candidate paths to any of `instructions` without symbolic execution.
    pub fn get_paths<'a>(
        &'a self,
        instructions: &[&'a Instruction],
        options: &SearchOptions,
    ) -> PathEnumeration<'a> {
        let targets = reachability::reachable_targets(self.cfg(), instructions.iter().copied());
        let explorer = self.explorer_for(&targets, options, external_data());
        PathEnumeration::new(explorer, &targets)
    }

    /// Every explorer path to `target`, without the trailing target address.
    pub fn gen_paths(&self, target: &Instruction) -> Vec<Path> {
        let cfg = self.cfg();
        let mut explorer = ForwardExplorer::new(cfg);
        let Ok(target) = cfg.instruction_at(target.addr) else {
            return Vec::new();
        };
        explorer.find(vec![vec![target]], self.params.loop_limit, external_data());
        let session = SearchSession::default();
        let mut paths = Vec::new();
        while let Some(mut path) = explorer.next_path(session.blacklist()) {
            path.pop();
            paths.push(path);
        }
        paths
    }

    pub fn func_entries(&self) -> &FuncEntryMap {
        self.func_entries
            .get_or_init(|| func_entries::recover_func_entries(self.cfg()))
    }

    /// Selector whose entry block lies on `path`, else [`EntryKey::Fallback`].
    pub fn func_sig(&self, path: &[usize]) -> EntryKey {
        func_entries::func_sig(self.func_entries(), path)
    }

    pub fn writes(&self) -> &WriteMap {
        self.writes.get_or_init(|| {
            writes::analyze_writes(self.cfg(), &self.code, &self.context, self.params.max_slices)
        })
    }

    /// Stores whose target slot is not a single constant.
    pub fn symbolic_writes(&self) -> &BTreeSet<usize> {
        &self.writes().symbolic
    }

    /// `(stores to exactly slot, stores to unknown slots)`.
    pub fn writes_to(&self, slot: Option<U256>) -> (BTreeSet<usize>, BTreeSet<usize>) {
        self.writes().writes_to(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::opcodes::Opcode;
    use z3::Config;

    // 0x00: CALLVALUE PUSH1 0x08 JUMPI
    // 0x04: PUSH1 0x00 DUP1 REVERT
    // 0x08: JUMPDEST CALLER SELFDESTRUCT
    const GUARDED: &str = "0x346008576000 80fd5b33ff";

    #[test]
    fn test_empty_code_is_rejected() {
        assert!(matches!(Project::new(Vec::new()), Err(PathfinderError::EmptyCode)));
        assert!(matches!(Project::from_hex("0x"), Err(PathfinderError::EmptyCode)));
        assert!(matches!(Project::from_hex("0xzz"), Err(PathfinderError::InvalidHex(_))));
    }

    #[test]
    fn test_json_round_trip_keeps_cfg() {
        let project = Project::from_hex(GUARDED).unwrap();
        let value = project.to_json();
        assert_eq!(value["code"], "34600857600080fd5b33ff");
        let restored = Project::from_json(&value).unwrap();
        assert_eq!(restored.code(), project.code());
        assert_eq!(restored.cfg().to_json(), project.cfg().to_json());
    }

    #[test]
    fn test_run_symbolic_drops_duplicated_block_target() {
        let project = Project::from_hex(GUARDED).unwrap();
        let ctx = Context::new(&Config::new());
        let outcome = project.run_symbolic(&ctx, &[0x00, 0x08, 0x08], false).unwrap();
        assert_eq!(outcome.state.trace, vec![0x00, 0x01, 0x03]);
    }

    #[test]
    fn test_is_valid_path_splits_at_halting_block() {
        let project = Project::from_hex(GUARDED).unwrap();
        // 0x04 ends in REVERT but is followed by 0x08.
        assert_eq!(
            project.is_valid_path(&[0x00, 0x04, 0x08, 0x0a]).unwrap(),
            PathValidity::Invalid {
                prefix: vec![0x00, 0x04],
                suffix: vec![0x08],
            }
        );
        assert_eq!(
            project.is_valid_path(&[0x00, 0x08, 0x0a]).unwrap(),
            PathValidity::Valid
        );
        assert_eq!(project.is_valid_path(&[0x00, 0x04, 0x07]).unwrap(), PathValidity::Valid);
        assert!(project.is_valid_path(&[0x00, 0x05, 0x07]).is_err());
        assert_eq!(project.is_valid_path(&[]).unwrap(), PathValidity::Valid);
    }

    #[test]
    fn test_gen_paths_drops_target_address() {
        let project = Project::from_hex(GUARDED).unwrap();
        let target = project.cfg().instruction_at(0x07).unwrap().clone();
        assert_eq!(project.gen_paths(&target), vec![vec![0x00, 0x04]]);
    }

    #[test]
    fn test_paths_to_fallthrough_block_end_in_that_block() {
        // 0x00: PUSH1 0x00 CALLDATALOAD PUSH1 0x08 JUMPI
        // 0x06: CALLER POP          (falls through)
        // 0x08: JUMPDEST STOP
        let project = Project::from_hex("0x600035600857 3350 5b00").unwrap();
        let caller = project.cfg().instruction_at(0x06).unwrap();

        let listed: Vec<Path> = project
            .get_paths(&[caller], &SearchOptions::default())
            .map(|(ins, path)| {
                assert_eq!(ins.addr, 0x06);
                path
            })
            .collect();
        assert_eq!(listed, vec![vec![0x00, 0x06, 0x06]]);
        for path in &listed {
            assert_eq!(path[path.len() - 2], caller.block);
        }

        let generated = project.gen_paths(caller);
        assert_eq!(generated, vec![vec![0x00, 0x06]]);
        for path in &generated {
            assert_eq!(path.last(), Some(&caller.block));
        }
    }

    #[test]
    fn test_unreachable_target_yields_nothing() {
        // 0x00: STOP | 0x01: CALLER SELFDESTRUCT (dead)
        let project = Project::new(vec![0x00, 0x33, 0xff]).unwrap();
        let ctx = Context::new(&Config::new());
        let dead = project.cfg().filter_instructions(Opcode::SelfDestruct, false);
        assert_eq!(dead.len(), 1);
        let mut search = project.get_constraints(&ctx, &dead, &SearchOptions::default());
        assert!(search.next().is_none());
        assert_eq!(search.stop().attempts, 0);
    }

    #[test]
    fn test_caches_are_built_once() {
        let project = Project::from_hex(GUARDED).unwrap();
        assert!(std::ptr::eq(project.cfg(), project.cfg()));
        assert!(std::ptr::eq(project.writes(), project.writes()));
        assert_eq!(project.index().len(), project.cfg().instructions().count());
        assert_eq!(project.func_sig(&[0x00, 0x08]), EntryKey::Fallback);
    }
}
