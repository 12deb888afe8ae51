//! Blacklist-driven forward search loops.
//!
//! One [`ForwardExplorer`] and one [`SearchSession`] live for the whole call, so prefixes
//! proven infeasible while chasing one slice prune the candidates of every later slice.

use crate::cfg::disassembly::Instruction;
use crate::engine::diagnosis::{DataDependenceTrimmer, FailureDiagnoser};
use crate::engine::runner::panic_payload_to_string;
use crate::engine::slices::SliceMode;
use crate::engine::Project;
use crate::explorer::{Blacklist, ForwardExplorer, Path};
use crate::symbolic::{SymbolicFailure, SymbolicOutcome};
use crate::utils::hex::format_path;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use z3::Context;

/// Per-call knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub mode: SliceMode,
    /// Execute the target instruction itself before solving.
    pub inclusive: bool,
    /// Overrides the project's loop limit for this call.
    pub loop_limit: Option<usize>,
}

impl SearchOptions {
    pub fn with_mode(mut self, mode: SliceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn inclusive(mut self, inclusive: bool) -> Self {
        self.inclusive = inclusive;
        self
    }
}

/// Blacklist owned by one search call.
#[derive(Debug, Default)]
pub struct SearchSession {
    blacklist: Blacklist,
}

impl SearchSession {
    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Prune every later candidate containing `prefix`. Returns false if already known.
    pub fn add_to_blacklist(&mut self, prefix: Vec<usize>) -> bool {
        self.blacklist.add(prefix)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    /// Candidate paths pulled from the explorer.
    pub attempts: usize,
    pub found: usize,
    pub infeasible: usize,
    pub external_data: usize,
    pub symbolic_errors: usize,
    pub unclassified: usize,
    pub budget_signals: usize,
    pub blacklisted: usize,
    pub expanded: usize,
}

pub enum SearchItem<'ctx, 'a> {
    /// A satisfiable path to `instruction`.
    Found {
        instruction: &'a Instruction,
        path: Path,
        outcome: SymbolicOutcome<'ctx>,
    },
    /// The try budget ran out. Searching continues if the caller keeps pulling.
    BudgetExhausted,
}

impl<'ctx, 'a> SearchItem<'ctx, 'a> {
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, Self::BudgetExhausted)
    }
}

/// Lazily yields satisfiable paths to a batch of target instructions.
///
/// Built by [`Project::get_constraints`]. Dropping it abandons the search; [`stop`]
/// does the same and reports what was done.
///
/// [`stop`]: ConstraintSearch::stop
pub struct ConstraintSearch<'ctx, 'a> {
    ctx: &'ctx Context,
    project: &'a Project,
    explorer: ForwardExplorer<'a>,
    session: SearchSession,
    targets: BTreeMap<usize, &'a Instruction>,
    diagnoser: Box<dyn FailureDiagnoser>,
    inclusive: bool,
    try_budget: usize,
    budget_signalled: bool,
    pending: Option<Path>,
    stats: SearchStats,
}

impl<'ctx, 'a> ConstraintSearch<'ctx, 'a> {
    pub(crate) fn new(
        ctx: &'ctx Context,
        project: &'a Project,
        explorer: ForwardExplorer<'a>,
        targets: &[&'a Instruction],
        inclusive: bool,
    ) -> Self {
        Self {
            ctx,
            project,
            explorer,
            session: SearchSession::default(),
            targets: targets.iter().map(|ins| (ins.addr, *ins)).collect(),
            diagnoser: Box::new(DataDependenceTrimmer),
            inclusive,
            try_budget: project.params().try_budget,
            budget_signalled: false,
            pending: None,
            stats: SearchStats::default(),
        }
    }

    /// Swap the failure diagnoser used to derive blacklist entries.
    pub fn with_diagnoser(mut self, diagnoser: impl FailureDiagnoser + 'static) -> Self {
        self.diagnoser = Box::new(diagnoser);
        self
    }

    pub fn session(&self) -> &SearchSession {
        &self.session
    }

    pub fn add_to_blacklist(&mut self, prefix: Vec<usize>) -> bool {
        self.session.add_to_blacklist(prefix)
    }

    pub fn stats(&self) -> SearchStats {
        SearchStats {
            blacklisted: self.session.blacklist.len(),
            expanded: self.explorer.expanded(),
            ..self.stats.clone()
        }
    }

    /// End the search early.
    pub fn stop(self) -> SearchStats {
        let stats = self.stats();
        tracing::debug!(
            "[SEARCH] stopped after {} attempts ({} found, {} blacklisted)",
            stats.attempts,
            stats.found,
            stats.blacklisted
        );
        stats
    }

    fn next_candidate(&mut self) -> Option<Result<Path, SearchItem<'ctx, 'a>>> {
        if let Some(path) = self.pending.take() {
            return Some(Ok(path));
        }
        let path = self.explorer.next_path(&self.session.blacklist)?;
        self.stats.attempts += 1;
        if self.stats.attempts > self.try_budget && !self.budget_signalled {
            self.budget_signalled = true;
            self.stats.budget_signals += 1;
            tracing::info!(
                "[SEARCH] try budget of {} paths exhausted",
                self.try_budget
            );
            self.pending = Some(path);
            return Some(Err(SearchItem::BudgetExhausted));
        }
        Some(Ok(path))
    }

    fn handle_failure(&mut self, path: &[usize], failure: SymbolicFailure) {
        match failure {
            SymbolicFailure::IntractablePath { trace, remaining } => {
                self.stats.infeasible += 1;
                let prefix = self
                    .diagnoser
                    .bad_prefix(self.project.cfg(), &trace, &remaining);
                tracing::info!("[SEARCH] Bad path: {}", format_path(&prefix));
                self.session.add_to_blacklist(prefix);
            }
            SymbolicFailure::ExternalData { pc, opcode } => {
                self.stats.external_data += 1;
                tracing::warn!(
                    "[SEARCH] path {} depends on external data (opcode 0x{:02x} at {:#x})",
                    format_path(path),
                    opcode,
                    pc
                );
            }
            SymbolicFailure::Symbolic(err) => {
                self.stats.symbolic_errors += 1;
                tracing::warn!(
                    "[SEARCH] symbolic error on path {}: {}",
                    format_path(path),
                    err
                );
            }
        }
    }
}

impl<'ctx, 'a> Iterator for ConstraintSearch<'ctx, 'a> {
    type Item = SearchItem<'ctx, 'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let path = match self.next_candidate()? {
                Ok(path) => path,
                Err(sentinel) => return Some(sentinel),
            };
            let Some(&last) = path.last() else {
                continue;
            };
            let Some(instruction) = self.targets.get(&last).copied() else {
                tracing::warn!("[SEARCH] explorer produced path to unknown target {:#x}", last);
                continue;
            };
            tracing::debug!("[SEARCH] Path {}", format_path(&path));

            let (ctx, project, inclusive) = (self.ctx, self.project, self.inclusive);
            let run = catch_unwind(AssertUnwindSafe(|| {
                project.run_symbolic(ctx, &path, inclusive)
            }));
            match run {
                Ok(Ok(outcome)) => {
                    self.stats.found += 1;
                    return Some(SearchItem::Found {
                        instruction,
                        path,
                        outcome,
                    });
                }
                Ok(Err(failure)) => self.handle_failure(&path, failure),
                Err(payload) => {
                    self.stats.unclassified += 1;
                    tracing::error!(
                        "[SEARCH] unclassified failure on path {} to {}: {}",
                        format_path(&path),
                        instruction,
                        panic_payload_to_string(payload)
                    );
                }
            }
        }
    }
}

/// Lazily yields explorer paths to a batch of targets without interpreting them.
///
/// Paths here end with the target's address just like in [`ConstraintSearch`].
pub struct PathEnumeration<'a> {
    explorer: ForwardExplorer<'a>,
    session: SearchSession,
    targets: BTreeMap<usize, &'a Instruction>,
    stats: SearchStats,
}

impl<'a> PathEnumeration<'a> {
    pub(crate) fn new(explorer: ForwardExplorer<'a>, targets: &[&'a Instruction]) -> Self {
        Self {
            explorer,
            session: SearchSession::default(),
            targets: targets.iter().map(|ins| (ins.addr, *ins)).collect(),
            stats: SearchStats::default(),
        }
    }

    pub fn add_to_blacklist(&mut self, prefix: Vec<usize>) -> bool {
        self.session.add_to_blacklist(prefix)
    }

    pub fn stop(self) -> SearchStats {
        SearchStats {
            blacklisted: self.session.blacklist.len(),
            expanded: self.explorer.expanded(),
            ..self.stats
        }
    }
}

impl<'a> Iterator for PathEnumeration<'a> {
    type Item = (&'a Instruction, Path);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let path = self.explorer.next_path(&self.session.blacklist)?;
            self.stats.attempts += 1;
            let Some(ins) = path.last().and_then(|last| self.targets.get(last)).copied() else {
                continue;
            };
            self.stats.found += 1;
            return Some((ins, path));
        }
    }
}
