use crate::engine::search::{SearchItem, SearchOptions, SearchStats};
use crate::engine::Project;
use crate::explorer::Path;
use crate::symbolic::SymbolicOutcome;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinSet;
use z3::{Config, Context};

pub(crate) fn panic_payload_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "panic (unknown payload)".to_string()
}

/// Context-free summary of one satisfiable path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub instruction: usize,
    pub opcode: String,
    pub path: Path,
    /// Hex-encoded witness input, when a model was produced.
    pub calldata: Option<String>,
    pub callvalue: Option<String>,
}

impl Finding {
    pub fn from_outcome(
        instruction: &crate::cfg::Instruction,
        path: &[usize],
        outcome: &SymbolicOutcome<'_>,
    ) -> Self {
        Self {
            instruction: instruction.addr,
            opcode: instruction.name(),
            path: path.to_vec(),
            calldata: outcome.calldata().map(hex::encode),
            callvalue: outcome.callvalue().map(|v| format!("{v:#x}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Position of the batch in the request.
    pub batch: usize,
    pub findings: Vec<Finding>,
    pub stats: SearchStats,
}

/// Run one batch to completion or until `max_findings` paths were found.
pub fn collect_constraints(
    project: &Project,
    targets: &[usize],
    options: &SearchOptions,
    max_findings: usize,
) -> (Vec<Finding>, SearchStats) {
    let ctx = Context::new(&Config::new());
    let instructions: Vec<_> = targets
        .iter()
        .filter_map(|addr| match project.cfg().instruction_at(*addr) {
            Ok(ins) => Some(ins),
            Err(err) => {
                tracing::warn!("[RUNNER] skipping target: {}", err);
                None
            }
        })
        .collect();

    let mut search = project.get_constraints(&ctx, &instructions, options);
    let mut findings = Vec::new();
    while findings.len() < max_findings {
        match search.next() {
            Some(SearchItem::Found {
                instruction,
                path,
                outcome,
            }) => findings.push(Finding::from_outcome(instruction, &path, &outcome)),
            Some(SearchItem::BudgetExhausted) => {}
            None => break,
        }
    }
    (findings, search.stop())
}

/// Parallel batch runner.
///
/// Each batch gets its own `spawn_blocking` thread, z3 context, explorer and blacklist.
/// Z3 contexts are not `Send`, so nothing symbolic crosses a thread boundary; only the
/// read-only `Project` is shared.
pub async fn collect_constraints_parallel(
    project: Arc<Project>,
    batches: Vec<Vec<usize>>,
    options: SearchOptions,
    max_findings: usize,
) -> anyhow::Result<Vec<BatchReport>> {
    let mut join_set = JoinSet::new();
    for (batch, targets) in batches.into_iter().enumerate() {
        let project = Arc::clone(&project);
        let options = options.clone();
        join_set.spawn_blocking(move || {
            tracing::debug!("[RUNNER] batch {} with {} targets", batch, targets.len());
            let run = catch_unwind(AssertUnwindSafe(|| {
                collect_constraints(&project, &targets, &options, max_findings)
            }));
            match run {
                Ok((findings, stats)) => Ok(BatchReport {
                    batch,
                    findings,
                    stats,
                }),
                Err(payload) => Err(format!(
                    "batch {batch} panicked: {}",
                    panic_payload_to_string(payload)
                )),
            }
        });
    }

    let mut reports = Vec::new();
    let mut worker_failures: Vec<String> = Vec::new();
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(message)) => worker_failures.push(message),
            Err(err) => {
                if err.is_panic() {
                    worker_failures.push(format!("panic: {err:?}"));
                } else {
                    worker_failures.push(format!("cancelled: {err:?}"));
                }
            }
        }
    }

    if !worker_failures.is_empty() {
        tracing::error!(
            "[RUNNER] {} batch workers failed: {}",
            worker_failures.len(),
            worker_failures.join("; ")
        );
        return Err(anyhow::anyhow!(
            "parallel constraint runner failed: {}",
            worker_failures.join("; ")
        ));
    }

    reports.sort_by_key(|r| r.batch);
    Ok(reports)
}
