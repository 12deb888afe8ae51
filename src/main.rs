use alloy::primitives::U256;
use anyhow::{anyhow, Context as _, Result};
use dark_pathfinder::cfg::{Instruction, Opcode};
use dark_pathfinder::engine::runner::{collect_constraints, collect_constraints_parallel};
use dark_pathfinder::engine::{Project, SearchOptions, SliceMode};
use dark_pathfinder::utils::config::SearchParams;
use dark_pathfinder::utils::hex::{decode_code, to_u256};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Args {
    code: Option<PathBuf>,
    project: Option<PathBuf>,
    save: Option<PathBuf>,
    targets: Vec<usize>,
    opcode: Option<Opcode>,
    mode: SliceMode,
    inclusive: bool,
    loop_limit: Option<usize>,
    max_results: usize,
    parallel: bool,
    paths_only: bool,
    func_entries: bool,
    writes: bool,
    run: Option<Vec<u8>>,
    value: U256,
}

fn print_usage() {
    eprintln!(
        "usage: dark_pathfinder (--code <hex file> | --project <json file>) [options]\n\
         \n\
         targets:\n  \
           --target <0x..>        instruction address (repeatable)\n  \
           --opcode <NAME>        every reachable instruction with this opcode\n\
         search:\n  \
           --args <i,j,..>        argument-guided slices over these stack operands\n  \
           --store-paired         require a prior SSTORE on every path\n  \
           --inclusive            execute the target itself before solving\n  \
           --loop-limit <n>       per-block visit ceiling for this run\n  \
           --max-results <n>      stop after n findings per batch (default 8)\n  \
           --parallel             one batch per target on the blocking pool\n  \
           --paths                list candidate paths without solving\n\
         reports:\n  \
           --func-entries         recovered selector dispatch table\n  \
           --writes               storage slots written by each SSTORE\n  \
           --run <calldata hex>   concrete execution (with --value <wei>)\n  \
           --save <json file>     write the project (code + cfg) as json\n\
         env: PATHFINDER_LOOP_LIMIT PATHFINDER_TRY_BUDGET PATHFINDER_MAX_SLICES \
         PATHFINDER_SOLVER_TIMEOUT_MS RUST_LOG"
    );
}

fn parse_addr(raw: &str) -> Result<usize> {
    let value = to_u256(raw).ok_or_else(|| anyhow!("invalid address '{raw}'"))?;
    usize::try_from(value).map_err(|_| anyhow!("address '{raw}' out of range"))
}

fn parse_opcode(raw: &str) -> Result<Opcode> {
    (0u8..=255)
        .map(Opcode::from_byte)
        .find(|op| !matches!(op, Opcode::Unknown(_)) && op.name().eq_ignore_ascii_case(raw))
        .ok_or_else(|| anyhow!("unknown opcode '{raw}'"))
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        max_results: 8,
        ..Args::default()
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = || iter.next().ok_or_else(|| anyhow!("missing value for {arg}"));
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--code" | "-c" => args.code = Some(PathBuf::from(value()?)),
            "--project" | "-p" => args.project = Some(PathBuf::from(value()?)),
            "--save" => args.save = Some(PathBuf::from(value()?)),
            "--target" | "-t" => args.targets.push(parse_addr(&value()?)?),
            "--opcode" | "-o" => args.opcode = Some(parse_opcode(&value()?)?),
            "--args" => {
                let raw = value()?;
                let slots = raw
                    .split(',')
                    .map(|s| {
                        s.trim()
                            .parse::<usize>()
                            .map_err(|e| anyhow!("invalid argument index '{s}': {e}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                args.mode = SliceMode::ArgumentGuided(slots);
            }
            "--store-paired" => args.mode = SliceMode::StorePaired,
            "--inclusive" => args.inclusive = true,
            "--loop-limit" => {
                let raw = value()?;
                args.loop_limit = Some(
                    raw.parse::<usize>()
                        .map_err(|e| anyhow!("invalid loop limit '{raw}': {e}"))?,
                );
            }
            "--max-results" => {
                let raw = value()?;
                args.max_results = raw
                    .parse::<usize>()
                    .map_err(|e| anyhow!("invalid result cap '{raw}': {e}"))?;
            }
            "--parallel" => args.parallel = true,
            "--paths" => args.paths_only = true,
            "--func-entries" => args.func_entries = true,
            "--writes" => args.writes = true,
            "--run" => {
                let raw = value()?;
                args.run = Some(if raw.trim().is_empty() || raw.trim() == "0x" {
                    Vec::new()
                } else {
                    decode_code(&raw)?
                });
            }
            "--value" => {
                let raw = value()?;
                args.value = to_u256(&raw).ok_or_else(|| anyhow!("invalid value '{raw}'"))?;
            }
            other => return Err(anyhow!("unknown argument '{other}'")),
        }
    }

    if args.code.is_none() == args.project.is_none() {
        return Err(anyhow!("exactly one of --code or --project is required"));
    }
    Ok(args)
}

fn load_project(args: &Args) -> Result<Project> {
    let project = match (&args.code, &args.project) {
        (Some(path), _) => Project::load(path)
            .with_context(|| format!("failed to load bytecode from {}", path.display()))?,
        (None, Some(path)) => Project::load_json(path)
            .with_context(|| format!("failed to load project from {}", path.display()))?,
        (None, None) => return Err(anyhow!("no input given")),
    };
    Ok(project.with_params(SearchParams::from_env()))
}

fn resolve_targets<'a>(project: &'a Project, args: &Args) -> Result<Vec<&'a Instruction>> {
    let mut targets = Vec::new();
    for addr in &args.targets {
        targets.push(project.cfg().instruction_at(*addr)?);
    }
    if let Some(op) = args.opcode {
        targets.extend(project.cfg().filter_instructions(op, true));
    }
    Ok(targets)
}

fn emit(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args().inspect_err(|_| print_usage())?;
    let project = load_project(&args)?;
    tracing::info!(
        "[PATHFINDER] {} bytes, {} basic blocks",
        project.code().len(),
        project.cfg().blocks().len()
    );

    if let Some(path) = &args.save {
        std::fs::write(path, serde_json::to_string(&project.to_json())?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("[PATHFINDER] saved project to {}", path.display());
    }

    if let Some(calldata) = &args.run {
        let result = project.run(calldata, args.value)?;
        emit(&serde_json::json!({ "run": result }))?;
    }

    if args.func_entries {
        let entries: serde_json::Map<String, serde_json::Value> = project
            .func_entries()
            .iter()
            .map(|(key, entry)| (key.to_string(), serde_json::json!(format!("{entry:#x}"))))
            .collect();
        emit(&serde_json::json!({ "func_entries": entries }))?;
    }

    if args.writes {
        let writes = project.writes();
        let concrete: serde_json::Map<String, serde_json::Value> = writes
            .concrete
            .iter()
            .map(|(slot, stores)| (format!("{slot:#x}"), serde_json::json!(stores)))
            .collect();
        emit(&serde_json::json!({
            "writes": {
                "concrete": concrete,
                "symbolic": writes.symbolic,
                "unresolved": writes.unresolved,
            }
        }))?;
    }

    let targets = resolve_targets(&project, &args)?;
    if targets.is_empty() {
        return Ok(());
    }
    let options = SearchOptions {
        mode: args.mode.clone(),
        inclusive: args.inclusive,
        loop_limit: args.loop_limit,
    };

    if args.paths_only {
        let paths: Vec<_> = project
            .get_paths(&targets, &options)
            .take(args.max_results)
            .map(|(ins, path)| serde_json::json!({ "instruction": ins.addr, "path": path }))
            .collect();
        return emit(&serde_json::json!({ "paths": paths }));
    }

    if args.parallel {
        let batches: Vec<Vec<usize>> = targets.iter().map(|ins| vec![ins.addr]).collect();
        let reports = collect_constraints_parallel(
            Arc::new(project),
            batches,
            options,
            args.max_results,
        )
        .await?;
        return emit(&serde_json::json!({ "batches": reports }));
    }

    let addrs: Vec<usize> = targets.iter().map(|ins| ins.addr).collect();
    let (findings, stats) = collect_constraints(&project, &addrs, &options, args.max_results);
    tracing::info!(
        "[PATHFINDER] {} findings after {} candidate paths ({} blacklisted)",
        findings.len(),
        stats.attempts,
        stats.blacklisted
    );
    emit(&serde_json::json!({ "findings": findings, "stats": stats }))
}
