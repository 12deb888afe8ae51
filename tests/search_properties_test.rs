mod common;

use common::guarded_dispatcher;
use dark_pathfinder::cfg::{Cfg, Opcode};
use dark_pathfinder::engine::reachability::reachable_targets;
use dark_pathfinder::engine::{EntryKey, Project, SearchItem, SearchOptions};
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestCaseError, TestRunner};
use std::collections::BTreeSet;
use z3::{Config, Context};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_reachability_filter_is_a_reachable_subset(code in prop::collection::vec(any::<u8>(), 1..96)) {
        let cfg = Cfg::from_code(&code);
        let all: Vec<_> = cfg.instructions().collect();
        let kept = reachable_targets(&cfg, all.iter().copied());
        let all_addrs: BTreeSet<usize> = all.iter().map(|i| i.addr).collect();
        for ins in &kept {
            prop_assert!(all_addrs.contains(&ins.addr));
            let bb = cfg.block_of(ins).unwrap();
            prop_assert!(bb.start == 0 || bb.ancestors.contains(&0));
        }
        prop_assert!(kept.iter().any(|i| i.addr == 0));
    }

    #[test]
    fn prop_func_entries_are_stable(code in prop::collection::vec(any::<u8>(), 1..96)) {
        let first = Project::new(code.clone()).unwrap();
        let second = Project::new(code).unwrap();
        prop_assert_eq!(first.func_entries(), second.func_entries());
    }
}

fn dispatcher_strategy() -> impl Strategy<Value = Vec<([u8; 4], u8)>> {
    (
        prop::collection::btree_set(any::<[u8; 4]>(), 1..4),
        prop::collection::vec(any::<u8>(), 4),
    )
        .prop_map(|(sels, guards)| sels.into_iter().zip(guards).collect())
}

fn check_dispatcher(functions: &[([u8; 4], u8)]) -> Result<(), TestCaseError> {
    let asm = guarded_dispatcher(functions);
    let project = Project::new(asm.finish()).map_err(|e| TestCaseError::fail(e.to_string()))?;

    for (i, (sel, _)) in functions.iter().enumerate() {
        prop_assert_eq!(
            project.func_entries().get(&EntryKey::Selector(*sel)),
            Some(&asm.addr_of(&format!("fn{i}")))
        );
    }

    let ctx = Context::new(&Config::new());
    let targets = project.cfg().filter_instructions(Opcode::SelfDestruct, true);
    let mut search = project.get_constraints(&ctx, &targets, &SearchOptions::default());
    let mut paths = Vec::new();
    while let Some(item) = search.next() {
        let SearchItem::Found { path, outcome, .. } = item else {
            continue;
        };
        prop_assert!(!search.session().blacklist().rejects(&path));
        let calldata = outcome.calldata().unwrap_or_default();
        let value = outcome.callvalue().unwrap_or_default();
        let replay = project
            .run(&calldata, value)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(replay.success, "witness for path {:?} reverted", path);
        paths.push(path);
    }
    prop_assert_eq!(paths.len(), functions.len());

    let again: Vec<_> = project
        .get_constraints(&ctx, &targets, &SearchOptions::default())
        .filter_map(|item| match item {
            SearchItem::Found { path, .. } => Some(path),
            SearchItem::BudgetExhausted => None,
        })
        .collect();
    prop_assert_eq!(again, paths);
    Ok(())
}

#[test]
fn test_dispatcher_witnesses_are_sound_and_deterministic() {
    let mut runner = TestRunner::new(ProptestConfig {
        cases: 16,
        ..ProptestConfig::default()
    });
    let result = runner.run(&dispatcher_strategy(), |functions| check_dispatcher(&functions));
    if let Err(err) = result {
        panic!("dispatcher search property failed: {err}");
    }
}
