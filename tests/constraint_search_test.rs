mod common;

use alloy::primitives::U256;
use common::*;
use dark_pathfinder::cfg::Opcode;
use dark_pathfinder::engine::{EntryKey, Project, SearchItem, SearchOptions, SliceMode};
use dark_pathfinder::symbolic::CallRecord;
use z3::{Config, Context};

const SEL_A: [u8; 4] = [0xaa, 0xbb, 0xcc, 0xdd];
const SEL_B: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

struct Witness {
    path: Vec<usize>,
    calldata: Vec<u8>,
    callvalue: U256,
}

fn witnesses(project: &Project, opcode: Opcode, options: &SearchOptions) -> Vec<Witness> {
    let ctx = Context::new(&Config::new());
    let targets = project.cfg().filter_instructions(opcode, true);
    project
        .get_constraints(&ctx, &targets, options)
        .filter_map(|item| match item {
            SearchItem::Found { path, outcome, .. } => Some(Witness {
                path,
                calldata: outcome.calldata().expect("model calldata"),
                callvalue: outcome.callvalue().expect("model callvalue"),
            }),
            SearchItem::BudgetExhausted => None,
        })
        .collect()
}

#[test]
fn test_dispatcher_witnesses_replay_concretely() {
    let asm = guarded_dispatcher(&[(SEL_A, 0x42), (SEL_B, 0x07)]);
    let project = Project::new(asm.finish()).unwrap();
    let found = witnesses(&project, Opcode::SelfDestruct, &SearchOptions::default());
    assert_eq!(found.len(), 2);

    for (w, (sel, guard, body)) in found
        .iter()
        .zip([(SEL_A, 0x42u8, "fn0"), (SEL_B, 0x07u8, "fn1")])
    {
        assert!(w.path.contains(&asm.addr_of(body)));
        assert!(w.calldata.len() >= 4);
        assert_eq!(w.calldata[..4], sel);
        let res = project.run(&w.calldata, w.callvalue).unwrap();
        assert!(res.success, "witness for {} did not replay", hex::encode(sel));
        let mut arg: Vec<u8> = w.calldata.iter().skip(4).take(32).copied().collect();
        arg.resize(32, 0);
        assert_eq!(U256::from_be_slice(&arg), U256::from(guard));
    }
}

#[test]
fn test_func_entries_and_signature_lookup() {
    let asm = guarded_dispatcher(&[(SEL_A, 1), (SEL_B, 2)]);
    let project = Project::new(asm.finish()).unwrap();
    let entries = project.func_entries();
    assert_eq!(entries.get(&EntryKey::Selector(SEL_A)), Some(&asm.addr_of("fn0")));
    assert_eq!(entries.get(&EntryKey::Selector(SEL_B)), Some(&asm.addr_of("fn1")));

    let path = [0, asm.addr_of("fn1"), asm.addr_of("ok1")];
    assert_eq!(project.func_sig(&path), EntryKey::Selector(SEL_B));
    assert_eq!(project.func_sig(&[0]), EntryKey::Fallback);
}

#[test]
fn test_search_is_deterministic() {
    let asm = guarded_dispatcher(&[(SEL_A, 3), (SEL_B, 4)]);
    let project = Project::new(asm.finish()).unwrap();
    let first: Vec<_> = witnesses(&project, Opcode::SelfDestruct, &SearchOptions::default())
        .into_iter()
        .map(|w| w.path)
        .collect();
    let second: Vec<_> = witnesses(&project, Opcode::SelfDestruct, &SearchOptions::default())
        .into_iter()
        .map(|w| w.path)
        .collect();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_argument_guided_search_reaches_target() {
    let asm = guarded_dispatcher(&[(SEL_A, 9)]);
    let project = Project::new(asm.finish()).unwrap();
    let options = SearchOptions::default().with_mode(SliceMode::ArgumentGuided(vec![0]));
    let found = witnesses(&project, Opcode::SelfDestruct, &options);
    assert!(!found.is_empty());
    assert!(project.run(&found[0].calldata, found[0].callvalue).unwrap().success);
}

#[test]
fn test_store_paired_paths_pass_through_store() {
    let mut asm = Asm::new();
    asm.push1(0)
        .op(CALLDATALOAD)
        .push_label("store")
        .op(JUMPI)
        .push_label("end")
        .op(JUMP);
    asm.label("store").op(CALLER).push1(0).op(SSTORE);
    asm.label("end").op(CALLER).op(SELFDESTRUCT);
    let project = Project::new(asm.finish()).unwrap();

    let options = SearchOptions::default().with_mode(SliceMode::StorePaired);
    let found = witnesses(&project, Opcode::SelfDestruct, &options);
    assert!(!found.is_empty());
    for w in &found {
        assert!(w.path.contains(&asm.addr_of("store")));
        assert!(w.calldata.iter().take(32).any(|b| *b != 0));
    }

    let (exact, anywhere) = project.writes_to(Some(U256::ZERO));
    assert_eq!(exact.len(), 1);
    assert!(anywhere.is_empty());
}

#[test]
fn test_inclusive_run_applies_target() {
    let mut asm = Asm::new();
    asm.op(CALLER).push1(5).op(SSTORE).op(STOP);
    let project = Project::new(asm.finish()).unwrap();
    let ctx = Context::new(&Config::new());
    let store = project.cfg().instruction_at(3).unwrap();

    for (inclusive, writes) in [(false, 0usize), (true, 1usize)] {
        let options = SearchOptions::default().inclusive(inclusive);
        let mut search = project.get_constraints(&ctx, &[store], &options);
        let Some(SearchItem::Found { outcome, .. }) = search.next() else {
            panic!("store should be reachable");
        };
        assert_eq!(outcome.state.storage_writes.len(), writes);
        assert_eq!(outcome.concrete_operand(0), Some(U256::from(5)));
    }
}

#[test]
fn test_observed_call_records_unlock_return_data_paths() {
    let mut asm = Asm::new();
    asm.push1(0x20)
        .push1(0)
        .push1(0)
        .push1(0)
        .push1(0xaa)
        .op(GAS);
    let call_pc = asm.here();
    asm.op(STATICCALL)
        .op(POP)
        .op(RETURNDATASIZE)
        .push_label("ok")
        .op(JUMPI)
        .revert();
    asm.label("ok").op(CALLER).op(SELFDESTRUCT);
    let code = asm.finish();

    let blind = Project::new(code.clone()).unwrap();
    assert!(witnesses(&blind, Opcode::SelfDestruct, &SearchOptions::default()).is_empty());

    let observed = Project::new(code).unwrap().with_xcall(vec![CallRecord {
        pc: call_pc,
        success: true,
        return_data: vec![0u8; 32],
    }]);
    assert_eq!(observed.xcall().len(), 1);
    let found = witnesses(&observed, Opcode::SelfDestruct, &SearchOptions::default());
    assert_eq!(found.len(), 1);
    assert!(found[0].path.contains(&asm.addr_of("ok")));
}

#[test]
fn test_unreachable_targets_produce_nothing() {
    let mut asm = Asm::new();
    asm.op(STOP).op(CALLER).op(SELFDESTRUCT);
    let project = Project::new(asm.finish()).unwrap();
    let ctx = Context::new(&Config::new());
    let targets = project.cfg().filter_instructions(Opcode::SelfDestruct, false);
    assert_eq!(targets.len(), 1);
    let search = project.get_constraints(&ctx, &targets, &SearchOptions::default());
    assert_eq!(search.count(), 0);
}
