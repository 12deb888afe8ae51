//! Storage write-target analysis.

use crate::cfg::graph::Cfg;
use crate::cfg::opcodes::Opcode;
use crate::engine::runner::panic_payload_to_string;
use crate::slicing::backward_slices;
use crate::symbolic::{run_slice, ExecutionContext};
use alloy::primitives::U256;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use z3::{Config, Context};

/// Which SSTOREs may write which slot.
///
/// Every store lands in exactly one of `concrete`, `symbolic` or `unresolved`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteMap {
    pub concrete: BTreeMap<U256, BTreeSet<usize>>,
    /// Stores whose slot could not be pinned to one constant.
    pub symbolic: BTreeSet<usize>,
    /// Stores for which no slice could be interpreted.
    pub unresolved: BTreeSet<usize>,
}

impl WriteMap {
    /// `(writers of exactly slot, writers of unknown slots)`.
    pub fn writes_to(&self, slot: Option<U256>) -> (BTreeSet<usize>, BTreeSet<usize>) {
        let concrete = slot
            .and_then(|s| self.concrete.get(&s))
            .cloned()
            .unwrap_or_default();
        (concrete, self.symbolic.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotResolution {
    Concrete(U256),
    Symbolic,
    Unresolved,
}

/// Slice back from every SSTORE and classify its target slot.
///
/// A store resolves to a concrete slot only when every interpretable slice agrees on the
/// same constant. Every backward slice is used, not only sender-influenced ones, so a
/// store whose operands are all constants still lands in its concrete bucket.
pub fn analyze_writes(
    cfg: &Cfg,
    code: &[u8],
    context: &ExecutionContext,
    max_slices: usize,
) -> WriteMap {
    let ctx = Context::new(&Config::new());
    let mut map = WriteMap::default();

    for store in cfg.filter_instructions(Opcode::SStore, false) {
        let mut resolution = SlotResolution::Unresolved;
        for mut slice in backward_slices(cfg, store, None, false, max_slices) {
            slice.push(store);
            let run = catch_unwind(AssertUnwindSafe(|| {
                run_slice(&ctx, &slice, code, context).map(|outcome| outcome.concrete_operand(0))
            }));
            let slot = match run {
                Ok(Ok(slot)) => slot,
                Ok(Err(err)) => {
                    tracing::debug!("[WRITES] slice for store at {:#x} failed: {}", store.addr, err);
                    continue;
                }
                Err(payload) => {
                    tracing::error!(
                        "[WRITES] slice for store at {:#x} panicked: {}",
                        store.addr,
                        panic_payload_to_string(payload)
                    );
                    continue;
                }
            };
            resolution = match (resolution, slot) {
                (SlotResolution::Unresolved, Some(v)) => SlotResolution::Concrete(v),
                (SlotResolution::Concrete(prev), Some(v)) if prev == v => resolution,
                _ => SlotResolution::Symbolic,
            };
            if resolution == SlotResolution::Symbolic {
                break;
            }
        }

        match resolution {
            SlotResolution::Concrete(slot) => {
                map.concrete.entry(slot).or_default().insert(store.addr);
            }
            SlotResolution::Symbolic => {
                map.symbolic.insert(store.addr);
            }
            SlotResolution::Unresolved => {
                tracing::warn!(
                    "[WRITES] could not resolve target of store at {:#x}",
                    store.addr
                );
                map.unresolved.insert(store.addr);
            }
        }
    }

    tracing::debug!(
        "[WRITES] {} concrete slots, {} symbolic stores, {} unresolved",
        map.concrete.len(),
        map.symbolic.len(),
        map.unresolved.len()
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(code: &[u8]) -> WriteMap {
        let cfg = Cfg::from_code(code);
        analyze_writes(&cfg, code, &ExecutionContext::default(), 16)
    }

    #[test]
    fn test_constant_slot_is_concrete() {
        // CALLER PUSH1 0x05 SSTORE STOP
        let map = analyze(&[0x33, 0x60, 0x05, 0x55, 0x00]);
        assert_eq!(
            map.concrete.get(&U256::from(5)),
            Some(&BTreeSet::from([3usize]))
        );
        assert!(map.symbolic.is_empty());
        assert!(map.unresolved.is_empty());
        let (exact, anywhere) = map.writes_to(Some(U256::from(5)));
        assert_eq!(exact, BTreeSet::from([3usize]));
        assert!(anywhere.is_empty());
    }

    #[test]
    fn test_calldata_slot_is_symbolic() {
        // PUSH1 0x01 PUSH1 0x00 CALLDATALOAD SSTORE STOP
        let map = analyze(&[0x60, 0x01, 0x60, 0x00, 0x35, 0x55, 0x00]);
        assert!(map.concrete.is_empty());
        assert_eq!(map.symbolic, BTreeSet::from([5usize]));
        let (exact, anywhere) = map.writes_to(Some(U256::from(1)));
        assert!(exact.is_empty());
        assert_eq!(anywhere, BTreeSet::from([5usize]));
    }

    #[test]
    fn test_slot_from_hashed_key_is_symbolic() {
        // CALLER PUSH1 0 MSTORE PUSH1 0x20 PUSH1 0 SHA3 CALLVALUE SWAP1 SSTORE STOP
        let code = [
            0x33, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0x20, 0x34, 0x90, 0x55, 0x00,
        ];
        let map = analyze(&code);
        assert_eq!(map.symbolic, BTreeSet::from([0x0busize]));
    }

    #[test]
    fn test_every_store_classified_once() {
        // two stores: slot 7 then slot calldata[0]
        let code = [
            0x60, 0x01, 0x60, 0x07, 0x55, 0x60, 0x02, 0x60, 0x00, 0x35, 0x55, 0x00,
        ];
        let cfg = Cfg::from_code(&code);
        let map = analyze(&code);
        for store in cfg.filter_instructions(Opcode::SStore, false) {
            let in_concrete = map
                .concrete
                .values()
                .filter(|s| s.contains(&store.addr))
                .count();
            let hits = in_concrete
                + usize::from(map.symbolic.contains(&store.addr))
                + usize::from(map.unresolved.contains(&store.addr));
            assert_eq!(hits, 1, "store at {:#x}", store.addr);
        }
        assert_eq!(map.writes_to(None).0, BTreeSet::new());
    }

    #[test]
    fn test_store_with_constant_operands_is_concrete() {
        // PUSH1 0x01 PUSH1 0x07 SSTORE STOP
        let map = analyze(&[0x60, 0x01, 0x60, 0x07, 0x55, 0x00]);
        assert_eq!(
            map.concrete.get(&U256::from(7)),
            Some(&BTreeSet::from([4usize]))
        );
        assert!(map.symbolic.is_empty());
        assert!(map.unresolved.is_empty());
    }
}
