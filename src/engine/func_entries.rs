//! Selector dispatch table recovery.
//!
//! Solidity-style dispatchers end every arm with one of
//!
//! ```text
//! PUSH4 sel, DUP2, EQ, PUSH target, JUMPI
//! DUP1, PUSH4 sel, EQ, PUSH target, JUMPI
//! ```
//!
//! and the first JUMPDEST block long enough to hold an arm is taken as the fallback.

use crate::cfg::disassembly::Instruction;
use crate::cfg::graph::Cfg;
use crate::cfg::opcodes::Opcode;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

const ARM_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKey {
    Selector([u8; 4]),
    Fallback,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector(sel) => write!(f, "{}", hex::encode(sel)),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

impl Serialize for EntryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub type FuncEntryMap = BTreeMap<EntryKey, usize>;

#[derive(Debug, Clone, Copy)]
enum ArmScan {
    Start,
    SelectorPushed([u8; 4]),
    TopDuplicated,
    Selector([u8; 4]),
    Compared([u8; 4]),
    TargetPushed([u8; 4], usize),
    Matched([u8; 4], usize),
}

impl ArmScan {
    fn step(self, ins: &Instruction) -> Option<Self> {
        match (self, ins.op) {
            (Self::Start, Opcode::Push(4)) => selector(ins).map(Self::SelectorPushed),
            (Self::Start, Opcode::Dup(1)) => Some(Self::TopDuplicated),
            (Self::SelectorPushed(sel), Opcode::Dup(2)) => Some(Self::Selector(sel)),
            (Self::TopDuplicated, Opcode::Push(4)) => selector(ins).map(Self::Selector),
            (Self::Selector(sel), Opcode::Eq) => Some(Self::Compared(sel)),
            (Self::Compared(sel), Opcode::Push(n)) if n > 0 => {
                let target = ins.arg_value().and_then(|v| usize::try_from(v).ok())?;
                Some(Self::TargetPushed(sel, target))
            }
            (Self::TargetPushed(sel, target), Opcode::JumpI) => Some(Self::Matched(sel, target)),
            _ => None,
        }
    }
}

fn selector(ins: &Instruction) -> Option<[u8; 4]> {
    <[u8; 4]>::try_from(ins.arg.as_slice()).ok()
}

/// Match the dispatcher arm pattern against the last five instructions of a block.
pub fn match_arm(tail: &[Instruction]) -> Option<([u8; 4], usize)> {
    let window = tail.get(tail.len().checked_sub(ARM_LEN)?..)?;
    let state = window
        .iter()
        .try_fold(ArmScan::Start, |state, ins| state.step(ins))?;
    match state {
        ArmScan::Matched(sel, target) => Some((sel, target)),
        _ => None,
    }
}

pub fn recover_func_entries(cfg: &Cfg) -> FuncEntryMap {
    let mut entries = FuncEntryMap::new();
    for bb in cfg.blocks() {
        if bb.instructions.len() < ARM_LEN {
            continue;
        }
        if bb.instructions[0].op == Opcode::JumpDest {
            entries.insert(EntryKey::Fallback, bb.start);
            break;
        }
        if let Some((sel, target)) = match_arm(&bb.instructions) {
            entries.insert(EntryKey::Selector(sel), target);
        }
    }
    tracing::debug!("[FUNCS] recovered {} function entries", entries.len());
    entries
}

/// First entry whose block lies on `path`, else the fallback.
pub fn func_sig(entries: &FuncEntryMap, path: &[usize]) -> EntryKey {
    entries
        .iter()
        .find(|(_, entry)| path.contains(entry))
        .map(|(key, _)| *key)
        .unwrap_or(EntryKey::Fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-arm dispatcher; the first arm uses DUP1/PUSH4, the second PUSH4/DUP2.
    fn dispatcher() -> Vec<u8> {
        let mut code = vec![
            0x60, 0x00, 0x35, 0x60, 0xe0, 0x1c, // selector = calldata[0..4]
            0x80, 0x63, 0xaa, 0xbb, 0xcc, 0xdd, 0x14, 0x61, 0x00, 0x1c, 0x57, // arm 1
        ];
        // 0x11: arm 2
        code.extend_from_slice(&[0x63, 0x11, 0x22, 0x33, 0x44, 0x81, 0x14, 0x61, 0x00, 0x1f, 0x57]);
        // 0x1c: fallthrough STOP, then 0x1d: padding
        code.extend_from_slice(&[0x00, 0x00, 0x00]);
        code
    }

    #[test]
    fn test_dup1_push4_arm_matches() {
        let cfg = Cfg::from_code(&dispatcher());
        let root = cfg.block_at(0).unwrap();
        assert_eq!(
            match_arm(&root.instructions),
            Some(([0xaa, 0xbb, 0xcc, 0xdd], 0x1c))
        );
    }

    #[test]
    fn test_recovers_both_orderings() {
        let cfg = Cfg::from_code(&dispatcher());
        let entries = recover_func_entries(&cfg);
        assert_eq!(
            entries.get(&EntryKey::Selector([0xaa, 0xbb, 0xcc, 0xdd])),
            Some(&0x1c)
        );
        assert_eq!(
            entries.get(&EntryKey::Selector([0x11, 0x22, 0x33, 0x44])),
            Some(&0x1f)
        );
        assert!(!entries.contains_key(&EntryKey::Fallback));
        assert_eq!(recover_func_entries(&cfg), entries);
    }

    #[test]
    fn test_jumpdest_block_is_fallback_and_stops_scan() {
        // 0x00: JUMPDEST PUSH1 0 PUSH1 0 POP POP STOP, then a would-be arm.
        let mut code = vec![0x5b, 0x60, 0x00, 0x60, 0x00, 0x50, 0x50, 0x00];
        code.extend_from_slice(&[0x80, 0x63, 0xaa, 0xbb, 0xcc, 0xdd, 0x14, 0x61, 0x00, 0x00, 0x57]);
        let cfg = Cfg::from_code(&code);
        let entries = recover_func_entries(&cfg);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get(&EntryKey::Fallback), Some(&0));
    }

    #[test]
    fn test_non_matching_tail_is_skipped() {
        let ins = |op| Instruction {
            addr: 0,
            op,
            arg: Vec::new(),
            block: 0,
        };
        let tail = vec![
            ins(Opcode::Dup(1)),
            ins(Opcode::Dup(2)),
            ins(Opcode::Eq),
            ins(Opcode::Pop),
            ins(Opcode::JumpI),
        ];
        assert_eq!(match_arm(&tail), None);
        assert_eq!(match_arm(&tail[1..]), None);
    }

    #[test]
    fn test_func_sig_prefers_entry_on_path() {
        let mut entries = FuncEntryMap::new();
        entries.insert(EntryKey::Selector([1, 2, 3, 4]), 0x40);
        entries.insert(EntryKey::Fallback, 0x80);
        assert_eq!(func_sig(&entries, &[0, 0x40, 0x44]), EntryKey::Selector([1, 2, 3, 4]));
        assert_eq!(func_sig(&entries, &[0, 0x80]), EntryKey::Fallback);
        assert_eq!(func_sig(&entries, &[0, 0x10]), EntryKey::Fallback);
        assert_eq!(EntryKey::Selector([1, 2, 3, 4]).to_string(), "01020304");
    }
}
