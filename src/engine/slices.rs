use crate::cfg::disassembly::Instruction;
use crate::cfg::graph::Cfg;
use crate::cfg::opcodes::Opcode;
use crate::slicing::{interesting_slices, Slice};

/// How search seeds are derived from the target instructions of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SliceMode {
    /// One single-instruction slice per target.
    #[default]
    Direct,
    /// Slices producing the given stack operands (0 = top) of each target, target appended.
    /// An empty operand list seeds like [`SliceMode::Direct`].
    ArgumentGuided(Vec<usize>),
    /// Every reachable SSTORE paired with every target, store first.
    StorePaired,
}

/// Build the slice batch for `targets`, in target order.
pub fn select_slices<'a>(
    cfg: &'a Cfg,
    targets: &[&'a Instruction],
    mode: &SliceMode,
    max_slices: usize,
) -> Vec<Slice<'a>> {
    match mode {
        SliceMode::Direct => targets.iter().map(|ins| vec![*ins]).collect(),
        // No operands to guide on: same seeds as direct mode.
        SliceMode::ArgumentGuided(args) if args.is_empty() => {
            targets.iter().map(|ins| vec![*ins]).collect()
        }
        SliceMode::ArgumentGuided(args) => {
            let mut slices = Vec::new();
            for ins in targets {
                for mut slice in interesting_slices(cfg, ins, Some(args), true, max_slices) {
                    slice.push(*ins);
                    slices.push(slice);
                }
            }
            slices
        }
        SliceMode::StorePaired => {
            let stores = cfg.filter_instructions(Opcode::SStore, true);
            let mut slices = Vec::with_capacity(stores.len() * targets.len());
            for store in &stores {
                for ins in targets {
                    slices.push(vec![*store, *ins]);
                }
            }
            slices
        }
    }
}
