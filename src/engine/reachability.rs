use crate::cfg::disassembly::Instruction;
use crate::cfg::graph::Cfg;

/// Keep only instructions whose owning block can be entered from the root block.
///
/// Instructions that do not belong to a known block are dropped as well.
pub fn reachable_targets<'a, I>(cfg: &Cfg, instructions: I) -> Vec<&'a Instruction>
where
    I: IntoIterator<Item = &'a Instruction>,
{
    instructions
        .into_iter()
        .filter(|ins| {
            cfg.block_of(ins)
                .map(|bb| bb.is_reachable_from_root())
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::opcodes::Opcode;

    #[test]
    fn test_dead_block_is_filtered() {
        // 0x00: PUSH1 0x04 JUMP | 0x03: STOP (dead) | 0x04: JUMPDEST STOP
        let code = [0x60, 0x04, 0x56, 0x00, 0x5b, 0x00];
        let cfg = Cfg::from_code(&code);
        let stops = cfg.filter_instructions(Opcode::Stop, false);
        assert_eq!(stops.len(), 2);
        let live = reachable_targets(&cfg, stops);
        assert_eq!(live.iter().map(|i| i.addr).collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_root_block_is_always_reachable() {
        let code = [0x60, 0x01, 0x00];
        let cfg = Cfg::from_code(&code);
        let all: Vec<_> = cfg.instructions().collect();
        assert_eq!(reachable_targets(&cfg, all).len(), 2);
    }
}
