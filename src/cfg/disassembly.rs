use crate::cfg::opcodes::Opcode;
use crate::utils::hex::be_bytes_to_u256;
use alloy::primitives::U256;
use std::collections::BTreeMap;
use std::fmt;

/// Address -> instruction lookup handed to the symbolic driver.
pub type InstructionIndex = BTreeMap<usize, Instruction>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub addr: usize,
    pub op: Opcode,
    /// Immediate bytes; only PUSH instructions carry them.
    pub arg: Vec<u8>,
    /// Start address of the owning basic block.
    pub block: usize,
}

impl Instruction {
    pub fn size(&self) -> usize {
        1 + self.arg.len()
    }

    pub fn next_addr(&self) -> usize {
        self.addr + self.size()
    }

    pub fn name(&self) -> String {
        self.op.name()
    }

    pub fn arg_value(&self) -> Option<U256> {
        self.op.is_push().then(|| be_bytes_to_u256(&self.arg))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arg.is_empty() {
            write!(f, "{:#06x} {}", self.addr, self.op)
        } else {
            write!(f, "{:#06x} {} 0x{}", self.addr, self.op, hex::encode(&self.arg))
        }
    }
}

/// Linear sweep. A PUSH whose immediate runs past the end of the code keeps the bytes
/// that are present.
pub fn disassemble(code: &[u8]) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let op = Opcode::from_byte(code[pc]);
        let end = (pc + 1 + op.immediate_len()).min(code.len());
        let arg = code[pc + 1..end].to_vec();
        out.push(Instruction {
            addr: pc,
            op,
            arg,
            block: 0,
        });
        pc = end;
    }
    out
}

/// Split a linear instruction stream into basic blocks. A block starts at address 0, at
/// every JUMPDEST, and after every instruction that ends a block.
pub fn split_blocks(instructions: Vec<Instruction>) -> Vec<Vec<Instruction>> {
    let mut blocks: Vec<Vec<Instruction>> = Vec::new();
    let mut current: Vec<Instruction> = Vec::new();
    for mut ins in instructions {
        if ins.op == Opcode::JumpDest && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        ins.block = current.first().map(|first| first.addr).unwrap_or(ins.addr);
        let ends = ins.op.ends_block();
        current.push(ins);
        if ends {
            blocks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_reads_push_immediates() {
        // PUSH2 0x1234 PUSH1 0x00 SSTORE
        let ins = disassemble(&[0x61, 0x12, 0x34, 0x60, 0x00, 0x55]);
        assert_eq!(ins.len(), 3);
        assert_eq!(ins[0].op, Opcode::Push(2));
        assert_eq!(ins[0].arg, vec![0x12, 0x34]);
        assert_eq!(ins[1].addr, 3);
        assert_eq!(ins[2].op, Opcode::SStore);
        assert_eq!(ins[0].arg_value(), Some(U256::from(0x1234)));
    }

    #[test]
    fn test_disassemble_truncated_push() {
        let ins = disassemble(&[0x63, 0xaa]);
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].arg, vec![0xaa]);
    }

    #[test]
    fn test_split_blocks_on_jumpdest_and_terminators() {
        // PUSH1 3 JUMP | JUMPDEST STOP | JUMPDEST STOP
        let blocks = split_blocks(disassemble(&[0x60, 0x03, 0x56, 0x5b, 0x00, 0x5b, 0x00]));
        let starts: Vec<usize> = blocks.iter().map(|b| b[0].addr).collect();
        assert_eq!(starts, vec![0, 3, 5]);
        assert!(blocks[1].iter().all(|i| i.block == 3));
    }
}
