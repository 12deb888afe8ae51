#![allow(dead_code)]

use std::collections::HashMap;

pub const STOP: u8 = 0x00;
pub const EQ: u8 = 0x14;
pub const SHR: u8 = 0x1c;
pub const CALLER: u8 = 0x33;
pub const CALLVALUE: u8 = 0x34;
pub const CALLDATALOAD: u8 = 0x35;
pub const RETURNDATASIZE: u8 = 0x3d;
pub const POP: u8 = 0x50;
pub const SSTORE: u8 = 0x55;
pub const JUMP: u8 = 0x56;
pub const JUMPI: u8 = 0x57;
pub const GAS: u8 = 0x5a;
pub const DUP1: u8 = 0x80;
pub const STATICCALL: u8 = 0xfa;
pub const REVERT: u8 = 0xfd;
pub const SELFDESTRUCT: u8 = 0xff;

/// Tiny assembler with PUSH2 label fixups.
#[derive(Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self
    }

    pub fn push1(&mut self, v: u8) -> &mut Self {
        self.code.extend_from_slice(&[0x60, v]);
        self
    }

    pub fn push4(&mut self, v: [u8; 4]) -> &mut Self {
        self.code.push(0x63);
        self.code.extend_from_slice(&v);
        self
    }

    /// PUSH2 of a label resolved in `finish`.
    pub fn push_label(&mut self, name: &str) -> &mut Self {
        self.code.push(0x61);
        self.fixups.push((self.code.len(), name.to_string()));
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    /// Bind `name` here and emit its JUMPDEST.
    pub fn label(&mut self, name: &str) -> &mut Self {
        self.labels.insert(name.to_string(), self.code.len());
        self.code.push(0x5b);
        self
    }

    pub fn addr_of(&self, name: &str) -> usize {
        self.labels[name]
    }

    pub fn revert(&mut self) -> &mut Self {
        self.push1(0).op(DUP1).op(REVERT)
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut code = self.code.clone();
        for (at, name) in &self.fixups {
            let target = self.labels[name] as u16;
            code[*at..*at + 2].copy_from_slice(&target.to_be_bytes());
        }
        code
    }
}

/// Dispatcher over `functions`; function `i` selfdestructs when the first argument
/// word equals its guard and reverts otherwise.
pub fn guarded_dispatcher(functions: &[([u8; 4], u8)]) -> Asm {
    let mut asm = Asm::new();
    asm.push1(0).op(CALLDATALOAD).push1(0xe0).op(SHR);
    for (i, (sel, _)) in functions.iter().enumerate() {
        asm.op(DUP1)
            .push4(*sel)
            .op(EQ)
            .push_label(&format!("fn{i}"))
            .op(JUMPI);
    }
    asm.revert();
    for (i, (_, guard)) in functions.iter().enumerate() {
        asm.label(&format!("fn{i}"))
            .push1(4)
            .op(CALLDATALOAD)
            .push1(*guard)
            .op(EQ)
            .push_label(&format!("ok{i}"))
            .op(JUMPI)
            .revert();
        asm.label(&format!("ok{i}")).op(CALLER).op(SELFDESTRUCT);
    }
    asm
}
