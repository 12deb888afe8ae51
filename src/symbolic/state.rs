use crate::symbolic::utils::math::{val, zero};
use crate::symbolic::z3_ext::KeccakTheory;
use serde::{Deserialize, Serialize};
use z3::ast::{Array, Ast, Bool, BV};
use z3::{Context, Sort};

/// Operand stack of a symbolic run. Reads past the bottom do not panic: they
/// yield zero and latch `underflowed`, which the driver turns into a dead path.
pub struct SymbolicStack<'ctx> {
    ctx: &'ctx Context,
    words: Vec<BV<'ctx>>,
    underflowed: bool,
}

impl<'ctx> SymbolicStack<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            words: Vec::with_capacity(16),
            underflowed: false,
        }
    }

    pub fn push(&mut self, word: BV<'ctx>) {
        self.words.push(word);
    }

    pub fn pop(&mut self) -> BV<'ctx> {
        let word = self.words.pop();
        self.or_underflow(word)
    }

    /// Word `depth` slots below the top, without removing it.
    pub fn peek(&mut self, depth: usize) -> BV<'ctx> {
        let word = self
            .words
            .len()
            .checked_sub(depth + 1)
            .map(|idx| self.words[idx].clone());
        self.or_underflow(word)
    }

    /// SWAPn: exchange the top with the word `depth` slots below it.
    pub fn swap(&mut self, depth: usize) {
        match self.words.len().checked_sub(depth + 1) {
            Some(idx) => {
                let top = self.words.len() - 1;
                self.words.swap(top, idx);
            }
            None => self.underflowed = true,
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Reports and clears the underflow latch.
    pub fn take_underflowed(&mut self) -> bool {
        std::mem::take(&mut self.underflowed)
    }

    fn or_underflow(&mut self, word: Option<BV<'ctx>>) -> BV<'ctx> {
        word.unwrap_or_else(|| {
            self.underflowed = true;
            zero(self.ctx)
        })
    }
}

/// Outcome of an external call observed outside the analysis, keyed by the call site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub pc: usize,
    pub success: bool,
    #[serde(with = "hex::serde")]
    pub return_data: Vec<u8>,
}

/// Per-run inputs that are not part of the bytecode.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub xcall: Vec<CallRecord>,
    pub solver_timeout_ms: u32,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            xcall: Vec::new(),
            solver_timeout_ms: crate::utils::config::DEFAULT_SOLVER_TIMEOUT_MS,
        }
    }
}

impl ExecutionContext {
    pub fn record_for(&self, pc: usize) -> Option<&CallRecord> {
        self.xcall.iter().find(|r| r.pc == pc)
    }
}

pub struct SymbolicState<'ctx> {
    pub context: &'ctx Context,
    pub sym_stack: SymbolicStack<'ctx>,
    /// Byte-addressed: BV256 -> BV8.
    pub memory: Array<'ctx>,
    /// Word-addressed: BV256 -> BV256.
    pub storage: Array<'ctx>,
    /// Byte-addressed transaction input.
    pub calldata: Array<'ctx>,
    pub calldata_size: BV<'ctx>,
    pub constraints: Vec<Bool<'ctx>>,
    /// Executed instruction addresses, in order.
    pub trace: Vec<usize>,
    pub keccak: KeccakTheory<'ctx>,
    /// Return data of the most recent call, when an observed record supplied it.
    pub return_data: Option<Vec<u8>>,
    /// Call sites executed along the run.
    pub calls: Vec<usize>,
    pub storage_writes: Vec<(BV<'ctx>, BV<'ctx>)>,
    fresh_counter: usize,
}

impl<'ctx> SymbolicState<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        let word = Sort::bitvector(ctx, 256);
        let byte = Sort::bitvector(ctx, 8);
        Self {
            context: ctx,
            sym_stack: SymbolicStack::new(ctx),
            memory: Array::const_array(ctx, &word, &BV::from_u64(ctx, 0, 8)),
            storage: Array::new_const(ctx, "storage", &word, &word),
            calldata: Array::new_const(ctx, "calldata", &word, &byte),
            calldata_size: BV::new_const(ctx, "calldatasize", 256),
            constraints: Vec::new(),
            trace: Vec::new(),
            keccak: KeccakTheory::new(ctx),
            return_data: None,
            calls: Vec::new(),
            storage_writes: Vec::new(),
            fresh_counter: 0,
        }
    }

    /// A variable that stays shared across the run (CALLER, TIMESTAMP, ...).
    pub fn named_word(&self, name: &str) -> BV<'ctx> {
        BV::new_const(self.context, name, 256)
    }

    /// A 160-bit account variable, zero-extended to a word.
    pub fn named_address(&self, name: &str) -> BV<'ctx> {
        BV::new_const(self.context, name, 160).zero_ext(96)
    }

    /// A variable unique to this occurrence.
    pub fn fresh_word(&mut self, prefix: &str) -> BV<'ctx> {
        self.fresh_counter += 1;
        BV::new_const(
            self.context,
            format!("{}_{}", prefix, self.fresh_counter),
            256,
        )
    }

    pub fn fresh_byte(&mut self, prefix: &str) -> BV<'ctx> {
        self.fresh_counter += 1;
        BV::new_const(self.context, format!("{}_{}", prefix, self.fresh_counter), 8)
    }

    pub fn assume(&mut self, constraint: Bool<'ctx>) {
        self.constraints.push(constraint);
    }

    pub fn read_byte(&self, offset: &BV<'ctx>) -> BV<'ctx> {
        self.memory
            .select(offset)
            .as_bv()
            .unwrap_or_else(|| BV::from_u64(self.context, 0, 8))
    }

    pub fn read_word(&self, offset: &BV<'ctx>) -> BV<'ctx> {
        let mut word = self.read_byte(offset);
        for i in 1..32u64 {
            let idx = offset.bvadd(&val(self.context, i));
            word = word.concat(&self.read_byte(&idx));
        }
        word
    }

    pub fn write_word(&mut self, offset: &BV<'ctx>, value: &BV<'ctx>) {
        for i in 0..32u32 {
            let idx = offset.bvadd(&val(self.context, i as u64));
            let hi = 255 - i * 8;
            let byte = value.extract(hi, hi - 7);
            self.memory = self.memory.store(&idx, &byte);
        }
    }

    pub fn write_byte(&mut self, offset: &BV<'ctx>, value: &BV<'ctx>) {
        let byte = if value.get_size() == 8 {
            value.clone()
        } else {
            value.extract(7, 0)
        };
        self.memory = self.memory.store(offset, &byte);
    }

    /// Calldata byte, zero past the end of the input.
    pub fn calldata_byte(&self, offset: &BV<'ctx>) -> BV<'ctx> {
        let raw = self
            .calldata
            .select(offset)
            .as_bv()
            .unwrap_or_else(|| BV::from_u64(self.context, 0, 8));
        offset
            .bvult(&self.calldata_size)
            .ite(&raw, &BV::from_u64(self.context, 0, 8))
    }

    pub fn calldata_word(&self, offset: &BV<'ctx>) -> BV<'ctx> {
        let mut word = self.calldata_byte(offset);
        for i in 1..32u64 {
            let idx = offset.bvadd(&val(self.context, i));
            word = word.concat(&self.calldata_byte(&idx));
        }
        word
    }

    pub fn sload(&self, key: &BV<'ctx>) -> BV<'ctx> {
        self.storage
            .select(key)
            .as_bv()
            .unwrap_or_else(|| zero(self.context))
    }

    pub fn sstore(&mut self, key: &BV<'ctx>, value: &BV<'ctx>) {
        self.storage = self.storage.store(key, value);
        self.storage_writes.push((key.clone(), value.clone()));
    }
}
