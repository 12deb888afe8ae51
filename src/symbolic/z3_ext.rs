use alloy::primitives::U256;
use std::cell::RefCell;
use std::collections::HashMap;
use z3::{
    ast::{Ast, BV},
    Context, FuncDecl, Sort,
};

/// The concrete value of `bv` after simplification, or `None` while it still
/// mentions a free symbol.
pub fn u256_from_bv(bv: &BV) -> Option<U256> {
    let folded = bv.simplify();
    match folded.as_u64() {
        Some(small) => Some(U256::from(small)),
        None => crate::utils::hex::to_u256(&folded.to_string()),
    }
}

pub fn bv_from_u256<'ctx>(ctx: &'ctx Context, val: U256) -> BV<'ctx> {
    // Big-endian packing of four 64-bit limbs; no string parsing involved.
    let bytes = val.to_be_bytes::<32>();
    let mut limbs = bytes.chunks_exact(8).map(|chunk| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        BV::from_u64(ctx, u64::from_be_bytes(buf), 64)
    });
    let mut bv = match limbs.next() {
        Some(first) => first,
        None => return BV::from_u64(ctx, 0, 256),
    };
    for limb in limbs {
        bv = bv.concat(&limb);
    }
    bv
}

/// Concrete value of a bitvector that must fit a host index (offsets, lengths, jump targets).
pub fn usize_from_bv(bv: &BV) -> Option<usize> {
    u256_from_bv(bv).and_then(|v| usize::try_from(v).ok())
}

pub fn configure_solver(ctx: &Context, solver: &z3::Solver, timeout_ms: u32) {
    let mut params = z3::Params::new(ctx);
    params.set_u32("timeout", timeout_ms);
    params.set_bool("model.partial", true);
    params.set_u32("random_seed", 42);
    solver.set_params(&params);
}

/// Keccak-256 as uninterpreted functions, one per input word count.
///
/// Hashing equal inputs of equal length yields the same term, which is all the path
/// constraints need (mapping slot equalities). Inputs whose length is not a multiple
/// of 32 are hashed through a single-argument function over the packed bytes.
pub struct KeccakTheory<'ctx> {
    ctx: &'ctx Context,
    word_decls: RefCell<HashMap<usize, FuncDecl<'ctx>>>,
    byte_decls: RefCell<HashMap<u32, FuncDecl<'ctx>>>,
}

impl<'ctx> KeccakTheory<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            word_decls: RefCell::new(HashMap::new()),
            byte_decls: RefCell::new(HashMap::new()),
        }
    }

    pub fn apply_words(&self, words: &[BV<'ctx>]) -> Option<BV<'ctx>> {
        let mut decls = self.word_decls.borrow_mut();
        let decl = decls.entry(words.len()).or_insert_with(|| {
            let word = Sort::bitvector(self.ctx, 256);
            let domain: Vec<&Sort> = std::iter::repeat(&word).take(words.len()).collect();
            FuncDecl::new(
                self.ctx,
                format!("keccak_{}", words.len() * 32),
                &domain,
                &Sort::bitvector(self.ctx, 256),
            )
        });
        let args: Vec<&dyn Ast<'ctx>> = words.iter().map(|w| w as &dyn Ast<'ctx>).collect();
        decl.apply(&args).as_bv()
    }

    pub fn apply_bytes(&self, packed: &BV<'ctx>) -> Option<BV<'ctx>> {
        let width = packed.get_size();
        let mut decls = self.byte_decls.borrow_mut();
        let decl = decls.entry(width).or_insert_with(|| {
            FuncDecl::new(
                self.ctx,
                format!("keccak_bytes_{}", width / 8),
                &[&Sort::bitvector(self.ctx, width)],
                &Sort::bitvector(self.ctx, 256),
            )
        });
        decl.apply(&[packed as &dyn Ast<'ctx>]).as_bv()
    }
}
