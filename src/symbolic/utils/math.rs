//! Shared bitvector helpers for the opcode handlers.

use z3::ast::{Ast, BV};

/// Applies `op` unless the divisor is zero, in which case the EVM result is zero.
/// Works at any width so MULMOD/ADDMOD can reuse it on 512-bit operands.
fn zero_guarded<'ctx>(
    a: &BV<'ctx>,
    b: &BV<'ctx>,
    op: impl FnOnce(&BV<'ctx>, &BV<'ctx>) -> BV<'ctx>,
) -> BV<'ctx> {
    let nil = BV::from_u64(b.get_ctx(), 0, b.get_size());
    b._eq(&nil).ite(&nil, &op(a, b))
}

pub fn safe_div<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guarded(a, b, |a, b| a.bvudiv(b))
}

pub fn safe_rem<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guarded(a, b, |a, b| a.bvurem(b))
}

pub fn safe_sdiv<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guarded(a, b, |a, b| a.bvsdiv(b))
}

/// SMOD: the result carries the sign of the dividend, which is `bvsrem`.
pub fn safe_srem<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guarded(a, b, |a, b| a.bvsrem(b))
}

pub fn widen<'ctx>(word: &BV<'ctx>) -> BV<'ctx> {
    word.zero_ext(256)
}

/// A 256-bit word constant.
pub fn val<'ctx>(ctx: &'ctx z3::Context, v: u64) -> BV<'ctx> {
    BV::from_u64(ctx, v, 256)
}

pub fn zero<'ctx>(ctx: &'ctx z3::Context) -> BV<'ctx> {
    val(ctx, 0)
}

pub fn one<'ctx>(ctx: &'ctx z3::Context) -> BV<'ctx> {
    val(ctx, 1)
}

/// Keep the low 160 bits, zero the high 96 bits.
pub fn clean_address_word<'ctx>(addr: &BV<'ctx>) -> BV<'ctx> {
    addr.extract(159, 0).zero_ext(96)
}

/// EXP. A concrete exponent unrolls into its actual multiplications; otherwise
/// every exponent bit selects a factor.
pub fn symbolic_exp<'ctx>(ctx: &'ctx z3::Context, base: &BV<'ctx>, exponent: &BV<'ctx>) -> BV<'ctx> {
    let known = crate::symbolic::z3_ext::u256_from_bv(exponent).and_then(|v| u64::try_from(v).ok());
    if let Some(mut remaining) = known {
        let mut acc = one(ctx);
        let mut square = base.clone();
        while remaining != 0 {
            if remaining & 1 == 1 {
                acc = acc.bvmul(&square);
            }
            remaining >>= 1;
            if remaining != 0 {
                square = square.bvmul(&square);
            }
        }
        return acc;
    }

    let mut result = one(ctx);
    let mut current = base.clone();
    let bit_one = BV::from_u64(ctx, 1, 1);
    for i in 0..256u32 {
        let is_set = exponent.extract(i, i)._eq(&bit_one);
        result = is_set.ite(&result.bvmul(&current), &result);
        if i < 255 {
            current = current.bvmul(&current);
        }
    }
    result
}

/// SIGNEXTEND: byte index `b` selects which low byte carries the sign.
pub fn symbolic_signextend<'ctx>(ctx: &'ctx z3::Context, b: &BV<'ctx>, x: &BV<'ctx>) -> BV<'ctx> {
    let mut result = x.clone();
    for i in 0..31u32 {
        let low_bits = (i + 1) * 8;
        let low_part = x.extract(low_bits - 1, 0);
        let extended = low_part.sign_ext(256 - low_bits);
        result = b._eq(&val(ctx, i as u64)).ite(&extended, &result);
    }
    result
}

/// BYTE: big-endian byte `i` of `value`, zero past index 31.
pub fn symbolic_byte<'ctx>(ctx: &'ctx z3::Context, i: &BV<'ctx>, value: &BV<'ctx>) -> BV<'ctx> {
    let out_of_bounds = i.bvuge(&val(ctx, 32));
    let shift = val(ctx, 31).bvsub(i).bvmul(&val(ctx, 8));
    let calculated = value.bvlshr(&shift).bvand(&val(ctx, 0xff));
    out_of_bounds.ite(&zero(ctx), &calculated)
}
