//! 32 位序列号比较（模 2^32）

/// `a` 在 `b` 之前
#[inline]
pub fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` 在 `b` 之后
#[inline]
pub fn after(a: u32, b: u32) -> bool {
    before(b, a)
}

/// `low <= seq <= high`（序列空间意义下）
#[inline]
pub fn between(seq: u32, low: u32, high: u32) -> bool {
    high.wrapping_sub(low) >= seq.wrapping_sub(low)
}

/// 两个序列号中较早的一个
#[inline]
pub fn seq_min(a: u32, b: u32) -> u32 {
    if before(a, b) { a } else { b }
}
