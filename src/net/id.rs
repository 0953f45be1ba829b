//! 标识符类型
//!
//! 连接与路径（子流）的标识。

use serde::Serialize;

/// 连接标识（单路径连接或多路径聚合连接）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnId(pub u64);

/// 路径索引，从 1 开始；最多 8 条路径，每条对应 `path_mask` 中的一位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PathIndex(pub u8);

impl PathIndex {
    /// 单路径连接、以及多路径连接的第一条子流
    pub const MASTER: PathIndex = PathIndex(1);
    pub const MAX: u8 = 8;

    pub fn new(idx: u8) -> Option<PathIndex> {
        (1..=Self::MAX).contains(&idx).then_some(PathIndex(idx))
    }

    /// 该路径在 `path_mask` / `noneligible` 位图中的位
    pub fn flag(self) -> u8 {
        debug_assert!((1..=Self::MAX).contains(&self.0));
        1u8 << (self.0 - 1)
    }
}
