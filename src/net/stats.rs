//! 统计信息
//!
//! 发送引擎的 MIB 计数器，由出口网络持有、经 `NetApi::stats_mut` 累加。

use serde::Serialize;

#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    /// 交给出口成功的段
    pub out_segs: u64,
    pub out_bytes: u64,
    /// 重传段（含快速/慢启动/前向重传）
    pub retrans_segs: u64,
    pub fast_retrans: u64,
    pub slow_start_retrans: u64,
    pub forward_retrans: u64,
    pub out_rsts: u64,
    pub abort_failed: u64,
    pub active_opens: u64,
    /// 出口返回瞬时拥塞的次数
    pub egress_congested: u64,
    /// 出口返回路由失败的次数
    pub egress_unreachable: u64,
    pub mtu_probes: u64,
    /// 重注入队列中因已被数据确认而直接丢弃的段
    pub reinject_discards: u64,
    /// 调度轮内被标记为不可选的子流次数
    pub noneligible_marks: u64,
    /// 经对端模型成功交付/丢弃的帧
    pub delivered_frames: u64,
    pub dropped_frames: u64,
}
