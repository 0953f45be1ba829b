//! 发送准入
//!
//! 段离开写队列前必须同时通过三项检查：拥塞窗口、对端通告窗口、Nagle/cork 合并规则。
//! 任何一项不通过都只是“等状态变化再试”，不是错误。
//!
//! 检查本身是纯函数，连接级（多路径聚合）与子流级共用。

use crate::net::TcpFlags;

use super::segment::Segment;
use super::seq::after;
use super::sock::TcpSock;

/// 关闭 Nagle
pub const NAGLE_OFF: u8 = 1;
/// 应用要求攒满再发
pub const NAGLE_CORK: u8 = 2;
/// 本次强制推送
pub const NAGLE_PUSH: u8 = 4;

/// 拥塞窗口检查：返回本次还能发出的段数（0 表示不允许）。
///
/// 单独的 FIN 控制段总是放行。
pub fn cwnd_test(in_flight: u32, cwnd: u32, seg: &Segment) -> u32 {
    if seg.has(TcpFlags::FIN) && seg.is_empty() && seg.pcount <= 1 {
        return 1;
    }
    cwnd.saturating_sub(in_flight)
}

/// 通告窗口检查：段（超过 MSS 时只看前 MSS 字节）的结束位置不能越过 `wnd_end`。
///
/// `start`/`end` 是段在被检查的序列空间中的范围（路径序号或连接级数据序号）。
/// 连接的第一个字节（SYN）不受限制。
pub fn snd_wnd_test(seg: &Segment, start: u32, end: u32, wnd_end: u32, cur_mss: u32) -> bool {
    if seg.has(TcpFlags::SYN) {
        return true;
    }
    let end = if seg.len() > cur_mss {
        start.wrapping_add(cur_mss)
    } else {
        end
    };
    !after(end, wnd_end)
}

/// 是否还有未被确认的小段在途
pub fn minshall_check(snd_sml: u32, snd_una: u32, snd_nxt: u32) -> bool {
    after(snd_sml, snd_una) && !after(snd_sml, snd_nxt)
}

/// 满足时需要扣住这个不满 MSS 的段
pub fn nagle_check(seg_len: u32, mss_now: u32, nonagle: u8, small_outstanding: bool) -> bool {
    seg_len < mss_now && ((nonagle & NAGLE_CORK) != 0 || (nonagle == 0 && small_outstanding))
}

/// 合并检查；`forced` 表示紧急数据或恢复阶段要求立刻发送
pub fn nagle_test(seg: &Segment, mss_now: u32, nonagle: u8, forced: bool, small_outstanding: bool) -> bool {
    if nonagle & NAGLE_PUSH != 0 {
        return true;
    }
    if forced || seg.has(TcpFlags::FIN) {
        return true;
    }
    !nagle_check(seg.len(), mss_now, nonagle, small_outstanding)
}

/// 按当前 MSS 重新计算段的分段数
pub fn init_tso_segs(seg: &mut Segment, mss_now: u32, offload: bool) -> u32 {
    seg.set_tso_segs(mss_now, offload);
    seg.pcount
}

impl TcpSock {
    /// 本连接是否有不满 MSS 的段尚未确认
    pub fn small_outstanding(&self) -> bool {
        self.counters.packets_out != 0 && minshall_check(self.snd_sml, self.snd_una, self.snd_nxt)
    }

    pub fn nagle_forced(&self) -> bool {
        self.urg_mode || self.recovery_override
    }

    /// 三项检查一起做：返回允许的段数
    pub fn snd_test(&mut self, idx: usize, cur_mss: u32, nonagle: u8) -> u32 {
        let offload = self.can_gso();
        let forced = self.nagle_forced();
        let small = self.small_outstanding();
        let in_flight = self.in_flight();
        let cwnd = self.cong.cwnd;
        let wnd_end = self.wnd_end();
        let Some(seg) = self.queue.get_mut(idx) else {
            return 0;
        };
        init_tso_segs(seg, cur_mss, offload);
        if !nagle_test(seg, cur_mss, nonagle, forced, small) {
            return 0;
        }
        let quota = cwnd_test(in_flight, cwnd, seg);
        if quota != 0 && !snd_wnd_test(seg, seg.seq, seg.end_seq, wnd_end, cur_mss) {
            return 0;
        }
        quota
    }

    /// 发送队列头此刻是否能发出
    pub fn may_send_now(&mut self, cur_mss: u32) -> bool {
        let Some(idx) = self.queue.send_head() else {
            return false;
        };
        let nonagle = if self.queue.is_last(idx) {
            self.nonagle
        } else {
            NAGLE_PUSH
        };
        self.snd_test(idx, cur_mss, nonagle) != 0
    }
}
