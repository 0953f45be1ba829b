//! 分片与合并
//!
//! 写队列上的就地拆分/合并。对已发送部分做拆分时按分段数差额修正在途计数；
//! 合并只用于重传时把相邻小段并成一个。这些函数只依赖队列与计数，连接级队列也能用。

use tracing::{debug, trace};

use crate::error::XmitError;
use crate::net::TcpFlags;

use super::segment::{Sacked, Segment};
use super::seq::{after, before};
use super::sock::{Counters, adjust};
use super::write_queue::WriteQueue;

/// 在载荷偏移 `len` 处拆分第 `idx` 段，后半段插在其后并继承标记。
///
/// `len` 等于载荷长度时只对带 FIN 的段有效：FIN 单独落到一个空的后半段。
/// 若该段已发送（`snd_nxt` 不早于后半段结束），按拆分前后的分段数差额修正计数。
pub fn fragment(
    q: &mut WriteQueue,
    c: &mut Counters,
    snd_nxt: u32,
    idx: usize,
    len: u32,
    mss_now: u32,
    offload: bool,
) -> Result<(), XmitError> {
    let Some(seg) = q.get(idx) else {
        return Ok(());
    };
    if len > seg.len() || (len == seg.len() && !seg.has(TcpFlags::FIN)) {
        return Ok(());
    }
    if !q.can_alloc() {
        return Err(XmitError::NoMemory);
    }
    let old_factor = i64::from(seg.pcount);

    let Some(tail) = q.modify(idx, |s| s.split_off(len, mss_now, offload)) else {
        return Ok(());
    };
    let Some(head) = q.get(idx) else {
        return Ok(());
    };
    trace!(seq = head.seq, head_len = head.len(), tail_len = tail.len(), "拆分段");

    if !before(snd_nxt, tail.end_seq) {
        let diff = old_factor - i64::from(head.pcount) - i64::from(tail.pcount);
        if diff != 0 {
            let sacked = head.sacked;
            adjust(&mut c.packets_out, diff);
            if sacked.contains(Sacked::SACKED_ACKED) {
                adjust(&mut c.sacked_out, diff);
            }
            if sacked.contains(Sacked::SACKED_RETRANS) {
                adjust(&mut c.retrans_out, diff);
            }
            if sacked.contains(Sacked::LOST) {
                adjust(&mut c.lost_out, diff);
            }
        }
    }
    q.insert_after(idx, tail);
    Ok(())
}

/// 若段超过 `limit` 字节，拆到 `limit`；否则什么也不做
pub fn fragment_to_limit(
    q: &mut WriteQueue,
    c: &mut Counters,
    snd_nxt: u32,
    idx: usize,
    limit: u32,
    mss_now: u32,
    offload: bool,
) -> Result<(), XmitError> {
    match q.get(idx) {
        Some(seg) if seg.len() > limit => fragment(q, c, snd_nxt, idx, limit, mss_now, offload),
        _ => Ok(()),
    }
}

/// 拆分尚未发送的段；后半段不继承 SACK 标记，也不涉及在途计数
pub fn tso_fragment(
    q: &mut WriteQueue,
    idx: usize,
    len: u32,
    mss_now: u32,
    offload: bool,
) -> Result<(), XmitError> {
    match q.get(idx) {
        Some(seg) if len < seg.len() => {}
        _ => return Ok(()),
    }
    if !q.can_alloc() {
        return Err(XmitError::NoMemory);
    }
    let Some(mut tail) = q.modify(idx, |s| s.split_off(len, mss_now, offload)) else {
        return Ok(());
    };
    tail.sacked = Sacked::empty();
    q.insert_after(idx, tail);
    Ok(())
}

/// 丢弃段前部 `len` 个已确认字节；返回分段数减少量（按新 MSS 重算后可能为负）
pub fn trim_head(q: &mut WriteQueue, idx: usize, len: u32, mss_now: u32, offload: bool) -> i64 {
    q.modify(idx, |s| {
        let old = i64::from(s.pcount);
        s.trim_front(len, mss_now, offload);
        old - i64::from(s.pcount)
    })
    .unwrap_or(0)
}

/// 重传时尝试把 `idx` 之后的段并进来。
///
/// 任一方被共享、后一段已被选择确认、后一段越出窗口（`wnd_end`，多路径时比较数据序号）、
/// 或合并后超过 `mss_now` 时放弃。
pub fn try_collapse(
    q: &mut WriteQueue,
    c: &mut Counters,
    idx: usize,
    wnd_end: u32,
    data_space: bool,
    mss_now: u32,
    offload: bool,
) -> bool {
    let (Some(seg), Some(next)) = (q.get(idx), q.get(idx + 1)) else {
        return false;
    };
    if seg.is_cloned() || next.is_cloned() {
        return false;
    }
    if next.sacked.contains(Sacked::SACKED_ACKED) {
        return false;
    }
    let next_end = if data_space {
        next.end_data_seq
    } else {
        next.end_seq
    };
    if after(next_end, wnd_end) {
        return false;
    }
    if seg.len() + next.len() > mss_now {
        return false;
    }

    let Some(next) = q.remove(idx + 1) else {
        return false;
    };
    let (pcount, sacked) = (next.pcount, next.sacked);
    let merged: Result<(), Segment> = match q.modify(idx, |s| s.try_merge(next, mss_now, offload)) {
        Some(r) => r,
        None => return false,
    };
    if let Err(next) = merged {
        q.insert_after(idx, next);
        return false;
    }

    if sacked.contains(Sacked::SACKED_RETRANS) {
        c.retrans_out = c.retrans_out.saturating_sub(pcount);
    }
    if sacked.contains(Sacked::LOST) {
        c.lost_out = c.lost_out.saturating_sub(pcount);
    }
    c.packets_out = c.packets_out.saturating_sub(pcount);
    q.hints.retransmit = Some(idx);
    debug!(idx, "重传时合并相邻小段");
    true
}
