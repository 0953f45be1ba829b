//! 段（发送缓冲模型）
//!
//! 一个段是一段可寻址、可拆分、可合并、可共享的出站字节，附带：
//! - 路径序列范围 `[seq, end_seq)`
//! - 多路径下的连接级数据序列范围 `[data_seq, end_data_seq)` 与路径映射 `sub_seq`
//! - 控制位、SACK/重传标记、TSO 分段数
//!
//! 载荷以 `Arc<Vec<u8>>` 持有：克隆只增加引用计数，任何修改都走写时复制，
//! 因而两个持有者看到的是互相独立的副本而不是别名。

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::net::TcpFlags;
use crate::sim::SimTime;

/// 每个段在内存配额里的固定开销（字节）
pub const SEG_OVERHEAD: usize = 256;

/// SACK / 重传标记
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sacked(u8);

impl Sacked {
    /// 已被选择确认
    pub const SACKED_ACKED: Sacked = Sacked(0x01);
    /// 已重传且尚未确认
    pub const SACKED_RETRANS: Sacked = Sacked(0x02);
    /// 被判定丢失
    pub const LOST: Sacked = Sacked(0x04);
    /// 曾经重传过
    pub const EVER_RETRANS: Sacked = Sacked(0x80);
    pub const TAGBITS: Sacked = Sacked(0x07);
    pub const RETRANS: Sacked = Sacked(0x82);

    pub const fn empty() -> Sacked {
        Sacked(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Sacked) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Sacked) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Sacked) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Sacked) {
        self.0 &= !other.0;
    }

    pub const fn masked(self, mask: Sacked) -> Sacked {
        Sacked(self.0 & mask.0)
    }
}

impl BitOr for Sacked {
    type Output = Sacked;
    fn bitor(self, rhs: Sacked) -> Sacked {
        Sacked(self.0 | rhs.0)
    }
}

impl fmt::Debug for Sacked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sacked({:#04x})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub seq: u32,
    pub end_seq: u32,
    pub data_seq: u32,
    pub end_data_seq: u32,
    /// 该段数据在路径字节流中的起点
    pub sub_seq: u32,
    /// 携带连接级数据序列映射
    pub mapped: bool,
    pub flags: TcpFlags,
    pub sacked: Sacked,
    /// 最近一次发送时间
    pub when: SimTime,
    /// 重传时的 snd_nxt，用于检测重传段再次丢失
    pub ack_seq: u32,
    /// 拥塞计数意义下的分段数
    pub pcount: u32,
    /// 分段卸载时每段大小（0 表示不卸载）
    pub gso_size: u32,
    /// 已经承载过该数据的路径位图
    pub path_mask: u8,
    payload: Arc<Vec<u8>>,
}

impl Segment {
    /// 数据段；`flags` 中的 SYN/FIN 各占一个序列号
    pub fn new(seq: u32, payload: Vec<u8>, flags: TcpFlags) -> Self {
        let len = payload.len() as u32;
        let end_seq = seq
            .wrapping_add(len)
            .wrapping_add(Self::control_len(flags));
        Self {
            seq,
            end_seq,
            data_seq: seq,
            end_data_seq: end_seq,
            sub_seq: seq,
            mapped: false,
            flags,
            sacked: Sacked::empty(),
            when: SimTime::ZERO,
            ack_seq: 0,
            pcount: 1,
            gso_size: 0,
            path_mask: 0,
            payload: Arc::new(payload),
        }
    }

    /// 不带载荷的控制段（SYN / FIN / ACK / RST）
    pub fn control(seq: u32, flags: TcpFlags) -> Self {
        Self::new(seq, Vec::new(), flags)
    }

    /// 附加连接级数据序列映射
    pub fn with_mapping(mut self, data_seq: u32) -> Self {
        self.data_seq = data_seq;
        self.end_data_seq = data_seq
            .wrapping_add(self.len())
            .wrapping_add(Self::control_len(self.flags.without(TcpFlags::SYN)));
        self.mapped = true;
        self
    }

    fn control_len(flags: TcpFlags) -> u32 {
        u32::from(flags.contains(TcpFlags::SYN)) + u32::from(flags.contains(TcpFlags::FIN))
    }

    /// 重新映射到某条路径的序列空间（数据序号不变）。
    ///
    /// 与 `clone()` 配合得到一份共享载荷的副本；直接对原段调用则是搬移。
    pub fn remap(mut self, sub_seq: u32) -> Segment {
        let span = self.end_seq.wrapping_sub(self.seq);
        self.seq = sub_seq;
        self.end_seq = sub_seq.wrapping_add(span);
        self.sub_seq = sub_seq;
        self.mapped = true;
        self.sacked = Sacked::empty();
        self.when = SimTime::ZERO;
        self
    }

    /// 从路径序列空间映射回连接级数据序列空间（重注入用）
    pub fn to_data_space(&self) -> Segment {
        let mut seg = self.clone();
        seg.seq = self.data_seq;
        seg.end_seq = self.end_data_seq;
        seg.sacked = Sacked::empty();
        seg
    }

    /// 追加到未发送的尾段
    pub fn extend(&mut self, bytes: &[u8]) {
        debug_assert!(!self.has(TcpFlags::FIN));
        Arc::make_mut(&mut self.payload).extend_from_slice(bytes);
        let n = bytes.len() as u32;
        self.end_seq = self.end_seq.wrapping_add(n);
        self.end_data_seq = self.end_data_seq.wrapping_add(n);
    }

    /// 载荷字节数
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 是否与另一个持有者共享载荷
    pub fn is_cloned(&self) -> bool {
        Arc::strong_count(&self.payload) > 1
    }

    /// 内存配额意义下的大小
    pub fn truesize(&self) -> usize {
        self.payload.len() + SEG_OVERHEAD
    }

    pub fn has(&self, flags: TcpFlags) -> bool {
        self.flags.contains(flags)
    }

    /// 按当前 MSS 计算分段数
    pub fn set_tso_segs(&mut self, mss_now: u32, offload: bool) {
        let len = self.len();
        if len <= mss_now || !offload || mss_now == 0 {
            self.pcount = 1;
            self.gso_size = 0;
        } else {
            self.pcount = len.div_ceil(mss_now);
            self.gso_size = mss_now;
        }
    }

    /// 在载荷偏移 `at` 处拆开，返回后半段。
    ///
    /// 两半在路径序列与数据序列上都首尾相接；FIN/PSH 只留在后半段；
    /// 标记与发送时间原样复制。
    pub fn split_off(&mut self, at: u32, mss_now: u32, offload: bool) -> Segment {
        assert!(at <= self.len(), "split offset {at} beyond payload {}", self.len());
        let tail_bytes = Arc::make_mut(&mut self.payload).split_off(at as usize);

        let mut tail = Segment {
            seq: self.seq.wrapping_add(at),
            end_seq: self.end_seq,
            data_seq: self.data_seq.wrapping_add(at),
            end_data_seq: self.end_data_seq,
            sub_seq: self.sub_seq.wrapping_add(at),
            mapped: self.mapped,
            flags: self.flags,
            sacked: self.sacked,
            when: self.when,
            ack_seq: self.ack_seq,
            pcount: 1,
            gso_size: 0,
            path_mask: self.path_mask,
            payload: Arc::new(tail_bytes),
        };
        self.end_seq = tail.seq;
        self.end_data_seq = tail.data_seq;
        self.flags.remove(TcpFlags::FIN | TcpFlags::PSH);

        self.set_tso_segs(mss_now, offload);
        tail.set_tso_segs(mss_now, offload);
        tail
    }

    /// 把紧随其后的 `next` 并入本段。
    ///
    /// 两者任一被选择确认或被共享、或者序列不相接时拒绝，原样退回 `next`。
    pub fn try_merge(&mut self, next: Segment, mss_now: u32, offload: bool) -> Result<(), Segment> {
        if self.end_seq != next.seq
            || self.sacked.contains(Sacked::SACKED_ACKED)
            || next.sacked.contains(Sacked::SACKED_ACKED)
            || self.is_cloned()
            || next.is_cloned()
        {
            return Err(next);
        }
        Arc::make_mut(&mut self.payload).extend_from_slice(&next.payload);
        self.end_seq = next.end_seq;
        self.end_data_seq = next.end_data_seq;
        self.flags |= next.flags;
        self.sacked.insert(next.sacked.masked(Sacked::EVER_RETRANS));
        self.set_tso_segs(mss_now, offload);
        Ok(())
    }

    /// 丢弃前 `n` 个已确认字节
    pub fn trim_front(&mut self, n: u32, mss_now: u32, offload: bool) {
        let n = n.min(self.len());
        Arc::make_mut(&mut self.payload).drain(..n as usize);
        self.seq = self.seq.wrapping_add(n);
        self.data_seq = self.data_seq.wrapping_add(n);
        self.sub_seq = self.sub_seq.wrapping_add(n);
        self.set_tso_segs(mss_now, offload);
    }

    /// 去掉全部载荷，只剩 FIN（重传时对端只剩 FIN 未确认）
    pub fn strip_to_fin(&mut self) {
        debug_assert!(self.has(TcpFlags::FIN));
        self.payload = Arc::new(Vec::new());
        self.seq = self.end_seq.wrapping_sub(1);
        self.data_seq = self.end_data_seq.wrapping_sub(1);
        self.sub_seq = self.seq;
        self.pcount = 1;
        self.gso_size = 0;
    }
}
