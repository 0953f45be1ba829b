//! 写队列
//!
//! 按序列号首尾相接的段队列：队首部分已发送未确认，`send_head` 起为未发送。
//! 同时维护重传提示（任何拼接都会使其失效）与发送缓冲内存配额。

use std::collections::VecDeque;

use super::segment::{SEG_OVERHEAD, Segment};

/// 重传遍历的缓存位置（队列下标）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetransHints {
    /// 下一次重传遍历的起点
    pub retransmit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct WriteQueue {
    segs: VecDeque<Segment>,
    send_head: Option<usize>,
    pub hints: RetransHints,
    wmem_queued: usize,
    sndbuf: usize,
    shrunk: bool,
}

impl WriteQueue {
    pub fn new(sndbuf: usize) -> Self {
        Self {
            sndbuf,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Segment> {
        self.segs.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Segment> {
        self.segs.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segs.iter()
    }

    pub fn front(&self) -> Option<&Segment> {
        self.segs.front()
    }

    pub fn back(&self) -> Option<&Segment> {
        self.segs.back()
    }

    pub fn back_mut(&mut self) -> Option<&mut Segment> {
        self.segs.back_mut()
    }

    /// 第一个未发送段的下标
    pub fn send_head(&self) -> Option<usize> {
        self.send_head
    }

    pub fn send_head_seg(&self) -> Option<&Segment> {
        self.send_head.and_then(|i| self.segs.get(i))
    }

    pub fn set_send_head(&mut self, idx: Option<usize>) {
        debug_assert!(idx.is_none_or(|i| i < self.segs.len()));
        self.send_head = idx;
    }

    /// send_head 指向的段已发出
    pub fn advance_send_head(&mut self) {
        self.send_head = match self.send_head {
            Some(i) if i + 1 < self.segs.len() => Some(i + 1),
            _ => None,
        };
    }

    /// 已发送、未确认的段数
    pub fn sent_len(&self) -> usize {
        self.send_head.unwrap_or(self.segs.len())
    }

    pub fn is_last(&self, idx: usize) -> bool {
        idx + 1 == self.segs.len()
    }

    pub fn wmem_queued(&self) -> usize {
        self.wmem_queued
    }

    pub fn sndbuf(&self) -> usize {
        self.sndbuf
    }

    /// 应用写入 `bytes` 后是否仍在配额内
    pub fn has_room(&self, bytes: usize) -> bool {
        self.wmem_queued + bytes <= self.sndbuf
    }

    /// 内部拆分/控制段还能否再分配一个段（允许超出发送缓冲一倍）
    pub fn can_alloc(&self) -> bool {
        self.wmem_queued + SEG_OVERHEAD <= self.sndbuf.saturating_mul(2)
    }

    pub fn charge(&mut self, bytes: usize) {
        self.wmem_queued += bytes;
    }

    pub fn uncharge(&mut self, bytes: usize) {
        self.wmem_queued = self.wmem_queued.saturating_sub(bytes);
        self.shrunk = true;
    }

    /// 自上次查询以来是否释放过内存（用于唤醒阻塞的写入者）
    pub fn take_shrunk(&mut self) -> bool {
        std::mem::take(&mut self.shrunk)
    }

    pub fn clear_hints(&mut self) {
        self.hints = RetransHints::default();
    }

    /// 入队到尾部；若此前没有未发送段，它成为 send_head。
    pub fn push_tail(&mut self, seg: Segment) -> usize {
        if let Some(tail) = self.segs.back() {
            assert_eq!(
                tail.end_seq, seg.seq,
                "write queue must stay sequence-contiguous"
            );
        }
        self.wmem_queued += seg.truesize();
        self.segs.push_back(seg);
        let idx = self.segs.len() - 1;
        if self.send_head.is_none() {
            self.send_head = Some(idx);
        }
        idx
    }

    /// 在 `idx` 之后插入（拆分产生的后半段）
    pub fn insert_after(&mut self, idx: usize, seg: Segment) {
        self.clear_hints();
        self.wmem_queued += seg.truesize();
        self.segs.insert(idx + 1, seg);
        if let Some(sh) = self.send_head
            && sh > idx
        {
            self.send_head = Some(sh + 1);
        }
    }

    /// 在 `idx` 之前插入；send_head 随原段后移
    pub fn insert_before(&mut self, idx: usize, seg: Segment) {
        self.clear_hints();
        self.wmem_queued += seg.truesize();
        self.segs.insert(idx, seg);
        if let Some(sh) = self.send_head
            && sh >= idx
        {
            self.send_head = Some(sh + 1);
        }
    }

    /// 从队列中摘除并释放配额
    pub fn remove(&mut self, idx: usize) -> Option<Segment> {
        let seg = self.segs.remove(idx)?;
        self.clear_hints();
        self.uncharge(seg.truesize());
        self.send_head = match self.send_head {
            Some(sh) if sh > idx => Some(sh - 1),
            Some(sh) if sh == idx && idx < self.segs.len() => Some(sh),
            Some(sh) if sh == idx => None,
            other => other,
        };
        Some(seg)
    }

    /// 丢弃队首（已被完全确认）
    pub fn pop_front(&mut self) -> Option<Segment> {
        self.remove(0)
    }

    /// 就地修改某段并按前后 truesize 差额调整配额
    pub fn modify<R>(&mut self, idx: usize, f: impl FnOnce(&mut Segment) -> R) -> Option<R> {
        let seg = self.segs.get_mut(idx)?;
        let before = seg.truesize();
        let out = f(seg);
        let after = seg.truesize();
        if after >= before {
            self.wmem_queued += after - before;
        } else {
            self.uncharge(before - after);
        }
        Some(out)
    }

    /// 丢弃全部段（连接关闭/中止）
    pub fn purge(&mut self) {
        self.segs.clear();
        self.send_head = None;
        self.clear_hints();
        self.wmem_queued = 0;
        self.shrunk = true;
    }
}
