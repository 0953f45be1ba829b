//! 多路径聚合连接
//!
//! 持有连接级写队列（数据序号空间）、重注入队列和按路径索引的子流集合。
//! 子流不回指聚合连接：发送前由聚合连接把数据确认、窗口右沿、data FIN 位置等
//! 写进每个子流的 [`MpContext`]。

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::XmitConfig;
use crate::error::XmitError;
use crate::net::{ConnId, NetApi, PathIndex, TcpFlags};
use crate::proto::{
    AckOutcome, AckSignal, AddrAdvert, MpContext, NAGLE_OFF, SEG_OVERHEAD, Segment, TcpSock,
    TcpState, TimerKind, WriteQueue, after, before,
};
use crate::sim::Simulator;

use super::scheduler::Scheduler;

/// 由令牌派生初始数据序号（两端各自算出同一个值）
pub fn idsn_for_token(token: u32) -> u32 {
    token.rotate_left(13) ^ 0x5bd1_e995
}

#[derive(Debug)]
pub struct MetaSock {
    pub id: ConnId,
    pub cfg: Arc<XmitConfig>,
    pub state: TcpState,
    pub local_token: u32,
    pub remote_token: u32,

    /// 初始数据序号
    pub idsn: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub write_seq: u32,
    pub pushed_seq: u32,
    pub snd_sml: u32,
    pub snd_wnd: u32,
    /// 回送给对端的连接级累计确认
    pub rcv_nxt: u32,

    /// 连接级写队列：send_head 之前是已分配给某条子流、尚未被数据确认的段
    pub queue: WriteQueue,
    /// 曾在某条子流上发出、需要换路径重发的数据（数据序号空间）
    pub reinject: VecDeque<Segment>,
    pub subflows: BTreeMap<PathIndex, TcpSock>,
    pub sched: Box<dyn Scheduler>,
    /// 本轮调度中被排除的子流位图
    pub noneligible: u8,
    pub fin_enqueued: bool,
    pub nonagle: u8,
    pub(crate) in_write_xmit: bool,
}

impl MetaSock {
    pub fn new(id: ConnId, cfg: Arc<XmitConfig>, local_token: u32, sched: Box<dyn Scheduler>) -> Self {
        let idsn = idsn_for_token(local_token);
        let nonagle = if cfg.nagle { 0 } else { NAGLE_OFF };
        Self {
            id,
            state: TcpState::Closed,
            local_token,
            remote_token: 0,
            idsn,
            snd_una: idsn,
            snd_nxt: idsn,
            write_seq: idsn,
            pushed_seq: idsn,
            snd_sml: idsn,
            snd_wnd: 0,
            rcv_nxt: 0,
            queue: WriteQueue::new(cfg.sndbuf),
            reinject: VecDeque::new(),
            subflows: BTreeMap::new(),
            sched,
            noneligible: 0,
            fin_enqueued: false,
            nonagle,
            in_write_xmit: false,
            cfg,
        }
    }

    /// 加入一条子流；第一条是主子流（SYN 带 capable，其余带 join）
    pub fn add_subflow(&mut self, mut sub: TcpSock) {
        let ctx = MpContext {
            is_master: self.subflows.is_empty(),
            local_token: self.local_token,
            remote_token: self.remote_token,
            addr_id: sub.path.0,
            ..MpContext::default()
        };
        sub.mp = Some(ctx);
        debug!(conn = ?self.id, path = ?sub.path, master = self.subflows.is_empty(), "加入子流");
        self.subflows.insert(sub.path, sub);
    }

    pub fn subflow(&self, path: PathIndex) -> Option<&TcpSock> {
        self.subflows.get(&path)
    }

    pub fn subflow_mut(&mut self, path: PathIndex) -> Option<&mut TcpSock> {
        self.subflows.get_mut(&path)
    }

    pub fn wnd_end(&self) -> u32 {
        self.snd_una.wrapping_add(self.snd_wnd)
    }

    /// 已分配给子流、尚未被数据确认的字节
    pub fn bytes_in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// 被对端数据确认的字节总数
    pub fn bytes_acked(&self) -> u32 {
        self.snd_una.wrapping_sub(self.idsn)
    }

    /// 把连接级状态同步到每条子流
    pub fn refresh_ctx(&mut self) {
        let wnd_end = self.wnd_end();
        for sub in self.subflows.values_mut() {
            if let Some(mp) = sub.mp.as_mut() {
                mp.remote_token = self.remote_token;
                mp.data_ack = self.rcv_nxt;
                mp.fin_enqueued = self.fin_enqueued;
                mp.meta_write_seq = self.write_seq;
                mp.data_wnd_end = wnd_end;
            }
        }
    }

    /// 向对端通告一个本地地址（由第一条可用子流携带）
    pub fn advertise_addr(&mut self, addr: AddrAdvert) {
        let target = self
            .subflows
            .values_mut()
            .find(|s| !s.is_closed())
            .and_then(|s| s.mp.as_mut());
        match target {
            Some(mp) => mp.addrs_unsent.push(addr),
            None => warn!(conn = ?self.id, ?addr, "没有可用子流携带地址通告"),
        }
    }

    /// 所有子流发起连接
    pub fn connect(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) -> Result<(), XmitError> {
        let mut last_err = None;
        let mut opened = 0;
        for sub in self.subflows.values_mut() {
            match sub.connect(net, sim) {
                Ok(()) => opened += 1,
                Err(err) => {
                    warn!(conn = ?self.id, path = ?sub.path, ?err, "子流建连失败");
                    last_err = Some(err);
                }
            }
        }
        if opened == 0 {
            return Err(last_err.unwrap_or(XmitError::HostUnreachable));
        }
        self.state = TcpState::SynSent;
        Ok(())
    }

    /// 应用写入：切成不超过连接级 MSS 的段挂到连接级写队列
    pub fn send(&mut self, data: &[u8], net: &mut dyn NetApi, sim: &mut Simulator) -> Result<usize, XmitError> {
        if !matches!(self.state, TcpState::Established | TcpState::SynSent) {
            return Err(XmitError::Closed);
        }
        let mss = self.cfg.mptcp_mss as usize;
        let mut copied = 0usize;
        while copied < data.len() {
            let remaining = data.len() - copied;
            let tail_room = match (self.queue.send_head(), self.queue.back()) {
                (Some(_), Some(tail)) if !tail.has(TcpFlags::FIN) && (tail.len() as usize) < mss => {
                    Some(mss - tail.len() as usize)
                }
                _ => None,
            };
            let n = match tail_room {
                Some(room) => {
                    let n = room.min(remaining);
                    if !self.queue.has_room(n) {
                        break;
                    }
                    let idx = self.queue.len() - 1;
                    let chunk = &data[copied..copied + n];
                    self.queue.modify(idx, |s| s.extend(chunk));
                    n
                }
                None => {
                    let n = mss.min(remaining);
                    if !self.queue.has_room(n + SEG_OVERHEAD) {
                        break;
                    }
                    let seg = Segment::new(self.write_seq, data[copied..copied + n].to_vec(), TcpFlags::ACK);
                    self.queue.push_tail(seg);
                    n
                }
            };
            self.write_seq = self.write_seq.wrapping_add(n as u32);
            copied += n;
        }

        if copied > 0 {
            if let Some(tail) = self.queue.back_mut() {
                tail.flags |= TcpFlags::PSH;
            }
            self.pushed_seq = self.write_seq;
            self.push(net, sim);
        } else {
            debug!(conn = ?self.id, wmem = self.queue.wmem_queued(), "连接级发送缓冲已满");
        }
        Ok(copied)
    }

    /// 应用关闭：排一个 data FIN（占一个数据序号），随后由调度器发出
    pub fn close(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.fin_enqueued || matches!(self.state, TcpState::Closed) {
            return;
        }
        self.fin_enqueued = true;
        if self.queue.send_head().is_some()
            && let Some(tail) = self.queue.back_mut()
        {
            tail.flags |= TcpFlags::FIN;
            tail.end_seq = tail.end_seq.wrapping_add(1);
            tail.end_data_seq = tail.end_data_seq.wrapping_add(1);
        } else {
            self.queue
                .push_tail(Segment::control(self.write_seq, TcpFlags::ACK | TcpFlags::FIN));
        }
        self.write_seq = self.write_seq.wrapping_add(1);
        self.state = TcpState::FinWait1;
        info!(conn = ?self.id, write_seq = self.write_seq, "连接级 FIN 已排队");
        self.push_pending_frames(NAGLE_OFF, net, sim);
    }

    /// 连接级数据确认：释放已确认的段
    pub fn on_data_ack(&mut self, data_ack: u32, wnd: u32) -> u32 {
        self.snd_wnd = wnd;
        if !after(data_ack, self.snd_una) || after(data_ack, self.snd_nxt) {
            self.refresh_ctx();
            return 0;
        }
        while self.queue.sent_len() > 0 {
            let Some(seg) = self.queue.front() else {
                break;
            };
            if after(seg.end_seq, data_ack) {
                if after(data_ack, seg.seq) && !seg.is_empty() {
                    let cut = data_ack.wrapping_sub(seg.seq).min(seg.len());
                    let mss = self.cfg.mptcp_mss;
                    self.queue.modify(0, |s| s.trim_front(cut, mss, false));
                }
                break;
            }
            self.queue.pop_front();
        }
        let acked = data_ack.wrapping_sub(self.snd_una);
        self.snd_una = data_ack;
        if self.state == TcpState::FinWait1 && self.queue.is_empty() && self.snd_una == self.write_seq {
            self.state = TcpState::FinWait2;
            info!(conn = ?self.id, "连接级 FIN 已被确认");
        }
        self.refresh_ctx();
        trace!(conn = ?self.id, data_ack, acked, "数据确认");
        acked
    }

    /// 把某条子流上已发出、尚未被数据确认的数据放进重注入队列
    pub fn reinject_subflow(&mut self, path: PathIndex) -> usize {
        let Some(sub) = self.subflows.get(&path) else {
            return 0;
        };
        let mut added = 0;
        for seg in sub.queue.iter().take(sub.queue.sent_len()) {
            if !seg.mapped || !after(seg.end_data_seq, self.snd_una) {
                continue;
            }
            if self.reinject.iter().any(|r| r.data_seq == seg.data_seq) {
                continue;
            }
            let pos = self
                .reinject
                .iter()
                .position(|r| before(seg.data_seq, r.data_seq))
                .unwrap_or(self.reinject.len());
            self.reinject.insert(pos, seg.to_data_space());
            added += 1;
        }
        if added > 0 {
            debug!(conn = ?self.id, ?path, added, queued = self.reinject.len(), "数据重注入");
        }
        added
    }

    /// 关闭一条子流：先把它承载的未确认数据转给其他子流，再发 FIN
    pub fn close_subflow(&mut self, path: PathIndex, net: &mut dyn NetApi, sim: &mut Simulator) {
        self.reinject_subflow(path);
        if let Some(sub) = self.subflows.get_mut(&path) {
            sub.send_fin(net, sim);
        }
        self.push(net, sim);
    }

    /// 子流收到 ACK
    pub fn on_ack(
        &mut self,
        path: PathIndex,
        sig: &AckSignal,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> AckOutcome {
        self.refresh_ctx();
        let Some(sub) = self.subflows.get_mut(&path) else {
            return AckOutcome::default();
        };
        let out = sub.on_ack(sig, net, sim);
        let wnd = sub.snd_wnd;
        if out.established && self.state == TcpState::SynSent {
            self.state = TcpState::Established;
            self.snd_wnd = self.snd_wnd.max(wnd);
            info!(conn = ?self.id, ?path, "多路径连接已建立");
        }
        if let Some(data_ack) = sig.data_ack {
            self.on_data_ack(data_ack, wnd);
        }
        self.push(net, sim);
        out
    }

    /// 子流定时器到期
    pub fn on_subflow_timer(
        &mut self,
        path: PathIndex,
        kind: TimerKind,
        generation: u64,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) {
        let Some(sub) = self.subflows.get_mut(&path) else {
            return;
        };
        if !sub.timer_fired(kind, generation) {
            return;
        }
        match kind {
            TimerKind::Retransmit => self.on_subflow_timeout(path, net, sim),
            TimerKind::Probe0 => {
                sub.send_probe0(net, sim);
                self.push(net, sim);
            }
            _ => sub.on_timer_expired(kind, net, sim),
        }
    }

    /// 子流重传超时：先重注入，再让子流自己处理超时
    pub fn on_subflow_timeout(&mut self, path: PathIndex, net: &mut dyn NetApi, sim: &mut Simulator) {
        self.refresh_ctx();
        if self.subflows.len() > 1 {
            self.reinject_subflow(path);
        }
        if let Some(sub) = self.subflows.get_mut(&path) {
            sub.on_retransmit_timeout(net, sim);
        }
        self.push(net, sim);
    }
}
