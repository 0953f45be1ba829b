//! 连接级发送：调度器把连接级数据逐段分给子流
//!
//! 每一轮先看重注入队列，再看连接级 send_head。选中的子流拿到一份共享载荷的副本，
//! 映射到自己的序列空间后立刻发出。出口因本地拥塞拒绝时撤销这次分配，
//! 本轮把该子流排除后换一条重试。

use tracing::{debug, info, trace};

use crate::error::XmitError;
use crate::net::{NetApi, PathIndex, TcpFlags};
use crate::proto::{
    CaState, NAGLE_OFF, NAGLE_PUSH, Segment, TcpState, after, cwnd_test, init_tso_segs,
    minshall_check, nagle_test, snd_wnd_test, tso_fragment,
};
use crate::sim::Simulator;

use super::meta::MetaSock;
use super::scheduler::Candidate;

impl MetaSock {
    fn small_outstanding(&self) -> bool {
        self.snd_nxt != self.snd_una && minshall_check(self.snd_sml, self.snd_una, self.snd_nxt)
    }

    /// 丢掉已经被数据确认的重注入段
    fn discard_acked_reinjects(&mut self, net: &mut dyn NetApi) {
        while let Some(front) = self.reinject.front()
            && !after(front.end_data_seq, self.snd_una)
        {
            trace!(conn = ?self.id, data_seq = front.data_seq, "重注入数据已确认，丢弃");
            self.reinject.pop_front();
            net.stats_mut().reinject_discards += 1;
        }
    }

    /// 当前候选段：(段, 是否来自重注入队列)
    fn candidate(&self) -> Option<(&Segment, bool)> {
        match self.reinject.front() {
            Some(seg) => Some((seg, true)),
            None => self.queue.send_head_seg().map(|seg| (seg, false)),
        }
    }

    /// 能承载 `seg` 的子流
    fn available_subflows(&self, seg: &Segment, mss_now: u32) -> Vec<Candidate> {
        let span = seg.end_seq.wrapping_sub(seg.seq);
        self.subflows
            .values()
            .filter(|sub| {
                sub.state == TcpState::Established
                    && self.noneligible & sub.path.flag() == 0
                    && sub.ca_state != CaState::Loss
                    && sub.queue.send_head().is_none()
                    && cwnd_test(sub.in_flight(), sub.cong.cwnd, seg) > 0
                    && snd_wnd_test(
                        seg,
                        sub.write_seq,
                        sub.write_seq.wrapping_add(span),
                        sub.wnd_end(),
                        mss_now,
                    )
            })
            .map(|sub| Candidate {
                path: sub.path,
                srtt: sub.srtt,
                in_flight: sub.in_flight(),
                cwnd: sub.cong.cwnd,
                carried: seg.path_mask & sub.path.flag() != 0,
            })
            .collect()
    }

    /// 把候选段切到不超过 `mss_now`
    fn split_candidate(&mut self, reinject: bool, mss_now: u32) -> Result<(), XmitError> {
        if reinject {
            if let Some(front) = self.reinject.front_mut()
                && front.len() > mss_now
            {
                let tail = front.split_off(mss_now, mss_now, false);
                self.reinject.insert(1, tail);
            }
            return Ok(());
        }
        match self.queue.send_head() {
            Some(idx) => tso_fragment(&mut self.queue, idx, mss_now, mss_now, false),
            None => Ok(()),
        }
    }

    /// 逐段分配连接级数据。
    ///
    /// 返回 true 表示什么都没发出、没有在途数据、但还有数据待发。
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id))]
    pub fn write_xmit(
        &mut self,
        mss_now: u32,
        nonagle: u8,
        push_one: bool,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> bool {
        assert!(!self.in_write_xmit, "connection-level write path re-entered on {:?}", self.id);
        if self.state == TcpState::Closed {
            return false;
        }
        self.in_write_xmit = true;
        self.refresh_ctx();

        let mut sent = 0u32;
        let mut fin_path: Option<PathIndex> = None;

        loop {
            self.discard_acked_reinjects(net);
            let small = self.small_outstanding();
            let wnd_end = self.wnd_end();
            let Some((seg, reinject)) = self.candidate() else {
                break;
            };

            let mut probe = seg.clone();
            let tso_segs = init_tso_segs(&mut probe, mss_now, false);
            if !reinject {
                if !snd_wnd_test(&probe, probe.data_seq, probe.end_data_seq, wnd_end, mss_now) {
                    trace!(data_seq = probe.data_seq, wnd_end, "超出连接级窗口");
                    break;
                }
                let last = self.queue.send_head().is_some_and(|idx| self.queue.is_last(idx));
                let eff = if last { nonagle } else { NAGLE_PUSH };
                if tso_segs == 1 && !nagle_test(&probe, mss_now, eff, false, small) {
                    trace!(len = probe.len(), "Nagle 扣住连接级小段");
                    break;
                }
            }

            let candidates = self.available_subflows(&probe, mss_now);
            let Some(path) = self.sched.select_subflow(&candidates) else {
                trace!(candidates = candidates.len(), "没有可用子流");
                break;
            };

            if probe.len() > mss_now && self.split_candidate(reinject, mss_now).is_err() {
                break;
            }

            let now = sim.now();
            let (orig, src) = if reinject {
                let Some(seg) = self.reinject.pop_front() else {
                    break;
                };
                (Some(seg.clone()), seg)
            } else {
                let Some(seg) = self.queue.send_head_seg() else {
                    break;
                };
                (None, seg.clone())
            };

            let Some(sub) = self.subflows.get_mut(&path) else {
                break;
            };
            assert!(
                sub.queue.send_head().is_none(),
                "subflow {path:?} already holds an unsent segment"
            );
            let mut seg = src.remap(sub.write_seq);
            seg.path_mask |= path.flag();
            seg.when = now;
            seg.set_tso_segs(mss_now, false);
            let span = seg.end_seq.wrapping_sub(seg.seq);
            let idx = sub.queue_segment(seg.clone());

            if let Err(err) = sub.transmit(&seg, false, net, sim) {
                sub.queue.remove(idx);
                sub.write_seq = sub.write_seq.wrapping_sub(span);
                if let Some(orig) = orig {
                    self.reinject.push_front(orig);
                }
                if err == XmitError::Congested && self.subflows.len() > 1 {
                    debug!(?path, "子流本地拥塞，本轮排除");
                    self.noneligible |= path.flag();
                    net.stats_mut().noneligible_marks += 1;
                    continue;
                }
                break;
            }

            if !reinject {
                self.event_new_data_sent();
            }
            if let Some(sub) = self.subflows.get_mut(&path) {
                sub.event_new_data_sent(sim);
                if seg.has(TcpFlags::FIN) {
                    sub.state = TcpState::FinWait1;
                    fin_path = Some(path);
                }
                sub.cwnd_validate(now);
            }
            if seg.len() < mss_now {
                self.snd_sml = seg.end_data_seq;
            }
            sent += 1;
            trace!(?path, data_seq = seg.data_seq, sub_seq = seg.seq, reinject, "数据已分配给子流");

            if push_one {
                break;
            }
        }

        self.noneligible = 0;
        self.in_write_xmit = false;

        if let Some(path) = fin_path {
            self.broadcast_fin(path, net, sim);
        }
        if sent > 0 {
            return false;
        }
        self.snd_una == self.snd_nxt && self.queue.send_head().is_some()
    }

    /// 连接级 send_head 已分配出去
    fn event_new_data_sent(&mut self) {
        let Some(end) = self.queue.send_head_seg().map(|seg| seg.end_seq) else {
            return;
        };
        self.queue.advance_send_head();
        if after(end, self.snd_nxt) {
            self.snd_nxt = end;
        }
    }

    /// data FIN 已在 `origin` 上发出：其余子流各自发送 FIN
    pub fn broadcast_fin(&mut self, origin: PathIndex, net: &mut dyn NetApi, sim: &mut Simulator) {
        for (path, sub) in self.subflows.iter_mut() {
            if *path == origin || !matches!(sub.state, TcpState::Established | TcpState::SynSent) {
                continue;
            }
            info!(conn = ?self.id, ?origin, path = ?path, "向子流广播 FIN");
            sub.send_fin(net, sim);
        }
    }

    pub fn push_pending_frames(&mut self, nonagle: u8, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.queue.send_head().is_none() && self.reinject.is_empty() {
            return;
        }
        let mss = self.cfg.mptcp_mss;
        if self.write_xmit(mss, nonagle, false, net, sim) {
            for sub in self.subflows.values_mut() {
                if sub.state == TcpState::Established {
                    sub.check_probe_timer(sim);
                }
            }
        }
    }

    pub fn push(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        let nonagle = self.nonagle;
        self.push_pending_frames(nonagle, net, sim);
    }

    /// 只分配一个段（忽略 Nagle）
    pub fn push_one(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.queue.send_head().is_none() && self.reinject.is_empty() {
            return;
        }
        let mss = self.cfg.mptcp_mss;
        self.write_xmit(mss, NAGLE_PUSH, true, net, sim);
    }

    /// 强制推送（应用 flush）
    pub fn flush(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        self.push_pending_frames(NAGLE_OFF, net, sim);
    }
}
