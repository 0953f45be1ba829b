//! 接收侧信号
//!
//! 接收处理不在发送引擎里；这里只接住它交过来的结论：累计确认与窗口、SACK 块、
//! 对端 SYN 里的协商结果。据此清理重传队列、更新 RTT 与拥塞窗口、驱动丢包恢复，
//! 最后再尝试发送。

use tracing::{debug, info, trace};

use crate::net::{NetApi, TcpFlags};
use crate::sim::{SimTime, Simulator};

use super::congestion::CaState;
use super::fragment::trim_head;
use super::options::{SackBlock, TCPOLEN_SIGNATURE_ALIGNED, TCPOLEN_TSTAMP_ALIGNED};
use super::segment::Sacked;
use super::seq::{after, before};
use super::sock::{TcpSock, TcpState};
use super::timer::TimerKind;
use super::window::MAX_WSCALE;

/// 对端 SYN 中携带的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSyn {
    pub isn: u32,
    pub mss: u16,
    pub wscale: Option<u8>,
    pub sack_ok: bool,
    pub tstamp_ok: bool,
    pub ecn: bool,
}

/// 一次 ACK 到达
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSignal {
    pub ack: u32,
    /// 头部里的原始窗口值（未缩放）
    pub wnd: u16,
    pub syn: Option<PeerSyn>,
    pub sacks: Vec<SackBlock>,
    /// 连接级数据确认（多路径）
    pub data_ack: Option<u32>,
}

impl AckSignal {
    pub fn new(ack: u32, wnd: u16) -> Self {
        Self {
            ack,
            wnd,
            ..Self::default()
        }
    }
}

/// 一次确认处理的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// 被完全确认并移出队列的包数
    pub acked_pkts: u32,
    /// 新确认的字节（序列空间）
    pub acked_bytes: u32,
    /// 本次确认让连接进入了 Established
    pub established: bool,
}

impl TcpSock {
    /// 收到 SYN-ACK：记录协商结果并进入 Established
    pub fn finish_connect(&mut self, syn: &PeerSyn, now: SimTime) {
        self.rcv_nxt = syn.isn.wrapping_add(1);
        self.rcv_wup = self.rcv_nxt;

        self.opts.tstamp_ok &= syn.tstamp_ok;
        self.opts.sack_ok &= syn.sack_ok;
        match syn.wscale {
            Some(ws) if self.opts.wscale_ok => {
                self.opts.snd_wscale = ws.min(MAX_WSCALE);
            }
            _ => {
                self.opts.wscale_ok = false;
                self.opts.snd_wscale = 0;
                self.opts.rcv_wscale = 0;
                self.window_clamp = self.window_clamp.min(65535);
            }
        }
        if syn.mss != 0 {
            let mut in_mss = u32::from(syn.mss);
            if self.opts.user_mss != 0 && self.opts.user_mss < in_mss {
                in_mss = self.opts.user_mss;
            }
            self.opts.mss_clamp = in_mss;
        }
        self.ecn.ok &= syn.ecn;

        self.tcp_header_len = 20;
        if self.opts.tstamp_ok {
            self.tcp_header_len += TCPOLEN_TSTAMP_ALIGNED as u32;
        }
        if self.opts.signature {
            self.tcp_header_len += TCPOLEN_SIGNATURE_ALIGNED as u32;
        }
        self.mtup_init();
        let pmtu = self.pmtu_cookie;
        self.sync_mss(pmtu);

        self.lsndtime = now;
        if self.state == TcpState::SynSent {
            self.state = TcpState::Established;
        }
        info!(conn = ?self.id, path = ?self.path, mss = self.mss_cache, snd_wscale = self.opts.snd_wscale, sack = self.opts.sack_ok, "连接已建立");
    }

    fn update_rtt(&mut self, sample: SimTime) {
        if self.srtt == SimTime::ZERO {
            self.srtt = sample;
            self.rttvar = SimTime(sample.0 / 2);
        } else {
            let err = self.srtt.0.abs_diff(sample.0);
            self.rttvar = SimTime((3 * self.rttvar.0 + err) / 4);
            self.srtt = SimTime((7 * self.srtt.0 + sample.0) / 8);
        }
        let rto = SimTime(self.srtt.0.saturating_add(4 * self.rttvar.0));
        self.rto = rto.max(self.cfg.rto_min()).min(self.cfg.rto_max());
        self.backoff = 0;
    }

    /// 把 `ack` 之前的段移出重传队列；返回 (移除的包数, RTT 样本)
    fn clean_rtx_queue(&mut self, ack: u32, now: SimTime) -> (u32, Option<SimTime>) {
        let mut acked = 0;
        let mut sample = None;
        let offload = self.can_gso();

        while self.queue.sent_len() > 0 {
            let Some(seg) = self.queue.front() else {
                break;
            };
            if after(seg.end_seq, ack) {
                // 部分确认：只裁掉前面的字节
                if after(ack, seg.seq) && !seg.is_empty() {
                    let (cut, sacked) = (ack.wrapping_sub(seg.seq).min(seg.len()), seg.sacked);
                    let mss = self.mss_cache;
                    let diff = trim_head(&mut self.queue, 0, cut, mss, offload);
                    self.adjust_pcount(sacked, diff);
                    acked += u32::try_from(diff).unwrap_or(0);
                }
                break;
            }
            let Some(seg) = self.queue.pop_front() else {
                break;
            };
            // Karn：重传过的段不取样
            if !seg.sacked.contains(Sacked::EVER_RETRANS) {
                sample = Some(now.saturating_sub(seg.when));
            }
            self.adjust_pcount(seg.sacked, i64::from(seg.pcount));
            acked += seg.pcount;
        }
        (acked, sample)
    }

    /// 恢复/缩减阶段在 high_seq 被确认后结束
    fn try_leave_recovery(&mut self, now: SimTime) {
        if !matches!(self.ca_state, CaState::Cwr | CaState::Recovery | CaState::Loss) {
            return;
        }
        if before(self.snd_una, self.high_seq) {
            return;
        }
        if self.ca_state != CaState::Loss {
            self.complete_cwr(now);
        }
        self.forward_retransmit = false;
        self.recovery_override = false;
        self.retrans_stamp = None;
        self.set_ca_state(CaState::Open);
    }

    /// 处理一次 ACK 到达，最后尝试发送。
    #[tracing::instrument(level = "debug", skip(self, sig, net, sim), fields(conn = ?self.id, path = ?self.path, ack = sig.ack))]
    pub fn on_ack(&mut self, sig: &AckSignal, net: &mut dyn NetApi, sim: &mut Simulator) -> AckOutcome {
        let now = sim.now();
        let mut out = AckOutcome::default();

        // 握手中途被关闭时状态已是 FinWait1，但 SYN 仍在队首等确认
        let awaiting_syn_ack = self.queue.front().is_some_and(|s| s.has(TcpFlags::SYN));
        match (self.state, sig.syn.as_ref()) {
            (TcpState::Closed, _) => return out,
            (_, None) if awaiting_syn_ack => return out,
            (_, Some(syn)) if awaiting_syn_ack => {
                self.finish_connect(syn, now);
                out.established = true;
            }
            _ => {}
        }
        if after(sig.ack, self.snd_nxt) {
            trace!(snd_nxt = self.snd_nxt, "确认了尚未发送的数据，忽略");
            return out;
        }
        if before(sig.ack, self.snd_una) {
            trace!(snd_una = self.snd_una, "过时的确认");
            return out;
        }

        let shift = if sig.syn.is_some() { 0 } else { self.opts.snd_wscale };
        let wnd = u32::from(sig.wnd) << shift;
        let prior_wnd_end = self.wnd_end();
        self.snd_wnd = wnd;
        self.max_window = self.max_window.max(wnd);

        for blk in &sig.sacks {
            self.mark_sacked(blk.start, blk.end);
        }

        if after(sig.ack, self.snd_una) {
            let (acked, sample) = self.clean_rtx_queue(sig.ack, now);
            out.acked_bytes = sig.ack.wrapping_sub(self.snd_una);
            out.acked_pkts = acked;
            self.snd_una = sig.ack;
            self.dup_acks = 0;
            if let Some(rtt) = sample {
                self.update_rtt(rtt);
            }
            if self.counters.retrans_out == 0 {
                self.retrans_stamp = None;
            }
            if self.counters.sacked_out == 0 {
                self.highest_sack = None;
            }
            if self.mtup.probe_size != 0 && !before(self.snd_una, self.mtup.probe_seq_end) {
                self.mtup_probe_success(now);
            }
            self.try_leave_recovery(now);
            if acked > 0 && !matches!(self.ca_state, CaState::Recovery | CaState::Cwr) {
                self.ca.cong_avoid(&mut self.cong, acked);
            }
            self.rearm_rto(sim);
            if self.state == TcpState::FinWait1 && self.queue.is_empty() && self.snd_una == self.write_seq {
                self.state = TcpState::FinWait2;
                debug!(conn = ?self.id, path = ?self.path, "FIN 已被确认");
            }
        } else if self.counters.packets_out > 0 && self.wnd_end() == prior_wnd_end {
            self.dup_acks += 1;
            trace!(dup_acks = self.dup_acks, "重复确认");
        }

        self.detect_loss(now);

        if self.timer_pending(TimerKind::Probe0)
            && let Some(head) = self.queue.send_head_seg()
            && !after(head.end_seq, self.wnd_end())
        {
            // 窗口打开了
            self.clear_timer(TimerKind::Probe0);
            self.backoff = 0;
            self.probes_out = 0;
        }

        if matches!(self.ca_state, CaState::Loss | CaState::Recovery) {
            self.xmit_retransmit_queue(net, sim);
        }
        if self.is_sending() {
            self.push(net, sim);
        }
        if out.established && self.counters.packets_out == 0 {
            self.send_ack(net, sim);
        }
        out
    }

    /// 简单的丢包判定：重复确认或 SACK 证据达到乱序门限时进入恢复
    fn detect_loss(&mut self, now: SimTime) {
        if self.ca_state >= CaState::Recovery || self.counters.packets_out == 0 {
            return;
        }
        let evidence = self.dup_acks.max(self.counters.sacked_out);
        if evidence < self.reordering {
            return;
        }
        let highest = self.highest_sack_seq();
        self.enter_recovery(self.opts.sack_ok, now);
        for idx in 0..self.queue.sent_len() {
            let Some(seg) = self.queue.get(idx) else {
                break;
            };
            if !before(seg.seq, highest) {
                break;
            }
            if !seg.sacked.intersects(Sacked::SACKED_ACKED | Sacked::LOST) {
                self.mark_lost(idx);
            }
        }
    }
}
