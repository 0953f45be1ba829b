//! 控制段
//!
//! 建连（SYN）、FIN、RST、纯 ACK、延迟 ACK、窗口探测。控制段除 SYN/FIN 外不进写队列，
//! 发送失败也不影响序列状态。

use tracing::{debug, info, trace, warn};

use crate::error::XmitError;
use crate::net::{NetApi, TCP_HEADER_LEN, TcpFlags};
use crate::sim::{SimTime, Simulator};

use super::admission::NAGLE_OFF;
use super::fragment::fragment;
use super::options::{TCPOLEN_SIGNATURE_ALIGNED, TCPOLEN_TSTAMP_ALIGNED};
use super::segment::Segment;
use super::seq::{before, between};
use super::sock::{Counters, TCP_MSS_DEFAULT, TcpSock, TcpState};
use super::timer::TimerKind;
use super::window::select_initial_window;

/// 延迟确认的默认上限（非交互连接）
const DELACK_DEFAULT_MAX: SimTime = SimTime(500_000_000);
const MIN_MSS: u32 = 48;

impl TcpSock {
    /// 建连前的初始化：路由、MSS、初始窗口与缩放因子
    pub fn connect_init(&mut self, net: &dyn NetApi) -> Result<(), XmitError> {
        let route = net
            .route(self.id, self.path)
            .ok_or(XmitError::HostUnreachable)?;
        self.apply_route(&route);

        self.opts.tstamp_ok = self.cfg.timestamps;
        self.opts.sack_ok = self.cfg.sack;
        self.opts.wscale_ok = self.cfg.window_scaling;
        self.opts.signature = net.has_signature_key(self.id);

        let mut header_len = TCP_HEADER_LEN;
        if self.opts.tstamp_ok {
            header_len += TCPOLEN_TSTAMP_ALIGNED;
        }
        if self.opts.signature {
            header_len += TCPOLEN_SIGNATURE_ALIGNED;
        }
        self.tcp_header_len = header_len as u32;

        if self.opts.user_mss != 0 {
            self.opts.mss_clamp = self.opts.user_mss;
        }
        self.max_window = 0;
        self.mtup_init();
        self.sync_mss(route.pmtu);

        if self.window_clamp == 0 {
            self.window_clamp = route.window_clamp;
        }
        self.advmss = route.advmss;
        if self.opts.user_mss != 0 && self.opts.user_mss < self.advmss {
            self.advmss = self.opts.user_mss;
        }
        self.rcv_mss = self
            .advmss
            .min(self.mss_cache)
            .min(TCP_MSS_DEFAULT)
            .max(MIN_MSS);

        let init = select_initial_window(
            self.full_space(),
            self.advmss,
            self.window_clamp,
            self.opts.wscale_ok,
            self.cfg.workaround_signed_windows,
            self.cfg.rcvbuf,
            0,
        );
        self.rcv_wnd = init.rcv_wnd;
        self.window_clamp = init.window_clamp;
        self.opts.rcv_wscale = init.rcv_wscale;
        self.rcv_ssthresh = self.rcv_wnd;

        if let Some(cwnd) = route.init_cwnd {
            self.init_cwnd = cwnd;
            self.cong.cwnd = cwnd;
        }

        self.snd_wnd = 0;
        self.snd_una = self.write_seq;
        self.snd_sml = self.write_seq;
        self.snd_up = self.write_seq;
        self.rcv_nxt = 0;
        self.rcv_wup = 0;
        self.rto = self.cfg.rto_init();
        self.backoff = 0;
        self.counters = Counters::default();
        self.queue.clear_hints();
        Ok(())
    }

    /// 主动打开：发出 SYN 并启动重传定时器
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id, path = ?self.path))]
    pub fn connect(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) -> Result<(), XmitError> {
        self.connect_init(net)?;
        let now = sim.now();

        let mut flags = TcpFlags::SYN;
        self.ecn.ok = false;
        if self.cfg.ecn {
            flags |= TcpFlags::ECE | TcpFlags::CWR;
            self.ecn.ok = true;
        }
        let mut syn = Segment::control(self.write_seq, flags);
        syn.when = now;
        self.snd_nxt = self.write_seq;
        self.retrans_stamp = Some(now);

        // SYN 直接记为已发送，不经过 send_head
        self.queue_segment(syn.clone());
        self.queue.advance_send_head();
        self.counters.packets_out += syn.pcount;
        self.state = TcpState::SynSent;

        if let Err(err) = self.transmit(&syn, false, net, sim) {
            warn!(?err, "SYN 未能交给出口，等待重传");
        }
        self.snd_nxt = self.write_seq;
        self.pushed_seq = self.write_seq;
        net.stats_mut().active_opens += 1;

        let (rto, max) = (self.rto, self.cfg.rto_max());
        self.reset_timer(TimerKind::Retransmit, rto, max, sim);
        info!(iss = self.iss, mss = self.mss_cache, rcv_wnd = self.rcv_wnd, "发起连接");
        Ok(())
    }

    /// 关闭发送方向：FIN 挂到最后一个未发送段上，否则单独排一个 FIN 段。
    ///
    /// 段分配失败时不自旋，改为定时重试，次数有上限。
    pub fn send_fin(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        if matches!(self.state, TcpState::Closed | TcpState::FinWait2) {
            return;
        }
        if self.state == TcpState::FinWait1 && self.fin_queued() {
            return;
        }
        let mss_now = self.current_mss(net);

        if self.queue.send_head().is_some()
            && let Some(tail) = self.queue.back_mut()
        {
            tail.flags |= TcpFlags::FIN;
            tail.end_seq = tail.end_seq.wrapping_add(1);
            if !tail.mapped {
                tail.end_data_seq = tail.end_data_seq.wrapping_add(1);
            }
            self.write_seq = self.write_seq.wrapping_add(1);
        } else {
            if !self.queue.can_alloc() {
                self.schedule_fin_retry(net, sim);
                return;
            }
            let fin = Segment::control(self.write_seq, TcpFlags::ACK | TcpFlags::FIN);
            self.queue_segment(fin);
        }
        self.fin_retries = 0;
        self.clear_timer(TimerKind::FinRetry);
        self.state = TcpState::FinWait1;
        debug!(conn = ?self.id, path = ?self.path, write_seq = self.write_seq, "FIN 已排队");
        self.push_pending_frames(mss_now, NAGLE_OFF, net, sim);
    }

    /// 写队列里是否已经有 FIN
    pub fn fin_queued(&self) -> bool {
        self.queue.back().is_some_and(|s| s.has(TcpFlags::FIN))
    }

    fn schedule_fin_retry(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        self.fin_retries += 1;
        if self.fin_retries > self.cfg.fin_retry_limit {
            warn!(conn = ?self.id, path = ?self.path, retries = self.fin_retries, "FIN 始终无法分配，放弃并重置连接");
            self.abort(net, sim);
            return;
        }
        warn!(conn = ?self.id, path = ?self.path, retries = self.fin_retries, "FIN 段分配失败，稍后重试");
        let (when, max) = (self.cfg.fin_retry(), self.cfg.rto_max());
        self.reset_timer(TimerKind::FinRetry, when, max, sim);
    }

    /// 发送 RST（不进写队列，失败只计数）
    pub fn send_active_reset(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        let mut rst = Segment::control(self.acceptable_seq(), TcpFlags::ACK | TcpFlags::RST);
        rst.when = sim.now();
        if self.transmit(&rst, false, net, sim).is_err() {
            net.stats_mut().abort_failed += 1;
        }
        net.stats_mut().out_rsts += 1;
    }

    /// 中止连接：发 RST，丢弃写队列，取消所有定时器
    pub fn abort(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.state != TcpState::Closed {
            self.send_active_reset(net, sim);
        }
        self.queue.purge();
        self.counters = Counters::default();
        for kind in [
            TimerKind::Retransmit,
            TimerKind::Probe0,
            TimerKind::DelayedAck,
            TimerKind::FinRetry,
        ] {
            self.clear_timer(kind);
        }
        self.state = TcpState::Closed;
        info!(conn = ?self.id, path = ?self.path, "连接已中止");
    }

    /// 立即发出一个纯 ACK
    pub fn send_ack(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.state == TcpState::Closed {
            return;
        }
        let mut ack = Segment::control(self.acceptable_seq(), TcpFlags::ACK);
        ack.when = sim.now();
        if let Err(err) = self.transmit(&ack, false, net, sim) {
            // 没发出去就改成稍后再确认
            trace!(?err, "ACK 发送失败，改为延迟确认");
            self.ack.pending = true;
            self.ack.ato = self.cfg.delack_min();
            let (when, max) = (self.cfg.delack_max(), self.cfg.rto_max());
            self.reset_timer(TimerKind::DelayedAck, when, max, sim);
        }
    }

    /// 安排一个延迟 ACK
    pub fn send_delayed_ack(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        let now = sim.now();
        let mut ato = self.ack.ato;
        if ato > self.cfg.delack_min() {
            let mut max_ato = DELACK_DEFAULT_MAX;
            if self.ack.pingpong || self.ack.pushed {
                max_ato = self.cfg.delack_max();
            }
            if self.srtt != SimTime::ZERO {
                let rtt = self.srtt.max(self.cfg.delack_min());
                max_ato = max_ato.min(rtt);
            }
            ato = ato.min(max_ato);
        }

        let mut deadline = now + ato;
        if self.ack.pending
            && let Some(prev) = self.timers.delack.deadline
        {
            // 已经挂着的定时器快到了（或被阻塞过）：直接发
            if self.ack.blocked || prev <= now + SimTime(ato.0 >> 2) {
                self.send_ack(net, sim);
                return;
            }
            if prev < deadline {
                deadline = prev;
            }
        }
        self.ack.pending = true;
        let max = self.cfg.rto_max();
        self.reset_timer(TimerKind::DelayedAck, deadline.saturating_sub(now), max, sim);
    }

    /// 用一个旧序号（或紧急数据时的 snd_una）发空段，逼对端回 ACK
    pub fn xmit_probe_skb(
        &mut self,
        urgent: bool,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> Result<(), XmitError> {
        let seq = self.snd_una.wrapping_sub(u32::from(!urgent));
        let mut probe = Segment::control(seq, TcpFlags::ACK);
        probe.when = sim.now();
        self.transmit(&probe, false, net, sim)
    }

    /// 窗口探测：能发新数据就发（按窗口切小），否则发一个旧序号的空段
    pub fn write_wakeup(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) -> Result<(), XmitError> {
        if self.state == TcpState::Closed {
            return Err(XmitError::Closed);
        }
        let wnd_end = self.wnd_end();
        let head = self
            .queue
            .send_head()
            .filter(|&idx| self.queue.get(idx).is_some_and(|s| before(s.seq, wnd_end)));

        let Some(idx) = head else {
            if between(self.snd_up, self.snd_una.wrapping_add(1), self.snd_una.wrapping_add(0xFFFF)) {
                // 紧急数据先单独探一次，结果不影响后面的普通探测
                let _ = self.xmit_probe_skb(true, net, sim);
            }
            return self.xmit_probe_skb(false, net, sim);
        };

        let mss = self.current_mss(net);
        let offload = self.can_gso();
        let Some(seg) = self.queue.get(idx) else {
            return Ok(());
        };
        let (seq, end_seq, len) = (seg.seq, seg.end_seq, seg.len());
        let seg_size = wnd_end.wrapping_sub(seq);
        if before(self.pushed_seq, end_seq) {
            self.pushed_seq = end_seq;
        }

        if seg_size < end_seq.wrapping_sub(seq) || len > mss {
            let seg_size = seg_size.min(mss);
            if let Some(seg) = self.queue.get_mut(idx) {
                seg.flags |= TcpFlags::PSH;
            }
            let snd_nxt = self.snd_nxt;
            fragment(&mut self.queue, &mut self.counters, snd_nxt, idx, seg_size, mss, offload)?;
        }

        let now = sim.now();
        let Some(seg) = self.queue.get_mut(idx) else {
            return Ok(());
        };
        seg.flags |= TcpFlags::PSH;
        seg.when = now;
        let out = seg.clone();
        self.transmit(&out, false, net, sim)?;
        self.event_new_data_sent(sim);
        Ok(())
    }

    /// 零窗口探测定时器到期
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id, path = ?self.path))]
    pub fn send_probe0(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        let res = self.write_wakeup(net, sim);

        if self.counters.packets_out != 0 || self.queue.send_head().is_none() {
            self.probes_out = 0;
            self.backoff = 0;
            return;
        }

        let max = self.cfg.rto_max();
        match res {
            Err(XmitError::NoMemory | XmitError::Congested) => {
                // 本地资源不足：不算一次探测，按资源探测间隔重试
                if self.probes_out == 0 {
                    self.probes_out = 1;
                }
                let when = self
                    .rto
                    .backoff(self.backoff)
                    .min(self.cfg.resource_probe_interval());
                self.reset_timer(TimerKind::Probe0, when, max, sim);
            }
            _ => {
                if self.backoff < self.cfg.retries2 {
                    self.backoff += 1;
                }
                self.probes_out += 1;
                let when = self.rto.backoff(self.backoff).min(max);
                debug!(probes_out = self.probes_out, backoff = self.backoff, "零窗口探测");
                self.reset_timer(TimerKind::Probe0, when, max, sim);
            }
        }
    }
}
