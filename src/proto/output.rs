//! 发送流水线
//!
//! - `transmit`：给段加上头部与选项、算校验和、交给出口；成功后才更新发送后状态
//! - `write_xmit`：从 send_head 开始逐段做准入检查、按 MSS 切分并发送
//! - `push_pending_frames` / `push_one`：写路径的两个入口
//! - `send`：应用写入，把字节切成段挂到写队列尾部

use tracing::{debug, trace, warn};

use crate::error::XmitError;
use crate::net::{
    Frame, MAX_HEADER, NetApi, PacketBuf, TCP_HEADER_LEN, TcpFlags, TcpHeader, checksum,
};
use crate::sim::Simulator;

use super::admission::{NAGLE_PUSH, cwnd_test, init_tso_segs, nagle_test, snd_wnd_test};
use super::congestion::CaEvent;
use super::fragment::tso_fragment;
use super::mtu_probe::ProbeOutcome;
use super::options::{established_options, syn_options};
use super::segment::{SEG_OVERHEAD, Segment};
use super::seq::{after, before, between};
use super::sock::{TcpSock, TcpState};
use super::timer::TimerKind;

impl TcpSock {
    /// 段入队并推进 write_seq
    pub fn queue_segment(&mut self, seg: Segment) -> usize {
        self.write_seq = seg.end_seq;
        self.queue.push_tail(seg)
    }

    /// 发送用的 MSS：多路径子流固定使用连接级 MSS
    pub fn send_mss(&mut self, net: &dyn NetApi) -> u32 {
        if self.is_mp() {
            self.cfg.mptcp_mss
        } else {
            self.current_mss_large(net, true)
        }
    }

    /// 给段加上头部并交给出口。
    ///
    /// 出口拒绝时序列号、队列与计时器状态都不变，只有拥塞控制会被告知（进入 CWR）。
    #[tracing::instrument(level = "trace", skip(self, seg, net, sim), fields(conn = ?self.id, path = ?self.path, seq = seg.seq, len = seg.len()))]
    pub fn transmit(
        &mut self,
        seg: &Segment,
        retransmit: bool,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> Result<(), XmitError> {
        assert!(seg.pcount > 0, "transmitting a segment with zero pcount");
        let now = sim.now();
        let is_syn = seg.has(TcpFlags::SYN);
        let has_data = !seg.is_empty();

        if has_data
            && self.cfg.slow_start_after_idle
            && self.counters.packets_out == 0
            && now.saturating_sub(self.lsndtime) > self.rto
        {
            self.cwnd_restart(now);
        }
        if self.in_flight() == 0 {
            self.ca.cwnd_event(CaEvent::TxStart);
        }

        let tsval = Self::tcp_time_stamp(seg.when);
        let opts = if is_syn {
            self.syn_out_options(tsval)
        } else {
            established_options(&self.opts, self.mp.as_ref(), Some(seg), tsval)
        };
        let header_len = TCP_HEADER_LEN + opts.size();

        let (window, new_rcv_wnd) = if is_syn {
            (self.rcv_wnd.min(65535) as u16, None)
        } else {
            let (wire, rcv_wnd) = self.select_window();
            (wire, Some(rcv_wnd))
        };

        let mut flags = seg.flags;
        let mut urg_ptr = 0u16;
        if self.urg_mode
            && between(self.snd_up, seg.seq.wrapping_add(1), seg.seq.wrapping_add(0xFFFF))
        {
            urg_ptr = self.snd_up.wrapping_sub(seg.seq) as u16;
            flags |= TcpFlags::URG;
        }

        let mut ect = false;
        let mut cwr_sent = false;
        if !is_syn && self.ecn.ok {
            if has_data && !before(seg.seq, self.snd_nxt) {
                ect = true;
                if self.ecn.queue_cwr {
                    flags |= TcpFlags::CWR;
                    cwr_sent = true;
                }
            }
            if self.ecn.demand_cwr {
                flags |= TcpFlags::ECE;
            }
        }

        let mut buf = PacketBuf::with_payload(MAX_HEADER, seg.payload());
        let digest_at = {
            let hdr = buf.push(header_len);
            TcpHeader {
                src_port: self.local.port(),
                dst_port: self.remote.port(),
                seq: seg.seq,
                ack: self.rcv_nxt,
                data_offset: (header_len / 4) as u8,
                flags,
                window,
                checksum: 0,
                urg_ptr,
            }
            .write(&mut hdr[..TCP_HEADER_LEN])
            .expect("option block never exceeds 40 bytes");
            opts.write(&mut hdr[TCP_HEADER_LEN..])
        };
        if let Some(off) = digest_at {
            let at = TCP_HEADER_LEN + off;
            let digest = {
                let data = buf.data();
                net.sign(self.id, &data[..header_len], &data[header_len..])
            };
            buf.data_mut()[at..at + 16].copy_from_slice(&digest);
        }
        let sum = checksum(*self.local.ip(), *self.remote.ip(), buf.data());
        buf.data_mut()[16..18].copy_from_slice(&sum.to_be_bytes());

        let frame = Frame {
            conn: self.id,
            path: self.path,
            src: self.local,
            dst: self.remote,
            buf,
            header_len,
            ect,
            retransmit,
        };
        if let Err(err) = net.queue_xmit(frame, sim) {
            warn!(conn = ?self.id, path = ?self.path, seq = seg.seq, ?err, "出口拒绝发送");
            let err = XmitError::from(err);
            if err == XmitError::Congested {
                self.enter_cwr(true, now);
            }
            return Err(err);
        }

        if flags.contains(TcpFlags::ACK) {
            self.event_ack_sent();
        }
        if has_data {
            self.lsndtime = now;
            if now.saturating_sub(self.ack.lrcvtime) < self.ack.ato {
                self.ack.pingpong = true;
            }
        }
        if let Some(rcv_wnd) = new_rcv_wnd {
            self.commit_window(rcv_wnd);
        }
        if cwr_sent {
            self.ecn.queue_cwr = false;
        }
        if !opts.addrs.is_empty()
            && let Some(mp) = self.mp.as_mut()
        {
            let n = opts.addrs.len().min(mp.addrs_unsent.len());
            mp.addrs_unsent.drain(..n);
        }

        let stats = net.stats_mut();
        if after(seg.end_seq, self.snd_nxt) || seg.seq == seg.end_seq {
            stats.out_segs += 1;
        }
        stats.out_bytes += u64::from(seg.len());
        self.segs_out += 1;
        trace!(seq = seg.seq, end_seq = seg.end_seq, ?flags, header_len, "段已交给出口");
        Ok(())
    }

    fn syn_out_options(&self, tsval: u32) -> super::options::OutOptions {
        let advmss = self.advertise_mss() as u16;
        let wscale = self.cfg.window_scaling.then_some(self.opts.rcv_wscale);
        syn_options(&self.opts, self.mp.as_ref(), advmss, tsval, self.cfg.sack, wscale)
    }

    /// SYN 里通告的 MSS
    pub fn advertise_mss(&self) -> u32 {
        self.advmss
    }

    fn event_ack_sent(&mut self) {
        self.ack.pending = false;
        self.ack.blocked = false;
        self.clear_timer(TimerKind::DelayedAck);
    }

    /// send_head 指向的段已发出：推进 snd_nxt 与在途计数
    pub fn event_new_data_sent(&mut self, sim: &mut Simulator) {
        let Some(idx) = self.queue.send_head() else {
            return;
        };
        let Some(seg) = self.queue.get(idx) else {
            return;
        };
        let (end_seq, pcount) = (seg.end_seq, seg.pcount);
        let prior_packets = self.counters.packets_out;

        self.queue.advance_send_head();
        self.snd_nxt = end_seq;
        self.counters.packets_out += pcount;

        if prior_packets == 0 {
            let (rto, max) = (self.rto, self.cfg.rto_max());
            self.reset_timer(TimerKind::Retransmit, rto, max, sim);
        }
    }

    /// 记录最近一个小段
    pub fn minshall_update(&mut self, mss_now: u32, seg: &Segment) {
        if seg.len() < mss_now {
            self.snd_sml = seg.end_seq;
        }
    }

    /// 从 send_head 开始尽可能多地发送。
    ///
    /// 返回 true 表示什么都没发出、网络里也没有在途数据、但还有数据待发，
    /// 调用方需要启动零窗口探测。
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id, path = ?self.path))]
    pub fn write_xmit(
        &mut self,
        mss_now: u32,
        nonagle: u8,
        push_one: bool,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> bool {
        assert!(!self.in_write_xmit, "write path re-entered on {:?}/{:?}", self.id, self.path);
        if self.is_closed() {
            return false;
        }
        self.in_write_xmit = true;

        let mut sent_pkts = 0u32;
        if !push_one {
            match self.mtu_probe(net, sim) {
                ProbeOutcome::Wait => {
                    self.in_write_xmit = false;
                    return false;
                }
                ProbeOutcome::Sent => sent_pkts = 1,
                ProbeOutcome::NotProbing => {}
            }
        }

        while let Some(idx) = self.queue.send_head() {
            let offload = self.can_gso();
            let in_flight = self.in_flight();
            let cwnd = self.cong.cwnd;
            let wnd_end = self.wnd_end();
            let forced = self.nagle_forced();
            let small = self.small_outstanding();
            let last = self.queue.is_last(idx);
            let Some(seg) = self.queue.get_mut(idx) else {
                break;
            };

            let tso_segs = init_tso_segs(seg, mss_now, offload);
            if cwnd_test(in_flight, cwnd, seg) == 0 {
                trace!(in_flight, cwnd, "拥塞窗口已满");
                break;
            }
            if !snd_wnd_test(seg, seg.seq, seg.end_seq, wnd_end, mss_now) {
                trace!(seq = seg.seq, wnd_end, "超出对端窗口");
                break;
            }
            if tso_segs == 1 {
                let eff = if last { nonagle } else { NAGLE_PUSH };
                if !nagle_test(seg, mss_now, eff, forced, small) {
                    trace!(len = seg.len(), "Nagle 扣住小段");
                    break;
                }
            }

            if seg.len() > mss_now
                && tso_fragment(&mut self.queue, idx, mss_now, mss_now, offload).is_err()
            {
                break;
            }

            let now = sim.now();
            let Some(seg) = self.queue.get_mut(idx) else {
                break;
            };
            seg.when = now;
            let seg = seg.clone();
            if self.transmit(&seg, false, net, sim).is_err() {
                break;
            }
            self.event_new_data_sent(sim);
            self.minshall_update(mss_now, &seg);
            sent_pkts += 1;
            self.cwnd_validate(now);

            if push_one {
                break;
            }
        }

        self.in_write_xmit = false;
        if sent_pkts > 0 {
            return false;
        }
        self.counters.packets_out == 0 && self.queue.send_head().is_some()
    }

    /// 没有在途数据也没有挂着的定时器时，启动零窗口探测
    pub fn check_probe_timer(&mut self, sim: &mut Simulator) {
        if self.counters.packets_out == 0 && !self.timers.xmit.is_armed() {
            let (rto, max) = (self.rto, self.cfg.rto_max());
            self.reset_timer(TimerKind::Probe0, rto, max, sim);
        }
    }

    /// 把被 cork/Nagle 扣住的段推出去
    pub fn push_pending_frames(
        &mut self,
        cur_mss: u32,
        nonagle: u8,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) {
        if self.queue.send_head().is_none() {
            return;
        }
        if self.write_xmit(cur_mss, nonagle, false, net, sim) {
            self.check_probe_timer(sim);
        }
    }

    /// 按当前 MSS 与 Nagle 设置推送
    pub fn push(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        let mss = self.send_mss(net);
        let nonagle = self.nonagle;
        self.push_pending_frames(mss, nonagle, net, sim);
    }

    /// 只发送 send_head 这一个段（忽略 Nagle）
    pub fn push_one(&mut self, mss_now: u32, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.queue.send_head().is_none() {
            return;
        }
        self.write_xmit(mss_now, NAGLE_PUSH, true, net, sim);
    }

    fn forced_push(&self) -> bool {
        after(self.write_seq, self.pushed_seq.wrapping_add(self.max_window >> 1))
    }

    fn mark_push(&mut self) {
        if let Some(tail) = self.queue.back_mut() {
            tail.flags |= TcpFlags::PSH;
        }
        self.pushed_seq = self.write_seq;
    }

    /// 应用写入：返回接受的字节数（发送缓冲满时少于 `data.len()`，可能为 0）
    pub fn send(
        &mut self,
        data: &[u8],
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> Result<usize, XmitError> {
        if !matches!(self.state, TcpState::Established | TcpState::SynSent) {
            return Err(XmitError::Closed);
        }
        let mss_now = self.current_mss_large(net, true);
        let goal = self.xmit_size_goal.max(1) as usize;

        let mut copied = 0usize;
        while copied < data.len() {
            let remaining = data.len() - copied;
            let tail_room = match (self.queue.send_head(), self.queue.back()) {
                (Some(_), Some(tail))
                    if !tail.flags.intersects(TcpFlags::FIN | TcpFlags::SYN)
                        && (tail.len() as usize) < goal =>
                {
                    Some(goal - tail.len() as usize)
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
                    self.write_seq = self.write_seq.wrapping_add(n as u32);
                    n
                }
                None => {
                    let n = goal.min(remaining);
                    if !self.queue.has_room(n + SEG_OVERHEAD) {
                        break;
                    }
                    let seg = Segment::new(
                        self.write_seq,
                        data[copied..copied + n].to_vec(),
                        TcpFlags::ACK,
                    );
                    self.queue_segment(seg);
                    n
                }
            };
            copied += n;
            if self.forced_push() {
                self.mark_push();
            }
        }

        if copied > 0 {
            self.mark_push();
            let nonagle = self.nonagle;
            self.push_pending_frames(mss_now, nonagle, net, sim);
        } else {
            debug!(conn = ?self.id, wmem = self.queue.wmem_queued(), "发送缓冲已满");
        }
        Ok(copied)
    }
}
