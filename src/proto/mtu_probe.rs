//! 路径 MTU 探测
//!
//! 搜索策略很简单：把 MSS 翻倍。探测段的字节从写队列前部“借”来（被借的段缩短或移除），
//! 不占用额外的序列空间。探测成功后抬高下界；失败后压低上界，探测段按普通尺寸重传。

use tracing::{debug, info};

use crate::net::{NetApi, TcpFlags};
use crate::sim::{SimTime, Simulator};

use super::congestion::CaState;
use super::segment::Segment;
use super::seq::after;
use super::sock::TcpSock;

/// 一次探测尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 不满足探测条件，照常发送
    NotProbing,
    /// 条件将满足，先别发普通段
    Wait,
    /// 探测段已发出
    Sent,
}

impl TcpSock {
    /// 尝试构造并发送一个探测段
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id, path = ?self.path))]
    pub fn mtu_probe(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) -> ProbeOutcome {
        if !self.mtup.enabled
            || self.mtup.probe_size != 0
            || self.ca_state != CaState::Open
            || self.cong.cwnd < 11
            || !self.opts.sack_blocks.is_empty()
            || self.is_mp()
        {
            return ProbeOutcome::NotProbing;
        }

        let mss_now = self.current_mss(net);
        let probe_size = 2 * self.mss_cache;
        let size_needed = probe_size + (self.reordering + 1) * self.mss_cache;
        if probe_size > self.mtu_to_mss(self.mtup.search_high) {
            return ProbeOutcome::NotProbing;
        }
        if self.write_seq.wrapping_sub(self.snd_nxt) < size_needed {
            return ProbeOutcome::NotProbing;
        }
        if self.snd_wnd < size_needed {
            return ProbeOutcome::NotProbing;
        }
        if after(self.snd_nxt.wrapping_add(size_needed), self.wnd_end()) {
            return ProbeOutcome::Wait;
        }
        let in_flight = self.in_flight();
        if in_flight + 2 > self.cong.cwnd {
            return if in_flight == 0 {
                ProbeOutcome::NotProbing
            } else {
                ProbeOutcome::Wait
            };
        }

        let Some(head) = self.queue.send_head() else {
            return ProbeOutcome::NotProbing;
        };
        if !self.queue.can_alloc() {
            return ProbeOutcome::NotProbing;
        }

        // 从 send_head 起搬出 probe_size 字节
        let offload = self.can_gso();
        let Some(first) = self.queue.get(head) else {
            return ProbeOutcome::NotProbing;
        };
        let seq = first.seq;
        let mut payload = Vec::with_capacity(probe_size as usize);
        let mut flags = TcpFlags::ACK;
        while (payload.len() as u32) < probe_size {
            let Some(seg) = self.queue.get(head) else {
                break;
            };
            let copy = seg.len().min(probe_size - payload.len() as u32);
            payload.extend_from_slice(&seg.payload()[..copy as usize]);
            if seg.len() <= copy {
                flags |= seg.flags;
                self.queue.remove(head);
            } else {
                flags |= seg.flags.without(TcpFlags::FIN | TcpFlags::PSH);
                self.queue.modify(head, |s| s.trim_front(copy, mss_now, offload));
            }
        }

        let mut probe = Segment::new(seq, payload, flags);
        probe.set_tso_segs(probe.len(), offload);
        probe.when = sim.now();
        // 被搬空的段已摘除，探测段放回原 send_head 位置
        self.queue.insert_before(head, probe.clone());
        self.queue.set_send_head(Some(head));

        if self.transmit(&probe, false, net, sim).is_ok() {
            // 实际上发出了两个包的数据
            self.cong.cwnd = self.cong.cwnd.saturating_sub(1);
            self.event_new_data_sent(sim);
            self.mtup.probe_size = self.mss_to_mtu(probe.len());
            self.mtup.probe_seq_start = probe.seq;
            self.mtup.probe_seq_end = probe.end_seq;
            net.stats_mut().mtu_probes += 1;
            info!(probe_mtu = self.mtup.probe_size, seq = probe.seq, "发出 PMTU 探测段");
            return ProbeOutcome::Sent;
        }
        debug!("探测段发送失败，留给普通发送按 MSS 切分");
        ProbeOutcome::NotProbing
    }

    /// 探测段被确认：新的 MTU 可用
    pub fn mtup_probe_success(&mut self, now: SimTime) {
        let probe_size = self.mtup.probe_size;
        if probe_size == 0 {
            return;
        }
        self.prior_ssthresh = self.current_ssthresh();
        self.cong.cwnd = (u64::from(self.cong.cwnd) * u64::from(self.mss_to_mtu(self.mss_cache))
            / u64::from(probe_size))
        .max(1) as u32;
        self.cong.cnt = 0;
        self.cong.stamp = now;
        self.cong.ssthresh = self.current_ssthresh();

        self.mtup.search_low = probe_size;
        self.mtup.probe_size = 0;
        let pmtu = self.pmtu_cookie;
        self.sync_mss(pmtu);
        info!(conn = ?self.id, path = ?self.path, search_low = self.mtup.search_low, mss = self.mss_cache, "PMTU 探测成功");
    }

    /// 探测段丢失：这个尺寸不可用
    pub fn mtup_probe_failed(&mut self) {
        if self.mtup.probe_size == 0 {
            return;
        }
        self.mtup.search_high = self.mtup.probe_size - 1;
        self.mtup.probe_size = 0;
        info!(conn = ?self.id, path = ?self.path, search_high = self.mtup.search_high, "PMTU 探测失败");
    }
}
