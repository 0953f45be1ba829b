//! 重传与丢包恢复
//!
//! 两个入口：
//! - 重传超时：进入 Loss，把所有未被选择确认的已发送段标记为丢失，重传队首并退避 RTO
//! - 恢复阶段（由接收侧信号触发）：重传被判定丢失的段；没有新数据可发时允许前向重传
//!
//! 重传遍历从缓存的提示位置开始，每次最多用满一个拥塞窗口。

use tracing::{debug, info, trace, warn};

use crate::error::XmitError;
use crate::net::{NetApi, TcpFlags};
use crate::sim::{SimTime, Simulator};

use super::congestion::{CaEvent, CaState};
use super::fragment::{fragment, trim_head, try_collapse};
use super::segment::Sacked;
use super::seq::{after, before};
use super::sock::{TcpSock, adjust};
use super::timer::TimerKind;

impl TcpSock {
    /// 某段的分段数变化 `diff`（减少为正）时同步修正在途计数
    pub(super) fn adjust_pcount(&mut self, sacked: Sacked, diff: i64) {
        if diff == 0 {
            return;
        }
        let c = &mut self.counters;
        adjust(&mut c.packets_out, diff);
        if sacked.contains(Sacked::SACKED_RETRANS) {
            adjust(&mut c.retrans_out, diff);
        }
        if sacked.contains(Sacked::LOST) {
            adjust(&mut c.lost_out, diff);
        }
        if sacked.contains(Sacked::SACKED_ACKED) {
            adjust(&mut c.sacked_out, diff);
        }
    }

    /// 重传写队列中第 `idx` 段。
    ///
    /// 同一段连续重传两次不会重复计入 `retrans_out`。
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id, path = ?self.path))]
    pub fn retransmit_skb(
        &mut self,
        idx: usize,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> Result<(), XmitError> {
        // 重传说明探测段那个尺寸的信息不可信了
        self.mtup.probe_size = 0;
        let offload = self.can_gso();

        let cur_mss = if self.is_mp() {
            self.cfg.mptcp_mss
        } else {
            self.current_mss(net)
        };

        let Some(seg) = self.queue.get(idx) else {
            return Ok(());
        };
        if before(seg.seq, self.snd_una) {
            assert!(
                after(seg.end_seq, self.snd_una),
                "retransmitting a fully acknowledged segment {}..{} (snd_una {})",
                seg.seq,
                seg.end_seq,
                self.snd_una
            );
            let (cut, sacked) = (self.snd_una.wrapping_sub(seg.seq), seg.sacked);
            let diff = trim_head(&mut self.queue, idx, cut, cur_mss, offload);
            self.adjust_pcount(sacked, diff);
        }

        if net.route(self.id, self.path).is_none() {
            warn!(conn = ?self.id, path = ?self.path, "重传时路由失败");
            return Err(XmitError::HostUnreachable);
        }

        let (data_space, wnd_end) = match self.mp.as_ref() {
            Some(mp) => (true, mp.data_wnd_end),
            None => (false, self.wnd_end()),
        };

        let Some(seg) = self.queue.get(idx) else {
            return Ok(());
        };
        let start = if data_space { seg.data_seq } else { seg.seq };
        // 对端收缩了窗口：段已在窗口外，除非它就是 snd_una 处的段
        if !before(start, wnd_end) && seg.seq != self.snd_una {
            trace!(start, wnd_end, "重传段位于窗口之外");
            return Err(XmitError::Again);
        }

        if seg.len() > cur_mss {
            let snd_nxt = self.snd_nxt;
            fragment(
                &mut self.queue,
                &mut self.counters,
                snd_nxt,
                idx,
                cur_mss,
                cur_mss,
                offload,
            )?;
        }

        if let (Some(seg), Some(next)) = (self.queue.get(idx), self.queue.get(idx + 1))
            && self.cfg.retrans_collapse
            && !seg.has(TcpFlags::SYN)
            && seg.len() < cur_mss / 2
            && self.queue.send_head() != Some(idx + 1)
            && seg.pcount == 1
            && next.pcount == 1
        {
            try_collapse(
                &mut self.queue,
                &mut self.counters,
                idx,
                wnd_end,
                data_space,
                cur_mss,
                offload,
            );
        }

        // 对端只差 FIN 未确认：只重传 FIN
        if let Some(seg) = self.queue.get(idx)
            && !seg.is_empty()
            && seg.has(TcpFlags::FIN)
            && self.snd_una == seg.end_seq.wrapping_sub(1)
        {
            let (sacked, old) = (seg.sacked, seg.pcount);
            self.queue.modify(idx, |s| s.strip_to_fin());
            self.adjust_pcount(sacked, i64::from(old) - 1);
        }

        let now = sim.now();
        let Some(seg) = self.queue.get_mut(idx) else {
            return Ok(());
        };
        seg.when = now;
        let out = seg.clone();
        self.transmit(&out, true, net, sim)?;

        net.stats_mut().retrans_segs += 1;
        self.total_retrans += 1;
        let snd_nxt = self.snd_nxt;
        let flag = self.path.flag();
        if let Some(seg) = self.queue.get_mut(idx) {
            if !seg.sacked.contains(Sacked::SACKED_RETRANS) {
                self.counters.retrans_out += seg.pcount;
            }
            seg.sacked.insert(Sacked::RETRANS);
            seg.ack_seq = snd_nxt;
            seg.path_mask |= flag;
        }
        if self.retrans_stamp.is_none() {
            self.retrans_stamp = Some(now);
        }
        debug!(seq = out.seq, end_seq = out.end_seq, retrans_out = self.counters.retrans_out, "段已重传");
        Ok(())
    }

    /// 是否允许越过第一个空洞做前向重传：只在恢复阶段、协作者允许、且没有新数据可发时
    fn can_forward_retransmit(&mut self, cur_mss: u32) -> bool {
        self.ca_state == CaState::Recovery && self.forward_retransmit && !self.may_send_now(cur_mss)
    }

    /// 重传被判定丢失的段，必要时继续做前向重传。
    ///
    /// 每发一个段前检查在途数是否已达拥塞窗口；任何一次重传失败都立即返回。
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id, path = ?self.path))]
    pub fn xmit_retransmit_queue(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.counters.lost_out == 0 {
            self.retransmit_high = self.snd_una;
        }
        let cur_mss = self.send_mss(net);

        let (mut idx, mut last_lost) = match self.queue.hints.retransmit {
            Some(h) if h < self.queue.sent_len() => {
                let end = self.queue.get(h).map_or(self.snd_una, |s| s.end_seq);
                let last = if after(end, self.retransmit_high) {
                    self.retransmit_high
                } else {
                    end
                };
                (h, last)
            }
            _ => (0, self.snd_una),
        };
        let mut hole: Option<usize> = None;
        let mut forwarding = false;

        while idx < self.queue.sent_len() {
            let Some(seg) = self.queue.get(idx) else {
                break;
            };
            let (seq, end_seq, sacked) = (seg.seq, seg.end_seq, seg.sacked);
            if hole.is_none() {
                self.queue.hints.retransmit = Some(idx);
            }
            // 每次重传按一个包计：retransmit_skb 会把段切到 MSS
            if self.in_flight() >= self.cong.cwnd {
                return;
            }

            let forward;
            if forwarding {
                if !before(seq, self.highest_sack_seq()) {
                    break;
                }
                forward = true;
            } else if !before(seq, self.retransmit_high) {
                self.retransmit_high = last_lost;
                if !self.can_forward_retransmit(cur_mss) {
                    break;
                }
                forwarding = true;
                if let Some(h) = hole.take() {
                    idx = h;
                }
                continue;
            } else if !sacked.contains(Sacked::LOST) {
                if hole.is_none() && !sacked.intersects(Sacked::SACKED_RETRANS | Sacked::SACKED_ACKED) {
                    hole = Some(idx);
                }
                idx += 1;
                continue;
            } else {
                last_lost = end_seq;
                forward = false;
            }

            if sacked.intersects(Sacked::SACKED_ACKED | Sacked::SACKED_RETRANS) {
                idx += 1;
                continue;
            }
            if self.retransmit_skb(idx, net, sim).is_err() {
                return;
            }
            let stats = net.stats_mut();
            if forward {
                stats.forward_retrans += 1;
            } else if self.ca_state != CaState::Loss {
                stats.fast_retrans += 1;
            } else {
                stats.slow_start_retrans += 1;
            }
            if idx == 0 {
                let (rto, max) = (self.rto, self.cfg.rto_max());
                self.reset_timer(TimerKind::Retransmit, rto, max, sim);
            }
            idx += 1;
        }
    }

    fn verify_retransmit_hint(&mut self, idx: usize, end_seq: u32) {
        if self.queue.hints.retransmit.is_none_or(|h| idx < h) {
            self.queue.hints.retransmit = Some(idx);
        }
        if self.counters.lost_out == 0 || after(end_seq, self.retransmit_high) {
            self.retransmit_high = end_seq;
        }
    }

    /// 丢包检测协作者判定第 `idx` 段丢失
    pub fn mark_lost(&mut self, idx: usize) {
        if idx >= self.queue.sent_len() {
            return;
        }
        let Some(seg) = self.queue.get(idx) else {
            return;
        };
        let (end_seq, sacked, pcount) = (seg.end_seq, seg.sacked, seg.pcount);
        self.verify_retransmit_hint(idx, end_seq);
        if !sacked.intersects(Sacked::LOST | Sacked::SACKED_ACKED) {
            self.counters.lost_out += pcount;
            if let Some(seg) = self.queue.get_mut(idx) {
                seg.sacked.insert(Sacked::LOST);
            }
        }
    }

    /// 对端选择确认了 `[start, end)`：完全落在其中的已发送段打上标记。返回新确认的包数。
    pub fn mark_sacked(&mut self, start: u32, end: u32) -> u32 {
        let mut newly = 0;
        for idx in 0..self.queue.sent_len() {
            let Some(seg) = self.queue.get_mut(idx) else {
                break;
            };
            if before(seg.seq, start) || after(seg.end_seq, end) {
                continue;
            }
            if seg.sacked.contains(Sacked::SACKED_ACKED) {
                continue;
            }
            let pcount = seg.pcount;
            if seg.sacked.contains(Sacked::SACKED_RETRANS) {
                self.counters.retrans_out = self.counters.retrans_out.saturating_sub(pcount);
            }
            if seg.sacked.contains(Sacked::LOST) {
                self.counters.lost_out = self.counters.lost_out.saturating_sub(pcount);
            }
            seg.sacked.remove(Sacked::SACKED_RETRANS | Sacked::LOST);
            seg.sacked.insert(Sacked::SACKED_ACKED);
            self.counters.sacked_out += pcount;
            newly += pcount;
            let seg_end = seg.end_seq;
            if self.highest_sack.is_none_or(|h| after(seg_end, h)) {
                self.highest_sack = Some(seg_end);
            }
        }
        newly
    }

    /// 进入快速恢复。`forward_allowed` 由丢包检测协作者决定。
    pub fn enter_recovery(&mut self, forward_allowed: bool, now: SimTime) {
        if self.ca_state < CaState::Cwr {
            self.prior_ssthresh = self.current_ssthresh();
        }
        if self.ca_state != CaState::Cwr {
            self.cong.ssthresh = self.ca.ssthresh(&self.cong);
        }
        self.cong.cnt = 0;
        self.cong.stamp = now;
        self.high_seq = self.snd_nxt;
        self.forward_retransmit = forward_allowed;
        self.set_ca_state(CaState::Recovery);
        if self.counters.lost_out == 0 {
            self.mark_lost(0);
        }
        info!(conn = ?self.id, path = ?self.path, ssthresh = self.cong.ssthresh, forward_allowed, "进入快速恢复");
    }

    /// 重传超时：所有未被选择确认的已发送段都算丢失，窗口降到 1
    pub fn enter_loss(&mut self, now: SimTime) {
        if self.ca_state <= CaState::Disorder || self.snd_una == self.high_seq {
            self.prior_ssthresh = self.current_ssthresh();
            self.cong.ssthresh = self.ca.ssthresh(&self.cong);
            self.ca.cwnd_event(CaEvent::Loss);
        }
        self.cong.cwnd = 1;
        self.cong.cnt = 0;
        self.cong.stamp = now;

        self.counters.retrans_out = 0;
        self.counters.lost_out = 0;
        for idx in 0..self.queue.sent_len() {
            let Some(seg) = self.queue.get_mut(idx) else {
                break;
            };
            seg.sacked = seg.sacked.masked(Sacked::SACKED_ACKED | Sacked::EVER_RETRANS);
            if !seg.sacked.contains(Sacked::SACKED_ACKED) {
                seg.sacked.insert(Sacked::LOST);
                self.counters.lost_out += seg.pcount;
                self.retransmit_high = seg.end_seq;
            }
        }

        self.high_seq = self.snd_nxt;
        self.recovery_override = false;
        self.set_ca_state(CaState::Loss);
        self.queue.clear_hints();
        info!(conn = ?self.id, path = ?self.path, lost_out = self.counters.lost_out, ssthresh = self.cong.ssthresh, "重传超时，进入 Loss");
    }

    /// 路径 MTU 变小：超过新 MSS 的已发送段全部重传，不动拥塞窗口
    pub fn simple_retransmit(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        let mss = self.send_mss(net);
        let prior_lost = self.counters.lost_out;

        for idx in 0..self.queue.sent_len() {
            let Some(seg) = self.queue.get_mut(idx) else {
                break;
            };
            let seglen = if seg.pcount == 1 { seg.len() } else { seg.gso_size };
            if seglen <= mss || seg.sacked.contains(Sacked::SACKED_ACKED) {
                continue;
            }
            if seg.sacked.contains(Sacked::SACKED_RETRANS) {
                seg.sacked.remove(Sacked::SACKED_RETRANS);
                let pcount = seg.pcount;
                self.counters.retrans_out = self.counters.retrans_out.saturating_sub(pcount);
            }
            self.mark_lost(idx);
        }
        self.queue.hints.retransmit = None;

        if prior_lost == self.counters.lost_out {
            return;
        }
        if self.ca_state != CaState::Loss {
            self.high_seq = self.snd_nxt;
            self.cong.ssthresh = self.current_ssthresh();
            self.prior_ssthresh = 0;
            self.set_ca_state(CaState::Loss);
        }
        debug!(conn = ?self.id, path = ?self.path, mss, lost_out = self.counters.lost_out, "MTU 变小，重传超长段");
        self.xmit_retransmit_queue(net, sim);
    }

    /// 重传定时器到期
    #[tracing::instrument(level = "debug", skip(self, net, sim), fields(conn = ?self.id, path = ?self.path))]
    pub fn on_retransmit_timeout(&mut self, net: &mut dyn NetApi, sim: &mut Simulator) {
        if self.counters.packets_out == 0 || self.queue.sent_len() == 0 {
            return;
        }
        let now = sim.now();

        if self.mtup.probe_size != 0 && self.snd_una == self.mtup.probe_seq_start {
            self.mtup_probe_failed();
            self.cong.cwnd += 1;
            self.simple_retransmit(net, sim);
        } else {
            self.enter_loss(now);
            if let Err(err) = self.retransmit_skb(0, net, sim) {
                // 本地原因失败：不退避，稍后再试
                let when = self.rto.min(self.cfg.resource_probe_interval());
                let max = self.cfg.rto_max();
                warn!(conn = ?self.id, path = ?self.path, ?err, "超时重传失败，稍后重试");
                self.reset_timer(TimerKind::Retransmit, when, max, sim);
                return;
            }
            net.stats_mut().slow_start_retrans += 1;
        }

        self.backoff += 1;
        self.rto = self.rto.backoff(1).min(self.cfg.rto_max());
        let (rto, max) = (self.rto, self.cfg.rto_max());
        self.reset_timer(TimerKind::Retransmit, rto, max, sim);
    }
}
