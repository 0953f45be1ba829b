//! 拥塞控制接口与发送侧的拥塞簿记
//!
//! 具体的窗口调整策略由可插拔的 [`CongestionOps`] 提供（这里只带一个 Reno 参考实现）；
//! 发送引擎只负责：空闲后重启窗口、出口拥塞时进入 CWR、应用受限时衰减窗口。

use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::sim::SimTime;

use super::sock::TcpSock;

/// 拥塞状态机的状态（内部迁移规则不在本引擎范围内，只读取与少量设置）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CaState {
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
}

/// 通知拥塞算法的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaEvent {
    /// 从无数据在途到开始发送
    TxStart,
    /// 空闲后重启窗口
    CwndRestart,
    /// 窗口缩减结束
    CompleteCwr,
    /// 超时丢包
    Loss,
}

/// 拥塞窗口相关的可变状态（单位：包）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CwndState {
    pub cwnd: u32,
    pub ssthresh: u32,
    /// 拥塞避免阶段的线性增长计数
    pub cnt: u32,
    pub clamp: u32,
    /// 应用受限期间实际用到的窗口
    pub used: u32,
    /// 最近一次窗口被校验/调整的时间
    #[serde(skip)]
    pub stamp: SimTime,
}

impl CwndState {
    pub fn new(init_cwnd: u32) -> Self {
        Self {
            cwnd: init_cwnd,
            ssthresh: 0x7fff_ffff,
            cnt: 0,
            clamp: u32::MAX,
            used: 0,
            stamp: SimTime::ZERO,
        }
    }
}

/// 可插拔拥塞控制算法
pub trait CongestionOps: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// 丢包后的慢启动阈值
    fn ssthresh(&self, w: &CwndState) -> u32;

    /// 收到新确认时增长窗口
    fn cong_avoid(&mut self, w: &mut CwndState, acked: u32);

    /// 窗口的下限（CWR 结束时使用）
    fn min_cwnd(&self, w: &CwndState) -> u32 {
        w.ssthresh
    }

    fn cwnd_event(&mut self, _ev: CaEvent) {}
}

/// 经典 Reno：慢启动 + 每 RTT 加一
#[derive(Debug, Default, Clone)]
pub struct Reno;

impl CongestionOps for Reno {
    fn name(&self) -> &'static str {
        "reno"
    }

    fn ssthresh(&self, w: &CwndState) -> u32 {
        (w.cwnd >> 1).max(2)
    }

    fn cong_avoid(&mut self, w: &mut CwndState, acked: u32) {
        if w.cwnd < w.ssthresh {
            w.cwnd = w.cwnd.saturating_add(acked).min(w.clamp);
            return;
        }
        w.cnt = w.cnt.saturating_add(acked);
        if w.cnt >= w.cwnd {
            w.cnt -= w.cwnd;
            if w.cwnd < w.clamp {
                w.cwnd += 1;
            }
        }
    }

    fn min_cwnd(&self, w: &CwndState) -> u32 {
        w.ssthresh / 2
    }
}

impl TcpSock {
    pub fn set_ca_state(&mut self, state: CaState) {
        if self.ca_state != state {
            debug!(conn = ?self.id, path = ?self.path, from = ?self.ca_state, to = ?state, "拥塞状态迁移");
        }
        self.ca_state = state;
    }

    /// 即将进入缩减时应当采用的 ssthresh
    pub fn current_ssthresh(&self) -> u32 {
        if matches!(self.ca_state, CaState::Cwr | CaState::Recovery) {
            self.cong.ssthresh
        } else {
            self.cong
                .ssthresh
                .max((self.cong.cwnd >> 1) + (self.cong.cwnd >> 2))
        }
    }

    /// 出口拥塞或 ECN 回显：把窗口压到在途数 + 1
    pub fn enter_cwr(&mut self, set_ssthresh: bool, now: SimTime) {
        self.prior_ssthresh = 0;
        if self.ca_state < CaState::Cwr {
            if set_ssthresh {
                self.cong.ssthresh = self.ca.ssthresh(&self.cong);
            }
            self.cong.cwnd = self
                .cong
                .cwnd
                .min(self.counters.in_flight() + 1)
                .max(1);
            self.cong.cnt = 0;
            self.high_seq = self.snd_nxt;
            self.cong.stamp = now;
            self.ecn.queue_cwr = self.ecn.ok;
            info!(conn = ?self.id, path = ?self.path, cwnd = self.cong.cwnd, ssthresh = self.cong.ssthresh, "进入 CWR");
            self.set_ca_state(CaState::Cwr);
        }
    }

    /// CWR/Recovery 结束：窗口落到 ssthresh 以内
    pub fn complete_cwr(&mut self, now: SimTime) {
        self.cong.cwnd = self.cong.cwnd.min(self.cong.ssthresh).max(1);
        self.cong.stamp = now;
        self.ca.cwnd_event(CaEvent::CompleteCwr);
    }

    /// 空闲超过一个 RTO 后，每个 RTO 把窗口减半，直到初始窗口
    pub fn cwnd_restart(&mut self, now: SimTime) {
        let restart_cwnd = self.init_cwnd.min(self.cong.cwnd);
        let mut delta = now.saturating_sub(self.lsndtime);
        let mut cwnd = self.cong.cwnd;

        self.ca.cwnd_event(CaEvent::CwndRestart);
        self.cong.ssthresh = self.current_ssthresh();

        while delta > self.rto && cwnd > restart_cwnd {
            cwnd >>= 1;
            delta = delta.saturating_sub(self.rto);
        }
        self.cong.cwnd = cwnd.max(restart_cwnd);
        self.cong.stamp = now;
        self.cong.used = 0;
        debug!(conn = ?self.id, path = ?self.path, cwnd = self.cong.cwnd, "空闲后重启拥塞窗口");
    }

    /// 应用受限：按实际使用量收缩窗口
    pub fn cwnd_application_limited(&mut self, now: SimTime) {
        if self.ca_state == CaState::Open && self.counters.packets_out < self.cong.cwnd {
            let win_used = self.cong.used.max(2);
            if win_used < self.cong.cwnd {
                self.cong.ssthresh = self.current_ssthresh();
                self.cong.cwnd = (self.cong.cwnd + win_used) >> 1;
            }
            self.cong.used = 0;
        }
        self.cong.stamp = now;
    }

    /// 每次发送后校验窗口是否被充分利用
    pub fn cwnd_validate(&mut self, now: SimTime) {
        if self.counters.packets_out >= self.cong.cwnd {
            self.cong.used = 0;
            self.cong.stamp = now;
        } else {
            if self.counters.packets_out > self.cong.used {
                self.cong.used = self.counters.packets_out;
            }
            if self.cfg.slow_start_after_idle && now.saturating_sub(self.cong.stamp) >= self.rto {
                self.cwnd_application_limited(now);
            }
        }
    }
}
