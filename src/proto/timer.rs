//! 发送侧定时器
//!
//! 定时器就是仿真器里的事件，携带一个代数：每次重新设置或取消都会让代数加一，
//! 于是旧事件触发时发现代数对不上，直接忽略。
//! 重传与零窗口探测共用一个槽（同一时刻只会有一个在等）。

use tracing::trace;

use crate::net::{ConnId, NetApi, PathIndex, with_stack};
use crate::sim::{Event, SimTime, Simulator, World};

use super::sock::TcpSock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retransmit,
    Probe0,
    DelayedAck,
    FinRetry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSlot {
    pub pending: Option<TimerKind>,
    pub deadline: Option<SimTime>,
    generation: u64,
}

impl TimerSlot {
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn arm(&mut self, kind: TimerKind, at: SimTime) -> u64 {
        self.generation += 1;
        self.pending = Some(kind);
        self.deadline = Some(at);
        self.generation
    }

    fn clear(&mut self) {
        self.generation += 1;
        self.pending = None;
        self.deadline = None;
    }

    /// 触发时校验：只有最新一次设置的事件才算数
    fn fire(&mut self, kind: TimerKind, generation: u64) -> bool {
        if self.generation != generation || self.pending != Some(kind) {
            return false;
        }
        self.pending = None;
        self.deadline = None;
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timers {
    /// 重传 / 零窗口探测
    pub xmit: TimerSlot,
    pub delack: TimerSlot,
    pub fin_retry: TimerSlot,
}

impl Timers {
    pub fn slot(&self, kind: TimerKind) -> &TimerSlot {
        match kind {
            TimerKind::Retransmit | TimerKind::Probe0 => &self.xmit,
            TimerKind::DelayedAck => &self.delack,
            TimerKind::FinRetry => &self.fin_retry,
        }
    }

    fn slot_mut(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Retransmit | TimerKind::Probe0 => &mut self.xmit,
            TimerKind::DelayedAck => &mut self.delack,
            TimerKind::FinRetry => &mut self.fin_retry,
        }
    }
}

impl TcpSock {
    /// 设置（或重设）定时器，时长不超过 `max_when`
    pub fn reset_timer(&mut self, kind: TimerKind, when: SimTime, max_when: SimTime, sim: &mut Simulator) {
        let when = when.min(max_when);
        let at = sim.now() + when;
        let generation = self.timers.slot_mut(kind).arm(kind, at);
        trace!(conn = ?self.id, path = ?self.path, ?kind, at = %at, generation, "设置定时器");
        sim.schedule(
            at,
            XmitTimer {
                conn: self.id,
                path: self.path,
                kind,
                generation,
            },
        );
    }

    pub fn clear_timer(&mut self, kind: TimerKind) {
        let slot = self.timers.slot_mut(kind);
        if slot.pending == Some(kind) {
            slot.clear();
        }
    }

    /// 定时器事件到达；返回它是否仍然有效
    pub fn timer_fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        self.timers.slot_mut(kind).fire(kind, generation)
    }

    pub fn timer_pending(&self, kind: TimerKind) -> bool {
        self.timers.slot(kind).pending == Some(kind)
    }

    /// 到期定时器的处理（代数已校验过）
    pub fn on_timer_expired(&mut self, kind: TimerKind, net: &mut dyn NetApi, sim: &mut Simulator) {
        trace!(conn = ?self.id, path = ?self.path, ?kind, "定时器到期");
        match kind {
            TimerKind::Retransmit => self.on_retransmit_timeout(net, sim),
            TimerKind::Probe0 => self.send_probe0(net, sim),
            TimerKind::DelayedAck => {
                if self.ack.pending {
                    self.send_ack(net, sim);
                }
            }
            TimerKind::FinRetry => self.send_fin(net, sim),
        }
    }

    /// 有在途数据就（重新）启动重传定时器，否则取消
    pub fn rearm_rto(&mut self, sim: &mut Simulator) {
        if self.counters.packets_out == 0 {
            self.clear_timer(TimerKind::Retransmit);
        } else {
            let rto = self.rto;
            let max = self.cfg.rto_max();
            self.reset_timer(TimerKind::Retransmit, rto, max, sim);
        }
    }
}

/// 定时器到期事件
pub struct XmitTimer {
    pub conn: ConnId,
    pub path: PathIndex,
    pub kind: TimerKind,
    pub generation: u64,
}

impl Event for XmitTimer {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let XmitTimer {
            conn,
            path,
            kind,
            generation,
        } = *self;
        with_stack(world, |net, stack| {
            stack.on_timer(conn, path, kind, generation, net, sim);
        });
    }
}
