//! 单路径连接（也用作多路径连接的子流）
//!
//! 这里只放状态与简单的派生量；发送、分片、重传、探测等操作分散在同级模块的
//! `impl TcpSock` 块里。

use std::net::SocketAddrV4;
use std::sync::Arc;

use serde::Serialize;

use crate::config::XmitConfig;
use crate::net::{ConnId, PathIndex};
use crate::sim::SimTime;

use super::admission::NAGLE_OFF;
use super::congestion::{CaState, CongestionOps, CwndState, Reno};
use super::options::{MpContext, NegotiatedOptions};
use super::seq::{after, before};
use super::timer::Timers;
use super::write_queue::WriteQueue;

/// 未协商时的默认 MSS
pub const TCP_MSS_DEFAULT: u32 = 536;

/// 连接状态（只区分发送侧关心的几个）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TcpState {
    Closed,
    SynSent,
    Established,
    /// 本端 FIN 已排队/发出，尚未被确认
    FinWait1,
    /// 本端 FIN 已被确认
    FinWait2,
}

/// 在途包计数（单位：分段卸载意义下的包）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub packets_out: u32,
    pub retrans_out: u32,
    pub lost_out: u32,
    pub sacked_out: u32,
}

impl Counters {
    pub fn left_out(&self) -> u32 {
        self.sacked_out + self.lost_out
    }

    /// 仍被认为在网络中的包数
    pub fn in_flight(&self) -> u32 {
        self.packets_out.saturating_sub(self.left_out()) + self.retrans_out
    }
}

/// 按带符号差额调整计数
pub(crate) fn adjust(counter: &mut u32, diff: i64) {
    *counter = (i64::from(*counter) - diff).clamp(0, i64::from(u32::MAX)) as u32;
}

/// PMTU 探测状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MtuProbe {
    pub enabled: bool,
    /// 已知可用的最大 MTU
    pub search_low: u32,
    /// 尚未证伪的最大 MTU
    pub search_high: u32,
    /// 在途探测段对应的 MTU（0 表示没有探测）
    pub probe_size: u32,
    pub probe_seq_start: u32,
    pub probe_seq_end: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EcnFlags {
    pub ok: bool,
    /// 下一个数据段带 CWR
    pub queue_cwr: bool,
    /// 回显 ECE
    pub demand_cwr: bool,
}

/// 延迟确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedAck {
    pub pending: bool,
    pub ato: SimTime,
    pub pingpong: bool,
    pub pushed: bool,
    /// 确认因被锁占用而推迟过
    pub blocked: bool,
    pub lrcvtime: SimTime,
}

impl Default for DelayedAck {
    fn default() -> Self {
        Self {
            pending: false,
            ato: SimTime::ZERO,
            pingpong: false,
            pushed: false,
            blocked: false,
            lrcvtime: SimTime::ZERO,
        }
    }
}

#[derive(Debug)]
pub struct TcpSock {
    pub id: ConnId,
    pub path: PathIndex,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub cfg: Arc<XmitConfig>,
    pub state: TcpState,

    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    /// 最近一个小段的结束序号（Minshall）
    pub snd_sml: u32,
    pub snd_up: u32,
    pub write_seq: u32,
    pub pushed_seq: u32,
    pub snd_wnd: u32,
    pub max_window: u32,

    pub rcv_nxt: u32,
    pub rcv_wup: u32,
    pub rcv_wnd: u32,
    pub rcv_ssthresh: u32,
    pub window_clamp: u32,
    pub rcv_mss: u32,
    /// 接收侧已占用、尚未被应用读走的字节
    pub rcv_queued: u32,

    pub cong: CwndState,
    pub ca_state: CaState,
    pub ca: Box<dyn CongestionOps>,
    pub counters: Counters,
    pub prior_ssthresh: u32,
    pub high_seq: u32,
    pub retransmit_high: u32,
    pub reordering: u32,
    pub init_cwnd: u32,
    pub lsndtime: SimTime,
    pub retrans_stamp: Option<SimTime>,
    pub total_retrans: u32,
    /// 连续重复确认数
    pub dup_acks: u32,

    pub srtt: SimTime,
    pub rttvar: SimTime,
    pub rto: SimTime,
    pub backoff: u32,
    pub probes_out: u32,

    pub mss_cache: u32,
    pub advmss: u32,
    pub xmit_size_goal: u32,
    pub tcp_header_len: u32,
    pub net_header_len: u32,
    pub ext_header_len: u32,
    pub pmtu_cookie: u32,
    pub gso_max_size: Option<u32>,
    pub mtup: MtuProbe,
    pub opts: NegotiatedOptions,
    pub ecn: EcnFlags,

    pub queue: WriteQueue,
    pub nonagle: u8,
    pub urg_mode: bool,
    /// 恢复阶段要求立即发出（绕过 Nagle）
    pub recovery_override: bool,
    /// 丢包检测协作者给出的“允许前向重传”
    pub forward_retransmit: bool,
    /// 最高被选择确认的序号边界
    pub highest_sack: Option<u32>,

    pub ack: DelayedAck,
    pub timers: Timers,
    pub fin_retries: u32,
    pub(crate) in_write_xmit: bool,

    /// 作为多路径子流时的连接级上下文
    pub mp: Option<MpContext>,
    pub segs_out: u64,
}

impl TcpSock {
    pub fn new(
        id: ConnId,
        path: PathIndex,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        cfg: Arc<XmitConfig>,
        iss: u32,
    ) -> Self {
        let nonagle = if cfg.nagle { 0 } else { NAGLE_OFF };
        Self {
            id,
            path,
            local,
            remote,
            state: TcpState::Closed,

            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_sml: iss,
            snd_up: iss,
            write_seq: iss,
            pushed_seq: iss,
            snd_wnd: 0,
            max_window: 0,

            rcv_nxt: 0,
            rcv_wup: 0,
            rcv_wnd: 0,
            rcv_ssthresh: 0,
            window_clamp: 0,
            rcv_mss: TCP_MSS_DEFAULT,
            rcv_queued: 0,

            cong: CwndState::new(cfg.init_cwnd),
            ca_state: CaState::Open,
            ca: Box::new(Reno),
            counters: Counters::default(),
            prior_ssthresh: 0,
            high_seq: iss,
            retransmit_high: iss,
            reordering: 3,
            init_cwnd: cfg.init_cwnd,
            lsndtime: SimTime::ZERO,
            retrans_stamp: None,
            total_retrans: 0,
            dup_acks: 0,

            srtt: SimTime::ZERO,
            rttvar: SimTime::ZERO,
            rto: cfg.rto_init(),
            backoff: 0,
            probes_out: 0,

            mss_cache: TCP_MSS_DEFAULT,
            advmss: TCP_MSS_DEFAULT,
            xmit_size_goal: TCP_MSS_DEFAULT,
            tcp_header_len: 20,
            net_header_len: 20,
            ext_header_len: 0,
            pmtu_cookie: 0,
            gso_max_size: None,
            mtup: MtuProbe::default(),
            opts: NegotiatedOptions {
                mss_clamp: TCP_MSS_DEFAULT,
                ..NegotiatedOptions::default()
            },
            ecn: EcnFlags::default(),

            queue: WriteQueue::new(cfg.sndbuf),
            nonagle,
            urg_mode: false,
            recovery_override: false,
            forward_retransmit: false,
            highest_sack: None,

            ack: DelayedAck::default(),
            timers: Timers::default(),
            fin_retries: 0,
            in_write_xmit: false,

            mp: None,
            segs_out: 0,
            cfg,
        }
    }

    /// 作为多路径子流
    pub fn with_mp(mut self, mp: MpContext) -> Self {
        self.mp = Some(mp);
        self
    }

    /// 换用另一种拥塞控制算法
    pub fn with_congestion(mut self, ca: Box<dyn CongestionOps>) -> Self {
        self.ca = ca;
        self
    }

    pub fn is_mp(&self) -> bool {
        self.mp.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// 可以继续发送数据的状态
    pub fn is_sending(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::FinWait1)
    }

    /// 对端允许我们发送到的序号（不含）
    pub fn wnd_end(&self) -> u32 {
        self.snd_una.wrapping_add(self.snd_wnd)
    }

    /// 控制段可以使用的序号：不越过对端窗口
    pub fn acceptable_seq(&self) -> u32 {
        if !after(self.snd_nxt, self.wnd_end()) {
            self.snd_nxt
        } else {
            self.wnd_end()
        }
    }

    pub fn can_gso(&self) -> bool {
        self.gso_max_size.is_some()
    }

    /// 在途包数
    pub fn in_flight(&self) -> u32 {
        self.counters.in_flight()
    }

    /// 时间戳选项使用的毫秒时钟
    pub fn tcp_time_stamp(now: SimTime) -> u32 {
        now.as_millis() as u32
    }

    /// 最高 SACK 位置（没有 SACK 时为 snd_una）
    pub fn highest_sack_seq(&self) -> u32 {
        if self.counters.sacked_out == 0 {
            return self.snd_una;
        }
        self.highest_sack.unwrap_or(self.snd_nxt)
    }

    /// 紧急指针仍在窗口内
    pub fn urg_pending(&self) -> bool {
        self.urg_mode && before(self.snd_una, self.snd_up)
    }

    /// 已发送未确认的字节数
    pub fn bytes_in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }
}
