//! TCP 发送引擎
//!
//! 写队列、发送准入、分片合并、选项编排、重传与恢复、定时器、MTU 探测。
//! 单路径连接与多路径子流共用这一套；连接级聚合在 `crate::mptcp`。

mod admission;
mod congestion;
mod control;
mod fragment;
mod input;
mod mss;
mod mtu_probe;
pub mod options;
mod output;
mod retransmit;
mod segment;
mod seq;
mod sock;
mod stack;
mod timer;
mod window;
mod write_queue;

pub use admission::{
    NAGLE_CORK, NAGLE_OFF, NAGLE_PUSH, cwnd_test, init_tso_segs, minshall_check, nagle_check,
    nagle_test, snd_wnd_test,
};
pub use congestion::{CaEvent, CaState, CongestionOps, CwndState, Reno};
pub use fragment::{fragment, fragment_to_limit, trim_head, try_collapse, tso_fragment};
pub use input::{AckOutcome, AckSignal, PeerSyn};
pub use mtu_probe::ProbeOutcome;
pub use options::{AddrAdvert, DataMapping, MpContext, NegotiatedOptions, OutOptions, SackBlock};
pub use segment::{SEG_OVERHEAD, Sacked, Segment};
pub use seq::{after, before, between, seq_min};
pub use sock::{Counters, DelayedAck, EcnFlags, MtuProbe, TCP_MSS_DEFAULT, TcpSock, TcpState};
pub use stack::{Endpoint, TcpStack};
pub use timer::{TimerKind, TimerSlot, Timers, XmitTimer};
pub use window::{InitialWindow, MAX_SIGNED_WINDOW, MAX_WSCALE, select_initial_window, win_from_space};
pub use write_queue::{RetransHints, WriteQueue};
