//! 测试夹具：路由、socket、以及“握手已完成”的连接。

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use crate::config::XmitConfig;
use crate::error::EgressError;
use crate::net::{ConnId, Frame, NetApi, Network, PathIndex, RouteInfo, Stats};
use crate::proto::{AckSignal, PeerSyn, TcpSock, TcpState};
use crate::sim::Simulator;

mod admission;
mod congestion;
mod mptcp;
mod retransmit;
mod segment_queue;
mod window;

pub(crate) const CONN: ConnId = ConnId(7);
pub(crate) const PEER_ISN: u32 = 0x0a00_0000;

/// 关掉时间戳，MSS 就等于 pmtu - 40
pub(crate) fn cfg_with(f: impl FnOnce(&mut XmitConfig)) -> Arc<XmitConfig> {
    let mut cfg = XmitConfig {
        timestamps: false,
        ..XmitConfig::default()
    };
    f(&mut cfg);
    Arc::new(cfg)
}

pub(crate) fn cfg() -> Arc<XmitConfig> {
    cfg_with(|_| {})
}

pub(crate) fn route(pmtu: u32) -> RouteInfo {
    RouteInfo {
        pmtu,
        ..RouteInfo::default()
    }
}

pub(crate) fn path(idx: u8) -> PathIndex {
    PathIndex::new(idx).expect("valid path index")
}

pub(crate) fn network(paths: &[(u8, u32)]) -> Network {
    let mut net = Network::default();
    for &(p, pmtu) in paths {
        net.set_route(CONN, path(p), route(pmtu));
    }
    net
}

pub(crate) fn iss_for(p: PathIndex) -> u32 {
    1_000 * u32::from(p.0)
}

pub(crate) fn sock(p: PathIndex, cfg: &Arc<XmitConfig>) -> TcpSock {
    let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, p.0, 1), 40_000 + u16::from(p.0));
    let remote = SocketAddrV4::new(Ipv4Addr::new(10, 1, 0, 1), 80);
    TcpSock::new(CONN, p, local, remote, Arc::clone(cfg), iss_for(p))
}

pub(crate) fn peer_syn() -> PeerSyn {
    PeerSyn {
        isn: PEER_ISN,
        mss: 1460,
        wscale: Some(0),
        sack_ok: true,
        tstamp_ok: false,
        ecn: false,
    }
}

pub(crate) fn syn_ack(sock: &TcpSock, wnd: u16) -> AckSignal {
    AckSignal {
        syn: Some(peer_syn()),
        ..AckSignal::new(sock.iss.wrapping_add(1), wnd)
    }
}

/// 发 SYN、收 SYN-ACK
pub(crate) fn establish_on(sock: &mut TcpSock, net: &mut dyn NetApi, sim: &mut Simulator, wnd: u16) {
    sock.connect(net, sim).expect("connect");
    let sig = syn_ack(sock, wnd);
    let out = sock.on_ack(&sig, net, sim);
    assert!(out.established, "SYN-ACK should establish the connection");
    assert_eq!(sock.state, TcpState::Established);
}

/// 同上，结束时清空出口记录与计数
pub(crate) fn establish(sock: &mut TcpSock, net: &mut Network, sim: &mut Simulator, wnd: u16) {
    establish_on(sock, net, sim, wnd);
    net.sent.clear();
    net.stats = Stats::default();
}

/// 单路径、已建立、mss = pmtu - 40 的连接
pub(crate) fn established_sock(pmtu: u32, cwnd: u32) -> (TcpSock, Network, Simulator) {
    let cfg = cfg();
    let mut net = network(&[(1, pmtu)]);
    let mut sim = Simulator::default();
    let mut s = sock(PathIndex::MASTER, &cfg);
    establish(&mut s, &mut net, &mut sim, u16::MAX);
    s.cong.cwnd = cwnd;
    (s, net, sim)
}

/// 记录完整帧的出口，其余行为委托给 [`Network`]
#[derive(Default)]
pub(crate) struct CaptureNet {
    pub inner: Network,
    pub frames: Vec<Frame>,
}

impl NetApi for CaptureNet {
    fn route(&self, conn: ConnId, path: PathIndex) -> Option<RouteInfo> {
        self.inner.route(conn, path)
    }

    fn queue_xmit(&mut self, frame: Frame, sim: &mut Simulator) -> Result<(), EgressError> {
        let copy = frame.clone();
        self.inner.queue_xmit(frame, sim)?;
        self.frames.push(copy);
        Ok(())
    }

    fn has_signature_key(&self, conn: ConnId) -> bool {
        self.inner.has_signature_key(conn)
    }

    fn sign(&self, conn: ConnId, header: &[u8], payload: &[u8]) -> [u8; 16] {
        self.inner.sign(conn, header, payload)
    }

    fn stats_mut(&mut self) -> &mut Stats {
        self.inner.stats_mut()
    }
}
