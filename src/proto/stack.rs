//! 连接表
//!
//! 按连接标识保存发送端：单路径连接就是一个 [`TcpSock`]，多路径连接是一个
//! [`MetaSock`] 及其子流。ACK 到达、定时器到期、应用写入/关闭都从这里分派。

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::XmitError;
use crate::mptcp::MetaSock;
use crate::net::{ConnId, NetApi, PathIndex};
use crate::sim::Simulator;

use super::input::{AckOutcome, AckSignal};
use super::sock::TcpSock;
use super::timer::TimerKind;

#[derive(Debug)]
pub enum Endpoint {
    Single(TcpSock),
    Multipath(MetaSock),
}

impl Endpoint {
    pub fn id(&self) -> ConnId {
        match self {
            Endpoint::Single(sock) => sock.id,
            Endpoint::Multipath(meta) => meta.id,
        }
    }

    pub fn subflow(&self, path: PathIndex) -> Option<&TcpSock> {
        match self {
            Endpoint::Single(sock) => (sock.path == path).then_some(sock),
            Endpoint::Multipath(meta) => meta.subflow(path),
        }
    }

    pub fn subflow_mut(&mut self, path: PathIndex) -> Option<&mut TcpSock> {
        match self {
            Endpoint::Single(sock) => (sock.path == path).then_some(sock),
            Endpoint::Multipath(meta) => meta.subflow_mut(path),
        }
    }
}

impl From<TcpSock> for Endpoint {
    fn from(sock: TcpSock) -> Self {
        Endpoint::Single(sock)
    }
}

impl From<MetaSock> for Endpoint {
    fn from(meta: MetaSock) -> Self {
        Endpoint::Multipath(meta)
    }
}

#[derive(Debug, Default)]
pub struct TcpStack {
    conns: HashMap<ConnId, Endpoint>,
}

impl TcpStack {
    pub fn insert(&mut self, ep: impl Into<Endpoint>) {
        let ep = ep.into();
        self.conns.insert(ep.id(), ep);
    }

    pub fn get(&self, id: ConnId) -> Option<&Endpoint> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Endpoint> {
        self.conns.get_mut(&id)
    }

    pub fn single(&self, id: ConnId) -> Option<&TcpSock> {
        match self.conns.get(&id)? {
            Endpoint::Single(sock) => Some(sock),
            Endpoint::Multipath(_) => None,
        }
    }

    pub fn meta(&self, id: ConnId) -> Option<&MetaSock> {
        match self.conns.get(&id)? {
            Endpoint::Multipath(meta) => Some(meta),
            Endpoint::Single(_) => None,
        }
    }

    pub fn conns(&self) -> impl Iterator<Item = &Endpoint> {
        self.conns.values()
    }

    pub fn connect(&mut self, id: ConnId, net: &mut dyn NetApi, sim: &mut Simulator) -> Result<(), XmitError> {
        match self.conns.get_mut(&id).ok_or(XmitError::Closed)? {
            Endpoint::Single(sock) => sock.connect(net, sim),
            Endpoint::Multipath(meta) => meta.connect(net, sim),
        }
    }

    /// 应用写入
    pub fn send(
        &mut self,
        id: ConnId,
        data: &[u8],
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> Result<usize, XmitError> {
        match self.conns.get_mut(&id).ok_or(XmitError::Closed)? {
            Endpoint::Single(sock) => sock.send(data, net, sim),
            Endpoint::Multipath(meta) => meta.send(data, net, sim),
        }
    }

    /// 应用关闭发送方向
    pub fn close(&mut self, id: ConnId, net: &mut dyn NetApi, sim: &mut Simulator) {
        let Some(ep) = self.conns.get_mut(&id) else {
            return;
        };
        debug!(conn = ?id, "应用关闭");
        match ep {
            Endpoint::Single(sock) => sock.send_fin(net, sim),
            Endpoint::Multipath(meta) => meta.close(net, sim),
        }
    }

    pub fn on_ack(
        &mut self,
        conn: ConnId,
        path: PathIndex,
        sig: &AckSignal,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) -> AckOutcome {
        match self.conns.get_mut(&conn) {
            Some(Endpoint::Single(sock)) if sock.path == path => sock.on_ack(sig, net, sim),
            Some(Endpoint::Multipath(meta)) => meta.on_ack(path, sig, net, sim),
            _ => {
                trace!(?conn, ?path, "ACK 对应的连接不存在");
                AckOutcome::default()
            }
        }
    }

    pub fn on_timer(
        &mut self,
        conn: ConnId,
        path: PathIndex,
        kind: TimerKind,
        generation: u64,
        net: &mut dyn NetApi,
        sim: &mut Simulator,
    ) {
        match self.conns.get_mut(&conn) {
            Some(Endpoint::Single(sock)) if sock.path == path => {
                if sock.timer_fired(kind, generation) {
                    sock.on_timer_expired(kind, net, sim);
                }
            }
            Some(Endpoint::Multipath(meta)) => meta.on_subflow_timer(path, kind, generation, net, sim),
            _ => {}
        }
    }
}
