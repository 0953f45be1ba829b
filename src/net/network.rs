//! 出口网络
//!
//! 发送引擎的出口协作者：按 (连接, 路径) 保存路由信息，记录每个发出的帧，
//! 支持注入一次性的出口错误与周期性丢包，并可把帧延迟交付给对端模型。

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::api::{NetApi, RouteInfo};
use super::deliver_frame::DeliverFrame;
use super::frame::Frame;
use super::id::{ConnId, PathIndex};
use super::stats::Stats;
use crate::error::EgressError;
use crate::sim::Simulator;

/// 出口看到的一帧（解析后的摘要）
#[derive(Debug, Clone, Serialize)]
pub struct SentFrame {
    pub id: u64,
    pub at_ns: u64,
    pub conn: ConnId,
    pub path: PathIndex,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub len: u32,
    pub retransmit: bool,
    #[serde(skip)]
    pub options: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct LossPattern {
    every: u64,
    seen: u64,
}

type PathKey = (ConnId, PathIndex);

/// 记录式出口网络
#[derive(Default)]
pub struct Network {
    routes: HashMap<PathKey, RouteInfo>,
    faults: HashMap<PathKey, VecDeque<EgressError>>,
    loss: HashMap<PathKey, LossPattern>,
    keys: HashMap<ConnId, Vec<u8>>,
    next_frame_id: u64,
    /// 为 true 时把帧（按路由时延）交付给对端模型
    pub deliver: bool,
    pub sent: Vec<SentFrame>,
    pub stats: Stats,
}

impl Network {
    pub fn set_route(&mut self, conn: ConnId, path: PathIndex, info: RouteInfo) {
        self.routes.insert((conn, path), info);
    }

    pub fn remove_route(&mut self, conn: ConnId, path: PathIndex) -> Option<RouteInfo> {
        self.routes.remove(&(conn, path))
    }

    pub fn route_mut(&mut self, conn: ConnId, path: PathIndex) -> Option<&mut RouteInfo> {
        self.routes.get_mut(&(conn, path))
    }

    /// 让该路径接下来的一次 `queue_xmit` 返回 `err`
    pub fn inject_fault(&mut self, conn: ConnId, path: PathIndex, err: EgressError) {
        self.faults.entry((conn, path)).or_default().push_back(err);
    }

    /// 该路径上每 `every` 个数据帧静默丢弃一个（0 关闭）
    pub fn set_drop_every(&mut self, conn: ConnId, path: PathIndex, every: u64) {
        if every == 0 {
            self.loss.remove(&(conn, path));
        } else {
            self.loss.insert((conn, path), LossPattern { every, seen: 0 });
        }
    }

    pub fn set_signature_key(&mut self, conn: ConnId, key: impl Into<Vec<u8>>) {
        self.keys.insert(conn, key.into());
    }

    /// 某条路径上发出的帧
    pub fn sent_on(&self, conn: ConnId, path: PathIndex) -> impl Iterator<Item = &SentFrame> {
        self.sent
            .iter()
            .filter(move |f| f.conn == conn && f.path == path)
    }

    fn should_drop(&mut self, key: PathKey, has_data: bool) -> bool {
        let Some(p) = self.loss.get_mut(&key) else {
            return false;
        };
        if !has_data {
            return false;
        }
        p.seen += 1;
        p.seen % p.every == 0
    }
}

impl NetApi for Network {
    fn route(&self, conn: ConnId, path: PathIndex) -> Option<RouteInfo> {
        self.routes.get(&(conn, path)).copied()
    }

    #[tracing::instrument(level = "trace", skip(self, frame, sim), fields(conn = ?frame.conn, path = ?frame.path))]
    fn queue_xmit(&mut self, frame: Frame, sim: &mut Simulator) -> Result<(), EgressError> {
        let key = (frame.conn, frame.path);
        if let Some(err) = self.faults.get_mut(&key).and_then(|q| q.pop_front()) {
            warn!(?err, "出口注入错误");
            match err {
                EgressError::Congested => self.stats.egress_congested += 1,
                EgressError::Unreachable => self.stats.egress_unreachable += 1,
            }
            return Err(err);
        }
        let Some(route) = self.routes.get(&key).copied() else {
            self.stats.egress_unreachable += 1;
            return Err(EgressError::Unreachable);
        };

        let hdr = frame
            .header()
            .expect("frame built by the transmit path has a valid header");
        let len = frame.payload().len() as u32;
        let id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        trace!(id, seq = hdr.seq, len, flags = ?hdr.flags, "出口发送");
        self.sent.push(SentFrame {
            id,
            at_ns: sim.now().0,
            conn: frame.conn,
            path: frame.path,
            seq: hdr.seq,
            ack: hdr.ack,
            flags: hdr.flags.bits(),
            window: hdr.window,
            len,
            retransmit: frame.retransmit,
            options: frame.options().to_vec(),
        });

        if self.deliver {
            if self.should_drop(key, len > 0) {
                debug!(id, seq = hdr.seq, "路径丢包");
                self.stats.dropped_frames += 1;
            } else {
                sim.schedule_in(route.latency, DeliverFrame { frame });
            }
        }
        Ok(())
    }

    fn has_signature_key(&self, conn: ConnId) -> bool {
        self.keys.contains_key(&conn)
    }

    fn sign(&self, conn: ConnId, header: &[u8], payload: &[u8]) -> [u8; 16] {
        // 占位摘要：两路 FNV-1a，足以让测试检查字节被放到了预留位置
        let key = self.keys.get(&conn).map(Vec::as_slice).unwrap_or(&[]);
        let mut lo: u64 = 0xcbf2_9ce4_8422_2325;
        let mut hi: u64 = 0x8422_2325_cbf2_9ce4;
        for b in key.iter().chain(header).chain(payload) {
            lo = (lo ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3);
            hi = (hi ^ u64::from(!*b)).wrapping_mul(0x0000_0100_0000_01b3);
        }
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&lo.to_be_bytes());
        out[8..].copy_from_slice(&hi.to_be_bytes());
        out
    }

    fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }
}
