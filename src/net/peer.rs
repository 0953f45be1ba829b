//! 对端模型
//!
//! 一个只会确认的接收端：按路径维护累计确认点和乱序区间（用于 SACK），
//! 多路径连接另外按数据序号维护连接级确认点。收到 SYN 回一个能力协商结果，
//! 收到数据或 FIN 回一个 [`AckSignal`]。应用读取是即时的，通告窗口保持不变。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::mptcp::idsn_for_token;
use crate::proto::options::{self, ParsedOption};
use crate::proto::{AckSignal, PeerSyn, SackBlock, after, before};

use super::frame::{Frame, TcpFlags, TcpHeader};
use super::id::{ConnId, PathIndex};

/// 对端的接收能力
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
    /// 通告窗口（字节）
    pub window: u32,
    pub wscale: u8,
    pub mss: u16,
    pub sack: bool,
    pub timestamps: bool,
    pub ecn: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            window: 256 * 1024,
            wscale: 3,
            mss: 1460,
            sack: true,
            timestamps: true,
            ecn: false,
        }
    }
}

/// 一个序列空间上的接收状态
#[derive(Debug, Clone)]
struct RecvRange {
    nxt: u32,
    ooo: Vec<(u32, u32)>,
}

impl RecvRange {
    fn new(nxt: u32) -> Self {
        Self { nxt, ooo: Vec::new() }
    }

    fn insert(&mut self, start: u32, end: u32) {
        if !after(end, self.nxt) {
            return;
        }
        if after(start, self.nxt) {
            self.ooo.push((start, end));
            return;
        }
        self.nxt = end;
        loop {
            let mut nxt = self.nxt;
            let before_len = self.ooo.len();
            self.ooo.retain(|&(s, e)| {
                if after(s, nxt) {
                    return true;
                }
                if after(e, nxt) {
                    nxt = e;
                }
                false
            });
            self.nxt = nxt;
            if self.ooo.len() == before_len {
                break;
            }
        }
    }

    /// 乱序区间合并后的 SACK 块，最多 `max` 个
    fn sack_blocks(&self, max: usize) -> Vec<SackBlock> {
        let mut ranges = self.ooo.clone();
        let base = self.nxt;
        ranges.sort_by_key(|&(s, _)| s.wrapping_sub(base));
        let mut out: Vec<SackBlock> = Vec::new();
        for (s, e) in ranges {
            match out.last_mut() {
                Some(last) if !after(s, last.end) => {
                    if after(e, last.end) {
                        last.end = e;
                    }
                }
                _ => out.push(SackBlock { start: s, end: e }),
            }
        }
        out.truncate(max);
        out
    }
}

#[derive(Debug, Clone)]
struct PeerSubflow {
    /// 发送端的初始序列号，接收区间从它 + 1 开始
    rcv_isn: u32,
    range: RecvRange,
    sack_ok: bool,
    wscale: u8,
    fin: bool,
}

#[derive(Debug, Clone, Default)]
struct PeerConn {
    subflows: HashMap<PathIndex, PeerSubflow>,
    /// 多路径连接：连接级接收状态与起点
    data: Option<(u32, RecvRange)>,
    data_fin_at: Option<u32>,
    data_fin: bool,
    reset: bool,
}

/// 接收端统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    /// 按序收到的应用字节
    pub bytes: u64,
    pub fin: bool,
    pub reset: bool,
}

#[derive(Debug, Default)]
pub struct Peer {
    pub cfg: PeerConfig,
    conns: HashMap<ConnId, PeerConn>,
}

impl Peer {
    pub fn new(cfg: PeerConfig) -> Self {
        Self {
            cfg,
            conns: HashMap::new(),
        }
    }

    /// 接收端视角的连接摘要
    pub fn report(&self, conn: ConnId) -> PeerReport {
        let Some(c) = self.conns.get(&conn) else {
            return PeerReport::default();
        };
        match &c.data {
            Some((idsn, range)) => {
                let fin = c.data_fin;
                PeerReport {
                    bytes: u64::from(range.nxt.wrapping_sub(*idsn)) - u64::from(fin),
                    fin,
                    reset: c.reset,
                }
            }
            None => {
                let Some(sf) = c.subflows.get(&PathIndex::MASTER) else {
                    return PeerReport::default();
                };
                let consumed = sf.range.nxt.wrapping_sub(sf.rcv_isn.wrapping_add(1));
                PeerReport {
                    bytes: u64::from(consumed) - u64::from(sf.fin),
                    fin: sf.fin,
                    reset: c.reset,
                }
            }
        }
    }

    fn wire_window(&self, wscale: u8) -> u16 {
        (self.cfg.window >> wscale).min(u32::from(u16::MAX)) as u16
    }

    /// 收到一帧；需要回确认时返回它
    pub fn receive(&mut self, frame: &Frame) -> Option<AckSignal> {
        if !frame.checksum_ok() {
            warn!(conn = ?frame.conn, path = ?frame.path, "校验和错误，丢弃");
            return None;
        }
        let (hdr, raw_opts, payload) = match TcpHeader::parse(frame.buf.data()) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(conn = ?frame.conn, ?err, "无法解析的帧");
                return None;
            }
        };
        let opts = match options::parse(raw_opts) {
            Ok(opts) => opts,
            Err(err) => {
                warn!(conn = ?frame.conn, ?err, "无法解析的选项");
                return None;
            }
        };

        if hdr.flags.contains(TcpFlags::RST) {
            debug!(conn = ?frame.conn, "对端收到 RST");
            self.conns.entry(frame.conn).or_default().reset = true;
            return None;
        }
        if hdr.flags.contains(TcpFlags::SYN) {
            return Some(self.on_syn(frame, &hdr, &opts));
        }

        let wnd = {
            let conn = self.conns.get(&frame.conn)?;
            let sf = conn.subflows.get(&frame.path)?;
            self.wire_window(sf.wscale)
        };
        let conn = self.conns.get_mut(&frame.conn)?;
        let sf = conn.subflows.get_mut(&frame.path)?;

        let fin = hdr.flags.contains(TcpFlags::FIN);
        if payload.is_empty() && !fin {
            // 纯 ACK / 窗口探测
            if before(hdr.seq, sf.range.nxt) {
                let mut sig = AckSignal::new(sf.range.nxt, wnd);
                sig.data_ack = conn.data.as_ref().map(|(_, r)| r.nxt);
                return Some(sig);
            }
            return None;
        }

        let end = hdr
            .seq
            .wrapping_add(payload.len() as u32)
            .wrapping_add(u32::from(fin));
        sf.range.insert(hdr.seq, end);
        if fin && sf.range.nxt == end {
            sf.fin = true;
        }
        trace!(conn = ?frame.conn, path = ?frame.path, seq = hdr.seq, end, rcv_nxt = sf.range.nxt, "对端收到数据");

        let mut sig = AckSignal::new(sf.range.nxt, wnd);
        if sf.sack_ok {
            sig.sacks = sf.range.sack_blocks(3);
        }

        if let Some((_, data)) = conn.data.as_mut() {
            let mut mapping = None;
            let mut dfin = false;
            for opt in &opts {
                match opt {
                    ParsedOption::DataSeq(m) => mapping = Some(*m),
                    ParsedOption::DataFin => dfin = true,
                    _ => {}
                }
            }
            // 未映射的段（子流自己的 FIN）不携带连接级数据
            if let Some(m) = mapping.filter(|m| m.data_len > 0 || m.data_seq != 0 || m.sub_seq != 0) {
                let dend = m.data_seq.wrapping_add(u32::from(m.data_len));
                if m.data_len > 0 {
                    data.insert(m.data_seq, dend);
                }
                if dfin && (fin || m.data_len > 0) {
                    conn.data_fin_at = Some(dend);
                }
            }
            if let Some(at) = conn.data_fin_at
                && !conn.data_fin
                && data.nxt == at
            {
                data.nxt = at.wrapping_add(1);
                conn.data_fin = true;
                debug!(conn = ?frame.conn, "对端收到 data FIN");
            }
            sig.data_ack = Some(data.nxt);
        }
        Some(sig)
    }

    fn on_syn(&mut self, frame: &Frame, hdr: &TcpHeader, opts: &[ParsedOption]) -> AckSignal {
        let mut mss = 0u16;
        let mut offered_ws = false;
        let mut sack = false;
        let mut tstamp = false;
        let mut token = None;
        let mut join = false;
        for opt in opts {
            match opt {
                ParsedOption::Mss(m) => mss = *m,
                ParsedOption::WindowScale(_) => offered_ws = true,
                ParsedOption::SackPermitted => sack = true,
                ParsedOption::Timestamp { .. } => tstamp = true,
                ParsedOption::MpCapable { token: t } => token = Some(*t),
                ParsedOption::MpJoin { .. } => join = true,
                _ => {}
            }
        }

        let isn = 0x4000_0000u32.wrapping_add(u32::from(frame.path.0) << 20);
        let wscale = if offered_ws { self.cfg.wscale } else { 0 };
        let syn = PeerSyn {
            isn,
            mss: if mss == 0 { self.cfg.mss } else { mss.min(self.cfg.mss) },
            wscale: offered_ws.then_some(self.cfg.wscale),
            sack_ok: sack && self.cfg.sack,
            tstamp_ok: tstamp && self.cfg.timestamps,
            ecn: self.cfg.ecn && hdr.flags.contains(TcpFlags::ECE | TcpFlags::CWR),
        };

        let conn = self.conns.entry(frame.conn).or_default();
        if let Some(token) = token
            && conn.data.is_none()
        {
            let idsn = idsn_for_token(token);
            conn.data = Some((idsn, RecvRange::new(idsn)));
        }
        conn.subflows.insert(
            frame.path,
            PeerSubflow {
                rcv_isn: hdr.seq,
                range: RecvRange::new(hdr.seq.wrapping_add(1)),
                sack_ok: syn.sack_ok,
                wscale,
                fin: false,
            },
        );
        debug!(conn = ?frame.conn, path = ?frame.path, mp = token.is_some() || join, "对端应答 SYN");

        AckSignal {
            ack: hdr.seq.wrapping_add(1),
            wnd: self.cfg.window.min(u32::from(u16::MAX)) as u16,
            syn: Some(syn),
            data_ack: conn.data.as_ref().map(|(_, r)| r.nxt),
            ..AckSignal::default()
        }
    }
}
