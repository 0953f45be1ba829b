//! 选项编码
//!
//! 把协商得到的能力集编码进头部的选项空间。写入顺序固定：
//! 签名占位、MSS、(SACK-permitted+时间戳 / 时间戳 / SACK-permitted)、窗口缩放、
//! SACK 块、多路径 capable、join、地址通告、数据序列映射、数据确认、数据 FIN。
//! 总长度永远不超过 40 字节；空间不够时先裁掉地址通告与多余的 SACK 块。

use std::net::Ipv4Addr;

use crate::net::{FrameError, MAX_OPTION_SPACE, TcpFlags};

use super::segment::Segment;

pub const TCPOPT_EOL: u8 = 0;
pub const TCPOPT_NOP: u8 = 1;
pub const TCPOPT_MSS: u8 = 2;
pub const TCPOPT_WINDOW: u8 = 3;
pub const TCPOPT_SACK_PERM: u8 = 4;
pub const TCPOPT_SACK: u8 = 5;
pub const TCPOPT_TIMESTAMP: u8 = 8;
pub const TCPOPT_SIGNATURE: u8 = 19;
pub const TCPOPT_MPC: u8 = 30;
pub const TCPOPT_JOIN: u8 = 31;
pub const TCPOPT_ADDR: u8 = 32;
pub const TCPOPT_DSN: u8 = 33;
pub const TCPOPT_DATA_ACK: u8 = 34;
pub const TCPOPT_DFIN: u8 = 35;

pub const TCPOLEN_MSS: u8 = 4;
pub const TCPOLEN_WINDOW: u8 = 3;
pub const TCPOLEN_SACK_PERM: u8 = 2;
pub const TCPOLEN_TIMESTAMP: u8 = 10;
pub const TCPOLEN_SIGNATURE: u8 = 18;
pub const TCPOLEN_SACK_BASE: usize = 2;
pub const TCPOLEN_SACK_PERBLOCK: usize = 8;
pub const TCPOLEN_MPC: u8 = 7;
pub const TCPOLEN_JOIN: u8 = 7;
pub const TCPOLEN_ADDR_BASE: usize = 2;
pub const TCPOLEN_ADDR_PERBLOCK: usize = 6;
pub const TCPOLEN_DSN: u8 = 12;
pub const TCPOLEN_DATA_ACK: u8 = 6;
pub const TCPOLEN_DFIN: u8 = 2;

pub const TCPOLEN_SIGNATURE_ALIGNED: usize = 20;
pub const TCPOLEN_MSS_ALIGNED: usize = 4;
pub const TCPOLEN_TSTAMP_ALIGNED: usize = 12;
pub const TCPOLEN_WSCALE_ALIGNED: usize = 4;
pub const TCPOLEN_SACKPERM_ALIGNED: usize = 4;
pub const TCPOLEN_SACK_BASE_ALIGNED: usize = 4;
pub const TCPOLEN_MPC_ALIGNED: usize = 8;
pub const TCPOLEN_JOIN_ALIGNED: usize = 8;
pub const TCPOLEN_DSN_ALIGNED: usize = 12;
pub const TCPOLEN_DATA_ACK_ALIGNED: usize = 8;
pub const TCPOLEN_DFIN_ALIGNED: usize = 4;

/// 地址通告的未对齐长度
pub const fn addr_len(n: usize) -> usize {
    TCPOLEN_ADDR_BASE + n * TCPOLEN_ADDR_PERBLOCK
}

/// 地址通告按 4 字节对齐后的长度
pub const fn addr_len_aligned(n: usize) -> usize {
    (addr_len(n) + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrAdvert {
    pub id: u8,
    pub addr: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataMapping {
    pub data_seq: u32,
    pub sub_seq: u32,
    pub data_len: u16,
}

/// 本端与对端协商得到的选项状态
#[derive(Debug, Clone, Default)]
pub struct NegotiatedOptions {
    pub tstamp_ok: bool,
    pub sack_ok: bool,
    pub wscale_ok: bool,
    /// 对端窗口缩放（解释对端通告的窗口）
    pub snd_wscale: u8,
    /// 本端窗口缩放（缩放本端通告的窗口）
    pub rcv_wscale: u8,
    pub ts_recent: u32,
    /// 该连接启用了签名选项
    pub signature: bool,
    /// 协商 MSS 上限
    pub mss_clamp: u32,
    /// 用户设置的 MSS（0 表示未设置）
    pub user_mss: u32,
    /// 接收侧待回送的 SACK 块
    pub sack_blocks: Vec<SackBlock>,
}

/// 子流发送时需要的连接级多路径信息
#[derive(Debug, Clone, Default)]
pub struct MpContext {
    /// 第一条子流携带 capable，其余携带 join
    pub is_master: bool,
    pub local_token: u32,
    pub remote_token: u32,
    pub addr_id: u8,
    /// 连接级累计确认（回送给对端的 data ack）
    pub data_ack: u32,
    pub fin_enqueued: bool,
    /// 连接级 write_seq，用于判断 data FIN 是否落在本段
    pub meta_write_seq: u32,
    /// 连接级窗口右沿（数据序号），重传时按它检查窗口
    pub data_wnd_end: u32,
    /// 尚未通告的本地地址
    pub addrs_unsent: Vec<AddrAdvert>,
}

/// 一次发送的选项集合；字段顺序即线上顺序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutOptions {
    pub signature: bool,
    pub mss: Option<u16>,
    pub timestamp: Option<(u32, u32)>,
    pub sack_perm: bool,
    pub wscale: Option<u8>,
    pub sack_blocks: Vec<SackBlock>,
    pub mp_capable: Option<u32>,
    pub mp_join: Option<(u32, u8)>,
    pub addrs: Vec<AddrAdvert>,
    pub dsn: Option<DataMapping>,
    pub data_ack: Option<u32>,
    pub data_fin: bool,
}

impl OutOptions {
    /// 对齐后的总长度
    pub fn size(&self) -> usize {
        let mut size = 0;
        if self.signature {
            size += TCPOLEN_SIGNATURE_ALIGNED;
        }
        if self.mss.is_some() {
            size += TCPOLEN_MSS_ALIGNED;
        }
        if self.timestamp.is_some() {
            size += TCPOLEN_TSTAMP_ALIGNED;
        } else if self.sack_perm {
            size += TCPOLEN_SACKPERM_ALIGNED;
        }
        if self.wscale.is_some() {
            size += TCPOLEN_WSCALE_ALIGNED;
        }
        if !self.sack_blocks.is_empty() {
            size += TCPOLEN_SACK_BASE_ALIGNED + self.sack_blocks.len() * TCPOLEN_SACK_PERBLOCK;
        }
        if self.mp_capable.is_some() {
            size += TCPOLEN_MPC_ALIGNED;
        }
        if self.mp_join.is_some() {
            size += TCPOLEN_JOIN_ALIGNED;
        }
        if !self.addrs.is_empty() {
            size += addr_len_aligned(self.addrs.len());
        }
        if self.dsn.is_some() {
            size += TCPOLEN_DSN_ALIGNED;
        }
        if self.data_ack.is_some() {
            size += TCPOLEN_DATA_ACK_ALIGNED;
        }
        if self.data_fin {
            size += TCPOLEN_DFIN_ALIGNED;
        }
        size
    }

    /// 写入 `out`（长度至少 `size()`）；返回签名摘要在 `out` 中的偏移。
    pub fn write(&self, out: &mut [u8]) -> Option<usize> {
        let mut w = Writer { out, pos: 0 };
        let mut digest_at = None;

        if self.signature {
            w.put(&[TCPOPT_NOP, TCPOPT_NOP, TCPOPT_SIGNATURE, TCPOLEN_SIGNATURE]);
            digest_at = Some(w.pos);
            w.put(&[0u8; 16]);
        }
        if let Some(mss) = self.mss {
            w.put(&[TCPOPT_MSS, TCPOLEN_MSS]);
            w.put(&mss.to_be_bytes());
        }
        if let Some((tsval, tsecr)) = self.timestamp {
            if self.sack_perm {
                w.put(&[TCPOPT_SACK_PERM, TCPOLEN_SACK_PERM, TCPOPT_TIMESTAMP, TCPOLEN_TIMESTAMP]);
            } else {
                w.put(&[TCPOPT_NOP, TCPOPT_NOP, TCPOPT_TIMESTAMP, TCPOLEN_TIMESTAMP]);
            }
            w.put(&tsval.to_be_bytes());
            w.put(&tsecr.to_be_bytes());
        } else if self.sack_perm {
            w.put(&[TCPOPT_NOP, TCPOPT_NOP, TCPOPT_SACK_PERM, TCPOLEN_SACK_PERM]);
        }
        if let Some(ws) = self.wscale {
            w.put(&[TCPOPT_NOP, TCPOPT_WINDOW, TCPOLEN_WINDOW, ws]);
        }
        if !self.sack_blocks.is_empty() {
            let len = TCPOLEN_SACK_BASE + self.sack_blocks.len() * TCPOLEN_SACK_PERBLOCK;
            w.put(&[TCPOPT_NOP, TCPOPT_NOP, TCPOPT_SACK, len as u8]);
            for b in &self.sack_blocks {
                w.put(&b.start.to_be_bytes());
                w.put(&b.end.to_be_bytes());
            }
        }
        if let Some(token) = self.mp_capable {
            w.put(&[TCPOPT_NOP, TCPOPT_MPC, TCPOLEN_MPC, 0]);
            w.put(&token.to_be_bytes());
        }
        if let Some((token, addr_id)) = self.mp_join {
            w.put(&[TCPOPT_NOP, TCPOPT_JOIN, TCPOLEN_JOIN]);
            w.put(&token.to_be_bytes());
            w.put(&[addr_id]);
        }
        if !self.addrs.is_empty() {
            let n = self.addrs.len();
            for _ in addr_len(n)..addr_len_aligned(n) {
                w.put(&[TCPOPT_NOP]);
            }
            w.put(&[TCPOPT_ADDR, addr_len(n) as u8]);
            for a in &self.addrs {
                w.put(&[a.id, 64]);
                w.put(&a.addr.octets());
            }
        }
        if let Some(m) = self.dsn {
            w.put(&[TCPOPT_DSN, TCPOLEN_DSN]);
            w.put(&m.data_len.to_be_bytes());
            w.put(&m.sub_seq.to_be_bytes());
            w.put(&m.data_seq.to_be_bytes());
        }
        if let Some(ack) = self.data_ack {
            w.put(&[TCPOPT_NOP, TCPOPT_NOP, TCPOPT_DATA_ACK, TCPOLEN_DATA_ACK]);
            w.put(&ack.to_be_bytes());
        }
        if self.data_fin {
            w.put(&[TCPOPT_NOP, TCPOPT_NOP, TCPOPT_DFIN, TCPOLEN_DFIN]);
        }
        debug_assert_eq!(w.pos, self.size());
        digest_at
    }
}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

/// SYN 段的选项
pub fn syn_options(
    opts: &NegotiatedOptions,
    mp: Option<&MpContext>,
    advertise_mss: u16,
    tsval: u32,
    sack: bool,
    wscale: Option<u8>,
) -> OutOptions {
    let mut out = OutOptions {
        signature: opts.signature,
        mss: Some(advertise_mss),
        ..OutOptions::default()
    };
    // 签名 + 时间戳 + SACK 块放不下，有签名时不发时间戳
    if opts.tstamp_ok && !opts.signature {
        out.timestamp = Some((tsval, opts.ts_recent));
    }
    out.wscale = wscale.filter(|ws| *ws != 0);
    out.sack_perm = sack;
    if let Some(mp) = mp {
        if mp.is_master {
            out.mp_capable = Some(mp.local_token);
        } else {
            out.mp_join = Some((mp.remote_token, mp.addr_id));
        }
    }
    assert!(out.size() <= MAX_OPTION_SPACE, "SYN options overflow");
    out
}

/// 已建立连接上的选项；`seg` 为 `None` 时只做尺寸估算（计入所有可能的选项）。
pub fn established_options(
    opts: &NegotiatedOptions,
    mp: Option<&MpContext>,
    seg: Option<&Segment>,
    tsval: u32,
) -> OutOptions {
    let mut out = OutOptions {
        signature: opts.signature,
        ..OutOptions::default()
    };
    if opts.tstamp_ok {
        out.timestamp = Some((if seg.is_some() { tsval } else { 0 }, opts.ts_recent));
    }

    if let Some(mp) = mp {
        let carries_data = seg.is_none_or(|s| s.len() != 0 || s.has(TcpFlags::FIN));
        if carries_data {
            out.dsn = Some(match seg {
                Some(s) if s.mapped => DataMapping {
                    data_seq: s.data_seq,
                    sub_seq: s.sub_seq,
                    data_len: s.len().min(u32::from(u16::MAX)) as u16,
                },
                _ => DataMapping {
                    data_seq: 0,
                    sub_seq: 0,
                    data_len: 0,
                },
            });
        }
        if mp.fin_enqueued && seg.is_none_or(|s| s.end_data_seq == mp.meta_write_seq) {
            out.data_fin = true;
        }
        out.data_ack = Some(mp.data_ack);

        if !mp.addrs_unsent.is_empty() {
            let remaining = MAX_OPTION_SPACE.saturating_sub(out.size());
            if remaining >= TCPOLEN_ADDR_BASE {
                let fit = (remaining - TCPOLEN_ADDR_BASE) / TCPOLEN_ADDR_PERBLOCK;
                let mut n = fit.min(mp.addrs_unsent.len());
                while n > 0 && addr_len_aligned(n) > remaining {
                    n -= 1;
                }
                out.addrs = mp.addrs_unsent[..n].to_vec();
            }
        }
    }

    if !opts.sack_blocks.is_empty() {
        let remaining = MAX_OPTION_SPACE.saturating_sub(out.size());
        if remaining >= TCPOLEN_SACK_BASE_ALIGNED {
            let n = ((remaining - TCPOLEN_SACK_BASE_ALIGNED) / TCPOLEN_SACK_PERBLOCK)
                .min(opts.sack_blocks.len());
            out.sack_blocks = opts.sack_blocks[..n].to_vec();
        }
    }

    assert!(
        out.size() <= MAX_OPTION_SPACE,
        "exceeded option space: {} bytes",
        out.size()
    );
    out
}

/// 解析得到的单个选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedOption {
    Mss(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamp { tsval: u32, tsecr: u32 },
    Sack(Vec<SackBlock>),
    Signature([u8; 16]),
    MpCapable { token: u32 },
    MpJoin { token: u32, addr_id: u8 },
    AddAddr(Vec<AddrAdvert>),
    DataSeq(DataMapping),
    DataAck(u32),
    DataFin,
    Unknown(u8),
}

impl ParsedOption {
    /// 选项类型码
    pub fn kind(&self) -> u8 {
        match self {
            ParsedOption::Mss(_) => TCPOPT_MSS,
            ParsedOption::WindowScale(_) => TCPOPT_WINDOW,
            ParsedOption::SackPermitted => TCPOPT_SACK_PERM,
            ParsedOption::Timestamp { .. } => TCPOPT_TIMESTAMP,
            ParsedOption::Sack(_) => TCPOPT_SACK,
            ParsedOption::Signature(_) => TCPOPT_SIGNATURE,
            ParsedOption::MpCapable { .. } => TCPOPT_MPC,
            ParsedOption::MpJoin { .. } => TCPOPT_JOIN,
            ParsedOption::AddAddr(_) => TCPOPT_ADDR,
            ParsedOption::DataSeq(_) => TCPOPT_DSN,
            ParsedOption::DataAck(_) => TCPOPT_DATA_ACK,
            ParsedOption::DataFin => TCPOPT_DFIN,
            ParsedOption::Unknown(k) => *k,
        }
    }
}

/// 解析选项区
pub fn parse(bytes: &[u8]) -> Result<Vec<ParsedOption>, FrameError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let kind = bytes[i];
        match kind {
            TCPOPT_EOL => break,
            TCPOPT_NOP => {
                i += 1;
                continue;
            }
            _ => {}
        }
        let len = *bytes.get(i + 1).ok_or(FrameError::BadOption(i))? as usize;
        if len < 2 || i + len > bytes.len() {
            return Err(FrameError::BadOption(i));
        }
        let body = &bytes[i + 2..i + len];
        let be32 = |b: &[u8]| u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let opt = match (kind, body.len()) {
            (TCPOPT_MSS, 2) => ParsedOption::Mss(u16::from_be_bytes([body[0], body[1]])),
            (TCPOPT_WINDOW, 1) => ParsedOption::WindowScale(body[0]),
            (TCPOPT_SACK_PERM, 0) => ParsedOption::SackPermitted,
            (TCPOPT_TIMESTAMP, 8) => ParsedOption::Timestamp {
                tsval: be32(&body[0..4]),
                tsecr: be32(&body[4..8]),
            },
            (TCPOPT_SACK, n) if n % TCPOLEN_SACK_PERBLOCK == 0 => ParsedOption::Sack(
                body.chunks_exact(TCPOLEN_SACK_PERBLOCK)
                    .map(|c| SackBlock {
                        start: be32(&c[0..4]),
                        end: be32(&c[4..8]),
                    })
                    .collect(),
            ),
            (TCPOPT_SIGNATURE, 16) => {
                let mut digest = [0u8; 16];
                digest.copy_from_slice(body);
                ParsedOption::Signature(digest)
            }
            (TCPOPT_MPC, 5) => ParsedOption::MpCapable {
                token: be32(&body[1..5]),
            },
            (TCPOPT_JOIN, 5) => ParsedOption::MpJoin {
                token: be32(&body[0..4]),
                addr_id: body[4],
            },
            (TCPOPT_ADDR, n) if n % TCPOLEN_ADDR_PERBLOCK == 0 => ParsedOption::AddAddr(
                body.chunks_exact(TCPOLEN_ADDR_PERBLOCK)
                    .map(|c| AddrAdvert {
                        id: c[0],
                        addr: Ipv4Addr::new(c[2], c[3], c[4], c[5]),
                    })
                    .collect(),
            ),
            (TCPOPT_DSN, 10) => ParsedOption::DataSeq(DataMapping {
                data_len: u16::from_be_bytes([body[0], body[1]]),
                sub_seq: be32(&body[2..6]),
                data_seq: be32(&body[6..10]),
            }),
            (TCPOPT_DATA_ACK, 4) => ParsedOption::DataAck(be32(body)),
            (TCPOPT_DFIN, 0) => ParsedOption::DataFin,
            (TCPOPT_MSS | TCPOPT_WINDOW | TCPOPT_SACK_PERM | TCPOPT_TIMESTAMP | TCPOPT_SACK
            | TCPOPT_SIGNATURE | TCPOPT_MPC | TCPOPT_JOIN | TCPOPT_ADDR | TCPOPT_DSN
            | TCPOPT_DATA_ACK | TCPOPT_DFIN, _) => return Err(FrameError::BadOption(i)),
            (other, _) => ParsedOption::Unknown(other),
        };
        out.push(opt);
        i += len;
    }
    Ok(out)
}
