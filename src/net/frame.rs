//! Wire framing: header layout, flags, checksum and a headroom-aware buffer.
//!
//! Payload is placed first; headers are then pushed in front of it into the
//! reserved headroom, so building a frame never shifts payload bytes.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::{BitAnd, BitOr, BitOrAssign};

use thiserror::Error;

use super::{ConnId, PathIndex};

/// Base transport header length.
pub const TCP_HEADER_LEN: usize = 20;
/// Option space ceiling (data offset is 4 bits of 32-bit words).
pub const MAX_OPTION_SPACE: usize = 40;
/// Headroom reserved in front of every payload.
pub const MAX_HEADER: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("buffer too small")]
    Truncated,
    #[error("bad data offset {0}")]
    BadDataOffset(u8),
    #[error("malformed option at byte {0}")]
    BadOption(usize),
}

/// Header control bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    pub const fn empty() -> TcpFlags {
        TcpFlags(0)
    }

    pub const fn from_bits(bits: u8) -> TcpFlags {
        TcpFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: TcpFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: TcpFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: TcpFlags) {
        self.0 &= !other.0;
    }

    pub const fn without(self, other: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 & !other.0)
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;
    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: TcpFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TcpFlags {
    type Output = TcpFlags;
    fn bitand(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 8] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::CWR, "CWR"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// The fixed 20-byte transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words, options included.
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urg_ptr: u16,
}

impl TcpHeader {
    /// Serialize into the first 20 bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), FrameError> {
        if self.data_offset < 5 || self.data_offset > 15 {
            return Err(FrameError::BadDataOffset(self.data_offset));
        }
        if buf.len() < TCP_HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_be_bytes());
        buf[12] = self.data_offset << 4;
        buf[13] = self.flags.bits();
        buf[14..16].copy_from_slice(&self.window.to_be_bytes());
        buf[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        buf[18..20].copy_from_slice(&self.urg_ptr.to_be_bytes());
        Ok(())
    }

    /// Parse a header; returns the header, its option bytes and the payload.
    pub fn parse(buf: &[u8]) -> Result<(TcpHeader, &[u8], &[u8]), FrameError> {
        if buf.len() < TCP_HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let data_offset = buf[12] >> 4;
        let hdr_len = data_offset as usize * 4;
        if data_offset < 5 {
            return Err(FrameError::BadDataOffset(data_offset));
        }
        if hdr_len > buf.len() {
            return Err(FrameError::Truncated);
        }
        let be16 = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        let be32 = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let hdr = TcpHeader {
            src_port: be16(0),
            dst_port: be16(2),
            seq: be32(4),
            ack: be32(8),
            data_offset,
            flags: TcpFlags::from_bits(buf[13]),
            window: be16(14),
            checksum: be16(16),
            urg_ptr: be16(18),
        };
        Ok((hdr, &buf[TCP_HEADER_LEN..hdr_len], &buf[hdr_len..]))
    }
}

/// Ones-complement checksum over the IPv4 pseudo header and `segment`.
pub fn checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut add = |bytes: &[u8]| {
        let mut chunks = bytes.chunks_exact(2);
        for c in &mut chunks {
            sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
        }
        if let [last] = chunks.remainder() {
            sum += u32::from(*last) << 8;
        }
    };
    add(&src.octets());
    add(&dst.octets());
    add(&[0, 6]);
    add(&(segment.len() as u16).to_be_bytes());
    add(segment);
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A byte buffer with capacity reserved ahead of the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuf {
    buf: Vec<u8>,
    head: usize,
}

impl PacketBuf {
    pub fn with_payload(headroom: usize, payload: &[u8]) -> Self {
        let mut buf = vec![0u8; headroom + payload.len()];
        buf[headroom..].copy_from_slice(payload);
        Self {
            buf,
            head: headroom,
        }
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Prepend `n` zeroed bytes and return them for the caller to fill.
    /// Reallocates if the reserved headroom is exhausted.
    pub fn push(&mut self, n: usize) -> &mut [u8] {
        if n > self.head {
            let grow = n - self.head + MAX_HEADER;
            let mut fresh = vec![0u8; grow + self.buf.len()];
            fresh[grow..].copy_from_slice(&self.buf);
            self.buf = fresh;
            self.head += grow;
        }
        self.head -= n;
        let region = &mut self.buf[self.head..self.head + n];
        region.fill(0);
        region
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fully framed segment handed to the egress.
#[derive(Debug, Clone)]
pub struct Frame {
    pub conn: ConnId,
    pub path: PathIndex,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub buf: PacketBuf,
    /// Transport header length including options.
    pub header_len: usize,
    /// ECN-capable transport codepoint requested for the network header.
    pub ect: bool,
    /// Sent by the retransmission path.
    pub retransmit: bool,
}

impl Frame {
    pub fn header(&self) -> Result<TcpHeader, FrameError> {
        TcpHeader::parse(self.buf.data()).map(|(h, _, _)| h)
    }

    pub fn options(&self) -> &[u8] {
        &self.buf.data()[TCP_HEADER_LEN..self.header_len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.data()[self.header_len..]
    }

    pub fn checksum_ok(&self) -> bool {
        checksum(*self.src.ip(), *self.dst.ip(), self.buf.data()) == 0
    }
}
