//! Network-facing API used by the send engine.

use crate::error::EgressError;
use crate::sim::{SimTime, Simulator};

use super::{ConnId, Frame, PathIndex, Stats};

/// Route and path metrics for one subflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInfo {
    /// Current path MTU.
    pub pmtu: u32,
    /// Network header length (20 for IPv4 without options).
    pub net_header_len: u32,
    /// Extension header length (IP options / tunnel overhead).
    pub ext_header_len: u32,
    /// Largest segmentation-offload blob the device accepts; `None` disables offload.
    pub gso_max_size: Option<u32>,
    /// Advertised-MSS floor for this destination.
    pub advmss: u32,
    /// Receive window clamp hint (0 = none).
    pub window_clamp: u32,
    /// Initial congestion window hint in packets.
    pub init_cwnd: Option<u32>,
    /// One-way latency, used by the simulated peer.
    pub latency: SimTime,
}

impl Default for RouteInfo {
    fn default() -> Self {
        Self {
            pmtu: 1500,
            net_header_len: 20,
            ext_header_len: 0,
            gso_max_size: None,
            advmss: 1460,
            window_clamp: 0,
            init_cwnd: None,
            latency: SimTime::from_micros(50),
        }
    }
}

/// Minimal network API for the send engine.
pub trait NetApi {
    /// Route lookup; `None` is a routing failure.
    fn route(&self, conn: ConnId, path: PathIndex) -> Option<RouteInfo>;

    /// Hand a framed segment to the link layer.
    fn queue_xmit(&mut self, frame: Frame, sim: &mut Simulator) -> Result<(), EgressError>;

    /// Whether a signature key is configured for this connection.
    fn has_signature_key(&self, conn: ConnId) -> bool;

    /// Opaque 16-byte signature over header (checksum zeroed) and payload.
    fn sign(&self, conn: ConnId, header: &[u8], payload: &[u8]) -> [u8; 16];

    fn stats_mut(&mut self) -> &mut Stats;
}
