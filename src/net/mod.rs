//! 网络侧协作者
//!
//! 标识符、帧格式、出口网络与统计、对端模型，以及把它们装在一起的仿真世界。

mod api;
mod deliver_frame;
mod frame;
mod id;
mod net_world;
mod network;
mod peer;
mod proto_bridge;
mod stats;

pub use api::{NetApi, RouteInfo};
pub use deliver_frame::{AckArrival, DeliverFrame};
pub use frame::{
    Frame, FrameError, MAX_HEADER, MAX_OPTION_SPACE, PacketBuf, TCP_HEADER_LEN, TcpFlags,
    TcpHeader, checksum,
};
pub use id::{ConnId, PathIndex};
pub use net_world::NetWorld;
pub use network::{Network, SentFrame};
pub use peer::{Peer, PeerConfig, PeerReport};
pub(crate) use proto_bridge::with_stack;
pub use stats::Stats;
