//! 网络世界实现
//!
//! 仿真世界：出口网络、发送端连接表、对端模型。

use std::any::Any;

use super::network::Network;
use super::peer::Peer;
use crate::proto::TcpStack;
use crate::sim::World;

#[derive(Default)]
pub struct NetWorld {
    pub net: Network,
    pub stack: TcpStack,
    pub peer: Peer,
}

impl NetWorld {
    pub fn new(net: Network, peer: Peer) -> Self {
        Self {
            net,
            stack: TcpStack::default(),
            peer,
        }
    }
}

impl World for NetWorld {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
