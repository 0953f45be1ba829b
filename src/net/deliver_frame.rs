//! 帧交付与确认回送事件
//!
//! 出口把帧按路由时延交给对端模型；对端的确认再按同样的时延送回协议栈。

use tracing::{debug, trace};

use super::api::NetApi;
use super::frame::Frame;
use super::id::{ConnId, PathIndex};
use super::net_world::NetWorld;
use super::proto_bridge::with_stack;
use crate::proto::AckSignal;
use crate::sim::{Event, Simulator, World};

/// 事件：帧到达对端
#[derive(Debug)]
pub struct DeliverFrame {
    pub frame: Frame,
}

impl Event for DeliverFrame {
    #[tracing::instrument(level = "trace", skip(self, sim, world), fields(conn = ?self.frame.conn, path = ?self.frame.path))]
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let DeliverFrame { frame } = *self;
        let w = world
            .as_any_mut()
            .downcast_mut::<NetWorld>()
            .expect("world must be NetWorld");
        w.net.stats.delivered_frames += 1;

        let Some(sig) = w.peer.receive(&frame) else {
            trace!("对端不回确认");
            return;
        };
        let Some(route) = w.net.route(frame.conn, frame.path) else {
            debug!("回程路由已不存在，确认丢失");
            return;
        };
        sim.schedule_in(
            route.latency,
            AckArrival {
                conn: frame.conn,
                path: frame.path,
                sig,
            },
        );
    }
}

/// 事件：对端的确认回到发送端
#[derive(Debug)]
pub struct AckArrival {
    pub conn: ConnId,
    pub path: PathIndex,
    pub sig: AckSignal,
}

impl Event for AckArrival {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let AckArrival { conn, path, sig } = *self;
        trace!(?conn, ?path, ack = sig.ack, data_ack = ?sig.data_ack, "确认到达");
        with_stack(world, |net, stack| {
            stack.on_ack(conn, path, &sig, net, sim);
        });
    }
}
