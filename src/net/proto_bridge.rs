//! Helpers for reaching the connection table from inside simulator events.

use crate::proto::TcpStack;
use crate::sim::World;

use super::{NetApi, NetWorld};

pub(crate) fn with_stack<F, R>(world: &mut dyn World, f: F) -> R
where
    F: FnOnce(&mut dyn NetApi, &mut TcpStack) -> R,
{
    let w = world
        .as_any_mut()
        .downcast_mut::<NetWorld>()
        .expect("world must be NetWorld");
    // 连接表与出口分开借用
    let mut stack = std::mem::take(&mut w.stack);
    let result = f(&mut w.net, &mut stack);
    w.stack = stack;
    result
}
