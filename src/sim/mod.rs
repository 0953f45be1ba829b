//! 仿真核心模块
//!
//! 单调时钟 + 事件队列。发送引擎把它当作定时器服务使用：
//! 重传/零窗口探测/延迟 ACK/FIN 重试都作为事件调度到这里。

mod event;
mod simulator;
mod time;
mod world;

pub use event::Event;
pub use simulator::Simulator;
pub use time::SimTime;
pub use world::World;
