//! 多路径：连接级聚合、子流调度、数据重注入

mod meta;
mod scheduler;
mod xmit;

pub use meta::{MetaSock, idsn_for_token};
pub use scheduler::{
    Candidate, MinRttScheduler, RoundRobinScheduler, Scheduler, SchedulerAlgorithm,
    create_scheduler,
};
