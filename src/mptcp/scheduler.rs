//! 子流调度器
//!
//! 调度器只做选择：候选集合（已经通过拥塞窗口检查、未被本轮排除的子流）由连接级发送
//! 路径准备好。

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::net::PathIndex;
use crate::sim::SimTime;

/// 一个可选子流的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathIndex,
    /// 平滑 RTT（尚无样本时为 0）
    pub srtt: SimTime,
    pub in_flight: u32,
    pub cwnd: u32,
    /// 这段数据曾经在该子流上发过（重注入时尽量换路径）
    pub carried: bool,
}

pub trait Scheduler: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn select_subflow(&mut self, candidates: &[Candidate]) -> Option<PathIndex>;
}

/// 优先选还没承载过这段数据的子流；都承载过就退回全体
fn preferred(candidates: &[Candidate]) -> impl Iterator<Item = &Candidate> {
    let fresh = candidates.iter().any(|c| !c.carried);
    candidates.iter().filter(move |c| !fresh || !c.carried)
}

/// 选 RTT 最小的子流；没有 RTT 样本的排在最后，同 RTT 时选窗口余量大的
#[derive(Debug, Default, Clone)]
pub struct MinRttScheduler;

impl Scheduler for MinRttScheduler {
    fn name(&self) -> &'static str {
        "min-rtt"
    }

    fn select_subflow(&mut self, candidates: &[Candidate]) -> Option<PathIndex> {
        preferred(candidates)
            .min_by_key(|c| {
                let rtt = if c.srtt == SimTime::ZERO {
                    SimTime::MAX
                } else {
                    c.srtt
                };
                (rtt, std::cmp::Reverse(c.cwnd.saturating_sub(c.in_flight)))
            })
            .map(|c| c.path)
    }
}

/// 轮询
#[derive(Debug, Default, Clone)]
pub struct RoundRobinScheduler {
    last: Option<PathIndex>,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select_subflow(&mut self, candidates: &[Candidate]) -> Option<PathIndex> {
        let pool: Vec<PathIndex> = preferred(candidates).map(|c| c.path).collect();
        let pick = match self.last {
            Some(last) => pool
                .iter()
                .copied()
                .find(|p| *p > last)
                .or_else(|| pool.first().copied()),
            None => pool.first().copied(),
        }?;
        self.last = Some(pick);
        Some(pick)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerAlgorithm {
    #[default]
    MinRtt,
    RoundRobin,
}

pub fn create_scheduler(algo: SchedulerAlgorithm) -> Box<dyn Scheduler> {
    match algo {
        SchedulerAlgorithm::MinRtt => Box::new(MinRttScheduler),
        SchedulerAlgorithm::RoundRobin => Box::new(RoundRobinScheduler::new()),
    }
}
