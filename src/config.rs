//! 发送引擎配置
//!
//! 所有 sysctl 式的可调参数集中在一个不可变结构里，构造 socket 时以 `Arc` 传入。

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sim::SimTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmitConfig {
    /// 默认启用 Nagle
    pub nagle: bool,
    /// 协商 SACK
    pub sack: bool,
    /// 协商时间戳
    pub timestamps: bool,
    /// 协商窗口缩放
    pub window_scaling: bool,
    /// ECN
    pub ecn: bool,
    /// 不缩放时把通告窗口限制在 32767（兼容把窗口当有符号数的对端）
    pub workaround_signed_windows: bool,
    /// 重传时合并相邻小段
    pub retrans_collapse: bool,
    /// 0/1 关闭，>1 开启 PMTU 探测
    pub mtu_probing: u8,
    /// PMTU 探测的下界 MSS
    pub base_mss: u32,
    /// 空闲超过一个 RTO 后重启 cwnd
    pub slow_start_after_idle: bool,
    /// 初始拥塞窗口（包）
    pub init_cwnd: u32,
    /// 多路径模式下固定使用的 MSS
    pub mptcp_mss: u32,
    /// 零窗口探测最大退避次数
    pub retries2: u32,
    pub rto_init_ms: u64,
    pub rto_min_ms: u64,
    pub rto_max_ms: u64,
    pub delack_min_ms: u64,
    pub delack_max_ms: u64,
    /// 本地资源不足时零窗口探测的间隔上限
    pub resource_probe_interval_ms: u64,
    /// FIN 段分配失败后的重试间隔
    pub fin_retry_ms: u64,
    /// FIN 分配重试次数上限
    pub fin_retry_limit: u32,
    /// 发送缓冲（字节），超出后应用写入被拒绝
    pub sndbuf: usize,
    /// 接收缓冲（字节），用于计算通告窗口
    pub rcvbuf: u32,
}

impl Default for XmitConfig {
    fn default() -> Self {
        Self {
            nagle: true,
            sack: true,
            timestamps: true,
            window_scaling: true,
            ecn: false,
            workaround_signed_windows: false,
            retrans_collapse: true,
            mtu_probing: 0,
            base_mss: 512,
            slow_start_after_idle: true,
            init_cwnd: 10,
            mptcp_mss: 1400,
            retries2: 15,
            rto_init_ms: 1000,
            rto_min_ms: 200,
            rto_max_ms: 120_000,
            delack_min_ms: 40,
            delack_max_ms: 200,
            resource_probe_interval_ms: 500,
            fin_retry_ms: 200,
            fin_retry_limit: 8,
            sndbuf: 256 * 1024,
            rcvbuf: 256 * 1024,
        }
    }
}

impl XmitConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn mtu_probing_enabled(&self) -> bool {
        self.mtu_probing > 1
    }

    pub fn rto_init(&self) -> SimTime {
        SimTime::from_millis(self.rto_init_ms)
    }

    pub fn rto_min(&self) -> SimTime {
        SimTime::from_millis(self.rto_min_ms)
    }

    pub fn rto_max(&self) -> SimTime {
        SimTime::from_millis(self.rto_max_ms)
    }

    pub fn delack_min(&self) -> SimTime {
        SimTime::from_millis(self.delack_min_ms)
    }

    pub fn delack_max(&self) -> SimTime {
        SimTime::from_millis(self.delack_max_ms)
    }

    pub fn resource_probe_interval(&self) -> SimTime {
        SimTime::from_millis(self.resource_probe_interval_ms)
    }

    pub fn fin_retry(&self) -> SimTime {
        SimTime::from_millis(self.fin_retry_ms)
    }
}
