//! 错误类型
//!
//! “现在还不能发” 不是错误：写路径用 bool / 结果枚举表达。这里只收录真正的失败。

use thiserror::Error;

/// 出口（网络协作者）拒绝发送的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EgressError {
    /// 本地瞬时拥塞（队列满），按丢包信号处理
    #[error("egress congested")]
    Congested,
    /// 路由失败
    #[error("no route to path")]
    Unreachable,
}

/// 发送引擎对调用方暴露的错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum XmitError {
    /// 段分配或内存配额不足；由上层的写入/定时器路径稍后重试
    #[error("segment allocation failed")]
    NoMemory,
    /// 当前条件不允许（例如接收方收缩了窗口），稍后再试
    #[error("try again later")]
    Again,
    /// 出口瞬时拥塞，拥塞控制已被通知
    #[error("local congestion at egress")]
    Congested,
    /// 路由失败
    #[error("host unreachable")]
    HostUnreachable,
    /// 连接已关闭
    #[error("connection closed")]
    Closed,
}

impl From<EgressError> for XmitError {
    fn from(e: EgressError) -> Self {
        match e {
            EgressError::Congested => XmitError::Congested,
            EgressError::Unreachable => XmitError::HostUnreachable,
        }
    }
}

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
