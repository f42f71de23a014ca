//! 事件中枢统一错误定义
//!
//! 按调用方是否可见划分：
//! - 连接/发布/序列化错误会穿回发布方法的调用者；
//! - 订阅处理、broker 投递、关闭等错误止步于分发器/驱动边界，仅记录日志。
//!
use thiserror::Error;

/// broker 客户端返回的错误（外部协作方）
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unreachable: {reason}")]
    Unreachable { reason: String },
    #[error("invalid hub name: {hub}")]
    InvalidHub { hub: String },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("send failed: {reason}")]
    SendFailed { reason: String },
    #[error("delivery error: {reason}")]
    Delivery { reason: String },
    #[error("client already closed")]
    Closed,
    #[error("broker error: {reason}")]
    Other { reason: String },
}

impl BrokerError {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }

    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed {
            reason: reason.into(),
        }
    }

    pub fn delivery(reason: impl Into<String>) -> Self {
        Self::Delivery {
            reason: reason.into(),
        }
    }
}

/// broker 客户端 Result 别名
pub type BrokerResult<T> = Result<T, BrokerError>;

/// 事件中枢错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum HubError {
    // --- 配置 ---
    #[error("configuration missing: {var}")]
    ConfigMissing { var: String },
    #[error("configuration invalid for {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },

    // --- 调用方可见 ---
    #[error("connection to hub {hub} failed: {source}")]
    Connection {
        hub: String,
        #[source]
        source: BrokerError,
    },
    #[error("publish to hub {hub} failed: {source}")]
    Publish {
        hub: String,
        #[source]
        source: BrokerError,
    },
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    #[error("event hub is shut down")]
    ShutDown,

    // --- 仅记录日志 ---
    #[error("subscriber {subscriber} failed: {reason}")]
    SubscriberHandler { subscriber: String, reason: String },
    #[error("broker delivery error on {key}: {source}")]
    BrokerDelivery {
        key: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to close {resource}: {source}")]
    Close {
        resource: String,
        #[source]
        source: BrokerError,
    },
}

impl HubError {
    pub fn connection(hub: impl Into<String>, source: BrokerError) -> Self {
        Self::Connection {
            hub: hub.into(),
            source,
        }
    }

    pub fn publish(hub: impl Into<String>, source: BrokerError) -> Self {
        Self::Publish {
            hub: hub.into(),
            source,
        }
    }

    /// 是否会穿回发布方法的调用者
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            HubError::Connection { .. }
                | HubError::Publish { .. }
                | HubError::Serialization { .. }
                | HubError::ShutDown
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            HubError::ConfigMissing { .. } | HubError::ConfigInvalid { .. }
        )
    }
}

/// 统一 Result 类型别名
pub type HubResult<T> = Result<T, HubError>;
