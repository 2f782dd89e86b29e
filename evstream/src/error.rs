//! 事件层统一错误定义
//!
//! 覆盖序列化、头部解码/校验、传输（分组创建、读取、发布）与指标上报，
//! 便于订阅端与发布端统一转换为 `EventError`。
//!
use crate::validation::ValidationError;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventError {
    // --- 序列化/解码 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("the event header should be a string but got an unsupported type")]
    HeaderNotString,
    #[error("unable to decode event header: {reason}")]
    HeaderDecode { reason: String },
    #[error("failed to decode event body: target={target}, reason={reason}")]
    BodyDecode { target: &'static str, reason: String },

    // --- 校验 ---
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // --- 传输 ---
    #[error("failed to create stream group: stream={stream}, reason={reason}")]
    GroupCreation { stream: String, reason: String },
    #[error("unable to read from group: group={group}, reason={reason}")]
    ReadGroup { group: String, reason: String },
    #[error("publish failed: channel={channel}, reason={reason}")]
    Publish { channel: String, reason: String },
    #[error("transport error: {reason}")]
    Transport { reason: String },

    // --- 观测 ---
    #[error("metrics sink error: {reason}")]
    Metrics { reason: String },
}

impl EventError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn metrics(reason: impl Into<String>) -> Self {
        Self::Metrics {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type EventResult<T> = Result<T, EventError>;

// 允许在传输实现中直接使用 `?` 将 redis 错误转换为 EventError
#[cfg(feature = "redis")]
impl From<redis::RedisError> for EventError {
    fn from(err: redis::RedisError) -> Self {
        EventError::Transport {
            reason: err.to_string(),
        }
    }
}
