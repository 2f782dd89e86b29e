//! 流传输（StreamTransport）协议
//!
//! 对日志型流 + 消费组的最小原语抽象：
//! - 创建流与消费组（幂等，可区分“已存在”）；
//! - 阻塞读取消费组中的新条目（多流，超时返回空）；
//! - 确认、列出待确认条目、认领待确认条目；
//! - 追加条目。
//!
//! 提供内存实现 `InMemoryStreamTransport`，以及 `redis` 特性下的 `RedisStreamTransport`。
//!
use crate::error::EventResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

mod memory;
#[cfg(feature = "redis")]
mod redis_streams;

pub use memory::InMemoryStreamTransport;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamTransport;

/// 条目字段值
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Binary(Vec<u8>),
    Integer(i64),
}

impl FieldValue {
    /// 仅文本值可视为字符串
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// 流中的一条条目
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, FieldValue>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// 一次读取中属于同一个流的条目
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// 待确认条目（已投递未确认）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// 消费组的起始位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartFrom {
    /// 流起点，历史条目不会被跳过
    Beginning,
    /// 仅接收创建之后追加的条目
    Latest,
}

/// 创建消费组的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// 创建流（若不存在）并挂载消费组
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartFrom,
    ) -> EventResult<GroupCreation>;

    /// 以消费者身份阻塞读取多个流中的新条目
    ///
    /// 在 `block` 时间内没有新条目时返回空集合，而不是错误。
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> EventResult<Vec<StreamBatch>>;

    /// 确认条目，返回实际从待确认集合中移除的数量
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> EventResult<usize>;

    async fn pending_count(&self, stream: &str, group: &str) -> EventResult<usize>;

    /// 列出待确认条目（从旧到新）
    async fn pending(&self, stream: &str, group: &str, count: usize)
    -> EventResult<Vec<PendingEntry>>;

    /// 将空闲时间不少于 `min_idle` 的待确认条目转移给 `consumer`
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> EventResult<Vec<StreamEntry>>;

    /// 追加条目，返回条目ID
    async fn append(&self, stream: &str, fields: &[(&str, FieldValue)]) -> EventResult<String>;
}
