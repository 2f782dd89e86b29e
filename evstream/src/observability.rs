//! 观测（Observability）
//!
//! - `FieldTable`：显式传入的“语义字段 -> 标签/字段名”对照表；
//! - `MetricPoint`：指标点（名称 + 标签 + 字段）；
//! - `MetricsSink`：指标输出协议，提供基于 `metrics` 门面的实现与内存实现。
//!
use crate::error::EventResult;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// 订阅端每条已分发消息写入的指标点名称
pub const RECEIVED_EVENTS_POINT: &str = "received_events";
/// 发布端每次发布写入的指标点名称
pub const PUBLISHED_EVENTS_POINT: &str = "published_events";

/// 日志/指标中使用的语义字段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Channel,
    Event,
    CorrelationId,
    MessageId,
    Payload,
    Status,
    /// 错误或 panic 的详细信息
    Detail,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Channel,
        Field::Event,
        Field::CorrelationId,
        Field::MessageId,
        Field::Payload,
        Field::Status,
        Field::Detail,
    ];

    pub fn default_key(self) -> &'static str {
        match self {
            Field::Channel => "channel",
            Field::Event => "event",
            Field::CorrelationId => "correlation_id",
            Field::MessageId => "message_id",
            Field::Payload => "payload",
            Field::Status => "status",
            Field::Detail => "message",
        }
    }
}

/// 字段名对照表
#[derive(Clone, Debug)]
pub struct FieldTable {
    keys: HashMap<Field, String>,
}

impl Default for FieldTable {
    fn default() -> Self {
        Self {
            keys: Field::ALL
                .into_iter()
                .map(|f| (f, f.default_key().to_string()))
                .collect(),
        }
    }
}

impl FieldTable {
    /// 覆写某个语义字段的输出名
    pub fn with(mut self, field: Field, key: impl Into<String>) -> Self {
        self.keys.insert(field, key.into());
        self
    }

    pub fn key(&self, field: Field) -> &str {
        self.keys
            .get(&field)
            .map(String::as_str)
            .unwrap_or_else(|| field.default_key())
    }
}

/// 分发结果在指标中的状态值
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    Panic,
    Rejected,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
            Status::Panic => "panic",
            Status::Rejected => "rejected",
        }
    }
}

/// 指标点
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricPoint {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
}

impl MetricPoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// 指标输出协议
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write_point(&self, point: MetricPoint) -> EventResult<()>;
}

/// 基于 `metrics` 门面的实现：按点名称计数，标签取通道/事件/状态
#[derive(Clone, Debug)]
pub struct TracingMetricsSink {
    fields: Arc<FieldTable>,
}

impl Default for TracingMetricsSink {
    fn default() -> Self {
        Self::new(Arc::new(FieldTable::default()))
    }
}

impl TracingMetricsSink {
    pub fn new(fields: Arc<FieldTable>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn write_point(&self, point: MetricPoint) -> EventResult<()> {
        let lookup = |field: Field| {
            let key = self.fields.key(field);
            point
                .get_field(key)
                .or_else(|| point.get_tag(key))
                .unwrap_or_default()
                .to_string()
        };

        let channel = lookup(Field::Channel);
        let event = lookup(Field::Event);
        let status = lookup(Field::Status);

        metrics::counter!(
            point.name().to_string(),
            "channel" => channel,
            "event" => event,
            "status" => status
        )
        .increment(1);

        tracing::debug!(
            point = point.name(),
            tags = ?point.tags(),
            fields = ?point.fields(),
            "metric point written"
        );
        Ok(())
    }
}

/// 内存指标实现：记录所有写入的点，便于测试与本地调试
#[derive(Clone, Debug, Default)]
pub struct InMemoryMetricsSink {
    points: Arc<Mutex<Vec<MetricPoint>>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points
            .lock()
            .map(|points| points.clone())
            .unwrap_or_default()
    }

    pub fn points_named(&self, name: &str) -> Vec<MetricPoint> {
        self.points()
            .into_iter()
            .filter(|p| p.name() == name)
            .collect()
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn write_point(&self, point: MetricPoint) -> EventResult<()> {
        self.points
            .lock()
            .map_err(|err| crate::error::EventError::metrics(err.to_string()))?
            .push(point);
        Ok(())
    }
}
