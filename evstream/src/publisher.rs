//! 发布者（Publisher）
//!
//! 消息类型自身声明事件名与目标通道（`PublishableMessage`，通常由
//! `#[derive(PublishableMessage)]` 生成）。发布时：
//! - 校验事件名与事件头，校验失败不会写入传输层；
//! - 事件头携带当前时间与上下文中的关联 ID（缺省时生成新的 UUID v4）；
//! - 以通道名作为目标流追加 `{header, message}`；
//! - 写入 `published_events` 指标点，指标失败只记录日志。
//!
use crate::context::EventContext;
use crate::contract::{HEADER_FIELD, Header, MESSAGE_FIELD};
use crate::error::{EventError, EventResult};
use crate::observability::{
    Field, FieldTable, MetricPoint, MetricsSink, PUBLISHED_EVENTS_POINT, TracingMetricsSink,
};
use crate::transport::{FieldValue, StreamTransport};
use crate::validation::{Validator, validate_event_name};
use bon::Builder;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// 可发布的消息：声明自己的事件名与目标通道
pub trait PublishableMessage: Serialize + Send + Sync {
    fn event_type(&self) -> &str;

    fn channel(&self) -> &str;
}

fn default_metrics() -> Arc<dyn MetricsSink> {
    Arc::new(TracingMetricsSink::default())
}

#[derive(Builder)]
pub struct Publisher {
    transport: Arc<dyn StreamTransport>,
    #[builder(default = Arc::new(Validator::default()))]
    validator: Arc<Validator>,
    #[builder(default = default_metrics())]
    metrics: Arc<dyn MetricsSink>,
    #[builder(default = Arc::new(FieldTable::default()))]
    fields: Arc<FieldTable>,
}

impl Publisher {
    /// 构造事件头；关联 ID 取自上下文，缺省时生成新的 UUID v4
    pub fn header_for(ctx: &EventContext, event: &str) -> Header {
        let correlation_id = ctx
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Header::builder()
            .date(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            .event(event)
            .correlation_id(correlation_id)
            .maybe_user_id(ctx.user_id())
            .build()
    }

    /// 发布消息，返回传输层分配的条目ID
    pub async fn publish<M: PublishableMessage>(
        &self,
        ctx: &EventContext,
        message: &M,
    ) -> EventResult<String> {
        let event = message.event_type();
        let channel = message.channel();

        validate_event_name(event)?;
        let header = Self::header_for(ctx, event);
        self.validator.validate_header(&header)?;

        let payload = serde_json::to_string(message)?;
        let fields = [
            (HEADER_FIELD, FieldValue::from(header.encode()?)),
            (MESSAGE_FIELD, FieldValue::from(payload.as_str())),
        ];

        let id = self
            .transport
            .append(channel, &fields)
            .await
            .map_err(|err| EventError::Publish {
                channel: channel.to_string(),
                reason: err.to_string(),
            })?;

        tracing::info!(
            channel,
            event,
            correlation_id = header.correlation_id(),
            message_id = %id,
            "event published"
        );

        let point = MetricPoint::new(PUBLISHED_EVENTS_POINT)
            .tag(self.fields.key(Field::CorrelationId), header.correlation_id())
            .tag(self.fields.key(Field::MessageId), id.as_str())
            .field(self.fields.key(Field::Channel), channel)
            .field(self.fields.key(Field::Event), event)
            .field(self.fields.key(Field::Payload), payload);
        if let Err(err) = self.metrics.write_point(point).await {
            tracing::warn!(channel, event, error = %err, "failed to write published event metric");
        }

        Ok(id)
    }
}
