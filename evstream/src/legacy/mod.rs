//! Legacy pub/sub 模式
//!
//! 不经过消费组的简易回退通道：发布即广播，没有确认、没有待确认集合、没有回收；
//! 发布时没有在线订阅者的消息直接丢失。
//!
//! 消息以单个 JSON 文档 `{"header": .., "body": ..}` 传输，订阅端复用
//! `HandlerRegistry::dispatch`（确认为空操作）。
//!
use crate::context::EventContext;
use crate::contract::{Envelope, WireMessage};
use crate::error::{EventError, EventResult};
use crate::observability::{
    Field, FieldTable, MetricPoint, MetricsSink, PUBLISHED_EVENTS_POINT, TracingMetricsSink,
};
use crate::publisher::{Publisher, PublishableMessage};
use crate::registry::{DispatchOutcome, HandlerRegistry};
use crate::subscriber::SubscriberHandle;
use crate::validation::{Validator, validate_event_name};
use async_trait::async_trait;
use bon::Builder;
use dashmap::DashMap;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod memory;
#[cfg(feature = "redis")]
mod redis_pubsub;

pub use memory::InMemoryPubSub;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSub;

/// pub/sub 通道上收到的一条消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// 广播消息，返回收到消息的订阅者数量
    async fn publish(&self, channel: &str, payload: &str) -> EventResult<usize>;

    /// 订阅多个通道，返回 `'static` 消息流
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> EventResult<BoxStream<'static, EventResult<PubSubMessage>>>;
}

fn default_metrics() -> Arc<dyn MetricsSink> {
    Arc::new(TracingMetricsSink::default())
}

#[derive(Builder)]
pub struct LegacyPublisher {
    transport: Arc<dyn PubSubTransport>,
    #[builder(default = Arc::new(Validator::default()))]
    validator: Arc<Validator>,
    #[builder(default = default_metrics())]
    metrics: Arc<dyn MetricsSink>,
    #[builder(default = Arc::new(FieldTable::default()))]
    fields: Arc<FieldTable>,
}

impl LegacyPublisher {
    /// 发布消息，返回收到消息的订阅者数量
    pub async fn publish<M: PublishableMessage>(
        &self,
        ctx: &EventContext,
        message: &M,
    ) -> EventResult<usize> {
        let event = message.event_type();
        let channel = message.channel();

        validate_event_name(event)?;
        let header = Publisher::header_for(ctx, event);
        self.validator.validate_header(&header)?;

        let body = serde_json::to_value(message)?;
        let payload = body.to_string();
        let wire = serde_json::to_string(&WireMessage {
            header: header.clone(),
            body,
        })?;

        let receivers = self
            .transport
            .publish(channel, &wire)
            .await
            .map_err(|err| EventError::Publish {
                channel: channel.to_string(),
                reason: err.to_string(),
            })?;

        tracing::info!(channel, event, receivers, "event broadcast");

        let point = MetricPoint::new(PUBLISHED_EVENTS_POINT)
            .tag(self.fields.key(Field::CorrelationId), header.correlation_id())
            .field(self.fields.key(Field::Channel), channel)
            .field(self.fields.key(Field::Event), event)
            .field(self.fields.key(Field::Payload), payload);
        if let Err(err) = self.metrics.write_point(point).await {
            tracing::warn!(channel, event, error = %err, "failed to write published event metric");
        }

        Ok(receivers)
    }
}

#[derive(Builder)]
pub struct LegacySubscriber {
    transport: Arc<dyn PubSubTransport>,
    #[builder(default = Arc::new(Validator::default()))]
    validator: Arc<Validator>,
    #[builder(default = default_metrics())]
    metrics: Arc<dyn MetricsSink>,
    #[builder(default = Arc::new(FieldTable::default()))]
    fields: Arc<FieldTable>,
    #[builder(skip)]
    subscriptions: DashMap<String, Arc<HandlerRegistry>>,
}

impl LegacySubscriber {
    pub fn subscribe(&self, channel: impl Into<String>) -> Arc<HandlerRegistry> {
        let channel = channel.into();
        self.subscriptions
            .entry(channel.clone())
            .or_insert_with(|| {
                Arc::new(HandlerRegistry::new(
                    channel.clone(),
                    self.validator.clone(),
                    self.metrics.clone(),
                    self.fields.clone(),
                ))
            })
            .clone()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .subscriptions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        channels.sort();
        channels
    }

    /// 接收消息直到取消；消息流结束视为连接断开并返回错误
    pub async fn listen(self, token: CancellationToken) -> EventResult<()> {
        let channels = self.channels();
        let mut stream = self.transport.subscribe(&channels).await?;
        tracing::info!(channels = ?channels, "legacy subscriber listening");

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    self.deliver(message).await;
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "legacy subscription skipped messages");
                }
                None => return Err(EventError::transport("pub/sub subscription closed")),
            }
        }

        tracing::info!("legacy subscriber stopped");
        Ok(())
    }

    pub fn spawn(self) -> SubscriberHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.listen(token.clone()));
        SubscriberHandle::new(token, task)
    }

    async fn deliver(&self, message: PubSubMessage) -> DispatchOutcome {
        let channel = message.channel.as_str();

        let wire: WireMessage = match serde_json::from_str(&message.payload) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::warn!(channel, error = %err, "dropping malformed legacy message");
                return DispatchOutcome::Rejected;
            }
        };

        let Some(registry) = self.subscriptions.get(channel).map(|r| r.clone()) else {
            return DispatchOutcome::Unhandled;
        };

        let ctx = EventContext::builder().channel(channel).build();
        // 没有待确认集合，确认为空操作
        registry
            .dispatch(&ctx, &Envelope::from(wire), || async {})
            .await
    }
}
