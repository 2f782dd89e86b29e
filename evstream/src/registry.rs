//! 处理器注册表（HandlerRegistry）
//!
//! 每个订阅通道一份，负责“事件名 -> 处理器”的映射，并执行每条消息的分发约定：
//! 1. 未注册该事件：确认并返回（不属于本服务，静默丢弃）；
//! 2. 事件头校验失败：确认并返回（毒消息，重投也不会变得合法）；
//! 3. 建立本次分发的处理上下文与日志 span；
//! 4. 在故障隔离边界内调用处理器：
//!    - 正常返回（成功或业务错误）：写指标后确认；
//!    - panic：记录故障详情与调用栈，**不确认**，留在待确认集合中等待回收。
//!
use crate::context::EventContext;
use crate::contract::Envelope;
use crate::handler::{EventHandler, handler_fn, typed_handler};
use crate::observability::{
    Field, FieldTable, MetricPoint, MetricsSink, RECEIVED_EVENTS_POINT, Status,
};
use crate::panic_trace;
use crate::validation::Validator;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;

/// 单次分发的结果（确认与否已由分发过程决定）
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 没有注册处理器，已确认
    Unhandled,
    /// 事件头校验失败，已确认
    Rejected,
    /// 处理成功，已确认
    Succeeded,
    /// 业务失败，已确认
    Failed(String),
    /// 处理器 panic，未确认
    Panicked(String),
}

impl DispatchOutcome {
    pub fn acknowledged(&self) -> bool {
        !matches!(self, DispatchOutcome::Panicked(_))
    }
}

pub struct HandlerRegistry {
    channel: String,
    handlers: DashMap<String, Arc<dyn EventHandler>>,
    validator: Arc<Validator>,
    metrics: Arc<dyn MetricsSink>,
    fields: Arc<FieldTable>,
}

impl HandlerRegistry {
    pub fn new(
        channel: impl Into<String>,
        validator: Arc<Validator>,
        metrics: Arc<dyn MetricsSink>,
        fields: Arc<FieldTable>,
    ) -> Self {
        Self {
            channel: channel.into(),
            handlers: DashMap::new(),
            validator,
            metrics,
            fields,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 注册事件处理器；同名事件后注册者覆盖先注册者
    pub fn register(&self, event: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event = event.into();
        tracing::info!(channel = %self.channel, event = %event, "registering event handler");
        self.handlers.insert(event, handler);
    }

    /// 以闭包注册，闭包接收原始消息体
    pub fn register_fn<F, Fut>(&self, event: impl Into<String>, f: F)
    where
        F: Fn(EventContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event, Arc::new(handler_fn(f)));
    }

    /// 以强类型闭包注册，消息体先解码为 `T`
    pub fn register_typed<T, F, Fut>(&self, event: impl Into<String>, f: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(EventContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event, Arc::new(typed_handler::<T, F, Fut>(f)));
    }

    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 分发一条消息；是否及何时调用 `ack` 完全由本方法决定
    pub async fn dispatch<A, Fut>(
        &self,
        ctx: &EventContext,
        envelope: &Envelope,
        ack: A,
    ) -> DispatchOutcome
    where
        A: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let header = envelope.header();

        // 不在持有 DashMap 引用时跨 await
        let Some(handler) = self.handlers.get(header.event()).map(|h| h.clone()) else {
            tracing::trace!(
                channel = %self.channel,
                event = header.event(),
                "no handler registered, dropping"
            );
            ack().await;
            return DispatchOutcome::Unhandled;
        };

        if let Err(err) = self.validator.validate_header(header) {
            tracing::warn!(
                channel = %self.channel,
                event = header.event(),
                error = %err,
                "event header failed validation, dropping"
            );
            let point = self
                .point(ctx, envelope, Status::Rejected)
                .field(self.fields.key(Field::Detail), err.to_string());
            self.write(point).await;
            ack().await;
            return DispatchOutcome::Rejected;
        }

        let scoped = EventContext::for_delivery(&self.channel, ctx.message_id(), header);

        let span = tracing::info_span!(
            "dispatch",
            channel = %self.channel,
            event = header.event(),
            correlation_id = header.correlation_id(),
            message_id = ctx.message_id().unwrap_or_default(),
        );

        async move {
            tracing::info!("received event");

            let result = AssertUnwindSafe(panic_trace::traced(
                handler.handle(&scoped, envelope.body()),
            ))
            .catch_unwind()
            .await;

            match result {
                Ok(Ok(())) => {
                    tracing::info!("event processing succeeded");
                    self.write(self.point(&scoped, envelope, Status::Success))
                        .await;
                    ack().await;
                    DispatchOutcome::Succeeded
                }
                Ok(Err(err)) => {
                    let detail = format!("Error: {err:#}");
                    tracing::error!(error = %detail, "event processing failed");
                    let point = self
                        .point(&scoped, envelope, Status::Error)
                        .field(self.fields.key(Field::Detail), detail.as_str());
                    self.write(point).await;
                    ack().await;
                    DispatchOutcome::Failed(detail)
                }
                Err(panic) => {
                    let detail = format!("Panic {}", panic_message(panic.as_ref()));
                    match panic_trace::take() {
                        Some(site) => tracing::error!(
                            panic = %detail,
                            location = site.location.as_deref().unwrap_or("unknown"),
                            trace = %site.backtrace,
                            "event processing did panic, leaving message pending"
                        ),
                        None => tracing::error!(
                            panic = %detail,
                            catch_site_trace = %Backtrace::force_capture(),
                            "event processing did panic, leaving message pending"
                        ),
                    }
                    let point = self
                        .point(&scoped, envelope, Status::Panic)
                        .field(self.fields.key(Field::Detail), detail.as_str());
                    self.write(point).await;
                    DispatchOutcome::Panicked(detail)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn point(&self, ctx: &EventContext, envelope: &Envelope, status: Status) -> MetricPoint {
        let header = envelope.header();
        let mut point = MetricPoint::new(RECEIVED_EVENTS_POINT)
            .tag(
                self.fields.key(Field::CorrelationId),
                header.correlation_id(),
            )
            .field(self.fields.key(Field::Channel), self.channel.as_str())
            .field(self.fields.key(Field::Event), header.event())
            .field(self.fields.key(Field::Payload), envelope.body())
            .field(self.fields.key(Field::Status), status.as_str());
        if let Some(id) = ctx.message_id() {
            point = point.tag(self.fields.key(Field::MessageId), id);
        }
        point
    }

    async fn write(&self, point: MetricPoint) {
        if let Err(err) = self.metrics.write_point(point).await {
            tracing::warn!(error = %err, "failed to write received event metric");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
