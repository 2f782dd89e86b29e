//! 消费组订阅者（Subscriber）
//!
//! 把一个进程（服务名 + 实例名）绑定到每个通道上的持久消费组：
//! 1. 启动：为每个已订阅通道创建流与以服务名命名的消费组（已存在不算错误）；
//! 2. 回收：进入读循环前，认领本组遗留的待确认条目并按正常投递流程处理；
//! 3. 读循环：阻塞读取所有通道的新条目，逐条顺序投递；
//! 4. 投递：解码事件头（毒消息直接确认），查找通道注册表，交给 `HandlerRegistry::dispatch`。
//!
//! 读循环之外的失败（单条回收、确认）只记录日志；创建消费组与读取失败会终止 `listen`。
//!
use crate::context::EventContext;
use crate::contract::{Envelope, HEADER_FIELD, Header, MESSAGE_FIELD};
use crate::error::{EventError, EventResult};
use crate::observability::{
    Field, FieldTable, MetricPoint, MetricsSink, RECEIVED_EVENTS_POINT, Status, TracingMetricsSink,
};
use crate::registry::{DispatchOutcome, HandlerRegistry};
use crate::transport::{FieldValue, GroupCreation, StartFrom, StreamEntry, StreamTransport};
use crate::validation::Validator;
use bon::Builder;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 阻塞读取的最短等待；零值会让传输层立即返回，读循环空转
pub const MIN_BLOCK_TIMEOUT: Duration = Duration::from_millis(1);

/// 订阅者配置
#[derive(Builder, Debug, Clone)]
pub struct SubscriberConfig {
    /// 服务名，即消费组名
    #[builder(into)]
    service_name: String,
    /// 实例名（通常为主机名），即消费者名
    #[builder(into)]
    consumer_name: String,
    /// 单次阻塞读取的最长等待（不小于 `MIN_BLOCK_TIMEOUT`）
    #[builder(default = Duration::from_secs(5))]
    block_timeout: Duration,
    /// 单次读取每个流最多返回的条目数
    #[builder(default = 16)]
    read_count: usize,
    /// 回收待确认条目时要求的最小空闲时间
    #[builder(default = Duration::ZERO)]
    claim_min_idle: Duration,
}

impl SubscriberConfig {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn block_timeout(&self) -> Duration {
        self.block_timeout.max(MIN_BLOCK_TIMEOUT)
    }

    pub fn read_count(&self) -> usize {
        self.read_count
    }

    pub fn claim_min_idle(&self) -> Duration {
        self.claim_min_idle
    }
}

fn default_metrics() -> Arc<dyn MetricsSink> {
    Arc::new(TracingMetricsSink::default())
}

#[derive(Builder)]
pub struct Subscriber {
    transport: Arc<dyn StreamTransport>,
    config: SubscriberConfig,
    #[builder(default = Arc::new(Validator::default()))]
    validator: Arc<Validator>,
    #[builder(default = default_metrics())]
    metrics: Arc<dyn MetricsSink>,
    #[builder(default = Arc::new(FieldTable::default()))]
    fields: Arc<FieldTable>,
    #[builder(skip)]
    subscriptions: DashMap<String, Arc<HandlerRegistry>>,
}

impl Subscriber {
    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// 订阅通道，返回该通道的处理器注册表（重复订阅返回同一份）
    pub fn subscribe(&self, channel: impl Into<String>) -> Arc<HandlerRegistry> {
        let channel = channel.into();
        self.subscriptions
            .entry(channel.clone())
            .or_insert_with(|| {
                tracing::info!(
                    channel = %channel,
                    group = %self.config.service_name,
                    "subscribing"
                );
                Arc::new(HandlerRegistry::new(
                    channel.clone(),
                    self.validator.clone(),
                    self.metrics.clone(),
                    self.fields.clone(),
                ))
            })
            .clone()
    }

    /// 已订阅的通道（有序）
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .subscriptions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        channels.sort();
        channels
    }

    pub fn registry(&self, channel: &str) -> Option<Arc<HandlerRegistry>> {
        self.subscriptions.get(channel).map(|r| r.clone())
    }

    /// 确认条目；失败只记录日志，由调用方决定是否关心结果
    pub async fn ack(&self, channel: &str, message_id: &str) -> EventResult<usize> {
        let result = self
            .transport
            .ack(channel, &self.config.service_name, &[message_id.to_string()])
            .await;

        match &result {
            Ok(0) => tracing::debug!(channel, message_id, "message was already acknowledged"),
            Ok(_) => tracing::trace!(channel, message_id, "message acknowledged"),
            Err(err) => {
                tracing::error!(channel, message_id, error = %err, "failed to acknowledge message")
            }
        }
        result
    }

    /// 运行订阅直到取消或遇到致命的传输错误
    pub async fn listen(self, token: CancellationToken) -> EventResult<()> {
        let channels = self.channels();
        let group = self.config.service_name.clone();

        if channels.is_empty() {
            tracing::warn!(group = %group, "listening without any subscribed channel");
            token.cancelled().await;
            return Ok(());
        }

        self.bootstrap(&channels).await?;
        self.recover_pending(&channels, &token).await;

        tracing::info!(
            group = %group,
            consumer = %self.config.consumer_name,
            channels = ?channels,
            "subscriber listening"
        );

        loop {
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                read = self.transport.read_group(
                    &group,
                    &self.config.consumer_name,
                    &channels,
                    self.config.read_count,
                    self.config.block_timeout(),
                ) => read,
            };

            let batches = read.map_err(|err| {
                tracing::error!(group = %group, error = %err, "failed to read from consumer group");
                EventError::ReadGroup {
                    group: group.clone(),
                    reason: err.to_string(),
                }
            })?;

            for batch in batches {
                for entry in batch.entries {
                    self.deliver(&batch.stream, entry).await;
                }
            }
        }

        tracing::info!(group = %group, consumer = %self.config.consumer_name, "subscriber stopped");
        Ok(())
    }

    /// 在后台任务中运行 `listen`
    pub fn spawn(self) -> SubscriberHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.listen(token.clone()));
        SubscriberHandle::new(token, task)
    }

    async fn bootstrap(&self, channels: &[String]) -> EventResult<()> {
        let group = &self.config.service_name;

        for channel in channels {
            let created = self
                .transport
                .create_group(channel, group, StartFrom::Beginning)
                .await
                .map_err(|err| EventError::GroupCreation {
                    stream: channel.clone(),
                    reason: err.to_string(),
                })?;

            match created {
                GroupCreation::Created => {
                    tracing::info!(channel = %channel, group = %group, "consumer group created")
                }
                GroupCreation::AlreadyExists => {
                    tracing::debug!(
                        channel = %channel,
                        group = %group,
                        "consumer group already exists"
                    )
                }
            }
        }
        Ok(())
    }

    async fn recover_pending(&self, channels: &[String], token: &CancellationToken) {
        let group = &self.config.service_name;
        let consumer = &self.config.consumer_name;

        for channel in channels {
            let count = match self.transport.pending_count(channel, group).await {
                Ok(0) => continue,
                Ok(count) => count,
                Err(err) => {
                    tracing::error!(
                        channel = %channel,
                        group = %group,
                        error = %err,
                        "failed to count pending messages"
                    );
                    continue;
                }
            };

            let pending = match self.transport.pending(channel, group, count).await {
                Ok(pending) => pending,
                Err(err) => {
                    tracing::error!(
                        channel = %channel,
                        group = %group,
                        error = %err,
                        "failed to list pending messages"
                    );
                    continue;
                }
            };

            tracing::info!(
                channel = %channel,
                group = %group,
                count = pending.len(),
                "recovering pending messages"
            );

            for p in pending {
                if token.is_cancelled() {
                    return;
                }

                let claimed = self
                    .transport
                    .claim(
                        channel,
                        group,
                        consumer,
                        self.config.claim_min_idle,
                        std::slice::from_ref(&p.id),
                    )
                    .await;

                match claimed {
                    Ok(entries) => {
                        for entry in entries {
                            tracing::debug!(
                                channel = %channel,
                                message_id = %entry.id,
                                previous_owner = %p.consumer,
                                deliveries = p.deliveries,
                                "redelivering pending message"
                            );
                            self.deliver(channel, entry).await;
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            channel = %channel,
                            message_id = %p.id,
                            error = %err,
                            "failed to claim pending message"
                        );
                    }
                }
            }
        }
    }

    /// 投递单条条目（读循环与回收共用）
    pub(crate) async fn deliver(&self, channel: &str, entry: StreamEntry) -> DispatchOutcome {
        let message_id = entry.id.as_str();

        let header = match Header::decode_field(entry.field(HEADER_FIELD)).and_then(|header| {
            self.validator.validate_header(&header)?;
            Ok(header)
        }) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(channel, message_id, error = %err, "dropping malformed message");
                self.reject(channel, message_id, &err).await;
                let _ = self.ack(channel, message_id).await;
                return DispatchOutcome::Rejected;
            }
        };

        let body = match entry.field(MESSAGE_FIELD) {
            Some(FieldValue::Text(text)) => text.clone(),
            Some(FieldValue::Binary(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            Some(FieldValue::Integer(n)) => n.to_string(),
            None => String::new(),
        };
        let envelope = Envelope::new(header, body);

        let Some(registry) = self.registry(channel) else {
            tracing::debug!(channel, message_id, "no subscription for channel, dropping");
            let _ = self.ack(channel, message_id).await;
            return DispatchOutcome::Unhandled;
        };

        let ctx = EventContext::builder().channel(channel).message_id(message_id).build();
        registry
            .dispatch(&ctx, &envelope, || async move {
                let _ = self.ack(channel, message_id).await;
            })
            .await
    }

    async fn reject(&self, channel: &str, message_id: &str, err: &EventError) {
        let point = MetricPoint::new(RECEIVED_EVENTS_POINT)
            .tag(self.fields.key(Field::MessageId), message_id)
            .field(self.fields.key(Field::Channel), channel)
            .field(self.fields.key(Field::Status), Status::Rejected.as_str())
            .field(self.fields.key(Field::Detail), err.to_string());

        if let Err(err) = self.metrics.write_point(point).await {
            tracing::warn!(error = %err, "failed to write received event metric");
        }
    }
}

/// 后台订阅任务的句柄；drop 时取消订阅
pub struct SubscriberHandle {
    token: CancellationToken,
    task: Option<JoinHandle<EventResult<()>>>,
}

impl SubscriberHandle {
    pub(crate) fn new(token: CancellationToken, task: JoinHandle<EventResult<()>>) -> Self {
        Self {
            token,
            task: Some(task),
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// 等待订阅任务结束，返回 `listen` 的结果
    pub async fn join(mut self) -> EventResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        match task.await {
            Ok(result) => result,
            Err(err) => Err(EventError::transport(format!("subscriber task failed: {err}"))),
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
