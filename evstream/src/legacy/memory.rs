//! 内存版 pub/sub（InMemoryPubSub）
//!
//! 基于 `tokio::sync::broadcast`：
//! - `publish`：广播到所有订阅者，返回接收者数量（无订阅者时消息直接丢弃）；
//! - `subscribe`：返回按通道过滤的 `'static` 消息流；
//! - 订阅者处理过慢导致的丢消息以错误项的形式出现在流中。

use super::{PubSubMessage, PubSubTransport};
use crate::error::{EventError, EventResult as Result};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Clone)]
pub struct InMemoryPubSub {
    tx: broadcast::Sender<PubSubMessage>,
}

impl InMemoryPubSub {
    /// `capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 当前活跃的订阅流数量
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubTransport for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let message = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // 无订阅者时 send 返回错误，fire-and-forget 语义下视为 0 个接收者
        Ok(self.tx.send(message).unwrap_or(0))
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, Result<PubSubMessage>>> {
        let channels = channels.to_vec();
        let stream = BroadcastStream::new(self.tx.subscribe())
            .map(|r| r.map_err(|e| EventError::transport(e.to_string())))
            .filter(move |r| {
                future::ready(match r {
                    Ok(message) => channels.contains(&message.channel),
                    Err(_) => true,
                })
            });
        Ok(Box::pin(stream))
    }
}
