//! Redis pub/sub（RedisPubSub）
//!
//! `PUBLISH` 走共享的连接管理器，每次 `subscribe` 打开一条独立的订阅连接。

use super::{PubSubMessage, PubSubTransport};
use crate::error::{EventError, EventResult as Result};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    commands: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, commands })
    }
}

#[async_trait]
impl PubSubTransport for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut con = self.commands.clone();
        Ok(con.publish(channel, payload).await?)
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, Result<PubSubMessage>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let stream = pubsub.into_on_message().map(|msg| -> Result<PubSubMessage> {
            let payload = msg
                .get_payload::<String>()
                .map_err(|err| EventError::transport(err.to_string()))?;
            Ok(PubSubMessage {
                channel: msg.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(Box::pin(stream))
    }
}
