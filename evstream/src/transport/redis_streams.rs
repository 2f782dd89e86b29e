//! Redis Streams 传输（RedisStreamTransport）
//!
//! 基于 `XGROUP CREATE .. MKSTREAM`、`XREADGROUP`、`XACK`、`XPENDING`、`XCLAIM`、`XADD`。
//! 阻塞读取使用独立连接，避免阻塞命令拖住确认与发布。

use super::{
    FieldValue, GroupCreation, PendingEntry, StartFrom, StreamBatch, StreamEntry, StreamTransport,
};
use crate::error::EventResult as Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Value};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use std::time::Duration;

#[derive(Clone)]
pub struct RedisStreamTransport {
    commands: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisStreamTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Self::from_client(client).await
    }

    pub async fn from_client(client: redis::Client) -> Result<Self> {
        let commands = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        Ok(Self { commands, blocking })
    }
}

/// `BUSYGROUP` 表示消费组已存在，不算错误
fn group_creation(result: RedisResult<()>) -> Result<GroupCreation> {
    match result {
        Ok(()) => Ok(GroupCreation::Created),
        Err(err) if err.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
        Err(err) => Err(err.into()),
    }
}

/// `BLOCK 0` 在 Redis 中表示无限等待，零值改为不带 `BLOCK`（立即返回）
fn block_millis(block: Duration) -> Option<usize> {
    (!block.is_zero()).then(|| block.as_millis().max(1) as usize)
}

/// 超时返回 nil，视为没有新条目
fn read_batches(reply: Option<StreamReadReply>) -> Vec<StreamBatch> {
    reply
        .map(|reply| {
            reply
                .keys
                .into_iter()
                .map(|key| StreamBatch {
                    stream: key.key,
                    entries: key.ids.into_iter().map(stream_entry).collect(),
                })
                .filter(|batch| !batch.entries.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn field_value(value: &Value) -> FieldValue {
    match value {
        Value::BulkString(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(text) => FieldValue::Text(text),
            Err(err) => FieldValue::Binary(err.into_bytes()),
        },
        Value::SimpleString(text) => FieldValue::Text(text.clone()),
        Value::Int(n) => FieldValue::Integer(*n),
        _ => FieldValue::Binary(Vec::new()),
    }
}

fn stream_entry(id: StreamId) -> StreamEntry {
    StreamEntry {
        fields: id
            .map
            .iter()
            .map(|(k, v)| (k.clone(), field_value(v)))
            .collect(),
        id: id.id,
    }
}

fn field_bytes(value: &FieldValue) -> Vec<u8> {
    match value {
        FieldValue::Text(text) => text.as_bytes().to_vec(),
        FieldValue::Binary(bytes) => bytes.clone(),
        FieldValue::Integer(n) => n.to_string().into_bytes(),
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartFrom,
    ) -> Result<GroupCreation> {
        let id = match start {
            StartFrom::Beginning => "0",
            StartFrom::Latest => "$",
        };
        let mut con = self.commands.clone();

        group_creation(con.xgroup_create_mkstream(stream, group, id).await)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>> {
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));
        if let Some(ms) = block_millis(block) {
            opts = opts.block(ms);
        }
        let ids = vec![">"; streams.len()];
        let mut con = self.blocking.clone();

        let reply: Option<StreamReadReply> =
            con.xread_options(streams, ids.as_slice(), &opts).await?;
        Ok(read_batches(reply))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        let mut con = self.commands.clone();
        Ok(con.xack(stream, group, ids).await?)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize> {
        let mut con = self.commands.clone();
        let reply: StreamPendingReply = con.xpending(stream, group).await?;
        Ok(reply.count())
    }

    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        let mut con = self.commands.clone();
        let reply: StreamPendingCountReply =
            con.xpending_count(stream, group, "-", "+", count).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                deliveries: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        let mut con = self.commands.clone();
        let reply: StreamClaimReply = con
            .xclaim(stream, group, consumer, min_idle.as_millis() as usize, ids)
            .await?;
        Ok(reply.ids.into_iter().map(stream_entry).collect())
    }

    async fn append(&self, stream: &str, fields: &[(&str, FieldValue)]) -> Result<String> {
        let items: Vec<(&str, Vec<u8>)> = fields
            .iter()
            .map(|(name, value)| (*name, field_bytes(value)))
            .collect();
        let mut con = self.commands.clone();
        Ok(con.xadd(stream, "*", items.as_slice()).await?)
    }
}
