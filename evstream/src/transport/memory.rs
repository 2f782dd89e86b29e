//! 内存版流传输（InMemoryStreamTransport）
//!
//! 在进程内完整模拟“流 + 消费组”语义：
//! - 每个消费组维护独立游标与待确认集合（所属消费者、投递时间、投递次数）；
//! - `read_group` 在无新条目时挂起，直到有追加或超时；
//! - 典型用途：测试环境、示例与本地开发。
//!
//! 注意：条目ID形如 `<seq>-0`，单调递增。

use super::{
    FieldValue, GroupCreation, PendingEntry, StartFrom, StreamBatch, StreamEntry, StreamTransport,
};
use crate::error::{EventError, EventResult as Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

type Fields = HashMap<String, FieldValue>;

#[derive(Default)]
struct Stream {
    entries: BTreeMap<u64, Fields>,
    groups: HashMap<String, Group>,
}

struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    last_seq: u64,
}

impl State {
    fn group_mut(&mut self, stream: &str, group: &str) -> Result<(&mut Stream, bool)> {
        let s = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let exists = s.groups.contains_key(group);
        Ok((s, exists))
    }
}

fn no_group(stream: &str, group: &str) -> EventError {
    EventError::transport(format!(
        "NOGROUP no such key '{stream}' or consumer group '{group}'"
    ))
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Option<u64> {
    id.split_once('-').map_or(id, |(seq, _)| seq).parse().ok()
}

/// 简单的内存流传输实现
#[derive(Default)]
pub struct InMemoryStreamTransport {
    state: Mutex<State>,
    appended: Notify,
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 流中的条目数（流不存在时为 0）
    pub async fn len(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    pub async fn is_empty(&self, stream: &str) -> bool {
        self.len(stream).await == 0
    }

    fn take_new(
        state: &mut State,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamBatch>> {
        let now = Instant::now();
        let mut batches = Vec::new();

        for name in streams {
            let (stream, exists) = state.group_mut(name, group)?;
            if !exists {
                return Err(no_group(name, group));
            }
            let Stream { entries, groups } = stream;
            let Some(g) = groups.get_mut(group) else {
                return Err(no_group(name, group));
            };

            let fresh: Vec<StreamEntry> = entries
                .range((Bound::Excluded(g.last_delivered), Bound::Unbounded))
                .take(count.max(1))
                .map(|(seq, fields)| StreamEntry {
                    id: format_id(*seq),
                    fields: fields.clone(),
                })
                .collect();

            for entry in &fresh {
                if let Some(seq) = parse_id(&entry.id) {
                    g.last_delivered = seq;
                    g.pending.insert(
                        seq,
                        Pending {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            deliveries: 1,
                        },
                    );
                }
            }

            if !fresh.is_empty() {
                batches.push(StreamBatch {
                    stream: name.clone(),
                    entries: fresh,
                });
            }
        }

        Ok(batches)
    }
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartFrom,
    ) -> Result<GroupCreation> {
        let mut state = self.state.lock().await;
        let s = state.streams.entry(stream.to_string()).or_default();

        if s.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = match start {
            StartFrom::Beginning => 0,
            StartFrom::Latest => s.entries.keys().next_back().copied().unwrap_or(0),
        };
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>> {
        let deadline = Instant::now() + block;

        loop {
            // 先登记唤醒，再检查状态，避免错过检查与等待之间的追加
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let batches = Self::take_new(&mut state, group, consumer, streams, count)?;
                if !batches.is_empty() || block.is_zero() {
                    return Ok(batches);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        Ok(ids
            .iter()
            .filter_map(|id| parse_id(id))
            .filter(|seq| g.pending.remove(seq).is_some())
            .count())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let (s, _) = state.group_mut(stream, group)?;
        s.groups
            .get(group)
            .map(|g| g.pending.len())
            .ok_or_else(|| no_group(stream, group))
    }

    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        let mut state = self.state.lock().await;
        let (s, _) = state.group_mut(stream, group)?;
        let g = s.groups.get(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();

        Ok(g.pending
            .iter()
            .take(count)
            .map(|(seq, p)| PendingEntry {
                id: format_id(*seq),
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                deliveries: p.deliveries,
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
        let mut state = self.state.lock().await;
        let (s, _) = state.group_mut(stream, group)?;
        let Stream { entries, groups } = s;
        let g = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();
        let mut claimed = Vec::new();

        for seq in ids.iter().filter_map(|id| parse_id(id)) {
            let Some(p) = g.pending.get_mut(&seq) else {
                continue;
            };
            if now.saturating_duration_since(p.delivered_at) < min_idle {
                continue;
            }
            match entries.get(&seq) {
                Some(fields) => {
                    p.consumer = consumer.to_string();
                    p.delivered_at = now;
                    p.deliveries += 1;
                    claimed.push(StreamEntry {
                        id: format_id(seq),
                        fields: fields.clone(),
                    });
                }
                // 条目已被删除：从待确认集合中移除
                None => {
                    g.pending.remove(&seq);
                }
            }
        }

        Ok(claimed)
    }

    async fn append(&self, stream: &str, fields: &[(&str, FieldValue)]) -> Result<String> {
        let id = {
            let mut state = self.state.lock().await;
            state.last_seq += 1;
            let seq = state.last_seq;
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .insert(
                    seq,
                    fields
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                );
            format_id(seq)
        };

        self.appended.notify_waiters();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: &str) -> Vec<(&'static str, FieldValue)> {
        vec![("message", FieldValue::from(n))]
    }

    fn streams(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_group_is_idempotent() {
        let t = InMemoryStreamTransport::new();
        assert_eq!(
            t.create_group("users", "svc", StartFrom::Beginning).await.unwrap(),
            GroupCreation::Created
        );
        assert_eq!(
            t.create_group("users", "svc", StartFrom::Beginning).await.unwrap(),
            GroupCreation::AlreadyExists
        );
        assert!(t.is_empty("users").await);
    }

    #[tokio::test]
    async fn group_from_beginning_sees_history_and_latest_does_not() {
        let t = InMemoryStreamTransport::new();
        t.append("users", &fields("old")).await.unwrap();
        t.create_group("users", "from-start", StartFrom::Beginning)
            .await
            .unwrap();
        t.create_group("users", "from-latest", StartFrom::Latest)
            .await
            .unwrap();

        let start = t
            .read_group("from-start", "c1", &streams(&["users"]), 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].entries.len(), 1);

        let latest = t
            .read_group("from-latest", "c1", &streams(&["users"]), 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(latest.is_empty());
    }

    #[tokio::test]
    async fn read_only_returns_new_entries_and_tracks_pending() {
        let t = InMemoryStreamTransport::new();
        t.create_group("users", "svc", StartFrom::Beginning)
            .await
            .unwrap();
        t.append("users", &fields("1")).await.unwrap();
        t.append("users", &fields("2")).await.unwrap();

        let first = t
            .read_group("svc", "c1", &streams(&["users"]), 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first[0].entries[0].id, "1-0");

        let second = t
            .read_group("svc", "c1", &streams(&["users"]), 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(second[0].entries.len(), 1);
        assert_eq!(second[0].entries[0].id, "2-0");

        assert_eq!(t.pending_count("users", "svc").await.unwrap(), 2);
        let pending = t.pending("users", "svc", 10).await.unwrap();
        assert_eq!(
            pending.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["1-0", "2-0"]
        );
        assert!(pending.iter().all(|p| p.consumer == "c1"));
    }

    #[tokio::test]
    async fn ack_removes_pending_and_second_ack_is_noop() {
        let t = InMemoryStreamTransport::new();
        t.create_group("users", "svc", StartFrom::Beginning)
            .await
            .unwrap();
        let id = t.append("users", &fields("1")).await.unwrap();
        t.read_group("svc", "c1", &streams(&["users"]), 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(t.ack("users", "svc", &[id.clone()]).await.unwrap(), 1);
        assert_eq!(t.ack("users", "svc", &[id]).await.unwrap(), 0);
        assert_eq!(t.pending_count("users", "svc").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_moves_ownership_and_respects_idle_time() {
        let t = InMemoryStreamTransport::new();
        t.create_group("users", "svc", StartFrom::Beginning)
            .await
            .unwrap();
        let id = t.append("users", &fields("1")).await.unwrap();
        t.read_group("svc", "old", &streams(&["users"]), 10, Duration::ZERO)
            .await
            .unwrap();

        let too_fresh = t
            .claim("users", "svc", "new", Duration::from_secs(60), &[id.clone()])
            .await
            .unwrap();
        assert!(too_fresh.is_empty());

        let claimed = t
            .claim("users", "svc", "new", Duration::ZERO, &[id.clone()])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].field("message"), Some(&FieldValue::from("1")));

        let pending = t.pending("users", "svc", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "new");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty_and_wakes_on_append() {
        let t = std::sync::Arc::new(InMemoryStreamTransport::new());
        t.create_group("users", "svc", StartFrom::Beginning)
            .await
            .unwrap();

        let empty = t
            .read_group("svc", "c1", &streams(&["users"]), 10, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(empty.is_empty());

        let reader = {
            let t = t.clone();
            tokio::spawn(async move {
                t.read_group("svc", "c1", &streams(&["users"]), 10, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.append("users", &fields("late")).await.unwrap();

        let batches = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batches[0].entries.len(), 1);
    }

    #[tokio::test]
    async fn reading_without_group_fails() {
        let t = InMemoryStreamTransport::new();
        let err = t
            .read_group("svc", "c1", &streams(&["missing"]), 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }
}
