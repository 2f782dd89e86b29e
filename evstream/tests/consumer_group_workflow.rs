use anyhow::Result as AnyResult;
use evstream::contract::{HEADER_FIELD, MESSAGE_FIELD};
use evstream::observability::{InMemoryMetricsSink, RECEIVED_EVENTS_POINT};
use evstream::transport::{FieldValue, InMemoryStreamTransport, StartFrom, StreamTransport};
use evstream::{EventContext, Publisher, Subscriber, SubscriberConfig, SubscriberHandle};
use evstream_macros::PublishableMessage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CORRELATION: &str = "11111111-1111-1111-1111-111111111111";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, PublishableMessage)]
#[message(event = "USER_CREATED", channel = "users")]
struct UserCreated {
    id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, PublishableMessage)]
#[message(event = "ORDER_PLACED", channel = "orders")]
struct OrderPlaced {
    seq: u32,
}

fn subscriber(
    transport: &Arc<InMemoryStreamTransport>,
    consumer: &str,
    metrics: &InMemoryMetricsSink,
) -> Subscriber {
    Subscriber::builder()
        .transport(transport.clone())
        .config(
            SubscriberConfig::builder()
                .service_name("billing")
                .consumer_name(consumer)
                .block_timeout(Duration::from_millis(50))
                .build(),
        )
        .metrics(Arc::new(metrics.clone()))
        .build()
}

fn publisher(transport: &Arc<InMemoryStreamTransport>) -> Publisher {
    Publisher::builder()
        .transport(transport.clone())
        .metrics(Arc::new(InMemoryMetricsSink::new()))
        .build()
}

async fn eventually(mut check: impl FnMut() -> bool) -> AnyResult<()> {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

async fn stop(handle: SubscriberHandle) -> AnyResult<()> {
    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(3), handle.join()).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn published_event_reaches_subscriber_with_correlation_id() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let metrics = InMemoryMetricsSink::new();
    let seen: Arc<Mutex<Vec<(UserCreated, EventContext)>>> = Arc::new(Mutex::new(Vec::new()));

    let sub = subscriber(&transport, "host-1", &metrics);
    {
        let seen = seen.clone();
        sub.subscribe("users")
            .register_typed("USER_CREATED", move |ctx: EventContext, ev: UserCreated| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push((ev, ctx));
                    Ok(())
                }
            });
    }
    let handle = sub.spawn();

    let id = publisher(&transport)
        .publish(
            &EventContext::with_correlation_id(CORRELATION),
            &UserCreated { id: "u1".into() },
        )
        .await?;

    eventually(|| !seen.lock().unwrap().is_empty()).await?;
    eventually(|| !metrics.points_named(RECEIVED_EVENTS_POINT).is_empty()).await?;
    stop(handle).await?;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, UserCreated { id: "u1".into() });
    assert_eq!(seen[0].1.correlation_id(), Some(CORRELATION));
    assert_eq!(seen[0].1.message_id(), Some(id.as_str()));
    assert_eq!(transport.pending_count("users", "billing").await?, 0);

    let points = metrics.points_named(RECEIVED_EVENTS_POINT);
    assert_eq!(points[0].get_field("status"), Some("success"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn poison_messages_are_acked_and_skipped() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let sub = subscriber(&transport, "host-1", &InMemoryMetricsSink::new());
    {
        let calls = calls.clone();
        sub.subscribe("users").register_fn("USER_CREATED", move |_, _| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }
    let handle = sub.spawn();

    let bad_headers = [
        FieldValue::Integer(1),
        FieldValue::from("{not json"),
        FieldValue::from(format!(
            r#"{{"event":"USER_CREATED","correlationId":"{CORRELATION}"}}"#
        )),
        FieldValue::from(format!(
            r#"{{"date":"2024-05-01T10:00:00Z","event":"USER_CREATED_EVENT","correlationId":"{CORRELATION}"}}"#
        )),
        FieldValue::from(
            r#"{"date":"2024-05-01T10:00:00Z","event":"USER_CREATED","correlationId":"abc"}"#,
        ),
    ];
    for header in bad_headers {
        transport
            .append("users", &[(HEADER_FIELD, header), (MESSAGE_FIELD, "{}".into())])
            .await?;
    }
    // 毒消息之后的正常消息仍会被处理
    publisher(&transport)
        .publish(&EventContext::default(), &UserCreated { id: "u2".into() })
        .await?;

    eventually(|| calls.load(Ordering::SeqCst) == 1).await?;
    stop(handle).await?;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.pending_count("users", "billing").await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn panicked_message_is_recovered_by_restarted_instance() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());

    // 第一个实例：处理器 panic，消息留在待确认集合
    let panics = Arc::new(AtomicUsize::new(0));
    let first = subscriber(&transport, "host-1", &InMemoryMetricsSink::new());
    {
        let panics = panics.clone();
        first.subscribe("users").register_fn("USER_CREATED", move |_, body: String| {
            let panics = panics.clone();
            async move {
                if body.contains("u1") {
                    panics.fetch_add(1, Ordering::SeqCst);
                    panic!("database exploded");
                }
                Ok(())
            }
        });
    }
    let handle = first.spawn();

    let id = publisher(&transport)
        .publish(
            &EventContext::with_correlation_id(CORRELATION),
            &UserCreated { id: "u1".into() },
        )
        .await?;

    eventually(|| panics.load(Ordering::SeqCst) == 1).await?;
    stop(handle).await?;
    assert_eq!(transport.pending_count("users", "billing").await?, 1);

    // 重启后的实例：回收并成功处理
    let metrics = InMemoryMetricsSink::new();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let second = subscriber(&transport, "host-1", &metrics);
    {
        let handled = handled.clone();
        second.subscribe("users").register_fn("USER_CREATED", move |ctx: EventContext, _| {
            let handled = handled.clone();
            async move {
                handled
                    .lock()
                    .unwrap()
                    .push(ctx.message_id().map(str::to_string));
                Ok(())
            }
        });
    }
    let handle = second.spawn();

    eventually(|| !metrics.points_named(RECEIVED_EVENTS_POINT).is_empty()).await?;
    stop(handle).await?;

    assert_eq!(*handled.lock().unwrap(), vec![Some(id.clone())]);
    assert_eq!(panics.load(Ordering::SeqCst), 1);
    assert_eq!(transport.pending_count("users", "billing").await?, 0);
    // 已确认的条目再次确认是空操作
    assert_eq!(
        transport.ack("users", "billing", std::slice::from_ref(&id)).await?,
        0
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_entries_are_delivered_before_new_traffic() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let publisher = publisher(&transport);
    transport
        .create_group("orders", "billing", StartFrom::Beginning)
        .await?;

    // 模拟崩溃的实例：读取但未确认
    publisher
        .publish(&EventContext::default(), &OrderPlaced { seq: 1 })
        .await?;
    let crashed = transport
        .read_group(
            "billing",
            "crashed-host",
            &["orders".to_string()],
            16,
            Duration::ZERO,
        )
        .await?;
    assert_eq!(crashed[0].entries.len(), 1);

    publisher
        .publish(&EventContext::default(), &OrderPlaced { seq: 2 })
        .await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let sub = subscriber(&transport, "host-2", &InMemoryMetricsSink::new());
    {
        let order = order.clone();
        sub.subscribe("orders")
            .register_typed("ORDER_PLACED", move |_, ev: OrderPlaced| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(ev.seq);
                    Ok(())
                }
            });
    }
    let handle = sub.spawn();

    eventually(|| order.lock().unwrap().len() == 2).await?;
    stop(handle).await?;

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert_eq!(transport.pending_count("orders", "billing").await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn history_before_first_attach_is_not_skipped() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());
    publisher(&transport)
        .publish(&EventContext::default(), &UserCreated { id: "early".into() })
        .await?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sub = subscriber(&transport, "host-1", &InMemoryMetricsSink::new());
    {
        let seen = seen.clone();
        sub.subscribe("users")
            .register_typed("USER_CREATED", move |_, ev: UserCreated| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ev.id);
                    Ok(())
                }
            });
    }
    let handle = sub.spawn();

    eventually(|| !seen.lock().unwrap().is_empty()).await?;
    stop(handle).await?;
    assert_eq!(*seen.lock().unwrap(), vec!["early".to_string()]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unhandled_events_and_business_errors_are_acked() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let metrics = InMemoryMetricsSink::new();

    let sub = subscriber(&transport, "host-1", &metrics);
    sub.subscribe("users")
        .register_fn("USER_CREATED", |_, _| async { anyhow::bail!("duplicate user") });
    sub.subscribe("orders");
    let handle = sub.spawn();

    // 订单先于用户事件追加，且读取按通道名顺序投递，
    // 因此用户事件的指标点出现时订单事件已被确认
    let publisher = publisher(&transport);
    publisher
        .publish(&EventContext::default(), &OrderPlaced { seq: 1 })
        .await?;
    publisher
        .publish(&EventContext::default(), &UserCreated { id: "u1".into() })
        .await?;

    eventually(|| !metrics.points_named(RECEIVED_EVENTS_POINT).is_empty()).await?;
    stop(handle).await?;

    assert_eq!(transport.pending_count("orders", "billing").await?, 0);
    assert_eq!(transport.pending_count("users", "billing").await?, 0);

    let points = metrics.points_named(RECEIVED_EVENTS_POINT);
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].get_field("status"), Some("error"));
    assert_eq!(points[0].get_field("message"), Some("Error: duplicate user"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn listen_returns_promptly_on_cancellation() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let sub = Subscriber::builder()
        .transport(transport.clone())
        .config(
            SubscriberConfig::builder()
                .service_name("billing")
                .consumer_name("host-1")
                .block_timeout(Duration::from_secs(60))
                .build(),
        )
        .build();
    sub.subscribe("users");
    let handle = sub.spawn();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    let started = tokio::time::Instant::now();
    stop(handle).await?;
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_subscribe_and_register_is_safe() -> AnyResult<()> {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let sub = Arc::new(subscriber(&transport, "host-1", &InMemoryMetricsSink::new()));

    let tasks: Vec<_> = (0..32u8)
        .map(|i| {
            let sub = sub.clone();
            tokio::spawn(async move {
                let channel = if i % 2 == 0 { "users" } else { "orders" };
                let event = format!("EVENT_{}", char::from(b'A' + i % 26));
                sub.subscribe(channel)
                    .register_fn(event, |_, _| async { Ok(()) });
            })
        })
        .collect();
    for task in tasks {
        task.await?;
    }

    assert_eq!(sub.channels(), vec!["orders".to_string(), "users".to_string()]);
    let users = sub.registry("users").expect("users registry");
    let orders = sub.registry("orders").expect("orders registry");
    // i >= 26 时事件名回绕，与前面的注册重复
    assert_eq!(users.len(), 13);
    assert_eq!(orders.len(), 13);
    assert!(users.contains("EVENT_A"));
    assert!(orders.contains("EVENT_B"));
    Ok(())
}
