use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use evstream::handler::decode_event;
use evstream::transport::{InMemoryStreamTransport, StreamTransport};
use evstream::{EventContext, EventHandler, Publisher, Subscriber, SubscriberConfig};
use evstream_macros::PublishableMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "evstream-demo",
    about = "Publish users and react to them through a consumer group"
)]
struct Cli {
    /// 服务名（消费组名）
    #[arg(long, env = "EVSTREAM_SERVICE", default_value = "welcome-service")]
    service: String,
    /// 实例名（消费者名）
    #[arg(long, env = "EVSTREAM_CONSUMER", default_value = "local")]
    consumer: String,
    /// Redis 地址；缺省时使用内存传输
    #[arg(long, env = "EVSTREAM_REDIS_URL")]
    redis_url: Option<String>,
    /// 发布的用户数量
    #[arg(long, default_value_t = 3)]
    users: usize,
    /// 等待处理完成的最长秒数
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, PublishableMessage)]
#[message(event = "USER_CREATED", channel = "users")]
struct UserCreated {
    id: String,
    email: String,
}

#[derive(Debug, Serialize, Deserialize, PublishableMessage)]
#[message(event = "WELCOME_EMAIL_QUEUED", channel = "notifications")]
struct WelcomeEmailQueued {
    user_id: String,
    email: String,
}

/// 记录欢迎邮件（结构体形式的处理器）
struct WelcomeMailer {
    sent: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for WelcomeMailer {
    async fn handle(&self, ctx: &EventContext, body: &str) -> anyhow::Result<()> {
        let queued: WelcomeEmailQueued = decode_event(body)?;
        tracing::info!(
            user_id = %queued.user_id,
            email = %queued.email,
            correlation_id = ctx.correlation_id().unwrap_or_default(),
            "welcome email sent"
        );
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn transport(cli: &Cli) -> anyhow::Result<Arc<dyn StreamTransport>> {
    match &cli.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let redis = evstream::transport::RedisStreamTransport::connect(url)
                .await
                .with_context(|| format!("failed to connect to {url}"))?;
            Ok(Arc::new(redis))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("redis support is disabled; rebuild with --features redis"),
        None => Ok(Arc::new(InMemoryStreamTransport::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let transport = transport(&cli).await?;
    let publisher = Arc::new(Publisher::builder().transport(transport.clone()).build());
    let sent = Arc::new(AtomicUsize::new(0));

    let subscriber = Subscriber::builder()
        .transport(transport.clone())
        .config(
            SubscriberConfig::builder()
                .service_name(cli.service.as_str())
                .consumer_name(cli.consumer.as_str())
                .block_timeout(Duration::from_secs(1))
                .build(),
        )
        .build();

    // 用户创建后排队欢迎邮件，沿用同一个关联 ID
    {
        let publisher = publisher.clone();
        subscriber.subscribe("users").register_typed(
            "USER_CREATED",
            move |ctx: EventContext, user: UserCreated| {
                let publisher = publisher.clone();
                async move {
                    anyhow::ensure!(user.email.contains('@'), "invalid email {}", user.email);
                    publisher
                        .publish(
                            &ctx,
                            &WelcomeEmailQueued {
                                user_id: user.id,
                                email: user.email,
                            },
                        )
                        .await?;
                    Ok(())
                }
            },
        );
    }
    subscriber.subscribe("notifications").register(
        "WELCOME_EMAIL_QUEUED",
        Arc::new(WelcomeMailer { sent: sent.clone() }),
    );

    let handle = subscriber.spawn();

    for n in 1..=cli.users {
        let user = UserCreated {
            id: format!("u{n}"),
            email: format!("user{n}@example.com"),
        };
        publisher
            .publish(&EventContext::default(), &user)
            .await
            .context("failed to publish user")?;
    }

    let waited = tokio::time::timeout(Duration::from_secs(cli.wait_secs), async {
        while sent.load(Ordering::SeqCst) < cli.users {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if waited.is_err() {
        tracing::warn!(
            sent = sent.load(Ordering::SeqCst),
            expected = cli.users,
            "timed out waiting for welcome emails"
        );
    }

    handle.shutdown();
    handle.join().await?;
    tracing::info!(sent = sent.load(Ordering::SeqCst), "demo finished");
    Ok(())
}
