//! 事件处理器（EventHandler）
//!
//! 处理器接收处理上下文与原样的消息体字符串；注册表保持类型擦除，
//! 强类型由注册点提供的解码步骤（`decode_event::<T>`）完成。
//!
use crate::context::EventContext;
use crate::error::{EventError, EventResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;

/// 事件处理器：处理某一事件类型的消息体
///
/// 返回 `Err` 视为业务失败（消息仍会被确认）；panic 视为运行时故障（不确认，等待回收）。
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &EventContext, body: &str) -> anyhow::Result<()>;
}

/// 将消息体（JSON）解码为目标类型
pub fn decode_event<T: DeserializeOwned>(body: &str) -> EventResult<T> {
    serde_json::from_str(body).map_err(|err| EventError::BodyDecode {
        target: std::any::type_name::<T>(),
        reason: err.to_string(),
    })
}

/// 基于闭包的处理器，直接接收原始消息体
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &EventContext, body: &str) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), body.to_string()).await
    }
}

/// 强类型处理器：先解码为 `T` 再调用闭包
pub struct TypedHandler<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

pub fn typed_handler<T, F, Fut>(f: F) -> TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(EventContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> EventHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(EventContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &EventContext, body: &str) -> anyhow::Result<()> {
        let event = decode_event::<T>(body)?;
        (self.f)(ctx.clone(), event).await
    }
}
