//! 基于日志型流与消费组的事件投递层（evstream）
//!
//! 面向多服务之间的异步事件通信，提供“至少一次”投递：
//! - 消息契约（`contract`）：事件头 `Header` + 原样透传的消息体，组成 `Envelope`
//! - 校验（`validation`）：命名规则注册表与事件命名规则
//! - 处理器（`handler`）与注册表（`registry`）：按事件名分发，隔离 panic，决定确认时机
//! - 订阅者（`subscriber`）：消费组启动、待确认回收、阻塞读循环与投递流程
//! - 发布者（`publisher`）：校验后把 `{header, message}` 追加到通道对应的流
//! - 传输（`transport`）：流与消费组原语的抽象，内存实现与 Redis Streams 实现（`redis` 特性）
//! - 可观测性（`observability`）：结构化日志与 `received_events` / `published_events` 指标点
//! - 兼容模式（`legacy`）：无确认、无回收的 pub/sub 回退通道
//!
//! 典型用法：
//! 1. 构建 `Subscriber`，`subscribe(channel)` 后在返回的注册表上注册处理器；
//! 2. `spawn()` 或 `listen(token)` 运行订阅；
//! 3. 业务侧用 `Publisher::publish(ctx, &message)` 发布，沿用上下文中的关联 ID。
//!
pub mod context;
pub mod contract;
pub mod error;
pub mod handler;
pub mod legacy;
pub mod observability;
mod panic_trace;
pub mod publisher;
pub mod registry;
pub mod subscriber;
pub mod transport;
pub mod validation;

pub use context::EventContext;
pub use contract::{Envelope, Header};
pub use error::{EventError, EventResult};
pub use handler::{EventHandler, decode_event};
pub use publisher::{PublishableMessage, Publisher};
pub use registry::{DispatchOutcome, HandlerRegistry};
pub use subscriber::{Subscriber, SubscriberConfig, SubscriberHandle};

// 允许在本 crate 内部通过 ::evstream 进行自引用，
// 以便派生宏在本 crate 的单元测试中也能解析到 ::evstream 路径。
extern crate self as evstream;
