use crate::contract::Header;
use bon::Builder;

/// 事件处理上下文
///
/// 订阅端为每条投递的消息构造一份（仅在本次分发期间有效），携带关联 ID 与
/// 通道/事件/消息 ID 等元信息；发布端读取其中的 `correlation_id` 写入新消息头，
/// 从而在事件链路上透传。
#[derive(Builder, Default, Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// 关联ID
    #[builder(into)]
    correlation_id: Option<String>,
    /// 触发事件的用户ID
    #[builder(into)]
    user_id: Option<String>,
    /// 消息来源通道
    #[builder(into)]
    channel: Option<String>,
    /// 事件类型
    #[builder(into)]
    event: Option<String>,
    /// 传输层消息ID
    #[builder(into)]
    message_id: Option<String>,
}

impl EventContext {
    /// 仅携带关联 ID 的上下文，常用于发起一条新的事件链
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }

    /// 为一次投递构造处理上下文
    pub fn for_delivery(channel: &str, message_id: Option<&str>, header: &Header) -> Self {
        Self {
            correlation_id: Some(header.correlation_id().to_string()),
            user_id: header.user_id().map(str::to_string),
            channel: Some(channel.to_string()),
            event: Some(header.event().to_string()),
            message_id: message_id.map(str::to_string),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }
}
