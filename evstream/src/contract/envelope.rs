use super::header::Header;
use serde::{Deserialize, Serialize};

/// 消息信封：头部 + 原样透传的消息体
///
/// 消息体保持传输层字符串形态（通常是 JSON），仅由业务处理器解码。
/// 构造后不可变。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    header: Header,
    body: String,
}

impl Envelope {
    pub fn new(header: Header, body: impl Into<String>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// 单文档消息形态 `{"header": .., "body": ..}`，用于 legacy pub/sub 通道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: Header,
    pub body: serde_json::Value,
}

impl From<WireMessage> for Envelope {
    fn from(message: WireMessage) -> Self {
        Envelope::new(message.header, message.body.to_string())
    }
}
