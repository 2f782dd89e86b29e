//! 消息契约（Envelope Model）
//!
//! 定义流条目上的字段约定、事件头 `Header` 与信封 `Envelope`。

mod envelope;
mod header;

pub use envelope::{Envelope, WireMessage};
pub use header::Header;

/// 流条目中承载事件头（JSON 字符串）的字段名
pub const HEADER_FIELD: &str = "header";
/// 流条目中承载消息体（JSON 字符串）的字段名
pub const MESSAGE_FIELD: &str = "message";
