use proc_macro::TokenStream;

mod message;

/// 可发布消息派生宏
/// - 用法：`#[derive(PublishableMessage)]` + `#[message(event = "USER_CREATED", channel = "users")]`
/// - 生成 `::evstream::publisher::PublishableMessage` 实现（event_type/channel）
/// - 生成关联常量 `EVENT_TYPE`、`CHANNEL`
/// - 事件名在编译期按命名规则校验（大写字母与下划线，不以 `_EVENT` 结尾）
#[proc_macro_derive(PublishableMessage, attributes(message))]
pub fn publishable_message(item: TokenStream) -> TokenStream {
    message::expand(item)
}
