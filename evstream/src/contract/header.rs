use crate::error::{EventError, EventResult};
use crate::transport::FieldValue;
use bon::Builder;
use serde::{Deserialize, Serialize};

/// 事件头：随每条消息在 `header` 字段中以 JSON 字符串传输
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// 发送时间（RFC 3339）
    #[builder(into)]
    date: String,
    /// 事件类型，须满足事件命名规则（如 `USER_CREATED`）
    #[builder(into)]
    event: String,
    /// 关联 ID（UUID），端到端透传
    #[builder(into)]
    correlation_id: String,
    /// 触发事件的用户 ID（UUID，可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    user_id: Option<String>,
}

impl Header {
    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// 从流条目的原始字段解码头部（不做规则校验）
    ///
    /// 字段缺失或不是字符串时返回 `HeaderNotString`，JSON 无法解析时返回 `HeaderDecode`。
    pub fn decode_field(raw: Option<&FieldValue>) -> EventResult<Self> {
        let raw = raw
            .and_then(FieldValue::as_str)
            .ok_or(EventError::HeaderNotString)?;

        serde_json::from_str(raw).map_err(|err| EventError::HeaderDecode {
            reason: err.to_string(),
        })
    }

    pub fn encode(&self) -> EventResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header::builder()
            .date("2024-05-01T10:00:00Z")
            .event("USER_CREATED")
            .correlation_id("11111111-1111-1111-1111-111111111111")
            .build()
    }

    #[test]
    fn encodes_camel_case_and_omits_missing_user() {
        let json = header().encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["event"], "USER_CREATED");
        assert_eq!(
            value["correlationId"],
            "11111111-1111-1111-1111-111111111111"
        );
        assert!(value.get("userId").is_none());
    }

    #[test]
    fn decodes_text_field() {
        let raw = FieldValue::from(header().encode().unwrap());
        let decoded = Header::decode_field(Some(&raw)).unwrap();
        assert_eq!(decoded, header());
        assert_eq!(decoded.user_id(), None);
    }

    #[test]
    fn rejects_missing_or_non_string_field() {
        assert!(matches!(
            Header::decode_field(None),
            Err(EventError::HeaderNotString)
        ));
        assert!(matches!(
            Header::decode_field(Some(&FieldValue::Integer(7))),
            Err(EventError::HeaderNotString)
        ));
    }

    #[test]
    fn rejects_invalid_json_and_missing_fields() {
        let garbage = FieldValue::from("{not json");
        assert!(matches!(
            Header::decode_field(Some(&garbage)),
            Err(EventError::HeaderDecode { .. })
        ));

        let missing = FieldValue::from(r#"{"date":"2024-05-01T10:00:00Z","event":"USER_CREATED"}"#);
        assert!(matches!(
            Header::decode_field(Some(&missing)),
            Err(EventError::HeaderDecode { .. })
        ));
    }
}
