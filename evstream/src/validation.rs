//! 校验（Validation）
//!
//! 以“规则名 -> 校验函数”的注册表实现字段级校验，内置：
//! - `required`：非空；
//! - `uuid`：形如 `8-4-4-4-12` 的 UUID 字符串；
//! - `date_time`：RFC 3339 时间；
//! - `event_name`：事件命名规则（大写字母与下划线，且不以 `_EVENT` 结尾）。
//!
//! 事件头在交给业务处理器前必须通过 `Validator::validate_header`。
//!
use crate::contract::Header;
use chrono::DateTime;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;

static EVENT_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z_]+$").expect("valid event name pattern"));

const EVENT_SUFFIX: &str = "_EVENT";

/// 单条校验规则：通过返回 `Ok(())`，否则返回失败原因
pub type Rule = fn(&str) -> Result<(), String>;

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid event name {name:?}: {reason}")]
    InvalidEventName { name: String, reason: String },
    #[error("header validation failed: field={field}, rule={rule}, reason={reason}")]
    Header {
        field: &'static str,
        rule: &'static str,
        reason: String,
    },
    #[error("unknown validation rule: {0}")]
    UnknownRule(String),
}

/// 校验事件名
pub fn validate_event_name(name: &str) -> Result<(), ValidationError> {
    event_name_rule(name).map_err(|reason| ValidationError::InvalidEventName {
        name: name.to_string(),
        reason,
    })
}

fn event_name_rule(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("event name cannot be empty".into());
    }

    if !EVENT_NAME_PATTERN.is_match(value) {
        return Err(format!(
            "event name must match the regex {}",
            EVENT_NAME_PATTERN.as_str()
        ));
    }

    // USER_CREATED 而非 USER_CREATED_EVENT
    if value.ends_with(EVENT_SUFFIX) {
        return Err(format!("event name must not end with '{EVENT_SUFFIX}'"));
    }

    Ok(())
}

fn required_rule(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("value is required".into());
    }
    Ok(())
}

fn uuid_rule(value: &str) -> Result<(), String> {
    // 仅接受带连字符的标准形态
    if value.len() != 36 {
        return Err("value must be a hyphenated uuid".into());
    }
    uuid::Uuid::try_parse(value)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

fn date_time_rule(value: &str) -> Result<(), String> {
    DateTime::parse_from_rfc3339(value)
        .map(|_| ())
        .map_err(|err| format!("value must be an RFC 3339 date time: {err}"))
}

/// 规则注册表
#[derive(Clone, Debug)]
pub struct Validator {
    rules: HashMap<&'static str, Rule>,
}

impl Default for Validator {
    fn default() -> Self {
        let mut validator = Self::empty();
        validator.register("required", required_rule);
        validator.register("uuid", uuid_rule);
        validator.register("date_time", date_time_rule);
        validator.register("event_name", event_name_rule);
        validator
    }
}

impl Validator {
    /// 内置规则齐全的校验器
    pub fn new() -> Self {
        Self::default()
    }

    /// 不含任何规则的校验器
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// 注册（或覆盖）命名规则
    pub fn register(&mut self, name: &'static str, rule: Rule) {
        self.rules.insert(name, rule);
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// 按规则链校验单个字段；`omitempty` 使空值直接通过
    pub fn check(
        &self,
        field: &'static str,
        value: Option<&str>,
        rules: &[&'static str],
    ) -> Result<(), ValidationError> {
        let value = value.unwrap_or_default();

        for rule in rules {
            if *rule == "omitempty" {
                if value.is_empty() {
                    return Ok(());
                }
                continue;
            }

            let check = self
                .rules
                .get(rule)
                .ok_or_else(|| ValidationError::UnknownRule(rule.to_string()))?;

            check(value).map_err(|reason| ValidationError::Header {
                field,
                rule,
                reason,
            })?;
        }

        Ok(())
    }

    /// 校验事件头的结构与事件名
    pub fn validate_header(&self, header: &Header) -> Result<(), ValidationError> {
        self.check("date", Some(header.date()), &["required", "date_time"])?;
        self.check("event", Some(header.event()), &["required", "event_name"])?;
        self.check(
            "correlationId",
            Some(header.correlation_id()),
            &["required", "uuid"],
        )?;
        self.check("userId", header.user_id(), &["omitempty", "uuid"])?;
        Ok(())
    }
}
