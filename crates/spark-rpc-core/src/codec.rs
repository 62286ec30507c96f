//! # codec 模块说明
//!
//! ## 角色定位（Why）
//! - 以内容类型为键管理可插拔的编解码器，客户端在构造请求时一次性确定内容类型，
//!   在执行与流式会话中按该键查找；
//! - 编解码器面向 `serde_json::Value` 中间表示工作，既保证 trait 对象安全，
//!   又允许上层 API 以泛型 `Serialize` / `DeserializeOwned` 收发强类型消息。
//!
//! ## 契约（What）
//! - 查找时忽略内容类型中的参数部分（`application/json; charset=utf-8` 等价于 `application/json`）；
//! - [`Codec::write`] 提供“按消息种类写信封”的扩展点，默认等同于 [`Codec::marshal`]。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

/// 编码时的消息种类，供需要区分信封格式的编解码器使用。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Error,
}

/// 编解码失败。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode as {content_type} failed: {detail}")]
    Encode {
        content_type: String,
        detail: String,
    },
    #[error("decode from {content_type} failed: {detail}")]
    Decode {
        content_type: String,
        detail: String,
    },
    #[error("{content_type} cannot carry value: {detail}")]
    UnsupportedValue {
        content_type: String,
        detail: String,
    },
}

/// 编解码器契约。
pub trait Codec: Send + Sync + 'static {
    /// 该编解码器负责的内容类型（不含参数）。
    fn content_type(&self) -> &str;

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError>;

    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError>;

    /// 以指定种类的信封写出消息。
    fn write(&self, kind: MessageKind, value: &Value) -> Result<Bytes, CodecError> {
        let _ = kind;
        self.marshal(value)
    }
}

/// `application/json` 编解码器。空响应体解码为 `null`。
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const CONTENT_TYPE: &'static str = "application/json";
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode {
                content_type: Self::CONTENT_TYPE.to_string(),
                detail: err.to_string(),
            })
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(data).map_err(|err| CodecError::Decode {
            content_type: Self::CONTENT_TYPE.to_string(),
            detail: err.to_string(),
        })
    }
}

/// `text/plain` 编解码器：只承载字符串值。
#[derive(Clone, Copy, Debug, Default)]
pub struct TextCodec;

impl TextCodec {
    pub const CONTENT_TYPE: &'static str = "text/plain";
}

impl Codec for TextCodec {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        match value {
            Value::String(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Value::Null => Ok(Bytes::new()),
            other => Err(CodecError::UnsupportedValue {
                content_type: Self::CONTENT_TYPE.to_string(),
                detail: format!("expected string, got {}", value_kind(other)),
            }),
        }
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value, CodecError> {
        std::str::from_utf8(data)
            .map(|text| Value::String(text.to_string()))
            .map_err(|err| CodecError::Decode {
                content_type: Self::CONTENT_TYPE.to_string(),
                detail: err.to_string(),
            })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 内容类型 → 编解码器注册表。
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// 空注册表。
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// 注册（或覆盖）编解码器，键为其 [`Codec::content_type`]。
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        let key = normalize(codec.content_type());
        self.codecs.insert(key, codec);
    }

    pub fn with(mut self, codec: Arc<dyn Codec>) -> Self {
        self.register(codec);
        self
    }

    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&normalize(content_type)).cloned()
    }

    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.codecs.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for CodecRegistry {
    /// 预置 JSON 与纯文本编解码器。
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(JsonCodec))
            .with(Arc::new(TextCodec))
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("content_types", &self.content_types())
            .finish()
    }
}

fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_ignores_parameters_and_case() {
        let registry = CodecRegistry::default();
        assert!(registry.get("Application/JSON; charset=utf-8").is_some());
        assert!(registry.get("text/plain").is_some());
        assert!(registry.get("application/protobuf").is_none());
        assert_eq!(registry.content_types(), vec!["application/json", "text/plain"]);
    }

    #[test]
    fn json_empty_body_decodes_to_null() {
        assert_eq!(JsonCodec.unmarshal(b"  ").expect("空体"), Value::Null);
        let bytes = JsonCodec.marshal(&json!({"a": 1})).expect("编码");
        assert_eq!(&bytes[..], br#"{"a":1}"#);
    }

    #[test]
    fn text_codec_rejects_structured_values() {
        let err = TextCodec.marshal(&json!({"a": 1})).expect_err("对象不可编码为文本");
        assert!(matches!(err, CodecError::UnsupportedValue { .. }));
        assert_eq!(
            TextCodec.unmarshal(b"hi").expect("解码"),
            Value::String("hi".into())
        );
    }
}
