//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为客户端所有失败路径提供统一的 [`RpcError`]：稳定错误码 + 分类 + HTTP 风格状态码；
//! - 为“服务端错误状态 → 调用方自定义错误类型”的映射提供 [`ErrorMap`]，
//!   解码后的领域错误可通过 [`RpcError::domain_error`] 向下转型取回。
//!
//! ## 契约（What）
//! - 错误码统一采用 `spark.rpc.<domain>.<reason>` 命名，日志与测试据此断言；
//! - [`ErrorKind`] 决定默认重试判定，状态码仅用于线上错误与映射错误的细分；
//! - `RpcError` 可克隆，便于同一错误同时交给 `Selector::record`、`Retry` 与调用方。

use std::borrow::Cow;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::codec::{Codec, CodecError};

/// 客户端统一结果别名。
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// 稳定错误码常量。
pub mod codes {
    pub const BAD_REQUEST: &str = "spark.rpc.request.bad_request";
    pub const UNSUPPORTED_CONTENT_TYPE: &str = "spark.rpc.codec.unsupported_content_type";
    pub const REQUEST_TIMEOUT: &str = "spark.rpc.call.request_timeout";
    pub const WIRE_TIMEOUT: &str = "spark.rpc.wire.timeout";
    pub const WIRE_FAILED: &str = "spark.rpc.wire.failed";
    pub const WIRE_STATUS: &str = "spark.rpc.wire.status";
    pub const MAPPED: &str = "spark.rpc.wire.mapped";
    pub const DECODE_FAILED: &str = "spark.rpc.codec.decode_failed";
    pub const POLICY: &str = "spark.rpc.policy.failed";
    pub const NO_ROUTE: &str = "spark.rpc.route.none_available";
    pub const NO_BROKER: &str = "spark.rpc.publish.no_broker";
    pub const ATTEMPT_ABORTED: &str = "spark.rpc.call.attempt_aborted";
    pub const SESSION_CLOSED: &str = "spark.rpc.stream.closed";
    pub const INTERNAL: &str = "spark.rpc.internal";
}

/// 错误分类。
///
/// | 分类 | 默认状态码 | 典型来源 |
/// | --- | --- | --- |
/// | `BadRequest` | 400 | 地址/模板/头部非法、请求体编码失败 |
/// | `UnsupportedContentType` | 500 | 编解码注册表缺少对应内容类型 |
/// | `Timeout` | 408 | 上下文截止、线上超时 |
/// | `Internal` | 500 | 拨号、传输、解码、无可用路由 |
/// | `Wire` | 对端状态码 | 对端返回 ≥ 400 且没有匹配的错误映射 |
/// | `Mapped` | 对端状态码 | 对端返回 ≥ 400 且错误映射命中 |
/// | `Policy` | 500 | Backoff / Retry / Selector::record 返回错误 |
/// | `SessionClosed` | 500 | 对已关闭的流会话收发 |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    BadRequest,
    UnsupportedContentType,
    Timeout,
    Internal,
    Wire,
    Mapped,
    Policy,
    SessionClosed,
}

/// RPC 客户端错误。
///
/// # 契约说明（What）
/// - `code`：稳定错误码，见 [`codes`]；
/// - `kind` / `status`：分类与 HTTP 风格状态码；
/// - `message`：人类可读描述，线上错误时为对端响应体原文；
/// - `cause`：底层错误；映射错误时为解码出的领域错误；
/// - `node`：出错时正在访问的节点地址（若已知）。
#[derive(Clone)]
pub struct RpcError {
    code: &'static str,
    kind: ErrorKind,
    status: u16,
    message: Cow<'static, str>,
    cause: Option<Arc<dyn Error + Send + Sync + 'static>>,
    node: Option<String>,
}

impl RpcError {
    pub fn new(
        code: &'static str,
        kind: ErrorKind,
        status: u16,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            kind,
            status,
            message: message.into(),
            cause: None,
            node: None,
        }
    }

    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::BAD_REQUEST, ErrorKind::BadRequest, 400, message)
    }

    pub fn unsupported_content_type(content_type: &str) -> Self {
        Self::new(
            codes::UNSUPPORTED_CONTENT_TYPE,
            ErrorKind::UnsupportedContentType,
            500,
            format!("unsupported content type: {content_type}"),
        )
    }

    /// 408：上下文截止或取消导致的调用结束。
    pub fn request_timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::REQUEST_TIMEOUT, ErrorKind::Timeout, 408, message)
    }

    /// 408：线上请求在传输层超时。
    pub fn wire_timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::WIRE_TIMEOUT, ErrorKind::Timeout, 408, message)
    }

    pub fn internal(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(code, ErrorKind::Internal, 500, message)
    }

    /// 对端返回错误状态且没有匹配的映射：消息即响应体原文。
    pub fn wire(status: u16, body: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::WIRE_STATUS, ErrorKind::Wire, status, body)
    }

    /// 对端返回错误状态且映射命中：`decoded` 为调用方注册的领域错误。
    pub fn mapped(status: u16, decoded: Arc<dyn Error + Send + Sync + 'static>) -> Self {
        let message = decoded.to_string();
        Self {
            cause: Some(decoded),
            ..Self::new(codes::MAPPED, ErrorKind::Mapped, status, message)
        }
    }

    /// 将策略返回的错误包装为致命的策略错误，原错误作为 `cause` 保留。
    pub fn policy(stage: &'static str, source: RpcError) -> Self {
        Self::new(
            codes::POLICY,
            ErrorKind::Policy,
            500,
            format!("{stage} policy failed: {}", source.message),
        )
        .with_cause(source)
    }

    pub fn session_closed() -> Self {
        Self::new(
            codes::SESSION_CLOSED,
            ErrorKind::SessionClosed,
            500,
            "stream session is closed",
        )
    }

    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    /// 取回映射错误中解码出的领域错误。
    pub fn domain_error<E: Error + 'static>(&self) -> Option<&E> {
        if self.kind != ErrorKind::Mapped {
            return None;
        }
        self.cause.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcError")
            .field("code", &self.code)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("message", &self.message)
            .field("node", &self.node)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for RpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        let message = err.to_string();
        if matches!(err, CodecError::Decode { .. }) {
            RpcError::internal(codes::DECODE_FAILED, message).with_cause(err)
        } else {
            RpcError::bad_request(message).with_cause(err)
        }
    }
}

/// 将错误响应体解码为调用方自定义错误的能力。
pub trait ErrorDecoder: Send + Sync + 'static {
    fn decode(
        &self,
        codec: &dyn Codec,
        body: &[u8],
    ) -> Result<Arc<dyn Error + Send + Sync + 'static>, CodecError>;
}

/// 以 `serde` 反序列化目标类型的 [`ErrorDecoder`]。
pub struct TypedError<E>(PhantomData<fn() -> E>);

impl<E> TypedError<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for TypedError<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ErrorDecoder for TypedError<E>
where
    E: DeserializeOwned + Error + Send + Sync + 'static,
{
    fn decode(
        &self,
        codec: &dyn Codec,
        body: &[u8],
    ) -> Result<Arc<dyn Error + Send + Sync + 'static>, CodecError> {
        let value = codec.unmarshal(body)?;
        let decoded: E = serde_json::from_value(value).map_err(|err| CodecError::Decode {
            content_type: codec.content_type().to_string(),
            detail: err.to_string(),
        })?;
        Ok(Arc::new(decoded))
    }
}

/// 状态码 → 错误解码器的映射表。
///
/// 查找顺序：精确状态码字符串（如 `"404"`），其次 `"default"`。
#[derive(Clone, Default)]
pub struct ErrorMap {
    entries: HashMap<String, Arc<dyn ErrorDecoder>>,
}

impl ErrorMap {
    pub const DEFAULT_KEY: &'static str = "default";

    pub fn new() -> Self {
        Self::default()
    }

    /// 为指定状态码注册领域错误类型。
    pub fn on<E>(mut self, status: u16) -> Self
    where
        E: DeserializeOwned + Error + Send + Sync + 'static,
    {
        self.entries
            .insert(status.to_string(), Arc::new(TypedError::<E>::new()));
        self
    }

    /// 注册兜底的领域错误类型。
    pub fn otherwise<E>(mut self) -> Self
    where
        E: DeserializeOwned + Error + Send + Sync + 'static,
    {
        self.entries
            .insert(Self::DEFAULT_KEY.to_string(), Arc::new(TypedError::<E>::new()));
        self
    }

    /// 以任意键注册自定义解码器。
    pub fn insert(mut self, key: impl Into<String>, decoder: Arc<dyn ErrorDecoder>) -> Self {
        self.entries.insert(key.into(), decoder);
        self
    }

    pub fn lookup(&self, status: u16) -> Option<&Arc<dyn ErrorDecoder>> {
        self.entries
            .get(&status.to_string())
            .or_else(|| self.entries.get(Self::DEFAULT_KEY))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ErrorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("ErrorMap").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, thiserror::Error)]
    #[error("not found: {what}")]
    struct NotFound {
        what: String,
    }

    #[derive(Debug, Deserialize, thiserror::Error)]
    #[error("fallback: {reason}")]
    struct Fallback {
        reason: String,
    }

    #[test]
    fn display_renders_code_then_message() {
        let err = RpcError::wire(503, "overloaded");
        assert_eq!(err.to_string(), "[spark.rpc.wire.status] overloaded");
        assert_eq!(err.status(), 503);
        assert_eq!(err.kind(), ErrorKind::Wire);
    }

    #[test]
    fn error_map_prefers_exact_status_then_default() {
        let map = ErrorMap::new().on::<NotFound>(404).otherwise::<Fallback>();
        let codec = JsonCodec;

        let exact = map.lookup(404).expect("404 应命中精确项");
        let decoded = exact
            .decode(&codec, br#"{"what":"user"}"#)
            .expect("解码 NotFound");
        let err = RpcError::mapped(404, decoded);
        assert_eq!(
            err.domain_error::<NotFound>().map(|e| e.what.as_str()),
            Some("user")
        );
        assert!(err.domain_error::<Fallback>().is_none());

        let fallback = map.lookup(500).expect("500 应命中 default 项");
        let decoded = fallback
            .decode(&codec, br#"{"reason":"boom"}"#)
            .expect("解码 Fallback");
        assert_eq!(decoded.to_string(), "fallback: boom");
    }

    #[test]
    fn policy_error_keeps_original_as_source() {
        let original = RpcError::bad_request("nope");
        let err = RpcError::policy("backoff", original);
        assert_eq!(err.kind(), ErrorKind::Policy);
        let source = err.source().expect("应保留原始错误");
        assert_eq!(source.to_string(), "[spark.rpc.request.bad_request] nope");
    }
}
