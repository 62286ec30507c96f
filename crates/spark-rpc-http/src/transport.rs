//! # transport 模块说明
//!
//! ## 角色定位（Why）
//! - 把“发出一个已构造好的线上请求并取回完整响应”抽象为 [`WireTransport`]，
//!   执行器只关心请求构造与响应解析；
//! - 默认的 [`HyperTransport`] 持有一个共享只读的 hyper 客户端，连接池是其内部事务。
//!
//! ## 契约（What）
//! - 超时与取消由调用方（执行器）负责，传输实现只需在底层报告超时时返回
//!   [`TransportError::TimedOut`]；
//! - 响应体总是被完整读取后返回。

use std::error::Error;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// 已构造完成的线上请求，对应一次尝试。
#[derive(Clone, Debug)]
pub struct WireRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WireRequest {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// 完整读取的线上响应。
#[derive(Clone, Debug)]
pub struct WireResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 线上传输失败。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("wire request timed out")]
    TimedOut,
    #[error("wire request rejected before sending: {0}")]
    InvalidRequest(String),
    #[error("wire request failed: {0}")]
    Failed(#[source] Box<dyn Error + Send + Sync + 'static>),
}

impl TransportError {
    /// 包装底层错误；若错误链中存在 `io::ErrorKind::TimedOut` 则归一为超时。
    pub fn from_source(err: impl Error + Send + Sync + 'static) -> Self {
        if chain_timed_out(&err) {
            TransportError::TimedOut
        } else {
            TransportError::Failed(Box::new(err))
        }
    }
}

fn chain_timed_out(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(source) = current {
        if let Some(io_err) = source.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = source.source();
    }
    false
}

/// 线上传输契约。
#[async_trait]
pub trait WireTransport: Send + Sync + 'static {
    async fn round_trip(&self, request: WireRequest) -> Result<WireResponse, TransportError>;
}

/// 基于 hyper 1 + hyper-util legacy 客户端的 HTTP/1 传输。
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WireTransport for HyperTransport {
    async fn round_trip(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let WireRequest {
            method,
            uri,
            headers,
            body,
        } = request;
        let mut outbound = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        outbound.headers_mut().extend(headers);

        let response = self
            .client
            .request(outbound)
            .await
            .map_err(TransportError::from_source)?;
        let (parts, incoming) = response.into_parts();
        let body = incoming
            .collect()
            .await
            .map_err(TransportError::from_source)?
            .to_bytes();
        Ok(WireResponse {
            status: parts.status.as_u16(),
            headers: parts.headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connect failed")]
    struct Wrapped(#[source] io::Error);

    #[test]
    fn nested_io_timeout_is_normalized() {
        let err = TransportError::from_source(Wrapped(io::Error::new(
            io::ErrorKind::TimedOut,
            "deadline",
        )));
        assert!(matches!(err, TransportError::TimedOut));

        let err = TransportError::from_source(Wrapped(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(matches!(err, TransportError::Failed(_)));
    }
}
