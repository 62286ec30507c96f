//! # executor 模块说明
//!
//! ## 角色定位（Why）
//! - 针对一个已选定的节点执行恰好一次一元调用：组装头部、构造线上请求、发送、
//!   等待响应并解析或映射错误；
//! - 作为调用包装链最内层的“原始调用”，由 [`Executor::call_func`] 暴露为 [`CallFunc`]。
//!
//! ## 契约（What）
//! - 头部 = 上下文元数据原样透传 + `Timeout`（剩余预算，纳秒）+ `Content-Type`；
//! - 状态码 < 400 直接解码；≥ 400 时先查错误映射（精确状态码，其次 `default`），
//!   未命中则返回携带原始状态码与响应体文本的线上错误；
//! - 传输超时、本地预算耗尽都归一为 `Timeout` 类错误；上下文取消同样以 408 结束。

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde_json::Value;
use spark_rpc_core::error::codes;
use spark_rpc_core::{
    CallContext, CallFunc, CallOptions, Codec, CodecRegistry, DoneReason, ErrorMap, Node,
    Request, RpcError,
};

use crate::builder::build_request;
use crate::headers;
use crate::transport::{TransportError, WireTransport};

/// 单次尝试执行器。传输客户端在所有调用之间只读共享。
pub struct Executor {
    transport: Arc<dyn WireTransport>,
    codecs: CodecRegistry,
}

impl Executor {
    pub fn new(transport: Arc<dyn WireTransport>, codecs: CodecRegistry) -> Self {
        Self { transport, codecs }
    }

    /// 以原始调用的形式暴露执行器，供包装链组合。
    pub fn call_func(self: &Arc<Self>) -> CallFunc {
        let executor = Arc::clone(self);
        Arc::new(move |ctx: CallContext, node: Node, request: Request, options: CallOptions| {
            let executor = Arc::clone(&executor);
            async move { executor.execute(&ctx, &node, &request, &options).await }.boxed()
        })
    }

    /// 执行一次尝试。
    pub async fn execute(
        &self,
        ctx: &CallContext,
        node: &Node,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Value, RpcError> {
        let codec = self
            .codecs
            .get(request.content_type())
            .ok_or_else(|| RpcError::unsupported_content_type(request.content_type()))?;

        let budget = ctx.remaining().unwrap_or(options.request_timeout);
        let headers = outbound_headers(ctx, budget, request.content_type())?;
        let wire = build_request(
            node.address(),
            request,
            codec.as_ref(),
            &options.overrides,
            headers,
        )?;
        tracing::trace!(
            service = request.service(),
            endpoint = request.endpoint(),
            node = node.address(),
            method = %wire.method,
            uri = %wire.uri,
            "sending wire request"
        );

        let response = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                return Err(RpcError::request_timeout(DoneReason::Cancelled.to_string())
                    .with_node(node.address()));
            }
            outcome = tokio::time::timeout(budget, self.transport.round_trip(wire)) => outcome,
        };
        let response = match response {
            Err(_elapsed) => {
                return Err(RpcError::wire_timeout(format!(
                    "no response within {budget:?}"
                ))
                .with_node(node.address()));
            }
            Ok(Err(err)) => return Err(map_transport_error(err).with_node(node.address())),
            Ok(Ok(response)) => response,
        };

        tracing::debug!(
            service = request.service(),
            endpoint = request.endpoint(),
            node = node.address(),
            status = response.status,
            "wire response received"
        );
        parse_response(
            response.status,
            &response.body,
            codec.as_ref(),
            options.overrides.error_map.as_ref(),
        )
        .map_err(|err| err.with_node(node.address()))
    }
}

fn map_transport_error(err: TransportError) -> RpcError {
    match err {
        TransportError::TimedOut => RpcError::wire_timeout("transport reported a timeout"),
        TransportError::InvalidRequest(reason) => RpcError::bad_request(reason),
        other => RpcError::internal(codes::WIRE_FAILED, other.to_string()).with_cause(other),
    }
}

/// 组装出站头部：元数据原样透传，再写入超时预算与内容类型。
pub fn outbound_headers(
    ctx: &CallContext,
    budget: Duration,
    content_type: &str,
) -> Result<HeaderMap, RpcError> {
    let mut map = HeaderMap::new();
    if let Some(metadata) = ctx.metadata() {
        for (key, value) in metadata.iter() {
            insert_header(&mut map, key, value)?;
        }
    }
    insert_header(&mut map, headers::TIMEOUT, &budget.as_nanos().to_string())?;
    insert_header(&mut map, headers::CONTENT_TYPE, content_type)?;
    Ok(map)
}

fn insert_header(map: &mut HeaderMap, key: &str, value: &str) -> Result<(), RpcError> {
    let name = HeaderName::from_bytes(key.as_bytes())
        .map_err(|err| RpcError::bad_request(format!("invalid header name {key}: {err}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|err| RpcError::bad_request(format!("invalid value for header {key}: {err}")))?;
    map.insert(name, value);
    Ok(())
}

/// 按状态码解析响应体。
pub fn parse_response(
    status: u16,
    body: &[u8],
    codec: &dyn Codec,
    error_map: Option<&ErrorMap>,
) -> Result<Value, RpcError> {
    if status < 400 {
        return codec.unmarshal(body).map_err(RpcError::from);
    }
    if let Some(decoder) = error_map.and_then(|map| map.lookup(status)) {
        let decoded = decoder.decode(codec, body).map_err(RpcError::from)?;
        return Err(RpcError::mapped(status, decoded));
    }
    Err(RpcError::wire(
        status,
        String::from_utf8_lossy(body).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_rpc_core::{ErrorKind, JsonCodec, Metadata};

    #[test]
    fn headers_carry_metadata_budget_and_content_type() {
        let ctx = CallContext::new().with_metadata(Metadata::from_iter([("X-Tenant", "acme")]));
        let map = outbound_headers(&ctx, Duration::from_millis(1500), "application/json")
            .expect("合法头部");
        assert_eq!(map["x-tenant"], "acme");
        assert_eq!(map["timeout"], "1500000000");
        assert_eq!(map["content-type"], "application/json");
    }

    #[test]
    fn invalid_metadata_is_a_bad_request() {
        let ctx = CallContext::new().with_metadata(Metadata::from_iter([("bad header", "x")]));
        let err = outbound_headers(&ctx, Duration::from_secs(1), "application/json")
            .expect_err("非法头部名");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn undecodable_success_body_is_internal() {
        let err = parse_response(200, b"{not json", &JsonCodec, None).expect_err("非法 JSON");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.code(), codes::DECODE_FAILED);
    }
}
