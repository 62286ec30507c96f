use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use spark_rpc_core::{
    CallContext, CallOptions, Codec, CodecRegistry, ErrorMap, Metadata, Node, Request, RpcError,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, watch};

use super::frame::{self, Frame, FrameError};
use crate::executor::parse_response;
use crate::headers;
use crate::io::{DIAL, OperationKind, READ, SHUTDOWN, WRITE, map_io_error, run_with_context};

/// 一条独占 TCP 连接上的双工会话。
///
/// 克隆只复制句柄，可把发送与接收分别交给两个任务；同方向的并发操作由内部互斥锁串行化。
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("service", &self.inner.request.service())
            .field("endpoint", &self.inner.request.endpoint())
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct SessionInner {
    request: Request,
    remote: SocketAddr,
    codec: Arc<dyn Codec>,
    headers: Metadata,
    error_map: Option<ErrorMap>,
    max_frame_bytes: usize,
    reader: AsyncMutex<Option<BufReader<OwnedReadHalf>>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    last_error: Mutex<Option<RpcError>>,
}

/// 拨号并建立会话，作为编排器中流式调用的单次尝试。
pub(crate) async fn dial(
    ctx: &CallContext,
    node: &Node,
    request: &Request,
    options: &CallOptions,
    codecs: &CodecRegistry,
    max_frame_bytes: usize,
) -> Result<StreamSession, RpcError> {
    let codec = codecs
        .get(request.content_type())
        .ok_or_else(|| RpcError::unsupported_content_type(request.content_type()))?;
    let target = dial_target(node.address())?;
    let budget = ctx.remaining().unwrap_or(options.request_timeout);
    let headers = session_headers(ctx, budget, request);

    let dial_timeout = options.dial_timeout;
    let connect = async {
        if dial_timeout.is_zero() {
            return TcpStream::connect(target.as_str()).await;
        }
        match tokio::time::timeout(dial_timeout, TcpStream::connect(target.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {target} exceeded {dial_timeout:?}"),
            )),
        }
    };
    let stream = run_with_context(ctx, DIAL, connect)
        .await
        .map_err(|err| err.with_node(node.address()))?;
    stream
        .set_nodelay(true)
        .map_err(|err| map_io_error(DIAL, err))?;
    let remote = stream.peer_addr().map_err(|err| map_io_error(DIAL, err))?;
    let (read_half, write_half) = stream.into_split();
    let (closed, _) = watch::channel(false);

    tracing::debug!(
        service = request.service(),
        endpoint = request.endpoint(),
        node = node.address(),
        remote = %remote,
        "stream session established"
    );

    Ok(StreamSession {
        inner: Arc::new(SessionInner {
            request: request.clone(),
            remote,
            codec,
            headers,
            error_map: options.overrides.error_map.clone(),
            max_frame_bytes,
            reader: AsyncMutex::new(Some(BufReader::new(read_half))),
            writer: AsyncMutex::new(Some(write_half)),
            closed,
            last_error: Mutex::new(None),
        }),
    })
}

/// 把节点地址归一为 `host:port`；完整 URL 只保留主机与端口。
fn dial_target(address: &str) -> Result<String, RpcError> {
    if !address.contains("://") {
        return Ok(address.to_string());
    }
    let uri: http::Uri = address
        .parse()
        .map_err(|err| RpcError::bad_request(format!("invalid stream address {address}: {err}")))?;
    let host = uri
        .host()
        .ok_or_else(|| RpcError::bad_request(format!("stream address {address} has no host")))?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
    Ok(format!("{host}:{port}"))
}

fn session_headers(ctx: &CallContext, budget: Duration, request: &Request) -> Metadata {
    let mut map = ctx.metadata().cloned().unwrap_or_default();
    map.insert(headers::TIMEOUT, budget.as_nanos().to_string());
    map.insert(headers::CONTENT_TYPE, request.content_type());
    map.insert(headers::SERVICE, request.service());
    map.insert(headers::ENDPOINT, request.endpoint());
    map
}

impl StreamSession {
    /// 建立会话时使用的逻辑请求。
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// 随每一帧发送的会话头部。
    pub fn headers(&self) -> &Metadata {
        &self.inner.headers
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// 最近一次收发失败。
    pub fn last_error(&self) -> Option<RpcError> {
        self.inner.last_error.lock().clone()
    }

    pub async fn send<T>(&self, message: &T) -> Result<(), RpcError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(message).map_err(|err| {
            self.track(RpcError::bad_request(format!("message is not serializable: {err}")))
        })?;
        self.send_value(&value).await
    }

    /// 编码并发送一条消息。
    pub async fn send_value(&self, value: &Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(self.track(RpcError::session_closed()));
        }
        let body = self
            .inner
            .codec
            .marshal(value)
            .map_err(|err| self.track(RpcError::from(err)))?;
        let frame = Frame::new(self.inner.headers.clone(), body);

        let closed = self.inner.closed.subscribe();
        let mut writer = self.inner.writer.lock().await;
        let Some(half) = writer.as_mut() else {
            return Err(self.track(RpcError::session_closed()));
        };
        let outcome = tokio::select! {
            biased;
            _ = closed_signal(closed) => return Err(self.track(RpcError::session_closed())),
            outcome = frame::write_frame(half, &frame, self.inner.max_frame_bytes) => outcome,
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err @ (FrameError::TooLarge { .. } | FrameError::MalformedHeader(_))) => {
                Err(self.track(RpcError::bad_request(err.to_string()).with_cause(err)))
            }
            Err(err) => {
                writer.take();
                self.mark_closed();
                Err(self.track(frame_error(WRITE, err)))
            }
        }
    }

    pub async fn recv<T>(&self) -> Result<T, RpcError>
    where
        T: DeserializeOwned,
    {
        let value = self.recv_value().await?;
        serde_json::from_value(value).map_err(|err| {
            self.track(RpcError::internal(
                spark_rpc_core::codes::DECODE_FAILED,
                format!("stream message does not match target type: {err}"),
            ))
        })
    }

    /// 接收并解码一条消息；携带 `Status ≥ 400` 的帧按一元调用的规则映射为错误。
    pub async fn recv_value(&self) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(self.track(RpcError::session_closed()));
        }
        let closed = self.inner.closed.subscribe();
        let mut reader = self.inner.reader.lock().await;
        let Some(half) = reader.as_mut() else {
            return Err(self.track(RpcError::session_closed()));
        };
        let outcome = tokio::select! {
            biased;
            _ = closed_signal(closed) => return Err(self.track(RpcError::session_closed())),
            outcome = frame::read_frame(half, self.inner.max_frame_bytes) => outcome,
        };
        let frame = match outcome {
            Ok(frame) => frame,
            Err(err) => {
                reader.take();
                self.mark_closed();
                return Err(self.track(frame_error(READ, err)));
            }
        };
        drop(reader);

        parse_response(
            frame.status().unwrap_or(200),
            &frame.body,
            self.inner.codec.as_ref(),
            self.inner.error_map.as_ref(),
        )
        .map_err(|err| self.track(err))
    }

    /// 关闭会话。重复调用是无副作用的空操作。
    pub async fn close(&self) -> Result<(), RpcError> {
        let first = self.mark_closed();
        let writer = self.inner.writer.lock().await.take();
        drop(self.inner.reader.lock().await.take());

        if let Some(mut half) = writer {
            if let Err(err) = half.shutdown().await {
                if err.kind() != io::ErrorKind::NotConnected {
                    return Err(self.track(map_io_error(SHUTDOWN, err)));
                }
            }
        }
        if first {
            tracing::debug!(
                service = self.inner.request.service(),
                endpoint = self.inner.request.endpoint(),
                remote = %self.inner.remote,
                "stream session closed"
            );
        }
        Ok(())
    }

    /// 置关闭标志，返回本次调用是否完成了状态迁移。
    fn mark_closed(&self) -> bool {
        self.inner.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    fn track(&self, err: RpcError) -> RpcError {
        *self.inner.last_error.lock() = Some(err.clone());
        err
    }
}

async fn closed_signal(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

fn frame_error(kind: OperationKind, err: FrameError) -> RpcError {
    match err {
        FrameError::Io(io_err) => map_io_error(kind, io_err),
        other => RpcError::from(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_target_reduces_urls_to_host_port() {
        assert_eq!(dial_target("10.0.0.1:9000").expect("host:port"), "10.0.0.1:9000");
        assert_eq!(
            dial_target("http://svc.internal:8080/v1").expect("url"),
            "svc.internal:8080"
        );
        assert_eq!(dial_target("https://svc.internal").expect("url"), "svc.internal:443");
    }

    #[test]
    fn session_headers_extend_metadata() {
        let ctx = CallContext::new().with_metadata(Metadata::from_iter([("X-Trace", "t1")]));
        let request = Request::new("chat", "Chat.Stream", "application/json", Value::Null);
        let sent = session_headers(&ctx, Duration::from_secs(2), &request);
        assert_eq!(sent.get("x-trace"), Some("t1"));
        assert_eq!(sent.get(headers::TIMEOUT), Some("2000000000"));
        assert_eq!(sent.get(headers::CONTENT_TYPE), Some("application/json"));
        assert_eq!(sent.get(headers::ENDPOINT), Some("Chat.Stream"));
    }
}
