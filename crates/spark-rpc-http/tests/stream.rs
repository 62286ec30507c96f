//! 流式会话：帧收发、状态映射、幂等关闭与拨号重试。

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use spark_rpc_core::{
    CallContext, CallOption, ClientOptions, ConstantBackoff, ErrorKind, ErrorMap, Metadata,
    NoBackoff, RetryAlways, RoundRobinSelector, codes,
};
use spark_rpc_http::stream::frame::{read_frame, write_frame};
use spark_rpc_http::{Frame, HttpClient, StreamSession, headers};
use tokio::net::TcpListener;

const LIMIT: usize = 1 << 20;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Chat {
    from: String,
    text: String,
}

#[derive(Debug, Deserialize, thiserror::Error)]
#[error("chat rejected: {reason}")]
struct Rejected {
    reason: String,
}

/// 回显对端：把收到的每一帧连同头部原样写回，并把首帧头部交给测试。
async fn spawn_echo_peer() -> (SocketAddr, tokio::sync::oneshot::Receiver<Metadata>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定端口");
    let addr = listener.local_addr().expect("本地地址");
    let (headers_tx, headers_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (mut reader, mut writer) = stream.into_split();
        let mut headers_tx = Some(headers_tx);
        loop {
            let Ok(frame) = read_frame(&mut reader, LIMIT).await else {
                return;
            };
            if let Some(tx) = headers_tx.take() {
                let _ = tx.send(frame.headers.clone());
            }
            if write_frame(&mut writer, &frame, LIMIT).await.is_err() {
                return;
            }
        }
    });
    (addr, headers_rx)
}

/// 拒绝对端：接受任意多条连接，对每一帧都回以 `Status: 403` 的错误帧。
async fn spawn_rejecting_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定端口");
    let addr = listener.local_addr().expect("本地地址");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                while read_frame(&mut reader, LIMIT).await.is_ok() {
                    let reply = Frame::new(
                        Metadata::from_iter([(headers::STATUS, "403")]),
                        Bytes::from_static(br#"{"reason":"muted"}"#),
                    );
                    if write_frame(&mut writer, &reply, LIMIT).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// 为单次收发设置上限，回归时以失败代替挂起。
async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("操作应在 5 秒内完成")
}

async fn open(client: &HttpClient, addr: SocketAddr, extra: Vec<CallOption>) -> StreamSession {
    let request = client
        .new_request("chat", "Chat.Stream", &json!({ "room": "lobby" }))
        .expect("请求");
    let mut options = vec![CallOption::address([addr.to_string()])];
    options.extend(extra);
    client
        .stream(&CallContext::new(), &request, options)
        .await
        .expect("建立会话")
}

#[tokio::test(flavor = "multi_thread")]
async fn session_sends_and_receives_typed_messages() {
    let (addr, first_headers) = spawn_echo_peer().await;
    let client = HttpClient::new(ClientOptions::default());
    let session = open(&client, addr, Vec::new()).await;
    assert_eq!(session.remote_addr(), addr);

    let message = Chat {
        from: "ada".to_string(),
        text: "hello".to_string(),
    };
    session.send(&message).await.expect("发送");
    let echoed: Chat = within(session.recv()).await.expect("接收");
    assert_eq!(echoed, message);

    let seen = first_headers.await.expect("对端收到首帧");
    assert_eq!(seen.get(headers::CONTENT_TYPE), Some("application/json"));
    assert_eq!(seen.get(headers::ENDPOINT), Some("Chat.Stream"));
    assert!(seen.get(headers::TIMEOUT).is_some());

    session.close().await.expect("关闭");
}

#[tokio::test(flavor = "multi_thread")]
async fn close_is_idempotent_and_fences_io() {
    let (addr, _) = spawn_echo_peer().await;
    let client = HttpClient::new(ClientOptions::default());
    let session = open(&client, addr, Vec::new()).await;

    session.close().await.expect("首次关闭");
    session.close().await.expect("重复关闭仍成功");
    assert!(session.is_closed());

    let err = session
        .send(&json!({ "text": "late" }))
        .await
        .expect_err("关闭后不可发送");
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
    let err = session.recv_value().await.expect_err("关闭后不可接收");
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
    assert_eq!(
        session.last_error().map(|err| err.kind()),
        Some(ErrorKind::SessionClosed)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn close_interrupts_a_pending_receive() {
    let (addr, _) = spawn_echo_peer().await;
    let client = HttpClient::new(ClientOptions::default());
    let session = open(&client, addr, Vec::new()).await;

    let receiver = session.clone();
    let pending = tokio::spawn(async move { receiver.recv_value().await });
    tokio::task::yield_now().await;
    session.close().await.expect("关闭");

    let err = within(pending)
        .await
        .expect("接收任务结束")
        .expect_err("关闭打断接收");
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
}

#[tokio::test(flavor = "multi_thread")]
async fn error_status_frames_follow_the_unary_rules() {
    let addr = spawn_rejecting_peer().await;
    let client = HttpClient::new(ClientOptions::default());

    let session = open(&client, addr, Vec::new()).await;
    session.send(&json!({ "text": "hi" })).await.expect("发送");
    let err = within(session.recv_value()).await.expect_err("对端拒绝");
    assert_eq!(err.kind(), ErrorKind::Wire);
    assert_eq!(err.status(), 403);
    assert!(!session.is_closed(), "状态错误不影响会话");

    let mapped = open(
        &client,
        addr,
        vec![CallOption::error_map(ErrorMap::new().otherwise::<Rejected>())],
    )
    .await;
    mapped.send(&json!({ "text": "hi" })).await.expect("发送");
    let err = within(mapped.recv_value()).await.expect_err("对端拒绝");
    assert_eq!(err.kind(), ErrorKind::Mapped);
    assert_eq!(err.domain_error::<Rejected>().map(|e| e.reason.as_str()), Some("muted"));
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_hangup_closes_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定端口");
    let addr = listener.local_addr().expect("本地地址");
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let client = HttpClient::new(ClientOptions::default());
    let session = open(&client, addr, Vec::new()).await;
    let err = within(session.recv_value()).await.expect_err("对端已挂断");
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
    assert!(session.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn dial_failures_are_retried_and_recorded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定端口");
    let addr = listener.local_addr().expect("本地地址");
    drop(listener);

    let selector = Arc::new(RoundRobinSelector::new());
    let options = ClientOptions::default()
        .with_selector(selector.clone())
        .with_backoff(Arc::new(NoBackoff))
        .with_retry(Arc::new(RetryAlways))
        .with_retries(2);
    let client = HttpClient::new(options);
    let request = client
        .new_request("chat", "Chat.Stream", &json!({}))
        .expect("请求");

    let err = client
        .stream(
            &CallContext::new(),
            &request,
            [CallOption::address([addr.to_string()])],
        )
        .await
        .expect_err("端口未监听");
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.node(), Some(addr.to_string().as_str()));

    let stats = selector.stats(&addr.to_string());
    assert_eq!(stats.failures, 3);
    assert_eq!(stats.successes, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_between_dial_attempts_ends_the_stream_call() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定端口");
    let addr = listener.local_addr().expect("本地地址");
    drop(listener);

    let options = ClientOptions::default()
        .with_backoff(Arc::new(ConstantBackoff(Duration::from_secs(10))))
        .with_retry(Arc::new(RetryAlways))
        .with_retries(3);
    let client = HttpClient::new(options);
    let request = client
        .new_request("chat", "Chat.Stream", &json!({}))
        .expect("请求");

    let ctx = CallContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = within(client.stream(&ctx, &request, [CallOption::address([addr.to_string()])]))
        .await
        .expect_err("退避期间被取消");
    assert_eq!(err.code(), codes::REQUEST_TIMEOUT);
    assert_eq!(err.status(), 408);
    assert!(started.elapsed() < Duration::from_secs(5), "取消应打断 10 秒退避");
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_deadline_skips_the_dial() {
    let (addr, _) = spawn_echo_peer().await;
    let client = HttpClient::new(ClientOptions::default());
    let request = client
        .new_request("chat", "Chat.Stream", &json!({}))
        .expect("请求");

    let ctx = CallContext::new().with_timeout(Duration::ZERO);
    let err = client
        .stream(&ctx, &request, [CallOption::address([addr.to_string()])])
        .await
        .expect_err("截止已过");
    assert!(err.is_timeout());
    assert_eq!(err.status(), 408);
}
