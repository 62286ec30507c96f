//! # client 模块说明
//!
//! ## 角色定位（Why）
//! - [`HttpClient`] 是调用方唯一的入口：构造请求与消息、一元调用、流式调用、事件发布；
//! - 一元调用与流式调用共用同一个编排状态机 [`HttpClient::orchestrate`]，
//!   区别只在于单次尝试执行的是“线上请求”还是“拨号建会话”。
//!
//! ## 编排流程（How）
//! 1. **Setup**：克隆客户端默认选项并叠加调用级选项；派生调用作用域，
//!    无截止时以请求超时设定截止，已有截止时以剩余时长作为有效请求超时；
//! 2. **Preflight**：作用域已结束则直接返回 408，不做任何 I/O；
//! 3. **Resolve**：经路由器（或钉住的地址列表）解析候选路由，失败即结束；
//! 4. **Select**：交给选择器得到 `Next`；
//! 5. **Attempt loop**：第 i 次尝试在独立任务中依次执行退避、取节点、执行、回报结果，
//!    编排器在“作用域结束”与“尝试完成”之间竞速；成功即返回，失败则咨询重试策略；
//! 6. 尝试耗尽时返回最后一次错误。
//!
//! ## 契约（What）
//! - 退避策略、重试策略、`Selector::record` 的错误都是致命的策略错误；
//! - 作用域在调用返回时被取消（`DropGuard`），被放弃的尝试会尽快结束，其结果通过
//!   单槽 `oneshot` 丢弃，不会阻塞也不会泄漏。

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use spark_rpc_core::error::codes;
use spark_rpc_core::{
    CallContext, CallOption, CallOptions, ClientOptions, Message, Next, Node, Payload, Request,
    RpcError, Selector, compose, lookup_routes,
};
use tokio::sync::oneshot;

use crate::executor::Executor;
use crate::publish::{self, PublishOption, PublishOptions};
use crate::stream::{self, StreamSession};
use crate::transport::{HyperTransport, WireTransport};

/// 一次尝试：上下文、节点、请求、调用选项 → 结果。
type AttemptFn<T> =
    Arc<dyn Fn(CallContext, Node, Request, CallOptions) -> BoxFuture<'static, Result<T, RpcError>> + Send + Sync>;

/// RPC 客户端。克隆只增加引用计数。
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    executor: Arc<Executor>,
}

impl HttpClient {
    /// 使用默认 hyper 传输构造客户端。
    pub fn new(options: ClientOptions) -> Self {
        Self::with_transport(options, Arc::new(HyperTransport::new()))
    }

    /// 使用指定的线上传输构造客户端。
    pub fn with_transport(options: ClientOptions, transport: Arc<dyn WireTransport>) -> Self {
        let executor = Arc::new(Executor::new(transport, options.codecs.clone()));
        Self {
            inner: Arc::new(ClientInner { options, executor }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// 以客户端默认内容类型构造请求。
    pub fn new_request<T>(
        &self,
        service: impl Into<String>,
        endpoint: impl Into<String>,
        message: &T,
    ) -> Result<Request, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let content_type = self.inner.options.content_type.clone();
        self.new_request_as(service, endpoint, message, content_type)
    }

    /// 以指定内容类型构造请求。
    pub fn new_request_as<T>(
        &self,
        service: impl Into<String>,
        endpoint: impl Into<String>,
        message: &T,
        content_type: impl Into<String>,
    ) -> Result<Request, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let body = to_value(message)?;
        Ok(Request::new(service, endpoint, content_type, body))
    }

    /// 以客户端默认内容类型构造事件消息。
    pub fn new_message<T>(&self, topic: impl Into<String>, message: &T) -> Result<Message, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let payload = Payload::Value(to_value(message)?);
        Ok(Message::new(
            topic,
            self.inner.options.content_type.clone(),
            payload,
        ))
    }

    /// 以已编码好的帧构造事件消息，发布时原样转发。
    pub fn new_frame_message(&self, topic: impl Into<String>, frame: Bytes) -> Message {
        Message::new(
            topic,
            self.inner.options.content_type.clone(),
            Payload::Frame(frame),
        )
    }

    /// 一元调用，响应解码为 `T`。
    pub async fn call<T, I>(&self, ctx: &CallContext, request: &Request, options: I) -> Result<T, RpcError>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = CallOption>,
    {
        let value = self.call_value(ctx, request, options).await?;
        serde_json::from_value(value).map_err(|err| {
            RpcError::internal(
                codes::DECODE_FAILED,
                format!("response does not match target type: {err}"),
            )
        })
    }

    /// 一元调用，返回编解码器解出的中间值。
    pub async fn call_value<I>(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: I,
    ) -> Result<Value, RpcError>
    where
        I: IntoIterator<Item = CallOption>,
    {
        let options = self.effective_options(options);
        let attempt: AttemptFn<Value> = compose(self.inner.executor.call_func(), &options.wrappers);
        self.orchestrate(ctx, request, options, attempt).await
    }

    /// 建立流式会话。连接重试遵循与一元调用相同的退避/重试/回报流程；不经过调用包装链。
    pub async fn stream<I>(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: I,
    ) -> Result<StreamSession, RpcError>
    where
        I: IntoIterator<Item = CallOption>,
    {
        let options = self.effective_options(options);
        let codecs = self.inner.options.codecs.clone();
        let max_frame_bytes = self.inner.options.max_frame_bytes;
        let attempt: AttemptFn<StreamSession> = Arc::new(
            move |ctx: CallContext, node: Node, request: Request, options: CallOptions| {
                let codecs = codecs.clone();
                async move {
                    stream::dial(&ctx, &node, &request, &options, &codecs, max_frame_bytes).await
                }
                .boxed()
            },
        );
        self.orchestrate(ctx, request, options, attempt).await
    }

    /// 发布事件。不路由、不选择、不重试。
    pub async fn publish<I>(
        &self,
        ctx: &CallContext,
        message: &Message,
        options: I,
    ) -> Result<(), RpcError>
    where
        I: IntoIterator<Item = PublishOption>,
    {
        let options = PublishOptions::default().apply(options);
        publish::publish(&self.inner.options, ctx, message, options).await
    }

    fn effective_options<I>(&self, options: I) -> CallOptions
    where
        I: IntoIterator<Item = CallOption>,
    {
        let mut options = self.inner.options.call_options(options);
        if let Some(proxy) = &self.inner.options.proxy {
            options.address = vec![proxy.clone()];
        }
        options
    }

    async fn orchestrate<T>(
        &self,
        ctx: &CallContext,
        request: &Request,
        mut options: CallOptions,
        attempt: AttemptFn<T>,
    ) -> Result<T, RpcError>
    where
        T: Send + 'static,
    {
        let (scope, request_timeout) = ctx.scoped(options.request_timeout);
        let _scope_guard = scope.cancellation().clone().drop_guard();
        options.request_timeout = request_timeout;

        if let Some(reason) = scope.done_reason() {
            return Err(RpcError::request_timeout(reason.to_string()));
        }

        let routes = lookup_routes(&scope, request, &options).await?;
        let selector = options
            .selector
            .clone()
            .ok_or_else(|| RpcError::internal(codes::NO_ROUTE, "no selector configured"))?;
        let next = selector.select(&routes)?;

        tracing::debug!(
            service = request.service(),
            endpoint = request.endpoint(),
            routes = routes.len(),
            retries = options.retries,
            timeout = ?request_timeout,
            "call started"
        );

        let mut last_error = None;
        for index in 0..=options.retries {
            let (tx, rx) = oneshot::channel();
            let job = AttemptJob {
                scope: scope.clone(),
                request: request.clone(),
                options: options.clone(),
                selector: Arc::clone(&selector),
                next: Arc::clone(&next),
                attempt: Arc::clone(&attempt),
                index,
            };
            tokio::spawn(async move {
                let _ = tx.send(job.run().await);
            });

            let outcome = tokio::select! {
                biased;
                reason = scope.done() => {
                    tracing::debug!(
                        service = request.service(),
                        endpoint = request.endpoint(),
                        attempt = index,
                        %reason,
                        "call abandoned in-flight attempt"
                    );
                    return Err(RpcError::request_timeout(reason.to_string()));
                }
                outcome = rx => outcome.map_err(|_| {
                    RpcError::internal(codes::ATTEMPT_ABORTED, "attempt task ended without reporting")
                })?,
            };

            let err = match outcome {
                AttemptOutcome::Fatal(err) => return Err(err),
                AttemptOutcome::Finished(Ok(value)) => {
                    tracing::debug!(
                        service = request.service(),
                        endpoint = request.endpoint(),
                        attempt = index,
                        "call succeeded"
                    );
                    return Ok(value);
                }
                AttemptOutcome::Finished(Err(err)) => err,
            };

            match options.retry.retry(&scope, request, index, &err) {
                Err(policy) => return Err(RpcError::policy("retry", policy)),
                Ok(false) => return Err(err),
                Ok(true) => {
                    tracing::warn!(
                        service = request.service(),
                        endpoint = request.endpoint(),
                        attempt = index,
                        node = err.node().unwrap_or("-"),
                        status = err.status(),
                        error = %err,
                        "attempt failed, retrying"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RpcError::internal(codes::INTERNAL, "call finished without any attempt")
        }))
    }
}

fn to_value<T>(message: &T) -> Result<Value, RpcError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_value(message)
        .map_err(|err| RpcError::bad_request(format!("message is not serializable: {err}")))
}

enum AttemptOutcome<T> {
    /// 策略错误：整个调用立即结束。
    Fatal(RpcError),
    Finished(Result<T, RpcError>),
}

struct AttemptJob<T> {
    scope: CallContext,
    request: Request,
    options: CallOptions,
    selector: Arc<dyn Selector>,
    next: Next,
    attempt: AttemptFn<T>,
    index: u32,
}

impl<T> AttemptJob<T>
where
    T: Send + 'static,
{
    async fn run(self) -> AttemptOutcome<T> {
        let delay = match self
            .options
            .backoff
            .backoff(&self.scope, &self.request, self.index)
        {
            Ok(delay) => delay,
            Err(err) => return AttemptOutcome::Fatal(RpcError::policy("backoff", err)),
        };
        if !delay.is_zero() {
            tokio::select! {
                biased;
                reason = self.scope.done() => {
                    return AttemptOutcome::Finished(Err(RpcError::request_timeout(reason.to_string())));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let node = (self.next)();
        tracing::trace!(
            service = self.request.service(),
            endpoint = self.request.endpoint(),
            attempt = self.index,
            node = node.address(),
            "attempt dispatched"
        );
        let result = (self.attempt)(
            self.scope.clone(),
            node.clone(),
            self.request.clone(),
            self.options.clone(),
        )
        .await;

        let recorded = self
            .selector
            .record(&node, result.as_ref().map(|_| ()));
        if let Err(err) = recorded {
            return AttemptOutcome::Fatal(RpcError::policy("selector record", err));
        }
        AttemptOutcome::Finished(result)
    }
}
