//! # publish 模块说明
//!
//! ## 角色定位（Why）
//! - 把一条事件消息编码后交给外部事件总线，不经过路由、选择与重试；
//!
//! ## 契约（What）
//! - 头部以上下文元数据为底（缺失则新建），再写入 `Content-Type` 与 `Topic`；
//! - `Payload::Frame` 原样转发，`Payload::Value` 经编解码器的事件信封编码；
//! - 交换区优先级：显式 [`PublishOption::exchange`] > 客户端构造期解析的 `publish_proxy` > 消息主题；
//! - 任何编码或投递失败都以单个错误返回。

use std::fmt;

use spark_rpc_core::error::codes;
use spark_rpc_core::{
    BrokerMessage, CallContext, ClientOptions, Message, MessageKind, Payload, RpcError,
};

use crate::headers;

/// 单次发布的选项。
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    pub exchange: Option<String>,
}

impl PublishOptions {
    pub fn apply<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = PublishOption>,
    {
        for option in options {
            (option.0)(&mut self);
        }
        self
    }
}

/// 对 [`PublishOptions`] 的一次修改。
pub struct PublishOption(Box<dyn FnOnce(&mut PublishOptions) + Send>);

impl PublishOption {
    /// 显式指定交换区，优先级最高。
    pub fn exchange(name: impl Into<String>) -> Self {
        let name = name.into();
        Self(Box::new(move |o| o.exchange = Some(name)))
    }
}

impl fmt::Debug for PublishOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PublishOption")
    }
}

/// 解析最终交换区。空字符串视为未设置。
pub fn resolve_exchange<'a>(
    explicit: Option<&'a str>,
    publish_proxy: Option<&'a str>,
    topic: &'a str,
) -> &'a str {
    explicit
        .filter(|name| !name.is_empty())
        .or(publish_proxy.filter(|name| !name.is_empty()))
        .unwrap_or(topic)
}

pub(crate) async fn publish(
    client: &ClientOptions,
    ctx: &CallContext,
    message: &Message,
    options: PublishOptions,
) -> Result<(), RpcError> {
    let broker = client
        .broker
        .as_ref()
        .ok_or_else(|| RpcError::internal(codes::NO_BROKER, "no broker configured for publish"))?;
    let codec = client
        .codecs
        .get(message.content_type())
        .ok_or_else(|| RpcError::unsupported_content_type(message.content_type()))?;

    let mut header = ctx.metadata().cloned().unwrap_or_default();
    header.insert(headers::CONTENT_TYPE, message.content_type());
    header.insert(headers::TOPIC, message.topic());

    let body = match message.payload() {
        Payload::Frame(frame) => frame.clone(),
        Payload::Value(value) => codec.write(MessageKind::Event, value)?,
    };

    let exchange = resolve_exchange(
        options.exchange.as_deref(),
        client.publish_proxy.as_deref(),
        message.topic(),
    );
    tracing::debug!(
        topic = message.topic(),
        exchange,
        bytes = body.len(),
        "publishing event"
    );
    broker
        .publish(ctx, exchange, BrokerMessage { header, body })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_exchange_beats_proxy_beats_topic() {
        assert_eq!(resolve_exchange(Some("audit"), Some("proxy"), "orders"), "audit");
        assert_eq!(resolve_exchange(None, Some("proxy"), "orders"), "proxy");
        assert_eq!(resolve_exchange(Some(""), None, "orders"), "orders");
    }
}
