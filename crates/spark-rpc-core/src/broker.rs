//! # broker 模块说明
//!
//! ## 角色定位（Why）
//! - 事件发布的出口：客户端把编码好的消息连同头部交给 [`Broker`]，由其投递到交换区；
//! - [`MemoryBroker`] 在进程内记录并分发消息，供测试与本地联调使用。

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::context::CallContext;
use crate::error::Result;
use crate::metadata::Metadata;

/// 交给事件总线的消息：头部 + 已编码的消息体。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    pub header: Metadata,
    pub body: Bytes,
}

/// 事件总线契约。
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, ctx: &CallContext, exchange: &str, message: BrokerMessage)
    -> Result<()>;
}

/// 进程内事件总线。
///
/// 每条发布的消息都会被记录，并推送给该交换区当前的全部订阅者；
/// 已关闭的订阅者在下一次投递时被移除。
#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<(String, BrokerMessage)>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BrokerMessage>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅一个交换区。
    pub fn subscribe(&self, exchange: &str) -> mpsc::UnboundedReceiver<BrokerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(exchange.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// 至今发布过的全部消息（交换区, 消息）。
    pub fn published(&self) -> Vec<(String, BrokerMessage)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        _ctx: &CallContext,
        exchange: &str,
        message: BrokerMessage,
    ) -> Result<()> {
        if let Some(subscribers) = self.subscribers.lock().get_mut(exchange) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        self.published.lock().push((exchange.to_string(), message));
        tracing::trace!(exchange, "memory broker delivered message");
        Ok(())
    }
}
