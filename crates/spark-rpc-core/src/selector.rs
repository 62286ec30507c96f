//! # selector 模块说明
//!
//! ## 角色定位（Why）
//! - 在一次调用的候选路由中挑选节点，并接收每次尝试的结果反馈；
//! - `select` 每次调用只执行一次，返回的 [`Next`] 在每次尝试前被调用，
//!   因而重试会自然轮换到下一个节点。
//!
//! ## 契约（What）
//! - `record` 返回错误视为致命：编排器立即放弃本次调用；
//! - 选择器必须 `Send + Sync`，`Next` 会被移动到独立的尝试任务中执行。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, RpcError, codes};
use crate::router::Route;

/// 被选中的目标节点。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    address: String,
}

impl Node {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl From<&Route> for Node {
    fn from(route: &Route) -> Self {
        Node::new(route.address())
    }
}

/// 每次尝试前调用一次，返回本次尝试的目标节点。
pub type Next = Arc<dyn Fn() -> Node + Send + Sync>;

/// 节点选择契约。
pub trait Selector: Send + Sync + 'static {
    fn select(&self, routes: &[Route]) -> Result<Next>;

    /// 记录一次尝试的结果；`outcome` 为 `Err` 表示该尝试失败。
    fn record(&self, node: &Node, outcome: std::result::Result<(), &RpcError>) -> Result<()>;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// 单节点累计统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub successes: u64,
    pub failures: u64,
}

/// 轮询选择器。
///
/// 每次 `select` 从全局游标处起步，保证并发调用之间分散负载；同一次调用内的
/// 重试按候选顺序依次前进。
#[derive(Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
    stats: Mutex<HashMap<String, NodeStats>>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, address: &str) -> NodeStats {
        self.stats.lock().get(address).copied().unwrap_or_default()
    }
}

impl Selector for RoundRobinSelector {
    fn select(&self, routes: &[Route]) -> Result<Next> {
        if routes.is_empty() {
            return Err(RpcError::internal(
                codes::NO_ROUTE,
                "selector received no routes",
            ));
        }
        let nodes: Vec<Node> = routes.iter().map(Node::from).collect();
        let position = AtomicUsize::new(self.cursor.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(move || {
            let index = position.fetch_add(1, Ordering::Relaxed) % nodes.len();
            nodes[index].clone()
        }))
    }

    fn record(&self, node: &Node, outcome: std::result::Result<(), &RpcError>) -> Result<()> {
        let mut stats = self.stats.lock();
        let entry = stats.entry(node.address().to_string()).or_default();
        match outcome {
            Ok(()) => entry.successes += 1,
            Err(_) => entry.failures += 1,
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
