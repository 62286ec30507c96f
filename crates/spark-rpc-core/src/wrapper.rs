//! 调用包装链：在原始线上调用外层叠加日志、鉴权、指标等横切逻辑。
//!
//! 注册顺序即外层到内层的顺序：最先注册的包装器最先看到调用，
//! 最后注册的包装器紧贴原始调用。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::CallContext;
use crate::error::Result;
use crate::options::CallOptions;
use crate::request::Request;
use crate::selector::Node;

/// 单次尝试的异步结果。
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'static>>;

/// 可被包装的调用函数：上下文、节点、请求、调用选项 → 解码后的响应。
pub type CallFunc = Arc<dyn Fn(CallContext, Node, Request, CallOptions) -> CallFuture + Send + Sync>;

/// 调用包装器。
pub trait CallWrapper: Send + Sync + 'static {
    fn wrap(&self, next: CallFunc) -> CallFunc;
}

impl<F> CallWrapper for F
where
    F: Fn(CallFunc) -> CallFunc + Send + Sync + 'static,
{
    fn wrap(&self, next: CallFunc) -> CallFunc {
        self(next)
    }
}

/// 以注册的逆序逐层包装 `raw`。
pub fn compose(raw: CallFunc, wrappers: &[Arc<dyn CallWrapper>]) -> CallFunc {
    wrappers
        .iter()
        .rev()
        .fold(raw, |next, wrapper| wrapper.wrap(next))
}
