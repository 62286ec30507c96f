//! # context 模块说明
//!
//! ## 角色定位（Why）
//! - 为每次逻辑调用提供唯一的“截止 + 取消”作用域，并携带需要透传给对端的元数据；
//! - 编排器在调用入口派生一次子作用域，所有尝试、退避睡眠与流式拨号都挂在该作用域下。
//!
//! ## 契约（What）
//! - 截止时间使用 `tokio::time::Instant`，因此在 `start_paused` 测试中可被确定性推进；
//! - 子作用域共享父作用域的取消信号（父取消 ⇒ 子取消），反之不成立；
//! - 子作用域的截止时间不会晚于父作用域。

use core::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;

/// 调用上下文，在客户端 API 之间传递取消、截止与元数据三元组。
///
/// # 契约说明（What）
/// - `cancellation`：取消令牌，调用方可随时 [`CallContext::cancel`]；
/// - `deadline`：可选的绝对截止时间，`None` 表示调用方未施加硬超时；
/// - `metadata`：透传给对端的键值对，`None` 表示上游未携带任何元数据。
///
/// # 风险提示（Trade-offs）
/// - 克隆成本为常数（令牌内部为 `Arc`），但元数据会被整体复制；热路径上应避免反复克隆。
/// - 截止时间到期不会自动触发取消位，只有 [`CallContext::done`] 与
///   [`CallContext::done_reason`] 会把两者合并判断。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    metadata: Option<Metadata>,
}

/// 上下文结束的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoneReason {
    /// 调用方主动取消，或父作用域被取消。
    Cancelled,
    /// 截止时间已到。
    DeadlineExceeded,
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoneReason::Cancelled => f.write_str("context canceled"),
            DoneReason::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

impl CallContext {
    /// 创建无截止、无元数据的根上下文。
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置绝对截止时间。
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 以“当前时间 + 持续时间”设置截止时间。
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = deadline_after(timeout);
        match deadline {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    /// 附带需要透传的元数据。
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// 替换取消令牌，便于与外部任务共享取消信号。
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 获取取消令牌。
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// 查询截止时间。
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 获取元数据。
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// 距离截止时间的剩余时长；已过期时返回零，无截止时返回 `None`。
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// 标记取消。重复调用无副作用。
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// 无阻塞地检查上下文是否已经结束；取消优先于超时。
    pub fn done_reason(&self) -> Option<DoneReason> {
        if self.cancellation.is_cancelled() {
            return Some(DoneReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(DoneReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// 等待上下文结束（取消或截止），返回结束原因。
    pub async fn done(&self) -> DoneReason {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => DoneReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => DoneReason::DeadlineExceeded,
            },
            None => {
                self.cancellation.cancelled().await;
                DoneReason::Cancelled
            }
        }
    }

    /// 派生共享截止与元数据的子上下文，子令牌随父令牌一起取消。
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
        }
    }

    /// 为一次逻辑调用派生作用域，并计算实际生效的请求超时。
    ///
    /// # 契约说明（What）
    /// - 若当前上下文没有截止时间：子作用域的截止 = 现在 + `request_timeout`，
    ///   返回的超时即 `request_timeout`；
    /// - 若已存在截止时间：保持原截止不变，返回剩余时长作为新的请求超时；
    /// - 两种情况下返回的子作用域都只会比父作用域更严格。
    pub fn scoped(&self, request_timeout: Duration) -> (CallContext, Duration) {
        let mut scope = self.child();
        match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                (scope, remaining)
            }
            None => {
                scope.deadline = deadline_after(request_timeout);
                (scope, request_timeout)
            }
        }
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deadline = match self.remaining() {
            Some(remaining) => format!("{remaining:?}"),
            None => "none".to_string(),
        };
        write!(
            f,
            "CallContext{{cancelled={}, remaining={}, metadata={}}}",
            self.cancellation.is_cancelled(),
            deadline,
            self.metadata.as_ref().map_or(0, Metadata::len)
        )
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}
