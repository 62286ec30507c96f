//! # policy 模块说明
//!
//! ## 角色定位（Why）
//! - 退避与重试两类策略决定一次调用在失败后的节奏与去留；
//! - 二者都是同步判定，闭包即可实现，编排器在尝试任务内调用。
//!
//! ## 契约（What）
//! - [`Backoff::backoff`] 在每次尝试开始前调用（含第 0 次），返回错误则整个调用以策略错误结束；
//! - [`Retry::retry`] 只在尝试失败后调用：`Ok(true)` 继续、`Ok(false)` 以该尝试的错误结束、
//!   `Err` 以策略错误结束。

use std::time::Duration;

use crate::context::CallContext;
use crate::error::{ErrorKind, Result, RpcError};
use crate::request::Request;

/// 退避策略。
pub trait Backoff: Send + Sync + 'static {
    fn backoff(&self, ctx: &CallContext, request: &Request, attempt: u32) -> Result<Duration>;
}

impl<F> Backoff for F
where
    F: Fn(&CallContext, &Request, u32) -> Result<Duration> + Send + Sync + 'static,
{
    fn backoff(&self, ctx: &CallContext, request: &Request, attempt: u32) -> Result<Duration> {
        self(ctx, request, attempt)
    }
}

/// 重试判定策略。`attempt` 为刚刚失败的尝试序号（从 0 开始）。
pub trait Retry: Send + Sync + 'static {
    fn retry(
        &self,
        ctx: &CallContext,
        request: &Request,
        attempt: u32,
        err: &RpcError,
    ) -> Result<bool>;
}

impl<F> Retry for F
where
    F: Fn(&CallContext, &Request, u32, &RpcError) -> Result<bool> + Send + Sync + 'static,
{
    fn retry(
        &self,
        ctx: &CallContext,
        request: &Request,
        attempt: u32,
        err: &RpcError,
    ) -> Result<bool> {
        self(ctx, request, attempt, err)
    }
}

/// 指数退避：`base × attempt^exponent`，第 0 次尝试不等待，结果不超过 `max`。
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    exponent: f64,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, exponent: f64, max: Duration) -> Self {
        Self {
            base,
            exponent,
            max,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = f64::from(attempt).powf(self.exponent);
        let nanos = self.base.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 2.0, Duration::from_secs(10))
    }
}

impl Backoff for ExponentialBackoff {
    fn backoff(&self, _ctx: &CallContext, _request: &Request, attempt: u32) -> Result<Duration> {
        Ok(self.delay(attempt))
    }
}

/// 每次尝试前固定等待。
#[derive(Clone, Copy, Debug)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn backoff(&self, _ctx: &CallContext, _request: &Request, attempt: u32) -> Result<Duration> {
        Ok(if attempt == 0 { Duration::ZERO } else { self.0 })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn backoff(&self, _ctx: &CallContext, _request: &Request, _attempt: u32) -> Result<Duration> {
        Ok(Duration::ZERO)
    }
}

/// 仅在超时、内部错误以及对端 408/5xx 时重试。
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryOnError;

impl Retry for RetryOnError {
    fn retry(
        &self,
        _ctx: &CallContext,
        _request: &Request,
        _attempt: u32,
        err: &RpcError,
    ) -> Result<bool> {
        Ok(match err.kind() {
            ErrorKind::Timeout | ErrorKind::Internal => true,
            ErrorKind::Wire | ErrorKind::Mapped => err.status() == 408 || err.status() >= 500,
            _ => false,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RetryAlways;

impl Retry for RetryAlways {
    fn retry(&self, _: &CallContext, _: &Request, _: u32, _: &RpcError) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RetryNever;

impl Retry for RetryNever {
    fn retry(&self, _: &CallContext, _: &Request, _: u32, _: &RpcError) -> Result<bool> {
        Ok(false)
    }
}
