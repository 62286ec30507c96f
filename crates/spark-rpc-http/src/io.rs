//! 原始连接 I/O 的错误映射与上下文感知执行。

use std::future::Future;
use std::io;

use spark_rpc_core::{CallContext, DoneReason, ErrorKind, RpcError};

/// 一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const DIAL: OperationKind = OperationKind {
    code: "spark.rpc.stream.dial_failed",
    message: "stream dial",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.rpc.stream.read_failed",
    message: "stream read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.rpc.stream.write_failed",
    message: "stream write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.rpc.stream.shutdown_failed",
    message: "stream shutdown",
};

/// 将 I/O 错误映射为客户端错误：`TimedOut` 归为超时，其余归为内部错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> RpcError {
    let message = format!("{}: {}", kind.message, error);
    let mapped = match error.kind() {
        io::ErrorKind::TimedOut => RpcError::new(kind.code, ErrorKind::Timeout, 408, message),
        _ => RpcError::internal(kind.code, message),
    };
    mapped.with_cause(error)
}

pub(crate) fn done_error(kind: OperationKind, reason: DoneReason) -> RpcError {
    RpcError::request_timeout(format!("{} abandoned: {}", kind.message, reason))
}

/// 在保留取消/截止语义的前提下执行 I/O Future。
pub(crate) async fn run_with_context<F, T>(
    ctx: &CallContext,
    kind: OperationKind,
    future: F,
) -> Result<T, RpcError>
where
    F: Future<Output = io::Result<T>>,
{
    if let Some(reason) = ctx.done_reason() {
        return Err(done_error(kind, reason));
    }
    tokio::select! {
        biased;
        reason = ctx.done() => Err(done_error(kind, reason)),
        result = future => result.map_err(|err| map_io_error(kind, err)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timed_out_maps_to_timeout_kind() {
        let err = map_io_error(DIAL, io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), DIAL.code);

        let err = map_io_error(READ, io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.message().starts_with("stream read"));
    }

    #[tokio::test]
    async fn expired_context_short_circuits() {
        let ctx = CallContext::new();
        ctx.cancel();
        let err = run_with_context(&ctx, WRITE, async { Ok::<_, io::Error>(()) })
            .await
            .expect_err("已取消的上下文不应执行 I/O");
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_pending_dial() {
        let ctx = CallContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = run_with_context(&ctx, DIAL, std::future::pending::<io::Result<()>>())
            .await
            .expect_err("取消应打断挂起的拨号");
        assert!(err.is_timeout());
        assert_eq!(err.status(), 408);
        assert!(err.message().starts_with(DIAL.message));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
