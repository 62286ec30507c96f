#![doc = r#"
# spark-rpc-core

## 设计动机（Why）
- **定位**：承载 RPC 客户端在“调用编排”之外的全部契约：调用上下文（截止/取消/元数据）、
  带状态码的错误域、按内容类型注册的编解码器、请求与事件消息模型，以及
  Router / Selector / Backoff / Retry / CallWrapper / Broker 六类可插拔能力。
- **架构角色**：`spark-rpc-http` 等具体客户端只依赖这里的 trait，从不依赖具体策略实现；
  替换负载均衡或重试策略无需触碰调用状态机。

## 核心契约（What）
- [`CallContext`] 以 `tokio_util` 的取消令牌 + 单调截止时间描述一次逻辑调用的生命周期，
  派生的子作用域只会收紧、不会放宽截止时间；
- [`RpcError`] 始终携带 [`ErrorKind`] 与 HTTP 风格状态码，调用方可据此区分超时、
  请求非法与服务端故障；
- [`CallOptions`] 为每次调用从客户端默认值复制一份，再叠加调用级 [`CallOption`]；
  客户端默认值永不被修改。

## 实现策略（How）
- 同步策略（Backoff/Retry/Selector）使用普通 trait 并为闭包提供 blanket 实现；
  涉及 I/O 的能力（Router/Broker）使用 `async_trait`；
- 默认实现：指数退避、按错误类别重试、轮询选择器、基于 `ArcSwap` 的静态路由表、
  内存事件总线，均可在测试与本地开发中直接使用。
"#]

pub mod broker;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod metadata;
pub mod options;
pub mod policy;
pub mod request;
pub mod router;
pub mod selector;
pub mod wrapper;

pub use broker::{Broker, BrokerMessage, MemoryBroker};
pub use codec::{Codec, CodecError, CodecRegistry, JsonCodec, MessageKind, TextCodec};
pub use config::{ClientConfig, ConfigError};
pub use context::{CallContext, DoneReason};
pub use error::{ErrorDecoder, ErrorKind, ErrorMap, Result, RpcError, TypedError, codes};
pub use message::{Message, Payload};
pub use metadata::Metadata;
pub use options::{CallOption, CallOptions, CallOverrides, ClientOptions};
pub use policy::{
    Backoff, ConstantBackoff, ExponentialBackoff, NoBackoff, Retry, RetryAlways, RetryNever,
    RetryOnError,
};
pub use request::Request;
pub use router::{Route, Router, StaticRouter, lookup_routes};
pub use selector::{Next, Node, NodeStats, RoundRobinSelector, Selector};
pub use wrapper::{CallFunc, CallFuture, CallWrapper, compose};

/// 默认内容类型，与客户端未显式配置时的行为一致。
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
