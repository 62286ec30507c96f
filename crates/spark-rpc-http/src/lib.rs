#![doc = r#"
# spark-rpc-http

## 设计动机（Why）
- 在 `spark-rpc-core` 的契约之上实现完整的 RPC 客户端：一元调用走 HTTP 线上请求，
  流式调用独占一条原始 TCP 连接并以长度前缀帧收发，事件发布交给外部事件总线；
- 调用编排器是唯一的状态机：截止/取消作用域、路由解析、节点选择、
  退避与重试、并发尝试与取消竞速、结果回报都集中在 [`HttpClient`] 中。

## 核心契约（What）
- 每次尝试在独立的 tokio 任务中执行，通过单槽 `oneshot` 通道回报结果；
  编排器以 `select!` 在“上下文结束”与“尝试完成”之间竞速，被放弃的尝试结果会被丢弃；
- 尝试严格串行：第 i+1 次尝试只会在第 i 次结果已知后开始；
- 线上传输通过 [`WireTransport`] 抽象注入，默认实现基于 hyper 客户端，
  测试可替换为脚本化的假传输。

## 实现策略（How）
- [`builder`] 把逻辑请求渲染为线上请求（地址、方法、路径模板、请求体模板）；
- [`executor`] 执行单次尝试并解析响应或映射错误；
- [`stream`] 负责拨号、帧格式与会话生命周期；
- [`publish`] 负责事件信封编码与交换区解析。
"#]

pub mod builder;
pub mod client;
pub mod executor;
mod io;
pub mod publish;
pub mod stream;
pub mod transport;

pub use client::HttpClient;
pub use publish::{PublishOption, PublishOptions};
pub use stream::StreamSession;
pub use stream::frame::{Frame, FrameError};
pub use transport::{HyperTransport, TransportError, WireRequest, WireResponse, WireTransport};

/// 线上头部名称。
pub mod headers {
    /// 剩余调用预算，单位纳秒。
    pub const TIMEOUT: &str = "Timeout";
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// 事件发布时写入的主题。
    pub const TOPIC: &str = "Topic";
    /// 流式帧携带的对端状态码。
    pub const STATUS: &str = "Status";
    pub const SERVICE: &str = "Service";
    pub const ENDPOINT: &str = "Endpoint";
}
