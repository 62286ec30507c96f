//! # stream 模块说明
//!
//! ## 角色定位（Why）
//! - 为 `HttpClient::stream` 提供拨号与会话实现：每个会话独占一条 TCP 连接，
//!   读写两个方向各由一把异步互斥锁保护，允许一个发送与一个接收同时进行；
//! - 帧格式见 [`frame`]，会话头部（元数据 + 超时 + 内容类型）随每一帧发送。
//!
//! ## 契约（What）
//! - 关闭信号由会话独占的 `watch` 通道承载，是判断“会话是否已关闭”的唯一依据；
//! - `close` 幂等：首次调用关闭写方向并释放连接，之后的调用直接返回 `Ok(())`；
//! - 关闭后的收发返回 `SessionClosed` 类错误；不可恢复的 I/O 错误同样使会话进入关闭态。

pub mod frame;
mod session;

pub(crate) use session::dial;
pub use session::StreamSession;
