//! # options 模块说明
//!
//! ## 角色定位（Why）
//! - [`ClientOptions`]：客户端级配置，持有编解码注册表、路由器、选择器、事件总线等 trait 对象，
//!   构造后只读；
//! - [`CallOptions`]：单次调用的有效选项，每次调用从客户端默认值克隆，再按序叠加 [`CallOption`]。
//!
//! ## 契约（What）
//! - 调用级覆写只作用于本次调用，客户端默认值永不被修改；
//! - 请求方法/路径/请求体模板与错误映射都是显式字段，不依赖上下文中的隐式键。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::DEFAULT_CONTENT_TYPE;
use crate::broker::Broker;
use crate::codec::{Codec, CodecRegistry};
use crate::config::ClientConfig;
use crate::error::ErrorMap;
use crate::policy::{Backoff, ExponentialBackoff, Retry, RetryOnError};
use crate::router::{Router, StaticRouter};
use crate::selector::{RoundRobinSelector, Selector};
use crate::wrapper::CallWrapper;

/// 单次调用对线上请求形态的覆写。
#[derive(Clone, Debug, Default)]
pub struct CallOverrides {
    /// HTTP 方法，缺省为 `POST`。
    pub method: Option<String>,
    /// 路径模板，可含 `{field}` 占位符，缺省为请求端点。
    pub path: Option<String>,
    /// 请求体模板：`*` 表示整个消息，字段名表示只发送该字段，空串表示不发送请求体。
    pub body: Option<String>,
    /// 错误状态码到领域错误类型的映射。
    pub error_map: Option<ErrorMap>,
}

/// 单次调用的有效选项。
#[derive(Clone)]
pub struct CallOptions {
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
    /// 首次尝试之后允许的重试次数，总尝试次数为 `retries + 1`。
    pub retries: u32,
    pub backoff: Arc<dyn Backoff>,
    pub retry: Arc<dyn Retry>,
    pub router: Option<Arc<dyn Router>>,
    pub selector: Option<Arc<dyn Selector>>,
    /// 非空时跳过路由器，直接以这些地址作为候选。
    pub address: Vec<String>,
    pub wrappers: Vec<Arc<dyn CallWrapper>>,
    pub overrides: CallOverrides,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            dial_timeout: ClientConfig::DEFAULT_DIAL_TIMEOUT,
            retries: ClientConfig::DEFAULT_RETRIES,
            backoff: Arc::new(ExponentialBackoff::default()),
            retry: Arc::new(RetryOnError),
            router: None,
            selector: None,
            address: Vec::new(),
            wrappers: Vec::new(),
            overrides: CallOverrides::default(),
        }
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("request_timeout", &self.request_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("retries", &self.retries)
            .field("address", &self.address)
            .field("wrappers", &self.wrappers.len())
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl CallOptions {
    /// 按序叠加调用级选项。
    pub fn apply<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = CallOption>,
    {
        for option in options {
            (option.0)(&mut self);
        }
        self
    }
}

/// 调用级选项：对 [`CallOptions`] 的一次修改。
pub struct CallOption(Box<dyn FnOnce(&mut CallOptions) + Send>);

impl CallOption {
    pub fn new(apply: impl FnOnce(&mut CallOptions) + Send + 'static) -> Self {
        Self(Box::new(apply))
    }

    pub fn retries(retries: u32) -> Self {
        Self::new(move |o| o.retries = retries)
    }

    pub fn request_timeout(timeout: Duration) -> Self {
        Self::new(move |o| o.request_timeout = timeout)
    }

    pub fn dial_timeout(timeout: Duration) -> Self {
        Self::new(move |o| o.dial_timeout = timeout)
    }

    pub fn backoff(backoff: Arc<dyn Backoff>) -> Self {
        Self::new(move |o| o.backoff = backoff)
    }

    pub fn retry(retry: Arc<dyn Retry>) -> Self {
        Self::new(move |o| o.retry = retry)
    }

    pub fn router(router: Arc<dyn Router>) -> Self {
        Self::new(move |o| o.router = Some(router))
    }

    pub fn selector(selector: Arc<dyn Selector>) -> Self {
        Self::new(move |o| o.selector = Some(selector))
    }

    pub fn address<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses: Vec<String> = addresses.into_iter().map(Into::into).collect();
        Self::new(move |o| o.address = addresses)
    }

    /// 追加调用级包装器，位于客户端级包装器之内。
    pub fn wrapper(wrapper: Arc<dyn CallWrapper>) -> Self {
        Self::new(move |o| o.wrappers.push(wrapper))
    }

    pub fn method(method: impl Into<String>) -> Self {
        let method = method.into();
        Self::new(move |o| o.overrides.method = Some(method))
    }

    pub fn path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(move |o| o.overrides.path = Some(path))
    }

    pub fn body(body: impl Into<String>) -> Self {
        let body = body.into();
        Self::new(move |o| o.overrides.body = Some(body))
    }

    pub fn error_map(map: ErrorMap) -> Self {
        Self::new(move |o| o.overrides.error_map = Some(map))
    }
}

impl fmt::Debug for CallOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallOption")
    }
}

/// 客户端级配置。
///
/// # 契约说明（What）
/// - `content_type`：新建请求与消息时使用的默认内容类型；
/// - `proxy` / `publish_proxy`：构造时解析一次，前者钉住调用与流的地址，后者改写发布交换区；
/// - `call`：每次调用克隆的默认调用选项，其中路由器与选择器总是存在。
#[derive(Clone)]
pub struct ClientOptions {
    pub content_type: String,
    pub codecs: CodecRegistry,
    pub broker: Option<Arc<dyn Broker>>,
    pub proxy: Option<String>,
    pub publish_proxy: Option<String>,
    pub max_frame_bytes: usize,
    pub call: CallOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("content_type", &self.content_type)
            .field("codecs", &self.codecs)
            .field("broker", &self.broker.is_some())
            .field("proxy", &self.proxy)
            .field("publish_proxy", &self.publish_proxy)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("call", &self.call)
            .finish()
    }
}

impl ClientOptions {
    /// 以配置文件内容构造运行期选项，trait 对象取默认实现。
    pub fn from_config(config: &ClientConfig) -> Self {
        let content_type = if config.content_type.trim().is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            config.content_type.clone()
        };
        let call = CallOptions {
            request_timeout: config.request_timeout(),
            dial_timeout: config.dial_timeout(),
            retries: config.retries,
            router: Some(Arc::new(StaticRouter::new())),
            selector: Some(Arc::new(RoundRobinSelector::new())),
            ..CallOptions::default()
        };
        Self {
            content_type,
            codecs: CodecRegistry::default(),
            broker: None,
            proxy: non_empty(config.proxy.as_deref()),
            publish_proxy: non_empty(config.publish_proxy.as_deref()),
            max_frame_bytes: config.max_frame_bytes,
            call,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.register(codec);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.call.router = Some(router);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.call.selector = Some(selector);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_publish_proxy(mut self, exchange: impl Into<String>) -> Self {
        self.publish_proxy = Some(exchange.into());
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.call.backoff = backoff;
        self
    }

    pub fn with_retry(mut self, retry: Arc<dyn Retry>) -> Self {
        self.call.retry = retry;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.call.retries = retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.call.request_timeout = timeout;
        self
    }

    /// 追加客户端级包装器；先注册者位于外层。
    pub fn with_wrapper(mut self, wrapper: Arc<dyn CallWrapper>) -> Self {
        self.call.wrappers.push(wrapper);
        self
    }

    /// 为一次调用生成有效选项：克隆默认值后叠加调用级选项。
    pub fn call_options<I>(&self, options: I) -> CallOptions
    where
        I: IntoIterator<Item = CallOption>,
    {
        self.call.clone().apply(options)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
