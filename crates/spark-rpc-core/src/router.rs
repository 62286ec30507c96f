//! # router 模块说明
//!
//! ## 角色定位（Why）
//! - 把一次请求解析为一组可拨号的候选路由，是每次调用编排的第一步外部依赖；
//! - [`StaticRouter`] 用 `ArcSwap` 持有整张路由表，控制面热更新时一次性替换，
//!   读路径只做 `load` + 查表，不持锁。
//!
//! ## 契约（What）
//! - [`lookup_routes`] 是编排器唯一的解析入口：调用选项中钉住了地址列表时直接据此构造路由，
//!   否则交给配置的 [`Router`]；
//! - 解析失败即调用失败，不进入重试循环。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::{Result, RpcError, codes};
use crate::options::CallOptions;
use crate::request::Request;

/// 一条候选路由：服务名 + 可拨号地址 + 附加元数据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    service: String,
    address: String,
    metadata: BTreeMap<String, String>,
}

impl Route {
    pub fn new(service: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// 服务发现契约。
///
/// 路由器看到完整的请求与生效的调用选项，可以按端点、内容类型或调用级配置分流，
/// 而不只是按服务名查表。
#[async_trait]
pub trait Router: Send + Sync + 'static {
    /// 返回请求的全部候选路由；没有可用路由时应返回错误而不是空列表。
    async fn lookup(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Vec<Route>>;
}

#[derive(Default)]
struct RouteTable {
    services: HashMap<String, Vec<Route>>,
}

/// 基于 `ArcSwap` 的静态路由表。
///
/// # 使用契约（What）
/// - **前置条件**：调用方需通过 [`Self::update`] 装载路由，初始表为空；
/// - **后置条件**：新表对后续 `lookup` 立即可见，旧表在无读者后自动释放；
/// - **线程安全**：`Send + Sync`，可在多线程运行时共享。
pub struct StaticRouter {
    table: ArcSwap<RouteTable>,
    revision: AtomicU64,
}

impl StaticRouter {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            revision: AtomicU64::new(0),
        }
    }

    /// 以一组路由整体替换路由表。
    ///
    /// 路由按 [`Route::service`] 归组，同一服务内保持输入顺序。
    pub fn update<I>(&self, revision: u64, routes: I)
    where
        I: IntoIterator<Item = Route>,
    {
        let mut services: HashMap<String, Vec<Route>> = HashMap::new();
        for route in routes {
            services
                .entry(route.service.clone())
                .or_default()
                .push(route);
        }
        self.revision.store(revision, Ordering::Release);
        self.table.store(Arc::new(RouteTable { services }));
        tracing::debug!(revision, "route table replaced");
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

impl Default for StaticRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn lookup(
        &self,
        _ctx: &CallContext,
        request: &Request,
        _options: &CallOptions,
    ) -> Result<Vec<Route>> {
        let service = request.service();
        let table = self.table.load();
        match table.services.get(service) {
            Some(routes) if !routes.is_empty() => Ok(routes.clone()),
            _ => Err(RpcError::internal(
                codes::NO_ROUTE,
                format!("no route available for service {service}"),
            )),
        }
    }
}

/// 解析一次调用的候选路由。
///
/// 调用选项携带地址列表时（例如客户端配置了代理），直接以这些地址构造路由，
/// 不再访问路由器。
pub async fn lookup_routes(
    ctx: &CallContext,
    request: &Request,
    options: &CallOptions,
) -> Result<Vec<Route>> {
    if !options.address.is_empty() {
        return Ok(options
            .address
            .iter()
            .map(|address| Route::new(request.service(), address.as_str()))
            .collect());
    }
    let router = options.router.as_ref().ok_or_else(|| {
        RpcError::internal(codes::NO_ROUTE, "no router configured for lookup")
    })?;
    router.lookup(ctx, request, options).await
}
