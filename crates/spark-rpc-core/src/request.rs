use std::sync::Arc;

use serde_json::Value;

/// 一次 RPC 请求的不可变描述：目标服务、端点、内容类型与消息体。
///
/// 构造后内容类型即固定；克隆只增加引用计数，可安全地交给多个尝试任务。
#[derive(Clone, Debug)]
pub struct Request {
    inner: Arc<RequestInner>,
}

#[derive(Debug)]
struct RequestInner {
    service: String,
    endpoint: String,
    content_type: String,
    body: Value,
}

impl Request {
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        content_type: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                service: service.into(),
                endpoint: endpoint.into(),
                content_type: content_type.into(),
                body,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn content_type(&self) -> &str {
        &self.inner.content_type
    }

    pub fn body(&self) -> &Value {
        &self.inner.body
    }
}
