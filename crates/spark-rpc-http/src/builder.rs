//! # builder 模块说明
//!
//! ## 角色定位（Why）
//! - 把逻辑请求（服务、端点、消息）与调用级覆写渲染为一次尝试的 [`WireRequest`]；
//! - 纯计算，不做任何网络 I/O，失败一律为 400 类构造错误。
//!
//! ## 契约（What）
//! - 地址为 `host:port` 形式时直接拼出 `http://host:port/<endpoint>`，方法固定为 `POST`、
//!   请求体模板固定为 `*`，调用级覆写不生效；
//! - 否则地址被视为基础 URL，方法/路径模板/请求体模板可由 [`CallOverrides`] 覆写；
//! - 路径模板中的 `{field}` 占位符取自消息字段，缺失即报错；
//! - 请求体模板：`*` 发送整个消息，字段名只发送该字段，空串不发送请求体；
//!   `GET` 请求总是不发送请求体。未进入路径与请求体的字段写入查询串。
//!
//! ## 风险提示（Trade-offs）
//! - 相对路径模板按 URL 引用解析规则拼接到基础路径所在“目录”下，
//!   基础 URL 末尾是否带 `/` 会影响结果。

use std::collections::HashSet;

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, Method, Uri};
use serde_json::{Map, Value};
use spark_rpc_core::{Codec, RpcError, Request};
use spark_rpc_core::options::CallOverrides;

use crate::transport::WireRequest;

const WHOLE_MESSAGE: &str = "*";

/// 构造一次尝试的线上请求。
pub fn build_request(
    address: &str,
    request: &Request,
    codec: &dyn Codec,
    overrides: &CallOverrides,
    headers: HeaderMap,
) -> Result<WireRequest, RpcError> {
    let target = resolve_target(address, request.endpoint(), overrides)?;
    let rendered = render(
        &target.template,
        &target.method,
        &target.body_template,
        request.body(),
    )?;

    let body = match &rendered.body {
        Some(value) => codec.marshal(value).map_err(RpcError::from)?,
        None => Bytes::new(),
    };

    let path_and_query = match rendered.query.is_empty() {
        true => rendered.path,
        false => format!("{}?{}", rendered.path, rendered.query),
    };
    let path_and_query: PathAndQuery = path_and_query
        .parse()
        .map_err(|err| RpcError::bad_request(format!("invalid request path: {err}")))?;
    let uri = Uri::builder()
        .scheme(target.scheme)
        .authority(target.authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| RpcError::bad_request(format!("invalid request uri: {err}")))?;

    Ok(WireRequest {
        method: target.method,
        uri,
        headers,
        body,
    })
}

struct Target {
    scheme: Scheme,
    authority: Authority,
    method: Method,
    /// 已拼接基础路径的路径模板，可能仍含占位符与静态查询串。
    template: String,
    body_template: String,
}

/// 判断地址是否为可直接拨号的 `host:port`。
pub fn is_host_port(address: &str) -> bool {
    !address.contains("://")
        && address
            .parse::<Authority>()
            .is_ok_and(|authority| authority.port_u16().is_some())
}

fn resolve_target(
    address: &str,
    endpoint: &str,
    overrides: &CallOverrides,
) -> Result<Target, RpcError> {
    if is_host_port(address) {
        let authority = address
            .parse::<Authority>()
            .map_err(|err| RpcError::bad_request(format!("invalid address {address}: {err}")))?;
        return Ok(Target {
            scheme: Scheme::HTTP,
            authority,
            method: Method::POST,
            template: normalize_endpoint(endpoint),
            body_template: WHOLE_MESSAGE.to_string(),
        });
    }

    let base: Uri = address
        .parse()
        .map_err(|err| RpcError::bad_request(format!("invalid address {address}: {err}")))?;
    let (Some(scheme), Some(authority)) = (base.scheme().cloned(), base.authority().cloned())
    else {
        return Err(RpcError::bad_request(format!(
            "address {address} is neither host:port nor an absolute url"
        )));
    };

    let method = match overrides.method.as_deref() {
        Some(method) => Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|err| RpcError::bad_request(format!("invalid method {method}: {err}")))?,
        None => Method::POST,
    };
    let reference = overrides.path.as_deref().unwrap_or(endpoint);
    Ok(Target {
        scheme,
        authority,
        method,
        template: join_reference(base.path(), reference),
        body_template: overrides
            .body
            .clone()
            .unwrap_or_else(|| WHOLE_MESSAGE.to_string()),
    })
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    }
}

fn join_reference(base_path: &str, reference: &str) -> String {
    if reference.starts_with('/') {
        return reference.to_string();
    }
    let directory = match base_path.rfind('/') {
        Some(index) => &base_path[..=index],
        None => "/",
    };
    format!("{directory}{reference}")
}

struct Rendered {
    path: String,
    query: String,
    body: Option<Value>,
}

fn render(
    template: &str,
    method: &Method,
    body_template: &str,
    message: &Value,
) -> Result<Rendered, RpcError> {
    let (path_template, static_query) = match template.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (template, None),
    };

    let mut bound = HashSet::new();
    let path = fill_placeholders(path_template, message, &mut bound)?;

    let send_body = *method != Method::GET && !body_template.is_empty();
    let body = match (send_body, body_template) {
        (false, _) => None,
        (true, WHOLE_MESSAGE) => Some(message.clone()),
        (true, field) => {
            bound.insert(field.to_string());
            message.get(field).cloned()
        }
    };

    let mut query = String::new();
    if let Some(static_query) = static_query.filter(|q| !q.is_empty()) {
        query.push_str(static_query);
    }
    let whole_in_body = send_body && body_template == WHOLE_MESSAGE;
    if let (false, Value::Object(fields)) = (whole_in_body, message) {
        append_query(&mut query, fields, &bound);
    }

    Ok(Rendered { path, query, body })
}

fn fill_placeholders(
    template: &str,
    message: &Value,
    bound: &mut HashSet<String>,
) -> Result<String, RpcError> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        path.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            RpcError::bad_request(format!("unterminated placeholder in path {template}"))
        })?;
        let spec = &after[..close];
        let field = spec.split_once('=').map_or(spec, |(name, _)| name).trim();
        let value = lookup_field(message, field)
            .and_then(scalar_to_string)
            .ok_or_else(|| {
                RpcError::bad_request(format!("missing path parameter {field} for {template}"))
            })?;
        encode_into(&mut path, &value);
        bound.insert(field.split('.').next().unwrap_or(field).to_string());
        rest = &after[close + 1..];
    }
    path.push_str(rest);
    Ok(path)
}

fn lookup_field<'a>(message: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(message, |value, segment| value.get(segment))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn append_query(query: &mut String, fields: &Map<String, Value>, bound: &HashSet<String>) {
    for (name, value) in fields {
        if bound.contains(name) {
            continue;
        }
        append_value(query, name, value);
    }
}

fn append_value(query: &mut String, key: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                append_value(query, key, item);
            }
        }
        Value::Object(fields) => {
            for (name, nested) in fields {
                append_value(query, &format!("{key}.{name}"), nested);
            }
        }
        scalar => {
            if let Some(text) = scalar_to_string(scalar) {
                if !query.is_empty() {
                    query.push('&');
                }
                encode_into(query, key);
                query.push('=');
                encode_into(query, &text);
            }
        }
    }
}

/// 百分号编码：只保留 RFC 3986 非保留字符。
fn encode_into(out: &mut String, raw: &str) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[usize::from(byte >> 4)] as char);
                out.push(HEX[usize::from(byte & 0x0f)] as char);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spark_rpc_core::{ErrorKind, JsonCodec, TextCodec};

    fn request(body: Value) -> Request {
        Request::new("users", "Users.Get", "application/json", body)
    }

    fn overrides(method: &str, path: &str, body: &str) -> CallOverrides {
        CallOverrides {
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            body: Some(body.to_string()),
            error_map: None,
        }
    }

    #[test]
    fn host_port_posts_to_endpoint_and_ignores_overrides() {
        let wire = build_request(
            "127.0.0.1:8080",
            &request(json!({"id": 7})),
            &JsonCodec,
            &overrides("GET", "/v1/users/{id}", ""),
            HeaderMap::new(),
        )
        .expect("host:port 地址应直接构造");
        assert_eq!(wire.method, Method::POST);
        assert_eq!(wire.uri.to_string(), "http://127.0.0.1:8080/Users.Get");
        assert_eq!(&wire.body[..], br#"{"id":7}"#);
    }

    #[test]
    fn base_url_fills_path_and_moves_rest_to_query_on_get() {
        let wire = build_request(
            "http://users.internal:9000/api/",
            &request(json!({"id": "a b", "verbose": true, "tags": ["x", "y"], "skip": null})),
            &JsonCodec,
            &overrides("get", "v1/users/{id}", "*"),
            HeaderMap::new(),
        )
        .expect("模板渲染成功");
        assert_eq!(wire.method, Method::GET);
        assert_eq!(wire.uri.path(), "/api/v1/users/a%20b");
        assert_eq!(wire.uri.query(), Some("tags=x&tags=y&verbose=true"));
        assert!(wire.body.is_empty(), "GET 不发送请求体");
    }

    #[test]
    fn named_body_field_sends_only_that_field() {
        let wire = build_request(
            "http://users.internal",
            &request(json!({"id": 1, "profile": {"name": "ada"}, "dry_run": false})),
            &JsonCodec,
            &overrides("PUT", "/v1/users/{id}", "profile"),
            HeaderMap::new(),
        )
        .expect("模板渲染成功");
        assert_eq!(wire.uri.path(), "/v1/users/1");
        assert_eq!(wire.uri.query(), Some("dry_run=false"));
        assert_eq!(&wire.body[..], br#"{"name":"ada"}"#);
    }

    #[test]
    fn default_base_url_request_posts_whole_message() {
        let wire = build_request(
            "https://gateway.example/rpc",
            &request(json!({"id": 1})),
            &JsonCodec,
            &CallOverrides::default(),
            HeaderMap::new(),
        )
        .expect("默认模板");
        assert_eq!(wire.method, Method::POST);
        assert_eq!(wire.uri.to_string(), "https://gateway.example/Users.Get");
        assert_eq!(&wire.body[..], br#"{"id":1}"#);
    }

    #[test]
    fn construction_failures_are_bad_requests() {
        let missing = build_request(
            "http://users.internal",
            &request(json!({"name": "x"})),
            &JsonCodec,
            &overrides("GET", "/v1/users/{id}", ""),
            HeaderMap::new(),
        )
        .expect_err("缺失路径参数");
        assert_eq!(missing.kind(), ErrorKind::BadRequest);
        assert_eq!(missing.status(), 400);

        let not_an_address = build_request(
            "users-service",
            &request(json!({})),
            &JsonCodec,
            &CallOverrides::default(),
            HeaderMap::new(),
        )
        .expect_err("既不是 host:port 也不是绝对 URL");
        assert_eq!(not_an_address.kind(), ErrorKind::BadRequest);

        let unencodable = build_request(
            "127.0.0.1:1",
            &request(json!({"id": 1})),
            &TextCodec,
            &CallOverrides::default(),
            HeaderMap::new(),
        )
        .expect_err("文本编解码器无法编码对象");
        assert_eq!(unencodable.kind(), ErrorKind::BadRequest);
    }
}
