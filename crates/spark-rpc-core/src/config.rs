//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 以 TOML 描述客户端的静态参数（内容类型、超时、重试次数、代理、帧上限）；
//! - 代理相关环境变量在构造期读取一次，调用路径上不再访问进程环境。
//!
//! ## 示例
//! ```toml
//! content_type = "application/json"
//! request_timeout_ms = 3000
//! retries = 2
//! proxy = "127.0.0.1:8081"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::error::{RpcError, codes};

/// 调用地址代理。
pub const PROXY_ENV: &str = "SPARK_RPC_PROXY";
/// 发布交换区代理。
pub const PUBLISH_PROXY_ENV: &str = "SPARK_RPC_PUBLISH_PROXY";

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<ConfigError> for RpcError {
    fn from(err: ConfigError) -> Self {
        RpcError::internal(codes::INTERNAL, err.to_string()).with_cause(err)
    }
}

/// 客户端静态配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub content_type: String,
    pub request_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub retries: u32,
    pub proxy: Option<String>,
    pub publish_proxy: Option<String>,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_RETRIES: u32 = 1;
    pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// 以进程环境覆盖代理配置。
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// 以给定的查找函数覆盖代理配置；空值视为未设置。
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(proxy) = read(PROXY_ENV) {
            self.proxy = Some(proxy);
        }
        if let Some(exchange) = read(PUBLISH_PROXY_ENV) {
            self.publish_proxy = Some(exchange);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: "must be greater than zero",
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_frame_bytes",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            content_type: crate::DEFAULT_CONTENT_TYPE.to_string(),
            request_timeout_ms: Self::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            dial_timeout_ms: Self::DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
            retries: Self::DEFAULT_RETRIES,
            proxy: None,
            publish_proxy: None,
            max_frame_bytes: Self::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            retries = 3
            proxy = "127.0.0.1:9000"
            "#,
        )
        .expect("合法配置");
        assert_eq!(config.retries, 3);
        assert_eq!(config.proxy.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.content_type, "application/json");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = ClientConfig::from_toml_str("request_timeout_ms = 0").expect_err("应拒绝");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "request_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn overrides_ignore_blank_values() {
        let config = ClientConfig::default().with_overrides_from(|key| match key {
            PROXY_ENV => Some("10.0.0.1:80".to_string()),
            PUBLISH_PROXY_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.proxy.as_deref(), Some("10.0.0.1:80"));
        assert!(config.publish_proxy.is_none());
    }
}
