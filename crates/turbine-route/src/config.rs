//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 把服务器身份、父链路、重连节奏、差分开关与日志过滤集中在一份 TOML 中，
//!   运行期组件只接收强类型的 [`FabricConfig`]，不再读取环境变量或全局开关；
//! - 缺省值与历史部署保持一致：重试间隔 60 秒、心跳等待 30 秒、差分默认开启。
//!
//! ## 文件示例（What）
//! ```toml
//! server_name = "/campus/lab"
//! address = "tcp://0.0.0.0:3333"
//! auth_file = "rbnbAuth.txt"
//! reconnect_interval_ms = 60000
//!
//! [parent]
//! name = "/campus"
//! address = "tcp://gateway:3333"
//!
//! [wire]
//! diff = true
//!
//! [logging]
//! filter = "turbine_route=debug,info"
//! ```

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;
use turbine_transport::{AccessControl, Address};
use turbine_wire::{BuildStamp, DEFAULT_MAX_FRAME, WireConfig};

use crate::{error::RouteError, name};

/// 默认重试间隔（毫秒）。
pub const DEFAULT_RECONNECT_MS: u64 = 60_000;
/// 默认心跳/路由应答等待（毫秒）。
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 30_000;
/// 默认被动阈值：足够大，实际上不排除任何对等体。
pub const DEFAULT_PASSIVE_COST: f64 = f64::MAX / 1e6;

/// 父服务器的身份与地址。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParentConfig {
    pub name: String,
    pub address: String,
}

/// 线路编码相关的配置段。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WireSection {
    pub diff: bool,
    pub build_version: Option<String>,
    pub build_date: Option<u32>,
    pub max_frame: usize,
}

impl Default for WireSection {
    fn default() -> Self {
        Self {
            diff: true,
            build_version: None,
            build_date: None,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// 日志配置段。`filter` 为空时回落到 `RUST_LOG`。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: String::new(),
            ansi: true,
        }
    }
}

/// 路由织网的完整配置。
///
/// # 教案式说明
/// - **意图 (Why)**：一次加载、一次校验，之后各组件按需取用换算好的 `Duration` 与 [`WireConfig`]；
/// - **契约 (What)**：`server_name` 必须是合法的层级名；配置了 `parent` 时，父名必须恰好是本地名的上一级；
///   未知字段直接报错，避免拼写错误被静默忽略；
/// - **风险 (Trade-offs)**：`auth_file` 在 [`FabricConfig::listen_address`] 时才读取，
///   文件缺失只在启动监听时暴露。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FabricConfig {
    pub server_name: String,
    pub address: String,
    pub parent: Option<ParentConfig>,
    pub auth_file: Option<PathBuf>,
    pub reconnect_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub passive_cost: f64,
    /// 本地服务器无法被对端直接拨入时置为 `true`，父链路恢复后改由对端反向建立路由角色。
    pub reverse_route: bool,
    pub wire: WireSection,
    pub logging: LoggingConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            server_name: "/turbine".to_owned(),
            address: "tcp://localhost:3333".to_owned(),
            parent: None,
            auth_file: None,
            reconnect_interval_ms: DEFAULT_RECONNECT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            passive_cost: DEFAULT_PASSIVE_COST,
            reverse_route: false,
            wire: WireSection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl FabricConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, RouteError> {
        let config: Self = toml::from_str(text).map_err(|err| RouteError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RouteError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| RouteError::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), RouteError> {
        name::validate(&self.server_name)
            .map_err(|reason| RouteError::Config(format!("server_name: {reason}")))?;
        if let Some(parent) = &self.parent {
            if name::parent_of(&self.server_name) != Some(parent.name.as_str()) {
                return Err(RouteError::Config(format!(
                    "parent `{}` is not the parent of `{}`",
                    parent.name, self.server_name
                )));
            }
            Address::parse(&parent.address).map_err(|err| RouteError::Config(err.to_string()))?;
        }
        Address::parse(&self.address).map_err(|err| RouteError::Config(err.to_string()))?;
        if self.reconnect_interval_ms == 0 {
            return Err(RouteError::Config(
                "reconnect_interval_ms must be positive".to_owned(),
            ));
        }
        if self.passive_cost.is_nan() || self.passive_cost <= 0.0 {
            return Err(RouteError::Config(
                "passive_cost must be a positive number".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// 注入编解码器的线路配置；未覆盖的构建戳字段取本构建的值。
    pub fn wire_config(&self) -> WireConfig {
        let current = BuildStamp::current();
        let stamp = BuildStamp::new(
            self.wire
                .build_version
                .clone()
                .unwrap_or_else(|| current.version.to_string()),
            self.wire.build_date.unwrap_or(current.date),
        );
        WireConfig {
            diff: self.wire.diff,
            stamp,
            max_frame: self.wire.max_frame,
        }
    }

    /// 监听地址；配置了授权文件时附带访问控制表。
    pub fn listen_address(&self) -> Result<Address, RouteError> {
        let address = Address::parse(&self.address)?;
        match &self.auth_file {
            Some(path) => Ok(address.with_access(AccessControl::from_auth_file(path)?)),
            None => Ok(address),
        }
    }
}
