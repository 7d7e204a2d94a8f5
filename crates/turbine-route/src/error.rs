//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 路由层只新增两类失败：目标服务器不可达（寻路失败）与拓扑/配置不合法；
//! - 传输与成帧错误原样包裹在 [`RouteError::Transport`] 中，分类判断仍委托给 [`TransportError`]。
//!
//! ## 设计要求（What）
//! - 面向客户端的失败必须点名不可达的服务器，调用方据此提示用户而非无限等待；
//! - 对端以异常帧拒绝角色反转时归为 [`RouteError::Refused`]：双方保持原有角色，
//!   父链路按普通重连节奏再试；
//! - “该地址已由另一台服务器占用”不经过本类型，重连逻辑直接把它报告为放弃。

use thiserror::Error;
use turbine_transport::TransportError;
use turbine_wire::ExceptionKind;

/// 路由层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：让寻路、转发、配置加载共用一个错误类型，`?` 可以从传输层一路冒泡；
/// - **契约 (What)**：[`RouteError::is_retryable`] 决定父链路是否保留定时重试；
/// - **风险 (Trade-offs)**：`Config` 只保留文本原因，不携带底层 `toml` 错误对象，避免公开依赖其类型。
#[derive(Debug, Error)]
pub enum RouteError {
    /// 找不到通往目标服务器的可用路径。
    #[error("server {server} is unreachable")]
    Unreachable { server: String },

    #[error("invalid server name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// 名称合法，但与本地服务器的层级关系不符合调用的要求。
    #[error("server {name} cannot act as {relation}")]
    Topology { name: String, relation: &'static str },

    /// 对端以异常帧拒绝了角色反转请求。
    #[error("{server} refused the request ({kind:?}): {message}")]
    Refused {
        server: String,
        kind: ExceptionKind,
        message: String,
    },

    #[error("unexpected {command} frame from {server}")]
    Unexpected {
        server: String,
        command: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RouteError {
    pub fn unreachable(server: impl Into<String>) -> Self {
        RouteError::Unreachable {
            server: server.into(),
        }
    }

    /// 是否值得在下一个重试周期再次尝试。
    ///
    /// 名称、拓扑与配置错误不会因重试而改变；被拒绝的角色反转在下个周期重新请求。
    pub fn is_retryable(&self) -> bool {
        match self {
            RouteError::Transport(err) => err.is_retryable(),
            RouteError::Unreachable { .. }
            | RouteError::Unexpected { .. }
            | RouteError::Refused { .. } => true,
            RouteError::InvalidName { .. }
            | RouteError::Topology { .. }
            | RouteError::Config(_) => false,
        }
    }

    /// 是否属于寻址类错误：名称不合法、目标不可达或传输层的寻址失败。
    pub fn is_addressing(&self) -> bool {
        match self {
            RouteError::Unreachable { .. } | RouteError::InvalidName { .. } => true,
            RouteError::Transport(err) => err.is_addressing(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_reversal_is_retried() {
        let refused = RouteError::Refused {
            server: "/a".into(),
            kind: ExceptionKind::Protocol,
            message: "busy".into(),
        };
        assert!(refused.is_retryable());

        let lost = RouteError::from(TransportError::EndOfStream { peer: "x".into() });
        assert!(lost.is_retryable());

        let config = RouteError::Config("bad interval".into());
        assert!(!config.is_retryable());
    }

    #[test]
    fn unreachable_names_the_server() {
        let err = RouteError::unreachable("/root/child");
        assert_eq!(err.to_string(), "server /root/child is unreachable");
        assert!(err.is_addressing());
    }
}
