//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 统一传输层的失败语义：寻址错误、成帧错误、传输错误三类分别对应不同的处置策略；
//! - 超时不是错误：读取超时以 `Ok(None)` 表达，只有写超时（字节流可能已被截断）才报错。
//!
//! ## 设计要求（What）
//! - 寻址错误（格式、协议、访问拒绝）同步返回给发起拨号/接受的一方，从不自动重试；
//! - 成帧错误对连接致命，连接随即关闭；
//! - 传输错误向上冒泡，由会话属主决定重连（父链路）或终止（客户端链路）。

use std::io;

use thiserror::Error;
use turbine_wire::WireError;

use crate::access::AccessClass;

/// 传输层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：让调用方无需解析字符串即可区分“流结束”“被拒绝”“协议错乱”等情形；
/// - **契约 (What)**：[`TransportError::is_end_of_stream`] 与
///   [`TransportError::is_addressing`] 给出稳定的分类判断，重连逻辑只依赖这些判断；
/// - **风险 (Trade-offs)**：`Io` 变体携带原始 [`io::Error`]，因此本枚举不实现 `Clone`。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed address `{input}`: {reason}")]
    MalformedAddress { input: String, reason: &'static str },

    #[error("unsupported address scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    #[error("access rule `{rule}` is invalid: {reason}")]
    InvalidRule { rule: String, reason: &'static str },

    #[error("access denied for {peer} requesting {class:?} access")]
    AccessDenied { peer: String, class: AccessClass },

    /// 对端以异常帧拒绝了本次连接。
    #[error("peer rejected the connection: {message}")]
    Rejected { message: String },

    #[error("no listener reachable at {address}")]
    Unreachable { address: String },

    #[error("address {address} is already being listened on")]
    AddressInUse { address: String },

    /// 读取过程中连接被关闭。与超时不同，它总是错误。
    #[error("end of stream from {peer}")]
    EndOfStream { peer: String },

    #[error("channel already closed")]
    Closed,

    /// 写超时之后字节流可能只写了一半，连接必须丢弃。
    #[error("write to {peer} did not complete within {millis} ms")]
    WriteTimeout { peer: String, millis: u64 },

    #[error("{operation} timed out")]
    HandshakeTimeout { operation: &'static str },

    #[error("framing error: {0}")]
    Framing(#[from] WireError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("io error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn io(operation: &'static str, source: io::Error) -> Self {
        TransportError::Io { operation, source }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            TransportError::EndOfStream { .. } | TransportError::Closed
        )
    }

    /// 寻址类错误：格式、协议、访问控制。永不自动重试。
    pub fn is_addressing(&self) -> bool {
        matches!(
            self,
            TransportError::MalformedAddress { .. }
                | TransportError::UnsupportedScheme { .. }
                | TransportError::InvalidRule { .. }
                | TransportError::AccessDenied { .. }
                | TransportError::Rejected { .. }
        )
    }

    /// 值得由重连逻辑再次尝试的失败：网络与通道层面的故障。
    ///
    /// 寻址错误以及“地址已被另一台服务器占用”都不会因重试而改变结果。
    pub fn is_retryable(&self) -> bool {
        !self.is_addressing() && !matches!(self, TransportError::AddressInUse { .. })
    }

    /// 成帧错误：字节流已不可信，连接必须关闭。
    pub fn is_framing(&self) -> bool {
        matches!(self, TransportError::Framing(_))
    }
}
