use std::io;

use turbine_transport::TransportError;

/// 一次底层套接字操作的名称，写入 [`TransportError::Io`] 的 `operation` 字段。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind { message: "tcp bind" };
pub(crate) const ACCEPT: OperationKind = OperationKind {
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind { message: "tcp read" };
pub(crate) const WRITE: OperationKind = OperationKind {
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    message: "tcp configure",
};
pub(crate) const PAIR: OperationKind = OperationKind {
    message: "data channel pairing",
};

/// 将 IO 错误映射为传输层错误。
///
/// # 教案式说明
/// - **意图 (Why)**：重连逻辑只看错误分类，不解析 `io::ErrorKind`；
///   因此对端关闭类错误统一归为流结束，拒绝连接归为不可达，端口占用归为地址占用；
/// - **契约 (What)**：`target` 是对端或监听地址的可读描述，用于填充错误上下文；
/// - **风险 (Trade-offs)**：`TimedOut` 保留为 `Io`，因为超时语义已由调用方的 [`turbine_transport::Timeout`] 单独表达。
pub(crate) fn map_io_error(kind: OperationKind, target: &str, error: io::Error) -> TransportError {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => TransportError::EndOfStream {
            peer: target.to_owned(),
        },
        ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::HostUnreachable => {
            TransportError::Unreachable {
                address: target.to_owned(),
            }
        }
        ErrorKind::AddrInUse => TransportError::AddressInUse {
            address: target.to_owned(),
        },
        _ => TransportError::io(kind.message, error),
    }
}
