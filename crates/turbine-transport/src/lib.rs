#![doc = r#"
# turbine-transport

## 章节定位（Why）
- 定义一条逻辑链路的本端句柄 [`ConnectionPair`]：控制通道必有，数据通道可选；
- 以 [`Transport`] 能力接口承载具体传输，进程内实现 [`InProcessTransport`] 随本 crate 提供，
  套接字实现位于 `turbine-transport-tcp`；
- 在接受入站连接、处理任何消息之前执行基于地址的访问控制（[`access`]）。

## 契约速览（What）
- 地址语法 `[scheme://][user[:password]@]host[:port]`，缺省协议为 `tcp`，`ram://` 与 `internal://`
  选择进程内传输（[`Address`]）；
- 读超时返回 `Ok(None)`；流结束、写超时是错误（[`Timeout`]、[`TransportError`]）；
- 登录之后切换为二进制帧，差分开关在连接存续期间固定。
"#]

pub mod access;
pub mod address;
pub mod channel;
pub mod error;
pub mod memory;
pub mod pair;
pub mod transport;

pub use access::{AccessClass, AccessControl, AccessRule, Candidate, Permissions};
pub use address::{Address, DEFAULT_HOST, DEFAULT_PORT, Scheme};
pub use channel::{ByteCounts, ChannelMetrics, ControlChannel, DataChannel, DataStream, Timeout};
pub use error::TransportError;
pub use memory::{InProcessAcceptor, InProcessChannel, InProcessTransport};
pub use pair::{ConnectionPair, LinkOptions, LinkRole, PING_WAIT, PairMetrics, Side};
pub use transport::{Acceptor, Transport, TransportRegistry};
