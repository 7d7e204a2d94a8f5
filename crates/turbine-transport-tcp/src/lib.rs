#![doc = r#"
# turbine-transport-tcp

## 章节定位（Why）
- 为 `turbine-transport` 的 [`Transport`](turbine_transport::Transport) 契约提供基于 TCP 的实现；
- 控制通道逐帧编解码；数据通道是同一监听端口上的第二条连接，按连接编号与控制通道配对。

## 使用方式（How）
- 将 [`TcpTransport`] 注册到 [`TransportRegistry`](turbine_transport::TransportRegistry)，
  之后 `tcp://host:port` 以及不带协议前缀的地址都由它负责；
- 监听地址上的访问控制表在每条控制连接的登录前生效。

## 特性开关（What）
- `runtime-tokio`（默认）：启用基于 Tokio 的实现；关闭后不提供任何传输能力。
"#]

#[cfg(feature = "runtime-tokio")]
mod channel;
#[cfg(feature = "runtime-tokio")]
mod error;
#[cfg(feature = "runtime-tokio")]
mod listener;
#[cfg(feature = "runtime-tokio")]
mod transport;

#[cfg(feature = "runtime-tokio")]
pub use channel::{TcpControlChannel, TcpSocketConfig};
#[cfg(feature = "runtime-tokio")]
pub use listener::TcpAcceptor;
#[cfg(feature = "runtime-tokio")]
pub use transport::TcpTransport;
