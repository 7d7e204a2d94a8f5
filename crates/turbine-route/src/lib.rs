#![doc = r#"
# turbine-route

## 章节定位（Why）
- **目标**：在连接对之上维护本地服务器眼中的路由拓扑，回答“到某台服务器怎么走”，
  并让父链路在断开后以单飞方式自动恢复；
- **边界**：不解释应用载荷，路由消息的内容由数据模型协作方负责；定时器与运行时通过
  [`Scheduler`] 注入。

## 组件（What）
- [`Topology`] / [`RouteNode`]：节点表、寻路（[`Topology::find_path`]）、下一跳（[`Topology::next_hop`]）、
  对等体广播与路由快照；
- [`ParentLink`]：父链路的断线、重试、重新注册状态机；
- [`reversal`]：无法被拨入一侧的角色反转；
- [`Responder`]：路由链路上的被动应答与转发；
- [`Fabric`]：按 [`FabricConfig`] 装配以上组件；
- [`telemetry::init_tracing`]：日志订阅者安装。
"#]

pub mod config;
pub mod error;
pub mod fabric;
pub mod metrics;
pub mod name;
pub mod node;
pub mod reconnect;
pub mod responder;
pub mod reversal;
pub mod scheduler;
pub mod telemetry;
pub mod topology;

pub use config::{FabricConfig, LoggingConfig, ParentConfig, WireSection};
pub use error::RouteError;
pub use fabric::Fabric;
pub use metrics::RouteMetrics;
pub use node::{NodeKind, Role, RoleKind, RouteNode, SwapOutcome};
pub use reconnect::{ParentLink, ReconnectOutcome, ReconnectSettings};
pub use responder::{Handled, Responder};
pub use scheduler::{Scheduler, Task, TaskHandle, TokioScheduler};
pub use topology::{Path, PeerRecord, Topology};
