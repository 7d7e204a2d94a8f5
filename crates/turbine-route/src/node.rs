//! # node 模块说明
//!
//! ## 角色定位（Why）
//! - [`RouteNode`] 是本地服务器对拓扑中某一台远端服务器的视图：父、子、经快照得知的远端、对等体或捷径；
//! - 节点持有路由状态（是否连通、是否参与路由）、当前链路角色以及重连任务字段，
//!   这些状态由同一把节点锁保护；流量账本使用独立的窄锁，见 [`RouteMetrics`]。
//!
//! ## 并发约束（What）
//! - 节点锁只在状态切换本身期间持有（翻转标志、交换句柄），绝不跨越网络调用；
//! - 角色交换在节点锁内完成“摘除旧角色、转移计数、挂接新角色”，加锁顺序固定为先节点锁后账本锁。

use std::{fmt, sync::Arc};

use parking_lot::{Mutex, MutexGuard};
use turbine_transport::ConnectionPair;

use crate::{metrics::RouteMetrics, scheduler::TaskHandle};

/// 远端服务器相对本地的关系。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    Parent,
    Child,
    /// 经路由快照得知、本地不直接持有链路的服务器。
    Remote,
    Peer,
    Shortcut,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Parent => "parent",
            NodeKind::Child => "child",
            NodeKind::Remote => "remote",
            NodeKind::Peer => "peer",
            NodeKind::Shortcut => "shortcut",
        }
    }

    /// 对等体与捷径跨越树的边界，按代价参与寻路。
    pub fn is_lateral(self) -> bool {
        matches!(self, NodeKind::Peer | NodeKind::Shortcut)
    }
}

/// 本端在链路上扮演的角色：主动拨出并转发（路由端），或接受对端拨入（监听端）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoleKind {
    Router,
    Listener,
}

/// 节点当前挂接的链路。
#[derive(Clone, Debug)]
pub struct Role {
    pub kind: RoleKind,
    pub pair: Arc<ConnectionPair>,
}

/// 角色交换的结果。
#[derive(Debug)]
pub enum SwapOutcome {
    /// 新角色已挂接；`previous` 是被替换下来的旧角色，由调用方在锁外关闭。
    Swapped { previous: Option<Role> },
    /// 同一条链路已经以同一角色挂接，本次调用没有任何副作用。
    AlreadySwapped,
}

/// 父链路的重连任务字段。
#[derive(Debug, Default)]
pub(crate) struct ReconnectTask {
    /// 是否有一次重连尝试正在进行。
    pub in_flight: bool,
    /// 已调度的周期重试；`None` 表示没有重试在排队。
    pub retry: Option<TaskHandle>,
    /// 每次调度递增，过期的回调据此识别自己已被取消。
    pub generation: u64,
}

#[derive(Debug)]
pub(crate) struct NodeState {
    pub connected: bool,
    pub route_enabled: bool,
    pub cost: f64,
    pub role: Option<Role>,
    pub reconnect: ReconnectTask,
}

/// 拓扑中的一台远端服务器。
///
/// # 教案式说明
/// - **意图 (Why)**：寻路只需要“连通且参与路由”两个标志，转发只需要当前链路，
///   二者都从节点上以短暂加锁读取；
/// - **契约 (What)**：`name` 为完整层级名且终生不变；`cost` 只对对等体与捷径有意义；
///   [`RouteNode::swap_role`] 对同一链路、同一角色的重复调用是幂等的；
/// - **风险 (Trade-offs)**：被替换的旧链路只从节点上摘除，关闭动作由调用方在锁外完成。
pub struct RouteNode {
    name: Arc<str>,
    address: Option<String>,
    kind: NodeKind,
    state: Mutex<NodeState>,
    metrics: RouteMetrics,
}

impl RouteNode {
    pub fn new(name: impl Into<Arc<str>>, address: Option<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            address,
            kind,
            state: Mutex::new(NodeState {
                connected: false,
                route_enabled: true,
                cost: 1.0,
                role: None,
                reconnect: ReconnectTask::default(),
            }),
            metrics: RouteMetrics::new(),
        }
    }

    pub fn with_cost(self, cost: f64) -> Self {
        self.state.lock().cost = cost;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn cost(&self) -> f64 {
        self.state.lock().cost
    }

    pub fn set_cost(&self, cost: f64) {
        self.state.lock().cost = cost;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_route_enabled(&self) -> bool {
        self.state.lock().route_enabled
    }

    /// 可参与寻路：既连通又未被禁用。
    pub fn is_usable(&self) -> bool {
        let state = self.state.lock();
        state.connected && state.route_enabled
    }

    /// 设置连通标志并返回旧值。
    pub fn set_connected(&self, connected: bool) -> bool {
        std::mem::replace(&mut self.state.lock().connected, connected)
    }

    pub fn set_route_enabled(&self, enabled: bool) {
        self.state.lock().route_enabled = enabled;
    }

    pub fn role(&self) -> Option<Role> {
        self.state.lock().role.clone()
    }

    pub fn role_kind(&self) -> Option<RoleKind> {
        self.state.lock().role.as_ref().map(|role| role.kind)
    }

    /// 当前链路，转发时使用。
    pub fn link(&self) -> Option<Arc<ConnectionPair>> {
        self.state.lock().role.as_ref().map(|role| Arc::clone(&role.pair))
    }

    pub fn metrics(&self) -> &RouteMetrics {
        &self.metrics
    }

    /// 在一次加锁内摘除旧角色、转移其计数并挂接新角色，同时标记为连通。
    pub fn swap_role(&self, kind: RoleKind, pair: Arc<ConnectionPair>) -> SwapOutcome {
        let mut state = self.state.lock();
        if let Some(current) = &state.role {
            if current.kind == kind && current.pair.id() == pair.id() {
                return SwapOutcome::AlreadySwapped;
            }
        }
        self.metrics.swap(pair.metrics());
        let previous = state.role.replace(Role { kind, pair });
        state.connected = true;
        SwapOutcome::Swapped { previous }
    }

    /// 摘除当前角色并把其计数并入失效账目。
    pub fn detach_role(&self) -> Option<Role> {
        let mut state = self.state.lock();
        let previous = state.role.take();
        if previous.is_some() {
            self.metrics.detach();
        }
        previous
    }

    /// 仅当当前链路就是 `pair_id` 时摘除，避免迟到的断线通知误伤新链路。
    pub fn detach_if(&self, pair_id: u64) -> Option<Role> {
        let mut state = self.state.lock();
        if state.role.as_ref().map(|role| role.pair.id()) != Some(pair_id) {
            return None;
        }
        let previous = state.role.take();
        self.metrics.detach();
        previous
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }
}

impl fmt::Debug for RouteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RouteNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("connected", &state.connected)
            .field("route_enabled", &state.route_enabled)
            .field("role", &state.role.as_ref().map(|role| role.kind))
            .finish()
    }
}
