//! # reconnect 模块说明
//!
//! ## 角色定位（Why）
//! - 父链路是本地服务器与上层树的唯一通道，断开后必须自动恢复，且任意时刻最多一次恢复尝试在进行；
//! - [`ParentLink`] 持有父节点、传输注册表与调度协作方，把“断开通知 → 周期重试 → 重新注册路由”
//!   串成一台显式的状态机。
//!
//! ## 状态迁移（How）
//! - `Connected → Disconnected`：[`ParentLink::lost_routing`] 翻转连通标志、摘除旧链路并把其计数并入失效账目，
//!   唤醒等待路由的调用方，随后（进程未在关闭时）调度周期重试。已断开且已有重试排队时整个调用是空操作；
//! - `Disconnected → Reconnecting`：周期回调调用 [`ParentLink::reconnect`]。已连通则取消重试并返回；
//!   已有尝试在进行则立即返回，不产生任何副作用；
//! - `Reconnecting → Connected`：拨号、发送路由请求并在心跳等待内等待快照，成功即挂接新链路并取消重试；
//! - 对端以异常帧答复说明该地址上已是另一台服务器：记录告警并放弃，不再重试；
//! - 超时或传输失败：释放本次建立的链路、把它的流量并入失效账目，留待下一次周期回调。
//!
//! ## 并发约束（What）
//! - 节点锁只包住标志翻转与句柄交换；拨号、收发都在锁外进行；
//! - 取消即丢弃句柄；回调触发时在锁内核对代次，过期回调直接返回。

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use turbine_transport::{ConnectionPair, LinkOptions, Timeout, TransportRegistry};
use turbine_wire::{Message, RouteRequest, WireConfig};

use crate::{
    config::FabricConfig,
    error::RouteError,
    node::{RoleKind, RouteNode, SwapOutcome},
    responder::Responder,
    reversal,
    scheduler::Scheduler,
    topology::Topology,
};

/// 重连节奏与线路参数。
#[derive(Clone, Debug)]
pub struct ReconnectSettings {
    pub interval: Duration,
    pub ping_timeout: Duration,
    pub wire: WireConfig,
    /// 重新注册后请求父服务器反转角色，用于本地无法被父服务器拨入的部署。
    pub reverse_route: bool,
}

impl ReconnectSettings {
    pub fn from_config(config: &FabricConfig) -> Self {
        Self {
            interval: config.reconnect_interval(),
            ping_timeout: config.ping_timeout(),
            wire: config.wire_config(),
            reverse_route: config.reverse_route,
        }
    }
}

/// 一次 [`ParentLink::reconnect`] 调用的结果。
///
/// 并发竞争是预期内的情形，以状态值表达而不是错误。
#[derive(Debug)]
pub enum ReconnectOutcome {
    /// 链路已经连通（例如被入站的角色反转恢复），重试已取消。
    AlreadyConnected,
    /// 另一次尝试正在进行，本次调用没有任何副作用。
    AlreadyInProgress,
    Reconnected,
    /// 对端明确表示该地址上已是另一台服务器，重试已取消。
    Abandoned { reason: String },
    /// 在心跳等待内没有收到快照，保留周期重试。
    TimedOut,
    Failed(RouteError),
}

impl ReconnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ReconnectOutcome::AlreadyConnected | ReconnectOutcome::Reconnected
        )
    }
}

/// 尝试结束时清除进行中标志，无论以何种方式返回。
struct InFlight<'a>(&'a RouteNode);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock_state().reconnect.in_flight = false;
    }
}

/// 父链路的重连状态机。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 把“单飞”约束落在节点锁上：调度与尝试各有一个标志，锁内检查并设置，锁外执行网络操作；
/// - 周期重试的句柄由节点独占，取消只需丢弃句柄。
///
/// ## 契约 (What)
/// - 必须在 tokio 运行时内使用：链路监视与重试触发都派生为后台任务；
/// - 挂接了 [`Responder`] 时，每条新建立的父链路都有一个读任务负责应答并在断开时调用
///   [`ParentLink::lost_routing`]；未挂接时由调用方自行监视链路；
/// - 传给 [`Scheduler`] 的回调不得被同步调用：调度发生在节点锁内。
///
/// ## 风险 (Trade-offs)
/// - 拨号失败属于寻址错误（格式、访问拒绝）时取消重试，其余失败保留重试；
///   因此配置错误的父地址只会被尝试一次，需要运维介入。
pub struct ParentLink {
    topology: Arc<Topology>,
    node: Arc<RouteNode>,
    transports: Arc<TransportRegistry>,
    scheduler: Arc<dyn Scheduler>,
    responder: Option<Arc<Responder>>,
    settings: ReconnectSettings,
    shutting_down: AtomicBool,
    attempts: AtomicU64,
}

impl ParentLink {
    pub fn new(
        topology: Arc<Topology>,
        transports: Arc<TransportRegistry>,
        scheduler: Arc<dyn Scheduler>,
        settings: ReconnectSettings,
    ) -> Result<Self, RouteError> {
        let node = topology.parent().ok_or_else(|| RouteError::Topology {
            name: topology.local_name().to_owned(),
            relation: "a child without a configured parent",
        })?;
        Ok(Self {
            topology,
            node,
            transports,
            scheduler,
            responder: None,
            settings,
            shutting_down: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        })
    }

    pub fn with_responder(mut self, responder: Arc<Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn node(&self) -> &Arc<RouteNode> {
        &self.node
    }

    pub fn settings(&self) -> &ReconnectSettings {
        &self.settings
    }

    /// 已发起的网络尝试次数。
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn is_retry_scheduled(&self) -> bool {
        self.node.lock_state().reconnect.retry.is_some()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.node.lock_state().reconnect.in_flight
    }

    /// 传输层报告父链路丢失。
    pub fn lost_routing(self: &Arc<Self>) {
        self.lose(None);
    }

    /// 只有当 `pair_id` 仍是父节点的当前链路时才视为丢失；迟到的旧链路通知被忽略。
    pub fn lost_link(self: &Arc<Self>, pair_id: u64) {
        self.lose(Some(pair_id));
    }

    fn lose(self: &Arc<Self>, expected: Option<u64>) {
        let previous = {
            let mut state = self.node.lock_state();
            if let Some(expected) = expected {
                if state.role.as_ref().map(|role| role.pair.id()) != Some(expected) {
                    return;
                }
            }
            if !state.connected && state.reconnect.retry.is_some() {
                return;
            }
            state.connected = false;
            let previous = state.role.take();
            if previous.is_some() {
                self.node.metrics().detach();
            }
            if !self.shutting_down.load(Ordering::Acquire) && state.reconnect.retry.is_none() {
                state.reconnect.generation += 1;
                let generation = state.reconnect.generation;
                let link = Arc::downgrade(self);
                let handle = self.scheduler.schedule_every(
                    self.settings.interval,
                    Arc::new(move || {
                        if let Some(link) = link.upgrade() {
                            link.fire(generation);
                        }
                    }),
                );
                state.reconnect.retry = Some(handle);
                info!(
                    node = self.node.name(),
                    interval_ms = self.settings.interval.as_millis() as u64,
                    "parent link lost, reconnect scheduled"
                );
            }
            previous
        };

        self.topology.notify_route_change();
        if let Some(previous) = previous {
            release_in_background(previous.pair);
        }
    }

    /// 周期回调：核对代次后派生一次重连。
    fn fire(self: &Arc<Self>, generation: u64) {
        {
            let state = self.node.lock_state();
            if state.reconnect.retry.is_none() || state.reconnect.generation != generation {
                debug!(node = self.node.name(), generation, "stale reconnect callback ignored");
                return;
            }
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(node = self.node.name(), "reconnect callback fired outside a runtime");
            return;
        };
        let link = Arc::clone(self);
        runtime.spawn(async move {
            let outcome = link.reconnect().await;
            debug!(node = link.node.name(), ?outcome, "scheduled reconnect finished");
        });
    }

    fn cancel_retry(&self) {
        let retry = self.node.lock_state().reconnect.retry.take();
        if let Some(retry) = retry {
            debug!(node = self.node.name(), task = retry.id(), "reconnect retry cancelled");
        }
    }

    /// 尝试重新建立父链路。
    pub async fn reconnect(self: &Arc<Self>) -> ReconnectOutcome {
        {
            let mut state = self.node.lock_state();
            if state.connected && state.route_enabled {
                let retry = state.reconnect.retry.take();
                drop(state);
                drop(retry);
                return ReconnectOutcome::AlreadyConnected;
            }
            if state.reconnect.in_flight {
                return ReconnectOutcome::AlreadyInProgress;
            }
            state.reconnect.in_flight = true;
            state.connected = false;
        }
        let _in_flight = InFlight(&self.node);

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            node = self.node.name(),
            address = self.node.address().unwrap_or("-"),
            attempt,
            "reconnecting to parent"
        );
        let outcome = self.attempt().await;
        match &outcome {
            ReconnectOutcome::Reconnected => {
                info!(node = self.node.name(), attempt, "parent link re-established");
            }
            ReconnectOutcome::TimedOut => {
                info!(node = self.node.name(), attempt, "parent did not answer, will retry");
            }
            ReconnectOutcome::Failed(err) if err.is_retryable() => {
                info!(node = self.node.name(), attempt, error = %err, "reconnect failed, will retry");
            }
            ReconnectOutcome::Failed(err) => {
                warn!(node = self.node.name(), attempt, error = %err, "reconnect failed permanently");
                self.cancel_retry();
            }
            _ => {}
        }
        outcome
    }

    async fn attempt(self: &Arc<Self>) -> ReconnectOutcome {
        let Some(address) = self.node.address() else {
            return ReconnectOutcome::Failed(RouteError::Topology {
                name: self.node.name().to_owned(),
                relation: "a parent without an address",
            });
        };
        let options = LinkOptions::router(self.settings.wire.clone())
            .with_handshake_timeout(self.settings.ping_timeout)
            .with_write_timeout(Timeout::from(self.settings.ping_timeout));
        let pair = match self.transports.dial(address, &options).await {
            Ok(pair) => Arc::new(pair),
            Err(err) => return ReconnectOutcome::Failed(err.into()),
        };

        let request = RouteRequest {
            name: self.topology.local_name().to_owned(),
            address: self.topology.local_address().to_owned(),
            target: Some(self.node.name().to_owned()),
        };
        if let Err(err) = pair.send(Message::RouteRequest(request)).await {
            self.release(&pair).await;
            return ReconnectOutcome::Failed(err.into());
        }

        let reply = match pair.receive(Timeout::from(self.settings.ping_timeout)).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                self.release(&pair).await;
                return ReconnectOutcome::TimedOut;
            }
            Err(err) => {
                self.release(&pair).await;
                return ReconnectOutcome::Failed(err.into());
            }
        };

        match &*reply {
            Message::RoutingSnapshot(tree) => {
                self.topology.apply_snapshot(tree);
                if !self.settings.reverse_route {
                    self.establish(pair).await;
                    return ReconnectOutcome::Reconnected;
                }
                match reversal::request_reversal(
                    &self.topology,
                    &self.node,
                    Arc::clone(&pair),
                    self.settings.ping_timeout,
                )
                .await
                {
                    Ok(_) => {
                        self.activate(pair);
                        ReconnectOutcome::Reconnected
                    }
                    // 链路已在反转失败时释放，角色保持原样，由重试周期重新拨出。
                    Err(err) => ReconnectOutcome::Failed(err),
                }
            }
            Message::Exception(exception) => {
                warn!(
                    node = self.node.name(),
                    address,
                    reason = %exception.message,
                    "a different server has been established at the same address"
                );
                self.release(&pair).await;
                self.cancel_retry();
                ReconnectOutcome::Abandoned {
                    reason: exception.message.clone(),
                }
            }
            other => {
                self.release(&pair).await;
                ReconnectOutcome::Failed(RouteError::Unexpected {
                    server: self.node.name().to_owned(),
                    command: other.kind().command(),
                })
            }
        }
    }

    /// 挂接新链路、取消重试并开始监视。
    async fn establish(self: &Arc<Self>, pair: Arc<ConnectionPair>) {
        if let SwapOutcome::Swapped {
            previous: Some(previous),
        } = self.node.swap_role(RoleKind::Router, Arc::clone(&pair))
        {
            let _ = previous.pair.close().await;
        }
        self.activate(pair);
    }

    fn activate(self: &Arc<Self>, pair: Arc<ConnectionPair>) {
        self.cancel_retry();
        self.topology.notify_route_change();
        self.watch(pair);
    }

    /// 为父链路派生读任务；链路结束即报告丢失。
    pub(crate) fn watch(self: &Arc<Self>, pair: Arc<ConnectionPair>) {
        let Some(responder) = self.responder.clone() else {
            return;
        };
        let link = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = responder.serve_link(Arc::clone(&link.node), Arc::clone(&pair)).await {
                debug!(node = link.node.name(), error = %err, "parent link reader stopped");
            }
            link.lost_link(pair.id());
        });
    }

    /// 释放一次失败尝试建立的链路，流量并入失效账目。
    async fn release(&self, pair: &ConnectionPair) {
        let _ = pair.close().await;
        self.node.metrics().fold(pair.metrics().snapshot());
    }

    /// 进程关闭：不再调度重试，取消已排队的重试并通知父服务器。
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.cancel_retry();
        let previous = {
            let mut state = self.node.lock_state();
            state.connected = false;
            let previous = state.role.take();
            if previous.is_some() {
                self.node.metrics().detach();
            }
            previous
        };
        if let Some(previous) = previous {
            let _ = previous.pair.disconnect().await;
        }
        self.topology.notify_route_change();
    }

    /// 初次连接：成功即返回；否则进入与断线相同的重试流程。
    pub async fn start(self: &Arc<Self>) -> ReconnectOutcome {
        let outcome = self.reconnect().await;
        let retry = match &outcome {
            ReconnectOutcome::TimedOut => true,
            ReconnectOutcome::Failed(err) => err.is_retryable(),
            _ => false,
        };
        if retry {
            self.lost_routing();
        }
        outcome
    }
}

impl std::fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentLink")
            .field("node", &self.node)
            .field("attempts", &self.attempts())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// 断线通知可能来自同步上下文，旧链路的关闭放到后台完成。
fn release_in_background(pair: Arc<ConnectionPair>) {
    if let Ok(runtime) = Handle::try_current() {
        runtime.spawn(async move {
            let _ = pair.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tracing_test::traced_test;
    use turbine_transport::{Address, InProcessTransport};
    use turbine_wire::{ExceptionKind, ServerTree};

    use super::*;
    use crate::scheduler::{Task, TaskHandle};

    /// 只记录调度次数、从不触发的调度器。
    #[derive(Debug, Default)]
    struct HeldScheduler {
        scheduled: AtomicUsize,
    }

    impl Scheduler for HeldScheduler {
        fn schedule_every(&self, _period: Duration, _task: Task) -> TaskHandle {
            let id = self.scheduled.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            TaskHandle::new(id, || {})
        }
    }

    fn settings() -> ReconnectSettings {
        ReconnectSettings {
            interval: Duration::from_millis(100),
            ping_timeout: Duration::from_secs(5),
            wire: WireConfig::default(),
            reverse_route: false,
        }
    }

    async fn registry_with_refusing_parent(name: &str) -> Arc<TransportRegistry> {
        let registry = Arc::new(TransportRegistry::new());
        registry.register(Arc::new(InProcessTransport::new()));
        let listen_at = Address::parse(&format!("RAM://{name}")).expect("地址");
        let acceptor = registry
            .listen(&listen_at, &LinkOptions::router(WireConfig::default()))
            .await
            .expect("监听");
        tokio::spawn(async move {
            let Ok(pair) = acceptor.accept().await else {
                return;
            };
            if let Ok(Some(message)) = pair.receive(Timeout::Millis(5_000)).await {
                if matches!(*message, Message::RouteRequest(_)) {
                    let _ = pair
                        .send(Message::exception(
                            ExceptionKind::AddressInUse,
                            "/other is running at this address",
                        ))
                        .await;
                }
            }
            let _ = pair.receive(Timeout::Millis(5_000)).await;
        });
        registry
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn refusal_from_a_different_server_abandons_the_link() {
        let registry = registry_with_refusing_parent("occupied").await;
        let topology = Arc::new(Topology::new("/r/x", "RAM://x", 100.0).expect("拓扑"));
        topology.set_parent("/r", "RAM://occupied").expect("父");
        let scheduler = Arc::new(HeldScheduler::default());
        let link = Arc::new(
            ParentLink::new(topology, registry, scheduler.clone(), settings()).expect("父链路"),
        );

        link.lost_routing();
        assert!(link.is_retry_scheduled());

        let outcome = link.reconnect().await;
        assert!(matches!(outcome, ReconnectOutcome::Abandoned { .. }), "得到 {outcome:?}");
        assert!(!link.is_retry_scheduled());
        assert!(!link.is_reconnecting());
        assert!(!link.node().is_connected());
        assert_eq!(scheduler.scheduled.load(Ordering::SeqCst), 1);
        assert!(logs_contain(
            "a different server has been established at the same address"
        ));
    }

    async fn registry_with_parent_declining_reversal(name: &str) -> Arc<TransportRegistry> {
        let registry = Arc::new(TransportRegistry::new());
        registry.register(Arc::new(InProcessTransport::new()));
        let listen_at = Address::parse(&format!("RAM://{name}")).expect("地址");
        let acceptor = registry
            .listen(&listen_at, &LinkOptions::router(WireConfig::default()))
            .await
            .expect("监听");
        tokio::spawn(async move {
            let Ok(pair) = acceptor.accept().await else {
                return;
            };
            while let Ok(Some(message)) = pair.receive(Timeout::Millis(5_000)).await {
                let reply = match &*message {
                    Message::RouteRequest(_) => {
                        let mut root = ServerTree::leaf("/r", None);
                        root.children.push(ServerTree::leaf("/r/x", None));
                        Message::RoutingSnapshot(root)
                    }
                    Message::RoleReversal(_) => {
                        Message::exception(ExceptionKind::Protocol, "reversal not permitted yet")
                    }
                    _ => continue,
                };
                if pair.send(reply).await.is_err() {
                    return;
                }
            }
        });
        registry
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn declined_reversal_keeps_the_retry() {
        let registry = registry_with_parent_declining_reversal("declining").await;
        let topology = Arc::new(Topology::new("/r/x", "RAM://x", 100.0).expect("拓扑"));
        topology.set_parent("/r", "RAM://declining").expect("父");
        let link = Arc::new(
            ParentLink::new(
                topology,
                registry,
                Arc::new(HeldScheduler::default()),
                ReconnectSettings {
                    reverse_route: true,
                    ..settings()
                },
            )
            .expect("父链路"),
        );

        link.lost_routing();
        let outcome = link.reconnect().await;
        assert!(
            matches!(&outcome, ReconnectOutcome::Failed(RouteError::Refused { .. })),
            "得到 {outcome:?}"
        );
        assert!(link.is_retry_scheduled());
        assert!(!link.is_reconnecting());
        assert!(!link.node().is_connected());
        assert!(link.node().role_kind().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn addressing_failures_stop_the_retry() {
        let registry = Arc::new(TransportRegistry::new());
        registry.register(Arc::new(InProcessTransport::new()));
        let topology = Arc::new(Topology::new("/r/x", "RAM://x", 100.0).expect("拓扑"));
        topology.set_parent("/r", "badscheme://r").expect("父");
        let link = Arc::new(
            ParentLink::new(
                topology,
                registry,
                Arc::new(HeldScheduler::default()),
                settings(),
            )
            .expect("父链路"),
        );

        link.lost_routing();
        let outcome = link.reconnect().await;
        assert!(
            matches!(&outcome, ReconnectOutcome::Failed(err) if err.is_addressing()),
            "得到 {outcome:?}"
        );
        assert!(!link.is_retry_scheduled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_parent_keeps_the_retry() {
        let registry = Arc::new(TransportRegistry::new());
        registry.register(Arc::new(InProcessTransport::new()));
        let topology = Arc::new(Topology::new("/r/x", "RAM://x", 100.0).expect("拓扑"));
        topology.set_parent("/r", "RAM://nobody").expect("父");
        let link = Arc::new(
            ParentLink::new(
                topology,
                registry,
                Arc::new(HeldScheduler::default()),
                settings(),
            )
            .expect("父链路"),
        );

        let outcome = link.start().await;
        assert!(matches!(outcome, ReconnectOutcome::Failed(_)), "得到 {outcome:?}");
        assert!(link.is_retry_scheduled());
        assert_eq!(link.attempts(), 1);
    }

    #[test]
    fn parent_is_required() {
        let topology = Arc::new(Topology::new("/root", "RAM://root", 100.0).expect("拓扑"));
        let link = ParentLink::new(
            topology,
            Arc::new(TransportRegistry::new()),
            Arc::new(HeldScheduler::default()),
            settings(),
        );
        assert!(matches!(link, Err(RouteError::Topology { .. })));
    }
}
