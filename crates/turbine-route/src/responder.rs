//! # responder 模块说明
//!
//! ## 角色定位（Why）
//! - 路由链路上的被动一侧：应答心跳、为请求注册的子服务器回送路由快照、解析路径查询、
//!   转发或投递路由消息、应用对等体广播、处理角色反转；
//! - 父链路与入站链路共用同一套消息处理，区别只在于链路结束后的善后由谁负责。
//!
//! ## 失败语义（What）
//! - 处理过程中因本链路收发失败而产生的错误终止读循环；
//! - 与本链路无关的失败（转发目标不可达、请求方名称不合法）以异常帧告知请求方，链路继续可用。

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use turbine_transport::{ConnectionPair, Timeout};
use turbine_wire::{ExceptionKind, Message, PathMessage, RouteRequest, Routed};

use crate::{
    error::RouteError,
    name,
    node::{NodeKind, RoleKind, RouteNode, SwapOutcome},
    reversal,
    topology::Topology,
};

/// 单条消息的处理结果。
#[derive(Debug)]
pub enum Handled {
    /// 已在同一链路上作答（心跳、路径查询）。
    Answered,
    /// 请求方已登记为 `node`，本链路挂接为其监听角色。
    Registered(Arc<RouteNode>),
    /// 目标就是本地服务器，载荷已交给投递队列。
    Delivered,
    /// 已经由 `via` 转发。
    Forwarded { via: Arc<str> },
    Reversed {
        node: Arc<RouteNode>,
        outcome: SwapOutcome,
    },
    /// 拓扑已更新；`false` 表示过期的对等体广播被丢弃。
    Applied(bool),
    /// 以异常帧拒绝了请求方，链路保持可用。
    Refused { reason: String },
    Ignored,
}

/// 路由链路的消息处理者。
///
/// # 教案式说明
/// - **意图 (Why)**：入站链路在握手后直接交给 [`Responder::serve`]，父链路由重连状态机交给
///   [`Responder::serve_link`]，两者共享 [`Responder::handle`]；
/// - **契约 (What)**：目的地为本地服务器的路由消息按到达顺序进入投递队列；
///   `serve` 结束时摘除本链路挂接过的角色，子服务器随之从路由表移除；
/// - **风险 (Trade-offs)**：投递队列无界，消费方跟不上时内存随之增长。
#[derive(Debug)]
pub struct Responder {
    topology: Arc<Topology>,
    deliveries: mpsc::UnboundedSender<Routed>,
}

impl Responder {
    pub fn new(topology: Arc<Topology>) -> (Arc<Self>, mpsc::UnboundedReceiver<Routed>) {
        let (deliveries, inbox) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                topology,
                deliveries,
            }),
            inbox,
        )
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// 处理一条入站消息。返回错误意味着本链路已不可用。
    pub async fn handle(
        &self,
        pair: &Arc<ConnectionPair>,
        message: &Message,
    ) -> Result<Handled, RouteError> {
        match message {
            Message::Ping(ping) => {
                pair.answer_ping(ping).await?;
                Ok(Handled::Answered)
            }
            Message::RouteRequest(request) => self.register(pair, request).await,
            Message::Path(request) => self.resolve(pair, request).await,
            Message::Routed(routed) => self.route(pair, routed).await,
            Message::PeerUpdate(update) => match self.topology.apply_peer_update(update) {
                Ok(applied) => Ok(Handled::Applied(applied)),
                Err(err) => self.refuse(pair, ExceptionKind::Protocol, err.to_string()).await,
            },
            Message::RoleReversal(request) if !request.from_primary => {
                let (node, outcome) = reversal::handle_reversal(&self.topology, pair, request).await?;
                Ok(Handled::Reversed { node, outcome })
            }
            Message::RoutingSnapshot(tree) => {
                self.topology.apply_snapshot(tree);
                Ok(Handled::Applied(true))
            }
            Message::Exception(exception) => {
                debug!(peer = pair.peer_label(), reason = %exception.message, "peer reported an exception");
                Ok(Handled::Ignored)
            }
            other => {
                debug!(
                    peer = pair.peer_label(),
                    command = other.kind().command(),
                    "frame ignored on route link"
                );
                Ok(Handled::Ignored)
            }
        }
    }

    async fn refuse(
        &self,
        pair: &ConnectionPair,
        kind: ExceptionKind,
        reason: String,
    ) -> Result<Handled, RouteError> {
        pair.send(Message::exception(kind, reason.clone())).await?;
        Ok(Handled::Refused { reason })
    }

    /// 子服务器（或跨树的对等体）注册路由。
    async fn register(
        &self,
        pair: &Arc<ConnectionPair>,
        request: &RouteRequest,
    ) -> Result<Handled, RouteError> {
        let local = self.topology.local_name();
        if let Some(target) = &request.target {
            if target != local {
                warn!(expected = %target, local, "route request addressed to a different server");
                return self
                    .refuse(
                        pair,
                        ExceptionKind::AddressInUse,
                        format!("{local} is running at this address, not {target}"),
                    )
                    .await;
            }
        }

        let registered = if name::parent_of(&request.name) == Some(local) {
            self.topology
                .add_child(&request.name, Some(request.address.clone()))
        } else if !name::same_root(&request.name, local) {
            match self.topology.node(&request.name) {
                Some(node) if node.kind().is_lateral() => Ok(node),
                _ => self.topology.add_peer(&request.name, &request.address, 1.0),
            }
        } else {
            Err(RouteError::Topology {
                name: request.name.clone(),
                relation: "a child",
            })
        };
        let node = match registered {
            Ok(node) => node,
            Err(err) => return self.refuse(pair, ExceptionKind::Protocol, err.to_string()).await,
        };

        if let SwapOutcome::Swapped {
            previous: Some(previous),
        } = node.swap_role(RoleKind::Listener, Arc::clone(pair))
        {
            if previous.pair.id() != pair.id() {
                let _ = previous.pair.close().await;
            }
        }
        self.topology.notify_route_change();
        pair.send(Message::RoutingSnapshot(self.topology.snapshot()))
            .await?;
        info!(node = node.name(), kind = node.kind().as_str(), "route registered");
        Ok(Handled::Registered(node))
    }

    /// 路径查询：请求中的最后一个名称是目标。
    async fn resolve(
        &self,
        pair: &ConnectionPair,
        request: &PathMessage,
    ) -> Result<Handled, RouteError> {
        let Some(target) = request.servers.last() else {
            return self
                .refuse(pair, ExceptionKind::Protocol, "path request names no target".to_owned())
                .await;
        };
        match self.topology.path_to(target) {
            Ok(path) => {
                pair.send(Message::Path(path.to_message(self.topology.local_name())))
                    .await?;
                Ok(Handled::Answered)
            }
            Err(err) => self.refuse(pair, ExceptionKind::Unreachable, err.to_string()).await,
        }
    }

    async fn route(&self, pair: &ConnectionPair, routed: &Routed) -> Result<Handled, RouteError> {
        if routed.destination == self.topology.local_name() {
            if self.deliveries.send(routed.clone()).is_err() {
                debug!(destination = %routed.destination, "no consumer for routed payload");
            }
            return Ok(Handled::Delivered);
        }
        let forwarded = async {
            let hop = self.topology.next_hop(&routed.destination)?;
            let link = hop
                .link()
                .ok_or_else(|| RouteError::unreachable(&routed.destination))?;
            link.send(Message::Routed(routed.clone())).await?;
            Ok::<_, RouteError>(hop.name_arc())
        };
        match forwarded.await {
            Ok(via) => Ok(Handled::Forwarded { via }),
            Err(err) => {
                warn!(destination = %routed.destination, error = %err, "routed message dropped");
                self.refuse(pair, ExceptionKind::Unreachable, err.to_string()).await
            }
        }
    }

    /// 服务一条入站链路直到它结束，随后摘除它挂接过的角色。
    pub async fn serve(self: Arc<Self>, pair: Arc<ConnectionPair>) -> Result<(), RouteError> {
        let (registered, outcome) = self.run(&pair, None).await;
        if let Some(node) = registered {
            if node.detach_if(pair.id()).is_some() {
                node.set_connected(false);
                if node.kind() == NodeKind::Child {
                    self.topology.lost_child(node.name());
                } else {
                    self.topology.notify_route_change();
                }
            }
        }
        let _ = pair.close().await;
        outcome
    }

    /// 服务一条已挂接到 `node` 的链路；链路结束后的善后由调用方负责。
    pub async fn serve_link(
        &self,
        node: Arc<RouteNode>,
        pair: Arc<ConnectionPair>,
    ) -> Result<(), RouteError> {
        self.run(&pair, Some(node)).await.1
    }

    async fn run(
        &self,
        pair: &Arc<ConnectionPair>,
        mut registered: Option<Arc<RouteNode>>,
    ) -> (Option<Arc<RouteNode>>, Result<(), RouteError>) {
        loop {
            let message = match pair.receive(Timeout::Forever).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(err) if err.is_end_of_stream() => {
                    debug!(peer = pair.peer_label(), "route link closed");
                    return (registered, Ok(()));
                }
                Err(err) => return (registered, Err(err.into())),
            };
            match self.handle(pair, &message).await {
                Ok(Handled::Registered(node)) | Ok(Handled::Reversed { node, .. }) => {
                    registered = Some(node);
                }
                Ok(_) => {}
                Err(err) => return (registered, Err(err)),
            }
        }
    }
}
