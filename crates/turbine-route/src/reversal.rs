//! # reversal 模块说明
//!
//! ## 角色定位（Why）
//! - 当本地服务器位于边界之后、无法被对端拨入时，由本地拨出一条链路，再请求对端把这条链路当作
//!   “对端拨入本地”来使用：本地挂接路由角色，对端挂接监听角色；
//! - 发起方发送 `from_primary = false` 的请求，对端（主方）完成交换后以 `from_primary = true` 应答。
//!
//! ## 幂等与账本（What）
//! - 角色交换通过 [`RouteNode::swap_role`] 在一次节点加锁内完成“摘除旧角色、转移计数、挂接新角色”；
//! - 重放的请求遇到同一链路、同一角色时返回 [`SwapOutcome::AlreadySwapped`]，不会再次并入计数；
//! - 交换失败时双方保持原有角色，发起方按普通父链路重连的节奏重试。

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};
use turbine_transport::{ConnectionPair, Timeout};
use turbine_wire::{Message, RoleReversal};

use crate::{
    error::RouteError,
    name,
    node::{NodeKind, RoleKind, RouteNode, SwapOutcome},
    topology::Topology,
};

fn reversal_message(topology: &Topology, from_primary: bool) -> Message {
    Message::RoleReversal(RoleReversal {
        name: topology.local_name().to_owned(),
        address: topology.local_address().to_owned(),
        from_primary,
        tree: Some(topology.snapshot()),
    })
}

/// 发起方：在自己拨出的 `pair` 上请求对端反转角色，成功后本地为 `node` 挂接路由角色。
///
/// # 契约
/// - 在 `wait` 内未收到应答返回不可达错误，`node` 的角色保持不变，`pair` 被关闭并计入失效账目；
/// - 应答中的路由树按父方向快照应用。
pub async fn request_reversal(
    topology: &Topology,
    node: &Arc<RouteNode>,
    pair: Arc<ConnectionPair>,
    wait: Duration,
) -> Result<SwapOutcome, RouteError> {
    let outcome = exchange(topology, node, &pair, wait).await;
    if outcome.is_err() {
        let _ = pair.close().await;
        node.metrics().fold(pair.metrics().snapshot());
    }
    outcome
}

async fn exchange(
    topology: &Topology,
    node: &Arc<RouteNode>,
    pair: &Arc<ConnectionPair>,
    wait: Duration,
) -> Result<SwapOutcome, RouteError> {
    pair.send(reversal_message(topology, false)).await?;
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let Some(reply) = pair.receive(Timeout::from(remaining)).await? else {
            return Err(RouteError::unreachable(node.name()));
        };
        match &*reply {
            Message::RoleReversal(reply) if reply.from_primary => {
                if let Some(tree) = &reply.tree {
                    if node.kind() == NodeKind::Parent {
                        topology.apply_snapshot(tree);
                    }
                }
                let outcome = node.swap_role(RoleKind::Router, Arc::clone(pair));
                if let SwapOutcome::Swapped {
                    previous: Some(previous),
                } = &outcome
                {
                    if previous.pair.id() != pair.id() {
                        let _ = previous.pair.close().await;
                    }
                }
                topology.notify_route_change();
                info!(node = node.name(), "role reversal completed, now routing");
                return Ok(outcome);
            }
            Message::Exception(exception) => {
                return Err(RouteError::Refused {
                    server: node.name().to_owned(),
                    kind: exception.kind.clone(),
                    message: exception.message.clone(),
                });
            }
            Message::Ping(ping) => pair.answer_ping(ping).await?,
            other => {
                warn!(
                    node = node.name(),
                    command = other.kind().command(),
                    "unexpected frame while waiting for role reversal"
                );
            }
        }
        if remaining.is_zero() {
            return Err(RouteError::unreachable(node.name()));
        }
    }
}

/// 主方：处理对端发来的反转请求，把 `pair` 挂接为对端节点的监听角色并应答。
///
/// 请求方按名称归类：本地的直接下一级为子，本地的上一级为父，其余视为对等体。
/// 重放的请求不会再次交换角色，但仍会应答，使发起方能够完成自己那一侧。
pub async fn handle_reversal(
    topology: &Topology,
    pair: &Arc<ConnectionPair>,
    request: &RoleReversal,
) -> Result<(Arc<RouteNode>, SwapOutcome), RouteError> {
    let node = if name::parent_of(&request.name) == Some(topology.local_name()) {
        topology.add_child(&request.name, Some(request.address.clone()))?
    } else if name::parent_of(topology.local_name()) == Some(request.name.as_str()) {
        topology.set_parent(&request.name, &request.address)?
    } else {
        match topology.node(&request.name) {
            Some(node) if node.kind().is_lateral() => node,
            _ => topology.add_peer(&request.name, &request.address, 1.0)?,
        }
    };

    if let Some(tree) = &request.tree {
        topology.apply_subtree(&request.name, tree);
    }
    let outcome = node.swap_role(RoleKind::Listener, Arc::clone(pair));
    match &outcome {
        SwapOutcome::Swapped { previous } => {
            if let Some(previous) = previous {
                if previous.pair.id() != pair.id() {
                    let _ = previous.pair.close().await;
                }
            }
            topology.notify_route_change();
            info!(node = node.name(), "role reversal accepted, now listening");
        }
        SwapOutcome::AlreadySwapped => {
            // 路由请求已把这条链路挂为监听角色，或者这是一次重放。
            info!(node = node.name(), "link already attached in the requested role");
        }
    }
    pair.send(reversal_message(topology, true)).await?;
    Ok((node, outcome))
}
