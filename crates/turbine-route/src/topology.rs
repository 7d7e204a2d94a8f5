//! # topology 模块说明
//!
//! ## 角色定位（Why）
//! - [`Topology`] 是本地服务器眼中的整张网：唯一的父、若干子、经路由快照得知的远端服务器，
//!   以及跨越树边界的对等体与捷径；
//! - 寻路（[`Topology::find_path`]）与转发（[`Topology::next_hop`]）都只读这里的节点状态，
//!   不做任何网络调用。
//!
//! ## 寻路规则（How）
//! - 目标在本地子树中：自上而下逐级检查子节点，每一跳代价 1；
//! - 目标与本地同根：先向父方向逐级上行，每一跳代价 1，直到某个祖先的子树包含目标，再从该祖先下行；
//! - 树内无路可走或目标在另一棵树：考察对等体与捷径，代价为其自身代价加上进入远端子树后的跳数，
//!   对等体广播的捷径在此基础上再叠加广播代价；
//! - 途经任一节点未连通或被禁用，该候选即不存在；这不是错误，只是“没有路”。
//!
//! ## 风险提示（Trade-offs）
//! - 代价达到被动阈值的对等体路径被排除：对等体仍被记录，但不会被用于路由；
//! - 等价候选按首跳名称的字典序取最小者，保证结果可复现。

use std::{cmp::Ordering, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::Notify;
use tracing::{debug, info};
use turbine_wire::{PathMessage, PeerUpdate, ServerTree, ShortcutInfo};

use crate::{
    config::FabricConfig,
    error::RouteError,
    name,
    node::{NodeKind, RouteNode},
};

/// 从本地服务器到目标服务器的一条有序、带代价的路径。
///
/// `hops` 不含本地服务器；目标即本地时路径为空、代价为零。
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    hops: Vec<Arc<str>>,
    cost: f64,
}

impl Path {
    pub fn local() -> Self {
        Self {
            hops: Vec::new(),
            cost: 0.0,
        }
    }

    fn push(&mut self, hop: Arc<str>, cost: f64) {
        self.hops.push(hop);
        self.cost += cost;
    }

    fn extend(&mut self, tail: Path) {
        self.hops.extend(tail.hops);
        self.cost += tail.cost;
    }

    pub fn hops(&self) -> &[Arc<str>] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn first_hop(&self) -> Option<&str> {
        self.hops.first().map(|hop| &**hop)
    }

    /// 线路表示：首项为本地服务器名，代价向上取整。
    pub fn to_message(&self, local: &str) -> PathMessage {
        PathMessage {
            servers: std::iter::once(local.to_owned())
                .chain(self.hops.iter().map(|hop| hop.to_string()))
                .collect(),
            cost: self.cost.ceil() as u32,
        }
    }

    fn better_than(&self, other: &Path) -> bool {
        match self.cost.partial_cmp(&other.cost) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal) => self.first_hop() < other.first_hop(),
            _ => false,
        }
    }
}

/// 对等体最近一次广播的内容。
#[derive(Clone, Debug, PartialEq)]
pub struct PeerRecord {
    pub counter: u64,
    pub address: String,
    pub shortcuts: Vec<ShortcutInfo>,
}

/// 本地服务器视角的路由拓扑。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 以完整层级名为键集中存放所有远端节点，父子关系由名称推导，不另存指针；
/// - 拓扑变化（连通、断开、新增、移除）唤醒正在等待路由的调用方。
///
/// ## 契约 (What)
/// - `set_parent` 只接受本地名的上一级，`add_child` 只接受本地名的直接下一级；
/// - `apply_peer_update` 只接受计数器严格更大的更新，重复或过期的广播返回 `false`；
/// - `next_hop` 失败时返回点名目标的 [`RouteError::Unreachable`]。
///
/// ## 风险 (Trade-offs)
/// - 节点表使用 `DashMap`，遍历期间持有分片读锁；寻路遍历只做内存读取，持锁时间很短。
#[derive(Debug)]
pub struct Topology {
    local: Arc<str>,
    address: String,
    passive_cost: f64,
    nodes: DashMap<Arc<str>, Arc<RouteNode>>,
    peers: DashMap<Arc<str>, PeerRecord>,
    changed: Notify,
}

impl Topology {
    pub fn new(
        local: &str,
        address: impl Into<String>,
        passive_cost: f64,
    ) -> Result<Self, RouteError> {
        name::validate(local).map_err(|reason| RouteError::InvalidName {
            name: local.to_owned(),
            reason,
        })?;
        Ok(Self {
            local: Arc::from(local),
            address: address.into(),
            passive_cost,
            nodes: DashMap::new(),
            peers: DashMap::new(),
            changed: Notify::new(),
        })
    }

    /// 按配置构造，配置了父服务器时一并登记（初始为未连通）。
    pub fn from_config(config: &FabricConfig) -> Result<Self, RouteError> {
        let topology = Self::new(&config.server_name, &config.address, config.passive_cost)?;
        if let Some(parent) = &config.parent {
            topology.set_parent(&parent.name, &parent.address)?;
        }
        Ok(topology)
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn local_address(&self) -> &str {
        &self.address
    }

    pub fn passive_cost(&self) -> f64 {
        self.passive_cost
    }

    pub fn node(&self, name: &str) -> Option<Arc<RouteNode>> {
        self.nodes.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn nodes(&self) -> Vec<Arc<RouteNode>> {
        self.nodes.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn parent(&self) -> Option<Arc<RouteNode>> {
        name::parent_of(&self.local)
            .and_then(|parent| self.node(parent))
            .filter(|node| node.kind() == NodeKind::Parent)
    }

    pub fn children(&self) -> Vec<Arc<RouteNode>> {
        let mut children: Vec<_> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().kind() == NodeKind::Child)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        children
    }

    /// 唤醒所有等待路由的调用方，让它们重新寻路。
    pub fn notify_route_change(&self) {
        self.changed.notify_waiters();
    }

    pub fn set_parent(&self, name: &str, address: &str) -> Result<Arc<RouteNode>, RouteError> {
        if name::parent_of(&self.local) != Some(name) {
            return Err(RouteError::Topology {
                name: name.to_owned(),
                relation: "the parent",
            });
        }
        Ok(self.register(name, Some(address.to_owned()), NodeKind::Parent))
    }

    pub fn add_child(
        &self,
        name: &str,
        address: Option<String>,
    ) -> Result<Arc<RouteNode>, RouteError> {
        if name::parent_of(name) != Some(&*self.local) {
            return Err(RouteError::Topology {
                name: name.to_owned(),
                relation: "a child",
            });
        }
        Ok(self.register(name, address, NodeKind::Child))
    }

    pub fn add_shortcut(
        &self,
        name: &str,
        address: &str,
        cost: f64,
    ) -> Result<Arc<RouteNode>, RouteError> {
        self.add_lateral(name, address, cost, NodeKind::Shortcut)
    }

    pub fn add_peer(&self, name: &str, address: &str, cost: f64) -> Result<Arc<RouteNode>, RouteError> {
        self.add_lateral(name, address, cost, NodeKind::Peer)
    }

    fn add_lateral(
        &self,
        name: &str,
        address: &str,
        cost: f64,
        kind: NodeKind,
    ) -> Result<Arc<RouteNode>, RouteError> {
        name::validate(name).map_err(|reason| RouteError::InvalidName {
            name: name.to_owned(),
            reason,
        })?;
        if name == &*self.local {
            return Err(RouteError::Topology {
                name: name.to_owned(),
                relation: kind.as_str(),
            });
        }
        let node = self.register(name, Some(address.to_owned()), kind);
        node.set_cost(cost);
        Ok(node)
    }

    /// 登记一台经他人得知的远端服务器，视为连通。
    pub fn add_remote(
        &self,
        name: &str,
        address: Option<String>,
    ) -> Result<Arc<RouteNode>, RouteError> {
        name::validate(name).map_err(|reason| RouteError::InvalidName {
            name: name.to_owned(),
            reason,
        })?;
        if name == &*self.local {
            return Err(RouteError::Topology {
                name: name.to_owned(),
                relation: "a remote server",
            });
        }
        let node = self.register(name, address, NodeKind::Remote);
        node.set_connected(true);
        Ok(node)
    }

    /// 登记 `owner` 子树中的远端服务器（不含 `owner` 自身），返回登记数。
    ///
    /// 子服务器或对等体在反转角色时附带自己的子树，本地据此得知更深层的服务器。
    pub fn apply_subtree(&self, owner: &str, tree: &ServerTree) -> usize {
        let mut entries = Vec::new();
        flatten(tree, &mut entries);
        let mut registered = 0;
        for (server, address) in entries {
            if !name::is_descendant(&server, owner) || server.as_str() == &*self.local {
                continue;
            }
            if self.node(&server).is_some_and(|node| node.kind() != NodeKind::Remote) {
                continue;
            }
            if self.add_remote(&server, address).is_ok() {
                registered += 1;
            }
        }
        registered
    }

    /// 同名同类节点已存在时返回原节点，保留其链路与账本。
    fn register(&self, name: &str, address: Option<String>, kind: NodeKind) -> Arc<RouteNode> {
        let node = match self.nodes.entry(Arc::from(name)) {
            Entry::Occupied(mut slot) => {
                if slot.get().kind() == kind {
                    return Arc::clone(slot.get());
                }
                let node = Arc::new(RouteNode::new(name, address, kind));
                slot.insert(Arc::clone(&node));
                node
            }
            Entry::Vacant(slot) => {
                let node = Arc::new(RouteNode::new(name, address, kind));
                slot.insert(Arc::clone(&node));
                node
            }
        };
        debug!(node = name, kind = kind.as_str(), "route node registered");
        self.notify_route_change();
        node
    }

    pub fn remove(&self, name: &str) -> Option<Arc<RouteNode>> {
        let removed = self.nodes.remove(name).map(|(_, node)| node);
        if removed.is_some() {
            self.notify_route_change();
        }
        removed
    }

    /// 子链路丢失：移除该子节点及经它得知的所有远端后代。
    pub fn lost_child(&self, name: &str) -> Option<Arc<RouteNode>> {
        self.nodes
            .retain(|key, node| !(node.kind() == NodeKind::Remote && name::is_descendant(key, name)));
        let removed = self.remove(name);
        if removed.is_some() {
            info!(node = name, "child lost, removed from routing map");
        }
        removed
    }

    /// 应用对等体广播；计数器不大于已记录值的广播被丢弃。
    pub fn apply_peer_update(&self, update: &PeerUpdate) -> Result<bool, RouteError> {
        name::validate(&update.name).map_err(|reason| RouteError::InvalidName {
            name: update.name.clone(),
            reason,
        })?;
        let record = PeerRecord {
            counter: update.counter,
            address: update.address.clone(),
            shortcuts: update.shortcuts.clone(),
        };
        match self.peers.entry(Arc::from(update.name.as_str())) {
            Entry::Occupied(mut slot) => {
                if slot.get().counter >= update.counter {
                    debug!(
                        peer = %update.name,
                        counter = update.counter,
                        known = slot.get().counter,
                        "stale peer update ignored"
                    );
                    return Ok(false);
                }
                slot.insert(record);
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        if self.node(&update.name).is_none() {
            self.register(&update.name, Some(update.address.clone()), NodeKind::Peer);
        }
        self.notify_route_change();
        Ok(true)
    }

    pub fn peer_record(&self, name: &str) -> Option<PeerRecord> {
        self.peers.get(name).map(|entry| entry.value().clone())
    }

    /// 应用父方向送来的路由快照，返回登记的远端节点数。
    ///
    /// 本地服务器及其子树以本地状态为准；父、子节点保持原样；
    /// 同根下不再出现于快照中的远端节点被移除。
    pub fn apply_snapshot(&self, tree: &ServerTree) -> usize {
        let mut entries = Vec::new();
        flatten(tree, &mut entries);

        let mut registered = 0;
        for (server, address) in &entries {
            if server.as_str() == &*self.local
                || name::is_descendant(server, &self.local)
                || name::validate(server).is_err()
            {
                continue;
            }
            match self.node(server) {
                Some(node) if node.kind() != NodeKind::Remote => continue,
                Some(node) => {
                    node.set_connected(true);
                }
                None => {
                    let node = RouteNode::new(server.as_str(), address.clone(), NodeKind::Remote);
                    node.set_connected(true);
                    self.nodes.insert(Arc::from(server.as_str()), Arc::new(node));
                }
            }
            registered += 1;
        }

        if name::same_root(&tree.name, &self.local) {
            let local = Arc::clone(&self.local);
            self.nodes.retain(|key, node| {
                node.kind() != NodeKind::Remote
                    || name::is_descendant(key, &local)
                    || !name::same_root(key, &local)
                    || entries.iter().any(|(server, _)| server.as_str() == &**key)
            });
        }
        self.notify_route_change();
        registered
    }

    /// 本地已知的同根树，连通节点才会出现在快照中。
    pub fn snapshot(&self) -> ServerTree {
        let root = name::root_of(&self.local).to_owned();
        let mut entries = vec![(self.local.to_string(), Some(self.address.clone()))];
        for entry in self.nodes.iter() {
            let node = entry.value();
            if node.kind().is_lateral() || !node.is_connected() {
                continue;
            }
            if node.name() == root || name::is_descendant(node.name(), &root) {
                entries.push((node.name().to_owned(), node.address().map(str::to_owned)));
            }
        }
        build_tree(&root, entries)
    }

    /// 寻找到 `target` 的最低代价路径；不存在可用路径时返回 `None`。
    pub fn find_path(&self, target: &str) -> Option<Path> {
        if target == &*self.local {
            return Some(Path::local());
        }
        if name::validate(target).is_err() {
            return None;
        }
        let tree = if name::is_descendant(target, &self.local) {
            self.search_down(&self.local, target)
        } else if name::same_root(target, &self.local) {
            self.search_up(target)
        } else {
            None
        };
        tree.or_else(|| self.search_lateral(target))
    }

    /// 与 [`Topology::find_path`] 相同，但以点名目标的错误表达“没有路”。
    pub fn path_to(&self, target: &str) -> Result<Path, RouteError> {
        self.find_path(target)
            .ok_or_else(|| RouteError::unreachable(target))
    }

    /// 转发到 `destination` 时的下一跳节点；该节点必须持有可用链路。
    pub fn next_hop(&self, destination: &str) -> Result<Arc<RouteNode>, RouteError> {
        let path = self.path_to(destination)?;
        let Some(first) = path.first_hop() else {
            return Err(RouteError::Topology {
                name: destination.to_owned(),
                relation: "a next hop",
            });
        };
        self.node(first)
            .filter(|node| node.link().is_some_and(|pair| !pair.is_closed()))
            .ok_or_else(|| RouteError::unreachable(destination))
    }

    /// 等待直到出现通往 `target` 的路径；超时后返回点名目标的错误。
    pub async fn wait_for_route(&self, target: &str, timeout: Duration) -> Result<Path, RouteError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if let Some(path) = self.find_path(target) {
                return Ok(path);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(RouteError::unreachable(target));
            }
        }
    }

    fn usable(&self, name: &str) -> Option<Arc<RouteNode>> {
        self.node(name).filter(|node| node.is_usable())
    }

    fn search_down(&self, from: &str, target: &str) -> Option<Path> {
        let mut path = Path::local();
        for hop in name::chain_below(from, target) {
            let node = self.usable(hop)?;
            path.push(node.name_arc(), 1.0);
        }
        Some(path)
    }

    fn search_up(&self, target: &str) -> Option<Path> {
        let mut path = Path::local();
        let mut current = name::parent_of(&self.local)?;
        loop {
            let node = self.usable(current)?;
            path.push(node.name_arc(), 1.0);
            if current == target {
                return Some(path);
            }
            if name::is_descendant(target, current) {
                path.extend(self.search_down(current, target)?);
                return Some(path);
            }
            current = name::parent_of(current)?;
        }
    }

    fn search_lateral(&self, target: &str) -> Option<Path> {
        let mut best: Option<Path> = None;
        let mut consider = |candidate: Path| {
            if candidate.cost >= self.passive_cost {
                return;
            }
            if best.as_ref().is_none_or(|current| candidate.better_than(current)) {
                best = Some(candidate);
            }
        };

        for node in self.nodes() {
            if !node.kind().is_lateral() || !node.is_usable() {
                continue;
            }
            let cost = node.cost();
            if let Some(path) = enter(&node, cost, target) {
                consider(path);
            }
            if node.kind() != NodeKind::Peer {
                continue;
            }
            let Some(record) = self.peer_record(node.name()) else {
                continue;
            };
            for shortcut in record.shortcuts.iter().filter(|shortcut| shortcut.active) {
                if shortcut.name != target && !name::is_descendant(target, &shortcut.name) {
                    continue;
                }
                let mut path = Path::local();
                path.push(node.name_arc(), cost);
                path.push(Arc::from(shortcut.name.as_str()), shortcut.cost);
                for hop in name::chain_below(&shortcut.name, target) {
                    path.push(Arc::from(hop), 1.0);
                }
                consider(path);
            }
        }
        best
    }
}

/// 经对等体或捷径 `node` 进入其子树到达 `target` 的路径。
fn enter(node: &RouteNode, cost: f64, target: &str) -> Option<Path> {
    if node.name() != target && !name::is_descendant(target, node.name()) {
        return None;
    }
    let mut path = Path::local();
    path.push(node.name_arc(), cost);
    for hop in name::chain_below(node.name(), target) {
        path.push(Arc::from(hop), 1.0);
    }
    Some(path)
}

fn flatten(tree: &ServerTree, out: &mut Vec<(String, Option<String>)>) {
    out.push((tree.name.clone(), tree.address.clone()));
    for child in &tree.children {
        flatten(child, out);
    }
}

fn build_tree(root: &str, mut entries: Vec<(String, Option<String>)>) -> ServerTree {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut tree = ServerTree::leaf(root, None);
    for (server, address) in entries {
        if server == root {
            tree.address = address;
            continue;
        }
        if !name::is_descendant(&server, root) {
            continue;
        }
        let mut cursor = &mut tree;
        for hop in name::chain_below(root, &server) {
            let index = match cursor.children.iter().position(|child| child.name == hop) {
                Some(index) => index,
                None => {
                    cursor.children.push(ServerTree::leaf(hop, None));
                    cursor.children.len() - 1
                }
            };
            cursor = &mut cursor.children[index];
        }
        cursor.address = address;
    }
    tree
}
