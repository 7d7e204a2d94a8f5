//! # fabric 模块说明
//!
//! ## 角色定位（Why）
//! - 把配置、拓扑、监听器、入站应答与父链路状态机装配成一台可运行的路由服务器；
//! - 宿主只需提供传输注册表与调度协作方，其余组件由 [`Fabric::start`] 按配置创建。
//!
//! ## 生命周期（How）
//! 1. 在配置地址上以路由访问类别监听，记录实际地址（端口 0 时由系统分配）；
//! 2. 构建拓扑并登记父服务器，入站链路逐条交给 [`Responder::serve`]；
//! 3. 配置了父服务器时发起首次连接，失败即进入周期重试；
//! 4. [`Fabric::shutdown`] 停止接受新链路、取消重试并通知父服务器。

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use turbine_transport::{Acceptor, Address, LinkOptions, TransportError, TransportRegistry};
use turbine_wire::{Message, Routed};

use crate::{
    config::FabricConfig,
    error::RouteError,
    reconnect::{ParentLink, ReconnectOutcome, ReconnectSettings},
    responder::Responder,
    scheduler::Scheduler,
    topology::{Path, Topology},
};

/// 一台运行中的路由服务器。
///
/// # 教案式说明
/// - **意图 (Why)**：为测试与宿主提供单一入口，组件之间的引用关系在这里一次性接好；
/// - **契约 (What)**：`start` 返回时监听器已就绪；首次连接父服务器的结果通过
///   [`Fabric::initial_outcome`] 查询，失败不会让 `start` 返回错误；
/// - **风险 (Trade-offs)**：析构不会自动关闭父链路，宿主应显式调用 [`Fabric::shutdown`]。
pub struct Fabric {
    topology: Arc<Topology>,
    responder: Arc<Responder>,
    parent: Option<Arc<ParentLink>>,
    initial: Option<ReconnectOutcome>,
    local_address: Address,
    accept_task: JoinHandle<()>,
}

impl Fabric {
    pub async fn start(
        config: &FabricConfig,
        transports: Arc<TransportRegistry>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Routed>), RouteError> {
        let listen_at = config.listen_address()?;
        let options = LinkOptions::router(config.wire_config())
            .with_handshake_timeout(config.ping_timeout());
        let acceptor = transports.listen(&listen_at, &options).await?;
        let local_address = acceptor.local_address().clone();

        let topology = Arc::new(Topology::new(
            &config.server_name,
            local_address.to_string(),
            config.passive_cost,
        )?);
        if let Some(parent) = &config.parent {
            topology.set_parent(&parent.name, &parent.address)?;
        }
        let (responder, inbox) = Responder::new(Arc::clone(&topology));
        let accept_task = tokio::spawn(accept_loop(acceptor, Arc::clone(&responder)));
        info!(server = %config.server_name, address = %local_address, "route fabric listening");

        let mut fabric = Self {
            topology: Arc::clone(&topology),
            responder: Arc::clone(&responder),
            parent: None,
            initial: None,
            local_address,
            accept_task,
        };
        if topology.parent().is_some() {
            let link = Arc::new(
                ParentLink::new(
                    topology,
                    transports,
                    scheduler,
                    ReconnectSettings::from_config(config),
                )?
                .with_responder(responder),
            );
            fabric.initial = Some(link.start().await);
            fabric.parent = Some(link);
        }
        Ok((fabric, inbox))
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn responder(&self) -> &Arc<Responder> {
        &self.responder
    }

    pub fn parent(&self) -> Option<&Arc<ParentLink>> {
        self.parent.as_ref()
    }

    pub fn initial_outcome(&self) -> Option<&ReconnectOutcome> {
        self.initial.as_ref()
    }

    /// 实际监听地址；同时作为本地服务器对外公布的地址。
    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    /// 等待通往 `target` 的路径出现，最长 `wait`。
    pub async fn find_path(&self, target: &str, wait: Duration) -> Result<Path, RouteError> {
        self.topology.wait_for_route(target, wait).await
    }

    /// 把载荷发往 `destination`：经下一跳链路转发，目标不可达时返回点名该服务器的错误。
    pub async fn route(&self, destination: &str, payload: Bytes) -> Result<(), RouteError> {
        let hop = self.topology.next_hop(destination)?;
        let link = hop
            .link()
            .ok_or_else(|| RouteError::unreachable(destination))?;
        link.send(Message::Routed(Routed {
            destination: destination.to_owned(),
            payload,
        }))
        .await?;
        debug!(destination, via = hop.name(), "payload routed");
        Ok(())
    }

    pub async fn shutdown(self) {
        self.accept_task.abort();
        if let Some(parent) = &self.parent {
            parent.shutdown().await;
        }
        for node in self.topology.nodes() {
            if let Some(role) = node.detach_role() {
                let _ = role.pair.disconnect().await;
            }
        }
        info!(server = self.topology.local_name(), "route fabric stopped");
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("server", &self.topology.local_name())
            .field("address", &self.local_address)
            .field("parent", &self.parent)
            .finish()
    }
}

async fn accept_loop(acceptor: Box<dyn Acceptor>, responder: Arc<Responder>) {
    loop {
        match acceptor.accept().await {
            Ok(pair) => {
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    if let Err(err) = responder.serve(Arc::new(pair)).await {
                        debug!(error = %err, "route link ended with an error");
                    }
                });
            }
            Err(TransportError::Closed) => break,
            Err(err) if err.is_addressing() => {
                debug!(error = %err, "inbound link refused");
            }
            Err(err) => {
                warn!(error = %err, "inbound link failed during handshake");
            }
        }
    }
}
