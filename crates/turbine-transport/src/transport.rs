//! 传输能力接口与按协议分派的注册表。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::{
    address::{Address, Scheme},
    error::TransportError,
    pair::{ConnectionPair, LinkOptions},
};

/// 一种具体传输对外暴露的全部能力。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 以组合代替继承：套接字传输与进程内传输各自实现本接口，连接对只依赖接口本身；
/// - 新传输只需实现 `dial` 与 `listen`，关闭流程默认委托给连接对。
///
/// ## 契约 (What)
/// - `dial`：完成拨号与发起方握手，返回可立即收发的连接对；
/// - `listen`：在地址上开始监听，返回接受器；地址附带的访问控制表在接受时生效；
/// - `close`：释放资源但不通知对端；`disconnect`：先发送 `Stop` 再释放。
///
/// ## 风险 (Trade-offs)
/// - `dial` 对寻址类错误同步返回，绝不自动重试；重试策略属于调用方。
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn scheme(&self) -> Scheme;

    async fn dial(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<ConnectionPair, TransportError>;

    async fn listen(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<Box<dyn Acceptor>, TransportError>;

    async fn close(&self, pair: &ConnectionPair) -> Result<(), TransportError> {
        pair.close().await
    }

    async fn disconnect(&self, pair: &ConnectionPair) -> Result<(), TransportError> {
        pair.disconnect().await
    }
}

/// 监听端：逐个产出已完成接受方握手的连接对。
///
/// 访问被拒绝的入站连接以 [`TransportError::AccessDenied`] 报告，接受器本身仍可继续使用。
#[async_trait]
pub trait Acceptor: Send + Sync + fmt::Debug {
    /// 实际生效的监听地址（例如端口 0 被替换为系统分配的端口）。
    fn local_address(&self) -> &Address;

    async fn accept(&self) -> Result<ConnectionPair, TransportError>;
}

/// 协议到传输实现的映射。
///
/// # 教案式说明
/// - **意图 (Why)**：地址解析与拨号完全与传输种类解耦，调用方只持有注册表；
/// - **契约 (What)**：同一协议重复注册时后者覆盖前者；未注册的协议返回
///   [`TransportError::UnsupportedScheme`]；
/// - **风险 (Trade-offs)**：注册表可在运行中修改，已建立的连接不受影响。
#[derive(Debug, Default)]
pub struct TransportRegistry {
    transports: DashMap<Scheme, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let scheme = transport.scheme();
        debug!(scheme = scheme.as_str(), "transport registered");
        self.transports.insert(scheme, transport)
    }

    pub fn resolve(&self, address: &Address) -> Result<Arc<dyn Transport>, TransportError> {
        self.transports
            .get(&address.scheme())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::UnsupportedScheme {
                scheme: address.scheme().as_str().to_owned(),
            })
    }

    /// 解析地址串并拨号。
    pub async fn dial(
        &self,
        address: &str,
        options: &LinkOptions,
    ) -> Result<ConnectionPair, TransportError> {
        let address = Address::parse(address)?;
        self.resolve(&address)?.dial(&address, options).await
    }

    pub async fn listen(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<Box<dyn Acceptor>, TransportError> {
        self.resolve(address)?.listen(address, options).await
    }
}
