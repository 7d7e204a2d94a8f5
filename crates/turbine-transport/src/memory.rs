//! # memory 模块说明
//!
//! ## 角色定位（Why）
//! - 同一运行时内的两个端点无需序列化：发送即把 `Arc<Message>` 交给对端队列；
//! - 它与套接字传输遵循完全相同的 [`ControlChannel`] 契约，上层代码不感知差别，
//!   因此也是连接对契约测试的首选载体。
//!
//! ## 实现要点（How）
//! - 每个方向一条有界 `mpsc` 队列；两端共享一个 `watch` 关闭信号，任一端关闭即整条链路关闭；
//! - 关闭前已入队的消息仍可被读出，`Stop` 帧因此总能先于流结束到达；
//! - 流量统计只计应用载荷字节数，因为没有线路字节可数。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    io::DuplexStream,
    sync::{Mutex as AsyncMutex, mpsc, watch},
};
use tracing::{debug, info};
use turbine_wire::Message;

use crate::{
    access::Candidate,
    address::{Address, Scheme},
    channel::{ChannelMetrics, ControlChannel, DataChannel, Timeout},
    error::TransportError,
    pair::{ConnectionPair, LinkOptions},
    transport::{Acceptor, Transport},
};

/// 每个方向允许积压的消息条数。
const QUEUE_DEPTH: usize = 256;
/// 数据通道的内存缓冲大小。
const DATA_BUFFER: usize = 64 * 1024;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内控制通道的一端。
pub struct InProcessChannel {
    label: String,
    outbound: Mutex<Option<mpsc::Sender<Arc<Message>>>>,
    inbound: AsyncMutex<mpsc::Receiver<Arc<Message>>>,
    link_closed: Arc<watch::Sender<bool>>,
    locally_closed: AtomicBool,
    metrics: Arc<ChannelMetrics>,
}

impl InProcessChannel {
    /// 创建一对互联的端点，`(a, b)` 中 a 发送的消息由 b 读出，反之亦然。
    pub fn pair(label_a: &str, label_b: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(QUEUE_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(QUEUE_DEPTH);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let end = |label: &str, tx, rx| Self {
            label: label.to_owned(),
            outbound: Mutex::new(Some(tx)),
            inbound: AsyncMutex::new(rx),
            link_closed: Arc::clone(&closed),
            locally_closed: AtomicBool::new(false),
            metrics: Arc::new(ChannelMetrics::default()),
        };
        (end(label_a, a_tx, a_rx), end(label_b, b_tx, b_rx))
    }

    fn end_of_stream(&self) -> TransportError {
        if self.locally_closed.load(Ordering::Acquire) {
            TransportError::Closed
        } else {
            TransportError::EndOfStream {
                peer: self.label.clone(),
            }
        }
    }

    fn is_link_closed(&self) -> bool {
        *self.link_closed.borrow()
    }
}

#[async_trait]
impl ControlChannel for InProcessChannel {
    async fn send(&self, message: Arc<Message>, timeout: Timeout) -> Result<(), TransportError> {
        if self.is_link_closed() {
            return Err(self.end_of_stream());
        }
        let sender = self
            .outbound
            .lock()
            .as_ref()
            .cloned()
            .ok_or(TransportError::Closed)?;
        let bytes = message.payload_len();
        let result = match timeout.duration() {
            None => sender.send(message).await.map_err(|_| self.end_of_stream()),
            Some(limit) => match sender.send_timeout(message, limit).await {
                Ok(()) => Ok(()),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    Err(TransportError::WriteTimeout {
                        peer: self.label.clone(),
                        millis: timeout.millis(),
                    })
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(self.end_of_stream()),
            },
        };
        if result.is_ok() {
            self.metrics.record_sent(bytes);
        }
        result
    }

    async fn receive(&self, timeout: Timeout) -> Result<Option<Arc<Message>>, TransportError> {
        if self.locally_closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        let delivered = |message: Arc<Message>| {
            self.metrics.record_received(message.payload_len());
            Ok(Some(message))
        };

        match inbound.try_recv() {
            Ok(message) => return delivered(message),
            Err(mpsc::error::TryRecvError::Disconnected) => return Err(self.end_of_stream()),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        if self.is_link_closed() {
            return Err(self.end_of_stream());
        }
        if timeout == Timeout::Immediate {
            return Ok(None);
        }

        let mut closed = self.link_closed.subscribe();
        let limit = timeout.duration();
        let sleep = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            message = inbound.recv() => match message {
                Some(message) => delivered(message),
                None => Err(self.end_of_stream()),
            },
            _ = closed.wait_for(|closed| *closed) => match inbound.try_recv() {
                Ok(message) => delivered(message),
                Err(_) => Err(self.end_of_stream()),
            },
            _ = sleep => Ok(None),
        }
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.locally_closed.store(true, Ordering::Release);
        self.outbound.lock().take();
        self.link_closed.send_replace(true);
        Ok(())
    }

    fn metrics(&self) -> Arc<ChannelMetrics> {
        Arc::clone(&self.metrics)
    }

    fn peer(&self) -> Candidate {
        Candidate::loopback()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for InProcessChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessChannel")
            .field("label", &self.label)
            .field("closed", &self.is_link_closed())
            .finish()
    }
}

/// 拨号方交给监听方的待接受链路。
struct PendingLink {
    control: InProcessChannel,
    data: DuplexStream,
}

type Listeners = Arc<DashMap<Arc<str>, (u64, mpsc::Sender<PendingLink>)>>;

/// 进程内传输，地址形如 `ram://name`。
#[derive(Clone, Debug, Default)]
pub struct InProcessTransport {
    listeners: Listeners,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前注册的监听名。
    pub fn listening(&self) -> Vec<String> {
        self.listeners
            .iter()
            .map(|entry| entry.key().to_string())
            .collect()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn scheme(&self) -> Scheme {
        Scheme::InProcess
    }

    async fn dial(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<ConnectionPair, TransportError> {
        let unreachable = || TransportError::Unreachable {
            address: address.to_string(),
        };
        let sender = self
            .listeners
            .get(address.host())
            .map(|entry| entry.value().1.clone())
            .ok_or_else(unreachable)?;

        let label = format!("{address}");
        let (local, remote) = InProcessChannel::pair(&label, &format!("{label}<-dialer"));
        let (data_local, data_remote) = tokio::io::duplex(DATA_BUFFER);
        sender
            .send(PendingLink {
                control: remote,
                data: data_remote,
            })
            .await
            .map_err(|_| unreachable())?;

        let mut pair = ConnectionPair::initiate(Box::new(local), address, options).await?;
        if pair.data_requested() {
            pair.attach_data(DataChannel::new(Box::new(data_local)));
        }
        Ok(pair)
    }

    async fn listen(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<Box<dyn Acceptor>, TransportError> {
        let name: Arc<str> = address.host().into();
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        match self.listeners.entry(Arc::clone(&name)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::AddressInUse {
                    address: address.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((id, tx));
            }
        }
        info!(listener = %address, "in-process listener registered");
        Ok(Box::new(InProcessAcceptor {
            id,
            name,
            address: address.clone(),
            options: options.clone(),
            incoming: AsyncMutex::new(rx),
            listeners: Arc::clone(&self.listeners),
            next_connection: AtomicU64::new(1),
        }))
    }
}

/// 进程内监听端；析构时自动注销监听名。
pub struct InProcessAcceptor {
    id: u64,
    name: Arc<str>,
    address: Address,
    options: LinkOptions,
    incoming: AsyncMutex<mpsc::Receiver<PendingLink>>,
    listeners: Listeners,
    next_connection: AtomicU64,
}

#[async_trait]
impl Acceptor for InProcessAcceptor {
    fn local_address(&self) -> &Address {
        &self.address
    }

    async fn accept(&self) -> Result<ConnectionPair, TransportError> {
        let pending = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut pair = ConnectionPair::admit(
            Box::new(pending.control),
            &self.address,
            &self.options,
            connection_id,
        )
        .await?;
        if pair.data_requested() {
            pair.attach_data(DataChannel::new(Box::new(pending.data)));
        }
        Ok(pair)
    }
}

impl Drop for InProcessAcceptor {
    fn drop(&mut self) {
        let id = self.id;
        if self
            .listeners
            .remove_if(&self.name, |_, (owner, _)| *owner == id)
            .is_some()
        {
            debug!(listener = %self.address, "in-process listener deregistered");
        }
    }
}

impl fmt::Debug for InProcessAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessAcceptor")
            .field("address", &self.address)
            .finish()
    }
}
