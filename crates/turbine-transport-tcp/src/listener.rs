use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener as TokioTcpListener, TcpStream},
    sync::{Mutex as AsyncMutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use turbine_transport::{
    Acceptor, Address, ConnectionPair, DataChannel, LinkOptions, TransportError,
};
use turbine_wire::Message;

use crate::{
    channel::{TcpControlChannel, TcpSocketConfig, read_text_frame},
    error::{ACCEPT, BIND, PAIR, WRITE, map_io_error},
};

/// 接受队列深度：后台任务已分类、尚未被 `accept` 取走的控制连接数。
const BACKLOG: usize = 128;
/// 数据通道配对成功后写回发起方的确认字节。
pub(crate) const DATA_ACK: u8 = 1;

/// 数据连接与控制连接的汇合点。
///
/// 数据连接可能先于 `accept` 侧登记到达，因此两种先后顺序都要能落位。
enum DataSlot {
    Waiting(oneshot::Sender<TcpStream>),
    Arrived(TcpStream),
}

type PendingData = Arc<DashMap<u64, DataSlot>>;

/// TCP 监听端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 同一端口同时承载控制连接与数据连接：后台任务持续接受套接字，
///   按首字节区分两者（控制连接以 `LGN` 登录帧开头，数据连接以 `DLC` 身份帧开头）；
/// - 控制连接交给 [`Acceptor::accept`] 完成访问控制与登录握手，数据连接按连接编号与之配对。
///
/// ## 契约 (What)
/// - `local_address` 返回实际端口（监听 `:0` 时由系统分配）；
/// - 访问被拒绝时 `accept` 返回 [`TransportError::AccessDenied`]，监听器继续可用；
/// - 监听地址带访问控制表时，判定前先反查对端主机名，主机名与 IP 字面量都参与匹配；
/// - 析构时停止后台接受任务。
///
/// ## 注意事项 (Trade-offs)
/// - 数据连接在握手超时内未出现时，整条连接对被关闭并报告握手超时；
/// - 反查受握手超时约束，失败时候选方只剩 IP 字面量，按主机名书写的规则不会命中。
pub struct TcpAcceptor {
    address: Address,
    options: LinkOptions,
    config: TcpSocketConfig,
    incoming: AsyncMutex<mpsc::Receiver<TcpStream>>,
    pending_data: PendingData,
    next_connection: AtomicU64,
    accept_task: JoinHandle<()>,
}

impl TcpAcceptor {
    pub(crate) async fn bind(
        address: &Address,
        options: &LinkOptions,
        config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let target = address.socket_target();
        let listener = TokioTcpListener::bind(&target)
            .await
            .map_err(|err| map_io_error(BIND, &target, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, &target, err))?;
        let address = address.clone().with_port(local.port());

        let (tx, rx) = mpsc::channel(BACKLOG);
        let pending_data: PendingData = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            tx,
            Arc::clone(&pending_data),
            options.clone(),
        ));
        info!(listener = %address, "tcp listener bound");
        Ok(Self {
            address,
            options: options.clone(),
            config,
            incoming: AsyncMutex::new(rx),
            pending_data,
            next_connection: AtomicU64::new(1),
            accept_task,
        })
    }

    async fn claim_data(&self, connection_id: u64) -> Result<TcpStream, TransportError> {
        let waiting = match self.pending_data.entry(connection_id) {
            Entry::Occupied(slot) => match slot.remove() {
                DataSlot::Arrived(stream) => return Ok(stream),
                DataSlot::Waiting(_) => {
                    return Err(TransportError::Protocol(format!(
                        "connection {connection_id} is already waiting for its data channel"
                    )));
                }
            },
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(DataSlot::Waiting(tx));
                rx
            }
        };
        match tokio::time::timeout(self.options.handshake_timeout, waiting).await {
            Ok(Ok(stream)) => Ok(stream),
            _ => {
                self.pending_data.remove(&connection_id);
                Err(TransportError::HandshakeTimeout {
                    operation: "data channel pairing",
                })
            }
        }
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn local_address(&self) -> &Address {
        &self.address
    }

    async fn accept(&self) -> Result<ConnectionPair, TransportError> {
        let stream = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut control = TcpControlChannel::new(stream, &self.options.wire, &self.config)?;
        if self.address.access().is_some() {
            let ip = control.peer_addr().ip().to_canonical();
            if let Some(host) = reverse_lookup(ip, self.options.handshake_timeout).await {
                control = control.with_peer_host(host);
            }
        }
        let mut pair =
            ConnectionPair::admit(Box::new(control), &self.address, &self.options, connection_id)
                .await?;

        if pair.data_requested() {
            let paired = match self.claim_data(connection_id).await {
                Ok(mut stream) => stream
                    .write_all(&[DATA_ACK])
                    .await
                    .map(|()| stream)
                    .map_err(|err| map_io_error(WRITE, pair.peer_label(), err)),
                Err(err) => Err(err),
            };
            match paired {
                Ok(stream) => {
                    self.config
                        .apply(&stream)
                        .map_err(|err| map_io_error(PAIR, pair.peer_label(), err))?;
                    pair.attach_data(DataChannel::new(Box::new(stream)));
                }
                Err(err) => {
                    warn!(connection_id, error = %err, "data channel never arrived");
                    let _ = pair.close().await;
                    return Err(err);
                }
            }
        }
        Ok(pair)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("address", &self.address)
            .field("pending_data", &self.pending_data.len())
            .finish()
    }
}

/// 在阻塞线程池里反查 `ip` 的主机名。
///
/// 解析器找不到名字时返回数字形式，这种结果与失败同样按 `None` 处理。
async fn reverse_lookup(ip: IpAddr, limit: Duration) -> Option<String> {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
    match tokio::time::timeout(limit, lookup).await {
        Ok(Ok(Ok(host))) if host.parse::<IpAddr>().is_err() => Some(host),
        Ok(Ok(Ok(_))) => None,
        Ok(Ok(Err(err))) => {
            debug!(peer = %ip, error = %err, "reverse lookup failed");
            None
        }
        Ok(Err(err)) => {
            debug!(peer = %ip, error = %err, "reverse lookup task aborted");
            None
        }
        Err(_) => {
            debug!(peer = %ip, millis = limit.as_millis() as u64, "reverse lookup timed out");
            None
        }
    }
}

async fn accept_loop(
    listener: TokioTcpListener,
    incoming: mpsc::Sender<TcpStream>,
    pending_data: PendingData,
    options: LinkOptions,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                let err = map_io_error(ACCEPT, "listener", err);
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let incoming = incoming.clone();
        let pending_data = Arc::clone(&pending_data);
        let options = options.clone();
        tokio::spawn(async move {
            if let Err(err) = classify(stream, peer, incoming, pending_data, &options).await {
                debug!(peer = %peer, error = %err, "inbound socket dropped before pairing");
            }
        });
    }
}

/// 按首字节区分控制连接与数据连接。
async fn classify(
    mut stream: TcpStream,
    peer: SocketAddr,
    incoming: mpsc::Sender<TcpStream>,
    pending_data: PendingData,
    options: &LinkOptions,
) -> Result<(), TransportError> {
    let label = peer.to_string();
    let mut head = [0u8; 1];
    let peeked = tokio::time::timeout(options.handshake_timeout, stream.peek(&mut head))
        .await
        .map_err(|_| TransportError::HandshakeTimeout {
            operation: "first frame",
        })?
        .map_err(|err| map_io_error(ACCEPT, &label, err))?;
    if peeked == 0 {
        return Err(TransportError::EndOfStream { peer: label });
    }

    if head[0] != b'D' {
        return incoming
            .send(stream)
            .await
            .map_err(|_| TransportError::Closed);
    }

    let identity = tokio::time::timeout(
        options.handshake_timeout,
        read_text_frame(&mut stream, &options.wire, &label),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout {
        operation: "data channel identity",
    })??;
    let Message::DataChannelOpen { connection_id } = identity else {
        return Err(TransportError::Protocol(format!(
            "expected data channel identity, got {}",
            identity.kind().command()
        )));
    };

    match pending_data.entry(connection_id) {
        Entry::Occupied(slot) => match slot.remove() {
            DataSlot::Waiting(waiter) => {
                let _ = waiter.send(stream);
            }
            DataSlot::Arrived(_) => {
                return Err(TransportError::Protocol(format!(
                    "duplicate data channel for connection {connection_id}"
                )));
            }
        },
        Entry::Vacant(slot) => {
            slot.insert(DataSlot::Arrived(stream));
        }
    }
    debug!(peer = %peer, connection_id, "data channel identified");
    Ok(())
}
