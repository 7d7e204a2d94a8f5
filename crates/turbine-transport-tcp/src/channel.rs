use std::{
    fmt,
    io,
    net::{Shutdown, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{SockRef, Socket};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex as AsyncMutex,
    time::Instant,
};
use tracing::{trace, warn};
use turbine_transport::{Candidate, ChannelMetrics, ControlChannel, Timeout, TransportError};
use turbine_wire::{FrameDecoder, FrameEncoder, Message, Negotiated, WireConfig};

use crate::error::{CONFIGURE, READ, SHUTDOWN, WRITE, map_io_error};

/// 读缓冲的初始容量。
const READ_CHUNK: usize = 8 * 1024;

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 控制通道以小帧为主，默认关闭 Nagle 以降低心跳与路由应答的延迟；
/// - `linger` 决定关闭阶段未发送完的数据如何处置，显式配置而非依赖平台默认。
///
/// ## 契约（What）
/// - `nodelay`：默认 `true`；
/// - `linger`：`None` 遵循内核默认；`Some(d)` 在关闭后最多等待 `d`，之后以 RST 释放；
/// - **后置条件**：`apply` 返回 `Ok(())` 时选项已落地。
///
/// ## 注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上按秒取整，过小的值可能让对端收到 `ECONNRESET`。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)
    }
}

struct ReadSide {
    half: OwnedReadHalf,
    buf: BytesMut,
    decoder: FrameDecoder,
}

struct WriteSide {
    half: OwnedWriteHalf,
    buf: BytesMut,
    encoder: FrameEncoder,
}

/// 基于 TCP 的控制通道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在一条 TCP 连接上收发成帧的 [`Message`]，读写两半各自持锁，实现全双工；
/// - 读取超时以 `Ok(None)` 返回，不破坏已缓冲的半帧，下次读取从断点继续。
///
/// ## 逻辑 (How)
/// - 读：先尝试从缓冲解出一帧；不足一帧时按 [`Timeout`] 读取更多字节。
///   `Immediate` 使用非阻塞 `try_read_buf`，其余情况使用可取消的 `read_buf`，
///   超时丢弃的只是尚未完成的读取，缓冲不受影响；
/// - 写：编码到独立缓冲后 `write_all`，超时只作用于本次调用；
/// - 关闭：对复制出的套接字句柄执行双向 `shutdown`，唤醒正阻塞在读写上的任务。
///
/// ## 契约 (What)
/// - 成帧错误对连接致命：记录告警后返回 [`TransportError::Framing`]，由属主关闭连接；
/// - 写超时返回 [`TransportError::WriteTimeout`]，字节流此时可能只写了一半，
///   因此通道随即关闭，之后的读写一律返回 [`TransportError::Closed`]。
///
/// ## 注意事项 (Trade-offs)
/// - 流量统计计入线路字节（含帧头），与进程内传输只计载荷不同。
pub struct TcpControlChannel {
    reader: AsyncMutex<ReadSide>,
    writer: AsyncMutex<WriteSide>,
    shutdown_handle: Socket,
    peer_addr: SocketAddr,
    peer_host: Option<String>,
    local_addr: SocketAddr,
    label: String,
    closed: AtomicBool,
    metrics: Arc<ChannelMetrics>,
}

impl TcpControlChannel {
    pub fn new(
        stream: TcpStream,
        wire: &WireConfig,
        config: &TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, "unconnected socket", err))?;
        let label = peer_addr.to_string();
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, &label, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, &label, err))?;
        let shutdown_handle = SockRef::from(&stream)
            .try_clone()
            .map_err(|err| map_io_error(CONFIGURE, &label, err))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: AsyncMutex::new(ReadSide {
                half: read_half,
                buf: BytesMut::with_capacity(READ_CHUNK),
                decoder: FrameDecoder::new(wire),
            }),
            writer: AsyncMutex::new(WriteSide {
                half: write_half,
                buf: BytesMut::new(),
                encoder: FrameEncoder::new(wire),
            }),
            shutdown_handle,
            peer_addr,
            peer_host: None,
            local_addr,
            label,
            closed: AtomicBool::new(false),
            metrics: Arc::new(ChannelMetrics::default()),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 附上反查得到的对端主机名，访问控制随后同时匹配主机名与 IP。
    pub fn with_peer_host(mut self, host: impl Into<String>) -> Self {
        self.peer_host = Some(host.into());
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn end_of_stream(&self) -> TransportError {
        TransportError::EndOfStream {
            peer: self.label.clone(),
        }
    }

    /// 写失败后丢弃连接：标记关闭并双向关停套接字，唤醒阻塞中的读者。
    fn discard(&self, cause: &TransportError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(peer = %self.label, error = %cause, "write failed, discarding connection");
        if let Err(err) = self.shutdown_handle.shutdown(Shutdown::Both) {
            trace!(peer = %self.label, error = %err, "shutdown after failed write");
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ControlChannel for TcpControlChannel {
    async fn send(&self, message: Arc<Message>, timeout: Timeout) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut guard = self.writer.lock().await;
        let side = &mut *guard;
        side.buf.clear();
        let written = side.encoder.encode(&message, &mut side.buf)?;
        let write = side.half.write_all(&side.buf);
        let failure = match timeout.duration() {
            None => write.await.err().map(|err| map_io_error(WRITE, &self.label, err)),
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(outcome) => outcome.err().map(|err| map_io_error(WRITE, &self.label, err)),
                Err(_) => Some(TransportError::WriteTimeout {
                    peer: self.label.clone(),
                    millis: timeout.millis(),
                }),
            },
        };
        if let Some(err) = failure {
            // 字节流可能停在半帧处，对端缓存也没有收到这一帧：连接不可再用。
            side.encoder.forget(message.kind());
            self.discard(&err);
            return Err(err);
        }
        self.metrics.record_sent(written);
        trace!(peer = %self.label, kind = message.kind().command(), bytes = written, "frame sent");
        Ok(())
    }

    async fn receive(&self, timeout: Timeout) -> Result<Option<Arc<Message>>, TransportError> {
        self.ensure_open()?;
        let deadline = timeout.duration().map(|limit| Instant::now() + limit);
        let mut guard = self.reader.lock().await;
        let side = &mut *guard;
        loop {
            match side.decoder.decode(&mut side.buf) {
                Ok(Some((message, used))) => {
                    self.metrics.record_received(used);
                    return Ok(Some(Arc::new(message)));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(peer = %self.label, error = %err, "framing error, connection is no longer usable");
                    return Err(TransportError::Framing(err));
                }
            }

            side.buf.reserve(READ_CHUNK);
            let read = match (timeout, deadline) {
                (Timeout::Immediate, _) => match side.half.try_read_buf(&mut side.buf) {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    other => other,
                },
                (_, Some(deadline)) => {
                    match tokio::time::timeout_at(deadline, side.half.read_buf(&mut side.buf)).await
                    {
                        Ok(read) => read,
                        Err(_) => return Ok(None),
                    }
                }
                (_, None) => side.half.read_buf(&mut side.buf).await,
            };
            match read {
                Ok(0) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Err(TransportError::Closed);
                    }
                    return Err(self.end_of_stream());
                }
                Ok(_) => {}
                Err(err) => return Err(map_io_error(READ, &self.label, err)),
            }
        }
    }

    async fn negotiate(&self, negotiated: &Negotiated) {
        self.reader.lock().await.decoder.apply(negotiated);
        self.writer.lock().await.encoder.apply(negotiated);
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.shutdown_handle.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io_error(SHUTDOWN, &self.label, err)),
        }
    }

    fn metrics(&self) -> Arc<ChannelMetrics> {
        Arc::clone(&self.metrics)
    }

    fn peer(&self) -> Candidate {
        Candidate {
            host: self.peer_host.clone(),
            ip: Some(self.peer_addr.ip().to_canonical()),
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for TcpControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpControlChannel")
            .field("peer", &self.peer_addr)
            .field("peer_host", &self.peer_host)
            .field("local", &self.local_addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// 读取单个文本帧；用于数据通道的身份帧。
pub(crate) async fn read_text_frame(
    stream: &mut TcpStream,
    wire: &WireConfig,
    label: &str,
) -> Result<Message, TransportError> {
    let mut decoder = FrameDecoder::new(wire);
    let mut buf = BytesMut::with_capacity(64);
    loop {
        if let Some((message, _)) = decoder.decode(&mut buf)? {
            return Ok(message);
        }
        let read = stream
            .read_buf(&mut buf)
            .await
            .map_err(|err| map_io_error(READ, label, err))?;
        if read == 0 {
            return Err(TransportError::EndOfStream {
                peer: label.to_owned(),
            });
        }
    }
}
