//! 控制通道与数据通道契约。
//!
//! 控制通道承载成帧的 [`Message`]；数据通道是可选的原始字节流，只用于批量载荷。
//! 两者都累计收发字节数，供路由节点做流量统计。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex as AsyncMutex,
};
use turbine_wire::{Message, Negotiated};

use crate::{access::Candidate, error::TransportError};

/// 读写等待上限。
///
/// # 教案式说明
/// - **意图 (Why)**：把“立即返回”“限时等待”“无限等待”三种语义显式化，
///   取代以 0 和负数哨兵值编码的整数超时；
/// - **契约 (What)**：读取超时返回 `Ok(None)` 而非错误；`Immediate` 只取已缓冲的数据；
/// - **风险 (Trade-offs)**：`Forever` 只在调用方明确要求无界等待时使用，
///   路由与重连路径一律使用有界超时。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timeout {
    Immediate,
    Millis(u64),
    Forever,
}

impl Timeout {
    /// 0 表示立即返回，负数表示永久等待。
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => Timeout::Immediate,
            m if m < 0 => Timeout::Forever,
            m => Timeout::Millis(m as u64),
        }
    }

    pub fn duration(self) -> Option<Duration> {
        match self {
            Timeout::Immediate => Some(Duration::ZERO),
            Timeout::Millis(millis) => Some(Duration::from_millis(millis)),
            Timeout::Forever => None,
        }
    }

    pub fn millis(self) -> u64 {
        match self {
            Timeout::Immediate => 0,
            Timeout::Millis(millis) => millis,
            Timeout::Forever => u64::MAX,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::Immediate
        } else {
            Timeout::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        }
    }
}

/// 收发字节数快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ByteCounts {
    pub sent: u64,
    pub received: u64,
}

impl ByteCounts {
    pub fn total(self) -> u64 {
        self.sent.saturating_add(self.received)
    }
}

impl std::ops::Add for ByteCounts {
    type Output = ByteCounts;

    fn add(self, rhs: ByteCounts) -> ByteCounts {
        ByteCounts {
            sent: self.sent.saturating_add(rhs.sent),
            received: self.received.saturating_add(rhs.received),
        }
    }
}

impl std::ops::AddAssign for ByteCounts {
    fn add_assign(&mut self, rhs: ByteCounts) {
        *self = *self + rhs;
    }
}

/// 单个通道的累计字节计数器，读写路径无锁更新。
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ChannelMetrics {
    pub fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ByteCounts {
        ByteCounts {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// 控制通道契约。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 让连接对与具体传输解耦：套接字传输逐帧序列化，进程内传输直接移交 `Arc<Message>`，
///   上层代码对二者一视同仁。
///
/// ## 契约 (What)
/// - `send`：在 `timeout` 内把消息完整交给传输；写超时视为连接失效；
/// - `receive`：按 [`Timeout`] 语义等待下一条消息；超时返回 `Ok(None)`，
///   对端关闭返回 [`TransportError::EndOfStream`]；
/// - `negotiate`：登录完成后应用帧模式与差分开关，只调用一次；
/// - `shutdown`：关闭通道，之后的读写均返回流结束；
/// - 同一通道内消息按发送顺序到达。
///
/// ## 风险 (Trade-offs)
/// - 读写各自持锁，允许一个任务阻塞读取的同时另一个任务发送。
#[async_trait]
pub trait ControlChannel: Send + Sync + fmt::Debug {
    async fn send(&self, message: Arc<Message>, timeout: Timeout) -> Result<(), TransportError>;

    async fn receive(&self, timeout: Timeout) -> Result<Option<Arc<Message>>, TransportError>;

    async fn negotiate(&self, _negotiated: &Negotiated) {}

    async fn shutdown(&self) -> Result<(), TransportError>;

    fn metrics(&self) -> Arc<ChannelMetrics>;

    /// 对端身份，用于访问控制与日志。
    fn peer(&self) -> Candidate;

    /// 人类可读的对端描述。
    fn label(&self) -> &str;
}

/// 数据通道可以承载的任意双工字节流。
pub trait DataStream: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

impl<T> DataStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

/// 批量数据通道：读写两半各自加锁，支持全双工。
pub struct DataChannel {
    reader: AsyncMutex<ReadHalf<Box<dyn DataStream>>>,
    writer: AsyncMutex<WriteHalf<Box<dyn DataStream>>>,
    metrics: Arc<ChannelMetrics>,
}

impl DataChannel {
    pub fn new(stream: Box<dyn DataStream>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            metrics: Arc::new(ChannelMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<ChannelMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|err| TransportError::io("data write", err))?;
        writer
            .flush()
            .await
            .map_err(|err| TransportError::io("data flush", err))?;
        self.metrics.record_sent(bytes.len());
        Ok(())
    }

    /// 读取至多 `buf.len()` 字节；返回 0 表示对端已关闭写方向。
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let read = self
            .reader
            .lock()
            .await
            .read(buf)
            .await
            .map_err(|err| TransportError::io("data read", err))?;
        self.metrics.record_received(read);
        Ok(read)
    }

    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let result = self.reader.lock().await.read_exact(buf).await;
        match result {
            Ok(_) => {
                self.metrics.record_received(buf.len());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(TransportError::EndOfStream {
                    peer: "data channel".to_owned(),
                })
            }
            Err(err) => Err(TransportError::io("data read", err)),
        }
    }

    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|err| TransportError::io("data shutdown", err))
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}
