//! # pair 模块说明
//!
//! ## 角色定位（Why）
//! - [`ConnectionPair`] 是一条逻辑链路在本端的句柄：总是存在的控制通道，加上可选的数据通道；
//! - 无论底层是套接字还是进程内队列，登录握手、帧模式切换、心跳与关闭流程都在这里统一完成，
//!   具体传输只负责把字节或消息搬到对面。
//!
//! ## 握手流程（How）
//! 1. 接受方在处理任何消息前先做访问控制判定，拒绝时回送异常帧并关闭；
//! 2. 发起方以文本帧发送 `Login`，携带构建戳、差分意愿与是否需要数据通道；
//! 3. 接受方回送 `Login`，带上分配的连接编号与最终的差分开关；
//! 4. 双方随即切换到二进制帧，差分开关在连接存续期间不再改变。
//!
//! ## 风险提示（Trade-offs）
//! - 路由角色的链路一律关闭差分：经转发的消息可能来自不同的远端，上一帧不是可靠的差分基准。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use turbine_wire::{
    BuildStamp, ExceptionKind, Feature, FrameMode, Login, Message, Negotiated, Ping, WireConfig,
};

use crate::{
    access::AccessClass,
    address::Address,
    channel::{ByteCounts, ChannelMetrics, ControlChannel, DataChannel, Timeout},
    error::TransportError,
};

/// 登录与心跳等待上限的默认值。
pub const PING_WAIT: Duration = Duration::from_millis(30_000);

static NEXT_PAIR_ID: AtomicU64 = AtomicU64::new(1);

/// 本端在链路中的位置。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    /// 主动拨号的一方。
    Initiator,
    /// 由监听器接受的一方。
    Acceptor,
}

/// 链路用途：普通客户端会话或服务器间路由。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkRole {
    Client,
    Router,
}

/// 建立连接对时使用的参数。
///
/// # 教案式说明
/// - **意图 (Why)**：把握手所需的全部可调项收拢为一个值，由拨号方与监听方各自持有；
/// - **契约 (What)**：`class` 只对接受方生效，表示该监听器要求入站方具备的访问类别；
///   `handshake_timeout` 同时约束登录应答与数据通道配对；
/// - **风险 (Trade-offs)**：`write_timeout` 默认 [`Timeout::Forever`]，调用方需要时再收紧。
#[derive(Clone, Debug)]
pub struct LinkOptions {
    pub wire: WireConfig,
    pub role: LinkRole,
    pub class: AccessClass,
    pub data_channel: bool,
    pub handshake_timeout: Duration,
    pub write_timeout: Timeout,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            wire: WireConfig::default(),
            role: LinkRole::Client,
            class: AccessClass::Control,
            data_channel: false,
            handshake_timeout: PING_WAIT,
            write_timeout: Timeout::Forever,
        }
    }
}

impl LinkOptions {
    /// 服务器间路由链路：路由访问类别、关闭差分。
    pub fn router(wire: WireConfig) -> Self {
        Self {
            wire,
            role: LinkRole::Router,
            class: AccessClass::Router,
            ..Self::default()
        }
    }

    pub fn with_data_channel(mut self, enabled: bool) -> Self {
        self.data_channel = enabled;
        self
    }

    pub fn with_class(mut self, class: AccessClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Timeout) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// 本端是否愿意在该链路上启用差分。
    fn wants_diff(&self) -> bool {
        self.wire.diff && self.role == LinkRole::Client
    }
}

/// 连接对的流量计数句柄，可脱离连接对存活。
#[derive(Clone, Debug)]
pub struct PairMetrics {
    control: Arc<ChannelMetrics>,
    data: Arc<Mutex<Option<Arc<ChannelMetrics>>>>,
}

impl PairMetrics {
    fn new(control: Arc<ChannelMetrics>) -> Self {
        Self {
            control,
            data: Arc::new(Mutex::new(None)),
        }
    }

    pub fn snapshot(&self) -> ByteCounts {
        let control = self.control.snapshot();
        match self.data.lock().as_ref() {
            Some(data) => control + data.snapshot(),
            None => control,
        }
    }
}

/// 一条逻辑链路在本端的句柄。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 对上层隐藏传输差异：同一套 `send`/`receive`/`ping`/`disconnect` 同时服务套接字与进程内链路；
/// - 握手在构造时完成，拿到的句柄必然已通过访问控制并完成帧模式协商，不存在“半初始化”状态。
///
/// ## 契约 (What)
/// - [`ConnectionPair::initiate`] / [`ConnectionPair::admit`] 分别执行发起方与接受方握手；
/// - `receive` 遵循 [`Timeout`] 语义；对端发送 `Stop` 时表现为流结束错误；
/// - 所有方法只需 `&self`，可放入 `Arc` 由读任务与写任务共享。
///
/// ## 风险 (Trade-offs)
/// - `ping` 自行读取应答，调用期间不应有其他任务在同一连接上读取。
pub struct ConnectionPair {
    id: u64,
    side: Side,
    role: LinkRole,
    address: Address,
    control: Box<dyn ControlChannel>,
    data: Option<DataChannel>,
    metrics: PairMetrics,
    connection_id: u64,
    data_requested: bool,
    peer_stamp: BuildStamp,
    peer_username: Option<String>,
    diff: bool,
    write_timeout: Timeout,
    closed: AtomicBool,
}

impl ConnectionPair {
    /// 发起方握手：发送登录帧并等待应答。
    ///
    /// # 契约
    /// - 应答为异常帧时返回 [`TransportError::Rejected`]，控制通道随即关闭；
    /// - 在 `handshake_timeout` 内未收到应答返回 [`TransportError::HandshakeTimeout`]；
    /// - 成功后双方均已切换到二进制帧。
    pub async fn initiate(
        control: Box<dyn ControlChannel>,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<Self, TransportError> {
        let login = Login {
            username: address.username().map(str::to_owned),
            password: address.password().map(str::to_owned),
            stamp: options.wire.stamp.clone(),
            diff: options.wants_diff(),
            connection_id: None,
            data_channel: options.data_channel,
        };
        if let Err(err) = control
            .send(Arc::new(Message::Login(login)), options.write_timeout)
            .await
        {
            // 接受方可能已回送拒绝并关闭链路，拒绝原因比写失败更有价值。
            let refusal = control.receive(Timeout::Immediate).await;
            let _ = control.shutdown().await;
            return Err(match refusal.ok().flatten().as_deref() {
                Some(Message::Exception(exception)) => TransportError::Rejected {
                    message: exception.message.clone(),
                },
                _ => err,
            });
        }

        let reply = match tokio::time::timeout(
            options.handshake_timeout,
            control.receive(Timeout::Forever),
        )
        .await
        {
            Ok(reply) => reply?,
            Err(_) => {
                let _ = control.shutdown().await;
                return Err(TransportError::HandshakeTimeout { operation: "login" });
            }
        };

        let reply = match reply.as_deref() {
            Some(Message::Login(reply)) => reply.clone(),
            Some(Message::Exception(exception)) => {
                let _ = control.shutdown().await;
                return Err(TransportError::Rejected {
                    message: exception.message.clone(),
                });
            }
            Some(other) => {
                let _ = control.shutdown().await;
                return Err(TransportError::Protocol(format!(
                    "expected login reply, got {}",
                    other.kind().command()
                )));
            }
            None => {
                let _ = control.shutdown().await;
                return Err(TransportError::EndOfStream {
                    peer: control.label().to_owned(),
                });
            }
        };

        let diff = options.wants_diff() && reply.diff;
        control
            .negotiate(&Negotiated {
                mode: FrameMode::Binary,
                diff,
                peer: Some(reply.stamp.clone()),
            })
            .await;

        let connection_id = reply.connection_id.unwrap_or_default();
        debug!(
            address = %address,
            connection_id,
            diff,
            peer_version = %reply.stamp.version,
            "connection pair initiated"
        );
        Ok(Self::assemble(
            Side::Initiator,
            address.clone(),
            control,
            options,
            connection_id,
            reply.data_channel && options.data_channel,
            reply.stamp,
            None,
            diff,
        ))
    }

    /// 接受方握手：访问控制判定、读取登录帧并应答。
    ///
    /// # 契约
    /// - 访问控制在读取任何消息之前执行；拒绝时回送 `AccessDenied` 异常帧、关闭通道并返回
    ///   [`TransportError::AccessDenied`]；
    /// - 首帧不是登录帧视为协议错误。
    pub async fn admit(
        control: Box<dyn ControlChannel>,
        local: &Address,
        options: &LinkOptions,
        connection_id: u64,
    ) -> Result<Self, TransportError> {
        let candidate = control.peer();
        if !local.is_allowed_access(&candidate, options.class) {
            warn!(peer = %candidate, class = ?options.class, listener = %local, "access denied");
            let refusal = Message::exception(
                ExceptionKind::AccessDenied,
                format!("{candidate} may not connect to {local}"),
            );
            let _ = control
                .send(Arc::new(refusal), Timeout::from(options.handshake_timeout))
                .await;
            let _ = control.shutdown().await;
            return Err(TransportError::AccessDenied {
                peer: candidate.to_string(),
                class: options.class,
            });
        }

        let first = match tokio::time::timeout(
            options.handshake_timeout,
            control.receive(Timeout::Forever),
        )
        .await
        {
            Ok(first) => first?,
            Err(_) => {
                let _ = control.shutdown().await;
                return Err(TransportError::HandshakeTimeout { operation: "login" });
            }
        };
        let login = match first.as_deref() {
            Some(Message::Login(login)) => login.clone(),
            Some(other) => {
                let command = other.kind().command();
                let refusal = Message::exception(
                    ExceptionKind::Protocol,
                    format!("expected login, got {command}"),
                );
                let _ = control.send(Arc::new(refusal), options.write_timeout).await;
                let _ = control.shutdown().await;
                return Err(TransportError::Protocol(format!(
                    "expected login, got {command}"
                )));
            }
            None => {
                return Err(TransportError::EndOfStream {
                    peer: control.label().to_owned(),
                });
            }
        };

        let diff = options.wants_diff() && login.diff;
        let data_requested = login.data_channel && options.data_channel;
        let reply = Login {
            username: None,
            password: None,
            stamp: options.wire.stamp.clone(),
            diff,
            connection_id: Some(connection_id),
            data_channel: data_requested,
        };
        control
            .send(Arc::new(Message::Login(reply)), options.write_timeout)
            .await?;
        control
            .negotiate(&Negotiated {
                mode: FrameMode::Binary,
                diff,
                peer: Some(login.stamp.clone()),
            })
            .await;

        info!(
            peer = %candidate,
            listener = %local,
            connection_id,
            user = login.username.as_deref().unwrap_or("-"),
            "connection pair admitted"
        );
        Ok(Self::assemble(
            Side::Acceptor,
            local.clone(),
            control,
            options,
            connection_id,
            data_requested,
            login.stamp,
            login.username,
            diff,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        side: Side,
        address: Address,
        control: Box<dyn ControlChannel>,
        options: &LinkOptions,
        connection_id: u64,
        data_requested: bool,
        peer_stamp: BuildStamp,
        peer_username: Option<String>,
        diff: bool,
    ) -> Self {
        let metrics = PairMetrics::new(control.metrics());
        Self {
            id: NEXT_PAIR_ID.fetch_add(1, Ordering::Relaxed),
            side,
            role: options.role,
            address,
            control,
            data: None,
            metrics,
            connection_id,
            data_requested,
            peer_stamp,
            peer_username,
            diff,
            write_timeout: options.write_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// 挂接已完成配对的数据通道。
    pub fn attach_data(&mut self, data: DataChannel) {
        *self.metrics.data.lock() = Some(data.metrics());
        self.data = Some(data);
    }

    /// 进程内唯一的句柄编号，用于日志与角色交换的幂等判断。
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// 发起方为拨号目标，接受方为本地监听地址。
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// 接受方分配的连接编号，数据通道据此与控制通道配对。
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// 握手双方是否同意建立数据通道。
    pub fn data_requested(&self) -> bool {
        self.data_requested
    }

    pub fn peer_stamp(&self) -> &BuildStamp {
        &self.peer_stamp
    }

    pub fn peer_username(&self) -> Option<&str> {
        self.peer_username.as_deref()
    }

    pub fn peer_label(&self) -> &str {
        self.control.label()
    }

    pub fn diff_enabled(&self) -> bool {
        self.diff
    }

    pub fn data(&self) -> Option<&DataChannel> {
        self.data.as_ref()
    }

    pub fn metrics(&self) -> PairMetrics {
        self.metrics.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 以连接默认写超时发送。
    pub async fn send(&self, message: impl Into<Arc<Message>>) -> Result<(), TransportError> {
        self.send_with(message, self.write_timeout).await
    }

    /// 仅本次发送使用 `timeout`，之后的读写不受影响。
    pub async fn send_with(
        &self,
        message: impl Into<Arc<Message>>,
        timeout: Timeout,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.control.send(message.into(), timeout).await
    }

    /// 读取下一条消息；对端主动发送的 `Stop` 表现为流结束。
    pub async fn receive(&self, timeout: Timeout) -> Result<Option<Arc<Message>>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.control.receive(timeout).await? {
            Some(message) if matches!(*message, Message::Stop) => {
                debug!(peer = self.control.label(), "peer sent stop");
                Err(TransportError::EndOfStream {
                    peer: self.control.label().to_owned(),
                })
            }
            other => Ok(other),
        }
    }

    /// 发送心跳并等待应答，返回往返耗时。
    ///
    /// 对端构建过旧、不支持带数据心跳时，`data` 不会写上线路，应答也不携带数据。
    pub async fn ping(&self, data: Option<Bytes>, wait: Duration) -> Result<Duration, TransportError> {
        let data = data.filter(|_| self.peer_stamp.supports(Feature::PingsWithData));
        let started = Instant::now();
        self.send_with(Message::Ping(Ping { data }), Timeout::from(wait))
            .await?;
        let deadline = started + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::HandshakeTimeout { operation: "ping" });
            }
            match self.receive(Timeout::from(remaining)).await? {
                Some(message) if matches!(*message, Message::Ping(_)) => {
                    return Ok(started.elapsed());
                }
                Some(message) => {
                    debug!(kind = message.kind().command(), "discarding frame while waiting for ping");
                }
                None => return Err(TransportError::HandshakeTimeout { operation: "ping" }),
            }
        }
    }

    /// 原样回送心跳。
    pub async fn answer_ping(&self, ping: &Ping) -> Result<(), TransportError> {
        self.send(Message::Ping(ping.clone())).await
    }

    /// 释放链路资源，不通知对端。重复调用无副作用。
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(data) = &self.data {
            let _ = data.shutdown().await;
        }
        self.control.shutdown().await
    }

    /// 通知对端后关闭：尽力发送 `Stop`，随后与 [`ConnectionPair::close`] 相同。
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        if let Err(err) = self
            .control
            .send(Arc::new(Message::Stop), Timeout::from(PING_WAIT))
            .await
        {
            debug!(peer = self.control.label(), error = %err, "stop frame not delivered");
        }
        self.close().await
    }
}

impl fmt::Debug for ConnectionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPair")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("role", &self.role)
            .field("address", &self.address)
            .field("peer", &self.control.label())
            .field("connection_id", &self.connection_id)
            .field("diff", &self.diff)
            .field("data", &self.data.is_some())
            .finish()
    }
}
