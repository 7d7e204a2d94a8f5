use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info};
use turbine_transport::{
    Acceptor, Address, ConnectionPair, DataChannel, LinkOptions, Scheme, Transport,
    TransportError,
};
use turbine_wire::{FrameEncoder, Message};

use crate::{
    channel::{TcpControlChannel, TcpSocketConfig},
    error::{CONNECT, PAIR, map_io_error},
    listener::{DATA_ACK, TcpAcceptor},
};

/// 套接字传输：`tcp://host:port`，以及不带协议前缀的地址。
///
/// # 教案式注释
/// - **意图 (Why)**：把“建连 → 登录握手 → 可选的数据通道配对”封装为一次 `dial`；
/// - **契约 (What)**：建连受 `handshake_timeout` 约束；数据通道由发起方另开一条连接，
///   发送 `DLC` 身份帧并等待接受方的确认字节后才视为可用；
/// - **风险 (Trade-offs)**：数据通道配对失败会关闭整条连接对，而不是退化为只有控制通道。
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    config: TcpSocketConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }

    async fn connect(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<TcpStream, TransportError> {
        let target = address.socket_target();
        match tokio::time::timeout(options.handshake_timeout, TcpStream::connect(&target)).await {
            Ok(stream) => stream.map_err(|err| map_io_error(CONNECT, &target, err)),
            Err(_) => Err(TransportError::HandshakeTimeout { operation: "connect" }),
        }
    }

    async fn open_data(
        &self,
        address: &Address,
        connection_id: u64,
        options: &LinkOptions,
    ) -> Result<TcpStream, TransportError> {
        let mut stream = self.connect(address, options).await?;
        self.config
            .apply(&stream)
            .map_err(|err| map_io_error(PAIR, &address.socket_target(), err))?;

        let mut frame = BytesMut::new();
        FrameEncoder::new(&options.wire)
            .encode(&Arc::new(Message::DataChannelOpen { connection_id }), &mut frame)?;
        let label = address.socket_target();
        let handshake = async {
            stream.write_all(&frame).await?;
            let mut ack = [0u8; 1];
            stream.read_exact(&mut ack).await?;
            Ok::<u8, std::io::Error>(ack[0])
        };
        let ack = tokio::time::timeout(options.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::HandshakeTimeout {
                operation: "data channel pairing",
            })?
            .map_err(|err| map_io_error(PAIR, &label, err))?;
        if ack != DATA_ACK {
            return Err(TransportError::Protocol(format!(
                "unexpected data channel acknowledgement {ack}"
            )));
        }
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Tcp
    }

    async fn dial(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<ConnectionPair, TransportError> {
        let stream = self.connect(address, options).await?;
        let control = TcpControlChannel::new(stream, &options.wire, &self.config)?;
        let mut pair = ConnectionPair::initiate(Box::new(control), address, options).await?;
        if pair.data_requested() {
            match self.open_data(address, pair.connection_id(), options).await {
                Ok(data) => pair.attach_data(DataChannel::new(Box::new(data))),
                Err(err) => {
                    let _ = pair.close().await;
                    return Err(err);
                }
            }
        }
        debug!(address = %address, connection_id = pair.connection_id(), "tcp link established");
        Ok(pair)
    }

    async fn listen(
        &self,
        address: &Address,
        options: &LinkOptions,
    ) -> Result<Box<dyn Acceptor>, TransportError> {
        let acceptor = TcpAcceptor::bind(address, options, self.config.clone()).await?;
        info!(listener = %acceptor.local_address(), "tcp transport listening");
        Ok(Box::new(acceptor))
    }
}
