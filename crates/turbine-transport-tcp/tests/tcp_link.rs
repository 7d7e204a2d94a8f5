//! TCP 回环集成测试：登录握手、二进制帧与差分、数据通道配对、访问控制与错误分类。

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use turbine_transport::{
    AccessControl, AccessRule, Acceptor, Address, ConnectionPair, InProcessTransport, LinkOptions,
    Scheme, Timeout, Transport, TransportError, TransportRegistry,
};
use turbine_transport_tcp::TcpTransport;
use turbine_wire::{Message, PeerUpdate, Routed, ShortcutInfo};

async fn link(
    transport: &TcpTransport,
    listen_at: Address,
    options: LinkOptions,
) -> Result<(ConnectionPair, ConnectionPair, Arc<dyn Acceptor>)> {
    let acceptor: Arc<dyn Acceptor> = Arc::from(transport.listen(&listen_at, &options).await?);
    let target = acceptor.local_address().clone();
    let accepting = {
        let acceptor = Arc::clone(&acceptor);
        tokio::spawn(async move { acceptor.accept().await })
    };
    let dialed = transport.dial(&target, &options).await?;
    let accepted = accepting.await??;
    // 返回监听器本身，让后台接受任务在测试期间保持运行。
    Ok((dialed, accepted, acceptor))
}

fn loopback() -> Result<Address> {
    Ok(Address::parse("tcp://127.0.0.1:0")?)
}

#[tokio::test(flavor = "multi_thread")]
async fn frames_cross_the_socket_in_both_directions() -> Result<()> {
    let transport = TcpTransport::new();
    let (client, server, _acceptor) = link(&transport, loopback()?, LinkOptions::default()).await?;
    assert!(client.diff_enabled());
    assert_eq!(client.connection_id(), server.connection_id());

    client
        .send(Message::Routed(Routed {
            destination: "/server/child".into(),
            payload: Bytes::from_static(b"payload"),
        }))
        .await?;
    let received = server.receive(Timeout::Millis(2_000)).await?.expect("帧应到达");
    assert!(matches!(&*received, Message::Routed(r) if r.payload.as_ref() == b"payload"));

    server.send(Message::Stop).await?;
    let err = client.receive(Timeout::Millis(2_000)).await.unwrap_err();
    assert!(err.is_end_of_stream());

    assert!(client.metrics().snapshot().sent > 0);
    assert!(server.metrics().snapshot().received > 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn differential_frames_reconstruct_over_tcp() -> Result<()> {
    let transport = TcpTransport::new();
    let (client, server, _acceptor) = link(&transport, loopback()?, LinkOptions::default()).await?;

    let mut shortcuts = vec![ShortcutInfo::new("/east", "tcp://east:3333", 1.0)];
    for counter in 1..=4u64 {
        if counter == 3 {
            shortcuts.push(ShortcutInfo::new("/west", "tcp://west:3333", 2.0));
        }
        let update = PeerUpdate {
            address: "tcp://peer:3333".into(),
            name: "/peer".into(),
            counter,
            shortcuts: shortcuts.clone(),
        };
        client.send(Message::PeerUpdate(update.clone())).await?;
        let received = server.receive(Timeout::Millis(2_000)).await?.expect("帧应到达");
        assert_eq!(*received, Message::PeerUpdate(update));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn receive_distinguishes_timeout_from_closure() -> Result<()> {
    let transport = TcpTransport::new();
    let (client, server, _acceptor) = link(&transport, loopback()?, LinkOptions::default()).await?;

    assert!(server.receive(Timeout::Immediate).await?.is_none());
    let started = tokio::time::Instant::now();
    assert!(server.receive(Timeout::Millis(80)).await?.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));

    client.close().await?;
    let outcome = server.receive(Timeout::Millis(2_000)).await;
    assert!(outcome.unwrap_err().is_end_of_stream());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn write_timeout_discards_the_channel() -> Result<()> {
    let transport = TcpTransport::new();
    let (client, _server, _acceptor) = link(&transport, loopback()?, LinkOptions::default()).await?;

    // 接受方从不读取：内核缓冲填满后写入必然超时。
    let mut timed_out = None;
    for round in 0..256u32 {
        let outcome = client
            .send_with(
                Message::Routed(Routed {
                    destination: "/server/child".into(),
                    payload: Bytes::from(vec![round as u8; 1 << 20]),
                }),
                Timeout::Millis(150),
            )
            .await;
        if let Err(err) = outcome {
            timed_out = Some(err);
            break;
        }
    }
    let err = timed_out.expect("缓冲填满后应出现写超时");
    assert!(matches!(err, TransportError::WriteTimeout { .. }), "得到 {err:?}");

    let after = client.send(Message::Ping(Default::default())).await.unwrap_err();
    assert!(matches!(after, TransportError::Closed), "得到 {after:?}");
    let read = client.receive(Timeout::Immediate).await.unwrap_err();
    assert!(matches!(read, TransportError::Closed), "得到 {read:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn data_channel_is_paired_by_connection_id() -> Result<()> {
    let transport = TcpTransport::new();
    let options = LinkOptions::default().with_data_channel(true);
    let (client, server, _acceptor) = link(&transport, loopback()?, options).await?;

    let outbound = client.data().expect("发起方数据通道");
    let inbound = server.data().expect("接受方数据通道");
    outbound.write_all(&[7u8; 4096]).await?;
    let mut buf = vec![0u8; 4096];
    inbound.read_exact(&mut buf).await?;
    assert!(buf.iter().all(|byte| *byte == 7));

    inbound.write_all(b"back").await?;
    let mut echo = [0u8; 4];
    outbound.read_exact(&mut echo).await?;
    assert_eq!(&echo, b"back");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn access_list_rejects_before_login() -> Result<()> {
    let transport = TcpTransport::new();
    let mut access = AccessControl::default();
    access.allow(AccessRule::parse("10.9.*")?);
    let listen_at = loopback()?.with_access(access);

    let acceptor = transport.listen(&listen_at, &LinkOptions::default()).await?;
    let target = acceptor.local_address().clone();
    let accepting = tokio::spawn(async move { acceptor.accept().await });

    let dialed = transport.dial(&target, &LinkOptions::default()).await;
    assert!(
        matches!(dialed, Err(TransportError::Rejected { .. }) | Err(TransportError::EndOfStream { .. })),
        "得到 {dialed:?}"
    );
    assert!(matches!(
        accepting.await?,
        Err(TransportError::AccessDenied { .. })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn hostname_rule_admits_the_resolved_peer() -> Result<()> {
    let loopback_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let host = match dns_lookup::lookup_addr(&loopback_ip) {
        Ok(host) if host.parse::<IpAddr>().is_err() => host,
        // 本机解析器不认识回环地址时无从验证主机名规则。
        _ => return Ok(()),
    };
    // 通配后缀让规则只能匹配主机名，IP 字面量单独无法通过。
    let rule = format!("{host}*");
    let mut access = AccessControl::default();
    access.allow(AccessRule::parse(&rule)?);
    let listen_at = loopback()?.with_access(access);

    let transport = TcpTransport::new();
    let (client, server, _acceptor) = link(&transport, listen_at, LinkOptions::default()).await?;
    client.send(Message::Ping(Default::default())).await?;
    let received = server.receive(Timeout::Millis(2_000)).await?.expect("帧应到达");
    assert!(matches!(&*received, Message::Ping(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_dial_is_unreachable() -> Result<()> {
    let port = {
        let vacant = std::net::TcpListener::bind("127.0.0.1:0")?;
        vacant.local_addr()?.port()
    };
    let target = loopback()?.with_port(port);
    let err = TcpTransport::new()
        .dial(&target, &LinkOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unreachable { .. }), "得到 {err:?}");
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn address_scheme_selects_transport() -> Result<()> {
    let registry = TransportRegistry::new();
    registry.register(Arc::new(TcpTransport::new()));
    registry.register(Arc::new(InProcessTransport::new()));

    let ram = Address::parse("RAM://widgetA")?;
    assert_eq!(registry.resolve(&ram)?.scheme(), Scheme::InProcess);

    let tcp = Address::parse("tcp://host:3333")?;
    assert_eq!(registry.resolve(&tcp)?.scheme(), Scheme::Tcp);

    let err = registry
        .dial("badscheme://x", &LinkOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::UnsupportedScheme { .. }));
    assert!(err.is_addressing());
    Ok(())
}
