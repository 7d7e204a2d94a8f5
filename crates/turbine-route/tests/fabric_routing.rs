//! 进程内两级装配：子服务器注册到父服务器，载荷双向路由，子服务器退出后从路由表消失；
//! 反向路由的子服务器经角色反转后同样双向可达。

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::runtime::Handle;
use turbine_route::{
    Fabric, FabricConfig, NodeKind, ReconnectOutcome, RoleKind, RouteError, Scheduler,
    TokioScheduler,
};
use turbine_transport::{InProcessTransport, TransportRegistry};

const PARENT: &str = r#"
server_name = "/r"
address = "RAM://r"
"#;

const CHILD: &str = r#"
server_name = "/r/c"
address = "RAM://c"
reconnect_interval_ms = 200
ping_timeout_ms = 2000

[parent]
name = "/r"
address = "RAM://r"
"#;

const REVERSED_CHILD: &str = r#"
server_name = "/r/c"
address = "RAM://c"
reconnect_interval_ms = 200
ping_timeout_ms = 2000
reverse_route = true

[parent]
name = "/r"
address = "RAM://r"
"#;

#[tokio::test(flavor = "multi_thread")]
async fn child_and_parent_route_to_each_other() -> Result<()> {
    // 进程内监听表属于传输实例，两台服务器必须共用同一注册表。
    let registry = Arc::new(TransportRegistry::new());
    registry.register(Arc::new(InProcessTransport::new()));
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(Handle::current()));

    let (parent, mut parent_inbox) = Fabric::start(
        &FabricConfig::from_toml_str(PARENT)?,
        Arc::clone(&registry),
        Arc::clone(&scheduler),
    )
    .await?;
    let (child, mut child_inbox) = Fabric::start(
        &FabricConfig::from_toml_str(CHILD)?,
        Arc::clone(&registry),
        Arc::clone(&scheduler),
    )
    .await?;
    assert!(
        child.initial_outcome().is_some_and(|outcome| outcome.is_connected()),
        "得到 {:?}",
        child.initial_outcome()
    );

    let up = child.find_path("/r", Duration::from_secs(2)).await?;
    assert_eq!(up.first_hop(), Some("/r"));
    let down = parent.find_path("/r/c", Duration::from_secs(2)).await?;
    assert_eq!(down.len(), 1);
    let registered = parent.topology().node("/r/c").context("子服务器已登记")?;
    assert_eq!(registered.kind(), NodeKind::Child);

    child.route("/r", Bytes::from_static(b"up")).await?;
    let delivered = tokio::time::timeout(Duration::from_secs(2), parent_inbox.recv())
        .await?
        .context("父服务器投递队列")?;
    assert_eq!(delivered.destination, "/r");
    assert_eq!(delivered.payload.as_ref(), b"up");

    parent.route("/r/c", Bytes::from_static(b"down")).await?;
    let delivered = tokio::time::timeout(Duration::from_secs(2), child_inbox.recv())
        .await?
        .context("子服务器投递队列")?;
    assert_eq!(delivered.payload.as_ref(), b"down");

    match parent.route("/r/missing", Bytes::new()).await {
        Err(RouteError::Unreachable { server }) => assert_eq!(server, "/r/missing"),
        other => panic!("期望不可达，得到 {other:?}"),
    }

    child.shutdown().await;
    let mut gone = false;
    for _ in 0..200 {
        if parent.topology().node("/r/c").is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone, "子服务器退出后应从路由表移除");
    assert!(parent.topology().find_path("/r/c").is_none());

    parent.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reversed_child_routes_through_the_swapped_link() -> Result<()> {
    let registry = Arc::new(TransportRegistry::new());
    registry.register(Arc::new(InProcessTransport::new()));
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(Handle::current()));

    let (parent, mut parent_inbox) = Fabric::start(
        &FabricConfig::from_toml_str(PARENT)?,
        Arc::clone(&registry),
        Arc::clone(&scheduler),
    )
    .await?;
    let (child, mut child_inbox) = Fabric::start(
        &FabricConfig::from_toml_str(REVERSED_CHILD)?,
        Arc::clone(&registry),
        Arc::clone(&scheduler),
    )
    .await?;
    assert!(
        matches!(child.initial_outcome(), Some(ReconnectOutcome::Reconnected)),
        "得到 {:?}",
        child.initial_outcome()
    );

    // 子服务器一侧把自己拨出的链路当作路由角色，父服务器一侧当作监听角色。
    let upward = child.topology().node("/r").context("父节点")?;
    assert_eq!(upward.role_kind(), Some(RoleKind::Router));
    let downward = parent.topology().node("/r/c").context("子服务器已登记")?;
    assert_eq!(downward.kind(), NodeKind::Child);
    assert_eq!(downward.role_kind(), Some(RoleKind::Listener));

    child.route("/r", Bytes::from_static(b"up")).await?;
    let delivered = tokio::time::timeout(Duration::from_secs(2), parent_inbox.recv())
        .await?
        .context("父服务器投递队列")?;
    assert_eq!(delivered.payload.as_ref(), b"up");

    parent.route("/r/c", Bytes::from_static(b"down")).await?;
    let delivered = tokio::time::timeout(Duration::from_secs(2), child_inbox.recv())
        .await?
        .context("子服务器投递队列")?;
    assert_eq!(delivered.destination, "/r/c");
    assert_eq!(delivered.payload.as_ref(), b"down");

    child.shutdown().await;
    parent.shutdown().await;
    Ok(())
}
