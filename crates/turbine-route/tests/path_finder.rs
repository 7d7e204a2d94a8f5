//! 寻路契约：层级上下行的跳数与代价、断开或禁用即无路、对等体与捷径的择优、广播计数器。

use std::{sync::Arc, time::Duration};

use proptest::prelude::*;
use turbine_route::{RouteError, RouteNode, Topology};
use turbine_wire::{PeerUpdate, ShortcutInfo};

fn chain(root: &str, depth: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(depth);
    let mut current = root.to_owned();
    for level in 1..=depth {
        current = format!("{current}/n{level}");
        names.push(current.clone());
    }
    names
}

fn connect(node: Arc<RouteNode>) -> Arc<RouteNode> {
    node.set_connected(true);
    node
}

/// 本地为 `/r`，其下是一条深度为 `depth` 的连通链。
fn downward(depth: usize) -> (Topology, Vec<Arc<RouteNode>>) {
    let topology = Topology::new("/r", "RAM://r", 1_000.0).expect("拓扑");
    let mut nodes = Vec::new();
    for (level, name) in chain("/r", depth).iter().enumerate() {
        let node = if level == 0 {
            connect(topology.add_child(name, None).expect("子"))
        } else {
            topology.add_remote(name, None).expect("远端")
        };
        nodes.push(node);
    }
    (topology, nodes)
}

proptest! {
    #[test]
    fn descending_paths_cost_one_per_level(depth in 1usize..8, broken in 0usize..8) {
        let (topology, nodes) = downward(depth);
        let target = chain("/r", depth).pop().expect("目标");

        let path = topology.find_path(&target).expect("整条链连通");
        prop_assert_eq!(path.len(), depth);
        prop_assert_eq!(path.cost(), depth as f64);
        prop_assert_eq!(path.first_hop(), Some("/r/n1"));

        let broken = &nodes[broken % depth];
        broken.set_route_enabled(false);
        prop_assert!(topology.find_path(&target).is_none());
        broken.set_route_enabled(true);
        broken.set_connected(false);
        prop_assert!(topology.find_path(&target).is_none());
        broken.set_connected(true);
        prop_assert!(topology.find_path(&target).is_some());
    }

    #[test]
    fn ascending_paths_cost_one_per_level(depth in 1usize..8) {
        // 本地位于 `/s1/…/sD/l`，目标是树根 `/s1`。
        let ancestors: Vec<String> = (1..=depth)
            .scan(String::new(), |prefix, level| {
                prefix.push_str(&format!("/s{level}"));
                Some(prefix.clone())
            })
            .collect();
        let local = format!("{}/l", ancestors[depth - 1]);
        let topology = Topology::new(&local, "RAM://l", 1_000.0).expect("拓扑");
        connect(topology.set_parent(&ancestors[depth - 1], "RAM://p").expect("父"));
        for ancestor in &ancestors[..depth - 1] {
            topology.add_remote(ancestor, None).expect("祖先");
        }

        let path = topology.find_path("/s1").expect("沿父方向可达");
        prop_assert_eq!(path.len(), depth);
        prop_assert_eq!(path.cost(), depth as f64);
        prop_assert_eq!(path.first_hop(), Some(ancestors[depth - 1].as_str()));
    }
}

#[test]
fn sibling_subtrees_are_reached_through_the_common_ancestor() {
    let topology = Topology::new("/r/a/x", "RAM://x", 1_000.0).expect("拓扑");
    connect(topology.set_parent("/r/a", "RAM://a").expect("父"));
    topology.add_remote("/r", None).expect("根");
    topology.add_remote("/r/b", None).expect("叔");
    topology.add_remote("/r/b/y", None).expect("堂");

    let path = topology.find_path("/r/b/y").expect("可达");
    let hops: Vec<&str> = path.hops().iter().map(|hop| &**hop).collect();
    assert_eq!(hops, ["/r/a", "/r", "/r/b", "/r/b/y"]);
    assert_eq!(path.cost(), 4.0);

    let message = path.to_message(topology.local_name());
    assert_eq!(message.servers.first().map(String::as_str), Some("/r/a/x"));
    assert_eq!(message.servers.len(), 5);
    assert_eq!(message.cost, 4);
}

#[test]
fn local_target_has_an_empty_path() {
    let topology = Topology::new("/r", "RAM://r", 1_000.0).expect("拓扑");
    let path = topology.find_path("/r").expect("本地总可达");
    assert!(path.is_empty());
    assert_eq!(path.cost(), 0.0);
    assert!(topology.find_path("not-a-name").is_none());
}

#[test]
fn advertised_shortcut_beats_a_more_expensive_direct_one() {
    let topology = Topology::new("/a/x", "RAM://x", 10.0).expect("拓扑");
    connect(topology.add_shortcut("/b", "RAM://b", 3.0).expect("捷径"));
    connect(topology.add_peer("/c", "RAM://c", 2.0).expect("对等体"));
    let update = PeerUpdate {
        address: "RAM://c".into(),
        name: "/c".into(),
        counter: 1,
        shortcuts: vec![ShortcutInfo::new("/b", "RAM://b", 0.5)],
    };
    assert!(topology.apply_peer_update(&update).expect("广播合法"));

    let path = topology.find_path("/b/deep").expect("经对等体可达");
    assert_eq!(path.first_hop(), Some("/c"));
    assert_eq!(path.len(), 3);
    assert_eq!(path.cost(), 3.5);

    // 广播的捷径失效后，退回直接捷径。
    let mut inactive = ShortcutInfo::new("/b", "RAM://b", 0.5);
    inactive.active = false;
    let update = PeerUpdate {
        counter: 2,
        shortcuts: vec![inactive],
        ..update
    };
    assert!(topology.apply_peer_update(&update).expect("广播合法"));
    let path = topology.find_path("/b/deep").expect("经捷径可达");
    assert_eq!(path.first_hop(), Some("/b"));
    assert_eq!(path.cost(), 4.0);
}

#[test]
fn passive_cost_excludes_lateral_routes() {
    let topology = Topology::new("/a/x", "RAM://x", 10.0).expect("拓扑");
    connect(topology.add_peer("/p", "RAM://p", 10.0).expect("对等体"));
    connect(topology.add_shortcut("/s", "RAM://s", 9.5).expect("捷径"));

    assert!(topology.find_path("/p").is_none());
    assert!(topology.node("/p").is_some());
    assert!(topology.find_path("/s").is_some());
    // 进入子树后的跳数让代价越过阈值。
    assert!(topology.find_path("/s/t").is_none());
}

#[test]
fn equal_cost_candidates_prefer_the_smaller_first_hop() {
    let topology = Topology::new("/a/x", "RAM://x", 100.0).expect("拓扑");
    for peer in ["/p2", "/p1"] {
        connect(topology.add_peer(peer, &format!("RAM:/{peer}"), 1.0).expect("对等体"));
        let update = PeerUpdate {
            address: format!("RAM:/{peer}"),
            name: peer.into(),
            counter: 1,
            shortcuts: vec![ShortcutInfo::new("/t", "RAM://t", 1.0)],
        };
        assert!(topology.apply_peer_update(&update).expect("广播合法"));
    }

    for _ in 0..8 {
        let path = topology.find_path("/t").expect("可达");
        assert_eq!(path.first_hop(), Some("/p1"));
        assert_eq!(path.cost(), 2.0);
    }
}

#[test]
fn peer_updates_only_move_forward() {
    let topology = Topology::new("/a/x", "RAM://x", 100.0).expect("拓扑");
    let update = |counter| PeerUpdate {
        address: "RAM://q".into(),
        name: "/q".into(),
        counter,
        shortcuts: Vec::new(),
    };

    assert!(topology.apply_peer_update(&update(5)).expect("首次"));
    assert!(!topology.apply_peer_update(&update(5)).expect("重复"));
    assert!(!topology.apply_peer_update(&update(4)).expect("过期"));
    assert!(topology.apply_peer_update(&update(6)).expect("更新"));
    assert_eq!(topology.peer_record("/q").map(|record| record.counter), Some(6));

    // 广播登记的对等体在链路建立前不可用。
    assert!(topology.node("/q").is_some_and(|node| !node.is_connected()));
    assert!(topology.find_path("/q").is_none());

    let invalid = PeerUpdate {
        name: "q".into(),
        ..update(7)
    };
    assert!(matches!(
        topology.apply_peer_update(&invalid),
        Err(RouteError::InvalidName { .. })
    ));
}

#[test]
fn next_hop_names_the_unreachable_destination() {
    let topology = Topology::new("/r", "RAM://r", 100.0).expect("拓扑");
    connect(topology.add_child("/r/c", None).expect("子"));

    // 路径存在但首跳没有挂接链路。
    match topology.next_hop("/r/c") {
        Err(RouteError::Unreachable { server }) => assert_eq!(server, "/r/c"),
        other => panic!("期望不可达，得到 {other:?}"),
    }
    match topology.next_hop("/elsewhere/deep") {
        Err(err @ RouteError::Unreachable { .. }) => {
            assert!(err.to_string().contains("/elsewhere/deep"));
            assert!(err.is_addressing());
        }
        other => panic!("期望不可达，得到 {other:?}"),
    }
    assert!(matches!(
        topology.next_hop("/r"),
        Err(RouteError::Topology { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_callers_wake_when_a_route_appears() {
    let topology = Arc::new(Topology::new("/r", "RAM://r", 100.0).expect("拓扑"));
    let waiter = {
        let topology = Arc::clone(&topology);
        tokio::spawn(async move { topology.wait_for_route("/r/late", Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let node = topology.add_child("/r/late", None).expect("子");
    node.set_connected(true);
    topology.notify_route_change();

    let path = waiter.await.expect("任务").expect("路径出现");
    assert_eq!(path.first_hop(), Some("/r/late"));
}

#[tokio::test(start_paused = true)]
async fn waiting_for_a_missing_route_times_out() {
    let topology = Topology::new("/r", "RAM://r", 100.0).expect("拓扑");
    let err = topology
        .wait_for_route("/r/never", Duration::from_secs(3))
        .await
        .expect_err("无路");
    assert!(matches!(err, RouteError::Unreachable { ref server } if server == "/r/never"));
}
