use parking_lot::Mutex;
use turbine_transport::{ByteCounts, PairMetrics};

/// 路由节点的流量账本：当前角色的实时计数 + 已失效连接的累计值。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 链路会断开、重连、反转角色，但节点的总流量必须连续：旧连接的字节在移除时并入 `dead`；
/// - 计数使用独立的窄锁，指标查询不与路由状态切换争用同一把锁。
///
/// ## 契约 (What)
/// - [`RouteMetrics::swap`] 在一次加锁内完成“旧实时计数并入 `dead` + 挂接新计数”，
///   并发的 [`RouteMetrics::total`] 只能看到切换前或切换后的完整状态；
/// - 失败的连接尝试通过 [`RouteMetrics::fold`] 计入 `dead`，不会丢账。
///
/// ## 风险 (Trade-offs)
/// - 同一条连接的计数若被重复并入会重复计账；调用方以连接编号判重（见角色交换）。
#[derive(Debug, Default)]
pub struct RouteMetrics {
    inner: Mutex<Ledger>,
}

#[derive(Debug, Default)]
struct Ledger {
    live: Option<PairMetrics>,
    dead: ByteCounts,
}

impl RouteMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 挂接新的实时计数；原有实时计数并入 `dead`。
    pub fn swap(&self, live: PairMetrics) {
        let mut ledger = self.inner.lock();
        if let Some(previous) = ledger.live.replace(live) {
            ledger.dead += previous.snapshot();
        }
    }

    /// 摘除实时计数并入 `dead`。
    pub fn detach(&self) {
        let mut ledger = self.inner.lock();
        if let Some(previous) = ledger.live.take() {
            ledger.dead += previous.snapshot();
        }
    }

    /// 把一条从未挂接（或已摘除）的连接的流量计入 `dead`。
    pub fn fold(&self, counts: ByteCounts) {
        self.inner.lock().dead += counts;
    }

    pub fn dead(&self) -> ByteCounts {
        self.inner.lock().dead
    }

    pub fn total(&self) -> ByteCounts {
        let ledger = self.inner.lock();
        match &ledger.live {
            Some(live) => ledger.dead + live.snapshot(),
            None => ledger.dead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folded_attempts_are_kept() {
        let metrics = RouteMetrics::new();
        metrics.fold(ByteCounts {
            sent: 10,
            received: 4,
        });
        metrics.fold(ByteCounts {
            sent: 1,
            received: 0,
        });
        assert_eq!(
            metrics.total(),
            ByteCounts {
                sent: 11,
                received: 4
            }
        );
        assert_eq!(metrics.dead(), metrics.total());
    }
}
