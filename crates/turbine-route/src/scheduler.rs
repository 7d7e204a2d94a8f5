//! # scheduler 模块说明
//!
//! ## 角色定位（Why）
//! - 周期性重试只需要“每隔 N 毫秒调用一次回调”这一个能力，抽象为 [`Scheduler`] 以便测试注入可控实现；
//! - 取消以“丢弃句柄”表达：[`TaskHandle`] 析构即停止后续触发，不存在多处修改共享定时器内部状态的写法。
//!
//! ## 契约（What）
//! - `schedule_every` 立即返回句柄，第一次触发发生在调度之后尽快执行（不等待一个周期）；
//! - 句柄析构后不会再有新的触发；已经开始执行的回调不受影响，
//!   因此回调自身必须在状态锁内核对句柄是否仍然有效。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{runtime::Handle, time::MissedTickBehavior};

/// 周期回调。
pub type Task = Arc<dyn Fn() + Send + Sync>;

/// 定时器协作方。
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// 以固定周期反复调用 `task`，直到返回的句柄被丢弃。
    fn schedule_every(&self, period: Duration, task: Task) -> TaskHandle;
}

/// 周期任务的独占句柄；析构即取消。
pub struct TaskHandle {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskHandle {
    pub fn new(id: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 显式取消，等价于丢弃句柄。
    pub fn cancel(self) {}
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

/// 基于 tokio 的调度实现：每个周期任务是一个独立的后台任务，句柄析构时中止它。
#[derive(Debug)]
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_every(&self, period: Duration, task: Task) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let join = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // 回调耗时超过周期时不补发积压的触发。
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
            }
        });
        TaskHandle::new(id, move || join.abort())
    }
}
