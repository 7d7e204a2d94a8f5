//! 日志初始化：`fmt` 输出层加 `EnvFilter` 过滤。

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

use crate::config::LoggingConfig;

/// 安装全局日志订阅者。
///
/// # 教案式说明
/// - **意图（Why）**：宿主进程启动时调用一次即可获得结构化日志，库代码只负责产生事件；
/// - **逻辑（How）**：以配置中的过滤指令构建 [`EnvFilter`]，为空或无法解析时回落到 `RUST_LOG`，
///   再回落到 `info`；随后组装 `registry + filter + fmt` 并设为全局默认；
/// - **契约（What）**：返回 `true` 表示本次调用完成了安装；已有全局订阅者（包括重复调用）时返回 `false`
///   且不做任何修改。
pub fn init_tracing(config: &LoggingConfig) -> bool {
    if dispatcher::has_been_set() {
        return false;
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(&config.filter))
        .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi));
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

fn build_env_filter(directives: &str) -> EnvFilter {
    if !directives.trim().is_empty() {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
