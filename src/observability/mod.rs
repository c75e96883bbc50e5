//! 可观测性：tracing 初始化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局日志订阅器；`RUST_LOG` 可覆盖默认级别。
/// 重复调用（如测试里）静默忽略。
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,courier=debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
