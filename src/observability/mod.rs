//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，RUST_LOG 覆盖（如 `RUST_LOG=taskpilot=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或重复初始化时已有全局订阅器，忽略即可
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
