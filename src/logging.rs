use tracing_subscriber::EnvFilter;

/// 初始化 tracing 日志系统（控制台输出）
///
/// 级别由 `RUST_LOG` 控制，未设置时为 `info`。输出到 stderr。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("日志系统初始化完成");
}
