use tracing::{error, info, warn};
use live_streamer::logging::init;

use live_streamer::config::RelayConfig;
use live_streamer::supervisor::{CaptureSupervisor, SupervisorOptions};
use live_streamer::transmit::TransmissionOutcome;
use live_streamer::transport::QuicStreamService;

use std::process::ExitCode;

fn main() -> ExitCode {
    // 日志系统初始化
    init();

    // 参数错误时由 clap 打印用法并退出
    let config = RelayConfig::parse();

    info!("使用 {} 个并行单元", config.max_parallelism);
    info!("服务端: {}", config.server_url);

    let spec = config.encoder.to_process_spec();
    let service = QuicStreamService::new(config.server_url.clone(), config.quic.clone());
    let supervisor = CaptureSupervisor::new(service, SupervisorOptions::from(&config));

    let report = match supervisor.run(&spec, &config.stream) {
        Ok(report) => report,
        Err(e) => {
            error!("运行失败: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "流 {} 结束: {}, 共 {} 帧, {} 字节",
        report.stream_id,
        report.outcome(),
        report.transmit.frames_sent,
        report.transmit.bytes_sent
    );
    if let Some(e) = &report.transmit.close_error {
        warn!("上行流关闭时出错: {e}");
    }

    let clean = matches!(
        report.outcome(),
        TransmissionOutcome::CompletedCleanly | TransmissionOutcome::ProcessExited(_)
    );

    if clean && !report.process_failed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
