//! 采集监督
//!
//! 负责一次完整运行: 协商会话 → 打开上行流 → 启动编码器 → 在独立线程上运行发送循环，
//! 同时等待编码器退出。两者中先结束的一方决定结果，另一方随后也会被等待，
//! `run` 返回时不会留下编码器进程或发送线程。

use crate::config::RelayConfig;
use crate::encoder::{EncoderProcess, ProcessSpec};
use crate::reader::{ChunkReader, Track, DEFAULT_CHUNK_SIZE};
use crate::session::{SessionClient, SessionError, StreamParameters, DEFAULT_NEGOTIATION_TIMEOUT};
use crate::transmit::{TransmissionOutcome, TransmitLoop, TransmitReport};
use crate::transport::{StreamService, TransportError};
use std::io;
use std::process::ExitStatus;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 监督错误（运行前的准备失败）
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("打开上行流失败: {0}")]
    Transport(#[from] TransportError),

    #[error("启动编码器失败: {0}")]
    Spawn(#[source] io::Error),

    #[error("编码器缺少 {0} 管道")]
    MissingChannel(&'static str),

    #[error("创建发送线程失败: {0}")]
    Thread(#[source] io::Error),

    /// 发送循环已回收，其报告随错误返回
    #[error("等待编码器失败: {source}")]
    Wait {
        #[source]
        source: io::Error,
        transmit: Box<TransmitReport>,
    },

    /// 编码器已回收时带上其退出状态
    #[error("发送线程异常退出")]
    TransmitPanicked { exit_status: Option<ExitStatus> },
}

/// 监督参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub negotiation_timeout: Duration,
    pub chunk_size: usize,
    /// 发送循环先结束后，编码器自行退出的宽限时间，超时即终止
    pub exit_grace: Duration,
    /// 检查编码器状态的间隔
    pub poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exit_grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl From<&RelayConfig> for SupervisorOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            negotiation_timeout: config.negotiation_timeout,
            chunk_size: config.chunk_size,
            exit_grace: config.exit_grace,
            ..Self::default()
        }
    }
}

/// 一次运行的结果
#[derive(Debug)]
pub struct CaptureReport {
    /// 服务端分配的流ID
    pub stream_id: u32,
    pub transmit: TransmitReport,
    pub exit_status: ExitStatus,
    process_exit: Option<TransmissionOutcome>,
}

impl CaptureReport {
    /// 先被观察到的终止结果
    pub fn outcome(&self) -> &TransmissionOutcome {
        self.process_exit.as_ref().unwrap_or(&self.transmit.outcome)
    }

    /// 编码器是否以失败状态退出
    pub fn process_failed(&self) -> bool {
        !self.exit_status.success()
    }
}

/// 先结束的一方
enum First {
    Transmit,
    Process(ExitStatus),
    WaitFailed(io::Error),
}

/// 采集监督器
pub struct CaptureSupervisor<S> {
    service: S,
    options: SupervisorOptions,
}

impl<S: StreamService> CaptureSupervisor<S> {
    pub fn new(service: S, options: SupervisorOptions) -> Self {
        Self { service, options }
    }

    /// 执行一次完整运行
    ///
    /// 协商失败或被拒绝时在启动编码器之前返回错误，不会发送任何帧。
    pub fn run(self, spec: &ProcessSpec, params: &StreamParameters) -> Result<CaptureReport, CaptureError> {
        let options = self.options;

        let mut client = SessionClient::new(self.service, options.negotiation_timeout);
        let handle = client.negotiate(params)?.accepted()?;
        let uplink = client.into_service().send_stream()?;

        let mut process = spec.spawn().map_err(CaptureError::Spawn)?;
        let video = process
            .take_primary_channel()
            .ok_or(CaptureError::MissingChannel("stdout"))?;
        let audio = process
            .take_secondary_channel()
            .ok_or(CaptureError::MissingChannel("stderr"))?;

        let transmit = TransmitLoop::new(
            &handle,
            uplink,
            ChunkReader::new(Track::Video, video, options.chunk_size),
            ChunkReader::new(Track::Audio, audio, options.chunk_size),
        )?;

        let (done_tx, done_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("transmit".to_string())
            .spawn(move || {
                let report = transmit.run();
                let _ = done_tx.send(());
                report
            })
            .map_err(CaptureError::Thread)?;

        let first = wait_first(&mut process, &done_rx, options.poll_interval);

        let exit = match first {
            First::Transmit => {
                debug!("发送循环先结束, 等待编码器退出");
                reap(&mut process, options.exit_grace, options.poll_interval).map(|status| (status, false))
            }
            First::Process(status) => {
                info!("编码器先退出: {}", status);
                Ok((status, true))
            }
            First::WaitFailed(e) => {
                error!("等待编码器失败: {}", e);
                if let Err(kill_error) = process.kill() {
                    warn!("终止编码器失败: {}", kill_error);
                }
                Err(e)
            }
        };

        // 发送线程总是被回收
        let (transmit, exit_status, process_first) = settle(worker.join(), exit)?;

        if exit_status.success() {
            info!("编码器进程结束: {}", exit_status);
        } else {
            warn!("编码器进程异常结束: {}", exit_status);
        }

        Ok(CaptureReport {
            stream_id: handle.stream_id(),
            transmit,
            exit_status,
            process_exit: process_first.then_some(TransmissionOutcome::ProcessExited(exit_status)),
        })
    }
}

/// 合并两方的结果，任一方失败时另一方已收集到的结果随错误返回
fn settle(
    joined: thread::Result<TransmitReport>,
    exit: io::Result<(ExitStatus, bool)>,
) -> Result<(TransmitReport, ExitStatus, bool), CaptureError> {
    match (joined, exit) {
        (Ok(transmit), Ok((status, process_first))) => Ok((transmit, status, process_first)),
        (Ok(transmit), Err(source)) => Err(CaptureError::Wait {
            source,
            transmit: Box::new(transmit),
        }),
        (Err(_), exit) => {
            let exit_status = exit.ok().map(|(status, _)| status);
            error!("发送线程异常退出, 编码器状态: {:?}", exit_status);
            Err(CaptureError::TransmitPanicked { exit_status })
        }
    }
}

/// 等待发送循环结束或编码器退出，先到者胜出
fn wait_first(process: &mut EncoderProcess, done: &mpsc::Receiver<()>, interval: Duration) -> First {
    loop {
        match done.recv_timeout(interval) {
            // 断开意味着发送线程已经结束（包括异常）
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return First::Transmit,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match process.try_wait() {
            Ok(Some(status)) => return First::Process(status),
            Ok(None) => {}
            Err(e) => return First::WaitFailed(e),
        }
    }
}

/// 在宽限期内等待编码器退出，超时则终止
fn reap(process: &mut EncoderProcess, grace: Duration, interval: Duration) -> io::Result<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = process.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            warn!("编码器在 {:?} 内未退出", grace);
            return process.kill();
        }
        thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmit::{LoopState, TransmissionOutcome};
    use crate::transport::TransportError;

    fn failed_report() -> TransmitReport {
        TransmitReport {
            outcome: TransmissionOutcome::SendFailed(TransportError::Closed("reset".into())),
            state: LoopState::Failed,
            frames_sent: 7,
            bytes_sent: 700,
            close_error: None,
        }
    }

    #[cfg(unix)]
    fn status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    #[test]
    fn test_settle_keeps_both_results() {
        let (transmit, exit_status, process_first) = settle(Ok(failed_report()), Ok((status(3), true))).unwrap();

        assert_eq!(transmit.frames_sent, 7);
        assert_eq!(exit_status.code(), Some(3));
        assert!(process_first);
    }

    #[test]
    fn test_wait_failure_keeps_transmit_report() {
        let err = settle(Ok(failed_report()), Err(io::Error::other("wait failed"))).unwrap_err();

        match err {
            CaptureError::Wait { source, transmit } => {
                assert_eq!(source.to_string(), "wait failed");
                assert_eq!(transmit.frames_sent, 7);
                assert_eq!(transmit.bytes_sent, 700);
                assert!(matches!(transmit.outcome, TransmissionOutcome::SendFailed(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_panicked_worker_keeps_exit_status() {
        let err = settle(Err(Box::new("boom")), Ok((status(3), false))).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::TransmitPanicked { exit_status: Some(s) } if s.code() == Some(3)
        ));

        let err = settle(Err(Box::new("boom")), Err(io::Error::other("wait failed"))).unwrap_err();
        assert!(matches!(err, CaptureError::TransmitPanicked { exit_status: None }));
    }
}
