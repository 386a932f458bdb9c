//! 会话协商
//!
//! 在任何传输开始之前，向远端提交流参数并取得会话ID与接受/拒绝结果。
//! 协商是一次性的，会话期间不会重新协商。

use crate::proto::{Format, Fps, QualityDefinition, Resolution, StreamInfo, StreamValidation, ValidationError};
use crate::transport::{StreamService, TransportError};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 默认协商超时
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(1);

/// 请求的流参数
///
/// 取值必须来自服务端认可的枚举集合；非法组合由服务端在协商时拒绝，本地不做校验。
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParameters {
    /// 由服务端分配，调用方保持为0
    pub stream_id: u32,
    pub video: QualityDefinition,
    pub audio: QualityDefinition,
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            stream_id: 0,
            video: quality(Format::Aac, Resolution::X240p, Fps::X5, 500_000),
            audio: quality(Format::Aac, Resolution::X240p, Fps::X5, 64_000),
        }
    }
}

/// 构造一条轨道的质量定义
pub fn quality(format: Format, resolution: Resolution, fps: Fps, bitrate: u32) -> QualityDefinition {
    QualityDefinition {
        format: format as i32,
        resolution: resolution as i32,
        fps: fps as i32,
        bitrate,
    }
}

impl StreamParameters {
    /// 转换为协商请求
    pub fn to_stream_info(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.stream_id,
            videoquality: Some(self.video.clone()),
            audioquality: Some(self.audio.clone()),
        }
    }
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidQuality,
    StreamAlreadyExists,
    ServerFull,
    Unauthorized,
    /// 不认识的结果码
    Unknown(i32),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidQuality => f.write_str("invalid quality"),
            RejectReason::StreamAlreadyExists => f.write_str("stream already exists"),
            RejectReason::ServerFull => f.write_str("server full"),
            RejectReason::Unauthorized => f.write_str("unauthorized"),
            RejectReason::Unknown(code) => write!(f, "unknown code {code}"),
        }
    }
}

/// 协商结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl From<i32> for SessionOutcome {
    fn from(code: i32) -> Self {
        match ValidationError::try_from(code) {
            Ok(ValidationError::ErrorUndefined) => SessionOutcome::Accepted,
            Ok(ValidationError::InvalidQuality) => SessionOutcome::Rejected(RejectReason::InvalidQuality),
            Ok(ValidationError::StreamAlreadyExists) => {
                SessionOutcome::Rejected(RejectReason::StreamAlreadyExists)
            }
            Ok(ValidationError::ServerFull) => SessionOutcome::Rejected(RejectReason::ServerFull),
            Ok(ValidationError::Unauthorized) => SessionOutcome::Rejected(RejectReason::Unauthorized),
            Err(_) => SessionOutcome::Rejected(RejectReason::Unknown(code)),
        }
    }
}

/// 协商得到的会话句柄，创建后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    stream_id: u32,
    outcome: SessionOutcome,
}

impl SessionHandle {
    pub fn new(stream_id: u32, outcome: SessionOutcome) -> Self {
        Self { stream_id, outcome }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn outcome(&self) -> SessionOutcome {
        self.outcome
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == SessionOutcome::Accepted
    }

    /// 把拒绝结果转换为错误
    pub fn accepted(self) -> Result<Self, SessionError> {
        match self.outcome {
            SessionOutcome::Accepted => Ok(self),
            SessionOutcome::Rejected(reason) => Err(SessionError::Rejected {
                stream_id: self.stream_id,
                reason,
            }),
        }
    }
}

impl From<StreamValidation> for SessionHandle {
    fn from(validation: StreamValidation) -> Self {
        Self::new(validation.stream_id, SessionOutcome::from(validation.error))
    }
}

/// 会话错误
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("协商超时 ({0:?})")]
    NegotiationTimeout(Duration),

    #[error("协商传输失败: {0}")]
    NegotiationTransport(TransportError),

    #[error("会话 {stream_id} 被拒绝: {reason}")]
    Rejected { stream_id: u32, reason: RejectReason },
}

/// 会话客户端
pub struct SessionClient<S> {
    service: S,
    timeout: Duration,
}

impl<S: StreamService> SessionClient<S> {
    pub fn new(service: S, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 协商会话
    ///
    /// 拒绝是一次成功的调用，结果体现在返回句柄的 `outcome` 中，调用方必须检查。
    pub fn negotiate(&mut self, params: &StreamParameters) -> Result<SessionHandle, SessionError> {
        debug!("提交流参数: {:?}", params);

        let validation = self
            .service
            .new_stream(params.to_stream_info(), self.timeout)
            .map_err(|e| match e {
                TransportError::Timeout => SessionError::NegotiationTimeout(self.timeout),
                other => SessionError::NegotiationTransport(other),
            })?;

        let handle = SessionHandle::from(validation);
        match handle.outcome() {
            SessionOutcome::Accepted => info!("会话已接受, 流ID: {}", handle.stream_id()),
            SessionOutcome::Rejected(reason) => {
                warn!("会话被拒绝, 流ID: {}, 原因: {}", handle.stream_id(), reason)
            }
        }

        Ok(handle)
    }

    /// 交还底层服务，用于打开上行流
    pub fn into_service(self) -> S {
        self.service
    }
}
