//! 传输层抽象
//!
//! 核心逻辑只依赖这里的两个接口：一次性的协商调用（NewStream）
//! 和客户端发起的双向上行流（SendStream）。QUIC实现见 [`quic`]。

pub mod quic;

use crate::assembler::OutboundFrame;
use crate::framing::FramingError;
use crate::proto::{StreamInfo, StreamValidation};
use std::time::Duration;

pub use quic::{QuicStreamService, QuicUplink};

/// 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("等待响应超时")]
    Timeout,

    #[error("连接已关闭: {0}")]
    Closed(String),

    #[error("握手失败: {0}")]
    Handshake(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("QUIC错误: {0}")]
    Quic(#[from] quiche::Error),

    #[error("分帧错误: {0}")]
    Framing(#[from] FramingError),
}

/// 远端流服务
///
/// 一个实例只服务一次会话：先协商，再消费自身打开上行流。
pub trait StreamService {
    type Uplink: FrameSink + Send + 'static;

    /// 提交流参数并等待协商结果，`timeout` 内无响应返回 [`TransportError::Timeout`]
    fn new_stream(&mut self, info: StreamInfo, timeout: Duration) -> Result<StreamValidation, TransportError>;

    /// 打开上行流
    fn send_stream(self) -> Result<Self::Uplink, TransportError>;
}

/// 上行帧发送端
pub trait FrameSink {
    /// 发送一帧，可能因对端流控而阻塞
    fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// 半关闭：通知对端不再有输入，对端方向保持打开直到其自行关闭
    fn close_send(&mut self) -> Result<(), TransportError>;
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn close_send(&mut self) -> Result<(), TransportError> {
        (**self).close_send()
    }
}
