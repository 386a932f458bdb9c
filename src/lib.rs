//! Live Streamer - 音视频采集上行客户端核心库
//!
//! 协商会话后，读取外部编码器进程的两路输出（视频/音频），
//! 按轮配对打上时间戳，经QUIC双向流持续上行。

/// Protobuf 消息定义
pub mod proto;

/// 长度前缀分帧
pub mod framing;

/// 分块读取
pub mod reader;

/// 帧组装
pub mod assembler;

/// 会话协商
pub mod session;

/// 发送循环
pub mod transmit;

/// 外部编码器进程
pub mod encoder;

/// 采集监督
pub mod supervisor;

/// 传输层
pub mod transport;

/// 运行配置
pub mod config;

// 日志系统
pub mod logging;

/// 重新导出常用类型
pub use assembler::{FrameAssembler, OutboundFrame};
pub use config::RelayConfig;
pub use encoder::{EncoderConfig, ProcessSpec};
pub use reader::{ChunkReader, ReadStatus, Track};
pub use session::{SessionClient, SessionHandle, SessionOutcome, StreamParameters};
pub use supervisor::{CaptureError, CaptureReport, CaptureSupervisor, SupervisorOptions};
pub use transmit::{LoopState, TransmissionOutcome, TransmitLoop, TransmitReport};
pub use transport::{FrameSink, StreamService, TransportError};

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
