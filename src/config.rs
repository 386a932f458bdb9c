//! 运行配置
//!
//! 服务端地址是唯一的位置参数，其余选项有默认值，可用命令行或 `STREAMER_*` 环境变量覆盖。

use crate::encoder::{EncoderConfig, DEFAULT_INPUT};
use crate::session::StreamParameters;
use clap::Parser;
use std::num::NonZeroUsize;
use std::time::Duration;
use url::Url;

/// 命令行选项
#[derive(Parser, Debug, Clone)]
#[command(name = "streamer", version, about = "采集本地音视频并经QUIC上行到服务端")]
pub struct RelayOptions {
    /// 服务端地址，如 https://127.0.0.1:4433/
    pub server_url: Url,

    /// 协商超时（毫秒）
    #[arg(long, env = "STREAMER_NEGOTIATION_TIMEOUT_MS", default_value_t = 1000)]
    pub negotiation_timeout_ms: u64,

    /// 并行度上限，默认为可用执行单元的一半
    #[arg(long, env = "STREAMER_MAX_PARALLELISM")]
    pub max_parallelism: Option<NonZeroUsize>,

    /// 每路每次读取的字节数
    #[arg(long, env = "STREAMER_CHUNK_SIZE", default_value = "64000")]
    pub chunk_size: NonZeroUsize,

    /// 发送结束后等待编码器自行退出的时间（毫秒）
    #[arg(long, env = "STREAMER_EXIT_GRACE_MS", default_value_t = 2000)]
    pub exit_grace_ms: u64,

    /// 校验服务端证书
    #[arg(long, env = "STREAMER_VERIFY_PEER")]
    pub verify_peer: bool,

    /// 编码器程序
    #[arg(long, env = "STREAMER_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// 编码器输入格式
    #[arg(long, env = "STREAMER_INPUT_FORMAT", default_value = "dshow")]
    pub input_format: String,

    /// 编码器输入设备
    #[arg(long, env = "STREAMER_INPUT", default_value = DEFAULT_INPUT)]
    pub input: String,
}

/// QUIC 连接参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicSettings {
    /// *CAUTION*: 生产环境不应关闭证书校验
    pub verify_peer: bool,
    pub max_idle_timeout_ms: u64,
    pub max_datagram_size: usize,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    /// 半关闭后等待对端结束其方向的时间
    pub linger: Duration,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            verify_peer: false,
            max_idle_timeout_ms: 5000,
            max_datagram_size: 1350,
            initial_max_data: 10_000_000,
            initial_max_stream_data: 1_000_000,
            linger: Duration::from_secs(2),
        }
    }
}

/// 进程级配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server_url: Url,
    pub negotiation_timeout: Duration,
    /// 每路每次读取的字节数
    pub chunk_size: usize,
    /// 中继自身的并行度上限
    pub max_parallelism: usize,
    /// 发送循环先结束时，等待编码器自行退出的时间
    pub exit_grace: Duration,
    pub stream: StreamParameters,
    pub encoder: EncoderConfig,
    pub quic: QuicSettings,
}

/// 默认并行度：可用执行单元的一半，至少为1
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

impl RelayConfig {
    /// 解析进程参数和环境变量，出错时由 clap 打印用法并退出
    pub fn parse() -> Self {
        RelayOptions::parse().into()
    }
}

impl From<RelayOptions> for RelayConfig {
    fn from(options: RelayOptions) -> Self {
        Self {
            server_url: options.server_url,
            negotiation_timeout: Duration::from_millis(options.negotiation_timeout_ms),
            chunk_size: options.chunk_size.get(),
            max_parallelism: options
                .max_parallelism
                .map_or_else(default_parallelism, NonZeroUsize::get),
            exit_grace: Duration::from_millis(options.exit_grace_ms),
            stream: StreamParameters::default(),
            encoder: EncoderConfig {
                program: options.ffmpeg,
                input_format: options.input_format,
                input: options.input,
                ..EncoderConfig::default()
            },
            quic: QuicSettings {
                verify_peer: options.verify_peer,
                ..QuicSettings::default()
            },
        }
    }
}
