//! 分块读取器
//!
//! 包装单个字节源（编码器进程的一路输出），每次读取最多一个缓冲区大小的数据。
//! 缓冲区在多次读取之间复用，读取结果以切片形式借出，调用方需在下一次读取前复制走。

use std::fmt;
use std::io::{self, ErrorKind, Read};
use tracing::{debug, trace};

/// 默认分块大小（每路每次读取）
pub const DEFAULT_CHUNK_SIZE: usize = 64_000;

/// 数据源对应的轨道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Track::Video => f.write_str("video"),
            Track::Audio => f.write_str("audio"),
        }
    }
}

/// 单次读取的结果
#[derive(Debug)]
pub enum ReadStatus<'a> {
    /// 读到的数据，长度为实际读取字节数（不会为空）
    Chunk(&'a [u8]),
    /// 数据源已结束；零长度读取同样归入此类
    EndOfStream,
    /// 底层I/O错误，原样上报
    Failed(io::Error),
}

/// 分块读取器
pub struct ChunkReader<R> {
    track: Track,
    source: R,
    buf: Vec<u8>,
    chunks_read: u64,
    bytes_read: u64,
}

impl<R: Read> ChunkReader<R> {
    /// 创建读取器，`chunk_size` 为单次读取上限（至少1字节）
    pub fn new(track: Track, source: R, chunk_size: usize) -> Self {
        Self {
            track,
            source,
            buf: vec![0u8; chunk_size.max(1)],
            chunks_read: 0,
            bytes_read: 0,
        }
    }

    /// 执行一次有界读取
    ///
    /// 不附加超时，阻塞行为完全取决于数据源本身。
    /// 被信号打断（`Interrupted`）时重新发起读取。
    pub fn read(&mut self) -> ReadStatus<'_> {
        let n = loop {
            match self.source.read(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{} 源读取失败: {}", self.track, e);
                    return ReadStatus::Failed(e);
                }
            }
        };

        if n == 0 {
            debug!(
                "{} 源结束: 共 {} 块, {} 字节",
                self.track, self.chunks_read, self.bytes_read
            );
            return ReadStatus::EndOfStream;
        }

        self.chunks_read += 1;
        self.bytes_read += n as u64;
        trace!("{} 源读取 {} 字节", self.track, n);

        ReadStatus::Chunk(&self.buf[..n])
    }

    /// 缓冲区容量
    pub fn chunk_size(&self) -> usize {
        self.buf.len()
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks_read
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}
