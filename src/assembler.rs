//! 帧组装
//!
//! 把同一轮读取到的视频块和音频块配对，连同采集时间戳组成一个上行帧。

use crate::proto::StreamData;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 毫秒时钟
pub trait Clock: Send {
    /// 当前时间（毫秒），同一时钟返回值不递减
    fn now_ms(&mut self) -> u64;
}

/// 以墙钟为起点、按单调时钟推进的时钟
///
/// 时间戳与Unix时间对齐，但系统时间回拨不会让时间戳倒退。
pub struct WallClock {
    origin_ms: u64,
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now_ms(&mut self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// 待发送的上行帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// 采集时间戳（毫秒），每轮读取前采样一次
    pub captured_at_ms: u64,
    pub session_id: u32,
    pub video: Vec<u8>,
    pub audio: Vec<u8>,
}

impl OutboundFrame {
    /// 音视频负载总字节数
    pub fn payload_len(&self) -> usize {
        self.video.len() + self.audio.len()
    }
}

impl From<OutboundFrame> for StreamData {
    fn from(frame: OutboundFrame) -> Self {
        StreamData {
            ts: frame.captured_at_ms,
            stream_id: frame.session_id,
            video: frame.video,
            audio: frame.audio,
        }
    }
}

/// 帧组装器，绑定到一个会话
#[derive(Debug, Clone, Copy)]
pub struct FrameAssembler {
    session_id: u32,
}

impl FrameAssembler {
    pub fn new(session_id: u32) -> Self {
        Self { session_id }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// 组装一帧
    ///
    /// `video` 和 `audio` 是本轮实际读到的字节（已截断到读取长度），
    /// 按值复制进帧，之后读取缓冲区可以立即复用。
    pub fn assemble(&self, captured_at_ms: u64, video: &[u8], audio: &[u8]) -> OutboundFrame {
        OutboundFrame {
            captured_at_ms,
            session_id: self.session_id,
            video: video.to_vec(),
            audio: audio.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_copies_exact_bytes() {
        let assembler = FrameAssembler::new(1234);
        let mut video_buf = vec![0u8; 64];
        let mut audio_buf = vec![0u8; 64];
        video_buf[..3].copy_from_slice(b"vid");
        audio_buf[..2].copy_from_slice(b"au");

        let frame = assembler.assemble(99, &video_buf[..3], &audio_buf[..2]);

        // 复用缓冲区不影响已组装的帧
        video_buf.fill(0xff);
        audio_buf.fill(0xff);

        assert_eq!(frame.video, b"vid");
        assert_eq!(frame.audio, b"au");
        assert_eq!(frame.captured_at_ms, 99);
        assert_eq!(frame.session_id, 1234);
        assert_eq!(frame.payload_len(), 5);
    }

    #[test]
    fn test_frame_into_stream_data() {
        let frame = FrameAssembler::new(5).assemble(10, b"v", b"a");
        let data = StreamData::from(frame);

        assert_eq!(data.ts, 10);
        assert_eq!(data.stream_id, 5);
        assert_eq!(data.video, b"v");
        assert_eq!(data.audio, b"a");
    }

    #[test]
    fn test_wall_clock_is_non_decreasing() {
        let mut clock = WallClock::new();
        let mut last = clock.now_ms();
        assert!(last > 1_600_000_000_000);

        for _ in 0..1000 {
            let now = clock.now_ms();
            assert!(now >= last);
            last = now;
        }
    }
}
