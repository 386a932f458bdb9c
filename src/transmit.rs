//! 发送循环
//!
//! 状态机: `Idle → Sending → (Draining → Closed | Failed)`
//!
//! 每轮依次: 采样时间戳 → 读视频块 → 读音频块 → 组装并发送。
//! 两路必须在同一轮都读到数据才会产生一帧；任一路结束进入 `Draining`，
//! 任一路读取失败或发送失败进入 `Failed`。发送不重试。
//! 一个实例只服务一个会话，终止后不会回到 `Idle`。

use crate::assembler::{Clock, FrameAssembler, OutboundFrame, WallClock};
use crate::reader::{ChunkReader, ReadStatus, Track};
use crate::session::{SessionError, SessionHandle};
use crate::transport::{FrameSink, TransportError};
use std::fmt;
use std::io::{self, Read};
use std::process::ExitStatus;
use tracing::{debug, error, info, trace, warn};

/// 循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Sending,
    Draining,
    Failed,
    Closed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Failed | LoopState::Closed)
    }
}

/// 一个会话的终止结果，恰好一个
#[derive(Debug)]
pub enum TransmissionOutcome {
    /// 某一路数据源正常结束
    CompletedCleanly,
    SourceReadFailed { track: Track, error: io::Error },
    SendFailed(TransportError),
    /// 编码器进程先于发送循环退出
    ProcessExited(ExitStatus),
}

impl TransmissionOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, TransmissionOutcome::CompletedCleanly)
    }
}

impl fmt::Display for TransmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmissionOutcome::CompletedCleanly => f.write_str("completed cleanly"),
            TransmissionOutcome::SourceReadFailed { track, error } => {
                write!(f, "{track} source read failed: {error}")
            }
            TransmissionOutcome::SendFailed(e) => write!(f, "send failed: {e}"),
            TransmissionOutcome::ProcessExited(status) => write!(f, "process exited: {status}"),
        }
    }
}

/// 发送循环的结束报告
#[derive(Debug)]
pub struct TransmitReport {
    pub outcome: TransmissionOutcome,
    /// 终止状态（`Closed` 或 `Failed`）
    pub state: LoopState,
    pub frames_sent: u64,
    /// 已发送的音视频负载字节数
    pub bytes_sent: u64,
    /// 半关闭失败的原因，不影响 `outcome`
    pub close_error: Option<TransportError>,
}

/// 单轮读取的结果
enum Cycle {
    Frame(OutboundFrame),
    EndOfStream(Track),
    ReadFailed(Track, io::Error),
}

/// 发送循环
pub struct TransmitLoop<S, V, A> {
    state: LoopState,
    assembler: FrameAssembler,
    sink: S,
    video: ChunkReader<V>,
    audio: ChunkReader<A>,
    clock: Box<dyn Clock>,
    frames_sent: u64,
    bytes_sent: u64,
}

impl<S, V, A> TransmitLoop<S, V, A>
where
    S: FrameSink,
    V: Read,
    A: Read,
{
    /// 为已接受的会话创建发送循环
    ///
    /// 会话未被接受时返回 [`SessionError::Rejected`]，不会进入 `Sending`。
    pub fn new(
        handle: &SessionHandle,
        sink: S,
        video: ChunkReader<V>,
        audio: ChunkReader<A>,
    ) -> Result<Self, SessionError> {
        let handle = handle.accepted()?;

        Ok(Self {
            state: LoopState::Idle,
            assembler: FrameAssembler::new(handle.stream_id()),
            sink,
            video,
            audio,
            clock: Box::new(WallClock::new()),
            frames_sent: 0,
            bytes_sent: 0,
        })
    }

    /// 替换时间源
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// 运行直到终止
    pub fn run(mut self) -> TransmitReport {
        self.state = LoopState::Sending;
        info!("开始发送, 会话ID: {}", self.assembler.session_id());

        let outcome = loop {
            match self.next_cycle() {
                Cycle::Frame(frame) => {
                    let payload = frame.payload_len() as u64;
                    let ts = frame.captured_at_ms;

                    if let Err(e) = self.sink.send(frame) {
                        error!("帧发送失败 (第{}帧): {}", self.frames_sent + 1, e);
                        self.state = LoopState::Failed;
                        break TransmissionOutcome::SendFailed(e);
                    }

                    self.frames_sent += 1;
                    self.bytes_sent += payload;
                    trace!("已发送帧 ts={} 负载={}字节", ts, payload);
                    if self.frames_sent % 100 == 0 {
                        debug!("已发送 {} 帧, {} 字节", self.frames_sent, self.bytes_sent);
                    }
                }
                Cycle::EndOfStream(track) => {
                    info!("{} 源已结束, 进入排空", track);
                    self.state = LoopState::Draining;
                    break TransmissionOutcome::CompletedCleanly;
                }
                Cycle::ReadFailed(track, error) => {
                    error!("{} 源读取失败: {}", track, error);
                    self.state = LoopState::Failed;
                    break TransmissionOutcome::SourceReadFailed { track, error };
                }
            }
        };

        let close_error = if self.state == LoopState::Draining {
            let result = self.sink.close_send();
            self.state = LoopState::Closed;
            match result {
                Ok(()) => None,
                Err(e) => {
                    // 已发送的数据对端可见，关闭失败不改变结果
                    warn!("半关闭失败: {}", e);
                    Some(e)
                }
            }
        } else {
            None
        };
        debug_assert!(self.state.is_terminal());

        info!(
            "发送结束: {}, 共 {} 帧, {} 字节",
            outcome, self.frames_sent, self.bytes_sent
        );

        TransmitReport {
            outcome,
            state: self.state,
            frames_sent: self.frames_sent,
            bytes_sent: self.bytes_sent,
            close_error,
        }
    }

    /// 执行一轮读取
    ///
    /// 时间戳在读取任何一路之前采样。视频未读到数据时不再读音频，
    /// 避免在已结束的一轮里阻塞等待另一路。
    fn next_cycle(&mut self) -> Cycle {
        let captured_at_ms = self.clock.now_ms();

        let video = match self.video.read() {
            ReadStatus::Chunk(chunk) => chunk,
            ReadStatus::EndOfStream => return Cycle::EndOfStream(Track::Video),
            ReadStatus::Failed(e) => return Cycle::ReadFailed(Track::Video, e),
        };

        let audio = match self.audio.read() {
            ReadStatus::Chunk(chunk) => chunk,
            ReadStatus::EndOfStream => return Cycle::EndOfStream(Track::Audio),
            ReadStatus::Failed(e) => return Cycle::ReadFailed(Track::Audio, e),
        };

        Cycle::Frame(self.assembler.assemble(captured_at_ms, video, audio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RejectReason, SessionOutcome};
    use std::collections::VecDeque;
    use std::io::{Cursor, ErrorKind};
    use std::sync::{Arc, Mutex};

    /// 记录发送内容的发送端
    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<OutboundFrame>>>,
        closed: Arc<Mutex<bool>>,
        fail_on: Option<usize>,
        fail_close: bool,
    }

    impl FrameSink for Recorder {
        fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_on == Some(frames.len() + 1) {
                return Err(TransportError::Closed("peer reset".into()));
            }
            frames.push(frame);
            Ok(())
        }

        fn close_send(&mut self) -> Result<(), TransportError> {
            *self.closed.lock().unwrap() = true;
            if self.fail_close {
                return Err(TransportError::Closed("already gone".into()));
            }
            Ok(())
        }
    }

    /// 每次读取返回一个预设块的数据源，记录读取次数
    struct Chunks {
        chunks: VecDeque<io::Result<Vec<u8>>>,
        reads: Arc<Mutex<usize>>,
    }

    impl Chunks {
        fn new(chunks: &[&str]) -> (Self, Arc<Mutex<usize>>) {
            let reads = Arc::new(Mutex::new(0));
            let chunks = chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
            (Self { chunks, reads: reads.clone() }, reads)
        }
    }

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            *self.reads.lock().unwrap() += 1;
            match self.chunks.pop_front() {
                Some(Ok(c)) => {
                    buf[..c.len()].copy_from_slice(&c);
                    Ok(c.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    struct StepClock(u64);

    impl Clock for StepClock {
        fn now_ms(&mut self) -> u64 {
            self.0 += 10;
            self.0
        }
    }

    fn accepted(id: u32) -> SessionHandle {
        SessionHandle::new(id, SessionOutcome::Accepted)
    }

    fn readers<V: Read, A: Read>(video: V, audio: A) -> (ChunkReader<V>, ChunkReader<A>) {
        (
            ChunkReader::new(Track::Video, video, 64),
            ChunkReader::new(Track::Audio, audio, 64),
        )
    }

    #[test]
    fn test_pairs_chunks_in_read_order() {
        let (video, _) = Chunks::new(&["A", "B"]);
        let (audio, _) = Chunks::new(&["X", "Y"]);
        let (video, audio) = readers(video, audio);
        let sink = Recorder::default();

        let report = TransmitLoop::new(&accepted(8), sink.clone(), video, audio)
            .unwrap()
            .with_clock(StepClock(0))
            .run();

        assert!(report.outcome.is_clean());
        assert_eq!(report.state, LoopState::Closed);
        assert_eq!(report.frames_sent, 2);
        assert_eq!(report.bytes_sent, 4);
        assert!(*sink.closed.lock().unwrap());

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames[0].video, b"A");
        assert_eq!(frames[0].audio, b"X");
        assert_eq!(frames[1].video, b"B");
        assert_eq!(frames[1].audio, b"Y");
        assert_eq!((frames[0].captured_at_ms, frames[1].captured_at_ms), (10, 20));
        assert!(frames.iter().all(|f| f.session_id == 8));
    }

    #[test]
    fn test_end_of_stream_on_iteration_k() {
        // 音频在第3轮结束
        let (video, _) = Chunks::new(&["v1", "v2", "v3", "v4"]);
        let (audio, _) = Chunks::new(&["a1", "a2"]);
        let (video, audio) = readers(video, audio);
        let sink = Recorder::default();

        let report = TransmitLoop::new(&accepted(1), sink.clone(), video, audio)
            .unwrap()
            .run();

        assert!(report.outcome.is_clean());
        assert_eq!(report.frames_sent, 2);
        assert_eq!(sink.frames.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_video_end_skips_audio_read() {
        let (video, _) = Chunks::new(&["v1"]);
        let (audio, audio_reads) = Chunks::new(&["a1", "a2", "a3"]);
        let (video, audio) = readers(video, audio);

        let report = TransmitLoop::new(&accepted(1), Recorder::default(), video, audio)
            .unwrap()
            .run();

        assert_eq!(report.frames_sent, 1);
        assert_eq!(*audio_reads.lock().unwrap(), 1);
    }

    #[test]
    fn test_send_failure_stops_reads() {
        let (video, video_reads) = Chunks::new(&["1", "2", "3", "4", "5"]);
        let (audio, audio_reads) = Chunks::new(&["1", "2", "3", "4", "5"]);
        let (video, audio) = readers(video, audio);
        let sink = Recorder { fail_on: Some(3), ..Recorder::default() };

        let report = TransmitLoop::new(&accepted(1), sink.clone(), video, audio)
            .unwrap()
            .run();

        assert!(matches!(report.outcome, TransmissionOutcome::SendFailed(_)));
        assert_eq!(report.state, LoopState::Failed);
        assert_eq!(report.frames_sent, 2);
        assert_eq!(*video_reads.lock().unwrap(), 3);
        assert_eq!(*audio_reads.lock().unwrap(), 3);
        // 失败后不做半关闭
        assert!(!*sink.closed.lock().unwrap());
    }

    #[test]
    fn test_read_error_fails_loop() {
        let (video, _) = Chunks::new(&["1", "2"]);
        let audio = Chunks {
            chunks: VecDeque::from(vec![
                Ok(b"1".to_vec()),
                Err(io::Error::new(ErrorKind::BrokenPipe, "encoder gone")),
            ]),
            reads: Arc::new(Mutex::new(0)),
        };
        let (video, audio) = readers(video, audio);

        let report = TransmitLoop::new(&accepted(1), Recorder::default(), video, audio)
            .unwrap()
            .run();

        match report.outcome {
            TransmissionOutcome::SourceReadFailed { track, error } => {
                assert_eq!(track, Track::Audio);
                assert_eq!(error.kind(), ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected outcome: {other}"),
        }
        assert_eq!(report.frames_sent, 1);
        assert_eq!(report.state, LoopState::Failed);
    }

    #[test]
    fn test_close_failure_keeps_clean_outcome() {
        let (video, audio) = readers(Cursor::new(b"vv".to_vec()), Cursor::new(b"aa".to_vec()));
        let sink = Recorder { fail_close: true, ..Recorder::default() };

        let report = TransmitLoop::new(&accepted(1), sink, video, audio).unwrap().run();

        assert!(report.outcome.is_clean());
        assert_eq!(report.state, LoopState::Closed);
        assert!(report.close_error.is_some());
        assert_eq!(report.frames_sent, 1);
    }

    #[test]
    fn test_rejected_session_never_sends() {
        let handle = SessionHandle::new(1, SessionOutcome::Rejected(RejectReason::Unauthorized));
        let (video, audio) = readers(Cursor::new(b"v".to_vec()), Cursor::new(b"a".to_vec()));

        let result = TransmitLoop::new(&handle, Recorder::default(), video, audio);
        assert!(matches!(result, Err(SessionError::Rejected { .. })));
    }

    #[test]
    fn test_new_loop_starts_idle() {
        let (video, audio) = readers(Cursor::new(Vec::new()), Cursor::new(Vec::new()));
        let lp = TransmitLoop::new(&accepted(1), Recorder::default(), video, audio).unwrap();
        assert_eq!(lp.state(), LoopState::Idle);
    }
}
