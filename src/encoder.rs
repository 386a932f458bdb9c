//! 外部编码器进程
//!
//! 编码器把视频写到标准输出、把音频写到标准错误。标准错误在这里是一条数据通道，
//! 不是诊断输出：[`EncoderProcess::take_primary_channel`] 取视频，
//! [`EncoderProcess::take_secondary_channel`] 取音频。

use std::ffi::OsString;
use std::io;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

/// 默认采集设备（dshow）
pub const DEFAULT_INPUT: &str = "video=Integrated Camera:audio=Réseau de microphones (Realtek(R) Audio)";

/// 编码器参数（ffmpeg）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub program: String,
    /// 输入格式，如 `dshow`、`v4l2`、`avfoundation`
    pub input_format: String,
    /// 输入设备
    pub input: String,
    pub video_codec: String,
    pub video_bitrate: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// 输出容器
    pub container: String,
    pub framerate: u32,
    /// 输出尺寸，如 `1920x1080`
    pub size: String,
    /// 仅在 `libx264` 下生效
    pub preset: Option<String>,
    pub tune: Option<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            input_format: "dshow".to_string(),
            input: DEFAULT_INPUT.to_string(),
            video_codec: "libx264".to_string(),
            video_bitrate: "500k".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "64k".to_string(),
            container: "mpegts".to_string(),
            framerate: 60,
            size: "1920x1080".to_string(),
            preset: Some("ultrafast".to_string()),
            tune: Some("zerolatency".to_string()),
        }
    }
}

impl EncoderConfig {
    /// 生成进程描述，输出写到标准输出（`-`）
    pub fn to_process_spec(&self) -> ProcessSpec {
        let mut args: Vec<String> = vec![
            "-f".into(),
            self.input_format.clone(),
            "-i".into(),
            self.input.clone(),
            "-vcodec".into(),
            self.video_codec.clone(),
            "-b:v".into(),
            self.video_bitrate.clone(),
            "-acodec".into(),
            self.audio_codec.clone(),
            "-b:a".into(),
            self.audio_bitrate.clone(),
            "-f".into(),
            self.container.clone(),
            "-r".into(),
            self.framerate.to_string(),
            "-s".into(),
            self.size.clone(),
        ];

        if self.video_codec == "libx264" {
            if let Some(preset) = &self.preset {
                args.push("-preset".into());
                args.push(preset.clone());
            }
            if let Some(tune) = &self.tune {
                args.push("-tune".into());
                args.push(tune.clone());
            }
        }

        args.push("-".into());

        ProcessSpec::new(&self.program).args(args)
    }
}

/// 待启动的外部进程
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    program: OsString,
    args: Vec<OsString>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// 启动进程，标准输出和标准错误都以管道形式接出
    pub fn spawn(&self) -> io::Result<EncoderProcess> {
        debug!("启动编码器: {:?} {:?}", self.program, self.args);

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        info!("编码器已启动, pid: {}", child.id());
        Ok(EncoderProcess { child })
    }
}

/// 运行中的编码器进程
///
/// 进程句柄在 drop 时若仍未回收会被终止并等待，调用方不会留下孤儿进程。
pub struct EncoderProcess {
    child: Child,
}

impl EncoderProcess {
    /// 主数据通道（标准输出，视频）
    pub fn take_primary_channel(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// 副数据通道（标准错误，音频）
    ///
    /// 编码器把第二路流复用到名义上的诊断通道上，这是与编码器之间的约定。
    pub fn take_secondary_channel(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// 非阻塞地检查进程是否已退出
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }

    /// 终止进程并回收
    pub fn kill(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        warn!("终止编码器, pid: {}", self.child.id());
        if let Err(e) = self.child.kill() {
            // 进程可能已在两次调用之间退出
            debug!("kill 失败: {}", e);
        }
        self.child.wait()
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let spec = EncoderConfig::default().to_process_spec();
        let args: Vec<String> = spec
            .get_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(spec.program(), "ffmpeg");
        assert_eq!(
            args,
            [
                "-f", "dshow", "-i", DEFAULT_INPUT, "-vcodec", "libx264", "-b:v", "500k", "-acodec", "aac",
                "-b:a", "64k", "-f", "mpegts", "-r", "60", "-s", "1920x1080", "-preset", "ultrafast", "-tune",
                "zerolatency", "-",
            ]
        );
        assert!(!args.iter().any(|a| a == "-threads"));
    }

    #[test]
    fn test_preset_only_for_libx264() {
        let config = EncoderConfig {
            video_codec: "libvpx".to_string(),
            ..EncoderConfig::default()
        };
        let args: Vec<String> = config
            .to_process_spec()
            .get_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(!args.iter().any(|a| a == "-preset"));
        assert!(!args.iter().any(|a| a == "-tune"));
    }

    #[cfg(unix)]
    #[test]
    fn test_channels_map_stdout_and_stderr() {
        use std::io::Read;

        let mut process = ProcessSpec::new("sh")
            .args(["-c", "printf video; printf audio >&2"])
            .spawn()
            .unwrap();

        let mut video = String::new();
        let mut audio = String::new();
        process.take_primary_channel().unwrap().read_to_string(&mut video).unwrap();
        process.take_secondary_channel().unwrap().read_to_string(&mut audio).unwrap();

        assert_eq!(video, "video");
        assert_eq!(audio, "audio");
        assert!(process.wait().unwrap().success());
        assert!(process.take_primary_channel().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_reaps_running_process() {
        let mut process = ProcessSpec::new("sleep").arg("30").spawn().unwrap();
        let status = process.kill().unwrap();
        assert!(!status.success());
        assert!(process.try_wait().unwrap().is_some());
    }
}
