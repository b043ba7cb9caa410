use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use crate::config::TranscodeConfig;
use crate::error::EncodeError;
use crate::profile::ResolutionProfile;
use crate::progress::{parse_progress_line, ProgressEvent};

/// Number of trailing diagnostic lines kept for error reports
const TAIL_LINES: usize = 20;

/// Starts one external encode for one (job, profile)
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn start(
        &self,
        input: &Path,
        profile: &ResolutionProfile,
        output: &Path,
    ) -> Result<Box<dyn EncodeRun>, EncodeError>;
}

/// A running encode: a progress event stream followed by an exit status
#[async_trait]
pub trait EncodeRun: Send {
    /// Next progress event, `None` once the encoder's output has closed
    async fn next_event(&mut self) -> Option<ProgressEvent>;

    /// Wait for the encoder to terminate. Exit code 0 is `Ok`.
    async fn wait(&mut self) -> Result<(), EncodeError>;
}

/// Encoder settings shared by every profile
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
}

impl From<&TranscodeConfig> for EncoderSettings {
    fn from(cfg: &TranscodeConfig) -> Self {
        Self {
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            crf: cfg.crf,
        }
    }
}

/// Command builder for generating ffmpeg command lines
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the scale-and-encode command for one profile.
    ///
    /// `-progress pipe:1` emits machine-readable `key=value` lines on stdout;
    /// `-nostats` drops the human-oriented status line from stderr.
    pub fn build_scale_command(
        &self,
        input: &Path,
        output: &Path,
        profile: &ResolutionProfile,
        settings: &EncoderSettings,
    ) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-hide_banner".to_string());
        args.push("-nostats".to_string());
        args.push("-y".to_string());

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        args.push("-vf".to_string());
        args.push(format!("scale={}", profile.scale_spec));

        args.push("-c:v".to_string());
        args.push(settings.video_codec.clone());
        args.push("-preset".to_string());
        args.push(settings.preset.clone());
        args.push("-crf".to_string());
        args.push(settings.crf.to_string());

        args.push("-c:a".to_string());
        args.push("aac".to_string());

        args.push("-movflags".to_string());
        args.push("+faststart".to_string());

        args.push("-progress".to_string());
        args.push("pipe:1".to_string());

        args.push(output.to_string_lossy().to_string());

        args
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder backed by an ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    pub ffmpeg_bin: PathBuf,
    pub settings: EncoderSettings,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, settings: EncoderSettings) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            settings,
        }
    }

    pub fn from_config(cfg: &TranscodeConfig) -> Self {
        Self::new(cfg.ffmpeg_bin.clone(), EncoderSettings::from(cfg))
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn start(
        &self,
        input: &Path,
        profile: &ResolutionProfile,
        output: &Path,
    ) -> Result<Box<dyn EncodeRun>, EncodeError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EncodeError::Output {
                    path: output.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }

        // ffmpeg writes next to the output; the final name only appears on success
        let partial = partial_output_path(output);
        let args = CommandBuilder::new().build_scale_command(input, &partial, profile, &self.settings);
        debug!("Executing ffmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args);

        let run = ProcessRun::spawn(cmd, &self.ffmpeg_bin)?.promote_on_success(partial, output);
        Ok(Box::new(run))
    }
}

/// In-progress location of `output`: `<stem>.part.<ext>` in the same
/// directory, keeping the extension so ffmpeg still picks the muxer from it.
pub fn partial_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}.part.{}", stem, ext.to_string_lossy()),
        None => format!("{}.part", stem),
    };
    output.with_file_name(name)
}

/// One line of child output, tagged with the stream it came from
#[derive(Debug)]
struct OutputLine {
    from_stderr: bool,
    text: String,
}

/// A spawned encoder process whose stdout and stderr are merged into a single
/// line stream. The child is killed if the run is dropped before it exits.
pub struct ProcessRun {
    child: Child,
    lines: mpsc::Receiver<OutputLine>,
    tail: VecDeque<String>,
    /// (partial, final) paths to rename between after a clean exit
    promote: Option<(PathBuf, PathBuf)>,
}

impl ProcessRun {
    /// Spawn `cmd` with both output streams piped into one channel
    pub fn spawn(mut cmd: Command, bin: &Path) -> Result<Self, EncodeError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EncodeError::Spawn {
            bin: bin.to_path_buf(),
            source: e,
        })?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, false, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, true, tx);
        }

        Ok(Self {
            child,
            lines: rx,
            tail: VecDeque::with_capacity(TAIL_LINES),
            promote: None,
        })
    }

    /// Move `partial` to `output` once the process exits with code 0
    pub fn promote_on_success(mut self, partial: PathBuf, output: &Path) -> Self {
        self.promote = Some((partial, output.to_path_buf()));
        self
    }

    fn remember(&mut self, line: OutputLine) {
        if !line.from_stderr || line.text.trim().is_empty() {
            return;
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.text);
    }

    fn tail_text(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Read `reader` line by line into `tx` until EOF. Bytes are decoded lossily
/// so a stray non-UTF-8 byte never stops the pipe from being drained.
fn forward_lines<R>(reader: R, from_stderr: bool, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(OutputLine { from_stderr, text }).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[async_trait]
impl EncodeRun for ProcessRun {
    async fn next_event(&mut self) -> Option<ProgressEvent> {
        while let Some(line) = self.lines.recv().await {
            if let Some(event) = parse_progress_line(&line.text) {
                return Some(event);
            }
            self.remember(line);
        }
        None
    }

    async fn wait(&mut self) -> Result<(), EncodeError> {
        // Drain whatever is left so the diagnostic tail is complete
        while let Some(line) = self.lines.recv().await {
            self.remember(line);
        }

        let status = self.child.wait().await?;
        if status.success() {
            if let Some((partial, output)) = self.promote.take() {
                tokio::fs::rename(&partial, &output)
                    .await
                    .map_err(|e| EncodeError::Output {
                        path: output.clone(),
                        reason: format!("failed to move {} into place: {}", partial.display(), e),
                    })?;
            }
            return Ok(());
        }

        Err(EncodeError::NonZeroExit {
            code: status.code(),
            tail: self.tail_text(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 23,
        }
    }

    #[test]
    fn test_scale_command_layout() {
        let profile = ResolutionProfile::new("720p", "-2:720");
        let args = CommandBuilder::new().build_scale_command(
            Path::new("/data/uploads/in.mov"),
            Path::new("/data/processed/j_720p.mp4"),
            &profile,
            &settings(),
        );

        let pos = |needle: &str| args.iter().position(|a| a == needle).unwrap();
        assert_eq!(args[pos("-i") + 1], "/data/uploads/in.mov");
        assert_eq!(args[pos("-vf") + 1], "scale=-2:720");
        assert_eq!(args[pos("-c:v") + 1], "libx264");
        assert_eq!(args[pos("-crf") + 1], "23");
        assert_eq!(args[pos("-progress") + 1], "pipe:1");
        // Input before filters, output last
        assert!(pos("-i") < pos("-vf"));
        assert_eq!(args.last().unwrap(), "/data/processed/j_720p.mp4");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FfmpegEncoder::new("/nonexistent/ffmpeg-streamscale", settings());
        let result = encoder
            .start(
                Path::new("/tmp/in.mp4"),
                &ResolutionProfile::new("360p", "-2:360"),
                &dir.path().join("out.mp4"),
            )
            .await;
        assert!(matches!(result, Err(EncodeError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_run_merges_streams_and_reports_exit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            "echo frame=1; echo out_time_ms=1000000; echo out_time_ms=2000000 1>&2; \
             echo 'Conversion failed!' 1>&2; exit 3",
        );
        let mut run = ProcessRun::spawn(cmd, Path::new("sh")).unwrap();

        let mut seconds = Vec::new();
        while let Some(event) = run.next_event().await {
            seconds.push(event.current_seconds);
        }
        seconds.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seconds, vec![1.0, 2.0]);

        match run.wait().await {
            Err(EncodeError::NonZeroExit { code, tail }) => {
                assert_eq!(code, Some(3));
                assert!(tail.contains("Conversion failed!"));
                assert!(!tail.contains("frame=1"));
            }
            other => panic!("expected non-zero exit, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_output_path_keeps_extension() {
        assert_eq!(
            partial_output_path(Path::new("/data/processed/j_720p.mp4")),
            PathBuf::from("/data/processed/j_720p.part.mp4")
        );
        assert_eq!(partial_output_path(Path::new("out")), PathBuf::from("out.part"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_only_appears_after_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        for (script_exit, expect_output) in [(0, true), (1, false)] {
            let output = dir.path().join(format!("j_{}.mp4", script_exit));
            let partial = partial_output_path(&output);
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(format!("printf frames > '{}'; exit {}", partial.display(), script_exit));
            let mut run = ProcessRun::spawn(cmd, Path::new("sh"))
                .unwrap()
                .promote_on_success(partial.clone(), &output);

            while run.next_event().await.is_some() {}
            assert_eq!(run.wait().await.is_ok(), expect_output);
            assert_eq!(output.exists(), expect_output);
            assert_eq!(partial.exists(), !expect_output);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_run_success() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out_time_ms=N/A; echo progress=end");
        let mut run = ProcessRun::spawn(cmd, Path::new("sh")).unwrap();
        assert!(run.next_event().await.is_none());
        assert!(run.wait().await.is_ok());
    }
}
