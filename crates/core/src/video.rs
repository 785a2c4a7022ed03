//! Access to the external video engine (ffmpeg) and prober (ffprobe).
//! Everything that spawns a process lives behind the [`Engine`] and
//! [`VideoProbe`] traits so the render pipeline can be driven by a fake.

use crate::error::{classify_engine_failure, ErrorContext, RenderError, Stage};
use serde::Deserialize;
use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Short synthetic clip used for dry runs of a filter graph.
pub const SYNTHETIC_INPUT: &str = "color=c=black:s=640x360:r=25:d=0.2";

/// Where to find the engine binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CAPTIONER_FFMPEG` / `CAPTIONER_FFPROBE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(p) = env::var_os("CAPTIONER_FFMPEG") {
            config.ffmpeg = PathBuf::from(p);
        }
        if let Some(p) = env::var_os("CAPTIONER_FFPROBE") {
            config.ffprobe = PathBuf::from(p);
        }
        config
    }
}

/// What the prober reports about an input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run the prober: {0}")]
    Spawn(#[from] io::Error),
    #[error("the prober failed: {0}")]
    Failed(String),
    #[error("unreadable prober output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no video stream found")]
    NoVideo,
}

pub trait VideoProbe {
    fn probe(&self, path: &Path) -> Result<VideoInfo, ProbeError>;
}

/// Exit code and diagnostics of a finished engine run. `code` is `None`
/// when the process was terminated by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub code: Option<i32>,
    pub stderr: String,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running engine invocation whose output is read line by line.
pub trait EngineProcess {
    /// Next line of combined output; progress updates separated by `\r`
    /// count as lines.
    fn next_line(&mut self) -> io::Result<Option<String>>;
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<Option<i32>>;
}

pub trait Engine {
    /// Run to completion, capturing diagnostics.
    fn run(&self, args: &[OsString]) -> io::Result<EngineOutput>;

    /// Start a long-running invocation.
    fn spawn(&self, args: &[OsString]) -> io::Result<Box<dyn EngineProcess>>;

    fn is_encoder_available(&self, name: &str) -> bool;

    /// Exercise `graph` against [`SYNTHETIC_INPUT`] without writing output.
    fn dry_run(&self, graph: &str, output_label: &str) -> io::Result<EngineOutput> {
        self.run(&dry_run_args(graph, output_label))
    }
}

pub fn dry_run_args(graph: &str, output_label: &str) -> Vec<OsString> {
    os_args([
        "-hide_banner",
        "-nostdin",
        "-v",
        "error",
        "-f",
        "lavfi",
        "-i",
        SYNTHETIC_INPUT,
        "-filter_complex",
        graph,
        "-map",
        &format!("[{output_label}]"),
        "-frames:v",
        "1",
        "-f",
        "null",
        "-",
    ])
}

pub(crate) fn os_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter().map(|a| a.as_ref().to_os_string()).collect()
}

/// H.264 encoders in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Nvenc,
    Amf,
    Qsv,
    Software,
}

impl Encoder {
    pub const GPU_PRIORITY: [Encoder; 3] = [Encoder::Nvenc, Encoder::Amf, Encoder::Qsv];

    pub fn name(self) -> &'static str {
        match self {
            Encoder::Nvenc => "h264_nvenc",
            Encoder::Amf => "h264_amf",
            Encoder::Qsv => "h264_qsv",
            Encoder::Software => "libx264",
        }
    }

    /// `-c:v` and quality arguments for this encoder.
    pub fn args(self) -> &'static [&'static str] {
        match self {
            Encoder::Nvenc => &["-c:v", "h264_nvenc", "-preset", "p7", "-cq", "19"],
            Encoder::Amf => &["-c:v", "h264_amf", "-quality", "quality", "-qp_i", "18", "-qp_p", "20"],
            Encoder::Qsv => &["-c:v", "h264_qsv", "-preset", "veryslow", "-global_quality", "18"],
            Encoder::Software => &["-c:v", "libx264", "-crf", "18", "-preset", "fast"],
        }
    }
}

/// First available GPU encoder, else software.
pub fn select_encoder(engine: &dyn Engine, prefer_gpu: bool) -> Encoder {
    let chosen = if prefer_gpu {
        Encoder::GPU_PRIORITY
            .into_iter()
            .find(|e| engine.is_encoder_available(e.name()))
            .unwrap_or(Encoder::Software)
    } else {
        Encoder::Software
    };
    debug!("using encoder {}", chosen.name());
    chosen
}

/// ffmpeg and ffprobe invoked as subprocesses.
#[derive(Debug)]
pub struct Ffmpeg {
    config: EngineConfig,
    encoders: OnceLock<String>,
}

impl Ffmpeg {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            encoders: OnceLock::new(),
        }
    }

    /// Check that ffmpeg runs and return its version line.
    pub fn check(&self) -> Result<String, RenderError> {
        let out = Command::new(&self.config.ffmpeg)
            .arg("-version")
            .output()
            .map_err(|e| {
                RenderError::Input(format!(
                    "ffmpeg not found at {} ({e}); install ffmpeg and make sure it is on PATH",
                    self.config.ffmpeg.display()
                ))
            })?;
        if !out.status.success() {
            return Err(RenderError::Input("ffmpeg exists but returned an error".into()));
        }
        let version = String::from_utf8_lossy(&out.stdout);
        let first = version.lines().next().unwrap_or("unknown").to_string();
        info!("using {first}");
        Ok(first)
    }

    fn encoder_list(&self) -> &str {
        self.encoders.get_or_init(|| {
            trace!("listing encoders");
            Command::new(&self.config.ffmpeg)
                .args(["-hide_banner", "-encoders"])
                .stderr(Stdio::null())
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
                .unwrap_or_default()
        })
    }
}

impl VideoProbe for Ffmpeg {
    fn probe(&self, path: &Path) -> Result<VideoInfo, ProbeError> {
        trace!("probe(path={})", path.display());
        let output = Command::new(&self.config.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration:stream=codec_type,width,height",
                "-of",
                "json",
            ])
            .arg(path)
            .output()?;
        if !output.status.success() {
            return Err(ProbeError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_probe(&output.stdout)
    }
}

impl Engine for Ffmpeg {
    fn run(&self, args: &[OsString]) -> io::Result<EngineOutput> {
        trace!("ffmpeg run: {args:?}");
        let out = Command::new(&self.config.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;
        Ok(EngineOutput {
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn spawn(&self, args: &[OsString]) -> io::Result<Box<dyn EngineProcess>> {
        trace!("ffmpeg spawn: {args:?}");
        let mut child = Command::new(&self.config.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("engine stderr was not captured"))?;
        Ok(Box::new(FfmpegProcess {
            child,
            reader: BufReader::new(stderr),
        }))
    }

    /// Listed in the build and able to encode a few synthetic frames, since
    /// hardware encoders are often compiled in without a usable device.
    fn is_encoder_available(&self, name: &str) -> bool {
        let listed = self
            .encoder_list()
            .lines()
            .any(|l| l.split_whitespace().nth(1) == Some(name));
        if !listed {
            return false;
        }
        let args = os_args([
            "-hide_banner",
            "-nostdin",
            "-v",
            "error",
            "-f",
            "lavfi",
            "-i",
            SYNTHETIC_INPUT,
            "-frames:v",
            "3",
            "-c:v",
            name,
            "-f",
            "null",
            "-",
        ]);
        let usable = self.run(&args).map(|o| o.success()).unwrap_or(false);
        debug!("encoder {name}: listed, usable={usable}");
        usable
    }
}

struct FfmpegProcess {
    child: Child,
    reader: BufReader<ChildStderr>,
}

impl EngineProcess for FfmpegProcess {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        read_line_cr_lf(&mut self.reader)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait()?.code())
    }
}

/// Read up to the next `\r` or `\n`, skipping empty lines. ffmpeg ends
/// progress updates with a bare `\r`.
fn read_line_cr_lf<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok((!line.is_empty()).then(|| String::from_utf8_lossy(&line).into_owned()));
        }
        match available.iter().position(|b| matches!(b, b'\n' | b'\r')) {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                if !line.is_empty() {
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
            }
            None => {
                let len = available.len();
                line.extend_from_slice(available);
                reader.consume(len);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Read duration, first video stream size and audio presence from ffprobe
/// JSON.
fn parse_probe(json: &[u8]) -> Result<VideoInfo, ProbeError> {
    let data: ProbeOutput = serde_json::from_slice(json)?;
    let (width, height) = data
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref().unwrap_or("video") == "video")
        .find_map(|s| Some((s.width?, s.height?)))
        .ok_or(ProbeError::NoVideo)?;
    let has_audio = data
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));
    let duration = data
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    Ok(VideoInfo {
        duration,
        width,
        height,
        has_audio,
    })
}

/// Save the frame at `time` seconds as an image.
pub fn extract_frame(engine: &dyn Engine, input: &Path, time: f64, output: &Path) -> Result<PathBuf, RenderError> {
    trace!("extract_frame(input={}, time={time})", input.display());
    let mut args = os_args(["-hide_banner", "-v", "error", "-ss", &format!("{time:.3}"), "-i"]);
    args.push(input.as_os_str().to_os_string());
    args.extend(os_args(["-frames:v", "1", "-q:v", "2", "-y"]));
    args.push(output.as_os_str().to_os_string());
    run_checked(engine, &args, output)
}

/// Decode the audio track to 16-bit PCM WAV (44.1 kHz, stereo).
pub fn extract_audio(engine: &dyn Engine, input: &Path, output: &Path) -> Result<PathBuf, RenderError> {
    trace!("extract_audio(input={})", input.display());
    let mut args = os_args(["-hide_banner", "-v", "error", "-i"]);
    args.push(input.as_os_str().to_os_string());
    args.extend(os_args(["-vn", "-acodec", "pcm_s16le", "-ar", "44100", "-ac", "2", "-y"]));
    args.push(output.as_os_str().to_os_string());
    run_checked(engine, &args, output)
}

fn run_checked(engine: &dyn Engine, args: &[OsString], output: &Path) -> Result<PathBuf, RenderError> {
    let out = engine
        .run(args)
        .map_err(|e| RenderError::io(Stage::Extract, e))?;
    if !out.success() {
        return Err(classify_engine_failure(
            ErrorContext::new(Stage::Extract),
            out.code,
            &out.stderr,
        ));
    }
    Ok(output.to_path_buf())
}
