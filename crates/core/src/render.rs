//! Render orchestration: probe the input, assemble and validate the graph,
//! pick an encoder, run the engine and turn its output into progress.

use crate::caption::Caption;
use crate::error::{classify_engine_failure, failing_filter_index, ErrorContext, RenderError, Stage};
use crate::graph::{build_graph, AspectRatio, FilterGraph, GraphRequest, ScaleMode, Warning};
use crate::preset::{FontRegistry, PresetStore};
use crate::timing::DEFAULT_FADE_DURATION;
use crate::validate::{prepare, sanitize, ValidationMode, Validator};
use crate::video::{os_args, select_encoder, Encoder, Engine, VideoProbe};
use std::collections::VecDeque;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Diagnostic lines kept for classifying a failed run.
const STDERR_TAIL: usize = 20;

const AUDIO_ARGS: [&str; 6] = ["-map", "0:a?", "-c:a", "aac", "-b:a", "192k"];

/// Everything one render needs. Presets and fonts are owned snapshots so a
/// render never observes later edits.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub input: PathBuf,
    pub captions: Vec<Caption>,
    pub presets: PresetStore,
    pub fonts: FontRegistry,
    /// Defaults to `<stem>_captioned.mp4` next to the input.
    pub output: Option<PathBuf>,
    /// `W:H`, e.g. `9:16`.
    pub aspect_ratio: Option<String>,
    pub scale_mode: ScaleMode,
}

impl RenderJob {
    pub fn new(input: impl Into<PathBuf>, captions: Vec<Caption>, presets: PresetStore) -> Self {
        Self {
            input: input.into(),
            captions,
            presets,
            fonts: FontRegistry::default(),
            output: None,
            aspect_ratio: None,
            scale_mode: ScaleMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
    pub fade_duration: f64,
    pub prefer_gpu: bool,
    pub validation: ValidationMode,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            fade_duration: DEFAULT_FADE_DURATION,
            prefer_gpu: true,
            validation: ValidationMode::default(),
        }
    }
}

impl RenderOptions {
    /// Defaults, with GPU encoders disabled when `CAPTIONER_NO_GPU` is set.
    pub fn from_env() -> Self {
        let no_gpu = env::var("CAPTIONER_NO_GPU")
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        Self {
            prefer_gpu: !no_gpu,
            ..Self::default()
        }
    }
}

/// Receives `(percent, message)` pairs; `percent` is `-1` for plain status
/// lines and warnings. Called from the read loop, so it must not block.
pub trait ProgressSink {
    fn report(&mut self, percent: i32, message: &str);
}

impl<F: FnMut(i32, &str)> ProgressSink for F {
    fn report(&mut self, percent: i32, message: &str) {
        self(percent, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub percent: i32,
    pub message: String,
}

impl ProgressSink for UnboundedSender<Progress> {
    fn report(&mut self, percent: i32, message: &str) {
        // A closed receiver only means nobody is watching.
        let _ = self.send(Progress {
            percent,
            message: message.to_string(),
        });
    }
}

/// Shared flag that stops a running render.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Seconds from the `time=HH:MM:SS.ss` marker of an engine status line.
pub fn parse_progress_time(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once("time=")?;
    let stamp = rest.split_whitespace().next()?;
    let mut parts = stamp.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = h * 3600.0 + m * 60.0 + s;
    (total.is_finite() && total >= 0.0).then_some(total)
}

pub fn progress_percent(elapsed: f64, duration: f64) -> i32 {
    if duration.is_nan() || duration <= 0.0 {
        return 0;
    }
    ((elapsed / duration) * 100.0).clamp(0.0, 100.0) as i32
}

pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}_captioned.mp4"))
}

/// A time window of the input, for previews.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    start: f64,
    duration: f64,
}

/// Render all captions of `job` onto its input. Returns the output path.
pub fn render_captioned_video(
    engine: &dyn Engine,
    probe: &dyn VideoProbe,
    job: &RenderJob,
    options: &RenderOptions,
    sink: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<PathBuf, RenderError> {
    let output = job
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&job.input));
    info!("rendering {} -> {}", job.input.display(), output.display());
    let run = Run {
        engine,
        probe,
        job,
        options,
        stage: Stage::Encode,
        first_caption: 0,
    };
    run.execute(&job.captions, None, &output, sink, cancel)
}

/// Render only the window of caption `index`, rebased to the clip start,
/// into a temporary `.mp4` that the caller owns once this returns. The file
/// is removed again when the render fails.
pub fn render_preview(
    engine: &dyn Engine,
    probe: &dyn VideoProbe,
    job: &RenderJob,
    index: usize,
    options: &RenderOptions,
    sink: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<PathBuf, RenderError> {
    let caption = job
        .captions
        .get(index)
        .ok_or_else(|| RenderError::Input(format!("no caption at index {index}")))?;
    caption
        .validate()
        .map_err(|e| RenderError::Input(format!("caption {index}: {e}")))?;
    let segment = Segment {
        start: caption.start,
        duration: caption.duration(),
    };
    let output = tempfile::Builder::new()
        .prefix("captioner-preview-")
        .suffix(".mp4")
        .tempfile()
        .map(|f| f.into_temp_path())
        .map_err(|e| RenderError::io(Stage::Preview, e))?;
    debug!("preview of caption {index} -> {}", output.display());
    let run = Run {
        engine,
        probe,
        job,
        options,
        stage: Stage::Preview,
        first_caption: index,
    };
    let rebased = [caption.rebased(caption.start)];
    run.execute(&rebased, Some(segment), &output, sink, cancel)?;
    output.keep().map_err(|e| RenderError::io(Stage::Preview, e.error))
}

struct Run<'a> {
    engine: &'a dyn Engine,
    probe: &'a dyn VideoProbe,
    job: &'a RenderJob,
    options: &'a RenderOptions,
    stage: Stage,
    /// Index of the first rendered caption in the job.
    first_caption: usize,
}

impl Run<'_> {
    fn execute(
        &self,
        captions: &[Caption],
        segment: Option<Segment>,
        output: &Path,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<PathBuf, RenderError> {
        let job = self.job;
        if !job.input.is_file() {
            return Err(RenderError::Input(format!(
                "input file {} does not exist",
                job.input.display()
            )));
        }
        if captions.is_empty() && job.aspect_ratio.is_none() {
            return Err(RenderError::Input("no captions to render".into()));
        }

        info!("probing {}", job.input.display());
        let video = self
            .probe
            .probe(&job.input)
            .map_err(|e| RenderError::resolution(Stage::Probe, e.to_string()))?;
        debug!("input: {video:?}");
        let aspect = job
            .aspect_ratio
            .as_deref()
            .map(str::parse::<AspectRatio>)
            .transpose()
            .map_err(|e| RenderError::resolution(Stage::Assemble, e))?;

        info!("assembling filter graph for {} caption(s)", captions.len());
        let request = GraphRequest {
            captions,
            first_index: self.first_caption,
            presets: &job.presets,
            fonts: &job.fonts,
            aspect,
            scale_mode: job.scale_mode,
            fade_duration: self.options.fade_duration,
        };
        let assembled = build_graph(&request, Some((video.width, video.height)))?;
        forward_warnings(sink, &assembled.warnings);

        info!("validating filter graph");
        let validator = Validator::new(self.engine, self.options.validation);
        let prepared = prepare(&assembled.graph, &validator);
        forward_warnings(sink, &prepared.warnings);
        let label = assembled.graph.output_label();
        let text = prepared.graph.to_string();
        debug!("filter graph: {text}");

        let encoder = select_encoder(self.engine, self.options.prefer_gpu);
        let duration = segment.map(|s| s.duration).unwrap_or(video.duration);
        let args = command_args(&job.input, &text, label, encoder, video.has_audio, segment, output);

        info!("encoding with {}", encoder.name());
        match self.encode(&args, &prepared.graph, duration, sink, cancel) {
            Err(e) if e.is_graph_related() && !prepared.sanitized => {
                warn!("engine rejected the graph ({e}), retrying once sanitized");
                sink.report(-1, &format!("warning: {e}; retrying with a sanitized filter graph"));
                let repaired = sanitize(&prepared.graph);
                let text = repaired.to_string();
                let args = command_args(&job.input, &text, label, encoder, video.has_audio, segment, output);
                self.encode(&args, &repaired, duration, sink, cancel)?;
            }
            other => other?,
        }

        match fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => {
                info!("render finished: {}", output.display());
                sink.report(100, "done");
                Ok(output.to_path_buf())
            }
            _ => Err(RenderError::NoOutput {
                path: output.to_path_buf(),
            }),
        }
    }

    /// Run the engine once. `graph` is what `args` encode; it maps a blamed
    /// filter back to its caption.
    fn encode(
        &self,
        args: &[OsString],
        graph: &FilterGraph,
        duration: f64,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), RenderError> {
        trace!("engine args: {args:?}");
        let io_err = |e| RenderError::io(self.stage, e);
        let mut process = self.engine.spawn(args).map_err(io_err)?;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        loop {
            if cancel.is_cancelled() {
                info!("render cancelled, stopping the engine");
                if let Err(e) = process.kill() {
                    warn!("failed to stop the engine: {e}");
                }
                // Reap the child; its exit status is irrelevant now.
                let _ = process.wait();
                return Err(RenderError::Cancelled);
            }
            let Some(line) = process.next_line().map_err(io_err)? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_progress_time(line) {
                Some(t) => sink.report(progress_percent(t, duration), line),
                None => {
                    sink.report(-1, line);
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
        }
        let code = process.wait().map_err(io_err)?;
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        if code == Some(0) {
            return Ok(());
        }
        let diagnostic = Vec::from(tail).join("\n");
        let mut context = ErrorContext::new(self.stage);
        if let Some(source) = failing_filter_index(&diagnostic).and_then(|i| graph.caption_at_filter(i)) {
            context = context.with_caption(source.index, &source.preset_id);
        }
        Err(classify_engine_failure(context, code, &diagnostic))
    }
}

fn forward_warnings(sink: &mut dyn ProgressSink, warnings: &[Warning]) {
    for w in warnings {
        sink.report(-1, &format!("warning: {w}"));
    }
}

fn command_args(
    input: &Path,
    graph: &str,
    label: &str,
    encoder: Encoder,
    has_audio: bool,
    segment: Option<Segment>,
    output: &Path,
) -> Vec<OsString> {
    let mut args = os_args(["-hide_banner", "-nostdin", "-y"]);
    if let Some(s) = segment {
        args.extend(os_args(["-ss", &format!("{:.3}", s.start)]));
    }
    args.push("-i".into());
    args.push(input.as_os_str().to_os_string());
    if let Some(s) = segment {
        args.extend(os_args(["-t", &format!("{:.3}", s.duration)]));
    }
    args.extend(os_args(["-filter_complex", graph, "-map", &format!("[{label}]")]));
    args.extend(os_args(encoder.args()));
    if has_audio {
        args.extend(os_args(AUDIO_ARGS));
    }
    args.push(output.as_os_str().to_os_string());
    args
}
