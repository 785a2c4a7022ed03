//! Binary entry point for the caption renderer.

use anyhow::{Context, Result};
use captioner_core::preset::animation_kinds;
use captioner_core::timing::DEFAULT_FADE_DURATION;
use captioner_core::video::{extract_audio, extract_frame, VideoProbe};
use captioner_core::{
    build_graph, load_captions, render_captioned_video, render_preview, srt, AspectRatio, CancelToken, Caption,
    EngineConfig, Ffmpeg, FontRegistry, GraphRequest, Progress, PresetStore, RenderJob, RenderOptions, ScaleMode,
    ValidationMode,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PRESETS_FILE: &str = "presets.json";

/// Command line options for the binary.
#[derive(Parser)]
#[command(name = "captioner", about = "Burn styled, animated captions into a video with ffmpeg")]
struct Cli {
    /// Enable verbose debug and trace logs.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render every caption onto the input video.
    Render {
        #[command(flatten)]
        job: JobArgs,
        #[command(flatten)]
        encode: EncodeArgs,
        /// Output file; defaults to <input stem>_captioned.mp4.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Render a short clip showing a single caption.
    Preview {
        #[command(flatten)]
        job: JobArgs,
        #[command(flatten)]
        encode: EncodeArgs,
        /// Index of the caption to preview.
        #[arg(long)]
        index: usize,
    },
    /// Print the filter graph that a render would use.
    Graph {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Save the frame at a given time as an image.
    Frame {
        input: PathBuf,
        /// Seconds from the start of the input.
        #[arg(long, default_value_t = 0.0)]
        time: f64,
        #[arg(long)]
        output: PathBuf,
    },
    /// Decode the audio track to a WAV file.
    Audio {
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// List the available presets, creating the defaults if needed.
    Presets {
        #[arg(long, default_value = DEFAULT_PRESETS_FILE)]
        file: PathBuf,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Video to caption.
    input: PathBuf,

    /// Captions as a JSON array or an SRT file.
    #[arg(long)]
    captions: PathBuf,

    /// Preset file (JSON object keyed by preset id).
    #[arg(long, default_value = DEFAULT_PRESETS_FILE)]
    presets: PathBuf,

    /// Custom font registry (JSON array of {name, fileName, absolutePath}).
    #[arg(long)]
    fonts: Option<PathBuf>,

    /// Convert to this aspect ratio, e.g. 9:16.
    #[arg(long)]
    aspect: Option<String>,

    /// contain (pad) or cover (crop) when converting the aspect ratio.
    #[arg(long, default_value = "contain")]
    scale_mode: ScaleMode,

    /// Preset applied to captions imported from SRT.
    #[arg(long, default_value = "fadeBottom")]
    preset: String,

    /// Fade in/out duration in seconds.
    #[arg(long, default_value_t = DEFAULT_FADE_DURATION)]
    fade: f64,
}

#[derive(Args)]
struct EncodeArgs {
    /// Never try hardware encoders.
    #[arg(long)]
    no_gpu: bool,

    /// Graph validation before encoding: off, structural or dry-run.
    #[arg(long, default_value = "dry-run")]
    validate: ValidationMode,
}

impl JobArgs {
    fn load(&self) -> Result<RenderJob> {
        let captions = read_captions(&self.captions, &self.preset)?;
        let presets = PresetStore::load_or_default(&self.presets)?;
        let fonts = match &self.fonts {
            Some(path) => FontRegistry::load(path)?,
            None => FontRegistry::default(),
        };
        if !fonts.is_empty() {
            debug!("{} custom font(s) registered", fonts.len());
        }
        let mut job = RenderJob::new(&self.input, captions, presets);
        job.fonts = fonts;
        job.aspect_ratio = self.aspect.clone();
        job.scale_mode = self.scale_mode;
        Ok(job)
    }
}

impl EncodeArgs {
    fn options(&self, fade: f64) -> RenderOptions {
        let mut options = RenderOptions::from_env();
        options.fade_duration = fade;
        options.prefer_gpu &= !self.no_gpu;
        options.validation = self.validate;
        options
    }
}

fn read_captions(path: &Path, preset: &str) -> Result<Vec<Caption>> {
    let is_srt = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("srt"));
    if is_srt {
        srt::import(path, preset)
    } else {
        load_captions(path)
    }
}

/// Application entry point which parses CLI args and performs actions.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.debug {
        EnvFilter::default()
            .add_directive("captioner=trace".parse()?)
            .add_directive("captioner_core=trace".parse()?)
            .add_directive("info".parse()?)
    } else {
        EnvFilter::default()
            .add_directive("captioner=info".parse()?)
            .add_directive("captioner_core=info".parse()?)
            .add_directive("warn".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Render { job, encode, output } => {
            let options = encode.options(job.fade);
            let mut job = job.load()?;
            job.output = output;
            let path = run_render(job, options, None).await?;
            println!("{}", path.display());
        }
        Command::Preview { job, encode, index } => {
            let options = encode.options(job.fade);
            let job = job.load()?;
            let path = run_render(job, options, Some(index)).await?;
            println!("{}", path.display());
        }
        Command::Graph { job: args } => {
            let job = args.load()?;
            print_graph(&job, args.fade)?;
        }
        Command::Frame { input, time, output } => {
            let engine = Ffmpeg::new(EngineConfig::from_env());
            engine.check()?;
            println!("{}", extract_frame(&engine, &input, time, &output)?.display());
        }
        Command::Audio { input, output } => {
            let engine = Ffmpeg::new(EngineConfig::from_env());
            engine.check()?;
            println!("{}", extract_audio(&engine, &input, &output)?.display());
        }
        Command::Presets { file } => {
            let store = PresetStore::load_or_default(&file)?;
            for id in store.ids() {
                if let Some(p) = store.get(id) {
                    println!(
                        "{id}: {} {}px {} {:?} at ({}, {})",
                        p.font, p.size, p.color, p.animation, p.x, p.y
                    );
                }
            }
            let kinds: Vec<String> = animation_kinds().iter().map(|a| format!("{a:?}")).collect();
            println!("animations: {}", kinds.join(", "));
        }
    }
    Ok(())
}

/// Run a render (or a preview of caption `preview`) on a blocking thread
/// while logging its progress. Ctrl-C cancels the encode.
async fn run_render(job: RenderJob, options: RenderOptions, preview: Option<usize>) -> Result<PathBuf> {
    let engine = Ffmpeg::new(EngineConfig::from_env());
    engine.check()?;
    let cancel = CancelToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();

    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling render");
            stop.cancel();
        }
    });

    let task = tokio::task::spawn_blocking(move || {
        let mut sink = tx;
        match preview {
            Some(index) => render_preview(&engine, &engine, &job, index, &options, &mut sink, &cancel),
            None => render_captioned_video(&engine, &engine, &job, &options, &mut sink, &cancel),
        }
    });

    let mut last = -1;
    while let Some(Progress { percent, message }) = rx.recv().await {
        if percent < 0 {
            debug!("{message}");
        } else if percent != last {
            info!("{percent}%");
            last = percent;
        }
    }
    let path = task.await.context("render task panicked")??;
    Ok(path)
}

fn print_graph(job: &RenderJob, fade: f64) -> Result<()> {
    let aspect = job
        .aspect_ratio
        .as_deref()
        .map(str::parse::<AspectRatio>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let source = match aspect {
        Some(_) => {
            let engine = Ffmpeg::new(EngineConfig::from_env());
            let info = engine
                .probe(&job.input)
                .with_context(|| format!("could not probe {}", job.input.display()))?;
            Some((info.width, info.height))
        }
        None => None,
    };
    let request = GraphRequest {
        captions: &job.captions,
        first_index: 0,
        presets: &job.presets,
        fonts: &job.fonts,
        aspect,
        scale_mode: job.scale_mode,
        fade_duration: fade,
    };
    let assembled = build_graph(&request, source)?;
    for w in &assembled.warnings {
        eprintln!("warning: {w}");
    }
    println!("{}", assembled.graph);
    Ok(())
}
