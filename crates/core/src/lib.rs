//! Compiles timed captions and styling presets into an ffmpeg filter graph
//! and drives the encode that burns them into a video.

pub mod caption;
pub mod error;
pub mod escape;
pub mod expr;
pub mod graph;
pub mod node;
pub mod preset;
pub mod render;
pub mod srt;
pub mod timing;
pub mod validate;
pub mod video;

pub use caption::{load_captions, save_captions, Caption};
pub use error::{ErrorContext, RenderError, Stage};
pub use graph::{build_graph, AspectRatio, FilterGraph, GraphRequest, ScaleMode};
pub use preset::{FontRegistry, Preset, PresetStore};
pub use render::{
    render_captioned_video, render_preview, CancelToken, Progress, ProgressSink, RenderJob, RenderOptions,
};
pub use validate::ValidationMode;
pub use video::{EngineConfig, Ffmpeg};
