//! Classified render failures.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Assemble,
    Encode,
    Preview,
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Probe => "probe",
            Stage::Assemble => "graph assembly",
            Stage::Encode => "encode",
            Stage::Preview => "preview",
            Stage::Extract => "extract",
        })
    }
}

/// Where a failure happened, for actionable logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub stage: Stage,
    pub caption: Option<usize>,
    pub preset_id: Option<String>,
}

impl ErrorContext {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            caption: None,
            preset_id: None,
        }
    }

    pub fn with_caption(mut self, index: usize, preset_id: &str) -> Self {
        self.caption = Some(index);
        self.preset_id = Some(preset_id.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "during {}", self.stage)?;
        if let Some(i) = self.caption {
            write!(f, " (caption {i}")?;
            if let Some(p) = &self.preset_id {
                write!(f, ", preset {p:?}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("cannot prepare the render {context}: {message}")]
    Resolution {
        context: ErrorContext,
        message: String,
    },

    #[error("a font file could not be found {context}: {detail}")]
    FontFileNotFound {
        context: ErrorContext,
        detail: String,
    },

    #[error("the text renderer failed to initialise {context}: {detail}")]
    DrawtextInit {
        context: ErrorContext,
        detail: String,
    },

    #[error("output dimensions are invalid or too small {context}: {detail}")]
    InvalidDimensions {
        context: ErrorContext,
        detail: String,
    },

    #[error("the input is missing a required stream {context}: {detail}")]
    MissingStream {
        context: ErrorContext,
        detail: String,
    },

    #[error("the video engine failed {context} (exit code {code:?}): {detail}")]
    Engine {
        context: ErrorContext,
        code: Option<i32>,
        detail: String,
    },

    #[error("render finished but produced no output at {}", path.display())]
    NoOutput { path: PathBuf },

    #[error("render cancelled")]
    Cancelled,

    #[error("I/O error {context}: {source}")]
    Io {
        context: ErrorContext,
        #[source]
        source: io::Error,
    },
}

impl RenderError {
    pub fn io(stage: Stage, source: io::Error) -> Self {
        RenderError::Io {
            context: ErrorContext::new(stage),
            source,
        }
    }

    pub fn resolution(stage: Stage, message: impl Into<String>) -> Self {
        RenderError::Resolution {
            context: ErrorContext::new(stage),
            message: message.into(),
        }
    }

    /// Whether a sanitized retry could plausibly fix this failure.
    pub fn is_graph_related(&self) -> bool {
        matches!(
            self,
            RenderError::FontFileNotFound { .. }
                | RenderError::DrawtextInit { .. }
                | RenderError::Engine { .. }
        )
    }
}

/// Map the engine's diagnostic output to an error category.
pub fn classify_engine_failure(context: ErrorContext, code: Option<i32>, diagnostic: &str) -> RenderError {
    let lower = diagnostic.to_lowercase();
    let detail = last_meaningful_line(diagnostic);

    if contains_any(&lower, &[
        "cannot find a valid font",
        "could not load font",
        "cannot open resource",
    ]) {
        RenderError::FontFileNotFound { context, detail }
    } else if lower.contains("drawtext")
        && contains_any(&lower, &["error initializing", "error reinitializing", "failed to"])
    {
        RenderError::DrawtextInit { context, detail }
    } else if contains_any(&lower, &[
        "not divisible by 2",
        "invalid too big or non positive size",
        "invalid size",
        "picture size",
        "too small",
    ]) {
        RenderError::InvalidDimensions { context, detail }
    } else if contains_any(&lower, &[
        "matches no streams",
        "does not contain any stream",
        "stream specifier",
        "no such stream",
    ]) {
        RenderError::MissingStream { context, detail }
    } else {
        RenderError::Engine {
            context,
            code,
            detail,
        }
    }
}

/// Position of the filter the engine blamed, from its `[Parsed_<name>_<n> @ ...]`
/// log prefix. The last mention wins.
pub fn failing_filter_index(diagnostic: &str) -> Option<usize> {
    diagnostic.lines().rev().find_map(|line| {
        let rest = &line[line.find("[Parsed_")? + "[Parsed_".len()..];
        let name = &rest[..rest.find([' ', ']'])?];
        name.rsplit_once('_')?.1.parse().ok()
    })
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn last_meaningful_line(diagnostic: &str) -> String {
    diagnostic
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("Conversion failed"))
        .unwrap_or("no diagnostic output")
        .to_string()
}
