//! Builds the drawtext operations for a single caption.

use crate::caption::{Caption, CaptionError};
use crate::escape::escape_text;
use crate::expr::Expr;
use crate::preset::{ResolvedStyle, DEFAULT_FONT};
use crate::timing::{self, Timing};
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Right-hand side of a `key=value` option.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Emitted as is.
    Raw(String),
    /// Already escaped content, emitted between single quotes.
    Quoted(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Raw(v) => f.write_str(v),
            Value::Quoted(v) => write!(f, "'{v}'"),
        }
    }
}

/// One filter invocation: `name=key=value:key=value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: &'static str,
    pub params: Vec<(&'static str, Value)>,
}

impl Operation {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            params: Vec::new(),
        }
    }

    pub fn raw(mut self, key: &'static str, value: impl ToString) -> Self {
        self.params.push((key, Value::Raw(value.to_string())));
        self
    }

    pub fn quoted(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.params.push((key, Value::Quoted(value.into())));
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '=' } else { ':' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Timing(#[from] CaptionError),
    #[error("fade duration {0} is not a finite, non-negative number")]
    BadFade(f64),
}

/// Operations drawing one caption, plus the reason if the minimal form had
/// to be used.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionOps {
    pub ops: Vec<Operation>,
    pub degraded: Option<String>,
}

/// Build the drawtext pass(es) for `caption`. Never fails: when the animated
/// form cannot be computed the minimal node is returned instead.
pub fn build_node(caption: &Caption, style: &ResolvedStyle, fade: f64) -> CaptionOps {
    match try_build(caption, style, fade) {
        Ok(ops) => CaptionOps {
            ops,
            degraded: None,
        },
        Err(e) => {
            warn!("caption {:?}: {e}; using minimal drawtext", caption.text);
            CaptionOps {
                ops: vec![minimal_node(caption, style)],
                degraded: Some(e.to_string()),
            }
        }
    }
}

fn try_build(caption: &Caption, style: &ResolvedStyle, fade: f64) -> Result<Vec<Operation>, NodeError> {
    if !fade.is_finite() || fade < 0.0 {
        return Err(NodeError::BadFade(fade));
    }
    let Timing { alpha, y, .. } = timing::compute(caption, style.animation, &style.y, fade)?;
    let y = y.unwrap_or_else(|| style.y.clone());
    let text = escape_text(&caption.text);

    let mut ops = Vec::new();
    if let Some(outline) = &style.outline {
        let s = f64::from(outline.size);
        for (dx, dy) in [(-s, -s), (s, -s), (-s, s), (s, s)] {
            ops.push(
                text_base(&text, style, &outline.color, &offset(&style.x, dx), &offset(&y, dy))
                    .quoted("alpha", alpha.to_string()),
            );
        }
    }

    let mut main = text_base(&text, style, &style.color, &style.x, &y);
    if let Some(bg) = &style.background {
        main = main
            .raw("box", 1)
            .raw("boxcolor", format!("{}@{}", bg.color, bg.opacity))
            .raw("boxborderw", 10);
    }
    ops.push(main.quoted("alpha", alpha.to_string()));
    Ok(ops)
}

/// Plain text at the preset position: no animation, no box, no outline, and
/// always the standard font.
pub fn minimal_node(caption: &Caption, style: &ResolvedStyle) -> Operation {
    Operation::new("drawtext")
        .quoted("text", escape_text(&caption.text))
        .quoted("font", DEFAULT_FONT)
        .raw("fontsize", style.size)
        .raw("fontcolor", &style.color)
        .quoted("x", style.x.to_string())
        .quoted("y", style.y.to_string())
}

fn text_base(text: &str, style: &ResolvedStyle, color: &str, x: &Expr, y: &Expr) -> Operation {
    let op = Operation::new("drawtext").quoted("text", text);
    let op = match &style.font.path {
        Some(path) if style.font.is_custom => op.quoted("fontfile", path.as_str()),
        _ => op.quoted("font", style.font.name.as_str()),
    };
    op.raw("fontsize", style.size)
        .raw("fontcolor", color)
        .quoted("x", x.to_string())
        .quoted("y", y.to_string())
}

fn offset(expr: &Expr, by: f64) -> Expr {
    if by < 0.0 {
        Expr::sub(expr.clone(), Expr::num(-by))
    } else {
        Expr::add(expr.clone(), Expr::num(by))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::{resolve_style, Animation, FontRegistry, FontResolution, Preset};

    fn style(preset: Preset) -> ResolvedStyle {
        resolve_style(&preset, &FontRegistry::default())
    }

    #[test]
    fn renders_params_in_fixed_order() {
        let caption = Caption::new(0.0, 5.0, "Hello: it's", "p1");
        let built = build_node(&caption, &style(Preset::default()), 0.5);
        assert_eq!(built.degraded, None);
        assert_eq!(built.ops.len(), 1);
        let text = built.ops[0].to_string();
        assert!(text.starts_with(
            r"drawtext=text='Hello\: it\'s':font='Arial':fontsize=24:fontcolor=white:x='(w-text_w)/2':y='h-100':alpha='if(lt(t,0),0,"
        ), "{text}");
    }

    #[test]
    fn custom_font_uses_fontfile() {
        let mut s = style(Preset::default());
        s.font = FontResolution {
            is_custom: true,
            path: Some(r"C\:/Fonts/Brand.ttf".into()),
            name: "Brand".into(),
        };
        let op = &build_node(&Caption::new(0.0, 2.0, "x", "p"), &s, 0.5).ops[0];
        assert_eq!(op.param("fontfile"), Some(&Value::Quoted(r"C\:/Fonts/Brand.ttf".into())));
        assert_eq!(op.param("font"), None);
    }

    #[test]
    fn outline_passes_come_before_main_text() {
        let preset = Preset {
            outline: true,
            outline_size: 2,
            outline_color: "black".into(),
            background: true,
            bg_opacity: 40,
            ..Preset::default()
        };
        let built = build_node(&Caption::new(1.0, 3.0, "x", "p"), &style(preset), 0.5);
        assert_eq!(built.ops.len(), 5);
        assert_eq!(built.ops[0].param("x"), Some(&Value::Quoted("(w-text_w)/2-2".into())));
        assert_eq!(built.ops[0].param("y"), Some(&Value::Quoted("h-100-2".into())));
        assert_eq!(built.ops[3].param("y"), Some(&Value::Quoted("h-100+2".into())));
        for op in &built.ops[..4] {
            assert_eq!(op.param("fontcolor"), Some(&Value::Raw("black".into())));
            assert_eq!(op.param("box"), None);
        }
        let main = &built.ops[4];
        assert_eq!(main.param("fontcolor"), Some(&Value::Raw("white".into())));
        assert_eq!(main.param("boxcolor"), Some(&Value::Raw("black@0.4".into())));
    }

    #[test]
    fn animated_y_replaces_static_position() {
        let preset = Preset {
            animation: Animation::FadeInBottom,
            ..Preset::default()
        };
        let op = &build_node(&Caption::new(0.0, 5.0, "x", "p"), &style(preset), 0.5).ops[0];
        match op.param("y") {
            Some(Value::Quoted(y)) => assert!(y.starts_with("if(lt(t,0.5),")),
            other => panic!("unexpected y {other:?}"),
        }
    }

    #[test]
    fn invalid_timing_degrades_to_minimal_node() {
        let mut s = style(Preset::default());
        s.font = FontResolution {
            is_custom: true,
            path: Some("/fonts/x.ttf".into()),
            name: "X".into(),
        };
        let built = build_node(&Caption::new(4.0, 2.0, "late", "p"), &s, 0.5);
        assert!(built.degraded.is_some());
        assert_eq!(
            built.ops[0].to_string(),
            "drawtext=text='late':font='Arial':fontsize=24:fontcolor=white:x='(w-text_w)/2':y='h-100'"
        );
        let nan = build_node(&Caption::new(0.0, 2.0, "x", "p"), &s, f64::NAN);
        assert!(nan.degraded.is_some());
    }
}
