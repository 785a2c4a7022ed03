//! Turns a stored [`Preset`] into concrete, validated drawing parameters.

use super::font::{resolve_font, FontRegistry, FontResolution};
use super::{Animation, Preset, DEFAULT_COLOR, DEFAULT_SIZE};
use crate::expr::{Expr, Var};
use tracing::warn;

/// Parameters for the optional box drawn behind the text.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxStyle {
    pub color: String,
    /// 0.0..=1.0
    pub opacity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutlineStyle {
    pub color: String,
    pub size: u32,
}

/// A preset after font resolution and validation of every free-form field.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStyle {
    pub font: FontResolution,
    pub size: u32,
    pub color: String,
    pub x: Expr,
    pub y: Expr,
    pub animation: Animation,
    pub background: Option<BoxStyle>,
    pub outline: Option<OutlineStyle>,
    /// Fields that were replaced by defaults, one message each.
    pub warnings: Vec<String>,
}

/// `(w-text_w)/2`
pub fn default_x() -> Expr {
    Expr::div(
        Expr::sub(Expr::var(Var::W), Expr::var(Var::TextW)),
        Expr::num(2.0),
    )
}

/// `h-100`
pub fn default_y() -> Expr {
    Expr::sub(Expr::var(Var::H), Expr::num(100.0))
}

/// Resolve `preset` against a snapshot of the font registry.
pub fn resolve_style(preset: &Preset, registry: &FontRegistry) -> ResolvedStyle {
    let mut warnings = Vec::new();
    let mut note = |msg: String| {
        warn!("{msg}");
        warnings.push(msg);
    };

    if let Some(found) = registry.lookup(&preset.font) {
        if !found.exists {
            note(format!(
                "font file for {:?} is missing, using a standard font",
                preset.font
            ));
        }
    }
    let font = resolve_font(&preset.font, registry);

    let size = if preset.size == 0 {
        note(format!("font size 0 is invalid, using {DEFAULT_SIZE}"));
        DEFAULT_SIZE
    } else {
        preset.size
    };
    let color = checked_color(&preset.color, DEFAULT_COLOR, &mut note);
    let x = parse_position(&preset.x, "x", default_x, &mut note);
    let y = parse_position(&preset.y, "y", default_y, &mut note);

    let background = preset.background.then(|| BoxStyle {
        color: checked_color(&preset.bg_color, "black", &mut note),
        opacity: f64::from(preset.bg_opacity.min(100)) / 100.0,
    });
    let outline = (preset.outline && preset.outline_size > 0).then(|| OutlineStyle {
        color: checked_color(&preset.outline_color, "black", &mut note),
        size: preset.outline_size,
    });

    ResolvedStyle {
        font,
        size,
        color,
        x,
        y,
        animation: preset.animation,
        background,
        outline,
        warnings,
    }
}

fn parse_position(
    raw: &str,
    axis: &str,
    default: fn() -> Expr,
    note: &mut impl FnMut(String),
) -> Expr {
    match Expr::parse(raw) {
        Ok(expr) => expr,
        Err(e) => {
            let shown: String = raw.chars().take(40).collect();
            note(format!("invalid {axis} position {shown:?} ({e}), using default"));
            default()
        }
    }
}

fn checked_color(raw: &str, default: &str, note: &mut impl FnMut(String)) -> String {
    if is_valid_color(raw) {
        raw.to_string()
    } else {
        note(format!("invalid color {raw:?}, using {default}"));
        default.to_string()
    }
}

/// A named color (ASCII letters) or `#RRGGBB[AA]` / `0xRRGGBB[AA]`.
pub fn is_valid_color(color: &str) -> bool {
    let hex = color
        .strip_prefix('#')
        .or_else(|| color.strip_prefix("0x"));
    match hex {
        Some(digits) => {
            matches!(digits.len(), 6 | 8) && digits.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => !color.is_empty() && color.len() <= 32 && color.chars().all(|c| c.is_ascii_alphabetic()),
    }
}
