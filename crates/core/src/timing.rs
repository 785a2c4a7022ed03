//! Opacity and position expressions for caption animations.
//!
//! All expressions are functions of the engine's `t` (seconds since the
//! start of the input) and the caption's own timestamps only.

use crate::caption::{Caption, CaptionError};
use crate::expr::Expr;
use crate::preset::Animation;

/// Fade length used when the caption is long enough for it.
pub const DEFAULT_FADE_DURATION: f64 = 0.5;

/// Vertical distance, in pixels, covered by the entry animations.
const SLIDE_DISTANCE: f64 = 50.0;

/// Animated attributes of one caption.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub fade: f64,
    pub alpha: Expr,
    /// Animated `y`; `None` keeps the preset position.
    pub y: Option<Expr>,
}

/// Fade window for a caption: never more than a quarter of its duration.
pub fn fade_duration(start: f64, end: f64, configured: f64) -> f64 {
    configured.min((end - start) / 4.0).max(0.0)
}

/// Piecewise opacity: 0 before `start`, ramp up over `fade`, hold at 1,
/// ramp down over the last `fade` seconds, 0 from `end` on.
pub fn alpha_expr(start: f64, end: f64, fade: f64) -> Expr {
    let t = Expr::t;
    let n = Expr::num;
    if fade <= 0.0 {
        return Expr::if_(
            Expr::lt(t(), n(start)),
            n(0.0),
            Expr::if_(Expr::lt(t(), n(end)), n(1.0), n(0.0)),
        );
    }
    let ramp_in = Expr::min(n(1.0), Expr::div(Expr::sub(t(), n(start)), n(fade)));
    let ramp_out = Expr::min(n(1.0), Expr::div(Expr::sub(n(end), t()), n(fade)));
    Expr::if_(
        Expr::lt(t(), n(start)),
        n(0.0),
        Expr::if_(
            Expr::lt(t(), n(start + fade)),
            ramp_in,
            Expr::if_(
                Expr::lt(t(), n(end - fade)),
                n(1.0),
                Expr::if_(Expr::lt(t(), n(end)), ramp_out, n(0.0)),
            ),
        ),
    )
}

/// Entry progress in `[0, 1)` while `t < start + fade`; callers only use
/// it inside that branch.
fn entry_progress(start: f64, fade: f64) -> Expr {
    Expr::max(
        Expr::num(0.0),
        Expr::div(Expr::sub(Expr::t(), Expr::num(start)), Expr::num(fade)),
    )
}

/// `y` rising from `base + 50` to `base` over the fade-in.
pub fn rise_from_below(base: &Expr, start: f64, fade: f64) -> Expr {
    let from = Expr::add(base.clone(), Expr::num(SLIDE_DISTANCE));
    let moving = Expr::sub(
        from,
        Expr::mul(Expr::num(SLIDE_DISTANCE), entry_progress(start, fade)),
    );
    Expr::if_(Expr::lt(Expr::t(), Expr::num(start + fade)), moving, base.clone())
}

/// `y` moving from 50 px to `base` over the fade-in.
pub fn slide_from_top(base: &Expr, start: f64, fade: f64) -> Expr {
    let span = Expr::sub(base.clone(), Expr::num(SLIDE_DISTANCE));
    let moving = Expr::add(
        Expr::num(SLIDE_DISTANCE),
        Expr::mul(entry_progress(start, fade), span),
    );
    Expr::if_(Expr::lt(Expr::t(), Expr::num(start + fade)), moving, base.clone())
}

/// Compute the animated attributes of `caption` for `animation`.
pub fn compute(
    caption: &Caption,
    animation: Animation,
    base_y: &Expr,
    configured_fade: f64,
) -> Result<Timing, CaptionError> {
    caption.validate()?;
    let (start, end) = (caption.start, caption.end);
    let fade = fade_duration(start, end, configured_fade);
    let alpha = alpha_expr(start, end, fade);
    let y = match animation {
        _ if fade <= 0.0 => None,
        Animation::FadeInBottom => Some(rise_from_below(base_y, start, fade)),
        Animation::SlideFromTop => Some(slide_from_top(base_y, start, fade)),
        Animation::Appear | Animation::FadeIn => None,
    };
    Ok(Timing { fade, alpha, y })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Env, Var};

    fn alpha_at(expr: &Expr, t: f64) -> f64 {
        expr.eval(&Env::at(1920.0, 1080.0, t))
    }

    #[test]
    fn fade_is_capped_by_duration() {
        assert_eq!(fade_duration(0.0, 5.0, DEFAULT_FADE_DURATION), 0.5);
        assert!(fade_duration(1.0, 1.4, DEFAULT_FADE_DURATION) <= 0.4 / 4.0);
    }

    #[test]
    fn alpha_is_one_at_midpoint_of_long_captions() {
        for (start, end) in [(0.0, 1.0), (0.0, 5.0), (3.25, 8.0), (100.0, 101.7)] {
            let alpha = alpha_expr(start, end, fade_duration(start, end, DEFAULT_FADE_DURATION));
            assert_eq!(alpha_at(&alpha, (start + end) / 2.0), 1.0, "{start}..{end}");
        }
    }

    #[test]
    fn alpha_stays_in_unit_range_for_short_captions() {
        for (start, end) in [(0.0, 0.1), (2.0, 2.3), (7.77, 8.5), (0.5, 0.51)] {
            let fade = fade_duration(start, end, DEFAULT_FADE_DURATION);
            assert!(fade <= (end - start) / 4.0);
            let alpha = alpha_expr(start, end, fade);
            for i in 0..=400u32 {
                let t = start - 0.5 + (end - start + 1.0) * f64::from(i) / 400.0;
                let a = alpha_at(&alpha, t);
                assert!((0.0..=1.0).contains(&a), "alpha {a} at t={t}");
            }
        }
    }

    #[test]
    fn alpha_shape() {
        let alpha = alpha_expr(2.0, 6.0, 0.5);
        assert_eq!(alpha_at(&alpha, 1.9), 0.0);
        assert_eq!(alpha_at(&alpha, 2.25), 0.5);
        assert_eq!(alpha_at(&alpha, 4.0), 1.0);
        assert_eq!(alpha_at(&alpha, 5.75), 0.5);
        assert_eq!(alpha_at(&alpha, 6.0), 0.0);
        assert_eq!(
            alpha.to_string(),
            "if(lt(t,2),0,if(lt(t,2.5),min(1,(t-2)/0.5),if(lt(t,5.5),1,if(lt(t,6),min(1,(6-t)/0.5),0))))"
        );
    }

    #[test]
    fn rise_from_below_moves_up_fifty_pixels() {
        let base = Expr::sub(Expr::var(Var::H), Expr::num(100.0));
        let y = rise_from_below(&base, 1.0, 0.5);
        assert_eq!(y.eval(&Env::at(0.0, 1080.0, 1.0)), 1030.0);
        assert_eq!(y.eval(&Env::at(0.0, 1080.0, 1.25)), 1005.0);
        assert_eq!(y.eval(&Env::at(0.0, 1080.0, 1.5)), 980.0);
        assert_eq!(y.eval(&Env::at(0.0, 1080.0, 3.0)), 980.0);
    }

    #[test]
    fn slide_from_top_starts_at_fifty() {
        let base = Expr::num(500.0);
        let y = slide_from_top(&base, 0.0, 0.5);
        assert_eq!(y.eval(&Env::at(0.0, 1080.0, 0.0)), 50.0);
        assert_eq!(y.eval(&Env::at(0.0, 1080.0, 0.25)), 275.0);
        assert_eq!(y.eval(&Env::at(0.0, 1080.0, 0.5)), 500.0);
    }

    #[test]
    fn static_animations_have_no_position() {
        let caption = Caption::new(0.0, 5.0, "x", "p");
        let base = Expr::num(10.0);
        for animation in [Animation::Appear, Animation::FadeIn] {
            assert_eq!(compute(&caption, animation, &base, 0.5).unwrap().y, None);
        }
        assert!(compute(&caption, Animation::SlideFromTop, &base, 0.5).unwrap().y.is_some());
    }

    #[test]
    fn invalid_caption_is_an_error() {
        let caption = Caption::new(5.0, 1.0, "x", "p");
        assert!(compute(&caption, Animation::Appear, &Expr::num(0.0), 0.5).is_err());
    }
}
