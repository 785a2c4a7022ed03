//! Assembles the linear filter graph: optional aspect conversion followed by
//! one drawtext node per caption, joined by sequential labels `v0, v1, ...`.

use crate::caption::Caption;
use crate::error::{RenderError, Stage};
use crate::node::{build_node, minimal_node, Operation};
use crate::preset::{resolve_style, FontRegistry, Preset, PresetStore};
use crate::validate::split_top_level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Label of the input video stream.
pub const INPUT_LABEL: &str = "0:v";
pub const MIN_WIDTH: u32 = 320;
pub const MIN_HEIGHT: u32 = 180;
/// Largest side an aspect conversion may produce.
pub const MAX_DIMENSION: u32 = 16384;
/// Accepted aspect ratios lie in `[1/MAX_ASPECT, MAX_ASPECT]`.
pub const MAX_ASPECT: f64 = 100.0;

/// How the frame is fitted to a new aspect ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Fit inside and pad with black.
    #[default]
    Contain,
    /// Fill and center-crop.
    Cover,
}

impl FromStr for ScaleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "contain" => Ok(ScaleMode::Contain),
            "cover" => Ok(ScaleMode::Cover),
            other => Err(format!("unknown scale mode {other:?} (expected contain or cover)")),
        }
    }
}

/// A requested `W:H` aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspectRatio {
    pub width: f64,
    pub height: f64,
}

impl AspectRatio {
    pub fn ratio(&self) -> f64 {
        self.width / self.height
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(':')
            .ok_or_else(|| format!("aspect ratio {s:?} is not of the form W:H"))?;
        let parse = |v: &str| -> Result<f64, String> {
            match v.trim().parse::<f64>() {
                Ok(n) if n.is_finite() && n > 0.0 => Ok(n),
                _ => Err(format!("aspect ratio {s:?} has an invalid component {v:?}")),
            }
        };
        let aspect = Self {
            width: parse(w)?,
            height: parse(h)?,
        };
        let ratio = aspect.ratio();
        if !(1.0 / MAX_ASPECT..=MAX_ASPECT).contains(&ratio) {
            return Err(format!("aspect ratio {s:?} is outside 1:{MAX_ASPECT} to {MAX_ASPECT}:1"));
        }
        Ok(aspect)
    }
}

/// Output size for converting `source` to `aspect`: about the same pixel
/// count, even sides, at least `MIN_WIDTH` x `MIN_HEIGHT`. Fails when a
/// side would exceed `MAX_DIMENSION`.
pub fn target_dimensions(source: (u32, u32), aspect: AspectRatio) -> Result<(u32, u32), String> {
    let pixels = f64::from(source.0) * f64::from(source.1);
    let ratio = aspect.ratio();
    let mut width = (pixels * ratio).sqrt();
    let mut height = width / ratio;
    let grow = (f64::from(MIN_WIDTH) / width)
        .max(f64::from(MIN_HEIGHT) / height)
        .max(1.0);
    width *= grow;
    height *= grow;
    let (width, height) = (even_ceil(width), even_ceil(height));
    if !width.is_finite() || !height.is_finite() || width.max(height) > f64::from(MAX_DIMENSION) {
        return Err(format!(
            "converting {}x{} to {}:{} needs a {width}x{height} frame, larger than {MAX_DIMENSION}",
            source.0, source.1, aspect.width, aspect.height
        ));
    }
    Ok((width as u32, height as u32))
}

/// Smallest even integer >= `v` (and >= 2), still as a float.
fn even_ceil(v: f64) -> f64 {
    let n = (v - 1e-6).ceil().max(2.0);
    n + n % 2.0
}

/// Operations converting the frame to `width` x `height`.
pub fn aspect_ops(width: u32, height: u32, mode: ScaleMode) -> Vec<Operation> {
    let scale = |fit: &str| {
        Operation::new("scale")
            .raw("w", width)
            .raw("h", height)
            .raw("force_original_aspect_ratio", fit)
    };
    let fitted = match mode {
        ScaleMode::Contain => vec![
            scale("decrease"),
            Operation::new("pad")
                .raw("w", width)
                .raw("h", height)
                .raw("x", "(ow-iw)/2")
                .raw("y", "(oh-ih)/2")
                .raw("color", "black"),
        ],
        ScaleMode::Cover => vec![
            scale("increase"),
            Operation::new("crop").raw("w", width).raw("h", height),
        ],
    };
    let mut ops = fitted;
    ops.push(Operation::new("setsar").raw("sar", 1));
    ops
}

/// The caption a node draws, and the minimal node that can replace it.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionSource {
    pub index: usize,
    pub preset_id: String,
    pub fallback: String,
}

/// One labeled segment: `[input]op,op,...[output]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterNode {
    pub input: String,
    pub body: String,
    pub output: String,
    pub source: Option<CaptionSource>,
}

impl FilterNode {
    /// The same operations between different labels.
    pub fn render_with(&self, input: &str, output: &str) -> String {
        format!("[{input}]{}[{output}]", self.body)
    }
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}[{}]", self.input, self.body, self.output)
    }
}

/// A linear chain of [`FilterNode`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGraph {
    pub nodes: Vec<FilterNode>,
}

impl FilterGraph {
    /// Label to map to the output file.
    pub fn output_label(&self) -> &str {
        self.nodes
            .last()
            .map(|n| n.output.as_str())
            .unwrap_or(INPUT_LABEL)
    }

    /// The caption owning the `index`-th filter of the graph, counting
    /// filters across nodes in order the way the engine numbers them.
    pub fn caption_at_filter(&self, index: usize) -> Option<&CaptionSource> {
        let mut first = 0;
        for node in &self.nodes {
            let count = split_top_level(&node.body, ',').ok()?.len();
            if index < first + count {
                return node.source.as_ref();
            }
            first += count;
        }
        None
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

/// Something that was replaced by a default while assembling.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    pub caption: Option<usize>,
    pub preset_id: Option<String>,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.caption {
            Some(i) => write!(f, "caption {i}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Inputs of [`build_graph`].
#[derive(Debug, Clone, Copy)]
pub struct GraphRequest<'a> {
    pub captions: &'a [Caption],
    /// Position of `captions[0]` in the caller's caption list.
    pub first_index: usize,
    pub presets: &'a PresetStore,
    pub fonts: &'a FontRegistry,
    pub aspect: Option<AspectRatio>,
    pub scale_mode: ScaleMode,
    pub fade_duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledGraph {
    pub graph: FilterGraph,
    pub warnings: Vec<Warning>,
}

struct Labels(usize);

impl Labels {
    fn next(&mut self) -> String {
        let label = format!("v{}", self.0);
        self.0 += 1;
        label
    }
}

/// Build the filter graph for `req`. `source` is the input frame size and is
/// only needed when an aspect conversion is requested.
pub fn build_graph(req: &GraphRequest<'_>, source: Option<(u32, u32)>) -> Result<AssembledGraph, RenderError> {
    let mut labels = Labels(0);
    let mut nodes = Vec::new();
    let mut warnings = Vec::new();
    let mut current = INPUT_LABEL.to_string();

    if let Some(aspect) = req.aspect {
        let (w, h) = match source {
            Some((w, h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(RenderError::resolution(
                    Stage::Assemble,
                    "input dimensions are unknown, cannot convert aspect ratio",
                ))
            }
        };
        let (tw, th) =
            target_dimensions((w, h), aspect).map_err(|e| RenderError::resolution(Stage::Assemble, e))?;
        debug!("aspect {}:{} from {w}x{h} -> {tw}x{th}", aspect.width, aspect.height);
        let output = labels.next();
        nodes.push(FilterNode {
            input: current,
            body: join_ops(&aspect_ops(tw, th, req.scale_mode)),
            output: output.clone(),
            source: None,
        });
        current = output;
    }

    let default_preset = Preset::default();
    for (offset, caption) in req.captions.iter().enumerate() {
        let index = req.first_index + offset;
        let mut note = |message: String| {
            warn!("caption {index}: {message}");
            warnings.push(Warning {
                caption: Some(index),
                preset_id: Some(caption.preset_id.clone()),
                message,
            });
        };
        if let Err(e) = caption.validate() {
            note(format!("skipped: {e}"));
            continue;
        }
        let preset = req.presets.get(&caption.preset_id).unwrap_or_else(|| {
            note(format!("preset {:?} not found, using defaults", caption.preset_id));
            &default_preset
        });
        let style = resolve_style(preset, req.fonts);
        for w in &style.warnings {
            note(w.clone());
        }
        let built = build_node(caption, &style, req.fade_duration);
        if let Some(reason) = built.degraded {
            note(format!("animation dropped: {reason}"));
        }
        let output = labels.next();
        nodes.push(FilterNode {
            input: current,
            body: join_ops(&built.ops),
            output: output.clone(),
            source: Some(CaptionSource {
                index,
                preset_id: caption.preset_id.clone(),
                fallback: minimal_node(caption, &style).to_string(),
            }),
        });
        current = output;
    }

    if nodes.is_empty() {
        nodes.push(FilterNode {
            input: current,
            body: "null".to_string(),
            output: labels.next(),
            source: None,
        });
    }

    Ok(AssembledGraph {
        graph: FilterGraph { nodes },
        warnings,
    })
}

fn join_ops(ops: &[Operation]) -> String {
    ops.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Env;
    use crate::preset::{Animation, CustomFont};
    use crate::timing::{alpha_expr, fade_duration, DEFAULT_FADE_DURATION};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn presets() -> PresetStore {
        let mut map = BTreeMap::new();
        map.insert(
            "p1".to_string(),
            Preset {
                font: "Arial".into(),
                size: 36,
                color: "white".into(),
                x: "(w-text_w)/2".into(),
                y: "h-100".into(),
                animation: Animation::FadeInBottom,
                ..Preset::default()
            },
        );
        PresetStore::from_map(map)
    }

    fn request<'a>(captions: &'a [Caption], presets: &'a PresetStore, fonts: &'a FontRegistry) -> GraphRequest<'a> {
        GraphRequest {
            captions,
            first_index: 0,
            presets,
            fonts,
            aspect: None,
            scale_mode: ScaleMode::Contain,
            fade_duration: DEFAULT_FADE_DURATION,
        }
    }

    #[test]
    fn single_caption_is_one_node_from_input() {
        let captions = vec![Caption::new(0.0, 5.0, "Hello", "p1")];
        let (store, fonts) = (presets(), FontRegistry::default());
        let built = build_graph(&request(&captions, &store, &fonts), None).unwrap();
        assert!(built.warnings.is_empty());
        let graph = &built.graph;
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].input, "0:v");
        assert_eq!(graph.output_label(), "v0");
        let text = graph.to_string();
        assert!(text.starts_with("[0:v]drawtext=text='Hello':font='Arial':fontsize=36:"), "{text}");
        assert!(text.ends_with("[v0]"));

        let alpha = alpha_expr(0.0, 5.0, fade_duration(0.0, 5.0, DEFAULT_FADE_DURATION));
        assert!(text.contains(&format!("alpha='{alpha}'")));
        assert_eq!(alpha.eval(&Env::at(1920.0, 1080.0, 2.5)), 1.0);
        assert_eq!(alpha.eval(&Env::at(1920.0, 1080.0, 0.0)), 0.0);
    }

    #[test]
    fn overlapping_captions_chain_sequentially() {
        let captions = vec![
            Caption::new(0.0, 5.0, "first", "p1"),
            Caption::new(3.0, 8.0, "second", "p1"),
        ];
        let (store, fonts) = (presets(), FontRegistry::default());
        let graph = build_graph(&request(&captions, &store, &fonts), None).unwrap().graph;
        let labels: Vec<_> = graph
            .nodes
            .iter()
            .map(|n| (n.input.as_str(), n.output.as_str()))
            .collect();
        assert_eq!(labels, vec![("0:v", "v0"), ("v0", "v1")]);
        assert!(graph.to_string().contains("[v0];[v0]drawtext=text='second'"));
    }

    #[test]
    fn missing_preset_uses_defaults_and_warns() {
        let captions = vec![Caption::new(1.0, 2.0, "orphan", "nope")];
        let (store, fonts) = (presets(), FontRegistry::default());
        let built = build_graph(&request(&captions, &store, &fonts), None).unwrap();
        assert_eq!(built.warnings.len(), 1);
        assert_eq!(built.warnings[0].preset_id.as_deref(), Some("nope"));
        let body = &built.graph.nodes[0].body;
        assert!(body.contains("fontsize=24:fontcolor=white:x='(w-text_w)/2':y='h-100'"), "{body}");
    }

    #[test]
    fn deleted_custom_font_still_builds() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("Brand.ttf");
        fs::write(&file, b"ttf").unwrap();
        let fonts = FontRegistry::new([CustomFont {
            name: "Brand".into(),
            file_name: "Brand.ttf".into(),
            absolute_path: file.clone(),
        }]);
        let mut map = BTreeMap::new();
        map.insert(
            "brand".to_string(),
            Preset {
                font: "Brand".into(),
                ..Preset::default()
            },
        );
        let store = PresetStore::from_map(map);
        let captions = vec![Caption::new(0.0, 2.0, "x", "brand")];

        let with_file = build_graph(&request(&captions, &store, &fonts), None).unwrap();
        assert!(with_file.graph.nodes[0].body.contains("fontfile='"));

        fs::remove_file(&file).unwrap();
        let without = build_graph(&request(&captions, &store, &fonts), None).unwrap();
        assert!(without.graph.nodes[0].body.contains("font='Arial'"));
        assert!(!without.graph.nodes[0].body.contains("fontfile"));
        assert_eq!(without.warnings.len(), 1);
    }

    #[test]
    fn invalid_caption_is_skipped() {
        let captions = vec![
            Caption::new(4.0, 1.0, "backwards", "p1"),
            Caption::new(1.0, 2.0, "ok", "p1"),
        ];
        let (store, fonts) = (presets(), FontRegistry::default());
        let built = build_graph(&request(&captions, &store, &fonts), None).unwrap();
        assert_eq!(built.graph.nodes.len(), 1);
        assert_eq!(built.graph.nodes[0].source.as_ref().map(|s| s.index), Some(1));
        assert_eq!(built.warnings[0].caption, Some(0));
    }

    #[test]
    fn no_captions_is_a_pass_through() {
        let (store, fonts) = (presets(), FontRegistry::default());
        let graph = build_graph(&request(&[], &store, &fonts), None).unwrap().graph;
        assert_eq!(graph.to_string(), "[0:v]null[v0]");
    }

    #[test]
    fn aspect_conversion_comes_first() {
        let captions = vec![Caption::new(0.0, 5.0, "Hello", "p1")];
        let (store, fonts) = (presets(), FontRegistry::default());
        let mut req = request(&captions, &store, &fonts);
        req.aspect = Some("9:16".parse().unwrap());
        let graph = build_graph(&req, Some((1920, 1080))).unwrap().graph;
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(
            graph.nodes[0].to_string(),
            "[0:v]scale=w=1080:h=1920:force_original_aspect_ratio=decrease,pad=w=1080:h=1920:x=(ow-iw)/2:y=(oh-ih)/2:color=black,setsar=sar=1[v0]"
        );
        assert_eq!(graph.nodes[1].input, "v0");

        req.scale_mode = ScaleMode::Cover;
        let cover = build_graph(&req, Some((1920, 1080))).unwrap().graph;
        assert!(cover.nodes[0].body.contains("force_original_aspect_ratio=increase,crop=w=1080:h=1920"));

        assert!(matches!(
            build_graph(&req, None),
            Err(RenderError::Resolution { .. })
        ));
    }

    #[test]
    fn target_dimensions_are_even_and_bounded() {
        let ratios = ["16:9", "9:16", "1:1", "4:3", "21:9", "2.39:1", "4:5"];
        let sources = [(1920, 1080), (1280, 720), (100, 100), (641, 479), (3840, 2160), (321, 181)];
        for r in ratios {
            let aspect: AspectRatio = r.parse().unwrap();
            for src in sources {
                let (w, h) = target_dimensions(src, aspect).unwrap();
                assert_eq!(w % 2, 0, "{r} {src:?}");
                assert_eq!(h % 2, 0, "{r} {src:?}");
                assert!(w >= MIN_WIDTH && h >= MIN_HEIGHT, "{r} {src:?} -> {w}x{h}");
                let tolerance = 2.0 * aspect.ratio().max(1.0) / f64::from(h);
                let actual = f64::from(w) / f64::from(h);
                assert!((actual - aspect.ratio()).abs() <= tolerance, "{r} {src:?} -> {w}x{h}");
            }
        }
        assert_eq!(target_dimensions((1920, 1080), "9:16".parse().unwrap()), Ok((1080, 1920)));
    }

    #[test]
    fn oversized_frames_are_an_error() {
        let wide: AspectRatio = "100:1".parse().unwrap();
        assert!(target_dimensions((u32::MAX, u32::MAX), wide).is_err());
        assert!(target_dimensions((1920, 1080), wide).is_err());

        let captions = vec![Caption::new(0.0, 1.0, "a", "p1")];
        let (store, fonts) = (presets(), FontRegistry::default());
        let mut req = request(&captions, &store, &fonts);
        req.aspect = Some(wide);
        assert!(matches!(
            build_graph(&req, Some((u32::MAX, 2))),
            Err(RenderError::Resolution { .. })
        ));
    }

    #[test]
    fn filters_map_back_to_their_caption() {
        let captions = vec![
            Caption::new(0.0, 5.0, "a", "p1"),
            Caption::new(5.0, 6.0, "b, c", "p1"),
        ];
        let (store, fonts) = (presets(), FontRegistry::default());
        let mut req = request(&captions, &store, &fonts);
        req.aspect = Some("9:16".parse().unwrap());
        req.first_index = 7;
        let built = build_graph(&req, Some((1920, 1080))).unwrap();
        let graph = &built.graph;
        // scale, pad and setsar come first
        for i in 0..3 {
            assert_eq!(graph.caption_at_filter(i), None);
        }
        assert_eq!(graph.caption_at_filter(3).map(|s| s.index), Some(7));
        assert_eq!(graph.caption_at_filter(4).map(|s| s.index), Some(8));
        assert_eq!(graph.caption_at_filter(5), None);
    }

    #[test]
    fn rejects_bad_aspect_strings() {
        for bad in ["16x9", "0:9", "a:b", "16:", "-4:3", "1000000000:1", "1:1000", "inf:1"] {
            assert!(bad.parse::<AspectRatio>().is_err(), "{bad}");
        }
    }

    #[test]
    fn identical_inputs_give_identical_graphs() {
        let captions = vec![
            Caption::new(0.0, 5.0, "a: 'b'", "p1"),
            Caption::new(2.0, 3.0, "c", "missing"),
        ];
        let (store, fonts) = (presets(), FontRegistry::default());
        let mut req = request(&captions, &store, &fonts);
        req.aspect = Some("1:1".parse().unwrap());
        let first = build_graph(&req, Some((1280, 720))).unwrap().graph.to_string();
        let second = build_graph(&req, Some((1280, 720))).unwrap().graph.to_string();
        assert_eq!(first, second);
    }
}
