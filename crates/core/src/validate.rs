//! Checks a filter graph before the real encode and repairs it when the
//! engine rejects it.
//!
//! Checking runs in two passes: a structural pass (quoting, labels, known
//! filters, parseable drawtext expressions) and an optional dry run of the
//! graph against a synthetic clip. Rejections are never errors: the graph is
//! sanitized, and captions that still fail are swapped for their minimal node.

use crate::expr::Expr;
use crate::graph::{FilterGraph, FilterNode, Warning, INPUT_LABEL};
use crate::video::Engine;
use std::str::FromStr;
use tracing::{debug, info, warn};

const KNOWN_FILTERS: &[&str] = &[
    "drawtext", "scale", "pad", "crop", "setsar", "null", "format", "fps",
];

/// drawtext options holding expressions we can parse.
const EXPRESSION_KEYS: &[&str] = &["x", "y", "alpha"];

/// Label used when a single node is checked on its own.
const CHECK_LABEL: &str = "check";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationMode {
    Off,
    Structural,
    #[default]
    DryRun,
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ValidationMode::Off),
            "structural" => Ok(ValidationMode::Structural),
            "dry-run" | "dryrun" => Ok(ValidationMode::DryRun),
            other => Err(format!(
                "unknown validation mode {other:?} (expected off, structural or dry-run)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(String),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

pub struct Validator<'a> {
    engine: &'a dyn Engine,
    mode: ValidationMode,
}

impl<'a> Validator<'a> {
    pub fn new(engine: &'a dyn Engine, mode: ValidationMode) -> Self {
        Self { engine, mode }
    }

    pub fn validate(&self, graph: &str, output_label: &str) -> Verdict {
        if self.mode == ValidationMode::Off {
            return Verdict::Accepted;
        }
        let structural = check_structure(graph);
        if !structural.is_accepted() || self.mode == ValidationMode::Structural {
            return structural;
        }
        match self.engine.dry_run(graph, output_label) {
            Ok(out) if out.success() => Verdict::Accepted,
            Ok(out) => Verdict::Rejected(tail(&out.stderr)),
            Err(e) => {
                warn!("dry run could not start ({e}); relying on the structural check");
                Verdict::Accepted
            }
        }
    }
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    let joined = lines[start..].join(" | ");
    if joined.is_empty() {
        "rejected without diagnostics".to_string()
    } else {
        joined
    }
}

/// A graph ready for the encode, with a record of what was changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub graph: FilterGraph,
    pub sanitized: bool,
    /// Caption indices replaced by their minimal node.
    pub fallbacks: Vec<usize>,
    pub warnings: Vec<Warning>,
}

/// Validate `graph`; on rejection sanitize it, and if that still fails
/// check caption nodes one by one, replacing the ones that keep failing.
pub fn prepare(graph: &FilterGraph, validator: &Validator<'_>) -> Prepared {
    let text = graph.to_string();
    let label = graph.output_label();
    let diagnostic = match validator.validate(&text, label) {
        Verdict::Accepted => {
            return Prepared {
                graph: graph.clone(),
                sanitized: false,
                fallbacks: Vec::new(),
                warnings: Vec::new(),
            }
        }
        Verdict::Rejected(d) => d,
    };
    info!("filter graph rejected ({diagnostic}), sanitizing");
    let mut warnings = vec![Warning {
        caption: None,
        preset_id: None,
        message: format!("filter graph rejected: {diagnostic}"),
    }];

    let sanitized = sanitize(graph);
    if validator.validate(&sanitized.to_string(), label).is_accepted() {
        warnings.push(Warning {
            caption: None,
            preset_id: None,
            message: "filter graph repaired by sanitizing".to_string(),
        });
        return Prepared {
            graph: sanitized,
            sanitized: true,
            fallbacks: Vec::new(),
            warnings,
        };
    }

    let mut nodes = graph.nodes.clone();
    let mut fallbacks = Vec::new();
    for node in nodes.iter_mut() {
        let Some(source) = &node.source else {
            continue;
        };
        let single = node.render_with(INPUT_LABEL, CHECK_LABEL);
        if validator.validate(&single, CHECK_LABEL).is_accepted() {
            continue;
        }
        let repaired = sanitize_segment(&node.body);
        let candidate = format!("[{INPUT_LABEL}]{repaired}[{CHECK_LABEL}]");
        let (body, message) = if validator.validate(&candidate, CHECK_LABEL).is_accepted() {
            (repaired, "drawtext node repaired by sanitizing".to_string())
        } else {
            fallbacks.push(source.index);
            (
                source.fallback.clone(),
                "drawtext node rejected, using plain text without animation".to_string(),
            )
        };
        warn!("caption {}: {message}", source.index);
        warnings.push(Warning {
            caption: Some(source.index),
            preset_id: Some(source.preset_id.clone()),
            message,
        });
        node.body = body;
    }
    Prepared {
        graph: FilterGraph { nodes },
        sanitized: true,
        fallbacks,
        warnings,
    }
}

/// Structural check of a graph string.
pub fn check_structure(graph: &str) -> Verdict {
    match structure_errors(graph) {
        Ok(()) => Verdict::Accepted,
        Err(msg) => {
            debug!("structural check failed: {msg}");
            Verdict::Rejected(msg)
        }
    }
}

fn structure_errors(graph: &str) -> Result<(), String> {
    if graph.trim().is_empty() {
        return Err("empty filter graph".into());
    }
    let segments = split_top_level(graph, ';')?;
    let mut previous: Option<&str> = None;
    let mut outputs: Vec<&str> = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        let (input, body, output) =
            split_labels(segment).ok_or_else(|| format!("segment {i} is not of the form [in]filters[out]"))?;
        if let Some(prev) = previous {
            if input != prev {
                return Err(format!("segment {i} reads [{input}] but the chain is at [{prev}]"));
            }
        }
        if outputs.contains(&output) || output == input {
            return Err(format!("label [{output}] is used twice"));
        }
        outputs.push(output);
        previous = Some(output);
        for op in split_top_level(body, ',')? {
            check_operation(op)?;
        }
    }
    Ok(())
}

fn check_operation(op: &str) -> Result<(), String> {
    let (name, args) = op.split_once('=').unwrap_or((op, ""));
    if !KNOWN_FILTERS.contains(&name) {
        return Err(format!("unknown filter {name:?}"));
    }
    if name != "drawtext" {
        return Ok(());
    }
    let mut has_text = false;
    for param in split_top_level(args, ':')? {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| format!("drawtext option {param:?} has no value"))?;
        match key {
            "text" => has_text = true,
            k if EXPRESSION_KEYS.contains(&k) => {
                let expr = value
                    .strip_prefix('\'')
                    .and_then(|v| v.strip_suffix('\''))
                    .unwrap_or(value);
                Expr::parse(expr).map_err(|e| format!("drawtext {key} expression {expr:?}: {e}"))?;
            }
            _ => {}
        }
    }
    if has_text {
        Ok(())
    } else {
        Err("drawtext without text".into())
    }
}

/// `[in]body[out]` -> (in, body, out)
fn split_labels(segment: &str) -> Option<(&str, &str, &str)> {
    let rest = segment.strip_prefix('[')?;
    let (input, rest) = rest.split_once(']')?;
    let rest = rest.strip_suffix(']')?;
    let open = rest.rfind('[')?;
    let (body, output) = (&rest[..open], &rest[open + 1..]);
    if input.is_empty() || output.is_empty() || output.contains('\'') || body.is_empty() {
        return None;
    }
    Some((input, body, output))
}

fn is_escaped(bytes: &[u8], i: usize) -> bool {
    bytes[..i].iter().rev().take_while(|b| **b == b'\\').count() % 2 == 1
}

/// Split on `sep` outside quotes and parentheses. Fails on an unterminated
/// quote or unbalanced parentheses.
pub(crate) fn split_top_level(s: &str, sep: char) -> Result<Vec<&str>, String> {
    let bytes = s.as_bytes();
    let sep = sep as u8;
    let mut parts = Vec::new();
    let mut in_quote = false;
    let mut depth: i32 = 0;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if is_escaped(bytes, i) {
            continue;
        }
        match b {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unbalanced ')' at offset {i}"));
                }
            }
            _ if b == sep && !in_quote && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quote {
        return Err("unterminated quote".into());
    }
    if depth != 0 {
        return Err("unbalanced '('".into());
    }
    parts.push(&s[start..]);
    Ok(parts)
}

/// Apply the fixed repair rules to every node body: custom font files
/// become the standard font, and `font=`/`text=` values end up properly
/// quoted. Labels and caption sources are kept.
pub fn sanitize(graph: &FilterGraph) -> FilterGraph {
    let nodes = graph
        .nodes
        .iter()
        .map(|node| FilterNode {
            body: sanitize_segment(&node.body),
            ..node.clone()
        })
        .collect();
    FilterGraph { nodes }
}

/// Repair one segment or node body.
pub fn sanitize_segment(segment: &str) -> String {
    let s = replace_font_files(segment);
    let s = close_unterminated(&s);
    quote_bare_values(&s)
}

/// Guard against pathological inputs in the repair loops.
const MAX_REPAIRS: usize = 64;

fn replace_font_files(segment: &str) -> String {
    let mut s = segment.to_string();
    for _ in 0..MAX_REPAIRS {
        let Some(key_start) = find_key(&s, "fontfile") else {
            break;
        };
        let value_start = key_start + "fontfile=".len();
        let value_end = value_end(&s, value_start);
        s.replace_range(key_start..value_end, "font='Arial'");
    }
    s
}

fn close_unterminated(segment: &str) -> String {
    let mut s = segment.to_string();
    for _ in 0..MAX_REPAIRS {
        if count_quotes(&s) % 2 == 0 {
            break;
        }
        let mut fixed = false;
        for key in ["text", "font"] {
            let Some(key_start) = find_key(&s, key) else {
                continue;
            };
            let value_start = key_start + key.len() + 1;
            if s.as_bytes().get(value_start) != Some(&b'\'') {
                continue;
            }
            let boundary = param_boundary(&s, value_start + 1);
            let closed = next_quote(&s, value_start + 1).is_some_and(|q| q < boundary);
            if !closed {
                s.insert(boundary, '\'');
                fixed = true;
                break;
            }
        }
        if !fixed {
            break;
        }
    }
    s
}

fn quote_bare_values(segment: &str) -> String {
    let mut s = segment.to_string();
    for _ in 0..MAX_REPAIRS {
        let bare = ["text", "font"].into_iter().find_map(|key| {
            let key_start = find_key(&s, key)?;
            let value_start = key_start + key.len() + 1;
            (s.as_bytes().get(value_start) != Some(&b'\'')).then_some(value_start)
        });
        let Some(value_start) = bare else {
            break;
        };
        let end = bare_end(&s, value_start);
        let value = &s[value_start..end];
        let quoted = format!("'{}'", escape_stray_quotes(value));
        s.replace_range(value_start..end, &quoted);
    }
    s
}

fn escape_stray_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len() + 2);
    for (i, c) in value.char_indices() {
        if c == '\'' && !is_escaped(bytes, i) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn count_quotes(s: &str) -> usize {
    let bytes = s.as_bytes();
    (0..bytes.len())
        .filter(|&i| bytes[i] == b'\'' && !is_escaped(bytes, i))
        .count()
}

fn next_quote(s: &str, from: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    (from..bytes.len()).find(|&i| bytes[i] == b'\'' && !is_escaped(bytes, i))
}

/// Start of the `key=` option `key` outside quotes, preceded by `=` or `:`.
fn find_key(s: &str, key: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let needle = format!("{key}=");
    let mut in_quote = false;
    for i in 0..bytes.len() {
        if bytes[i] == b'\'' && !is_escaped(bytes, i) {
            in_quote = !in_quote;
            continue;
        }
        if in_quote || i == 0 || !matches!(bytes[i - 1], b'=' | b':') {
            continue;
        }
        if s[i..].starts_with(&needle) {
            return Some(i);
        }
    }
    None
}

/// Where the option value starting at `value_start` ends.
fn value_end(s: &str, value_start: usize) -> usize {
    if s.as_bytes().get(value_start) == Some(&b'\'') {
        match next_quote(s, value_start + 1) {
            Some(q) if q < param_boundary(s, value_start + 1) => q + 1,
            _ => param_boundary(s, value_start + 1),
        }
    } else {
        bare_end(s, value_start)
    }
}

/// End of an unquoted value: next unescaped `:` or `,`, or the output label.
fn bare_end(s: &str, from: usize) -> usize {
    let bytes = s.as_bytes();
    let limit = body_end(s);
    (from..limit)
        .find(|&i| matches!(bytes[i], b':' | b',') && !is_escaped(bytes, i))
        .unwrap_or(limit)
}

/// Next unescaped `:key=` after `from`, or the output label.
fn param_boundary(s: &str, from: usize) -> usize {
    let bytes = s.as_bytes();
    let limit = body_end(s).max(from);
    (from..limit)
        .find(|&i| bytes[i] == b':' && !is_escaped(bytes, i) && starts_option(&s[i + 1..]))
        .unwrap_or(limit)
}

fn starts_option(rest: &str) -> bool {
    let ident_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_lowercase() || *b == b'_')
        .count();
    ident_len > 0 && rest.as_bytes().get(ident_len) == Some(&b'=')
}

/// Offset of a trailing `[label]`, or the end of the string.
fn body_end(s: &str) -> usize {
    if let Some(stripped) = s.strip_suffix(']') {
        if let Some(open) = stripped.rfind('[') {
            if !stripped[open..].contains('\'') {
                return open;
            }
        }
    }
    s.len()
}
