//! SRT import and export for caption lists.
//! Transcripts and third-party subtitle files arrive as SRT; this module
//! turns them into [`Caption`]s and back.

use crate::caption::Caption;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use tracing::{trace, warn};

/// A single SRT block (index, time range, text lines).
#[derive(Debug, Clone, PartialEq)]
pub struct SrtBlock {
    pub index: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: Vec<String>,
}

/// Parse SRT text into blocks, in file order. Blocks are separated by
/// one or more blank lines.
pub fn parse(input: &str) -> Result<Vec<SrtBlock>> {
    let input = input.trim_start_matches('\u{feff}');
    let mut blocks = Vec::new();
    let mut group: Vec<&str> = Vec::new();
    for line in input.lines().map(|l| l.trim_end_matches('\r')).chain([""]) {
        if !line.trim().is_empty() {
            group.push(line);
        } else if !group.is_empty() {
            blocks.push(parse_block(&group)?);
            group.clear();
        }
    }
    Ok(blocks)
}

fn parse_block(lines: &[&str]) -> Result<SrtBlock> {
    let [index_line, time_line, text @ ..] = lines else {
        return Err(anyhow!("block {:?}: missing time line", lines.first().copied().unwrap_or_default()));
    };
    let index: u32 = index_line
        .trim()
        .parse()
        .with_context(|| format!("bad block index {index_line:?}"))?;
    let (start_ms, end_ms) = parse_times(time_line).with_context(|| format!("block {index}"))?;
    Ok(SrtBlock {
        index,
        start_ms,
        end_ms,
        text: text.iter().map(|l| l.to_string()).collect(),
    })
}

/// Format blocks back to SRT text.
pub fn format(blocks: &[SrtBlock]) -> String {
    blocks
        .iter()
        .map(|b| {
            format!(
                "{}\n{} --> {}\n{}\n\n",
                b.index,
                format_time(b.start_ms),
                format_time(b.end_ms),
                b.text.join("\n")
            )
        })
        .collect()
}

/// Turn SRT blocks into captions that all use `preset_id`.
/// Blocks with an empty or inverted time range are dropped.
pub fn to_captions(blocks: &[SrtBlock], preset_id: &str) -> Vec<Caption> {
    blocks
        .iter()
        .filter_map(|b| {
            if b.end_ms <= b.start_ms {
                warn!("dropping SRT block {}: empty time range", b.index);
                return None;
            }
            Some(Caption::new(
                b.start_ms as f64 / 1000.0,
                b.end_ms as f64 / 1000.0,
                b.text.join("\n"),
                preset_id,
            ))
        })
        .collect()
}

/// Number captions 1.. and convert their times to milliseconds.
pub fn from_captions(captions: &[Caption]) -> Vec<SrtBlock> {
    captions
        .iter()
        .enumerate()
        .map(|(i, c)| SrtBlock {
            index: i as u32 + 1,
            start_ms: (c.start.max(0.0) * 1000.0).round() as u64,
            end_ms: (c.end.max(0.0) * 1000.0).round() as u64,
            text: c.text.lines().map(str::to_string).collect(),
        })
        .collect()
}

/// Read an SRT file as captions using `preset_id` for every entry.
pub fn import(path: &Path, preset_id: &str) -> Result<Vec<Caption>> {
    trace!("srt::import(path={}, preset={preset_id})", path.display());
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(to_captions(&parse(&content)?, preset_id))
}

/// Write captions to an SRT file.
pub fn export(path: &Path, captions: &[Caption]) -> Result<()> {
    trace!("srt::export(path={}, count={})", path.display(), captions.len());
    fs::write(path, format(&from_captions(captions)))?;
    Ok(())
}

/// Parse `00:00:01,000 --> 00:00:02,000` into milliseconds.
fn parse_times(line: &str) -> Result<(u64, u64)> {
    let (start, end) = line
        .split_once("-->")
        .ok_or_else(|| anyhow!("no arrow in time line {line:?}"))?;
    Ok((parse_time(start.trim())?, parse_time(end.trim())?))
}

/// Parse `HH:MM:SS,mmm` (or with a dot) into milliseconds. A fraction
/// shorter than three digits is read as a decimal, so `,5` is 500 ms.
fn parse_time(t: &str) -> Result<u64> {
    let (clock, frac) = t
        .rsplit_once([',', '.'])
        .ok_or_else(|| anyhow!("time {t:?} has no milliseconds"))?;
    let fields = clock
        .split(':')
        .map(str::parse::<u64>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("bad time {t:?}"))?;
    let [h, m, s] = fields[..] else {
        return Err(anyhow!("time {t:?} is not HH:MM:SS"));
    };
    if m >= 60 || s >= 60 {
        return Err(anyhow!("time {t:?} has minutes or seconds above 59"));
    }
    if frac.is_empty() || frac.len() > 3 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("time {t:?} has a bad millisecond field"));
    }
    let ms: u64 = format!("{frac:0<3}").parse()?;
    h.checked_mul(3_600_000)
        .and_then(|total| total.checked_add(m * 60_000 + s * 1000 + ms))
        .ok_or_else(|| anyhow!("time {t:?} is out of range"))
}

fn format_time(ms: u64) -> String {
    let secs = ms / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        secs / 3600,
        secs / 60 % 60,
        secs % 60,
        ms % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_crlf_and_multiline_blocks() {
        let input = "\u{feff}1\r\n00:00:01,500 --> 00:00:03.250\r\nHello\r\nthere\r\n\r\n2\r\n00:01:00,000 --> 00:01:02,000\r\nBye\r\n";
        let blocks = parse(input).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].start_ms, 1500);
        assert_eq!(blocks[0].end_ms, 3250);
        assert_eq!(blocks[0].text, vec!["Hello", "there"]);
        assert_eq!(blocks[1].start_ms, 60_000);
    }

    #[test]
    fn rejects_missing_arrow() {
        assert!(parse("1\n00:00:01,000 00:00:02,000\nx\n").is_err());
    }

    #[test]
    fn rejects_malformed_and_huge_times() {
        assert_eq!(parse_time("01:02:03,4").unwrap(), 3_723_400);
        for bad in [
            "99999999999999999:00:00,000",
            "18446744073709551615:00:00,000",
            "00:00:00",
            "00:61:00,000",
            "00:00:00,1234",
            "1:2,000",
            "00:00:0a,000",
        ] {
            assert!(parse_time(bad).is_err(), "{bad}");
        }
        assert!(parse("1\n99999999999999999:00:00,000 --> 99999999999999999:00:01,000\nx\n").is_err());
    }

    #[test]
    fn converts_blocks_to_captions() {
        let blocks = parse("1\n00:00:00,000 --> 00:00:01,000\nHi\n\n2\n00:00:05,000 --> 00:00:05,000\nempty\n").unwrap();
        let captions = to_captions(&blocks, "fadeBottom");
        assert_eq!(captions.len(), 1);
        assert_eq!(captions[0].end, 1.0);
        assert_eq!(captions[0].preset_id, "fadeBottom");
    }

    #[test]
    fn export_writes_numbered_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.srt");
        let captions = vec![
            Caption::new(0.0, 1.0, "Hello", "p"),
            Caption::new(2.0, 3.5, "two\nlines", "p"),
        ];
        export(&path, &captions).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "1\n00:00:00,000 --> 00:00:01,000\nHello\n\n2\n00:00:02,000 --> 00:00:03,500\ntwo\nlines\n\n"
        );
        let back = import(&path, "p").unwrap();
        assert_eq!(back, captions);
    }
}
