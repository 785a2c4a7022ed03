//! Timed caption entries and their JSON file format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::trace;

/// One timed caption as recorded by the surrounding application.
/// Times are seconds from the start of the input video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caption {
    pub start: f64,
    pub end: f64,
    pub text: String,
    /// Older caption files store this under `preset`.
    #[serde(alias = "preset")]
    pub preset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub auto_generated: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptionError {
    #[error("caption times must be finite (start={start}, end={end})")]
    NonFinite { start: f64, end: f64 },
    #[error("caption must satisfy 0 <= start < end (start={start}, end={end})")]
    BadRange { start: f64, end: f64 },
}

impl Caption {
    pub fn new(start: f64, end: f64, text: impl Into<String>, preset_id: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            preset_id: preset_id.into(),
            language: None,
            auto_generated: false,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Check the `0 <= start < end` invariant.
    pub fn validate(&self) -> Result<(), CaptionError> {
        let (start, end) = (self.start, self.end);
        if !start.is_finite() || !end.is_finite() {
            return Err(CaptionError::NonFinite { start, end });
        }
        if start < 0.0 || start >= end {
            return Err(CaptionError::BadRange { start, end });
        }
        Ok(())
    }

    /// Copy of this caption moved so that `origin` becomes time zero.
    pub fn rebased(&self, origin: f64) -> Self {
        Self {
            start: (self.start - origin).max(0.0),
            end: self.end - origin,
            ..self.clone()
        }
    }
}

/// Read a JSON caption list.
pub fn load_captions(path: &Path) -> Result<Vec<Caption>> {
    trace!("load_captions(path={})", path.display());
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading captions from {}", path.display()))?;
    let captions = serde_json::from_str(&content)
        .with_context(|| format!("parsing captions in {}", path.display()))?;
    Ok(captions)
}

/// Write a caption list as pretty JSON.
pub fn save_captions(path: &Path, captions: &[Caption]) -> Result<()> {
    trace!("save_captions(path={}, count={})", path.display(), captions.len());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(captions)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validates_range() {
        assert!(Caption::new(0.0, 5.0, "a", "p").validate().is_ok());
        assert!(matches!(
            Caption::new(3.0, 3.0, "a", "p").validate(),
            Err(CaptionError::BadRange { .. })
        ));
        assert!(matches!(
            Caption::new(-1.0, 3.0, "a", "p").validate(),
            Err(CaptionError::BadRange { .. })
        ));
        assert!(matches!(
            Caption::new(0.0, f64::NAN, "a", "p").validate(),
            Err(CaptionError::NonFinite { .. })
        ));
    }

    #[test]
    fn accepts_legacy_preset_key() {
        let json = r#"[{"start":1.0,"end":2.5,"text":"Hi","preset":"fadeBottom"}]"#;
        let captions: Vec<Caption> = serde_json::from_str(json).unwrap();
        assert_eq!(captions[0].preset_id, "fadeBottom");
        assert!(!captions[0].auto_generated);
        assert_eq!(captions[0].language, None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("captions.json");
        let mut caption = Caption::new(0.0, 1.5, "Hello: world", "p1");
        caption.language = Some("en".into());
        caption.auto_generated = true;
        save_captions(&path, &[caption.clone()]).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"presetId\""));
        assert_eq!(load_captions(&path).unwrap(), vec![caption]);
    }

    #[test]
    fn rebase_moves_to_origin() {
        let caption = Caption::new(12.0, 15.0, "x", "p").rebased(12.0);
        assert_eq!((caption.start, caption.end), (0.0, 3.0));
    }
}
