//! Named style presets and the JSON store they live in.

pub mod font;
pub mod resolve;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

pub use font::{normalize_font_name, resolve_font, CustomFont, FontRegistry, FontResolution};
pub use resolve::{resolve_style, BoxStyle, OutlineStyle, ResolvedStyle};

pub const DEFAULT_FONT: &str = "Arial";
pub const DEFAULT_SIZE: u32 = 24;
pub const DEFAULT_COLOR: &str = "white";
pub const DEFAULT_X: &str = "(w-text_w)/2";
pub const DEFAULT_Y: &str = "h-100";

/// How a caption enters and leaves the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Animation {
    FadeInBottom,
    SlideFromTop,
    FadeIn,
    /// Unknown animation names fall back to this.
    #[default]
    #[serde(other)]
    Appear,
}

/// Every animation kind, in the order editors list them.
pub fn animation_kinds() -> [Animation; 4] {
    [
        Animation::Appear,
        Animation::FadeInBottom,
        Animation::SlideFromTop,
        Animation::FadeIn,
    ]
}

/// A named bundle of style settings. Absent fields take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preset {
    pub font: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub size: u32,
    pub color: String,
    pub x: String,
    pub y: String,
    pub animation: Animation,
    pub background: bool,
    pub bg_color: String,
    /// 0..=100
    #[serde(deserialize_with = "lenient_percent")]
    pub bg_opacity: u8,
    pub outline: bool,
    pub outline_color: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub outline_size: u32,
}

/// Round a JSON number into `[0, max]`; NaN becomes 0.
fn clamp_number(v: f64, max: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.round().clamp(0.0, max)
    }
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u32, D::Error> {
    Ok(clamp_number(f64::deserialize(d)?, f64::from(u32::MAX)) as u32)
}

fn lenient_percent<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u8, D::Error> {
    Ok(clamp_number(f64::deserialize(d)?, 100.0) as u8)
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            font: DEFAULT_FONT.into(),
            size: DEFAULT_SIZE,
            color: DEFAULT_COLOR.into(),
            x: DEFAULT_X.into(),
            y: DEFAULT_Y.into(),
            animation: Animation::Appear,
            background: false,
            bg_color: "black".into(),
            bg_opacity: 50,
            outline: false,
            outline_color: "black".into(),
            outline_size: 2,
        }
    }
}

/// Preset mapping keyed by preset id, optionally backed by a JSON file.
#[derive(Debug, Clone, Default)]
pub struct PresetStore {
    path: Option<PathBuf>,
    presets: BTreeMap<String, Preset>,
    /// Entries of the file that did not parse; written back untouched.
    unreadable: BTreeMap<String, Value>,
}

impl PresetStore {
    /// In-memory store with no backing file.
    pub fn from_map(presets: BTreeMap<String, Preset>) -> Self {
        Self {
            presets,
            ..Self::default()
        }
    }

    /// Load presets from `path`. A missing file is created with the
    /// built-in presets. A file that is not a JSON object is left alone and
    /// the built-ins are used in memory only. Single entries that fail to
    /// parse are skipped but kept on disk.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        trace!("PresetStore::load_or_default(path={})", path.display());
        if !path.exists() {
            debug!("creating default presets at {}", path.display());
            let store = Self {
                path: Some(path.to_path_buf()),
                ..Self::from_map(builtin_presets())
            };
            store.save()?;
            return Ok(store);
        }
        let raw = match read_raw(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "could not load presets from {}: {e:#}; using built-in presets without saving",
                    path.display()
                );
                return Ok(Self::from_map(builtin_presets()));
            }
        };
        let mut store = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };
        for (id, value) in raw {
            match serde_json::from_value::<Preset>(value.clone()) {
                Ok(preset) => {
                    store.presets.insert(id, preset);
                }
                Err(e) => {
                    warn!("skipping preset {id:?} in {}: {e}", path.display());
                    store.unreadable.insert(id, value);
                }
            }
        }
        Ok(store)
    }

    pub fn get(&self, id: &str) -> Option<&Preset> {
        self.presets.get(id)
    }

    /// Add a new preset; fails when the id is taken.
    pub fn insert(&mut self, id: &str, preset: Preset) -> Result<()> {
        if self.presets.contains_key(id) {
            return Err(anyhow!("preset {id:?} already exists"));
        }
        self.unreadable.remove(id);
        self.presets.insert(id.to_string(), preset);
        self.save()
    }

    /// Replace an existing preset; fails when the id is unknown.
    pub fn update(&mut self, id: &str, preset: Preset) -> Result<()> {
        let slot = self
            .presets
            .get_mut(id)
            .ok_or_else(|| anyhow!("preset {id:?} does not exist"))?;
        *slot = preset;
        self.save()
    }

    pub fn remove(&mut self, id: &str) -> Result<Preset> {
        let removed = self
            .presets
            .remove(id)
            .ok_or_else(|| anyhow!("preset {id:?} does not exist"))?;
        self.save()?;
        Ok(removed)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }

    /// Write the store back to its file; a no-op for in-memory stores.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut out = self.unreadable.clone();
        for (id, preset) in &self.presets {
            out.insert(id.clone(), serde_json::to_value(preset)?);
        }
        fs::write(path, serde_json::to_string_pretty(&out)?)
            .with_context(|| format!("writing presets to {}", path.display()))?;
        Ok(())
    }
}

fn read_raw(path: &Path) -> Result<BTreeMap<String, Value>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// The presets shipped with the tool.
pub fn builtin_presets() -> BTreeMap<String, Preset> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "fadeBottom".to_string(),
        Preset {
            size: 36,
            animation: Animation::FadeInBottom,
            ..Preset::default()
        },
    );
    presets.insert(
        "topSlide".to_string(),
        Preset {
            font: "Verdana".into(),
            color: "yellow".into(),
            y: "50".into(),
            animation: Animation::SlideFromTop,
            ..Preset::default()
        },
    );
    presets.insert(
        "centerBold".to_string(),
        Preset {
            font: "Arial Black".into(),
            size: 42,
            color: "#ffffff".into(),
            y: "(h-text_h)/2".into(),
            ..Preset::default()
        },
    );
    presets
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_fields_take_defaults() {
        let preset: Preset = serde_json::from_str(r#"{"size": 36, "animation": "fadeInBottom"}"#).unwrap();
        assert_eq!(preset.font, "Arial");
        assert_eq!(preset.size, 36);
        assert_eq!(preset.y, "h-100");
        assert_eq!(preset.animation, Animation::FadeInBottom);
        assert!(!preset.background);
    }

    #[test]
    fn unknown_animation_is_appear() {
        let preset: Preset = serde_json::from_str(r#"{"animation": "spin"}"#).unwrap();
        assert_eq!(preset.animation, Animation::Appear);
        for kind in animation_kinds() {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(serde_json::from_str::<Animation>(&json).unwrap(), kind);
        }
        assert_eq!(serde_json::to_string(&Animation::FadeInBottom).unwrap(), "\"fadeInBottom\"");
    }

    #[test]
    fn creates_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("presets").join("presets.json");
        let store = PresetStore::load_or_default(&path).unwrap();
        assert_eq!(store.ids(), vec!["centerBold", "fadeBottom", "topSlide"]);
        assert!(path.exists());
        let again = PresetStore::load_or_default(&path).unwrap();
        assert_eq!(again.get("topSlide"), store.get("topSlide"));
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("presets.json");
        fs::write(&path, "{ not json").unwrap();
        let mut store = PresetStore::load_or_default(&path).unwrap();
        assert!(store.get("fadeBottom").is_some());
        store.insert("mine", Preset::default()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn out_of_range_numbers_are_clamped() {
        let preset: Preset =
            serde_json::from_str(r#"{"size": 36.6, "bgOpacity": 250, "outlineSize": -3}"#).unwrap();
        assert_eq!(preset.size, 37);
        assert_eq!(preset.bg_opacity, 100);
        assert_eq!(preset.outline_size, 0);
    }

    #[test]
    fn user_presets_survive_a_bad_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("presets.json");
        fs::write(
            &path,
            r#"{"mine": {"size": 48, "bgOpacity": 120}, "broken": {"size": "big"}}"#,
        )
        .unwrap();
        let mut store = PresetStore::load_or_default(&path).unwrap();
        assert_eq!(store.ids(), vec!["mine"]);
        assert_eq!(store.get("mine").unwrap().bg_opacity, 100);
        assert!(store.get("fadeBottom").is_none());

        store.insert("other", Preset::default()).unwrap();
        let saved: BTreeMap<String, Value> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["broken"], serde_json::json!({"size": "big"}));
        assert!(saved.contains_key("mine") && saved.contains_key("other"));
    }

    #[test]
    fn insert_update_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("presets.json");
        let mut store = PresetStore::load_or_default(&path).unwrap();
        store.insert("mine", Preset::default()).unwrap();
        assert!(store.insert("mine", Preset::default()).is_err());
        let big = Preset {
            size: 60,
            ..Preset::default()
        };
        store.update("mine", big.clone()).unwrap();
        assert!(store.update("other", Preset::default()).is_err());
        let reloaded = PresetStore::load_or_default(&path).unwrap();
        assert_eq!(reloaded.get("mine"), Some(&big));
        store.remove("mine").unwrap();
        assert!(store.remove("mine").is_err());
    }
}
