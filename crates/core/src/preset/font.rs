//! Font lookup: user-registered font files first, then a fixed set of
//! standard names the engine can always resolve.

use crate::escape::escape_path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Aliases for common non-portable font names. Checked before the
/// standard list.
const FONT_ALIASES: &[(&str, &str)] = &[
    ("Arial Black", "Arial"),
    ("Helvetica", "Arial"),
    ("Times", "Times New Roman"),
    ("Courier", "Courier New"),
    ("Monospace", "Consolas"),
    ("Sans", "Arial"),
    ("Sans-Serif", "Arial"),
    ("Serif", "Times New Roman"),
];

const STANDARD_FONTS: &[&str] = &[
    "Arial",
    "Verdana",
    "Tahoma",
    "Times New Roman",
    "Georgia",
    "Courier New",
    "Impact",
    "Consolas",
    "Trebuchet MS",
];

/// A font file registered by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFont {
    pub name: String,
    pub file_name: String,
    pub absolute_path: PathBuf,
}

/// Snapshot of the user's custom fonts, keyed by font name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FontRegistry {
    fonts: BTreeMap<String, CustomFont>,
}

/// Result of [`FontRegistry::lookup`]; `exists` is checked at lookup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontLookup {
    pub path: PathBuf,
    pub exists: bool,
}

impl FontRegistry {
    pub fn new(fonts: impl IntoIterator<Item = CustomFont>) -> Self {
        Self {
            fonts: fonts.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    /// Load a JSON array of custom font entries.
    pub fn load(path: &Path) -> Result<Self> {
        trace!("FontRegistry::load(path={})", path.display());
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading font registry {}", path.display()))?;
        let fonts: Vec<CustomFont> = serde_json::from_str(&content)
            .with_context(|| format!("parsing font registry {}", path.display()))?;
        Ok(Self::new(fonts))
    }

    pub fn lookup(&self, name: &str) -> Option<FontLookup> {
        self.fonts.get(name).map(|f| FontLookup {
            exists: f.absolute_path.is_file(),
            path: f.absolute_path.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }
}

/// How the drawtext node should reference its font.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontResolution {
    pub is_custom: bool,
    /// Escaped, forward-slash path; set only for custom fonts.
    pub path: Option<String>,
    pub name: String,
}

impl FontResolution {
    /// The standard fallback font.
    pub fn standard(name: &str) -> Self {
        Self {
            is_custom: false,
            path: None,
            name: name.to_string(),
        }
    }
}

/// Map a requested font name to something the engine can load.
/// A registered font whose file is gone is treated as unregistered.
pub fn resolve_font(name: &str, registry: &FontRegistry) -> FontResolution {
    if let Some(found) = registry.lookup(name) {
        if found.exists {
            return FontResolution {
                is_custom: true,
                path: Some(escape_path(&found.path.to_string_lossy())),
                name: name.to_string(),
            };
        }
        warn!(
            "custom font {name:?} points at missing file {}",
            found.path.display()
        );
    }
    FontResolution::standard(normalize_font_name(name))
}

/// Alias table first, then the standard list, else the default font.
pub fn normalize_font_name(name: &str) -> &'static str {
    if let Some((_, target)) = FONT_ALIASES.iter().find(|(alias, _)| *alias == name) {
        return *target;
    }
    STANDARD_FONTS
        .iter()
        .find(|f| **f == name)
        .copied()
        .unwrap_or(super::DEFAULT_FONT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn normalizes_aliases_and_unknowns() {
        assert_eq!(normalize_font_name("Arial Black"), "Arial");
        assert_eq!(normalize_font_name("Helvetica"), "Arial");
        assert_eq!(normalize_font_name("Times"), "Times New Roman");
        assert_eq!(normalize_font_name("Monospace"), "Consolas");
        assert_eq!(normalize_font_name("Sans-Serif"), "Arial");
        assert_eq!(normalize_font_name("Georgia"), "Georgia");
        assert_eq!(normalize_font_name("Comic Whatever"), "Arial");
    }

    #[test]
    fn custom_font_with_file_resolves_to_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("Brand.ttf");
        fs::write(&file, b"ttf").unwrap();
        let registry = FontRegistry::new([CustomFont {
            name: "Brand".into(),
            file_name: "Brand.ttf".into(),
            absolute_path: file.clone(),
        }]);
        let res = resolve_font("Brand", &registry);
        assert!(res.is_custom);
        assert_eq!(res.path, Some(escape_path(&file.to_string_lossy())));
    }

    #[test]
    fn deleted_custom_font_falls_back() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("Gone.ttf");
        fs::write(&file, b"ttf").unwrap();
        let registry = FontRegistry::new([CustomFont {
            name: "Gone".into(),
            file_name: "Gone.ttf".into(),
            absolute_path: file.clone(),
        }]);
        fs::remove_file(&file).unwrap();
        assert_eq!(resolve_font("Gone", &registry), FontResolution::standard("Arial"));
    }

    #[test]
    fn loads_registry_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fonts.json");
        fs::write(
            &path,
            r#"[{"name":"Brand","fileName":"Brand.ttf","absolutePath":"/nowhere/Brand.ttf"}]"#,
        )
        .unwrap();
        let registry = FontRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup("Brand"),
            Some(FontLookup {
                path: PathBuf::from("/nowhere/Brand.ttf"),
                exists: false
            })
        );
    }
}
