//! Font resolution for text rendering.
//!
//! [`DirectoryFontResolver`] indexes a directory of `.ttf`/`.otf` files
//! named the usual way (`Roboto-Bold.ttf`, `OpenSans-SemiBold.ttf`,
//! `Inter-700.otf`, `Lato.ttf`) and serves the closest weight within the
//! requested family. Italic faces are ignored. Loaded fonts are cached.

use crate::region::FontWeight;
use ab_glyph::FontArc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum FontError {
    #[error("no font installed for family '{family}'")]
    FamilyNotFound { family: String },

    #[error("font file '{path}' could not be loaded: {detail}")]
    Invalid { path: PathBuf, detail: String },
}

/// A loaded font face.
#[derive(Clone)]
pub struct FontHandle {
    pub family: String,
    pub weight: FontWeight,
    pub font: FontArc,
}

impl std::fmt::Debug for FontHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontHandle")
            .field("family", &self.family)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Font resolver collaborator.
pub trait FontResolver: Send + Sync {
    fn resolve(&self, family: &str, weight: FontWeight) -> Result<FontHandle, FontError>;
}

/// Lower-case alphanumerics only: "Open Sans" and "OpenSans" match.
pub fn family_key(family: &str) -> String {
    family
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Split a font file stem into (family key, weight).
///
/// Returns `None` for italic faces and unrecognised style suffixes.
pub fn parse_font_stem(stem: &str) -> Option<(String, FontWeight)> {
    let (family, style) = match stem.rsplit_once('-') {
        Some((f, s)) => (f, s),
        None => (stem, "Regular"),
    };
    let style_key = family_key(style);
    if style_key.contains("italic") || style_key.contains("oblique") {
        return None;
    }
    let weight = FontWeight::from_name(style)
        .or_else(|| style.parse::<f64>().ok().map(FontWeight::snapped))?;
    let key = family_key(family);
    (!key.is_empty()).then_some((key, weight))
}

#[derive(Debug, Clone)]
struct FontFile {
    weight: FontWeight,
    path: PathBuf,
}

/// Serves fonts from a directory, nearest weight within a family.
pub struct DirectoryFontResolver {
    families: HashMap<String, Vec<FontFile>>,
    cache: Mutex<HashMap<PathBuf, FontArc>>,
}

impl DirectoryFontResolver {
    /// Index every font file directly under `dir`.
    ///
    /// A missing or unreadable directory yields an empty resolver; every
    /// lookup then fails and composition reports the affected regions.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut families: HashMap<String, Vec<FontFile>> = HashMap::new();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let ext = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| e.to_ascii_lowercase());
                    if !matches!(ext.as_deref(), Some("ttf") | Some("otf")) {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    if let Some((key, weight)) = parse_font_stem(stem) {
                        families.entry(key).or_default().push(FontFile { weight, path });
                    }
                }
            }
            Err(e) => warn!("Font directory {} unreadable: {}", dir.display(), e),
        }
        for files in families.values_mut() {
            files.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.path.cmp(&b.path)));
        }
        debug!("Indexed {} font families in {}", families.len(), dir.display());
        Self {
            families,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn family_count(&self) -> usize {
        self.families.len()
    }

    fn load(&self, path: &Path) -> Result<FontArc, FontError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(font) = cache.get(path) {
                return Ok(font.clone());
            }
        }
        let bytes = std::fs::read(path).map_err(|e| FontError::Invalid {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let font = FontArc::try_from_vec(bytes).map_err(|e| FontError::Invalid {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_path_buf(), font.clone());
        }
        Ok(font)
    }
}

impl FontResolver for DirectoryFontResolver {
    fn resolve(&self, family: &str, weight: FontWeight) -> Result<FontHandle, FontError> {
        let files = self
            .families
            .get(&family_key(family))
            .ok_or_else(|| FontError::FamilyNotFound {
                family: family.to_string(),
            })?;
        // Nearest weight; on a tie the lighter face wins.
        let best = files
            .iter()
            .min_by_key(|f| ((f.weight.value() as i32 - weight.value() as i32).abs(), f.weight))
            .ok_or_else(|| FontError::FamilyNotFound {
                family: family.to_string(),
            })?;
        if best.weight != weight {
            debug!("{} {} served by weight {}", family, weight, best.weight);
        }
        Ok(FontHandle {
            family: family.to_string(),
            weight: best.weight,
            font: self.load(&best.path)?,
        })
    }
}

/// Fonts registered from memory.
#[derive(Default, Clone)]
pub struct MemoryFontResolver {
    fonts: HashMap<String, Vec<(FontWeight, FontArc)>>,
}

impl MemoryFontResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: &str, weight: FontWeight, bytes: Vec<u8>) -> Result<(), FontError> {
        let font = FontArc::try_from_vec(bytes).map_err(|e| FontError::Invalid {
            path: PathBuf::from(format!("<memory:{family}>")),
            detail: e.to_string(),
        })?;
        self.fonts.entry(family_key(family)).or_default().push((weight, font));
        Ok(())
    }
}

impl FontResolver for MemoryFontResolver {
    fn resolve(&self, family: &str, weight: FontWeight) -> Result<FontHandle, FontError> {
        self.fonts
            .get(&family_key(family))
            .and_then(|faces| {
                faces
                    .iter()
                    .min_by_key(|(w, _)| ((w.value() as i32 - weight.value() as i32).abs(), *w))
            })
            .map(|(w, font)| FontHandle {
                family: family.to_string(),
                weight: *w,
                font: font.clone(),
            })
            .ok_or_else(|| FontError::FamilyNotFound {
                family: family.to_string(),
            })
    }
}

/// A resolver with nothing installed.
pub struct NoFonts;

impl FontResolver for NoFonts {
    fn resolve(&self, family: &str, _weight: FontWeight) -> Result<FontHandle, FontError> {
        Err(FontError::FamilyNotFound {
            family: family.to_string(),
        })
    }
}
