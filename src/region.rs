//! The region data model: identities, text and box regions, stages.
//!
//! Region identity is the contract between the pipeline and an editing
//! client. IDs are `{prefix}_{index}` with a per-run monotonic index, so the
//! same detection order always yields the same IDs and an editor can refer
//! to `text_3` across any number of render round trips.

use crate::geometry::BBox;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ── Identity ─────────────────────────────────────────────────────────────

/// What a region ID refers to. The prefix is part of the ID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Text,
    Box,
}

impl RegionKind {
    pub fn prefix(self) -> &'static str {
        match self {
            RegionKind::Text => "text",
            RegionKind::Box => "box",
        }
    }
}

/// Stable region identifier, unique within one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(kind: RegionKind, index: usize) -> Self {
        Self(format!("{}_{}", kind.prefix(), index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric part of the ID, used for deterministic tie-breaks.
    ///
    /// Compared numerically, so `text_9` sorts before `text_10`.
    pub fn index(&self) -> Option<usize> {
        self.0.rsplit_once('_').and_then(|(_, n)| n.parse().ok())
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Hands out `{prefix}_{n}` IDs in call order, starting at 0.
#[derive(Debug)]
pub struct IdAllocator {
    kind: RegionKind,
    next: usize,
}

impl IdAllocator {
    pub fn new(kind: RegionKind) -> Self {
        Self { kind, next: 0 }
    }

    pub fn next_id(&mut self) -> RegionId {
        let id = RegionId::new(self.kind, self.next);
        self.next += 1;
        id
    }
}

// ── Stages ───────────────────────────────────────────────────────────────

/// Pipeline state, ordered. A run "is at" the last stage whose artifacts
/// are all present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Detected,
    Classified,
    Layered,
    BoxesAssociated,
    Composed,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Created,
        Stage::Detected,
        Stage::Classified,
        Stage::Layered,
        Stage::BoxesAssociated,
        Stage::Composed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Detected => "detected",
            Stage::Classified => "classified",
            Stage::Layered => "layered",
            Stage::BoxesAssociated => "boxes_associated",
            Stage::Composed => "composed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == norm || (norm == "boxes" && *st == Stage::BoxesAssociated))
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

// ── Attributes ───────────────────────────────────────────────────────────

/// Semantic role of a text region. Assigned once by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Heading,
    Subheading,
    Body,
    Cta,
    Badge,
    #[default]
    Other,
}

impl Role {
    /// Map a free-form label (as returned by a VLM) onto a role.
    ///
    /// Unknown labels become [`Role::Other`]; classification never fails on
    /// an unrecognised label.
    pub fn parse_lenient(label: &str) -> Role {
        let norm: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match norm.as_str() {
            "heading" | "headline" | "title" | "header" => Role::Heading,
            "subheading" | "subheadline" | "subtitle" | "subhead" => Role::Subheading,
            "body" | "bodytext" | "paragraph" | "usp" | "description" => Role::Body,
            "cta" | "button" | "calltoaction" => Role::Cta,
            "badge" | "tag" | "label" | "sticker" | "price" => Role::Badge,
            _ => Role::Other,
        }
    }
}

/// Font weight on the CSS 100–900 scale, snapped to multiples of 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct FontWeight(u16);

impl FontWeight {
    pub const THIN: FontWeight = FontWeight(100);
    pub const LIGHT: FontWeight = FontWeight(300);
    pub const REGULAR: FontWeight = FontWeight(400);
    pub const MEDIUM: FontWeight = FontWeight(500);
    pub const SEMIBOLD: FontWeight = FontWeight(600);
    pub const BOLD: FontWeight = FontWeight(700);
    pub const BLACK: FontWeight = FontWeight(900);

    /// Snap any number onto the scale (`450 → 500`, `1200 → 900`).
    pub fn snapped(value: f64) -> FontWeight {
        if !value.is_finite() {
            return FontWeight::REGULAR;
        }
        let v = ((value / 100.0).round() * 100.0).clamp(100.0, 900.0);
        FontWeight(v as u16)
    }

    /// Parse a CSS weight name ("semibold", "Extra-Bold", "regular"…).
    pub fn from_name(name: &str) -> Option<FontWeight> {
        let norm: String = name
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect();
        let w = match norm.as_str() {
            "thin" | "hairline" => 100,
            "extralight" | "ultralight" => 200,
            "light" => 300,
            "regular" | "normal" | "book" => 400,
            "medium" => 500,
            "semibold" | "demibold" => 600,
            "bold" => 700,
            "extrabold" | "ultrabold" => 800,
            "black" | "heavy" => 900,
            _ => return None,
        };
        Some(FontWeight(w))
    }

    /// Accept either a number or a weight name, as VLMs return both.
    pub fn parse_lenient(value: &serde_json::Value) -> Option<FontWeight> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(FontWeight::snapped),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .map(FontWeight::snapped)
                .or_else(|| FontWeight::from_name(s)),
            _ => None,
        }
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl Default for FontWeight {
    fn default() -> Self {
        FontWeight::REGULAR
    }
}

impl TryFrom<u16> for FontWeight {
    type Error = String;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        if (100..=900).contains(&v) && v % 100 == 0 {
            Ok(FontWeight(v))
        } else {
            Err(format!("font weight must be a multiple of 100 in 100–900, got {v}"))
        }
    }
}

impl From<FontWeight> for u16 {
    fn from(w: FontWeight) -> u16 {
        w.0
    }
}

impl fmt::Display for FontWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 8-bit RGB colour, serialised as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rrggbb`, `rrggbb` or the short `#rgb` form.
    pub fn from_hex(s: &str) -> Option<Rgb> {
        let hex = s.trim().trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match hex.len() {
            6 => Some(Rgb {
                r: u8::from_str_radix(&hex[0..2], 16).ok()?,
                g: u8::from_str_radix(&hex[2..4], 16).ok()?,
                b: u8::from_str_radix(&hex[4..6], 16).ok()?,
            }),
            3 => {
                let d = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
                Some(Rgb {
                    r: d(0)?,
                    g: d(1)?,
                    b: d(2)?,
                })
            }
            _ => None,
        }
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn to_rgba(self) -> image::Rgba<u8> {
        image::Rgba([self.r, self.g, self.b, 255])
    }
}

impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Rgb::from_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid colour '{s}'")))
    }
}

/// Case transform applied at render time; stored text is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextCase {
    #[default]
    AsIs,
    Upper,
    Lower,
    Title,
}

impl TextCase {
    pub fn parse_lenient(label: &str) -> TextCase {
        match label.trim().to_ascii_lowercase().as_str() {
            "uppercase" | "upper" => TextCase::Upper,
            "lowercase" | "lower" => TextCase::Lower,
            "titlecase" | "title" => TextCase::Title,
            _ => TextCase::AsIs,
        }
    }

    pub fn apply(self, text: &str) -> String {
        match self {
            TextCase::AsIs => text.to_string(),
            TextCase::Upper => text.to_uppercase(),
            TextCase::Lower => text.to_lowercase(),
            TextCase::Title => text
                .split(' ')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

// ── Regions ──────────────────────────────────────────────────────────────

/// An editable text region.
///
/// Created by detection, enriched by classification, afterwards changed
/// only by explicit edits. Regions are never removed from the artifact set:
/// an empty `text` or `removed = true` hides the region from rendering while
/// keeping its ID, role and position addressable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub id: RegionId,
    pub bbox: BBox,
    pub created_by: Stage,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub role: Role,
    pub font: String,
    #[serde(default)]
    pub weight: FontWeight,
    pub color: Rgb,
    #[serde(default)]
    pub text_case: TextCase,
    /// Explicit font size in pixels; derived from bbox height when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
    #[serde(default)]
    pub removed: bool,
}

impl TextRegion {
    /// Whether composition should draw this region.
    pub fn is_visible(&self) -> bool {
        !self.removed && !self.text.is_empty()
    }

    /// Text as it will be drawn (case transform applied).
    pub fn display_text(&self) -> String {
        self.text_case.apply(&self.text)
    }
}

/// A filled background or CTA box.
///
/// `associated_text_id` is a lookup key into the run's text regions, not an
/// owning reference: it may point at a soft-deleted region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRegion {
    pub id: RegionId,
    pub bbox: BBox,
    pub created_by: Stage,
    pub color: Rgb,
    pub associated_text_id: Option<RegionId>,
}
