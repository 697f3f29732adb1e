//! Role classification: attach a role (and optional typography) to each
//! detected text region.
//!
//! The classifier answers once per input box, in input order. A per-box
//! `None` means "could not classify" and yields [`Role::Other`]; a wrong
//! number of answers is a contract violation and commits nothing.

use crate::error::ClassificationError;
use crate::geometry::BBox;
use crate::region::{FontWeight, Rgb, Role, Stage, TextCase, TextRegion};
use async_trait::async_trait;
use image::RgbaImage;
use tracing::debug;

/// What a classifier knows about one text box.
///
/// Only `role` is required. Missing typography keeps the detection
/// defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionAnalysis {
    pub role: Role,
    pub text: Option<String>,
    pub font: Option<String>,
    pub weight: Option<FontWeight>,
    pub color: Option<Rgb>,
    pub text_case: Option<TextCase>,
}

impl RegionAnalysis {
    pub fn role(role: Role) -> Self {
        Self {
            role,
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// Role classifier collaborator.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// One entry per box in `boxes`, same order.
    async fn classify(
        &self,
        image: &RgbaImage,
        boxes: &[BBox],
    ) -> Result<Vec<Option<RegionAnalysis>>, ClassificationError>;
}

/// Merge classifier answers into copies of the detected regions.
///
/// Either every region is updated or, on a count mismatch, none is.
pub fn apply_analyses(
    regions: &[TextRegion],
    analyses: Vec<Option<RegionAnalysis>>,
) -> Result<Vec<TextRegion>, ClassificationError> {
    if analyses.len() != regions.len() {
        return Err(ClassificationError::CountMismatch {
            expected: regions.len(),
            got: analyses.len(),
        });
    }

    Ok(regions
        .iter()
        .zip(analyses)
        .map(|(region, analysis)| {
            let mut r = region.clone();
            r.created_by = Stage::Classified;
            match analysis {
                Some(a) => {
                    r.role = a.role;
                    if let Some(text) = a.text {
                        r.text = text.trim().to_string();
                    }
                    if let Some(font) = a.font.filter(|f| !f.trim().is_empty()) {
                        r.font = font.trim().to_string();
                    }
                    if let Some(w) = a.weight {
                        r.weight = w;
                    }
                    if let Some(c) = a.color {
                        r.color = c;
                    }
                    if let Some(tc) = a.text_case {
                        r.text_case = tc;
                    }
                }
                None => {
                    debug!("{}: unclassified, defaulting to Other", r.id);
                    r.role = Role::Other;
                }
            }
            r
        })
        .collect())
}
