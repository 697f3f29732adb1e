//! Pipeline stages and their collaborator seams.
//!
//! Each submodule owns one step. External models sit behind async traits
//! ([`detect::Detector`], [`classify::Classifier`], [`layer::Layerer`],
//! [`associate::BoxDetector`]) and fonts behind [`fonts::FontResolver`], so
//! the orchestrator and the tests can swap implementations freely.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ detect ──▶ classify ──▶ layer ──▶ associate ──▶ compose
//! (path/URL) (boxes)    (roles)     (rasters)  (box↔text)    (final PNG)
//! ```
//!
//! 1. [`input`]     — resolve a path or URL, sniff and decode to RGBA
//! 2. [`detect`]    — normalise raw detections into `text_N` regions
//! 3. [`classify`]  — merge per-box analyses; [`llm`] is the VLM-backed
//!    classifier, [`encode`] and [`postprocess`] its request/reply helpers
//! 4. [`layer`]     — validate the background / text / UI rasters
//! 5. [`associate`] — find UI boxes and tie each to its tightest text region
//! 6. [`compose`]   — fixed z-order render with per-region font fallback
//!    ([`fonts`])
//!
//! [`remote`] holds HTTP clients for hosted detection and layering models;
//! [`retry`] wraps every external call in a timeout and bounded backoff.

pub mod associate;
pub mod classify;
pub mod compose;
pub mod detect;
pub mod encode;
pub mod fonts;
pub mod input;
pub mod layer;
pub mod llm;
pub mod postprocess;
pub mod remote;
pub mod retry;
