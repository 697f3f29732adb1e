//! Prompts for the VLM role classifier.
//!
//! Kept in one place so prompt changes never touch the request or parsing
//! code in [`crate::pipeline::llm`], and so tests can inspect them directly.

/// System prompt for classifying a batch of text-region crops.
///
/// The user turn carries the crops as image attachments, in region order.
/// [`region_count_hint`] is appended so the model knows how many objects
/// to return.
pub const CLASSIFY_SYSTEM_PROMPT: &str = r##"You are given image regions cropped from a single product or advertising image.
Each image contains exactly one block of text.

For EACH image, in the order given, analyse:

1. TEXT
   - Read the exact visible text, preserving the original casing

2. ROLE (one of)
   - "heading": the main headline
   - "subheading": secondary headline
   - "body": descriptive copy, feature lists, USPs
   - "cta": call-to-action buttons or links ("Shop now", "Buy")
   - "badge": small labels, stickers, prices ("New", "50% off")
   - "other": product text, logos, anything else

3. TYPOGRAPHY
   - "font": the closest Google Fonts family
   - "font_weight": a NUMBER from 100 to 900 in steps of 100, judged by
     stroke thickness relative to letter height (400 regular, 700 bold)
   - "text_case": "uppercase", "lowercase", "titlecase" or "asis"
   - "text_color": the primary text colour as "#rrggbb"

OUTPUT FORMAT
   - Return ONLY a JSON array with exactly one object per image
   - Each object has the keys: text, role, font, font_weight, text_case, text_color
   - The array order must match the image order
   - Use null for any field you cannot determine
   - Do NOT wrap the array in fences and do NOT add commentary"##;

/// Tell the model how many crops the request contains.
pub fn region_count_hint(count: usize) -> String {
    format!("There are {count} images. Return a JSON array of exactly {count} objects.")
}
