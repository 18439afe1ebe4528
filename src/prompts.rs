//! Prompts for vision-LLM text recognition.
//!
//! Every prompt lives here so the wording can change without touching the
//! retry and normalisation logic in [`crate::pipeline::ocr::vision`], and so
//! tests can inspect prompts without a provider.
//!
//! The model is asked for plain text, not Markdown: the layout detector has
//! already decided what kind of block the crop is, and the OCR output only
//! has to supply the words in reading order.

use crate::document::BlockType;

/// System prompt shared by every transcription request.
pub const TRANSCRIBE_SYSTEM_PROMPT: &str = r#"You are a precise OCR engine. The image is a cropped region of a scanned document page.

Transcribe the text exactly as printed:

1. Output ONLY the text visible in the image, nothing else.
2. Keep the visual line breaks: one output line per printed line.
3. Keep reading order: top to bottom, left to right.
4. Do not translate, summarise, correct spelling or complete cut-off words.
5. Do not use Markdown: no #, no **, no backticks, no code fences.
6. If the image contains no legible text, output nothing at all."#;

/// Extra instruction for table regions (one request per table row strip).
pub const TABLE_ROW_INSTRUCTION: &str =
    "The image is one row of a table. Output the cell texts from left to right on a single line, separated by single spaces. Empty cells produce nothing.";

/// Extra instruction for list regions.
pub const LIST_INSTRUCTION: &str =
    "The image is a list. Keep each bullet or number marker at the start of its line.";

/// Region-specific user text accompanying the image, if any.
pub fn region_instruction(hint: BlockType) -> Option<&'static str> {
    match hint {
        BlockType::Table => Some(TABLE_ROW_INSTRUCTION),
        BlockType::List => Some(LIST_INSTRUCTION),
        _ => None,
    }
}
