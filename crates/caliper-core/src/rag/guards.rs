//! Input clamps for the question-answering surface.

use crate::errors::{CaliperError, CaliperResult};

pub const MAX_QUESTION_LEN: usize = 512;
pub const DEFAULT_TOP_K: usize = 8;
pub const MAX_TOP_K: usize = 50;
/// Max evidence cards assembled into one prompt.
pub const MAX_CARDS: usize = 8;
/// Token budget for the evidence section of a prompt.
pub const PROMPT_TOKEN_BUDGET: usize = 3072;

/// Trim and bound a question.  Empty questions are an error; overlong ones
/// are truncated at a char boundary with a warning.
pub fn clamp_question(question: &str) -> CaliperResult<String> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(CaliperError::Query("question is empty".to_string()));
    }
    if trimmed.len() <= MAX_QUESTION_LEN {
        return Ok(trimmed.to_string());
    }
    let mut cut = MAX_QUESTION_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    tracing::warn!(
        original_len = trimmed.len(),
        clamped_len = cut,
        "question truncated"
    );
    Ok(trimmed[..cut].to_string())
}

/// Normalize a requested result count: 0 means the default, anything above
/// the cap is clamped.
pub fn clamp_top_k(top_k: usize) -> usize {
    if top_k == 0 {
        DEFAULT_TOP_K
    } else {
        top_k.min(MAX_TOP_K)
    }
}
