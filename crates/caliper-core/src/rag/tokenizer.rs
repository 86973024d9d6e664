//! Cheap token estimation for prompt budgeting.

/// Estimated LLM tokens for `text`.  Uses the ~3.5 chars/token heuristic;
/// close enough for budget trimming without pulling in a real tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    ((text.len() as f64 / 3.5).ceil() as usize).max(1)
}
