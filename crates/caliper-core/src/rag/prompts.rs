//! Prompt assembly and the deterministic no-LLM fallback.

use crate::rag::guards::{MAX_CARDS, PROMPT_TOKEN_BUDGET};
use crate::rag::retrieve::RetrievedDoc;
use crate::rag::tokenizer::estimate_tokens;

/// Build the grounded prompt: instructions, evidence cards, question.
/// Cards are capped at [`MAX_CARDS`] and trimmed to the token budget, best
/// ranked first.
pub fn build_prompt(question: &str, docs: &[RetrievedDoc]) -> String {
    let mut prompt = String::from(
        "You are an MBSE model-maturity assistant. Answer the question using \
         ONLY the evidence cards below. Cite every claim with the card's \
         bracketed id, e.g. [abcd1234/mml_2.block_has_port]. If the evidence \
         does not answer the question, say so explicitly.\n\nEvidence:\n",
    );

    let mut budget = PROMPT_TOKEN_BUDGET;
    let mut cards = 0usize;
    for doc in docs {
        if cards >= MAX_CARDS {
            break;
        }
        let card = format!(
            "[{}] {}\n{}\n{}\n\n",
            doc.doc_id, doc.title, doc.ctx_hdr, doc.body_text
        );
        let cost = estimate_tokens(&card);
        if cost > budget && cards > 0 {
            tracing::debug!(doc_id = %doc.doc_id, "card dropped: prompt budget exhausted");
            break;
        }
        budget = budget.saturating_sub(cost);
        prompt.push_str(&card);
        cards += 1;
    }

    prompt.push_str(&format!("Question: {question}\nAnswer:"));
    prompt
}

/// Deterministic summary used when the provider is unavailable or returns a
/// blank answer.  Built verbatim from retrieved cards, so every citation it
/// emits is grounded by construction.
pub fn simple_summarize(question: &str, docs: &[RetrievedDoc]) -> String {
    if docs.is_empty() {
        return format!("No indexed evidence is available to answer: {question}");
    }
    let mut out = String::from("Answer assembled from indexed evidence (no language model):\n");
    for doc in docs.iter().take(MAX_CARDS) {
        let first_line = doc.body_text.lines().next().unwrap_or("");
        out.push_str(&format!("- {} {} [{}]\n", doc.title, first_line, doc.doc_id));
    }
    out
}
