//! Evidence document construction.
//!
//! Every predicate result becomes one summary document plus bounded
//! per-entity documents, each self-contained: scope header, human-readable
//! body, and the structured counters as JSON metadata.  These are the only
//! records the retrieval index ever sees.

use std::collections::HashSet;

use crate::ladder::engine::RunContext;
use crate::models::{now_ms, EvidenceDocument, Fact, PredicateResult, Verdict};

/// Scope header embedded in every document so a card quoted out of context
/// still identifies its model, vendor, and rule.
pub fn ctx_header(ctx: &RunContext, level: u8, probe_id: &str) -> String {
    format!(
        "[model={} vendor={} {} mml={} probe={}]",
        ctx.model_id, ctx.vendor, ctx.version, level, probe_id
    )
}

/// Build the full evidence set for one ladder run.  Doc ids are
/// deterministic, so re-running the same model replaces rather than
/// accumulates.
pub fn build_evidence(ctx: &RunContext, results: &[PredicateResult]) -> Vec<EvidenceDocument> {
    let ts_ms = now_ms();
    let mut docs: Vec<EvidenceDocument> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for result in results {
        let hdr = ctx_header(ctx, result.level, &result.probe_id);

        let summary = summary_doc(ctx, result, &hdr, ts_ms);
        if seen.insert(summary.doc_id.clone()) {
            docs.push(summary);
        }

        let mut ok_kept = 0usize;
        let mut issue_kept = 0usize;
        for fact in &result.facts {
            let kept = if fact.has_issue { &mut issue_kept } else { &mut ok_kept };
            if *kept >= ctx.fact_bound {
                continue;
            }
            let doc = entity_doc(ctx, result, fact, &hdr, ts_ms);
            if seen.insert(doc.doc_id.clone()) {
                *kept += 1;
                docs.push(doc);
            }
        }
    }

    tracing::info!(
        model_id = %ctx.model_id,
        documents = docs.len(),
        "evidence built"
    );
    docs
}

fn verdict_word(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Passed => "passed",
        Verdict::Failed => "failed",
        Verdict::Missing => "missing",
    }
}

fn summary_doc(
    ctx: &RunContext,
    result: &PredicateResult,
    hdr: &str,
    ts_ms: i64,
) -> EvidenceDocument {
    let word = verdict_word(result.verdict);
    let title = match &result.measure {
        Some(m) => format!("{} {} ({}/{} ok)", result.probe_id, word, m.ok, m.total),
        None => format!("{} {}", result.probe_id, word),
    };

    let mut body = format!("Verdict: {word}.");
    for (key, value) in &result.counts {
        body.push_str(&format!("\n{key} = {value}"));
    }
    if let Some(err) = &result.error {
        body.push_str(&format!("\nDiagnostic: {err}"));
    }

    EvidenceDocument {
        doc_id: format!("{}/{}", ctx.model_id, result.probe_id),
        model_id: ctx.model_id.clone(),
        vendor: ctx.vendor.clone(),
        version: ctx.version.clone(),
        mml: result.level,
        probe_id: result.probe_id.clone(),
        doc_type: "summary".to_string(),
        subject_type: None,
        subject_id: None,
        title,
        ctx_hdr: hdr.to_string(),
        body_text: body,
        // No timings here: identical reruns must produce identical docs.
        metadata: serde_json::json!({
            "verdict": word,
            "counts": result.counts,
            "measure": result.measure,
        }),
        ts_ms,
    }
}

fn entity_doc(
    ctx: &RunContext,
    result: &PredicateResult,
    fact: &Fact,
    hdr: &str,
    ts_ms: i64,
) -> EvidenceDocument {
    let display = if fact.subject_name.is_empty() {
        format!("{} {}", fact.subject_type, fact.subject_id)
    } else {
        format!("{} '{}'", fact.subject_type, fact.subject_name)
    };

    EvidenceDocument {
        doc_id: format!(
            "{}/{}/{}/{}",
            ctx.model_id, result.probe_id, fact.subject_type, fact.subject_id
        ),
        model_id: ctx.model_id.clone(),
        vendor: ctx.vendor.clone(),
        version: ctx.version.clone(),
        mml: result.level,
        probe_id: result.probe_id.clone(),
        doc_type: "entity".to_string(),
        subject_type: Some(fact.subject_type.clone()),
        subject_id: Some(fact.subject_id.clone()),
        title: display.clone(),
        ctx_hdr: hdr.to_string(),
        body_text: entity_body(&result.probe_id, &display, fact),
        metadata: serde_json::json!({
            "has_issue": fact.has_issue,
            "meta": fact.meta,
        }),
        ts_ms,
    }
}

/// Finding / Implication / Action narrative per rule.
fn entity_body(probe_id: &str, display: &str, fact: &Fact) -> String {
    match (probe_id, fact.has_issue) {
        ("mml_1.count_tables", true) => format!(
            "Finding: {display} is absent from the export.\n\
             Implication: rules reading this table cannot be evaluated and report missing.\n\
             Action: re-export the model with the complete table set."
        ),
        ("mml_1.nonempty_names", true) => format!(
            "Finding: {display} has a blank name.\n\
             Implication: the element cannot be referenced in reviews or traces.\n\
             Action: give the element a meaningful name."
        ),
        ("mml_2.block_has_port", true) => format!(
            "Finding: {display} exposes no ports.\n\
             Implication: the block cannot participate in internal connections or interface analysis.\n\
             Action: add at least one port to the block."
        ),
        ("mml_2.block_has_port", false) => {
            let ports = fact.meta.get("ports").cloned().unwrap_or_default();
            format!("Finding: {display} exposes {ports} port(s).")
        }
        ("mml_3.ports_typed", true) => format!(
            "Finding: {display} has no resolvable type.\n\
             Implication: items flowing through the port cannot be checked.\n\
             Action: type the port with an interface block or flow specification."
        ),
        ("mml_3.ports_typed", false) => {
            let via = fact
                .meta
                .get("typed_via")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            format!("Finding: {display} is typed (resolved via {via}).")
        }
        (_, true) => format!("Finding: {display} violates {probe_id}."),
        (_, false) => format!("Finding: {display} satisfies {probe_id}."),
    }
}
