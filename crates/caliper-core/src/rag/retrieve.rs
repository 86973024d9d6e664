//! Evidence retrieval with graceful degradation.
//!
//! Pass 1 is a bm25-ranked FTS match; when that yields nothing the retriever
//! falls back to recent summary documents, then to any recent documents.
//! Every response is tagged with the mode that produced it so callers can
//! tell a scored hit from a fallback.

use std::sync::OnceLock;

use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::errors::CaliperResult;
use crate::store::{database::fts_available, Store};

/// Query words carrying no retrieval signal.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "if", "then", "else", "of", "for", "to", "in", "on",
    "at", "is", "are", "was", "were", "be", "been", "being", "do", "does", "did", "doing",
    "what", "which", "who", "whom", "whose", "why", "how", "should", "would", "could", "can",
    "we", "you", "i",
];

/// Max tokens carried into one MATCH expression.
const MAX_MATCH_TOKENS: usize = 8;
/// Tokens at least this long get a prefix wildcard.
const PREFIX_MIN_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalMode {
    /// bm25-ranked FTS hits.
    Scored,
    /// No FTS hit; recent summary documents returned instead.
    FallbackSummaries,
    /// No summaries either; any recent documents.
    FallbackAny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDoc {
    pub doc_id: String,
    pub title: String,
    pub ctx_hdr: String,
    pub body_text: String,
    pub doc_type: String,
    pub probe_id: String,
    /// bm25 rank for scored hits; absent for fallback passes.
    pub score: Option<f64>,
}

/// Optional narrowing of the searched documents.
#[derive(Debug, Clone, Default)]
pub struct RetrievalScope {
    pub probe_id: Option<String>,
    pub mml: Option<u8>,
}

impl RetrievalScope {
    fn is_set(&self) -> bool {
        self.probe_id.is_some() || self.mml.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Retrieval {
    pub docs: Vec<RetrievedDoc>,
    pub mode: RetrievalMode,
    /// Diagnosis when nothing was found: distinguishes an empty index from a
    /// scope that matches nothing.
    pub hint: Option<String>,
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9_]+").unwrap())
}

/// Turn a free-text question into an FTS5 MATCH expression: lowercase,
/// stopwords dropped, capped token count, prefix wildcards on longer tokens,
/// OR-joined.  Returns `None` when nothing queryable remains.
pub fn build_match(question: &str) -> Option<String> {
    let lowered = question.to_lowercase();
    let mut tokens: Vec<String> = Vec::new();
    for m in token_re().find_iter(&lowered) {
        let token = m.as_str();
        if STOPWORDS.contains(&token) || tokens.iter().any(|t| t.trim_end_matches('*') == token) {
            continue;
        }
        if token.len() >= PREFIX_MIN_LEN {
            tokens.push(format!("{token}*"));
        } else {
            tokens.push(token.to_string());
        }
        if tokens.len() >= MAX_MATCH_TOKENS {
            break;
        }
    }
    if tokens.is_empty() {
        return None;
    }
    let mut expr = tokens.join(" OR ");
    // The dominant question shape gets a phrase boost.
    if lowered.contains("missing") && lowered.contains("ports") {
        expr = format!("\"missing ports\" OR {expr}");
    }
    Some(expr)
}

/// Retrieve up to `top_k` documents for `question`.
pub fn retrieve(
    store: &Store,
    question: &str,
    top_k: usize,
    scope: &RetrievalScope,
) -> CaliperResult<Retrieval> {
    let conn = store.connect()?;

    if fts_available(&conn) {
        if let Some(expr) = build_match(question) {
            let docs = scored_pass(&conn, &expr, top_k, scope)?;
            if !docs.is_empty() {
                return Ok(Retrieval {
                    docs,
                    mode: RetrievalMode::Scored,
                    hint: None,
                });
            }
        }
    }

    let summaries = recency_pass(&conn, top_k, scope, true)?;
    if !summaries.is_empty() {
        tracing::debug!(question, "no scored hits; returning recent summaries");
        return Ok(Retrieval {
            docs: summaries,
            mode: RetrievalMode::FallbackSummaries,
            hint: None,
        });
    }

    let any = recency_pass(&conn, top_k, scope, false)?;
    if !any.is_empty() {
        return Ok(Retrieval {
            docs: any,
            mode: RetrievalMode::FallbackAny,
            hint: None,
        });
    }

    Ok(Retrieval {
        docs: Vec::new(),
        mode: RetrievalMode::FallbackAny,
        hint: Some(diagnose_empty(&conn, scope)?),
    })
}

/// Scope filter SQL with explicitly numbered placeholders starting at
/// `first_idx`, so callers can mix it with their own numbered parameters.
fn scope_sql(scope: &RetrievalScope, first_idx: usize) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut sql = String::new();
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    let mut idx = first_idx;
    if let Some(probe_id) = &scope.probe_id {
        sql.push_str(&format!(" AND d.probe_id = ?{idx}"));
        binds.push(Box::new(probe_id.clone()));
        idx += 1;
    }
    if let Some(mml) = scope.mml {
        sql.push_str(&format!(" AND d.mml = ?{idx}"));
        binds.push(Box::new(mml as i64));
    }
    (sql, binds)
}

fn scored_pass(
    conn: &Connection,
    expr: &str,
    top_k: usize,
    scope: &RetrievalScope,
) -> CaliperResult<Vec<RetrievedDoc>> {
    let (scope_clause, scope_binds) = scope_sql(scope, 3);
    let sql = format!(
        "SELECT d.doc_id, d.title, d.ctx_hdr, d.body_text, d.doc_type, d.probe_id,
                bm25(evidence_fts) AS rank
         FROM evidence_fts f
         JOIN evidence_doc d ON d.doc_id = f.doc_id
         WHERE evidence_fts MATCH ?1{scope_clause}
         ORDER BY rank ASC, d.doc_id
         LIMIT ?2;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(expr.to_string())];
    binds.push(Box::new(top_k as i64));
    binds.extend(scope_binds);
    let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())), |row| {
        Ok(RetrievedDoc {
            doc_id: row.get(0)?,
            title: row.get(1)?,
            ctx_hdr: row.get(2)?,
            body_text: row.get(3)?,
            doc_type: row.get(4)?,
            probe_id: row.get(5)?,
            score: Some(row.get(6)?),
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn recency_pass(
    conn: &Connection,
    top_k: usize,
    scope: &RetrievalScope,
    summaries_only: bool,
) -> CaliperResult<Vec<RetrievedDoc>> {
    let (scope_clause, scope_binds) = scope_sql(scope, 2);
    let type_clause = if summaries_only {
        " AND d.doc_type = 'summary'"
    } else {
        ""
    };
    let sql = format!(
        "SELECT d.doc_id, d.title, d.ctx_hdr, d.body_text, d.doc_type, d.probe_id
         FROM evidence_doc d
         WHERE 1 = 1{type_clause}{scope_clause}
         ORDER BY d.ts_ms DESC, d.doc_id
         LIMIT ?1;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(top_k as i64)];
    binds.extend(scope_binds);
    let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())), |row| {
        Ok(RetrievedDoc {
            doc_id: row.get(0)?,
            title: row.get(1)?,
            ctx_hdr: row.get(2)?,
            body_text: row.get(3)?,
            doc_type: row.get(4)?,
            probe_id: row.get(5)?,
            score: None,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Why did retrieval come back empty?  Re-counts without the scope so the
/// caller learns whether the index has nothing at all or the scope excludes
/// everything.
fn diagnose_empty(conn: &Connection, scope: &RetrievalScope) -> CaliperResult<String> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM evidence_doc;", [], |r| r.get(0))?;
    if total == 0 {
        return Ok("evidence index is empty; run the ingest pipeline first".to_string());
    }
    if scope.is_set() {
        return Ok(format!(
            "{total} evidence documents exist but none match the requested scope"
        ));
    }
    Ok(format!(
        "{total} evidence documents exist but none were selectable"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::{build_evidence, RunContext};
    use crate::models::{Fact, PredicateResult, Verdict};
    use crate::rag::index::rebuild_index;
    use indexmap::IndexMap;

    fn seeded_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "m1").unwrap();
        store.init_schema().unwrap();

        let ctx = RunContext::new("m1", "sparx", "17.1");
        let result = PredicateResult {
            probe_id: "mml_2.block_has_port".to_string(),
            level: 2,
            verdict: Verdict::Failed,
            counts: IndexMap::new(),
            facts: vec![Fact {
                subject_type: "block".to_string(),
                subject_id: "7".to_string(),
                subject_name: "Pump".to_string(),
                has_issue: true,
                meta: serde_json::json!({ "ports": 0 }),
            }],
            source_tables: vec!["t_object".to_string()],
            measure: None,
            error: None,
            duration_ms: 1,
        };
        let docs = build_evidence(&ctx, &[result]);
        rebuild_index(&store, &docs).unwrap();
        (dir, store)
    }

    #[test]
    fn match_expression_shape() {
        let expr = build_match("Which blocks are missing ports?").unwrap();
        assert!(expr.starts_with("\"missing ports\" OR "));
        assert!(expr.contains("blocks*"));
        assert!(expr.contains("missing*"));
        assert!(expr.contains("ports*"));
        // Stopwords never survive tokenization.
        assert!(!expr.contains("which"));
        assert!(!expr.contains(" are "));
    }

    #[test]
    fn match_expression_caps_tokens() {
        let expr = build_match(
            "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo",
        )
        .unwrap();
        assert_eq!(expr.matches(" OR ").count(), MAX_MATCH_TOKENS - 1);
    }

    #[test]
    fn stopword_only_question_has_no_match() {
        assert_eq!(build_match("what is the and of"), None);
    }

    #[test]
    fn body_tokens_hit_the_index() {
        let (_dir, store) = seeded_store();
        let out = retrieve(&store, "blocks without ports", 8, &RetrievalScope::default()).unwrap();
        assert_eq!(out.mode, RetrievalMode::Scored);
        assert!(out
            .docs
            .iter()
            .any(|d| d.doc_id == "m1/mml_2.block_has_port/block/7"));
    }

    #[test]
    fn probe_id_words_are_searchable() {
        // unicode61 splits `mml_2.block_has_port` on '.'/'_', so the words of
        // a probe id are individually matchable.
        let (_dir, store) = seeded_store();
        let out = retrieve(&store, "block has port", 8, &RetrievalScope::default()).unwrap();
        assert_eq!(out.mode, RetrievalMode::Scored);
        assert!(out.docs.iter().any(|d| d.doc_id == "m1/mml_2.block_has_port"));
    }

    #[test]
    fn falls_back_to_summaries_when_nothing_matches() {
        let (_dir, store) = seeded_store();
        let out = retrieve(&store, "zzzqqqxxx", 8, &RetrievalScope::default()).unwrap();
        assert_eq!(out.mode, RetrievalMode::FallbackSummaries);
        assert!(out.docs.iter().all(|d| d.doc_type == "summary"));
    }

    #[test]
    fn empty_index_yields_diagnostic_hint() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "m1").unwrap();
        store.init_schema().unwrap();

        let out = retrieve(&store, "anything", 8, &RetrievalScope::default()).unwrap();
        assert!(out.docs.is_empty());
        assert!(out.hint.as_deref().unwrap().contains("empty"));
    }

    #[test]
    fn scope_mismatch_is_distinguished_from_empty_index() {
        let (_dir, store) = seeded_store();
        let scope = RetrievalScope {
            probe_id: Some("mml_9.nonexistent".to_string()),
            mml: None,
        };
        let out = retrieve(&store, "zzzqqqxxx", 8, &scope).unwrap();
        assert!(out.docs.is_empty());
        assert!(out.hint.as_deref().unwrap().contains("scope"));
    }
}
