//! Predicate execution engine: runs the maturity ladder level by level,
//! separating "failed" from "missing", and reduces per-level rollups into a
//! strict monotonic maturity score.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use rayon::prelude::*;
use rusqlite::Connection;

use crate::errors::CaliperResult;
use crate::ladder::{level1, level2, level3};
use crate::models::{LevelSummary, PredicateOutput, PredicateResult, Verdict};
use crate::store::Store;

/// Per-predicate latency budget; slower evaluations log a warning with the
/// probe id so regressions surface in traces, not in benchmarks only.
pub const PREDICATE_SLA_MS: u64 = 100;

/// Default cap on exemplar facts kept per verdict side.
pub const DEFAULT_FACT_BOUND: usize = 50;

/// Shared run inputs handed to every predicate.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub model_id: String,
    pub vendor: String,
    pub version: String,
    /// Max exemplar facts a predicate keeps per verdict side.
    pub fact_bound: usize,
}

impl RunContext {
    pub fn new(model_id: &str, vendor: &str, version: &str) -> Self {
        RunContext {
            model_id: model_id.to_string(),
            vendor: vendor.to_string(),
            version: version.to_string(),
            fact_bound: DEFAULT_FACT_BOUND,
        }
    }
}

/// One maturity rule.  Implementations are pure readers: they get a fresh
/// connection per evaluation and never write to the store.
pub trait Predicate: Send + Sync {
    fn probe_id(&self) -> &'static str;
    fn level(&self) -> u8;
    /// Source tables that must appear in the ingest census for this rule to
    /// be evaluable at all.  Absence yields `Missing`, not `Failed`.
    fn required_source_tables(&self) -> &'static [&'static str];
    fn evaluate(&self, conn: &Connection, ctx: &RunContext) -> CaliperResult<PredicateOutput>;
}

/// The built-in ladder.
pub fn default_predicates() -> Vec<Arc<dyn Predicate>> {
    vec![
        Arc::new(level1::CountTables),
        Arc::new(level1::NonemptyNames),
        Arc::new(level2::BlockHasPort),
        Arc::new(level3::PortsTyped),
    ]
}

#[derive(Debug, Clone)]
pub struct LadderOutcome {
    pub maturity_level: u8,
    pub levels: Vec<LevelSummary>,
    pub results: Vec<PredicateResult>,
}

/// Run predicates grouped by level.  Within a level, evaluation order never
/// affects the outcome, so levels run in parallel worker tasks unless
/// `CALIPER_PARALLEL_PREDICATES` disables that; results keep declaration
/// order either way.
pub fn run_ladder(
    store: &Store,
    ctx: &RunContext,
    predicates: &[Arc<dyn Predicate>],
    max_level: Option<u8>,
) -> CaliperResult<LadderOutcome> {
    // Census read doubles as the fatal-open check: if the store cannot be
    // opened at all, the run fails here instead of yielding all-Missing.
    let census = read_census(&store.connect()?)?;

    let mut by_level: BTreeMap<u8, Vec<Arc<dyn Predicate>>> = BTreeMap::new();
    for pred in predicates {
        if max_level.map_or(true, |cap| pred.level() <= cap) {
            by_level.entry(pred.level()).or_default().push(Arc::clone(pred));
        }
    }

    let parallel = parallel_enabled();
    let mut results: Vec<PredicateResult> = Vec::new();
    let mut levels: Vec<LevelSummary> = Vec::new();

    for (level, preds) in &by_level {
        let level_results: Vec<PredicateResult> = if parallel && preds.len() > 1 {
            run_level_parallel(store, ctx, &census, preds)
        } else {
            preds
                .iter()
                .map(|p| execute_one(store, ctx, &census, p.as_ref()))
                .collect()
        };

        let mut summary = LevelSummary {
            level: *level,
            expected: level_results.len(),
            passed: 0,
            failed: 0,
            missing: 0,
        };
        for result in &level_results {
            match result.verdict {
                Verdict::Passed => summary.passed += 1,
                Verdict::Failed => summary.failed += 1,
                Verdict::Missing => summary.missing += 1,
            }
        }
        levels.push(summary);
        results.extend(level_results);
    }

    let maturity_level = score(&levels);
    tracing::info!(
        model_id = %ctx.model_id,
        maturity_level,
        predicates = results.len(),
        "ladder complete"
    );
    Ok(LadderOutcome {
        maturity_level,
        levels,
        results,
    })
}

/// Strict monotonic score: the highest level N where level N and every level
/// below it fully pass.  Missing counts against a level the same as Failed,
/// and any shortfall at level N caps the score below N regardless of higher
/// levels.
pub fn score(levels: &[LevelSummary]) -> u8 {
    let mut maturity = 0u8;
    let mut sorted: Vec<&LevelSummary> = levels.iter().collect();
    sorted.sort_by_key(|s| s.level);
    for summary in sorted {
        let fully_passed = summary.expected > 0 && summary.passed == summary.expected;
        if fully_passed && summary.level == maturity + 1 {
            maturity = summary.level;
        } else {
            break;
        }
    }
    maturity
}

fn run_level_parallel(
    store: &Store,
    ctx: &RunContext,
    census: &HashSet<String>,
    preds: &[Arc<dyn Predicate>],
) -> Vec<PredicateResult> {
    match rayon::ThreadPoolBuilder::new().build() {
        Ok(pool) => pool.install(|| {
            preds
                .par_iter()
                .map(|p| execute_one(store, ctx, census, p.as_ref()))
                .collect()
        }),
        Err(e) => {
            tracing::warn!(error = %e, "thread pool unavailable, running predicates sequentially");
            preds
                .iter()
                .map(|p| execute_one(store, ctx, census, p.as_ref()))
                .collect()
        }
    }
}

/// Evaluate one predicate in isolation.  A failure here is contained: the
/// result becomes `Missing` with diagnostic text and siblings are unaffected.
fn execute_one(
    store: &Store,
    ctx: &RunContext,
    census: &HashSet<String>,
    pred: &dyn Predicate,
) -> PredicateResult {
    let required = pred.required_source_tables();
    let absent: Vec<&str> = required
        .iter()
        .copied()
        .filter(|t| !census.contains(*t))
        .collect();
    if !absent.is_empty() {
        let mut counts = IndexMap::new();
        counts.insert(
            "missing_tables".to_string(),
            serde_json::json!(absent),
        );
        return PredicateResult {
            probe_id: pred.probe_id().to_string(),
            level: pred.level(),
            verdict: Verdict::Missing,
            counts,
            facts: Vec::new(),
            source_tables: required.iter().map(|s| s.to_string()).collect(),
            measure: None,
            error: Some(format!(
                "required source tables absent from census: {}",
                absent.join(", ")
            )),
            duration_ms: 0,
        };
    }

    let started = Instant::now();
    let outcome = store
        .connect()
        .and_then(|conn| pred.evaluate(&conn, ctx));
    let duration_ms = started.elapsed().as_millis() as u64;
    if duration_ms > PREDICATE_SLA_MS {
        tracing::warn!(
            probe_id = pred.probe_id(),
            duration_ms,
            sla_ms = PREDICATE_SLA_MS,
            "predicate exceeded latency budget"
        );
    }

    match outcome {
        Ok(output) => PredicateResult {
            probe_id: pred.probe_id().to_string(),
            level: pred.level(),
            verdict: if output.passed {
                Verdict::Passed
            } else {
                Verdict::Failed
            },
            counts: output.counts,
            facts: output.facts,
            source_tables: output.source_tables,
            measure: output.measure,
            error: None,
            duration_ms,
        },
        Err(e) => {
            tracing::warn!(probe_id = pred.probe_id(), error = %e, "predicate errored");
            PredicateResult {
                probe_id: pred.probe_id().to_string(),
                level: pred.level(),
                verdict: Verdict::Missing,
                counts: IndexMap::new(),
                facts: Vec::new(),
                source_tables: required.iter().map(|s| s.to_string()).collect(),
                measure: None,
                error: Some(e.to_string()),
                duration_ms,
            }
        }
    }
}

fn read_census(conn: &Connection) -> CaliperResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM source_table;")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

fn parallel_enabled() -> bool {
    match std::env::var("CALIPER_PARALLEL_PREDICATES") {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        Err(_) => true,
    }
}
