//! Criterion benchmarks for caliper-core.
//!
//! ## Benchmark groups
//!
//! 1. **schema** — DDL init + migration overhead.
//! 2. **guards** — Question clamping and top-k normalization.
//! 3. **token_estimation** — Token counting at various text sizes.
//! 4. **match_building** — FTS MATCH expression construction.
//! 5. **predicates** — Ladder rules on seeded model stores.
//! 6. **evidence** — Evidence document construction.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/caliper-core/Cargo.toml
//! # Run only the predicate group:
//! cargo bench --manifest-path crates/caliper-core/Cargo.toml -- predicates
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use caliper_core::ingest::build_ir;
use caliper_core::ladder::engine::{Predicate, RunContext};
use caliper_core::ladder::level1::{CountTables, EXPECTED_SOURCE_TABLES};
use caliper_core::ladder::level2::BlockHasPort;
use caliper_core::ladder::build_evidence;
use caliper_core::models::{Fact, PredicateResult, Verdict};
use caliper_core::rag::guards::{clamp_question, clamp_top_k};
use caliper_core::rag::retrieve::build_match;
use caliper_core::rag::tokenizer::estimate_tokens;
use caliper_core::store::schema::{migrate_schema, FTS_STATEMENTS, SCHEMA_STATEMENTS};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fresh in-memory database with the full schema applied and migrated.
fn setup_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt).unwrap();
    }
    for stmt in FTS_STATEMENTS {
        let _ = conn.execute_batch(stmt);
    }
    migrate_schema(&conn).unwrap();
    conn
}

/// Seed `blocks` block elements, the first `with_ports` of which own one
/// port each, then derive the IR tables the predicates read.
fn seed_model(conn: &Connection, blocks: usize, with_ports: usize) {
    for t in EXPECTED_SOURCE_TABLES {
        conn.execute(
            "INSERT OR IGNORE INTO source_table(name, row_count, column_count) VALUES (?1, 1, 1);",
            rusqlite::params![t],
        )
        .unwrap();
    }
    for i in 0..blocks {
        conn.execute(
            "INSERT INTO element (id, model_id, name, meta_type, stereotype)
             VALUES (?1, 'bench', ?2, 'Class', 'block');",
            rusqlite::params![i as i64 + 1, format!("Block{i}")],
        )
        .unwrap();
    }
    for i in 0..with_ports {
        conn.execute(
            "INSERT INTO element (id, model_id, name, meta_type, parent_id, classifier_id)
             VALUES (?1, 'bench', ?2, 'Port', ?3, 1);",
            rusqlite::params![100_000 + i as i64, format!("p{i}"), i as i64 + 1],
        )
        .unwrap();
    }
    build_ir(conn, "bench").unwrap();
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn bench_schema(c: &mut Criterion) {
    c.bench_function("schema/init_and_migrate", |b| {
        b.iter(|| black_box(setup_db()))
    });
}

fn bench_guards(c: &mut Criterion) {
    let long_question = "why do these blocks lack typed ports ".repeat(40);
    c.bench_function("guards/clamp_question_long", |b| {
        b.iter(|| black_box(clamp_question(&long_question).unwrap()))
    });
    c.bench_function("guards/clamp_top_k", |b| {
        b.iter(|| black_box(clamp_top_k(black_box(10_000))))
    });
}

fn bench_token_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_estimation");
    for size in [64usize, 1024, 16 * 1024] {
        let text = "evidence card body ".repeat(size / 19 + 1);
        group.bench_with_input(BenchmarkId::from_parameter(size), &text, |b, text| {
            b.iter(|| black_box(estimate_tokens(text)))
        });
    }
    group.finish();
}

fn bench_match_building(c: &mut Criterion) {
    c.bench_function("match_building/typical_question", |b| {
        b.iter(|| black_box(build_match("which blocks are missing ports in the model?")))
    });
}

fn bench_predicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("predicates");
    for blocks in [100usize, 1_000] {
        let conn = setup_db();
        seed_model(&conn, blocks, blocks / 2);
        let ctx = RunContext::new("bench", "sparx", "17.1");

        group.bench_with_input(
            BenchmarkId::new("count_tables", blocks),
            &conn,
            |b, conn| b.iter(|| black_box(CountTables.evaluate(conn, &ctx).unwrap())),
        );
        group.bench_with_input(
            BenchmarkId::new("block_has_port", blocks),
            &conn,
            |b, conn| b.iter(|| black_box(BlockHasPort.evaluate(conn, &ctx).unwrap())),
        );
    }
    group.finish();
}

fn bench_evidence(c: &mut Criterion) {
    let ctx = RunContext::new("bench", "sparx", "17.1");
    let facts: Vec<Fact> = (0..100)
        .map(|i| Fact {
            subject_type: "block".to_string(),
            subject_id: i.to_string(),
            subject_name: format!("Block{i}"),
            has_issue: i % 3 == 0,
            meta: serde_json::json!({ "ports": i % 3 }),
        })
        .collect();
    let result = PredicateResult {
        probe_id: "mml_2.block_has_port".to_string(),
        level: 2,
        verdict: Verdict::Failed,
        counts: indexmap::IndexMap::new(),
        facts,
        source_tables: vec!["t_object".to_string()],
        measure: None,
        error: None,
        duration_ms: 1,
    };
    let results = vec![result];

    c.bench_function("evidence/build_100_facts", |b| {
        b.iter(|| black_box(build_evidence(&ctx, &results)))
    });
}

criterion_group!(
    benches,
    bench_schema,
    bench_guards,
    bench_token_estimation,
    bench_match_building,
    bench_predicates,
    bench_evidence
);
criterion_main!(benches);
