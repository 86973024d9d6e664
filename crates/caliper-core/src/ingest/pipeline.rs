//! End-to-end ingest pipeline: discover, normalize, load, derive IR, run the
//! ladder, build evidence, rebuild the retrieval index.
//!
//! The pipeline is idempotent per model: canonical rows for the model are
//! replaced, IR tables are rebuilt, and evidence documents are swapped in a
//! single transaction, so re-running the same export converges on the same
//! store state.

use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use crate::errors::{CaliperError, CaliperResult};
use crate::ingest::adapter::{AdapterRegistry, AdapterRegistryOptions};
use crate::ingest::discovery::{discover_schema, sniff_vendor, stream_rows, SchemaConfig};
use crate::ingest::ir::build_ir;
use crate::ingest::loader::{Loader, LoaderOptions};
use crate::ladder::{build_evidence, default_predicates, run_ladder, RunContext, DEFAULT_FACT_BOUND};
use crate::models::{compute_model_id, now_ms, RunReport, StageTimings};
use crate::rag::index::rebuild_index;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Vendor hint; sniffed from the discovered tables when absent.
    pub vendor: Option<String>,
    pub version: Option<String>,
    /// Caller-supplied model identifier.  When set it wins over the content
    /// hash, which is still recorded in `run_meta` for disambiguation.
    pub model_id: Option<String>,
    /// Cap ladder execution at this level.
    pub max_level: Option<u8>,
    pub batch_size: usize,
    pub include_extensions: bool,
    pub allow_generic_fallback: bool,
    pub fact_bound: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            vendor: None,
            version: None,
            model_id: None,
            max_level: None,
            batch_size: 1000,
            include_extensions: false,
            allow_generic_fallback: true,
            fact_bound: DEFAULT_FACT_BOUND,
        }
    }
}

/// Run the full pipeline for one XML export.
pub fn run_pipeline(
    xml_path: &Path,
    data_dir: &Path,
    options: &PipelineOptions,
) -> CaliperResult<RunReport> {
    let content_hash = compute_model_id(xml_path)?;
    let model_id = options.model_id.clone().unwrap_or_else(|| content_hash.clone());

    let store = Store::open(data_dir, &model_id)?;
    store.init_schema()?;

    let mut timings = StageTimings::default();

    // ── discover ────────────────────────────────────────────────────────
    let started = Instant::now();
    let cfg = SchemaConfig::default();
    let schema = discover_schema(xml_path, &cfg, options.include_extensions)?;
    timings.discover_ms = started.elapsed().as_millis() as u64;
    if schema.is_empty() {
        return Err(CaliperError::Parse(format!(
            "no source tables discovered in {}",
            xml_path.display()
        )));
    }
    let census: Vec<(String, u64, usize)> = schema
        .tables
        .iter()
        .map(|(name, shape)| (name.clone(), shape.rows, shape.columns.len()))
        .collect();
    store.replace_source_census(&census)?;
    for warning in &schema.warnings {
        store.record_defect("discover", "warning", None, warning)?;
    }

    // ── adapter selection ───────────────────────────────────────────────
    let sniffed = sniff_vendor(&schema);
    let vendor_hint = options.vendor.as_deref().or(sniffed);
    let registry = AdapterRegistry::new(AdapterRegistryOptions {
        allow_generic_fallback: options.allow_generic_fallback,
    });
    let adapter = registry.select(vendor_hint, options.version.as_deref())?;
    let vendor = vendor_hint.unwrap_or_else(|| adapter.vendor()).to_string();
    let version = options
        .version
        .clone()
        .unwrap_or_else(|| adapter.version().to_string());

    // ── load ────────────────────────────────────────────────────────────
    let started = Instant::now();
    let mut loader = Loader::new(
        &store,
        LoaderOptions {
            batch_size: options.batch_size,
            ..LoaderOptions::default()
        },
    );
    loader.clear_model()?;
    let mut unmapped: HashSet<String> = HashSet::new();
    stream_rows(xml_path, &cfg, &schema, options.include_extensions, |row| {
        match adapter.normalize(&row) {
            Some(canonical) => loader.push(canonical),
            None => {
                if unmapped.insert(row.table.clone()) {
                    store.record_defect(
                        "load",
                        "unmapped_table",
                        Some(&row.table),
                        "adapter has no mapping for this source table",
                    )?;
                }
                Ok(())
            }
        }
    })?;
    let load_summary = loader.finish()?;
    timings.load_ms = started.elapsed().as_millis() as u64;

    // ── IR ──────────────────────────────────────────────────────────────
    let started = Instant::now();
    let conn = store.connect()?;
    let ir = build_ir(&conn, &model_id)?;
    drop(conn);
    timings.ir_ms = started.elapsed().as_millis() as u64;

    store.set_run_meta("vendor", &vendor)?;
    store.set_run_meta("version", &version)?;
    store.set_run_meta("content_hash", &content_hash)?;
    store.set_run_meta("loaded_at_ms", &now_ms().to_string())?;

    // ── ladder ──────────────────────────────────────────────────────────
    let started = Instant::now();
    let mut ctx = RunContext::new(&model_id, &vendor, &version);
    ctx.fact_bound = options.fact_bound;
    let predicates = default_predicates();
    let outcome = run_ladder(&store, &ctx, &predicates, options.max_level)?;
    timings.ladder_ms = started.elapsed().as_millis() as u64;

    // ── evidence + index ────────────────────────────────────────────────
    let docs = build_evidence(&ctx, &outcome.results);
    if !outcome.results.is_empty() && docs.is_empty() {
        // A run that produced verdicts but nothing citable would make every
        // downstream answer ungroundable.
        return Err(CaliperError::Grounding(format!(
            "{} predicate results produced zero evidence documents",
            outcome.results.len()
        )));
    }
    let started = Instant::now();
    let index = rebuild_index(&store, &docs)?;
    timings.index_ms = started.elapsed().as_millis() as u64;

    let defects = store.defect_count()?;
    tracing::info!(
        model_id = %model_id,
        vendor = %vendor,
        maturity_level = outcome.maturity_level,
        rows = ?load_summary.rows_by_table,
        blocks = ir.blocks,
        ports = ir.ports,
        evidence = index.documents,
        defects,
        "pipeline complete"
    );

    Ok(RunReport {
        model_id,
        vendor,
        version,
        maturity_level: outcome.maturity_level,
        levels: outcome.levels,
        results: outcome.results,
        evidence_docs: index.documents,
        defects,
        timings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::level1::EXPECTED_SOURCE_TABLES;
    use crate::models::Verdict;
    use std::fmt::Write as _;

    /// Build a minimal EA-style export: named blocks, ports parented to the
    /// first `blocks_with_ports` blocks, and (optionally empty) shells for
    /// the remaining expected tables.
    fn export_xml(blocks: i64, blocks_with_ports: i64, skip_tables: &[&str]) -> String {
        let mut xml = String::from("<Model>\n<Table name=\"t_package\">\n");
        for i in 1..=3 {
            write!(
                xml,
                "<Row><Column name=\"Package_ID\" value=\"{i}\"/>\
                 <Column name=\"Name\" value=\"Pkg{i}\"/></Row>\n"
            )
            .unwrap();
        }
        xml.push_str("</Table>\n<Table name=\"t_object\">\n");
        for i in 1..=blocks {
            write!(
                xml,
                "<Row><Column name=\"Object_ID\" value=\"{i}\"/>\
                 <Column name=\"Name\" value=\"Block{i}\"/>\
                 <Column name=\"Object_Type\" value=\"Class\"/>\
                 <Column name=\"Stereotype\" value=\"block\"/>\
                 <Column name=\"ea_guid\" value=\"{{B-{i}}}\"/></Row>\n"
            )
            .unwrap();
        }
        for i in 1..=blocks_with_ports {
            let id = 1000 + i;
            write!(
                xml,
                "<Row><Column name=\"Object_ID\" value=\"{id}\"/>\
                 <Column name=\"Name\" value=\"port{i}\"/>\
                 <Column name=\"Object_Type\" value=\"Port\"/>\
                 <Column name=\"ParentID\" value=\"{i}\"/>\
                 <Column name=\"Classifier\" value=\"1\"/></Row>\n"
            )
            .unwrap();
        }
        xml.push_str("</Table>\n");
        for table in EXPECTED_SOURCE_TABLES {
            if *table == "t_object" || *table == "t_package" || skip_tables.contains(table) {
                continue;
            }
            write!(xml, "<Table name=\"{table}\"></Table>\n").unwrap();
        }
        xml.push_str("</Model>\n");
        xml
    }

    fn write_export(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn partial_ports_cap_maturity_below_two() {
        let dir = tempfile::tempdir().unwrap();
        let xml = write_export(dir.path(), "m.xml", &export_xml(15, 10, &[]));

        let report = run_pipeline(&xml, dir.path(), &PipelineOptions::default()).unwrap();

        assert_eq!(report.vendor, "sparx");
        assert!(report.maturity_level < 2);
        assert_eq!(report.maturity_level, 1);

        let block_probe = report
            .results
            .iter()
            .find(|r| r.probe_id == "mml_2.block_has_port")
            .unwrap();
        assert_eq!(block_probe.verdict, Verdict::Failed);
        assert_eq!(block_probe.counts.get("blocks_total"), Some(&serde_json::json!(15)));
        assert_eq!(
            block_probe.counts.get("blocks_with_ports"),
            Some(&serde_json::json!(10))
        );
        assert_eq!(
            block_probe.counts.get("blocks_missing_ports"),
            Some(&serde_json::json!(5))
        );
        assert!(report.evidence_docs > 0);
    }

    #[test]
    fn missing_connector_table_yields_level_zero() {
        let dir = tempfile::tempdir().unwrap();
        let xml = write_export(dir.path(), "m.xml", &export_xml(3, 3, &["t_connector"]));

        let report = run_pipeline(&xml, dir.path(), &PipelineOptions::default()).unwrap();

        let census = report
            .results
            .iter()
            .find(|r| r.probe_id == "mml_1.count_tables")
            .unwrap();
        assert_eq!(census.verdict, Verdict::Failed);
        assert_eq!(
            census.counts.get("missing_tables"),
            Some(&serde_json::json!(["t_connector"]))
        );
        assert_eq!(report.maturity_level, 0);
    }

    #[test]
    fn rerun_converges_on_same_store_state() {
        let dir = tempfile::tempdir().unwrap();
        let xml = write_export(dir.path(), "m.xml", &export_xml(5, 5, &[]));

        let first = run_pipeline(&xml, dir.path(), &PipelineOptions::default()).unwrap();
        let second = run_pipeline(&xml, dir.path(), &PipelineOptions::default()).unwrap();

        assert_eq!(first.model_id, second.model_id);
        assert_eq!(first.maturity_level, second.maturity_level);
        assert_eq!(first.evidence_docs, second.evidence_docs);

        let store = Store::open(dir.path(), &second.model_id).unwrap();
        let conn = store.connect().unwrap();
        let elements: i64 = conn
            .query_row("SELECT COUNT(*) FROM element;", [], |r| r.get(0))
            .unwrap();
        assert_eq!(elements, 10);
        assert_eq!(store.evidence_count().unwrap(), second.evidence_docs);
    }

    #[test]
    fn caller_model_id_wins_but_hash_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let xml = write_export(dir.path(), "m.xml", &export_xml(2, 2, &[]));

        let options = PipelineOptions {
            model_id: Some("custom01".to_string()),
            ..PipelineOptions::default()
        };
        let report = run_pipeline(&xml, dir.path(), &options).unwrap();
        assert_eq!(report.model_id, "custom01");

        let store = Store::open(dir.path(), "custom01").unwrap();
        let hash = store.get_run_meta("content_hash").unwrap().unwrap();
        assert_eq!(hash, compute_model_id(&xml).unwrap());
        assert_ne!(hash, "custom01");
    }

    #[test]
    fn empty_export_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let xml = write_export(dir.path(), "m.xml", "<Model></Model>");

        let err = run_pipeline(&xml, dir.path(), &PipelineOptions::default()).unwrap_err();
        assert!(matches!(err, CaliperError::Parse(_)), "got {err:?}");
    }

    #[test]
    fn level_cap_limits_executed_predicates() {
        let dir = tempfile::tempdir().unwrap();
        let xml = write_export(dir.path(), "m.xml", &export_xml(2, 2, &[]));

        let options = PipelineOptions {
            max_level: Some(1),
            ..PipelineOptions::default()
        };
        let report = run_pipeline(&xml, dir.path(), &options).unwrap();
        assert!(report.results.iter().all(|r| r.level <= 1));
    }
}
