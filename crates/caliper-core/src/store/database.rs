//! SQLite storage layer: one `Store` per model identifier.
//!
//! Each public method opens its own connection so callers never manage
//! connection lifetime.  The store for one ingestion run is owned exclusively
//! by that run; distinct models never share a database file.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use crate::errors::{CaliperError, CaliperResult};
use crate::models::{now_ms, EvidenceDocument};
use crate::store::schema;

/// Per-model SQLite store: canonical tables, defects, evidence, FTS index.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
    model_id: String,
}

impl Store {
    /// Open (or create) the store for `model_id` under `data_dir`.
    /// Layout: `<data_dir>/<model_id>/model.db`.
    pub fn open(data_dir: &Path, model_id: &str) -> CaliperResult<Self> {
        let model_dir = data_dir.join(model_id);
        std::fs::create_dir_all(&model_dir)?;
        Ok(Store {
            db_path: model_dir.join("model.db"),
            model_id: model_id.to_string(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Open a new connection with foreign keys enabled.
    pub fn connect(&self) -> CaliperResult<Connection> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            CaliperError::Database(format!(
                "cannot open store at {}: {e}",
                self.db_path.display()
            ))
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Initialise the schema: WAL mode, all tables and indexes, FTS5
    /// (best-effort for builds without it), then pending migrations.
    pub fn init_schema(&self) -> CaliperResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        for stmt in schema::FTS_STATEMENTS {
            let _ = conn.execute_batch(stmt);
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run metadata
    // -----------------------------------------------------------------------

    pub fn set_run_meta(&self, key: &str, value: &str) -> CaliperResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO run_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_run_meta(&self, key: &str) -> CaliperResult<Option<String>> {
        let conn = self.connect()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM run_meta WHERE key = ?1 LIMIT 1;",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Source-table census and normalization defects
    // -----------------------------------------------------------------------

    /// Replace the source-table census for this model.  Predicates use it to
    /// distinguish "table absent in export" from "table empty".
    pub fn replace_source_census(
        &self,
        census: &[(String, u64, usize)],
    ) -> CaliperResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM source_table;", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO source_table(name, row_count, column_count) VALUES (?1, ?2, ?3);",
            )?;
            for (name, rows, cols) in census {
                stmt.execute(params![name, *rows as i64, *cols as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// True when the export contained the named source table at all.
    pub fn source_table_present(&self, name: &str) -> CaliperResult<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM source_table WHERE name = ?1;",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a normalization gap.  Non-fatal data-quality facts that
    /// downstream predicates consume.
    pub fn record_defect(
        &self,
        stage: &str,
        kind: &str,
        subject: Option<&str>,
        detail: &str,
    ) -> CaliperResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO ingest_defect(stage, kind, subject, detail, ts_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![stage, kind, subject, detail, now_ms()],
        )?;
        Ok(())
    }

    pub fn defect_count(&self) -> CaliperResult<usize> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM ingest_defect;", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Evidence documents + FTS projection
    // -----------------------------------------------------------------------

    /// Replace all evidence documents for this model: delete-then-insert of
    /// both the base table and its FTS projection inside one transaction.
    /// Rebuilding is idempotent; readers see the old or the new index, never
    /// an interleaved state.
    pub fn replace_evidence(&self, docs: &[EvidenceDocument]) -> CaliperResult<usize> {
        let mut conn = self.connect()?;
        let fts_available = fts_available(&conn);
        let tx = conn.transaction()?;

        if fts_available {
            tx.execute(
                "DELETE FROM evidence_fts WHERE doc_id IN \
                 (SELECT doc_id FROM evidence_doc WHERE model_id = ?1);",
                params![self.model_id],
            )?;
        }
        tx.execute(
            "DELETE FROM evidence_doc WHERE model_id = ?1;",
            params![self.model_id],
        )?;

        {
            let mut doc_stmt = tx.prepare(
                "INSERT INTO evidence_doc \
                 (doc_id, model_id, vendor, version, mml, probe_id, doc_type, \
                  subject_type, subject_id, title, ctx_hdr, body_text, json_metadata, ts_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14);",
            )?;
            let mut fts_stmt = if fts_available {
                Some(tx.prepare(
                    "INSERT INTO evidence_fts(doc_id, title, ctx_hdr, body_text) \
                     VALUES (?1, ?2, ?3, ?4);",
                )?)
            } else {
                None
            };

            for doc in docs {
                let metadata = serde_json::to_string(&doc.metadata)?;
                doc_stmt.execute(params![
                    doc.doc_id,
                    doc.model_id,
                    doc.vendor,
                    doc.version,
                    doc.mml as i64,
                    doc.probe_id,
                    doc.doc_type,
                    doc.subject_type,
                    doc.subject_id,
                    doc.title,
                    doc.ctx_hdr,
                    doc.body_text,
                    metadata,
                    doc.ts_ms,
                ])?;
                if let Some(stmt) = fts_stmt.as_mut() {
                    stmt.execute(params![doc.doc_id, doc.title, doc.ctx_hdr, doc.body_text])?;
                }
            }
        }

        tx.commit()?;
        tracing::info!(
            model_id = %self.model_id,
            docs = docs.len(),
            fts = fts_available,
            "evidence index rebuilt"
        );
        Ok(docs.len())
    }

    pub fn evidence_count(&self) -> CaliperResult<usize> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM evidence_doc WHERE model_id = ?1;",
            params![self.model_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

/// A quick probe for FTS5 availability on this build.
pub(crate) fn fts_available(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'evidence_fts';",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .unwrap_or(false)
}
