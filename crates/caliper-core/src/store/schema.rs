//! SQLite schema DDL and migration framework for per-model stores.
//!
//! One database file holds everything for one model: the canonical tables,
//! run bookkeeping, defect records, evidence documents, and the FTS index.

use rusqlite::Connection;

use crate::errors::CaliperResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Core DDL statements: 16 CREATE TABLE + 12 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (16) ─────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS run_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS source_table (
        name TEXT PRIMARY KEY,
        row_count INTEGER NOT NULL DEFAULT 0,
        column_count INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS ingest_defect (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stage TEXT NOT NULL,
        kind TEXT NOT NULL,
        subject TEXT,
        detail TEXT,
        ts_ms INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS package (
        id INTEGER PRIMARY KEY,
        model_id TEXT NOT NULL,
        parent_id INTEGER,
        name TEXT NOT NULL,
        stereotype TEXT,
        scope TEXT,
        version TEXT,
        guid TEXT
    );",
    "CREATE TABLE IF NOT EXISTS element (
        id INTEGER PRIMARY KEY,
        model_id TEXT NOT NULL,
        package_id INTEGER,
        name TEXT,
        meta_type TEXT NOT NULL,
        stereotype TEXT,
        status TEXT,
        author TEXT,
        complexity TEXT,
        guid TEXT,
        parent_id INTEGER,
        classifier_id INTEGER,
        pdata1 TEXT
    );",
    "CREATE TABLE IF NOT EXISTS attribute (
        id INTEGER PRIMARY KEY,
        model_id TEXT NOT NULL,
        element_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        attr_type TEXT,
        lower_bound TEXT,
        upper_bound TEXT,
        guid TEXT
    );",
    "CREATE TABLE IF NOT EXISTS operation (
        id INTEGER PRIMARY KEY,
        model_id TEXT NOT NULL,
        element_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        return_type TEXT,
        scope TEXT,
        guid TEXT
    );",
    "CREATE TABLE IF NOT EXISTS connector (
        id INTEGER PRIMARY KEY,
        model_id TEXT NOT NULL,
        src_id INTEGER NOT NULL,
        dst_id INTEGER NOT NULL,
        connector_type TEXT NOT NULL,
        stereotype TEXT,
        direction TEXT,
        name TEXT,
        guid TEXT
    );",
    "CREATE TABLE IF NOT EXISTS diagram (
        id INTEGER PRIMARY KEY,
        model_id TEXT NOT NULL,
        package_id INTEGER,
        name TEXT,
        diagram_type TEXT,
        guid TEXT
    );",
    "CREATE TABLE IF NOT EXISTS diagram_object (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id TEXT NOT NULL,
        diagram_id INTEGER NOT NULL,
        element_id INTEGER NOT NULL,
        sequence INTEGER
    );",
    "CREATE TABLE IF NOT EXISTS diagram_link (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id TEXT NOT NULL,
        diagram_id INTEGER NOT NULL,
        connector_id INTEGER NOT NULL,
        hidden INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS tagged_value (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id TEXT NOT NULL,
        owner_guid TEXT NOT NULL,
        property TEXT NOT NULL,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS xref (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id TEXT NOT NULL,
        client_guid TEXT NOT NULL,
        supplier_guid TEXT,
        name TEXT,
        xref_type TEXT,
        description TEXT
    );",
    "CREATE TABLE IF NOT EXISTS guid_index (
        guid TEXT NOT NULL,
        entity_kind TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        PRIMARY KEY(guid, entity_kind)
    );",
    "CREATE TABLE IF NOT EXISTS evidence_doc (
        doc_id TEXT PRIMARY KEY,
        model_id TEXT NOT NULL,
        vendor TEXT NOT NULL,
        version TEXT NOT NULL,
        mml INTEGER NOT NULL,
        probe_id TEXT NOT NULL,
        doc_type TEXT NOT NULL,
        subject_type TEXT,
        subject_id TEXT,
        title TEXT NOT NULL,
        ctx_hdr TEXT NOT NULL,
        body_text TEXT NOT NULL,
        json_metadata TEXT,
        ts_ms INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (12) ────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_package_parent ON package(parent_id);",
    "CREATE INDEX IF NOT EXISTS idx_package_guid ON package(guid);",
    "CREATE INDEX IF NOT EXISTS idx_element_package ON element(package_id);",
    "CREATE INDEX IF NOT EXISTS idx_element_parent ON element(parent_id);",
    "CREATE INDEX IF NOT EXISTS idx_element_guid ON element(guid);",
    "CREATE INDEX IF NOT EXISTS idx_element_meta_type ON element(meta_type);",
    "CREATE INDEX IF NOT EXISTS idx_attribute_element ON attribute(element_id);",
    "CREATE INDEX IF NOT EXISTS idx_operation_element ON operation(element_id);",
    "CREATE INDEX IF NOT EXISTS idx_connector_src ON connector(src_id);",
    "CREATE INDEX IF NOT EXISTS idx_connector_dst ON connector(dst_id);",
    "CREATE INDEX IF NOT EXISTS idx_tagged_value_owner ON tagged_value(owner_guid);",
    "CREATE INDEX IF NOT EXISTS idx_evidence_doc_model ON evidence_doc(model_id, ts_ms);",
];

/// FTS5 virtual table over the evidence documents.
///
/// `unicode61` tokenization treats identifier separators (underscore, dot,
/// slash, hyphen) as word boundaries, so a probe id like
/// `mml_2.block_has_port` is retrievable by "block", "has", "port".
/// Executed best-effort because some SQLite builds lack FTS5.
pub const FTS_STATEMENTS: &[&str] = &[
    "CREATE VIRTUAL TABLE IF NOT EXISTS evidence_fts
     USING fts5(doc_id UNINDEXED, title, ctx_hdr, body_text, tokenize='unicode61');",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`].  Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> CaliperResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT caliper_migrate_step;")?;

        let step_result = (|| -> CaliperResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                _ => {} // future versions: no-op until migration is defined
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT caliper_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                // Roll back just this step, then release the savepoint.
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT caliper_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT caliper_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `run_meta`.
/// Returns 0 when the key is absent or unparseable.
pub(crate) fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM run_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> CaliperResult<()> {
    conn.execute(
        "INSERT INTO run_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

/// Insert one row into `migration_history` (best-effort; never fails the
/// caller).
fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> CaliperResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline, no-op.
fn migrate_to_v1(_conn: &Connection) -> CaliperResult<()> {
    // Intentionally empty -- baseline schema already created by SCHEMA_STATEMENTS.
    Ok(())
}

/// v1 -> v2: add probe lookup index on evidence documents.
fn migrate_to_v2(conn: &Connection) -> CaliperResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_evidence_doc_probe \
         ON evidence_doc(probe_id, doc_type);",
    )?;
    Ok(())
}
