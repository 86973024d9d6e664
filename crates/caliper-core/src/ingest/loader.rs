//! Batched canonical-row loader.
//!
//! Rows stream in from the adapter, get buffered, and are flushed in
//! per-batch transactions.  A transient SQLite failure (busy/locked) retries
//! the whole batch a bounded number of times; anything else fails the load
//! with the offending row range in the error.  After the last batch the
//! loader rebuilds the GUID index and validates connector endpoints.

use indexmap::IndexMap;
use rusqlite::{params, Connection, ErrorCode, Transaction};

use crate::errors::{CaliperError, CaliperResult};
use crate::models::{normalize_guid, CanonicalRow};
use crate::store::Store;

const DEFAULT_BATCH_SIZE: usize = 1000;
const MAX_BATCH_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub max_retries: u32,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: MAX_BATCH_RETRIES,
        }
    }
}

/// Per-table row counts plus the defects recorded during the load.
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    pub rows_by_table: IndexMap<String, u64>,
    pub dangling_connectors: u64,
    pub extras_persisted: u64,
}

pub struct Loader {
    store: Store,
    options: LoaderOptions,
    batch: Vec<CanonicalRow>,
    batch_start: u64,
    next_row: u64,
    summary: LoadSummary,
}

impl Loader {
    pub fn new(store: &Store, options: LoaderOptions) -> Self {
        Loader {
            store: store.clone(),
            options,
            batch: Vec::new(),
            batch_start: 0,
            next_row: 0,
            summary: LoadSummary::default(),
        }
    }

    /// Remove every canonical row previously loaded for this model, so a
    /// re-run of the same export replaces rather than duplicates.
    pub fn clear_model(&self) -> CaliperResult<()> {
        let mut conn = self.store.connect()?;
        let tx = conn.transaction()?;
        for table in [
            "package",
            "element",
            "attribute",
            "operation",
            "connector",
            "diagram",
            "diagram_object",
            "diagram_link",
            "tagged_value",
            "xref",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE model_id = ?1;"),
                params![self.store.model_id()],
            )?;
        }
        tx.execute("DELETE FROM guid_index;", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Buffer one row, flushing when the batch is full.
    pub fn push(&mut self, row: CanonicalRow) -> CaliperResult<()> {
        self.batch.push(row);
        self.next_row += 1;
        if self.batch.len() >= self.options.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the tail batch, rebuild the GUID index, and validate connector
    /// endpoints.  Consumes the loader.
    pub fn finish(mut self) -> CaliperResult<LoadSummary> {
        self.flush()?;
        self.rebuild_guid_index()?;
        self.validate_connectors()?;
        tracing::info!(
            rows = self.next_row,
            tables = self.summary.rows_by_table.len(),
            dangling = self.summary.dangling_connectors,
            "canonical load complete"
        );
        Ok(self.summary)
    }

    fn flush(&mut self) -> CaliperResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let range_start = self.batch_start;
        let range_end = self.batch_start + self.batch.len() as u64;

        let mut attempt = 0u32;
        loop {
            match self.try_flush_once() {
                Ok(extras) => {
                    self.summary.extras_persisted += extras;
                    break;
                }
                Err(CaliperError::Sqlite(e)) if is_transient(&e) && attempt < self.options.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        rows = format!("{range_start}..{range_end}"),
                        error = %e,
                        "transient store failure, retrying batch"
                    );
                    std::thread::sleep(std::time::Duration::from_millis(
                        RETRY_BACKOFF_MS * attempt as u64,
                    ));
                }
                Err(e) => {
                    return Err(CaliperError::Database(format!(
                        "batch load failed for rows {range_start}..{range_end}: {e}"
                    )));
                }
            }
        }

        for row in &self.batch {
            *self
                .summary
                .rows_by_table
                .entry(row.table().to_string())
                .or_insert(0) += 1;
        }
        self.batch_start = range_end;
        self.batch.clear();
        Ok(())
    }

    fn try_flush_once(&self) -> CaliperResult<u64> {
        let mut conn = self.store.connect()?;
        let tx = conn.transaction()?;
        let mut extras = 0u64;
        for row in &self.batch {
            extras += insert_row(&tx, self.store.model_id(), row)?;
        }
        tx.commit()?;
        Ok(extras)
    }

    /// Rebuild `guid_index` from the canonical tables, normalizing GUIDs in
    /// SQL the same way `normalize_guid` does in Rust.
    fn rebuild_guid_index(&self) -> CaliperResult<()> {
        let conn = self.store.connect()?;
        conn.execute("DELETE FROM guid_index;", [])?;
        for (table, kind) in [
            ("package", "package"),
            ("element", "element"),
            ("attribute", "attribute"),
            ("operation", "operation"),
            ("connector", "connector"),
            ("diagram", "diagram"),
        ] {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO guid_index(guid, entity_kind, entity_id)
                     SELECT UPPER(REPLACE(REPLACE(TRIM(guid), '{{', ''), '}}', '')), '{kind}', id
                     FROM {table}
                     WHERE guid IS NOT NULL
                       AND TRIM(guid) NOT IN ('', '<none>', '&lt;none&gt;', '{{}}');"
                ),
                [],
            )?;
        }
        Ok(())
    }

    /// Record an ingest defect for every connector whose endpoint does not
    /// resolve to a loaded element.  Defects never abort the load.
    fn validate_connectors(&mut self) -> CaliperResult<()> {
        let conn = self.store.connect()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.src_id, c.dst_id
             FROM connector c
             WHERE c.model_id = ?1
               AND (NOT EXISTS (SELECT 1 FROM element e WHERE e.id = c.src_id)
                 OR NOT EXISTS (SELECT 1 FROM element e WHERE e.id = c.dst_id));",
        )?;
        let dangling: Vec<(i64, i64, i64)> = stmt
            .query_map(params![self.store.model_id()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (id, src, dst) in &dangling {
            self.store.record_defect(
                "load",
                "dangling_connector",
                Some(&format!("connector:{id}")),
                &format!("endpoint(s) not found: src={src} dst={dst}"),
            )?;
        }
        self.summary.dangling_connectors = dangling.len() as u64;
        Ok(())
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Insert one canonical row; returns the number of overflow extras persisted
/// as `tagged_value` rows alongside it.
fn insert_row(tx: &Transaction<'_>, model_id: &str, row: &CanonicalRow) -> CaliperResult<u64> {
    match row {
        CanonicalRow::Package(p) => {
            tx.execute(
                "INSERT OR REPLACE INTO package
                 (id, model_id, parent_id, name, stereotype, scope, version, guid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                params![
                    p.id, model_id, p.parent_id, p.name, p.stereotype, p.scope, p.version, p.guid
                ],
            )?;
            persist_extras(tx, model_id, p.guid.as_deref(), "package", p.id, &p.extras)
        }
        CanonicalRow::Element(e) => {
            tx.execute(
                "INSERT OR REPLACE INTO element
                 (id, model_id, package_id, name, meta_type, stereotype, status, author,
                  complexity, guid, parent_id, classifier_id, pdata1)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);",
                params![
                    e.id,
                    model_id,
                    e.package_id,
                    e.name,
                    e.meta_type,
                    e.stereotype,
                    e.status,
                    e.author,
                    e.complexity,
                    e.guid,
                    e.parent_id,
                    e.classifier_id,
                    e.pdata1
                ],
            )?;
            persist_extras(tx, model_id, e.guid.as_deref(), "element", e.id, &e.extras)
        }
        CanonicalRow::Attribute(a) => {
            tx.execute(
                "INSERT OR REPLACE INTO attribute
                 (id, model_id, element_id, name, attr_type, lower_bound, upper_bound, guid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                params![
                    a.id,
                    model_id,
                    a.element_id,
                    a.name,
                    a.attr_type,
                    a.lower_bound,
                    a.upper_bound,
                    a.guid
                ],
            )?;
            persist_extras(tx, model_id, a.guid.as_deref(), "attribute", a.id, &a.extras)
        }
        CanonicalRow::Operation(o) => {
            tx.execute(
                "INSERT OR REPLACE INTO operation
                 (id, model_id, element_id, name, return_type, scope, guid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
                params![o.id, model_id, o.element_id, o.name, o.return_type, o.scope, o.guid],
            )?;
            persist_extras(tx, model_id, o.guid.as_deref(), "operation", o.id, &o.extras)
        }
        CanonicalRow::Connector(c) => {
            tx.execute(
                "INSERT OR REPLACE INTO connector
                 (id, model_id, src_id, dst_id, connector_type, stereotype, direction, name, guid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
                params![
                    c.id,
                    model_id,
                    c.src_id,
                    c.dst_id,
                    c.connector_type,
                    c.stereotype,
                    c.direction,
                    c.name,
                    c.guid
                ],
            )?;
            persist_extras(tx, model_id, c.guid.as_deref(), "connector", c.id, &c.extras)
        }
        CanonicalRow::Diagram(d) => {
            tx.execute(
                "INSERT OR REPLACE INTO diagram
                 (id, model_id, package_id, name, diagram_type, guid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                params![d.id, model_id, d.package_id, d.name, d.diagram_type, d.guid],
            )?;
            persist_extras(tx, model_id, d.guid.as_deref(), "diagram", d.id, &d.extras)
        }
        CanonicalRow::DiagramObject(o) => {
            tx.execute(
                "INSERT INTO diagram_object (model_id, diagram_id, element_id, sequence)
                 VALUES (?1, ?2, ?3, ?4);",
                params![model_id, o.diagram_id, o.element_id, o.sequence],
            )?;
            Ok(0)
        }
        CanonicalRow::DiagramLink(l) => {
            tx.execute(
                "INSERT INTO diagram_link (model_id, diagram_id, connector_id, hidden)
                 VALUES (?1, ?2, ?3, ?4);",
                params![model_id, l.diagram_id, l.connector_id, l.hidden as i64],
            )?;
            Ok(0)
        }
        CanonicalRow::TaggedValue(t) => {
            tx.execute(
                "INSERT INTO tagged_value (model_id, owner_guid, property, value)
                 VALUES (?1, ?2, ?3, ?4);",
                params![
                    model_id,
                    normalize_guid(&t.owner_guid).unwrap_or_else(|| t.owner_guid.clone()),
                    t.property,
                    t.value
                ],
            )?;
            Ok(0)
        }
        CanonicalRow::Xref(x) => {
            tx.execute(
                "INSERT INTO xref (model_id, client_guid, supplier_guid, name, xref_type, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                params![
                    model_id,
                    normalize_guid(&x.client_guid).unwrap_or_else(|| x.client_guid.clone()),
                    x.supplier_guid.as_deref().and_then(normalize_guid),
                    x.name,
                    x.xref_type,
                    x.description
                ],
            )?;
            Ok(0)
        }
    }
}

/// Persist overflow source fields as `tagged_value` rows.  Owner is the
/// row's normalized GUID when present, else a synthetic `{kind}:{id}` key so
/// the values stay queryable.
fn persist_extras(
    tx: &Transaction<'_>,
    model_id: &str,
    guid: Option<&str>,
    kind: &str,
    id: i64,
    extras: &IndexMap<String, String>,
) -> CaliperResult<u64> {
    if extras.is_empty() {
        return Ok(0);
    }
    let owner = guid
        .and_then(normalize_guid)
        .unwrap_or_else(|| format!("{kind}:{id}"));
    for (property, value) in extras {
        tx.execute(
            "INSERT INTO tagged_value (model_id, owner_guid, property, value)
             VALUES (?1, ?2, ?3, ?4);",
            params![model_id, owner, property, value],
        )?;
    }
    Ok(extras.len() as u64)
}

/// Count rows in one canonical table for a model. Test and reporting helper.
pub fn table_count(conn: &Connection, table: &str, model_id: &str) -> CaliperResult<u64> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE model_id = ?1;"),
        params![model_id],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectorRow, ElementRow};

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "abcd1234").unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }

    fn element(id: i64, name: &str, guid: Option<&str>) -> CanonicalRow {
        CanonicalRow::Element(ElementRow {
            id,
            name: name.to_string(),
            meta_type: "Class".to_string(),
            guid: guid.map(str::to_string),
            ..Default::default()
        })
    }

    #[test]
    fn loads_rows_and_counts_per_table() {
        let (_dir, store) = test_store();
        let mut loader = Loader::new(&store, LoaderOptions { batch_size: 2, max_retries: 1 });

        loader.push(element(1, "Pump", Some("{A-1}"))).unwrap();
        loader.push(element(2, "Valve", Some("{A-2}"))).unwrap();
        loader.push(element(3, "Tank", None)).unwrap();
        let summary = loader.finish().unwrap();

        assert_eq!(summary.rows_by_table.get("element"), Some(&3));

        let conn = store.connect().unwrap();
        assert_eq!(table_count(&conn, "element", "abcd1234").unwrap(), 3);
    }

    #[test]
    fn guid_index_is_normalized() {
        let (_dir, store) = test_store();
        let mut loader = Loader::new(&store, LoaderOptions::default());
        loader.push(element(1, "Pump", Some(" {ab-1} "))).unwrap();
        loader.push(element(2, "Ghost", Some("<none>"))).unwrap();
        loader.finish().unwrap();

        let conn = store.connect().unwrap();
        let guid: String = conn
            .query_row(
                "SELECT guid FROM guid_index WHERE entity_kind = 'element' AND entity_id = 1;",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(guid, "AB-1");

        let placeholders: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM guid_index WHERE entity_id = 2;",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(placeholders, 0);
    }

    #[test]
    fn guid_index_covers_attributes_and_operations() {
        let (_dir, store) = test_store();
        let mut loader = Loader::new(&store, LoaderOptions::default());
        loader.push(element(1, "Pump", Some("{E-1}"))).unwrap();
        loader
            .push(CanonicalRow::Attribute(crate::models::AttributeRow {
                id: 10,
                element_id: 1,
                name: "pressure".to_string(),
                guid: Some("{AT-1}".to_string()),
                ..Default::default()
            }))
            .unwrap();
        loader
            .push(CanonicalRow::Operation(crate::models::OperationRow {
                id: 20,
                element_id: 1,
                name: "start".to_string(),
                guid: Some("{OP-1}".to_string()),
                ..Default::default()
            }))
            .unwrap();
        loader.finish().unwrap();

        let conn = store.connect().unwrap();
        let kind_of = |guid: &str| -> String {
            conn.query_row(
                "SELECT entity_kind FROM guid_index WHERE guid = ?1;",
                params![guid],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(kind_of("AT-1"), "attribute");
        assert_eq!(kind_of("OP-1"), "operation");
    }

    #[test]
    fn dangling_connector_becomes_defect() {
        let (_dir, store) = test_store();
        let mut loader = Loader::new(&store, LoaderOptions::default());
        loader.push(element(1, "Pump", None)).unwrap();
        loader
            .push(CanonicalRow::Connector(ConnectorRow {
                id: 10,
                src_id: 1,
                dst_id: 999,
                connector_type: "Association".to_string(),
                ..Default::default()
            }))
            .unwrap();
        let summary = loader.finish().unwrap();

        assert_eq!(summary.dangling_connectors, 1);
        assert_eq!(store.defect_count().unwrap(), 1);
    }

    #[test]
    fn reload_after_clear_is_idempotent() {
        let (_dir, store) = test_store();
        for _ in 0..2 {
            let loader0 = Loader::new(&store, LoaderOptions::default());
            loader0.clear_model().unwrap();
            let mut loader = Loader::new(&store, LoaderOptions::default());
            loader.push(element(1, "Pump", Some("{A-1}"))).unwrap();
            loader.push(element(2, "Valve", Some("{A-2}"))).unwrap();
            loader.finish().unwrap();
        }

        let conn = store.connect().unwrap();
        assert_eq!(table_count(&conn, "element", "abcd1234").unwrap(), 2);
        let idx: i64 = conn
            .query_row("SELECT COUNT(*) FROM guid_index;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn extras_become_tagged_values() {
        let (_dir, store) = test_store();
        let mut extras = IndexMap::new();
        extras.insert("Extension_units".to_string(), "mm".to_string());
        let mut loader = Loader::new(&store, LoaderOptions::default());
        loader
            .push(CanonicalRow::Element(ElementRow {
                id: 1,
                name: "Pump".to_string(),
                meta_type: "Class".to_string(),
                guid: Some("{A-1}".to_string()),
                extras,
                ..Default::default()
            }))
            .unwrap();
        let summary = loader.finish().unwrap();
        assert_eq!(summary.extras_persisted, 1);

        let conn = store.connect().unwrap();
        let value: String = conn
            .query_row(
                "SELECT value FROM tagged_value WHERE owner_guid = 'A-1' AND property = 'Extension_units';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "mm");
    }
}
