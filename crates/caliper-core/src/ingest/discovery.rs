//! Streaming schema discovery over table-shaped XML exports.
//!
//! The export is a sequence of `<Table name="...">` blocks containing `<Row>`
//! blocks containing `<Column name="..." value="..."/>` entries, with
//! optional `<Extension .../>` elements whose attributes become
//! `Extension_<attr>` pseudo-columns.  Everything here streams; the document
//! is never loaded into memory.

use std::collections::BTreeSet;
use std::path::Path;

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::errors::{CaliperError, CaliperResult};

/// Tag/attribute vocabulary for the table-shaped XML.  A vendor variant can
/// rename any of them without touching the discovery loop.
#[derive(Debug, Clone)]
pub struct SchemaConfig {
    pub table_tag: String,
    pub table_name_attr: String,
    pub row_tag: String,
    pub column_tag: String,
    pub column_name_attr: String,
    pub column_value_attr: String,
    pub extension_tag: Option<String>,
    pub extension_prefix: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        SchemaConfig {
            table_tag: "Table".to_string(),
            table_name_attr: "name".to_string(),
            row_tag: "Row".to_string(),
            column_tag: "Column".to_string(),
            column_name_attr: "name".to_string(),
            column_value_attr: "value".to_string(),
            extension_tag: Some("Extension".to_string()),
            extension_prefix: "Extension_".to_string(),
        }
    }
}

impl SchemaConfig {
    /// Namespace-agnostic tag match on the element's local name.
    fn matches(&self, local: &[u8], tag: &str) -> bool {
        local == tag.as_bytes()
    }

    fn is_extension(&self, local: &[u8]) -> bool {
        self.extension_tag
            .as_deref()
            .map(|t| local == t.as_bytes())
            .unwrap_or(false)
    }
}

/// Per-table shape: lexicographically sorted column set plus row count.
#[derive(Debug, Clone, Default)]
pub struct TableShape {
    pub columns: Vec<String>,
    pub rows: u64,
}

/// Discovery output: deterministic table -> shape map plus warnings for
/// structural oddities (rows/tables without name attributes).
#[derive(Debug, Clone, Default)]
pub struct DiscoveredSchema {
    pub tables: IndexMap<String, TableShape>,
    pub warnings: Vec<String>,
}

impl DiscoveredSchema {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.values().map(|t| t.rows).sum()
    }
}

fn attr_value(e: &BytesStart<'_>, name: &str) -> CaliperResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CaliperError::Parse(e.to_string()))?;
        if attr.key.local_name().as_ref() == name.as_bytes() {
            let value = attr.unescape_value()?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn all_attrs(e: &BytesStart<'_>) -> CaliperResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CaliperError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.push((key, value));
    }
    Ok(out)
}

/// Pass 1: stream the export and derive a deterministic
/// {table: sorted columns + row count} schema.  Fails with a parse error only
/// when the XML itself is malformed.
pub fn discover_schema(
    xml_path: &Path,
    cfg: &SchemaConfig,
    include_extensions: bool,
) -> CaliperResult<DiscoveredSchema> {
    let mut reader = Reader::from_file(xml_path)?;
    let mut buf = Vec::new();

    let mut columns: IndexMap<String, BTreeSet<String>> = IndexMap::new();
    let mut rows: IndexMap<String, u64> = IndexMap::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut current_table: Option<String> = None;
    let mut ext_cols = 0usize;
    let mut depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                if matches!(&event, Event::Start(_)) {
                    depth += 1;
                }
                let local = e.local_name();
                let local = local.as_ref();
                if cfg.matches(local, &cfg.table_tag) {
                    match attr_value(e, &cfg.table_name_attr)? {
                        Some(name) => {
                            columns.entry(name.clone()).or_default();
                            rows.entry(name.clone()).or_insert(0);
                            current_table = Some(name);
                        }
                        None => {
                            warnings.push(format!(
                                "table without '{}' attribute",
                                cfg.table_name_attr
                            ));
                            current_table = None;
                        }
                    }
                } else if cfg.matches(local, &cfg.row_tag) {
                    if let Some(table) = current_table.as_ref() {
                        *rows.entry(table.clone()).or_insert(0) += 1;
                    }
                } else if cfg.matches(local, &cfg.column_tag) {
                    if let Some(table) = current_table.as_ref() {
                        match attr_value(e, &cfg.column_name_attr)? {
                            Some(name) => {
                                columns.entry(table.clone()).or_default().insert(name);
                            }
                            None => warnings.push(format!(
                                "column without '{}' attribute in table '{}'",
                                cfg.column_name_attr, table
                            )),
                        }
                    }
                } else if include_extensions && cfg.is_extension(local) {
                    if let Some(table) = current_table.as_ref() {
                        for (key, _) in all_attrs(e)? {
                            columns
                                .entry(table.clone())
                                .or_default()
                                .insert(format!("{}{key}", cfg.extension_prefix));
                            ext_cols += 1;
                        }
                    }
                }
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                if cfg.matches(e.local_name().as_ref(), &cfg.table_tag) {
                    current_table = None;
                }
            }
            // quick-xml reports Eof without error for unclosed tags, so a
            // truncated export has to be caught by the depth counter.
            Event::Eof if depth > 0 => {
                return Err(CaliperError::Parse(format!(
                    "unexpected end of file with {depth} unclosed element(s)"
                )));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // Sorted column lists for repeatability across runs.
    let mut tables = IndexMap::new();
    for (name, cols) in columns {
        let row_count = rows.get(&name).copied().unwrap_or(0);
        tables.insert(
            name,
            TableShape {
                columns: cols.into_iter().collect(),
                rows: row_count,
            },
        );
    }
    tables.sort_keys();

    tracing::info!(
        tables = tables.len(),
        columns_total = tables.values().map(|t| t.columns.len()).sum::<usize>(),
        extension_columns = ext_cols,
        warnings = warnings.len(),
        "schema discovered"
    );

    Ok(DiscoveredSchema { tables, warnings })
}

/// One source row as read from the export: present columns only; the adapter
/// substitutes defaults for anything missing.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub table: String,
    pub values: IndexMap<String, String>,
}

/// Pass 2: stream (table, row) pairs to `sink`, applying the same vocabulary
/// as discovery.  Tables absent from `schema` are skipped (and counted), so
/// both passes see the same shapes.  Returns per-table row counts.
pub fn stream_rows<F>(
    xml_path: &Path,
    cfg: &SchemaConfig,
    schema: &DiscoveredSchema,
    include_extensions: bool,
    mut sink: F,
) -> CaliperResult<IndexMap<String, u64>>
where
    F: FnMut(SourceRow) -> CaliperResult<()>,
{
    let mut reader = Reader::from_file(xml_path)?;
    let mut buf = Vec::new();

    let mut current_table: Option<String> = None;
    let mut current_row: Option<IndexMap<String, String>> = None;
    // Column awaiting a text-content value (no `value` attribute present).
    let mut pending_column: Option<String> = None;
    let mut counts: IndexMap<String, u64> = IndexMap::new();
    let mut depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                // A self-closing column can never carry element text.
                let awaits_text = matches!(&event, Event::Start(_));
                if awaits_text {
                    depth += 1;
                }
                let local = e.local_name();
                let local = local.as_ref();
                if cfg.matches(local, &cfg.table_tag) {
                    let name = attr_value(e, &cfg.table_name_attr)?;
                    current_table = name.filter(|n| schema.tables.contains_key(n));
                } else if cfg.matches(local, &cfg.row_tag) {
                    if current_table.is_some() {
                        current_row = Some(IndexMap::new());
                    }
                } else if cfg.matches(local, &cfg.column_tag) {
                    if let (Some(_), Some(row)) = (current_table.as_ref(), current_row.as_mut()) {
                        if let Some(name) = attr_value(e, &cfg.column_name_attr)? {
                            match attr_value(e, &cfg.column_value_attr)? {
                                Some(value) => {
                                    row.insert(name, value);
                                }
                                None if awaits_text => pending_column = Some(name),
                                None => {}
                            }
                        }
                    }
                } else if include_extensions && cfg.is_extension(local) {
                    if let Some(row) = current_row.as_mut() {
                        for (key, value) in all_attrs(e)? {
                            row.insert(format!("{}{key}", cfg.extension_prefix), value);
                        }
                    }
                }
            }
            Event::Text(ref t) => {
                if let (Some(name), Some(row)) = (pending_column.as_ref(), current_row.as_mut()) {
                    let text = t.unescape()?;
                    let text = text.trim();
                    if !text.is_empty() {
                        row.insert(name.clone(), text.to_string());
                    }
                }
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                let local = e.local_name();
                let local = local.as_ref();
                if cfg.matches(local, &cfg.column_tag) {
                    pending_column = None;
                } else if cfg.matches(local, &cfg.row_tag) {
                    if let (Some(table), Some(values)) =
                        (current_table.clone(), current_row.take())
                    {
                        *counts.entry(table.clone()).or_insert(0) += 1;
                        sink(SourceRow { table, values })?;
                    }
                } else if cfg.matches(local, &cfg.table_tag) {
                    current_table = None;
                    current_row = None;
                }
            }
            Event::Eof if depth > 0 => {
                return Err(CaliperError::Parse(format!(
                    "unexpected end of file with {depth} unclosed element(s)"
                )));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(counts)
}

/// Sniff a vendor hint from the export when the caller declared none.
/// EA-style `t_*` table names indicate a Sparx export; anything else falls
/// through to the generic adapter.
pub fn sniff_vendor(schema: &DiscoveredSchema) -> Option<&'static str> {
    if schema.tables.keys().any(|t| t.starts_with("t_")) {
        Some("sparx")
    } else {
        None
    }
}
