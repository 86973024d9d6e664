//! Level 1: the export is structurally complete and elements are named.

use indexmap::IndexMap;
use rusqlite::Connection;

use crate::errors::CaliperResult;
use crate::ladder::engine::{Predicate, RunContext};
use crate::models::{Fact, Measure, PredicateOutput};

/// Tables a full Sparx EA export carries.  The census probe compares the
/// discovered tables against this list.
pub const EXPECTED_SOURCE_TABLES: &[&str] = &[
    "t_package",
    "t_object",
    "t_objectconstraint",
    "t_objectproperties",
    "t_attribute",
    "t_attributetag",
    "t_operation",
    "t_operationparams",
    "t_connector",
    "t_connectortag",
    "t_diagram",
    "t_diagramobjects",
    "t_diagramlinks",
    "t_taggedvalue",
    "t_xref",
];

/// `mml_1.count_tables`: every expected source table made it through ingest.
pub struct CountTables;

impl Predicate for CountTables {
    fn probe_id(&self) -> &'static str {
        "mml_1.count_tables"
    }

    fn level(&self) -> u8 {
        1
    }

    // The census probe itself has no prerequisites; it runs on any store.
    fn required_source_tables(&self) -> &'static [&'static str] {
        &[]
    }

    fn evaluate(&self, conn: &Connection, ctx: &RunContext) -> CaliperResult<PredicateOutput> {
        let mut stmt = conn.prepare("SELECT name FROM source_table;")?;
        let present: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let missing: Vec<&str> = EXPECTED_SOURCE_TABLES
            .iter()
            .copied()
            .filter(|t| !present.iter().any(|p| p == t))
            .collect();

        let facts: Vec<Fact> = missing
            .iter()
            .take(ctx.fact_bound)
            .map(|table| Fact {
                subject_type: "source_table".to_string(),
                subject_id: table.to_string(),
                subject_name: table.to_string(),
                has_issue: true,
                meta: serde_json::json!({ "expected": true, "present": false }),
            })
            .collect();

        let expected = EXPECTED_SOURCE_TABLES.len() as i64;
        let found = expected - missing.len() as i64;
        let mut counts = IndexMap::new();
        counts.insert("expected".to_string(), serde_json::json!(expected));
        counts.insert("present".to_string(), serde_json::json!(found));
        counts.insert("missing_tables".to_string(), serde_json::json!(missing));

        Ok(PredicateOutput {
            passed: missing.is_empty(),
            counts,
            facts,
            source_tables: EXPECTED_SOURCE_TABLES.iter().map(|s| s.to_string()).collect(),
            measure: Some(Measure::new(found, expected)),
        })
    }
}

/// `mml_1.nonempty_names`: every element carries a non-blank name.
pub struct NonemptyNames;

impl Predicate for NonemptyNames {
    fn probe_id(&self) -> &'static str {
        "mml_1.nonempty_names"
    }

    fn level(&self) -> u8 {
        1
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["t_object"]
    }

    fn evaluate(&self, conn: &Connection, ctx: &RunContext) -> CaliperResult<PredicateOutput> {
        let (total, unnamed): (i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN name IS NULL OR TRIM(name) = '' THEN 1 ELSE 0 END), 0)
             FROM element WHERE model_id = ?1;",
            rusqlite::params![ctx.model_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let named = total - unnamed;

        let mut stmt = conn.prepare(
            "SELECT id, meta_type FROM element
             WHERE model_id = ?1 AND (name IS NULL OR TRIM(name) = '')
             ORDER BY id LIMIT ?2;",
        )?;
        let facts: Vec<Fact> = stmt
            .query_map(
                rusqlite::params![ctx.model_id, ctx.fact_bound as i64],
                |row| {
                    let id: i64 = row.get(0)?;
                    let meta_type: String = row.get(1)?;
                    Ok(Fact {
                        subject_type: "element".to_string(),
                        subject_id: id.to_string(),
                        subject_name: String::new(),
                        has_issue: true,
                        meta: serde_json::json!({ "meta_type": meta_type }),
                    })
                },
            )?
            .collect::<Result<_, _>>()?;

        let mut counts = IndexMap::new();
        counts.insert("total_elements".to_string(), serde_json::json!(total));
        counts.insert("unnamed".to_string(), serde_json::json!(unnamed));
        counts.insert("named".to_string(), serde_json::json!(named));

        Ok(PredicateOutput {
            passed: unnamed == 0,
            counts,
            facts,
            source_tables: vec!["t_object".to_string()],
            measure: Some(Measure::new(named, total)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::SCHEMA_STATEMENTS;

    fn conn_with_schema() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn
    }

    fn census(conn: &Connection, tables: &[&str]) {
        for t in tables {
            conn.execute(
                "INSERT INTO source_table(name, row_count, column_count) VALUES (?1, 1, 1);",
                rusqlite::params![t],
            )
            .unwrap();
        }
    }

    #[test]
    fn count_tables_reports_each_missing_table() {
        let conn = conn_with_schema();
        let mut present: Vec<&str> = EXPECTED_SOURCE_TABLES.to_vec();
        present.retain(|t| *t != "t_connector");
        census(&conn, &present);

        let ctx = RunContext::new("m1", "sparx", "17.1");
        let out = CountTables.evaluate(&conn, &ctx).unwrap();

        assert!(!out.passed);
        assert_eq!(
            out.counts.get("missing_tables"),
            Some(&serde_json::json!(["t_connector"]))
        );
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].subject_id, "t_connector");
    }

    #[test]
    fn count_tables_passes_on_full_census() {
        let conn = conn_with_schema();
        census(&conn, EXPECTED_SOURCE_TABLES);

        let ctx = RunContext::new("m1", "sparx", "17.1");
        let out = CountTables.evaluate(&conn, &ctx).unwrap();
        assert!(out.passed);
        let measure = out.measure.unwrap();
        assert_eq!((measure.ok, measure.total), (15, 15));
    }

    #[test]
    fn nonempty_names_counts_blank_and_null() {
        let conn = conn_with_schema();
        conn.execute_batch(
            "INSERT INTO element (id, model_id, name, meta_type) VALUES
               (1, 'm1', 'Pump', 'Class'),
               (2, 'm1', '   ', 'Class'),
               (3, 'm1', NULL, 'Port');",
        )
        .unwrap();

        let ctx = RunContext::new("m1", "sparx", "17.1");
        let out = NonemptyNames.evaluate(&conn, &ctx).unwrap();

        assert!(!out.passed);
        assert_eq!(out.counts.get("total_elements"), Some(&serde_json::json!(3)));
        assert_eq!(out.counts.get("unnamed"), Some(&serde_json::json!(2)));
        assert_eq!(out.counts.get("named"), Some(&serde_json::json!(1)));
        assert_eq!(out.facts.len(), 2);
        let measure = out.measure.unwrap();
        assert!((measure.ratio - 1.0 / 3.0).abs() < 1e-9);
    }
}
