//! Level 3: interface rigor — every port resolves to a type.

use indexmap::IndexMap;
use rusqlite::Connection;

use crate::errors::CaliperResult;
use crate::ladder::engine::{Predicate, RunContext};
use crate::models::{Fact, Measure, PredicateOutput};

/// `mml_3.ports_typed`: each port is typed, resolved through one of three
/// routes tried in order: the classifier reference, a direct GUID match on
/// the vendor classifier slot, or the GUID index.
pub struct PortsTyped;

impl Predicate for PortsTyped {
    fn probe_id(&self) -> &'static str {
        "mml_3.ports_typed"
    }

    fn level(&self) -> u8 {
        3
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["t_object"]
    }

    fn evaluate(&self, conn: &Connection, ctx: &RunContext) -> CaliperResult<PredicateOutput> {
        let mut stmt = conn.prepare(
            "SELECT p.id, COALESCE(p.name, ''),
                    CASE
                      WHEN p.classifier_id IS NOT NULL AND p.classifier_id != 0
                        THEN 'classifier'
                      WHEN p.pdata1_norm IS NOT NULL AND EXISTS (
                             SELECT 1 FROM element e
                             WHERE e.model_id = ?1 AND e.guid IS NOT NULL
                               AND UPPER(REPLACE(REPLACE(TRIM(e.guid), '{', ''), '}', ''))
                                   = p.pdata1_norm)
                        THEN 'pdata1_guid_direct'
                      WHEN p.pdata1_norm IS NOT NULL AND EXISTS (
                             SELECT 1 FROM guid_index g WHERE g.guid = p.pdata1_norm)
                        THEN 'pdata1_guid_map'
                      ELSE NULL
                    END AS typed_via
             FROM ir_port p
             ORDER BY LOWER(COALESCE(p.name, '')), p.id;",
        )?;
        let ports: Vec<(i64, String, Option<String>)> = stmt
            .query_map(rusqlite::params![ctx.model_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        let total = ports.len() as i64;
        let typed = ports.iter().filter(|(_, _, via)| via.is_some()).count() as i64;
        let untyped = total - typed;

        let mut facts: Vec<Fact> = Vec::new();
        let mut ok_kept = 0usize;
        let mut issue_kept = 0usize;
        for (id, name, typed_via) in &ports {
            let has_issue = typed_via.is_none();
            let kept = if has_issue { &mut issue_kept } else { &mut ok_kept };
            if *kept >= ctx.fact_bound {
                continue;
            }
            *kept += 1;
            facts.push(Fact {
                subject_type: "port".to_string(),
                subject_id: id.to_string(),
                subject_name: name.clone(),
                has_issue,
                meta: serde_json::json!({ "typed_via": typed_via }),
            });
        }

        let mut counts = IndexMap::new();
        counts.insert("ports_total".to_string(), serde_json::json!(total));
        counts.insert("ports_typed".to_string(), serde_json::json!(typed));
        counts.insert("ports_untyped".to_string(), serde_json::json!(untyped));

        // Vacuously true with no ports; block_has_port already reports the
        // missing ports at level 2.
        Ok(PredicateOutput {
            passed: untyped == 0,
            counts,
            facts,
            source_tables: vec!["t_object".to_string()],
            measure: Some(Measure::new(typed, total)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ir::build_ir;
    use crate::store::schema::SCHEMA_STATEMENTS;

    fn conn_with_schema() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn
    }

    #[test]
    fn resolves_each_typing_route() {
        let conn = conn_with_schema();
        conn.execute_batch(
            "INSERT INTO element (id, model_id, name, meta_type, guid) VALUES
               (1, 'm1', 'FlowSpec', 'Class', '{AA-1}');
             INSERT INTO element (id, model_id, name, meta_type, classifier_id) VALUES
               (10, 'm1', 'p_classifier', 'Port', 1);
             INSERT INTO element (id, model_id, name, meta_type, pdata1) VALUES
               (11, 'm1', 'p_direct', 'Port', '{aa-1}');
             INSERT INTO element (id, model_id, name, meta_type, pdata1) VALUES
               (12, 'm1', 'p_mapped', 'Port', 'BB-2');
             INSERT INTO element (id, model_id, name, meta_type) VALUES
               (13, 'm1', 'p_untyped', 'Port');
             INSERT INTO guid_index (guid, entity_kind, entity_id) VALUES
               ('BB-2', 'element', 99);",
        )
        .unwrap();
        build_ir(&conn, "m1").unwrap();

        let ctx = RunContext::new("m1", "sparx", "17.1");
        let out = PortsTyped.evaluate(&conn, &ctx).unwrap();

        assert!(!out.passed);
        assert_eq!(out.counts.get("ports_total"), Some(&serde_json::json!(4)));
        assert_eq!(out.counts.get("ports_typed"), Some(&serde_json::json!(3)));
        assert_eq!(out.counts.get("ports_untyped"), Some(&serde_json::json!(1)));

        let via = |name: &str| -> serde_json::Value {
            out.facts
                .iter()
                .find(|f| f.subject_name == name)
                .unwrap()
                .meta["typed_via"]
                .clone()
        };
        assert_eq!(via("p_classifier"), serde_json::json!("classifier"));
        assert_eq!(via("p_direct"), serde_json::json!("pdata1_guid_direct"));
        assert_eq!(via("p_mapped"), serde_json::json!("pdata1_guid_map"));
        assert_eq!(via("p_untyped"), serde_json::json!(null));
    }

    #[test]
    fn passes_only_when_all_ports_typed() {
        let conn = conn_with_schema();
        conn.execute_batch(
            "INSERT INTO element (id, model_id, name, meta_type, classifier_id) VALUES
               (10, 'm1', 'p1', 'Port', 7);",
        )
        .unwrap();
        build_ir(&conn, "m1").unwrap();

        let ctx = RunContext::new("m1", "sparx", "17.1");
        let out = PortsTyped.evaluate(&conn, &ctx).unwrap();
        assert!(out.passed);
        let measure = out.measure.unwrap();
        assert_eq!((measure.ok, measure.total), (1, 1));
    }

    #[test]
    fn no_ports_passes_vacuously() {
        let conn = conn_with_schema();
        build_ir(&conn, "m1").unwrap();
        let ctx = RunContext::new("m1", "sparx", "17.1");
        let out = PortsTyped.evaluate(&conn, &ctx).unwrap();
        assert!(out.passed);
        assert_eq!(out.counts.get("ports_total"), Some(&serde_json::json!(0)));
    }
}
