//! Level 2: structural decomposition — every block exposes at least one port.

use indexmap::IndexMap;
use rusqlite::Connection;

use crate::errors::CaliperResult;
use crate::ladder::engine::{Predicate, RunContext};
use crate::models::{Fact, Measure, PredicateOutput};

/// `mml_2.block_has_port`: each block owns at least one port via the vendor
/// parent linkage.
pub struct BlockHasPort;

impl Predicate for BlockHasPort {
    fn probe_id(&self) -> &'static str {
        "mml_2.block_has_port"
    }

    fn level(&self) -> u8 {
        2
    }

    fn required_source_tables(&self) -> &'static [&'static str] {
        &["t_object"]
    }

    fn evaluate(&self, conn: &Connection, ctx: &RunContext) -> CaliperResult<PredicateOutput> {
        let mut stmt = conn.prepare(
            "SELECT b.id, COALESCE(b.name, ''), COUNT(p.id) AS ports
             FROM ir_block b
             LEFT JOIN ir_port p ON p.parent_id = b.id
             GROUP BY b.id, b.name
             ORDER BY LOWER(COALESCE(b.name, '')), b.id;",
        )?;
        let blocks: Vec<(i64, String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;

        let total = blocks.len() as i64;
        let with_ports = blocks.iter().filter(|(_, _, n)| *n > 0).count() as i64;
        let missing = total - with_ports;

        let mut facts: Vec<Fact> = Vec::new();
        let mut ok_kept = 0usize;
        let mut issue_kept = 0usize;
        for (id, name, ports) in &blocks {
            let has_issue = *ports == 0;
            let kept = if has_issue { &mut issue_kept } else { &mut ok_kept };
            if *kept >= ctx.fact_bound {
                continue;
            }
            *kept += 1;
            facts.push(Fact {
                subject_type: "block".to_string(),
                subject_id: id.to_string(),
                subject_name: name.clone(),
                has_issue,
                meta: serde_json::json!({ "ports": ports }),
            });
        }

        let mut counts = IndexMap::new();
        counts.insert("blocks_total".to_string(), serde_json::json!(total));
        counts.insert("blocks_with_ports".to_string(), serde_json::json!(with_ports));
        counts.insert("blocks_missing_ports".to_string(), serde_json::json!(missing));

        // Vacuously true on a model with no blocks; lower levels flag the
        // empty model, not this predicate.
        Ok(PredicateOutput {
            passed: missing == 0,
            counts,
            facts,
            source_tables: vec!["t_object".to_string()],
            measure: Some(Measure::new(with_ports, total)),
        })
    }
}
