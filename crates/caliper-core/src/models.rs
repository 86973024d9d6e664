//! Shared record types for the canonical schema, predicate results, and
//! evidence documents, plus the hashing helpers used for model identifiers.

use std::io::Read;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CaliperResult;

// ---------------------------------------------------------------------------
// Canonical rows (adapter output, loader input)
// ---------------------------------------------------------------------------

/// Overflow map for vendor-specific source fields that have no canonical
/// column.  The loader persists these as `tagged_value` rows keyed by the
/// owning row's GUID, so nothing from the source is silently dropped.
pub type ExtraFields = IndexMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub stereotype: Option<String>,
    pub scope: Option<String>,
    pub version: Option<String>,
    pub guid: Option<String>,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementRow {
    pub id: i64,
    pub package_id: Option<i64>,
    pub name: String,
    pub meta_type: String,
    pub stereotype: Option<String>,
    pub status: Option<String>,
    pub author: Option<String>,
    pub complexity: Option<String>,
    pub guid: Option<String>,
    /// Vendor parent linkage (e.g. a port's owning block).
    pub parent_id: Option<i64>,
    /// Vendor classifier reference (typed-port resolution).
    pub classifier_id: Option<i64>,
    /// Vendor classifier GUID slot (normalized lazily by the IR builder).
    pub pdata1: Option<String>,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeRow {
    pub id: i64,
    pub element_id: i64,
    pub name: String,
    pub attr_type: Option<String>,
    pub lower_bound: Option<String>,
    pub upper_bound: Option<String>,
    pub guid: Option<String>,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationRow {
    pub id: i64,
    pub element_id: i64,
    pub name: String,
    pub return_type: Option<String>,
    pub scope: Option<String>,
    pub guid: Option<String>,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorRow {
    pub id: i64,
    pub src_id: i64,
    pub dst_id: i64,
    pub connector_type: String,
    pub stereotype: Option<String>,
    pub direction: Option<String>,
    pub name: Option<String>,
    pub guid: Option<String>,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagramRow {
    pub id: i64,
    pub package_id: Option<i64>,
    pub name: String,
    pub diagram_type: Option<String>,
    pub guid: Option<String>,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagramObjectRow {
    pub diagram_id: i64,
    pub element_id: i64,
    pub sequence: Option<i64>,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagramLinkRow {
    pub diagram_id: i64,
    pub connector_id: i64,
    pub hidden: bool,
    #[serde(default)]
    pub extras: ExtraFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaggedValueRow {
    pub owner_guid: String,
    pub property: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XrefRow {
    pub client_guid: String,
    pub supplier_guid: Option<String>,
    pub name: Option<String>,
    pub xref_type: Option<String>,
    pub description: Option<String>,
}

/// One normalized row emitted by a vendor adapter.  Explicit tagged records
/// with required canonical fields; vendor extras ride in the per-row overflow
/// map and never leak open-ended dictionaries into predicate logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CanonicalRow {
    Package(PackageRow),
    Element(ElementRow),
    Attribute(AttributeRow),
    Operation(OperationRow),
    Connector(ConnectorRow),
    Diagram(DiagramRow),
    DiagramObject(DiagramObjectRow),
    DiagramLink(DiagramLinkRow),
    TaggedValue(TaggedValueRow),
    Xref(XrefRow),
}

impl CanonicalRow {
    /// Canonical table this row lands in.
    pub fn table(&self) -> &'static str {
        match self {
            CanonicalRow::Package(_) => "package",
            CanonicalRow::Element(_) => "element",
            CanonicalRow::Attribute(_) => "attribute",
            CanonicalRow::Operation(_) => "operation",
            CanonicalRow::Connector(_) => "connector",
            CanonicalRow::Diagram(_) => "diagram",
            CanonicalRow::DiagramObject(_) => "diagram_object",
            CanonicalRow::DiagramLink(_) => "diagram_link",
            CanonicalRow::TaggedValue(_) => "tagged_value",
            CanonicalRow::Xref(_) => "xref",
        }
    }
}

// ---------------------------------------------------------------------------
// Predicate results and evidence
// ---------------------------------------------------------------------------

/// Execution outcome of one predicate.  `Missing` is distinct from `Failed`:
/// the rule could not be evaluated at all (absent prerequisite data or a
/// predicate bug), whereas `Failed` means it ran and found violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    Missing,
}

/// Bounded exemplar row attached to a predicate result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub subject_type: String,
    pub subject_id: String,
    #[serde(default)]
    pub subject_name: String,
    pub has_issue: bool,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Universal {ok, total, ratio} summary riding alongside raw counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub ok: i64,
    pub total: i64,
    pub ratio: f64,
}

impl Measure {
    pub fn new(ok: i64, total: i64) -> Self {
        let ratio = if total > 0 {
            ok as f64 / total as f64
        } else {
            0.0
        };
        Measure { ok, total, ratio }
    }
}

/// What a predicate hands back to the engine: a verdict plus the structured
/// evidence needed to make it citable.  Facts are bounded by the engine's
/// context; counters always reflect the full result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredicateOutput {
    pub passed: bool,
    pub counts: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub source_tables: Vec<String>,
    #[serde(default)]
    pub measure: Option<Measure>,
}

/// Engine-level record for one executed (or skipped) predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateResult {
    pub probe_id: String,
    pub level: u8,
    pub verdict: Verdict,
    pub counts: IndexMap<String, serde_json::Value>,
    pub facts: Vec<Fact>,
    pub source_tables: Vec<String>,
    pub measure: Option<Measure>,
    /// Diagnostic text when `verdict == Missing` because of an error.
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Denormalized, citable record derived from predicate results.
///
/// `doc_id` is `{model_id}/{probe_id}` for summaries and
/// `{model_id}/{probe_id}/{subject_type}/{subject_id}` for entity documents;
/// unique per run and deterministic across re-runs of the same IR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceDocument {
    pub doc_id: String,
    pub model_id: String,
    pub vendor: String,
    pub version: String,
    pub mml: u8,
    pub probe_id: String,
    pub doc_type: String,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub title: String,
    pub ctx_hdr: String,
    pub body_text: String,
    pub metadata: serde_json::Value,
    pub ts_ms: i64,
}

// ---------------------------------------------------------------------------
// Run reporting
// ---------------------------------------------------------------------------

/// Per-level rollup produced by the single-reducer aggregation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSummary {
    pub level: u8,
    pub expected: usize,
    pub passed: usize,
    pub failed: usize,
    pub missing: usize,
}

/// Wall time per pipeline stage, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub discover_ms: u64,
    pub load_ms: u64,
    pub ir_ms: u64,
    pub ladder_ms: u64,
    pub index_ms: u64,
}

/// What the pipeline returns to the API/job layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub model_id: String,
    pub vendor: String,
    pub version: String,
    pub maturity_level: u8,
    pub levels: Vec<LevelSummary>,
    pub results: Vec<PredicateResult>,
    pub evidence_docs: usize,
    pub defects: usize,
    pub timings: StageTimings,
}

// ---------------------------------------------------------------------------
// Hashing and normalization helpers
// ---------------------------------------------------------------------------

/// Stable short model identifier: sha256 of the raw export bytes, streamed in
/// 1 MiB chunks, truncated to the first 8 hex chars.  Content-based, so
/// identical uploads produce the same identifier.
pub fn compute_model_id(path: &Path) -> CaliperResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let digest = format!("{:x}", hasher.finalize());
    tracing::debug!(bytes = total, sha256_8 = %&digest[..8], "hashed export");
    Ok(digest[..8].to_string())
}

/// GUID normalization used everywhere a GUID is compared or indexed:
/// trim, strip `{` `}`, uppercase.  Empty and `<none>` placeholders map to
/// `None`.
pub fn normalize_guid(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "<none>" || trimmed == "&lt;none&gt;" {
        return None;
    }
    let cleaned: String = trimmed
        .chars()
        .filter(|c| *c != '{' && *c != '}')
        .collect::<String>()
        .to_uppercase();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn model_id_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.xml");
        let b = dir.path().join("b.xml");
        std::fs::File::create(&a)
            .unwrap()
            .write_all(b"<Table name=\"t_object\"/>")
            .unwrap();
        std::fs::File::create(&b)
            .unwrap()
            .write_all(b"<Table name=\"t_object\"/>")
            .unwrap();

        let id_a = compute_model_id(&a).unwrap();
        let id_b = compute_model_id(&b).unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(id_a.len(), 8);
        assert!(id_a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn model_id_differs_for_different_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.xml");
        let b = dir.path().join("b.xml");
        std::fs::write(&a, b"alpha").unwrap();
        std::fs::write(&b, b"bravo").unwrap();
        assert_ne!(
            compute_model_id(&a).unwrap(),
            compute_model_id(&b).unwrap()
        );
    }

    #[test]
    fn guid_normalization() {
        assert_eq!(
            normalize_guid(" {ab-12} ").as_deref(),
            Some("AB-12")
        );
        assert_eq!(normalize_guid("<none>"), None);
        assert_eq!(normalize_guid("   "), None);
        assert_eq!(normalize_guid("{}"), None);
    }

    #[test]
    fn measure_ratio_handles_zero_total() {
        let m = Measure::new(0, 0);
        assert_eq!(m.ratio, 0.0);
        let m = Measure::new(3, 4);
        assert!((m.ratio - 0.75).abs() < 1e-9);
    }
}
