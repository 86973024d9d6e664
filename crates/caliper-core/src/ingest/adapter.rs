//! Vendor adapters: pure mappings from source rows onto the canonical
//! vocabulary, selected through a registry keyed by (vendor, version).
//!
//! Adapters never write to the store.  Missing source fields get defaults;
//! unmapped source fields are kept in the row's overflow map and end up as
//! `tagged_value` rows, never discarded.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::errors::{CaliperError, CaliperResult};
use crate::ingest::discovery::SourceRow;
use crate::models::{
    AttributeRow, CanonicalRow, ConnectorRow, DiagramLinkRow, DiagramObjectRow, DiagramRow,
    ElementRow, OperationRow, PackageRow, TaggedValueRow, XrefRow,
};

/// One vendor/version mapping onto the canonical schema.
pub trait VendorAdapter: Send + Sync {
    fn vendor(&self) -> &str;
    fn version(&self) -> &str;

    /// Map one source row to a canonical row.  `None` means the adapter does
    /// not map this source table; the loader records that once per table as
    /// a normalization defect.
    fn normalize(&self, row: &SourceRow) -> Option<CanonicalRow>;
}

// ---------------------------------------------------------------------------
// Column helpers (case-insensitive, consuming)
// ---------------------------------------------------------------------------

fn take(values: &mut IndexMap<String, String>, candidates: &[&str]) -> Option<String> {
    for cand in candidates {
        if let Some(key) = values
            .keys()
            .find(|k| k.eq_ignore_ascii_case(cand))
            .cloned()
        {
            return values.shift_remove(&key);
        }
    }
    None
}

fn take_nonempty(values: &mut IndexMap<String, String>, candidates: &[&str]) -> Option<String> {
    take(values, candidates).filter(|v| !v.trim().is_empty())
}

fn take_i64(values: &mut IndexMap<String, String>, candidates: &[&str]) -> Option<i64> {
    take(values, candidates).and_then(|v| v.trim().parse::<i64>().ok())
}

// ---------------------------------------------------------------------------
// EA-style mapping core (shared by the Sparx and generic adapters)
// ---------------------------------------------------------------------------

/// Map one EA-style `t_*` row onto the canonical vocabulary.  Leftover
/// columns after mapping become the row's overflow extras.
fn normalize_ea_row(row: &SourceRow) -> Option<CanonicalRow> {
    let mut vals = row.values.clone();
    let out = match row.table.as_str() {
        "t_package" => CanonicalRow::Package(PackageRow {
            id: take_i64(&mut vals, &["Package_ID", "id"])?,
            parent_id: take_i64(&mut vals, &["Parent_ID", "parentid"]).filter(|v| *v != 0),
            name: take(&mut vals, &["Name"]).unwrap_or_default(),
            stereotype: take_nonempty(&mut vals, &["Stereotype"]),
            scope: take_nonempty(&mut vals, &["Scope"]),
            version: take_nonempty(&mut vals, &["Version"]),
            guid: take_nonempty(&mut vals, &["ea_guid", "guid"]),
            extras: vals,
        }),
        "t_object" => CanonicalRow::Element(ElementRow {
            id: take_i64(&mut vals, &["Object_ID", "id"])?,
            package_id: take_i64(&mut vals, &["Package_ID"]).filter(|v| *v != 0),
            name: take(&mut vals, &["Name"]).unwrap_or_default(),
            meta_type: take_nonempty(&mut vals, &["Object_Type", "type"])
                .unwrap_or_else(|| "Unknown".to_string()),
            stereotype: take_nonempty(&mut vals, &["Stereotype"]),
            status: take_nonempty(&mut vals, &["Status"]),
            author: take_nonempty(&mut vals, &["Author"]),
            complexity: take_nonempty(&mut vals, &["Complexity"]),
            guid: take_nonempty(&mut vals, &["ea_guid", "guid"]),
            parent_id: take_i64(&mut vals, &["ParentID", "Parent_ID"]).filter(|v| *v != 0),
            classifier_id: take_i64(&mut vals, &["Classifier", "Classifier_ID"])
                .filter(|v| *v != 0),
            pdata1: take_nonempty(&mut vals, &["PDATA1"]),
            extras: vals,
        }),
        "t_attribute" => CanonicalRow::Attribute(AttributeRow {
            id: take_i64(&mut vals, &["ID", "Attribute_ID"])?,
            element_id: take_i64(&mut vals, &["Object_ID", "Element_ID"])?,
            name: take(&mut vals, &["Name"]).unwrap_or_default(),
            attr_type: take_nonempty(&mut vals, &["Type"]),
            lower_bound: take_nonempty(&mut vals, &["LowerBound"]),
            upper_bound: take_nonempty(&mut vals, &["UpperBound"]),
            guid: take_nonempty(&mut vals, &["ea_guid", "guid"]),
            extras: vals,
        }),
        "t_operation" => CanonicalRow::Operation(OperationRow {
            id: take_i64(&mut vals, &["OperationID", "Operation_ID", "ID"])?,
            element_id: take_i64(&mut vals, &["Object_ID", "Element_ID"])?,
            name: take(&mut vals, &["Name"]).unwrap_or_default(),
            return_type: take_nonempty(&mut vals, &["Type", "ReturnType"]),
            scope: take_nonempty(&mut vals, &["Scope"]),
            guid: take_nonempty(&mut vals, &["ea_guid", "guid"]),
            extras: vals,
        }),
        "t_connector" => CanonicalRow::Connector(ConnectorRow {
            id: take_i64(&mut vals, &["Connector_ID", "id"])?,
            src_id: take_i64(&mut vals, &["Start_Object_ID", "src_id"])?,
            dst_id: take_i64(&mut vals, &["End_Object_ID", "dst_id"])?,
            connector_type: take_nonempty(&mut vals, &["Connector_Type", "type"])
                .unwrap_or_else(|| "Unknown".to_string()),
            stereotype: take_nonempty(&mut vals, &["Stereotype"]),
            direction: take_nonempty(&mut vals, &["Direction"]),
            name: take_nonempty(&mut vals, &["Name"]),
            guid: take_nonempty(&mut vals, &["ea_guid", "guid"]),
            extras: vals,
        }),
        "t_diagram" => CanonicalRow::Diagram(DiagramRow {
            id: take_i64(&mut vals, &["Diagram_ID", "id"])?,
            package_id: take_i64(&mut vals, &["Package_ID"]).filter(|v| *v != 0),
            name: take(&mut vals, &["Name"]).unwrap_or_default(),
            diagram_type: take_nonempty(&mut vals, &["Diagram_Type", "type"]),
            guid: take_nonempty(&mut vals, &["ea_guid", "guid"]),
            extras: vals,
        }),
        "t_diagramobjects" => CanonicalRow::DiagramObject(DiagramObjectRow {
            diagram_id: take_i64(&mut vals, &["Diagram_ID"])?,
            element_id: take_i64(&mut vals, &["Object_ID"])?,
            sequence: take_i64(&mut vals, &["Sequence"]),
            extras: vals,
        }),
        "t_diagramlinks" => CanonicalRow::DiagramLink(DiagramLinkRow {
            diagram_id: take_i64(&mut vals, &["DiagramID", "Diagram_ID"])?,
            connector_id: take_i64(&mut vals, &["ConnectorID", "Connector_ID"])?,
            hidden: take(&mut vals, &["Hidden"])
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            extras: vals,
        }),
        "t_taggedvalue" | "t_objectproperties" | "t_attributetag" | "t_connectortag" => {
            CanonicalRow::TaggedValue(TaggedValueRow {
                owner_guid: take_nonempty(
                    &mut vals,
                    &["ElementID", "ea_guid", "Object_ID", "AttrID", "ConnectorID"],
                )?,
                property: take_nonempty(&mut vals, &["Property", "Tag", "TagValue"])?,
                value: take(&mut vals, &["VALUE", "Value", "Notes"]),
            })
        }
        "t_xref" => CanonicalRow::Xref(XrefRow {
            client_guid: take_nonempty(&mut vals, &["Client"])?,
            supplier_guid: take_nonempty(&mut vals, &["Supplier"]),
            name: take_nonempty(&mut vals, &["Name"]),
            xref_type: take_nonempty(&mut vals, &["Type"]),
            description: take(&mut vals, &["Description"]),
        }),
        _ => return None,
    };
    Some(out)
}

/// Sparx EA vendor adapter (the reference vendor this pipeline grew up on).
pub struct SparxAdapter {
    version: String,
}

impl SparxAdapter {
    pub fn new(version: &str) -> Self {
        SparxAdapter {
            version: version.to_string(),
        }
    }
}

impl VendorAdapter for SparxAdapter {
    fn vendor(&self) -> &str {
        "sparx"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn normalize(&self, row: &SourceRow) -> Option<CanonicalRow> {
        normalize_ea_row(row)
    }
}

/// Generic best-effort adapter: the EA mapping core with tolerant,
/// case-insensitive column resolution.  Used when no vendor-specific
/// adapter matches and the registry allows the fallback.
pub struct GenericAdapter;

impl VendorAdapter for GenericAdapter {
    fn vendor(&self) -> &str {
        "generic"
    }

    fn version(&self) -> &str {
        ""
    }

    fn normalize(&self, row: &SourceRow) -> Option<CanonicalRow> {
        normalize_ea_row(row)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AdapterRegistryOptions {
    /// Permit falling through to the generic adapter when no (vendor,
    /// version) entry matches.
    pub allow_generic_fallback: bool,
}

impl Default for AdapterRegistryOptions {
    fn default() -> Self {
        AdapterRegistryOptions {
            allow_generic_fallback: true,
        }
    }
}

/// Registry keyed by (vendor, version) with a documented fallback order:
/// exact match, then the closest known version for that vendor, then the
/// generic adapter.  Every non-exact selection is logged, never silent.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn VendorAdapter>>,
    options: AdapterRegistryOptions,
}

impl AdapterRegistry {
    pub fn new(options: AdapterRegistryOptions) -> Self {
        let mut registry = AdapterRegistry {
            adapters: Vec::new(),
            options,
        };
        registry.register(Arc::new(SparxAdapter::new("17.1")));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn VendorAdapter>) {
        self.adapters.push(adapter);
    }

    /// Select the adapter for a (vendor, version) hint.
    pub fn select(
        &self,
        vendor: Option<&str>,
        version: Option<&str>,
    ) -> CaliperResult<Arc<dyn VendorAdapter>> {
        let vendor = vendor.unwrap_or("").trim();
        let version = version.unwrap_or("").trim();

        if !vendor.is_empty() {
            // Exact (vendor, version).
            if let Some(adapter) = self.adapters.iter().find(|a| {
                a.vendor().eq_ignore_ascii_case(vendor) && a.version() == version
            }) {
                return Ok(Arc::clone(adapter));
            }

            // Closest known version for the vendor; nearest below preferred.
            let mut candidates: Vec<&Arc<dyn VendorAdapter>> = self
                .adapters
                .iter()
                .filter(|a| a.vendor().eq_ignore_ascii_case(vendor))
                .collect();
            if !candidates.is_empty() {
                let requested = parse_version(version);
                candidates.sort_by_key(|a| version_distance(&requested, &parse_version(a.version())));
                let chosen = Arc::clone(candidates[0]);
                tracing::warn!(
                    requested_vendor = vendor,
                    requested_version = version,
                    chosen_version = chosen.version(),
                    "no exact adapter; using closest version for vendor"
                );
                return Ok(chosen);
            }
        }

        if self.options.allow_generic_fallback {
            tracing::warn!(
                requested_vendor = vendor,
                requested_version = version,
                "no vendor adapter registered; using generic best-effort adapter"
            );
            return Ok(Arc::new(GenericAdapter));
        }

        Err(CaliperError::Query(format!(
            "no adapter registered for vendor '{vendor}' version '{version}' \
             and generic fallback is disabled"
        )))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        AdapterRegistry::new(AdapterRegistryOptions::default())
    }
}

fn parse_version(version: &str) -> Vec<u32> {
    version
        .split(['.', '_', '-'])
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

/// Sort key for closest-version selection: versions at or below the request
/// beat versions above it, closer magnitude wins within each group.
fn version_distance(requested: &[u32], candidate: &[u32]) -> (u8, u64) {
    let to_scalar = |v: &[u32]| -> u64 {
        v.iter()
            .take(3)
            .enumerate()
            .map(|(i, part)| (*part as u64) * 1000u64.pow(2 - i as u32))
            .sum()
    };
    let req = to_scalar(requested);
    let cand = to_scalar(candidate);
    if cand <= req {
        (0, req - cand)
    } else {
        (1, cand - req)
    }
}
