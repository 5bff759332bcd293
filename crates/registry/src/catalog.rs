//! Catalog views and introspection types.
//!
//! Two audiences consume the registry: editors/LLM planners get the
//! **public** view (UI strings, contracts, examples — no execution hints,
//! no internal modules), operators get the **internal** view (everything).
//! Only the public view may cross a network boundary.

use aster_core::{DataType, ModuleId, NodeId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::{ModuleMetadata, Tier};
use crate::registry::RegistrySnapshot;
use crate::schema::{OutputField, ParamSpec};

/// Which audience a catalog is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogView {
    /// Safe for UI/LLM consumption; internal-tier modules excluded.
    Public,
    /// Full view including execution hints and internal modules.
    Internal,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// The module id.
    pub module_id: ModuleId,
    /// Display label.
    pub label: String,
    /// Display description.
    pub description: String,
    /// Category.
    pub category: String,
    /// Tier.
    pub tier: Tier,
    /// Search tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Parameter schema.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params_schema: IndexMap<String, ParamSpec>,
    /// Output schema.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub output_schema: IndexMap<String, OutputField>,
    /// Worked examples.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<crate::metadata::ModuleExample>,
    /// Execution hints — internal view only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<crate::metadata::ExecutionContract>,
    /// Security declarations — internal view only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<crate::metadata::SecurityContract>,
}

impl CatalogEntry {
    fn from_metadata(meta: &ModuleMetadata, view: CatalogView) -> Self {
        Self {
            module_id: meta.module_id.clone(),
            label: meta.label.clone(),
            description: meta.description.clone(),
            category: meta.category.clone(),
            tier: meta.tier,
            tags: meta.tags.clone(),
            params_schema: meta.params_schema.clone(),
            output_schema: meta.output_schema.clone(),
            examples: meta.examples.clone(),
            execution: match view {
                CatalogView::Public => None,
                CatalogView::Internal => Some(meta.execution.clone()),
            },
            security: match view {
                CatalogView::Public => None,
                CatalogView::Internal => Some(meta.security.clone()),
            },
        }
    }
}

/// Flat catalog listing.
#[must_use]
pub fn catalog_flat(snapshot: &RegistrySnapshot, view: CatalogView) -> Vec<CatalogEntry> {
    snapshot
        .all_metadata()
        .iter()
        .filter(|meta| view == CatalogView::Internal || meta.tier != Tier::Internal)
        .map(|meta| CatalogEntry::from_metadata(meta, view))
        .collect()
}

/// Flat catalog with `*_key` fields resolved against a translation bundle.
///
/// Entries fall back to the English strings already on the metadata when
/// the bundle has no translation.
#[must_use]
pub fn catalog_flat_localized(
    snapshot: &RegistrySnapshot,
    view: CatalogView,
    translator: &crate::i18n::Translator,
) -> Vec<CatalogEntry> {
    snapshot
        .all_metadata()
        .iter()
        .filter(|meta| view == CatalogView::Internal || meta.tier != Tier::Internal)
        .map(|meta| {
            let mut entry = CatalogEntry::from_metadata(meta, view);
            entry.label = translator
                .resolve(meta.label_key.as_deref(), &meta.label)
                .to_owned();
            entry.description = translator
                .resolve(meta.description_key.as_deref(), &meta.description)
                .to_owned();
            entry
        })
        .collect()
}

/// Tiered catalog grouping, in tier display order.
#[must_use]
pub fn catalog_tiered(
    snapshot: &RegistrySnapshot,
    view: CatalogView,
) -> IndexMap<Tier, Vec<CatalogEntry>> {
    let mut tiers: IndexMap<Tier, Vec<CatalogEntry>> = IndexMap::new();
    for tier in [Tier::Featured, Tier::Standard, Tier::Toolkit, Tier::Internal] {
        if tier == Tier::Internal && view == CatalogView::Public {
            continue;
        }
        tiers.insert(tier, Vec::new());
    }
    for entry in catalog_flat(snapshot, view) {
        if let Some(bucket) = tiers.get_mut(&entry.tier) {
            bucket.push(entry);
        }
    }
    tiers
}

// ── Introspection (VarCatalog) ──────────────────────────────────────────────

/// Introspection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrospectMode {
    /// Editor mode: types inferred from output schemas.
    Edit,
    /// Runtime mode: values observed from an execution trace.
    Runtime,
}

/// One referencable output field of an ancestor step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarField {
    /// Field name within the step's output.
    pub name: String,
    /// Inferred type (edit mode).
    pub data_type: DataType,
    /// Observed value (runtime mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,
}

/// Everything one ancestor step offers to variable references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarEntry {
    /// The ancestor's node id.
    pub node_id: NodeId,
    /// The name references use (output alias when declared).
    pub reference_name: String,
    /// The ancestor's module.
    pub module_id: ModuleId,
    /// Referencable fields.
    pub fields: Vec<VarField>,
}

/// The variable catalog for one node: what `{{...}}` can reach from there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarCatalog {
    /// The node the catalog was computed for.
    pub node_id: Option<NodeId>,
    /// Reachable ancestors, in topological order.
    pub entries: Vec<VarEntry>,
    /// Declared workflow parameter names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}
