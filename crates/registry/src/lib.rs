#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Aster Registry
//!
//! Module metadata, registration, catalog, and connection compatibility.
//!
//! Modules register explicitly — a [`ModuleMetadata`] literal plus a
//! [`ModuleHandler`] — at process start or on hot reload. Executions
//! capture an immutable [`RegistrySnapshot`] when they begin; the catalog
//! renders [`CatalogView::Public`] for editors and LLM planners and
//! [`CatalogView::Internal`] for operators.

pub mod catalog;
pub mod error;
pub mod handler;
pub mod i18n;
pub mod lint;
pub mod metadata;
pub mod registry;
pub mod schema;

pub use catalog::{
    catalog_flat, catalog_flat_localized, catalog_tiered, CatalogEntry, CatalogView,
    IntrospectMode, VarCatalog, VarEntry, VarField,
};
pub use error::RegistryError;
pub use handler::{InvokeContext, ModuleCall, ModuleHandler, ModuleResponse};
pub use i18n::{metadata_key, BundleError, Translator};
pub use lint::{has_blocking, lint, LintFinding, Severity};
pub use metadata::{
    Capability, ContextTag, ExecutionContract, ModuleExample, ModuleMetadata, PortDecl,
    SecurityContract, Stability, Tier,
};
pub use registry::{ConnectVerdict, ModuleRegistry, RegisteredModule, RegistrySnapshot};
pub use schema::{redact_secret_params, validate_params, OutputField, ParamSpec};
