//! Module metadata.
//!
//! Every registered module carries one [`ModuleMetadata`] literal: identity,
//! classification, UI strings, the parameter/output contract, the execution
//! contract, security declarations, and worked examples. Registration is
//! explicit — a metadata value plus a handler — with no reflection or
//! decorator machinery.

use aster_core::{DataType, ModuleId, PortSemantics};
use indexmap::IndexMap;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{OutputField, ParamSpec};

/// Catalog tier a module is surfaced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Prominently surfaced in editors.
    Featured,
    /// The default tier.
    #[default]
    Standard,
    /// Power-user toolkit; collapsed by default.
    Toolkit,
    /// Hidden from the public catalog.
    Internal,
}

/// Stability of a module's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    /// Contract is frozen.
    #[default]
    Stable,
    /// Contract may still change in compatible ways.
    Beta,
    /// Contract may change incompatibly.
    Alpha,
    /// No guarantees at all.
    Experimental,
    /// Scheduled for removal.
    Deprecated,
}

/// The fixed capability vocabulary modules may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Outbound connections to the public internet.
    NetworkPublic,
    /// Connections to private address space.
    NetworkPrivate,
    /// Read filesystem paths.
    FilesystemRead,
    /// Write filesystem paths.
    FilesystemWrite,
    /// Spawn shell commands.
    ShellExec,
    /// Resolve credential handles.
    CredentialsAccess,
    /// Handle personally identifiable information.
    PiiAccess,
    /// Drive a browser instance.
    BrowserControl,
}

/// Context-type tags for the context protocol
/// (`requires_context` / `provides_context`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTag {
    /// A live browser instance.
    Browser,
    /// A browser page.
    Page,
    /// A file handle.
    File,
    /// Generic tabular/document data.
    Data,
    /// A parsed API response.
    ApiResponse,
}

/// A declared input or output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDecl {
    /// Port key (e.g. `"in"`, `"out"`, `"true"`).
    pub key: String,
    /// Payload type on this port.
    #[serde(default = "default_port_type")]
    pub data_type: DataType,
    /// Control-flow tag for decision ports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantics: Option<PortSemantics>,
}

fn default_port_type() -> DataType {
    DataType::Any
}

impl PortDecl {
    /// An `any`-typed port.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data_type: DataType::Any,
            semantics: None,
        }
    }

    /// Set the payload type.
    #[must_use]
    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Tag with control-flow semantics.
    #[must_use]
    pub fn with_semantics(mut self, semantics: PortSemantics) -> Self {
        self.semantics = Some(semantics);
        self
    }
}

/// Execution-contract declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContract {
    /// Module-level timeout in milliseconds.
    pub timeout_ms: u64,
    /// Whether failed invocations may be retried.
    pub retryable: bool,
    /// Upper bound on retries regardless of step policy.
    pub max_retries: u32,
    /// Whether concurrent invocations are safe.
    pub concurrent_safe: bool,
    /// Same inputs always produce the same outputs.
    pub deterministic: bool,
    /// Safe to re-execute during replay.
    pub replayable: bool,
    /// Side-effect tags (free-form, e.g. `"sends_email"`).
    pub side_effects: Vec<String>,
}

impl Default for ExecutionContract {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retryable: false,
            max_retries: 3,
            concurrent_safe: true,
            deterministic: false,
            replayable: true,
            side_effects: Vec::new(),
        }
    }
}

/// Security declarations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityContract {
    /// Module needs resolved credential values at invoke time.
    pub requires_credentials: bool,
    /// Module processes sensitive payloads.
    pub handles_sensitive_data: bool,
    /// Named permissions enforced by the host policy.
    pub required_permissions: Vec<String>,
    /// Declared capabilities.
    pub capabilities: Vec<Capability>,
}

/// A worked example shipped with a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleExample {
    /// Stable example id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Example parameter values.
    pub params: IndexMap<String, Value>,
    /// Expected output, when deterministic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
}

/// Complete metadata for one registered module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    // ── Identity ────────────────────────────────────────────────────
    /// The module id (`category.action` or `category.subcategory.action`).
    pub module_id: ModuleId,
    /// Module implementation version.
    pub version: Version,
    /// Version of the metadata contract itself.
    #[serde(default = "default_spec_version")]
    pub spec_version: u32,

    // ── Classification ──────────────────────────────────────────────
    /// Category (usually the namespace).
    pub category: String,
    /// Free-form tags for search.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Catalog tier.
    #[serde(default)]
    pub tier: Tier,
    /// Contract stability.
    #[serde(default)]
    pub stability: Stability,

    // ── UI ──────────────────────────────────────────────────────────
    /// Display label (English fallback).
    pub label: String,
    /// Display description (English fallback).
    pub description: String,
    /// i18n key for the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_key: Option<String>,
    /// i18n key for the description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_key: Option<String>,
    /// Icon name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Accent color.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    // ── Contract ────────────────────────────────────────────────────
    /// Parameter schema, in declaration order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params_schema: IndexMap<String, ParamSpec>,
    /// Output field schema.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub output_schema: IndexMap<String, OutputField>,
    /// Declared input data types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_types: Vec<DataType>,
    /// Declared output data types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_types: Vec<DataType>,
    /// Input ports; defaults to a single `any`-typed `"in"`.
    #[serde(default = "default_input_ports")]
    pub input_ports: Vec<PortDecl>,
    /// Output ports; defaults to a single `any`-typed `"out"`.
    #[serde(default = "default_output_ports")]
    pub output_ports: Vec<PortDecl>,
    /// Patterns of modules allowed to connect into this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub can_receive_from: Vec<String>,
    /// Patterns of modules this one may connect to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub can_connect_to: Vec<String>,
    /// Explicit start capability; inferred from `input_types` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_be_start: Option<bool>,

    // ── Contracts ───────────────────────────────────────────────────
    /// Execution contract.
    #[serde(default)]
    pub execution: ExecutionContract,
    /// Security declarations.
    #[serde(default)]
    pub security: SecurityContract,
    /// Context types this module needs present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_context: Vec<ContextTag>,
    /// Context types this module provides downstream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides_context: Vec<ContextTag>,

    // ── Examples ────────────────────────────────────────────────────
    /// Worked examples, in display order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<ModuleExample>,
}

fn default_spec_version() -> u32 {
    1
}

fn default_input_ports() -> Vec<PortDecl> {
    vec![PortDecl::new(aster_core::DEFAULT_INPUT_PORT)]
}

fn default_output_ports() -> Vec<PortDecl> {
    vec![PortDecl::new(aster_core::DEFAULT_OUTPUT_PORT)]
}

impl ModuleMetadata {
    /// Minimal metadata with defaults everywhere else.
    pub fn new(
        module_id: &str,
        label: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let module_id = ModuleId::new(module_id).expect("valid module id literal");
        let category = module_id.namespace().to_owned();
        Self {
            module_id,
            version: Version::new(0, 1, 0),
            spec_version: default_spec_version(),
            category,
            tags: Vec::new(),
            tier: Tier::Standard,
            stability: Stability::Stable,
            label: label.into(),
            description: description.into(),
            label_key: None,
            description_key: None,
            icon: None,
            color: None,
            params_schema: IndexMap::new(),
            output_schema: IndexMap::new(),
            input_types: Vec::new(),
            output_types: Vec::new(),
            input_ports: default_input_ports(),
            output_ports: default_output_ports(),
            can_receive_from: Vec::new(),
            can_connect_to: Vec::new(),
            can_be_start: None,
            execution: ExecutionContract::default(),
            security: SecurityContract::default(),
            requires_context: Vec::new(),
            provides_context: Vec::new(),
            examples: Vec::new(),
        }
    }

    /// Set the tier.
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the stability.
    #[must_use]
    pub fn with_stability(mut self, stability: Stability) -> Self {
        self.stability = stability;
        self
    }

    /// Declare a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.params_schema.insert(name.into(), spec);
        self
    }

    /// Declare an output field.
    #[must_use]
    pub fn with_output_field(mut self, name: impl Into<String>, field: OutputField) -> Self {
        self.output_schema.insert(name.into(), field);
        self
    }

    /// Declare input types.
    #[must_use]
    pub fn with_input_types(mut self, types: Vec<DataType>) -> Self {
        self.input_types = types;
        self
    }

    /// Declare output types.
    #[must_use]
    pub fn with_output_types(mut self, types: Vec<DataType>) -> Self {
        self.output_types = types;
        self
    }

    /// Replace the input ports.
    #[must_use]
    pub fn with_input_ports(mut self, ports: Vec<PortDecl>) -> Self {
        self.input_ports = ports;
        self
    }

    /// Replace the output ports.
    #[must_use]
    pub fn with_output_ports(mut self, ports: Vec<PortDecl>) -> Self {
        self.output_ports = ports;
        self
    }

    /// Set the explicit start capability.
    #[must_use]
    pub fn with_can_be_start(mut self, value: bool) -> Self {
        self.can_be_start = Some(value);
        self
    }

    /// Replace the execution contract.
    #[must_use]
    pub fn with_execution(mut self, execution: ExecutionContract) -> Self {
        self.execution = execution;
        self
    }

    /// Replace the security declarations.
    #[must_use]
    pub fn with_security(mut self, security: SecurityContract) -> Self {
        self.security = security;
        self
    }

    /// Append a worked example.
    #[must_use]
    pub fn with_example(mut self, example: ModuleExample) -> Self {
        self.examples.push(example);
        self
    }

    /// Whether this module may start a workflow: the explicit flag, or
    /// inferred from `input_types` being empty or `{any}`.
    #[must_use]
    pub fn effective_can_be_start(&self) -> bool {
        if let Some(explicit) = self.can_be_start {
            return explicit;
        }
        self.input_types.is_empty() || self.input_types == [DataType::Any]
    }

    /// Find a declared output port.
    #[must_use]
    pub fn output_port(&self, key: &str) -> Option<&PortDecl> {
        self.output_ports.iter().find(|p| p.key == key)
    }

    /// Find a declared input port.
    #[must_use]
    pub fn input_port(&self, key: &str) -> Option<&PortDecl> {
        self.input_ports.iter().find(|p| p.key == key)
    }

    /// Whether `other` may connect into this module per `can_receive_from`.
    #[must_use]
    pub fn accepts_source(&self, other: &ModuleId) -> bool {
        self.can_receive_from.is_empty()
            || self
                .can_receive_from
                .iter()
                .any(|pattern| other.matches_pattern(pattern))
    }

    /// Whether this module may connect to `other` per `can_connect_to`.
    #[must_use]
    pub fn allows_target(&self, other: &ModuleId) -> bool {
        self.can_connect_to.is_empty()
            || self
                .can_connect_to
                .iter()
                .any(|pattern| other.matches_pattern(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ParamSpec;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn minimal_metadata_defaults() {
        let meta = ModuleMetadata::new("string.uppercase", "Uppercase", "Uppercases text");
        assert_eq!(meta.category, "string");
        assert_eq!(meta.tier, Tier::Standard);
        assert_eq!(meta.stability, Stability::Stable);
        assert_eq!(meta.input_ports.len(), 1);
        assert_eq!(meta.input_ports[0].key, "in");
        assert_eq!(meta.output_ports[0].key, "out");
        assert_eq!(meta.execution.timeout_ms, 30_000);
    }

    #[test]
    fn start_inference() {
        let no_inputs = ModuleMetadata::new("flow.start", "Start", "Entry point");
        assert!(no_inputs.effective_can_be_start());

        let any_input = ModuleMetadata::new("util.echo", "Echo", "Echoes")
            .with_input_types(vec![DataType::Any]);
        assert!(any_input.effective_can_be_start());

        let typed = ModuleMetadata::new("string.trim", "Trim", "Trims")
            .with_input_types(vec![DataType::String]);
        assert!(!typed.effective_can_be_start());

        let explicit = ModuleMetadata::new("string.trim", "Trim", "Trims")
            .with_input_types(vec![DataType::String])
            .with_can_be_start(true);
        assert!(explicit.effective_can_be_start());
    }

    #[test]
    fn pattern_allowlists() {
        let meta = ModuleMetadata::new("browser.click", "Click", "Clicks an element");
        // Empty lists allow everything.
        assert!(meta.accepts_source(&"http.request".parse().unwrap()));

        let mut restricted = ModuleMetadata::new("browser.click", "Click", "Clicks an element");
        restricted.can_receive_from = vec!["browser.*".into()];
        assert!(restricted.accepts_source(&"browser.open".parse().unwrap()));
        assert!(!restricted.accepts_source(&"http.request".parse().unwrap()));
    }

    #[test]
    fn port_lookup() {
        let meta = ModuleMetadata::new("flow.branch", "Branch", "Two-way branch")
            .with_output_ports(vec![
                PortDecl::new("true").with_semantics(aster_core::PortSemantics::True),
                PortDecl::new("false").with_semantics(aster_core::PortSemantics::False),
            ]);
        assert!(meta.output_port("true").is_some());
        assert!(meta.output_port("out").is_none());
        assert!(meta.input_port("in").is_some());
    }

    #[test]
    fn serde_roundtrip() {
        let meta = ModuleMetadata::new("http.request", "HTTP Request", "Makes a request")
            .with_param("url", ParamSpec::string().required())
            .with_tier(Tier::Featured)
            .with_example(ModuleExample {
                id: "get".into(),
                title: "Simple GET".into(),
                params: IndexMap::from([("url".to_owned(), json!("https://example.com"))]),
                expected: None,
            });
        let json = serde_json::to_string(&meta).unwrap();
        let back: ModuleMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn capability_wire_form() {
        assert_eq!(
            serde_json::to_string(&Capability::NetworkPublic).unwrap(),
            r#""network_public""#
        );
        assert_eq!(
            serde_json::to_string(&Capability::BrowserControl).unwrap(),
            r#""browser_control""#
        );
    }
}
