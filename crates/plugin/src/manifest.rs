//! Plugin manifests.
//!
//! Each plugin ships a `plugin.yaml` in its directory describing the
//! runtime command, the modules it implements, and the capabilities it
//! needs. The manager derives the subprocess working directory and
//! environment from the manifest.

use std::collections::BTreeMap;
use std::path::PathBuf;

use aster_core::{DataType, ModuleId, PluginId};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Runtime description: how to start the plugin process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Implementation language tag (informational).
    pub language: String,
    /// Entry command, executed relative to the plugin directory.
    pub entry: String,
    /// Arguments passed to the entry command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Minimum engine version this plugin supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_engine_version: Option<Version>,
    /// Extra environment variables for the subprocess.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// One module implemented by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestModule {
    /// The module id.
    pub id: ModuleId,
    /// Display label.
    pub label: String,
    /// Display description.
    #[serde(default)]
    pub description: String,
    /// Category; defaults to the module namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Parameter schema (same shape as registry metadata).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params_schema: serde_json::Map<String, serde_json::Value>,
    /// Output schema.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub output_schema: serde_json::Map<String, serde_json::Value>,
    /// Declared input types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_types: Vec<DataType>,
    /// Declared output types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_types: Vec<DataType>,
}

/// A parsed plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin id.
    pub name: PluginId,
    /// Plugin version.
    pub version: Version,
    /// How to run the plugin.
    pub runtime: RuntimeSpec,
    /// Modules this plugin implements.
    #[serde(default)]
    pub modules: Vec<ManifestModule>,
    /// Declared capability names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Maximum concurrent processes for this plugin.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Plugin directory; set by the loader, not the manifest author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
}

fn default_max_instances() -> usize {
    1
}

impl PluginManifest {
    /// Parse a manifest from YAML.
    pub fn from_yaml(source: &str) -> Result<Self, PluginError> {
        let manifest: Self =
            serde_yaml::from_str(source).map_err(|e| PluginError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation beyond serde.
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.runtime.entry.trim().is_empty() {
            return Err(PluginError::Manifest("runtime.entry must not be empty".into()));
        }
        if self.modules.is_empty() {
            return Err(PluginError::Manifest(
                "a plugin must implement at least one module".into(),
            ));
        }
        if self.max_instances == 0 {
            return Err(PluginError::Manifest("max_instances must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for module in &self.modules {
            if !seen.insert(&module.id) {
                return Err(PluginError::Manifest(format!(
                    "duplicate module id {} in manifest",
                    module.id
                )));
            }
        }
        Ok(())
    }

    /// Attach the plugin directory (used as subprocess cwd).
    #[must_use]
    pub fn with_root_dir(mut self, dir: PathBuf) -> Self {
        self.root_dir = Some(dir);
        self
    }

    /// Whether this plugin implements the given module.
    #[must_use]
    pub fn implements(&self, module: &ModuleId) -> bool {
        self.modules.iter().any(|m| &m.id == module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
name: browser-tools
version: "1.2.0"
runtime:
  language: node
  entry: node
  args: ["dist/main.js"]
  min_engine_version: "0.1.0"
  env:
    NODE_ENV: production
modules:
  - id: browser.open
    label: Open Browser
    description: Opens a page
    input_types: [string]
    output_types: [browser_page]
  - id: browser.click
    label: Click
permissions: [browser.control, network.public]
max_instances: 2
"#;

    #[test]
    fn parse_full_manifest() {
        let manifest = PluginManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.name, "browser-tools");
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert_eq!(manifest.runtime.entry, "node");
        assert_eq!(manifest.runtime.args, vec!["dist/main.js"]);
        assert_eq!(manifest.runtime.env["NODE_ENV"], "production");
        assert_eq!(manifest.modules.len(), 2);
        assert_eq!(manifest.max_instances, 2);
        assert!(manifest.implements(&"browser.open".parse().unwrap()));
        assert!(!manifest.implements(&"browser.scroll".parse().unwrap()));
    }

    #[test]
    fn max_instances_defaults_to_one() {
        let manifest = PluginManifest::from_yaml(
            "name: p\nversion: \"0.1.0\"\nruntime: {language: python, entry: python3}\nmodules:\n  - {id: a.b, label: AB}\n",
        )
        .unwrap();
        assert_eq!(manifest.max_instances, 1);
    }

    #[test]
    fn empty_modules_rejected() {
        let err = PluginManifest::from_yaml(
            "name: p\nversion: \"0.1.0\"\nruntime: {language: python, entry: python3}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one module"));
    }

    #[test]
    fn duplicate_module_rejected() {
        let err = PluginManifest::from_yaml(
            "name: p\nversion: \"0.1.0\"\nruntime: {language: go, entry: ./bin}\nmodules:\n  - {id: a.b, label: One}\n  - {id: a.b, label: Two}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate module"));
    }

    #[test]
    fn zero_instances_rejected() {
        let err = PluginManifest::from_yaml(
            "name: p\nversion: \"0.1.0\"\nruntime: {language: go, entry: ./bin}\nmodules:\n  - {id: a.b, label: One}\nmax_instances: 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_instances"));
    }

    #[test]
    fn yaml_roundtrip() {
        let manifest = PluginManifest::from_yaml(MANIFEST).unwrap();
        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let back = PluginManifest::from_yaml(&yaml).unwrap();
        assert_eq!(back, manifest);
    }
}
