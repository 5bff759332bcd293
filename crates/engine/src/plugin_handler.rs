//! Bridges plugin-hosted modules into the [`ModuleHandler`] seam.
//!
//! The engine registers one [`PluginModuleHandler`] per module a plugin's
//! manifest declares; the invoker then treats plugin-backed modules
//! exactly like builtins, with fallback routing on top.

use std::sync::Arc;

use async_trait::async_trait;
use aster_core::{ModuleId, PluginId};
use aster_error::StepError;
use aster_plugin::{PluginInvoke, PluginManager};
use aster_registry::{ModuleCall, ModuleHandler, ModuleResponse};
use serde_json::Value;

/// A [`ModuleHandler`] that forwards invocations to a plugin subprocess.
pub struct PluginModuleHandler {
    manager: Arc<PluginManager>,
    plugin: PluginId,
    module: ModuleId,
    /// Plugin-level configuration passed on every invoke.
    config: Value,
}

impl PluginModuleHandler {
    /// Build a handler for one plugin-hosted module.
    #[must_use]
    pub fn new(manager: Arc<PluginManager>, plugin: PluginId, module: ModuleId) -> Self {
        Self {
            manager,
            plugin,
            module,
            config: Value::Null,
        }
    }

    /// Attach plugin-level configuration.
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl ModuleHandler for PluginModuleHandler {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        // The wire context is the sanitized InvokeContext as-is: the
        // public layer plus injected handles, never secrets.
        let context =
            serde_json::to_value(&call.context).map_err(|e| StepError::internal(e.to_string()))?;

        let request = PluginInvoke {
            step: self.module.to_string(),
            input: Value::Object(call.params),
            config: self.config.clone(),
            context,
            timeout_ms: if call.timeout_ms == 0 {
                u64::MAX
            } else {
                call.timeout_ms
            },
        };

        let result = self
            .manager
            .invoke(&self.plugin, request)
            .await
            .map_err(aster_plugin::PluginError::into_step_error)?;
        Ok(ModuleResponse::Raw(result))
    }
}

impl std::fmt::Debug for PluginModuleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModuleHandler")
            .field("plugin", &self.plugin)
            .field("module", &self.module)
            .finish()
    }
}

/// Register every module a plugin manifest declares, each backed by a
/// [`PluginModuleHandler`]. An existing in-process handler for the same
/// module id can be kept as the fallback via `legacy_fallback`.
pub fn register_plugin_modules(
    registry: &aster_registry::ModuleRegistry,
    manager: &Arc<PluginManager>,
    manifest: &aster_plugin::PluginManifest,
    legacy_fallback: impl Fn(&ModuleId) -> Option<Arc<dyn ModuleHandler>>,
) -> Result<(), aster_registry::RegistryError> {
    for module in &manifest.modules {
        let mut metadata = aster_registry::ModuleMetadata::new(
            module.id.as_str(),
            module.label.clone(),
            if module.description.is_empty() {
                module.label.clone()
            } else {
                module.description.clone()
            },
        );
        if let Some(category) = &module.category {
            metadata.category = category.clone();
        }
        metadata.input_types = module.input_types.clone();
        metadata.output_types = module.output_types.clone();
        if let Ok(params) = serde_json::from_value(Value::Object(module.params_schema.clone())) {
            metadata.params_schema = params;
        }
        if let Ok(outputs) = serde_json::from_value(Value::Object(module.output_schema.clone())) {
            metadata.output_schema = outputs;
        }

        let handler = Arc::new(PluginModuleHandler::new(
            manager.clone(),
            manifest.name.clone(),
            module.id.clone(),
        ));
        registry.register_with_fallback(metadata, handler, legacy_fallback(&module.id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aster_plugin::{ConnectionFactory, ManagerConfig, PluginConnection, PluginError,
        PluginManifest};
    use aster_registry::InvokeContext;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct EchoConnection;

    #[async_trait]
    impl PluginConnection for EchoConnection {
        async fn call(
            &mut self,
            _method: &str,
            params: Value,
            _timeout: Duration,
        ) -> Result<Value, PluginError> {
            // Echo the invoke input back as the result.
            Ok(params["input"].clone())
        }

        async fn shutdown(&mut self, _reason: &str, _grace: Duration) {}

        fn is_alive(&mut self) -> bool {
            true
        }
    }

    struct EchoFactory;

    #[async_trait]
    impl ConnectionFactory for EchoFactory {
        async fn connect(
            &self,
            _manifest: &PluginManifest,
            _config: &ManagerConfig,
        ) -> Result<Box<dyn PluginConnection>, PluginError> {
            Ok(Box::new(EchoConnection))
        }
    }

    #[tokio::test]
    async fn manifest_modules_register_with_plugin_handlers() {
        let manager = Arc::new(PluginManager::with_factory(
            ManagerConfig::default(),
            Arc::new(EchoFactory),
        ));
        let manifest = PluginManifest::from_yaml(
            r#"
name: browser-tools
version: "1.0.0"
runtime: {language: node, entry: node}
modules:
  - id: browser.open
    label: Open Browser
    description: Opens a page
    params_schema:
      url: {type: string, required: true}
    input_types: [string]
    output_types: [browser_page]
  - id: browser.click
    label: Click
"#,
        )
        .unwrap();
        manager.load(manifest.clone()).unwrap();

        let registry = aster_registry::ModuleRegistry::new();
        register_plugin_modules(&registry, &manager, &manifest, |_| None).unwrap();

        let open = registry.get(&"browser.open".parse().unwrap()).unwrap();
        assert_eq!(open.metadata.label, "Open Browser");
        assert!(open.metadata.params_schema.contains_key("url"));
        assert!(open.metadata.params_schema["url"].required);
        assert!(registry.get(&"browser.click".parse().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn forwards_params_and_returns_raw() {
        let manager = Arc::new(PluginManager::with_factory(
            ManagerConfig::default(),
            Arc::new(EchoFactory),
        ));
        manager
            .load(
                PluginManifest::from_yaml(
                    "name: echo\nversion: \"0.1.0\"\nruntime: {language: t, entry: t}\nmodules:\n  - {id: echo.say, label: Say}\n",
                )
                .unwrap(),
            )
            .unwrap();

        let handler = PluginModuleHandler::new(
            manager,
            PluginId::new("echo").unwrap(),
            "echo.say".parse().unwrap(),
        );
        let call = ModuleCall::new(
            json!({"text": "hello"}).as_object().unwrap().clone(),
            InvokeContext::default(),
        )
        .with_timeout_ms(5000);

        let response = handler.invoke(call).await.unwrap();
        match response {
            ModuleResponse::Raw(value) => assert_eq!(value["text"], "hello"),
            ModuleResponse::Shaped(_) => panic!("expected Raw"),
        }
    }
}
