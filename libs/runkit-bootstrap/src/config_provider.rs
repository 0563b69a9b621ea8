use crate::config::AppConfig;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Configuration provider trait for backend modules
pub trait ConfigProvider: Send + Sync {
    /// Get the configuration for a specific module
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration for module '{module}': {source}")]
    InvalidModuleConfig {
        module: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Deserialize a module's section into `T`; a missing section yields `T::default()`.
pub fn module_config_typed<T>(
    provider: &dyn ConfigProvider,
    module_name: &str,
) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    match provider.get_module_config(module_name) {
        None => Ok(T::default()),
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|source| {
            ConfigError::InvalidModuleConfig {
                module: module_name.to_string(),
                source,
            }
        }),
    }
}

/// Implementation of ConfigProvider that uses AppConfig
#[derive(Debug, Clone)]
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.0.modules.get(module_name)
    }
}
