use crate::{RuntimeConfig, RuntimeError};
use flowcontext::{ContextSettings, StorageConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Runtime settings file.
///
/// ```json
/// {
///   "userDir": "/var/lib/flows",
///   "functionGlobalContext": { "region": "eu" },
///   "contextStorage": {
///     "default": "disk",
///     "disk": { "module": "localfilesystem", "config": { "flushInterval": 10 } },
///     "mem": { "module": "memory" }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub user_dir: Option<PathBuf>,
    pub function_global_context: Map<String, Value>,
    /// Store entries in declaration order; the first store is the default
    /// unless a `default` entry names another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_storage: Option<Map<String, Value>>,
    pub export_global_context_keys: bool,
    pub event_buffer_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_dir: None,
            function_global_context: Map::new(),
            context_storage: None,
            export_global_context_keys: true,
            event_buffer_size: 1000,
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(json).map_err(|e| RuntimeError::Settings(e.to_string()))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let settings = Self::from_json(&text)?;
        tracing::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            user_dir: self.user_dir.clone(),
            function_global_context: self.function_global_context.clone(),
            export_global_context_keys: self.export_global_context_keys,
            context_storage: self
                .context_storage
                .as_ref()
                .map(StorageConfig::from_json)
                .unwrap_or_default(),
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            event_buffer_size: self.event_buffer_size,
            context: self.context_settings(),
        }
    }
}
