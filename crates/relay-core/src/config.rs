use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RemoteAgentConfig {
    pub name: String,
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RemoteConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub agents: Vec<RemoteAgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 4000,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { retention_days: 14 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub remote: RemoteConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    pub fn agent(&self, name: &str) -> Option<&RemoteAgentConfig> {
        self.remote.agents.iter().find(|agent| agent.name == name)
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered configuration: file, then environment, then runtime patches, then
/// command-line overrides, deep-merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: Option<PathBuf>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file = match &path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Self::from_layers(path, file, env_layer(), cli_overrides)
    }

    fn from_layers(
        path: Option<PathBuf>,
        file: Value,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let layers = ConfigLayers {
            file,
            env,
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self) -> anyhow::Result<RuntimeConfig> {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).context("invalid relay configuration")
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "file": layers.file,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("malformed config {}", path.display()))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty("RELAY_REMOTE_URL") {
        deep_merge(&mut root, &json!({ "remote": { "url": url } }));
    }
    if let Some(key) = non_empty("RELAY_API_KEY").or_else(|| non_empty("LANGSMITH_API_KEY")) {
        deep_merge(&mut root, &json!({ "remote": { "api_key": key } }));
    }
    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
