use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;

pub const MAX_STEPS_ENV_VAR: &str = "PARLEY_MAX_STEPS";
pub const LOG_RETENTION_ENV_VAR: &str = "PARLEY_LOG_RETENTION_DAYS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatConfig {
    /// Upper bound on model steps reached through automatic continuation.
    /// `1` disables the tool loop.
    pub max_steps: usize,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub log_retention_days: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_steps: 1,
            headers: HashMap::new(),
            body: empty_object(),
            log_retention_days: 7,
        }
    }
}

/// Per-call additions merged over the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub metadata: Option<Value>,
}

impl ChatConfig {
    /// Resolves defaults, then the JSON file at `path`, then environment
    /// variables, then `overrides`. Later layers win.
    pub async fn load(path: Option<&Path>, overrides: Option<Value>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => Some(read_json_file(path).await?),
            None => None,
        };
        Self::from_layers(file, env_layer(|key| std::env::var(key).ok()), overrides)
    }

    fn from_layers(
        file: Option<Value>,
        env: Value,
        overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let merged = [file.unwrap_or(Value::Null), env, overrides.unwrap_or(Value::Null)]
            .into_iter()
            .fold(serde_json::to_value(Self::default())?, merge_values);
        let config: Self =
            serde_json::from_value(merged).context("invalid chat configuration")?;
        if config.max_steps == 0 {
            anyhow::bail!("maxSteps must be at least 1");
        }
        Ok(config)
    }

    pub fn request_headers(&self, options: &RequestOptions) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        headers.extend(
            options
                .headers
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        headers
    }

    pub fn request_body(&self, options: &RequestOptions) -> Value {
        match options.body.clone() {
            Some(extra) => merge_values(self.body.clone(), extra),
            None => self.body.clone(),
        }
    }
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let parsed = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());
    let mut layer = serde_json::Map::new();
    if let Some(max_steps) = parsed(MAX_STEPS_ENV_VAR) {
        layer.insert("maxSteps".to_string(), json!(max_steps));
    }
    if let Some(days) = parsed(LOG_RETENTION_ENV_VAR) {
        layer.insert("logRetentionDays".to_string(), json!(days));
    }
    Value::Object(layer)
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Overlays `layer` onto `base`. Objects merge key by key, a `null` layer
/// keeps the base, and any other value replaces it.
fn merge_values(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (base, Value::Null) => base,
        (Value::Object(mut target), Value::Object(source)) => {
            for (key, incoming) in source {
                let current = target.remove(&key).unwrap_or(Value::Null);
                let merged = merge_values(current, incoming);
                if !merged.is_null() {
                    target.insert(key, merged);
                }
            }
            Value::Object(target)
        }
        (_, layer) => layer,
    }
}
