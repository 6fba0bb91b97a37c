//! Layered configuration.
//!
//! Settings come from JSON files: `config/default.json`, an optional
//! environment overlay `config/{ENV}.json`, and a per-model profile
//! `llm_config/{model}.json`, deep-merged in that order and then
//! deserialized into one immutable [`AppConfig`]. Nothing reads config
//! ambiently; the struct is built once at startup and passed down.
//!
//! The default file is also the persistence point for runtime choices
//! (active model, language): it is read as a raw `Value`, patched key-wise
//! and written back, so unrelated keys survive the round-trip.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::llm::template::TemplateConfig;

/// Sampling defaults applied when the request body omits a knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f64,
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

fn default_max_tokens() -> u32 {
    512
}
fn default_repeat_penalty() -> f64 {
    1.1
}
fn default_top_p() -> f64 {
    0.95
}

impl Default for CompletionDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            repeat_penalty: default_repeat_penalty(),
            echo: false,
            top_p: default_top_p(),
        }
    }
}

/// Per-model settings from the `llm_config/` profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hf_id: String,
    pub hf_file: String,
    /// Selects the communicator implementation ("mistral", "chatml").
    pub family: String,
    #[serde(default = "default_n_threads")]
    pub n_threads: u32,
    #[serde(default = "default_n_batch")]
    pub n_batch: u32,
    #[serde(default)]
    pub n_gpu_layers: u32,
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    #[serde(default)]
    pub verbose: bool,
    /// Overrides the family's built-in template tokens when present.
    #[serde(default)]
    pub template: Option<TemplateConfig>,
    #[serde(default)]
    pub default_completion_config: CompletionDefaults,
}

fn default_n_threads() -> u32 {
    4
}
fn default_n_batch() -> u32 {
    512
}
fn default_n_ctx() -> u32 {
    8192
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub use_gpu: bool,
    #[serde(default = "default_model_root")]
    pub model_root: String,
    #[serde(default = "default_stream_batch_size")]
    pub stream_batch_size: usize,
    /// Name of the active model profile.
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub model_config: ModelConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_url_prefix() -> String {
    "/v1".to_string()
}
fn default_model_root() -> String {
    "./models".to_string()
}
fn default_stream_batch_size() -> usize {
    4
}
fn default_language() -> String {
    "en".to_string()
}

impl AppConfig {
    /// Model identifier reported in completion envelopes.
    pub fn model_label(&self) -> String {
        format!("{} - {}", self.model_config.hf_id, self.model_config.hf_file)
    }

    /// Deterministic on-disk location of the model weights.
    pub fn model_path(&self) -> PathBuf {
        Path::new(&self.model_root)
            .join(&self.model_config.hf_id)
            .join(&self.model_config.hf_file)
    }

    pub fn gpu_layers(&self) -> u32 {
        if self.use_gpu {
            self.model_config.n_gpu_layers
        } else {
            0
        }
    }
}

/// Recursively merge `overlay` into `base`; objects merge key-wise, anything
/// else is replaced.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Reads and writes the layered config files.
pub struct ConfigStore {
    config_dir: PathBuf,
    llm_config_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: impl Into<PathBuf>, llm_config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            llm_config_dir: llm_config_dir.into(),
        }
    }

    fn read_json(path: &Path) -> Result<Value, GatewayError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("invalid JSON in {}: {e}", path.display())))
    }

    /// Load the merged configuration for `model`: defaults, then the `ENV`
    /// overlay when one is configured and present, then the model profile.
    pub fn load(&self, model: &str) -> Result<AppConfig, GatewayError> {
        let mut merged = Self::read_json(&self.config_dir.join("default.json"))?;

        if let Ok(env) = std::env::var("ENV") {
            let overlay_path = self.config_dir.join(format!("{env}.json"));
            if overlay_path.exists() {
                deep_merge(&mut merged, Self::read_json(&overlay_path)?);
            }
        }

        let profile_path = self.llm_config_dir.join(format!("{model}.json"));
        deep_merge(&mut merged, Self::read_json(&profile_path)?);

        if let Value::Object(ref mut map) = merged {
            map.insert("model".to_string(), Value::String(model.to_string()));
        }

        serde_json::from_value(merged)
            .map_err(|e| GatewayError::Config(format!("invalid configuration for {model}: {e}")))
    }

    pub fn read_default(&self) -> Result<Value, GatewayError> {
        Self::read_json(&self.config_dir.join("default.json"))
    }

    pub fn save_default(&self, config: &Value) -> Result<(), GatewayError> {
        let path = self.config_dir.join("default.json");
        let pretty = serde_json::to_string_pretty(config)
            .map_err(|e| GatewayError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(&path, pretty)
            .map_err(|e| GatewayError::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Persist a single top-level key in the default file.
    pub fn persist_default_key(&self, key: &str, value: Value) -> Result<(), GatewayError> {
        let mut current = self.read_default()?;
        if let Value::Object(ref mut map) = current {
            map.insert(key.to_string(), value);
        }
        self.save_default(&current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: &Value) {
        std::fs::write(dir.join(name), serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    fn base_config() -> Value {
        json!({
            "host": "127.0.0.1",
            "port": 8000,
            "url_prefix": "/v1",
            "debug_mode": false,
            "use_gpu": true,
            "model_root": "./models",
            "stream_batch_size": 4,
            "model": "mistral",
            "language": "en"
        })
    }

    fn mistral_profile() -> Value {
        json!({
            "model_config": {
                "hf_id": "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
                "hf_file": "mistral-7b-instruct-v0.2.Q4_K_M.gguf",
                "family": "mistral",
                "n_gpu_layers": 32,
                "default_completion_config": {
                    "max_tokens": 256,
                    "temperature": 0.0,
                    "repeat_penalty": 1.1,
                    "echo": true,
                    "top_p": 0.95
                }
            }
        })
    }

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        deep_merge(&mut base, json!({"a": 9, "nested": {"y": 7, "z": 3}}));
        assert_eq!(base, json!({"a": 9, "nested": {"x": 1, "y": 7, "z": 3}}));
    }

    #[test]
    fn load_merges_default_and_profile() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let llm_dir = dir.path().join("llm_config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::create_dir_all(&llm_dir).unwrap();
        write(&config_dir, "default.json", &base_config());
        write(&llm_dir, "mistral.json", &mistral_profile());

        let store = ConfigStore::new(&config_dir, &llm_dir);
        let config = store.load("mistral").unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.model, "mistral");
        assert_eq!(config.model_config.family, "mistral");
        assert_eq!(config.model_config.n_ctx, 8192); // serde default
        assert_eq!(config.model_config.default_completion_config.max_tokens, 256);
        assert!(config.model_config.default_completion_config.echo);
    }

    #[test]
    fn model_path_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let llm_dir = dir.path().join("llm_config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::create_dir_all(&llm_dir).unwrap();
        write(&config_dir, "default.json", &base_config());
        write(&llm_dir, "mistral.json", &mistral_profile());

        let config = ConfigStore::new(&config_dir, &llm_dir).load("mistral").unwrap();
        assert_eq!(
            config.model_path(),
            Path::new("./models")
                .join("TheBloke/Mistral-7B-Instruct-v0.2-GGUF")
                .join("mistral-7b-instruct-v0.2.Q4_K_M.gguf")
        );
        assert_eq!(
            config.model_label(),
            "TheBloke/Mistral-7B-Instruct-v0.2-GGUF - mistral-7b-instruct-v0.2.Q4_K_M.gguf"
        );
    }

    #[test]
    fn gpu_toggle_zeroes_layers() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let llm_dir = dir.path().join("llm_config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::create_dir_all(&llm_dir).unwrap();
        write(&config_dir, "default.json", &base_config());
        write(&llm_dir, "mistral.json", &mistral_profile());

        let store = ConfigStore::new(&config_dir, &llm_dir);
        let mut config = store.load("mistral").unwrap();
        assert_eq!(config.gpu_layers(), 32);
        config.use_gpu = false;
        assert_eq!(config.gpu_layers(), 0);
    }

    #[test]
    fn persist_default_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let llm_dir = dir.path().join("llm_config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::create_dir_all(&llm_dir).unwrap();
        write(&config_dir, "default.json", &base_config());

        let store = ConfigStore::new(&config_dir, &llm_dir);
        store
            .persist_default_key("model", Value::String("zephyr".to_string()))
            .unwrap();

        let reread = store.read_default().unwrap();
        assert_eq!(reread["model"], "zephyr");
        // Untouched keys survive the round-trip.
        assert_eq!(reread["port"], 8000);
    }
}
