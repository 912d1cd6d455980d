use serde::{Deserialize, Serialize};

/// Default port the desktop client polls for `/health`.
pub const DEFAULT_PORT: u16 = 1337;
/// Default Ollama endpoint for remote-daemon queries.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
/// Maximum classifier sequence length (tokens, including special tokens).
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 512;

/// End-of-turn markers that terminate file-backed generation early.
const DEFAULT_STOP_SEQUENCES: &[&str] = &[
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|end|>",
    "<end_of_turn>",
    "</s>",
];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub workers: WorkerConfig,
    pub classifier: ClassifierConfig,
    pub generation: GenerationConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address. Loopback by default: the sidecar only serves the local desktop app.
    pub host: String,
    pub port: u16,
    /// Upper bound for one request, including queued worker time.
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            request_timeout_secs: 300,
            max_body_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of model computations running at once.
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// When false the background loader is never started and compliance
    /// evaluation reports "classifier is not ready" for the process lifetime.
    pub enabled: bool,
    /// Directory holding `config.json`, `tokenizer.json` and `model.safetensors`.
    pub model_dir: String,
    pub max_sequence_length: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_dir: "~/.lmninja/models/compliance-classifier".into(),
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Token budget used when a query omits `max_tokens`.
    pub default_max_tokens: u32,
    /// Context window for file-backed models.
    pub context_length: u32,
    pub temperature: f32,
    pub seed: u64,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 512,
            context_length: 4096,
            temperature: 0.7,
            seed: 299_792_458,
            stop_sequences: DEFAULT_STOP_SEQUENCES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Ollama base URL (no `/api` suffix).
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_OLLAMA_URL.into(),
            timeout_secs: 120,
        }
    }
}
