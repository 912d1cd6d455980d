//! Inference backends.
//!
//! Three interchangeable execution strategies:
//! - **File-backed**: a single GGUF file run in-process through llama.cpp (`llamacpp` feature).
//! - **Directory-backed**: a Hugging Face style model directory run through candle (`candle` feature).
//! - **Remote daemon**: an Ollama server addressed by model name. Stateless, never occupies the slot.
//!
//! Local engines implement [`TextGenerator`] and are built through a
//! [`BackendFactory`], which is the seam the slot manager owns.

pub mod gguf;
pub mod ollama;
pub mod pipeline;

pub use ollama::{OllamaClient, RemoteGenerator};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of local backend that can occupy the model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-file model (GGUF).
    File,
    /// Model directory (config + tokenizer + safetensors).
    Directory,
}

impl BackendKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Construction options for a local backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Layers offloaded to the GPU. Only file-backed models use it.
    pub gpu_layers: u32,
    pub context_length: u32,
    pub temperature: f32,
    pub seed: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            context_length: 4096,
            temperature: 0.7,
            seed: 299_792_458,
        }
    }
}

impl LoadOptions {
    pub fn from_config(config: &crate::config::GenerationConfig) -> Self {
        Self {
            gpu_layers: 0,
            context_length: config.context_length,
            temperature: config.temperature,
            seed: config.seed,
        }
    }
}

/// One generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub max_tokens: u32,
    /// Generation stops as soon as the output ends with one of these.
    pub stop: &'a [String],
}

/// A live, loaded local model.
///
/// `generate` is blocking and is only ever called from the worker pool.
/// Implementations must be safe to call concurrently, or serialize
/// internally.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest<'_>) -> anyhow::Result<String>;

    /// Engine name for logs.
    fn name(&self) -> &'static str;
}

/// Builds local backends. Construction is slow and blocking.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        kind: BackendKind,
        identifier: &Path,
        options: &LoadOptions,
    ) -> anyhow::Result<Box<dyn TextGenerator>>;
}

/// Factory backed by the engines compiled into this build.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineFactory;

impl BackendFactory for EngineFactory {
    fn create(
        &self,
        kind: BackendKind,
        identifier: &Path,
        options: &LoadOptions,
    ) -> anyhow::Result<Box<dyn TextGenerator>> {
        validate_identifier(kind, identifier)?;
        match kind {
            BackendKind::File => gguf::load(identifier, options),
            BackendKind::Directory => pipeline::load(identifier, options),
        }
    }
}

/// Check that the path exists and has the shape the backend kind expects.
pub fn validate_identifier(kind: BackendKind, identifier: &Path) -> anyhow::Result<()> {
    if identifier.as_os_str().is_empty() {
        anyhow::bail!("model path cannot be empty");
    }
    match kind {
        BackendKind::File => {
            if !identifier.is_file() {
                anyhow::bail!("model file not found: {}", identifier.display());
            }
        }
        BackendKind::Directory => {
            if !identifier.is_dir() {
                anyhow::bail!("model directory not found: {}", identifier.display());
            }
        }
    }
    Ok(())
}

/// Cut `text` at the first stop marker, if any.
pub fn truncate_at_stop<'a>(text: &'a str, stop: &[String]) -> &'a str {
    stop.iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .map_or(text, |idx| &text[..idx])
}

/// Remove the prompt echoed at the start of a pipeline's output.
pub fn strip_prompt_echo<'a>(prompt: &str, output: &'a str) -> &'a str {
    output.strip_prefix(prompt).unwrap_or(output).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops() -> Vec<String> {
        vec!["<|eot_id|>".into(), "</s>".into()]
    }

    #[test]
    fn truncate_at_earliest_stop() {
        let text = "Sure, here you go.</s> junk <|eot_id|> more";
        assert_eq!(truncate_at_stop(text, &stops()), "Sure, here you go.");
    }

    #[test]
    fn truncate_without_stop_is_identity() {
        assert_eq!(truncate_at_stop("plain text", &stops()), "plain text");
        assert_eq!(truncate_at_stop("plain text", &[String::new()]), "plain text");
    }

    #[test]
    fn strip_echo_removes_leading_prompt() {
        let out = strip_prompt_echo("Tell me a joke", "Tell me a joke\nWhy did the crab cross?");
        assert_eq!(out, "Why did the crab cross?");
    }

    #[test]
    fn strip_echo_leaves_non_echoed_output() {
        let out = strip_prompt_echo("Tell me a joke", "  A crab walks into a bar. ");
        assert_eq!(out, "A crab walks into a bar.");
    }

    #[test]
    fn backend_kind_serde_is_lowercase() {
        let kind: BackendKind = serde_json::from_str("\"directory\"").unwrap();
        assert_eq!(kind, BackendKind::Directory);
        assert_eq!(serde_json::to_string(&BackendKind::File).unwrap(), "\"file\"");
    }

    #[test]
    fn validate_rejects_missing_paths() {
        let err = validate_identifier(BackendKind::File, Path::new("/models/missing.gguf"))
            .unwrap_err();
        assert!(err.to_string().contains("model file not found"));

        let err = validate_identifier(BackendKind::Directory, Path::new("")).unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn validate_checks_file_versus_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_identifier(BackendKind::Directory, dir.path()).is_ok());
        assert!(validate_identifier(BackendKind::File, dir.path()).is_err());

        let file = dir.path().join("model.gguf");
        std::fs::write(&file, b"GGUF").unwrap();
        assert!(validate_identifier(BackendKind::File, &file).is_ok());
        assert!(validate_identifier(BackendKind::Directory, &file).is_err());
    }

    #[cfg(not(feature = "llamacpp"))]
    #[test]
    fn file_engine_reports_missing_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.gguf");
        std::fs::write(&file, b"GGUF").unwrap();
        let err = EngineFactory
            .create(BackendKind::File, &file, &LoadOptions::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("llamacpp"));
    }
}
