//! Directory-backed text-generation pipeline on candle.
//!
//! Expects a Llama-family model directory: `config.json`, `tokenizer.json`
//! and one or more `*.safetensors` shards. Like a text-generation pipeline,
//! the returned text starts with the prompt; the dispatcher strips the echo.

use super::{LoadOptions, TextGenerator};
use std::path::Path;

#[cfg(not(feature = "candle"))]
pub fn load(path: &Path, _options: &LoadOptions) -> anyhow::Result<Box<dyn TextGenerator>> {
    anyhow::bail!(
        "cannot load {}: this build has no directory-model runtime (rebuild with the `candle` feature)",
        path.display()
    )
}

#[cfg(feature = "candle")]
pub fn load(path: &Path, options: &LoadOptions) -> anyhow::Result<Box<dyn TextGenerator>> {
    Ok(Box::new(engine::LlamaPipeline::load(path, options)?))
}

/// Safetensors shards in a model directory, sorted for deterministic loading.
pub fn safetensors_shards(dir: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
    let mut shards: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    shards.sort();
    if shards.is_empty() {
        anyhow::bail!("no .safetensors weights found in {}", dir.display());
    }
    Ok(shards)
}

#[cfg(feature = "candle")]
mod engine {
    use super::super::{GenerationRequest, LoadOptions, TextGenerator};
    use anyhow::{Context, Result};
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;
    use candle_transformers::generation::LogitsProcessor;
    use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
    use std::path::Path;
    use tokenizers::Tokenizer;

    pub struct LlamaPipeline {
        model: Llama,
        config: Config,
        tokenizer: Tokenizer,
        device: Device,
        eos_tokens: Vec<u32>,
        temperature: f64,
        seed: u64,
    }

    impl LlamaPipeline {
        pub fn load(dir: &Path, options: &LoadOptions) -> Result<Self> {
            let device = Device::Cpu;
            let raw = std::fs::read(dir.join("config.json"))
                .with_context(|| format!("missing config.json in {}", dir.display()))?;
            let llama_config: LlamaConfig =
                serde_json::from_slice(&raw).context("config.json is not a Llama config")?;
            let config = llama_config.into_config(false);

            let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
                .map_err(|e| anyhow::anyhow!("failed to load tokenizer.json: {e}"))?;

            let shards = super::safetensors_shards(dir)?;
            // SAFETY: the weight files are memory-mapped read-only and are not
            // modified while the model is resident.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&shards, DType::F32, &device)? };
            let model = Llama::load(vb, &config).context("failed to build Llama weights")?;

            let eos_tokens = match &config.eos_token_id {
                Some(LlamaEosToks::Single(id)) => vec![*id],
                Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
                None => tokenizer.token_to_id("</s>").into_iter().collect(),
            };

            tracing::info!(dir = %dir.display(), shards = shards.len(), "Directory model loaded");
            Ok(Self {
                model,
                config,
                tokenizer,
                device,
                eos_tokens,
                temperature: f64::from(options.temperature),
                seed: options.seed,
            })
        }
    }

    impl TextGenerator for LlamaPipeline {
        fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
            let mut tokens = self
                .tokenizer
                .encode(request.prompt, true)
                .map_err(|e| anyhow::anyhow!("failed to tokenize prompt: {e}"))?
                .get_ids()
                .to_vec();
            let prompt_len = tokens.len();

            let mut cache = Cache::new(true, DType::F32, &self.config, &self.device)?;
            let temperature = (self.temperature > 0.0).then_some(self.temperature);
            let mut sampler = LogitsProcessor::new(self.seed, temperature, None);

            let mut index_pos = 0;
            for step in 0..request.max_tokens as usize {
                let context = if step == 0 { &tokens[..] } else { &tokens[tokens.len() - 1..] };
                if index_pos + context.len() > self.config.max_position_embeddings {
                    break;
                }
                let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
                let logits = self.model.forward(&input, index_pos, &mut cache)?;
                let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
                index_pos += context.len();

                let next = sampler.sample(&logits)?;
                if self.eos_tokens.contains(&next) {
                    break;
                }
                tokens.push(next);

                if !request.stop.is_empty() {
                    let tail = self
                        .tokenizer
                        .decode(&tokens[prompt_len..], true)
                        .unwrap_or_default();
                    if request.stop.iter().any(|s| !s.is_empty() && tail.contains(s.as_str())) {
                        break;
                    }
                }
            }

            self.tokenizer
                .decode(&tokens, true)
                .map_err(|e| anyhow::anyhow!("failed to decode output: {e}"))
        }

        fn name(&self) -> &'static str {
            "candle-llama"
        }
    }
}
