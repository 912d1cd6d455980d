//! File-backed GGUF engine on llama.cpp.

use super::{LoadOptions, TextGenerator};
use std::path::Path;

#[cfg(not(feature = "llamacpp"))]
pub fn load(path: &Path, _options: &LoadOptions) -> anyhow::Result<Box<dyn TextGenerator>> {
    anyhow::bail!(
        "cannot load {}: this build has no file-model runtime (rebuild with the `llamacpp` feature)",
        path.display()
    )
}

#[cfg(feature = "llamacpp")]
pub fn load(path: &Path, options: &LoadOptions) -> anyhow::Result<Box<dyn TextGenerator>> {
    Ok(Box::new(engine::GgufModel::load(path, options)?))
}

#[cfg(feature = "llamacpp")]
mod engine {
    use super::super::{truncate_at_stop, GenerationRequest, LoadOptions, TextGenerator};
    use anyhow::{Context, Result};
    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::{AddBos, LlamaModel, Special};
    use llama_cpp_2::sampling::LlamaSampler;
    use std::num::NonZeroU32;
    use std::path::Path;
    use std::sync::OnceLock;

    /// llama.cpp may only be initialised once per process.
    static BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

    fn backend() -> Result<&'static LlamaBackend> {
        BACKEND
            .get_or_init(|| LlamaBackend::init().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| anyhow::anyhow!("failed to initialise llama.cpp backend: {e}"))
    }

    pub struct GgufModel {
        model: LlamaModel,
        context_length: u32,
        temperature: f32,
        seed: u32,
    }

    impl GgufModel {
        pub fn load(path: &Path, options: &LoadOptions) -> Result<Self> {
            let backend = backend()?;
            let params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);
            let model = LlamaModel::load_from_file(backend, path, &params)
                .with_context(|| format!("failed to load GGUF model {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                gpu_layers = options.gpu_layers,
                "GGUF model loaded"
            );
            Ok(Self {
                model,
                context_length: options.context_length.max(512),
                temperature: options.temperature,
                seed: options.seed as u32,
            })
        }
    }

    impl TextGenerator for GgufModel {
        fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
            let backend = backend()?;
            let ctx_params =
                LlamaContextParams::default().with_n_ctx(NonZeroU32::new(self.context_length));
            let mut ctx = self
                .model
                .new_context(backend, ctx_params)
                .context("failed to create llama.cpp context")?;

            let tokens = self
                .model
                .str_to_token(request.prompt, AddBos::Always)
                .context("failed to tokenize prompt")?;
            if tokens.len() >= self.context_length as usize {
                anyhow::bail!(
                    "prompt is {} tokens, context window is {}",
                    tokens.len(),
                    self.context_length
                );
            }

            let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
            let last = tokens.len().saturating_sub(1);
            for (i, token) in tokens.iter().enumerate() {
                batch.add(*token, i as i32, &[0], i == last)?;
            }
            ctx.decode(&mut batch).context("prompt decode failed")?;

            let mut sampler = LlamaSampler::chain_simple([
                LlamaSampler::temp(self.temperature),
                LlamaSampler::dist(self.seed),
            ]);

            let budget = (self.context_length as usize).min(tokens.len() + request.max_tokens as usize);
            let mut position = tokens.len();
            let mut output = String::new();

            while position < budget {
                let token = sampler.sample(&ctx, batch.n_tokens() - 1);
                sampler.accept(token);
                if self.model.is_eog_token(token) {
                    break;
                }

                let piece = self
                    .model
                    .token_to_str(token, Special::Tokenize)
                    .unwrap_or_default();
                output.push_str(&piece);
                if request.stop.iter().any(|s| !s.is_empty() && output.contains(s.as_str())) {
                    break;
                }

                batch.clear();
                batch.add(token, position as i32, &[0], true)?;
                ctx.decode(&mut batch).context("token decode failed")?;
                position += 1;
            }

            Ok(truncate_at_stop(&output, request.stop).trim().to_string())
        }

        fn name(&self) -> &'static str {
            "llama.cpp"
        }
    }
}
