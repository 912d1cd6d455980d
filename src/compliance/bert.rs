//! BERT sequence classifier on candle, with final-layer attention capture.
//!
//! The model directory holds a `BertForSequenceClassification` export:
//! `config.json` (including `id2label`), `tokenizer.json` and safetensors
//! weights under the `bert.` / `classifier.` prefixes.

use super::classifier::{ClassifierLoader, LoadedClassifier};
use std::path::{Path, PathBuf};

pub struct HfClassifierLoader {
    model_dir: PathBuf,
}

impl HfClassifierLoader {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }
}

impl ClassifierLoader for HfClassifierLoader {
    fn load(&self) -> anyhow::Result<LoadedClassifier> {
        if !self.model_dir.is_dir() {
            anyhow::bail!(
                "classifier directory not found: {}",
                self.model_dir.display()
            );
        }
        load_dir(&self.model_dir)
    }

    fn describe(&self) -> String {
        self.model_dir.display().to_string()
    }
}

#[cfg(not(feature = "candle"))]
fn load_dir(dir: &Path) -> anyhow::Result<LoadedClassifier> {
    anyhow::bail!(
        "cannot load classifier from {}: this build has no classifier runtime (rebuild with the `candle` feature)",
        dir.display()
    )
}

#[cfg(feature = "candle")]
fn load_dir(dir: &Path) -> anyhow::Result<LoadedClassifier> {
    let tokenizer = engine::HfTokenizer::load(&dir.join("tokenizer.json"))?;
    let model = engine::BertClassifier::load(dir)?;
    Ok(LoadedClassifier {
        model: Box::new(model),
        tokenizer: Box::new(tokenizer),
    })
}

#[cfg(feature = "candle")]
mod engine {
    use super::super::classifier::{
        AttentionMatrix, ClassifierOutput, ClassifierTokenizer, SequenceClassifier, SpecialTokens,
    };
    use crate::backends::pipeline::safetensors_shards;
    use anyhow::{Context, Result};
    use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
    use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::path::Path;
    use tokenizers::Tokenizer;

    // ═══════════════════════════════════════════════════════════════
    // Tokenizer
    // ═══════════════════════════════════════════════════════════════

    pub struct HfTokenizer {
        inner: Tokenizer,
        specials: SpecialTokens,
    }

    impl HfTokenizer {
        pub fn load(path: &Path) -> Result<Self> {
            let mut inner = Tokenizer::from_file(path)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?;
            // Framing is done by `Encoding::framed`; the raw tokenizer must not truncate or pad.
            inner
                .with_truncation(None)
                .map_err(|e| anyhow::anyhow!("failed to disable truncation: {e}"))?;
            inner.with_padding(None);

            let id = |candidates: &[&str]| -> Result<u32> {
                candidates
                    .iter()
                    .find_map(|t| inner.token_to_id(t))
                    .with_context(|| format!("tokenizer has none of {candidates:?}"))
            };
            let specials = SpecialTokens {
                cls: id(&["[CLS]", "<s>"])?,
                sep: id(&["[SEP]", "</s>"])?,
                pad: id(&["[PAD]", "<pad>"])?,
            };
            Ok(Self { inner, specials })
        }
    }

    impl ClassifierTokenizer for HfTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
            let encoding = self
                .inner
                .encode(text, false)
                .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
            Ok(encoding.get_ids().to_vec())
        }

        fn special_tokens(&self) -> SpecialTokens {
            self.specials
        }

        fn token_text(&self, id: u32) -> String {
            self.inner.id_to_token(id).unwrap_or_default()
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Model
    // ═══════════════════════════════════════════════════════════════

    #[derive(Debug, Deserialize)]
    struct BertConfig {
        vocab_size: usize,
        hidden_size: usize,
        num_hidden_layers: usize,
        num_attention_heads: usize,
        intermediate_size: usize,
        max_position_embeddings: usize,
        #[serde(default = "default_type_vocab_size")]
        type_vocab_size: usize,
        #[serde(default = "default_layer_norm_eps")]
        layer_norm_eps: f64,
        #[serde(default = "default_hidden_act")]
        hidden_act: String,
        #[serde(default)]
        id2label: HashMap<String, String>,
    }

    fn default_type_vocab_size() -> usize {
        2
    }

    fn default_layer_norm_eps() -> f64 {
        1e-12
    }

    fn default_hidden_act() -> String {
        "gelu".into()
    }

    #[derive(Debug, Clone, Copy)]
    enum Activation {
        GeluErf,
        GeluTanh,
        Relu,
    }

    impl Activation {
        fn parse(name: &str) -> Result<Self> {
            match name {
                "gelu" => Ok(Self::GeluErf),
                "gelu_new" | "gelu_pytorch_tanh" => Ok(Self::GeluTanh),
                "relu" => Ok(Self::Relu),
                other => anyhow::bail!("unsupported hidden_act `{other}`"),
            }
        }

        fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
            match self {
                Self::GeluErf => xs.gelu_erf(),
                Self::GeluTanh => xs.gelu(),
                Self::Relu => xs.relu(),
            }
        }
    }

    struct Embeddings {
        word: Embedding,
        position: Embedding,
        token_type: Embedding,
        norm: LayerNorm,
    }

    impl Embeddings {
        fn load(vb: VarBuilder, cfg: &BertConfig) -> candle_core::Result<Self> {
            Ok(Self {
                word: embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("word_embeddings"))?,
                position: embedding(
                    cfg.max_position_embeddings,
                    cfg.hidden_size,
                    vb.pp("position_embeddings"),
                )?,
                token_type: embedding(
                    cfg.type_vocab_size,
                    cfg.hidden_size,
                    vb.pp("token_type_embeddings"),
                )?,
                norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            })
        }

        fn forward(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
            let seq_len = ids.dim(1)?;
            let positions = Tensor::arange(0u32, seq_len as u32, ids.device())?.unsqueeze(0)?;
            let token_types = ids.zeros_like()?;
            let xs = self
                .word
                .forward(ids)?
                .broadcast_add(&self.position.forward(&positions)?)?
                .broadcast_add(&self.token_type.forward(&token_types)?)?;
            self.norm.forward(&xs)
        }
    }

    struct Layer {
        query: Linear,
        key: Linear,
        value: Linear,
        attn_out: Linear,
        attn_norm: LayerNorm,
        intermediate: Linear,
        output: Linear,
        out_norm: LayerNorm,
        heads: usize,
        head_dim: usize,
        activation: Activation,
    }

    impl Layer {
        fn load(vb: VarBuilder, cfg: &BertConfig, activation: Activation) -> candle_core::Result<Self> {
            let h = cfg.hidden_size;
            let attn = vb.pp("attention");
            Ok(Self {
                query: linear(h, h, attn.pp("self").pp("query"))?,
                key: linear(h, h, attn.pp("self").pp("key"))?,
                value: linear(h, h, attn.pp("self").pp("value"))?,
                attn_out: linear(h, h, attn.pp("output").pp("dense"))?,
                attn_norm: layer_norm(h, cfg.layer_norm_eps, attn.pp("output").pp("LayerNorm"))?,
                intermediate: linear(h, cfg.intermediate_size, vb.pp("intermediate").pp("dense"))?,
                output: linear(cfg.intermediate_size, h, vb.pp("output").pp("dense"))?,
                out_norm: layer_norm(h, cfg.layer_norm_eps, vb.pp("output").pp("LayerNorm"))?,
                heads: cfg.num_attention_heads,
                head_dim: h / cfg.num_attention_heads,
                activation,
            })
        }

        fn split_heads(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            let (b, s, _) = xs.dims3()?;
            xs.reshape((b, s, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        }

        /// Returns the layer output and its attention probabilities `[b, heads, s, s]`.
        fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
            let (b, s, h) = xs.dims3()?;
            let q = self.split_heads(&self.query.forward(xs)?)?;
            let k = self.split_heads(&self.key.forward(xs)?)?;
            let v = self.split_heads(&self.value.forward(xs)?)?;

            let scale = 1.0 / (self.head_dim as f64).sqrt();
            let scores = (q.matmul(&k.t()?)? * scale)?.broadcast_add(mask)?;
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;
            let context = probs
                .matmul(&v)?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((b, s, h))?;

            let attended = self
                .attn_norm
                .forward(&(self.attn_out.forward(&context)? + xs)?)?;
            let inner = self
                .activation
                .apply(&self.intermediate.forward(&attended)?)?;
            let out = self
                .out_norm
                .forward(&(self.output.forward(&inner)? + &attended)?)?;
            Ok((out, probs))
        }
    }

    pub struct BertClassifier {
        embeddings: Embeddings,
        layers: Vec<Layer>,
        pooler: Linear,
        head: Linear,
        labels: Vec<String>,
        device: Device,
    }

    impl BertClassifier {
        pub fn load(dir: &Path) -> Result<Self> {
            let raw = std::fs::read(dir.join("config.json"))
                .with_context(|| format!("missing config.json in {}", dir.display()))?;
            let cfg: BertConfig =
                serde_json::from_slice(&raw).context("config.json is not a BERT config")?;
            if cfg.num_attention_heads == 0 || cfg.hidden_size % cfg.num_attention_heads != 0 {
                anyhow::bail!(
                    "hidden_size {} is not divisible by {} attention heads",
                    cfg.hidden_size,
                    cfg.num_attention_heads
                );
            }
            let activation = Activation::parse(&cfg.hidden_act)?;
            let labels = ordered_labels(&cfg.id2label)?;

            let device = Device::Cpu;
            let shards = safetensors_shards(dir)?;
            // SAFETY: weights are memory-mapped read-only and never modified while resident.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&shards, DType::F32, &device)? };
            let bert = vb.pp("bert");

            let embeddings = Embeddings::load(bert.pp("embeddings"), &cfg)?;
            let layers = (0..cfg.num_hidden_layers)
                .map(|i| Layer::load(bert.pp("encoder").pp("layer").pp(i), &cfg, activation))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let pooler = linear(cfg.hidden_size, cfg.hidden_size, bert.pp("pooler").pp("dense"))?;
            let head = linear(cfg.hidden_size, labels.len(), vb.pp("classifier"))
                .context("failed to load classification head")?;

            tracing::info!(
                dir = %dir.display(),
                layers = layers.len(),
                labels = ?labels,
                "BERT classifier loaded"
            );
            Ok(Self {
                embeddings,
                layers,
                pooler,
                head,
                labels,
                device,
            })
        }

        fn run(&self, input_ids: &[u32], attention_mask: &[u32]) -> candle_core::Result<(Vec<f32>, Tensor)> {
            let ids = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
            // 0 for real tokens, a large negative number for padding.
            let mask = Tensor::new(attention_mask, &self.device)?
                .to_dtype(DType::F32)?
                .affine(10_000.0, -10_000.0)?
                .reshape((1, 1, 1, attention_mask.len()))?;

            let mut hidden = self.embeddings.forward(&ids)?;
            let mut last_probs = None;
            for layer in &self.layers {
                let (out, probs) = layer.forward(&hidden, &mask)?;
                hidden = out;
                last_probs = Some(probs);
            }
            let probs = match last_probs {
                Some(p) => p,
                None => candle_core::bail!("model has no encoder layers"),
            };

            let cls = hidden.i((.., 0))?;
            let pooled = self.pooler.forward(&cls)?.tanh()?;
            let logits = self.head.forward(&pooled)?.squeeze(0)?.to_vec1::<f32>()?;
            Ok((logits, probs.squeeze(0)?))
        }
    }

    impl SequenceClassifier for BertClassifier {
        fn forward(&self, input_ids: &[u32], attention_mask: &[u32]) -> Result<ClassifierOutput> {
            if input_ids.len() != attention_mask.len() {
                anyhow::bail!(
                    "input ids ({}) and attention mask ({}) differ in length",
                    input_ids.len(),
                    attention_mask.len()
                );
            }
            let (logits, probs) = self.run(input_ids, attention_mask)?;
            let heads = probs.dim(0)?;
            let seq_len = probs.dim(D::Minus1)?;
            let data = probs.flatten_all()?.to_vec1::<f32>()?;
            Ok(ClassifierOutput {
                logits,
                last_layer_attention: AttentionMatrix::new(heads, seq_len, data)?,
            })
        }

        fn label(&self, index: usize) -> Option<String> {
            self.labels.get(index).cloned()
        }
    }

    fn ordered_labels(id2label: &HashMap<String, String>) -> Result<Vec<String>> {
        if id2label.is_empty() {
            anyhow::bail!("config.json has no id2label mapping");
        }
        let mut pairs = id2label
            .iter()
            .map(|(k, v)| {
                k.parse::<usize>()
                    .map(|idx| (idx, v.clone()))
                    .with_context(|| format!("id2label key `{k}` is not an index"))
            })
            .collect::<Result<Vec<_>>>()?;
        pairs.sort_by_key(|(idx, _)| *idx);
        Ok(pairs.into_iter().map(|(_, label)| label).collect())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_is_reported() {
        let loader = HfClassifierLoader::new("/nonexistent/lmninja/classifier");
        let err = loader.load().err().unwrap();
        assert!(err.to_string().contains("not found"));
        assert_eq!(loader.describe(), "/nonexistent/lmninja/classifier");
    }

    #[cfg(not(feature = "candle"))]
    #[test]
    fn build_without_runtime_names_feature() {
        let dir = tempfile::tempdir().unwrap();
        let err = HfClassifierLoader::new(dir.path()).load().err().unwrap();
        assert!(err.to_string().contains("`candle` feature"));
    }
}
