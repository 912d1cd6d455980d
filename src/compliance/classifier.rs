//! Classifier seams and the process-wide classifier context.

use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Ids of the special tokens used to frame a classifier input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Leading classification token (`[CLS]`).
    pub cls: u32,
    /// Trailing separator (`[SEP]`).
    pub sep: u32,
    pub pad: u32,
}

/// A framed, fixed-length classifier input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<u32>,
}

impl Encoding {
    /// `[CLS] content [SEP]`, content truncated so the whole sequence fits
    /// `max_len`, then right-padded to exactly `max_len`.
    pub fn framed(content: &[u32], specials: SpecialTokens, max_len: usize) -> Self {
        let room = max_len.saturating_sub(2);
        let kept = &content[..content.len().min(room)];

        let mut ids = Vec::with_capacity(max_len);
        ids.push(specials.cls);
        ids.extend_from_slice(kept);
        ids.push(specials.sep);
        ids.truncate(max_len);

        let real = ids.len();
        let mut attention_mask = vec![1; real];
        ids.resize(max_len, specials.pad);
        attention_mask.resize(max_len, 0);
        Self {
            ids,
            attention_mask,
        }
    }

    /// Number of non-padding positions.
    pub fn sequence_length(&self) -> usize {
        self.attention_mask.iter().filter(|m| **m != 0).count()
    }
}

/// Tokenizer half of the classifier.
pub trait ClassifierTokenizer: Send + Sync {
    /// Token ids of `text` without special tokens.
    fn tokenize(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    fn special_tokens(&self) -> SpecialTokens;

    /// Source token string for an id (e.g. `lock`, `##ing`).
    fn token_text(&self, id: u32) -> String;
}

/// One layer's attention probabilities, shape `[heads, seq, seq]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMatrix {
    heads: usize,
    seq_len: usize,
    data: Vec<f32>,
}

impl AttentionMatrix {
    pub fn new(heads: usize, seq_len: usize, data: Vec<f32>) -> anyhow::Result<Self> {
        if heads == 0 {
            anyhow::bail!("attention matrix has no heads");
        }
        if data.len() != heads * seq_len * seq_len {
            anyhow::bail!(
                "attention data has {} values, expected {heads}x{seq_len}x{seq_len}",
                data.len()
            );
        }
        Ok(Self {
            heads,
            seq_len,
            data,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Attention from `query` to every key position for one head.
    pub fn row(&self, head: usize, query: usize) -> &[f32] {
        let start = (head * self.seq_len + query) * self.seq_len;
        &self.data[start..start + self.seq_len]
    }
}

/// Raw forward-pass output of the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutput {
    pub logits: Vec<f32>,
    /// Attention probabilities of the final transformer layer.
    pub last_layer_attention: AttentionMatrix,
}

/// Model half of the classifier. Forward passes must be reentrant.
pub trait SequenceClassifier: Send + Sync {
    fn forward(&self, input_ids: &[u32], attention_mask: &[u32])
        -> anyhow::Result<ClassifierOutput>;

    /// Label name for a logit index (the model's `id2label`).
    fn label(&self, index: usize) -> Option<String>;
}

/// A constructed classifier: model plus tokenizer.
pub struct LoadedClassifier {
    pub model: Box<dyn SequenceClassifier>,
    pub tokenizer: Box<dyn ClassifierTokenizer>,
}

/// Builds the classifier. Slow and blocking; runs once per process.
pub trait ClassifierLoader: Send + Sync {
    fn load(&self) -> anyhow::Result<LoadedClassifier>;

    /// Human-readable source, for logs.
    fn describe(&self) -> String;
}

/// Readiness of the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Loading,
    Ready,
    /// Permanent for this process lifetime.
    Failed(String),
}

impl Readiness {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

/// Process-wide classifier slot: absent → present, or absent → failed. Never torn down.
pub struct ClassifierContext {
    classifier: OnceLock<Arc<LoadedClassifier>>,
    readiness: watch::Sender<Readiness>,
}

impl Default for ClassifierContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierContext {
    pub fn new() -> Self {
        let (readiness, _) = watch::channel(Readiness::Loading);
        Self {
            classifier: OnceLock::new(),
            readiness,
        }
    }

    /// Publish the loaded classifier. Returns false if the context was
    /// already settled (ready or failed); the first outcome wins.
    pub fn publish(&self, classifier: LoadedClassifier) -> bool {
        if !matches!(*self.readiness.borrow(), Readiness::Loading) {
            return false;
        }
        if self.classifier.set(Arc::new(classifier)).is_err() {
            return false;
        }
        self.readiness.send_replace(Readiness::Ready);
        true
    }

    /// Record a permanent load failure.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.readiness.send_if_modified(|state| {
            if matches!(state, Readiness::Loading) {
                *state = Readiness::Failed(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn get(&self) -> Option<Arc<LoadedClassifier>> {
        self.classifier.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.classifier.get().is_some()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Resolve once the classifier is ready or has failed.
    pub async fn wait_ready(&self) -> Readiness {
        let mut rx = self.readiness.subscribe();
        let settled = match rx.wait_for(|r| !matches!(r, Readiness::Loading)).await {
            Ok(state) => state.clone(),
            // The sender lives in `self`, so this cannot close while we borrow it.
            Err(_) => self.readiness(),
        };
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECIALS: SpecialTokens = SpecialTokens {
        cls: 101,
        sep: 102,
        pad: 0,
    };

    struct NullModel;

    impl SequenceClassifier for NullModel {
        fn forward(&self, _: &[u32], _: &[u32]) -> anyhow::Result<ClassifierOutput> {
            anyhow::bail!("not used")
        }

        fn label(&self, _: usize) -> Option<String> {
            None
        }
    }

    struct NullTokenizer;

    impl ClassifierTokenizer for NullTokenizer {
        fn tokenize(&self, _: &str) -> anyhow::Result<Vec<u32>> {
            Ok(Vec::new())
        }

        fn special_tokens(&self) -> SpecialTokens {
            SPECIALS
        }

        fn token_text(&self, _: u32) -> String {
            String::new()
        }
    }

    fn null_classifier() -> LoadedClassifier {
        LoadedClassifier {
            model: Box::new(NullModel),
            tokenizer: Box::new(NullTokenizer),
        }
    }

    #[test]
    fn framed_pads_to_fixed_length() {
        let enc = Encoding::framed(&[7, 8, 9], SPECIALS, 8);
        assert_eq!(enc.ids, vec![101, 7, 8, 9, 102, 0, 0, 0]);
        assert_eq!(enc.attention_mask, vec![1, 1, 1, 1, 1, 0, 0, 0]);
        assert_eq!(enc.sequence_length(), 5);
    }

    #[test]
    fn framed_truncates_content_but_keeps_separator() {
        let content: Vec<u32> = (1..=10).collect();
        let enc = Encoding::framed(&content, SPECIALS, 6);
        assert_eq!(enc.ids, vec![101, 1, 2, 3, 4, 102]);
        assert_eq!(enc.sequence_length(), 6);
    }

    #[test]
    fn attention_matrix_rejects_bad_shape() {
        assert!(AttentionMatrix::new(2, 3, vec![0.0; 17]).is_err());
        assert!(AttentionMatrix::new(0, 3, Vec::new()).is_err());
        let m = AttentionMatrix::new(2, 3, (0..18).map(|v| v as f32).collect()).unwrap();
        assert_eq!(m.row(1, 0), &[9.0, 10.0, 11.0]);
        assert_eq!(m.row(0, 2), &[6.0, 7.0, 8.0]);
    }

    #[test]
    fn context_starts_loading() {
        let ctx = ClassifierContext::new();
        assert_eq!(ctx.readiness(), Readiness::Loading);
        assert!(!ctx.is_ready());
        assert!(ctx.get().is_none());
    }

    #[test]
    fn first_outcome_wins() {
        let ctx = ClassifierContext::new();
        assert!(ctx.publish(null_classifier()));
        assert!(!ctx.fail("too late"));
        assert!(!ctx.publish(null_classifier()));
        assert_eq!(ctx.readiness(), Readiness::Ready);

        let failed = ClassifierContext::new();
        assert!(failed.fail("weights missing"));
        assert!(!failed.publish(null_classifier()));
        assert_eq!(failed.readiness(), Readiness::Failed("weights missing".into()));
        assert!(!failed.is_ready());
    }

    #[tokio::test]
    async fn wait_ready_resolves_on_publish() {
        let ctx = Arc::new(ClassifierContext::new());
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_ready().await })
        };
        tokio::task::yield_now().await;
        ctx.publish(null_classifier());
        assert_eq!(waiter.await.unwrap(), Readiness::Ready);
    }
}
