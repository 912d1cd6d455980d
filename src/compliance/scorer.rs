//! Prompt/response compliance evaluation.

use super::classifier::{ClassifierContext, Encoding, LoadedClassifier, Readiness};
use super::explainer::{AttentionExplainer, TokenSpan, Verdict};
use crate::error::EngineError;
use crate::worker::WorkerPool;
use serde::Serialize;
use std::sync::Arc;

pub const PROMPT_TAG: &str = "[PROMPT]";
pub const RESPONSE_TAG: &str = "[RESPONSE]";

/// Message returned while the classifier is still loading (or failed to).
pub const NOT_READY_MESSAGE: &str = "classifier is not ready";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explainability {
    pub distraction_score: f32,
    pub hotspot_tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceResult {
    pub verdict: Verdict,
    pub reason: String,
    /// Raw classifier label behind the verdict.
    pub label: String,
    pub score: f32,
    pub explainability: Explainability,
}

/// The prompt segment on its own, exactly as it opens the tagged input.
pub fn prompt_segment(prompt: &str) -> String {
    format!("{PROMPT_TAG} {prompt}")
}

pub fn tagged_input(prompt: &str, response: &str) -> String {
    format!("{} {RESPONSE_TAG} {response}", prompt_segment(prompt))
}

/// Score one pair against a loaded classifier. Blocking.
pub fn score_pair(
    classifier: &LoadedClassifier,
    prompt: &str,
    response: &str,
    max_sequence_length: usize,
) -> anyhow::Result<ComplianceResult> {
    let tokenizer = classifier.tokenizer.as_ref();
    let content = tokenizer.tokenize(&tagged_input(prompt, response))?;
    let encoding = Encoding::framed(&content, tokenizer.special_tokens(), max_sequence_length);
    let prompt_tokens = tokenizer.tokenize(&prompt_segment(prompt))?.len();
    let span = TokenSpan::new(prompt_tokens, encoding.sequence_length());

    let output = classifier
        .model
        .forward(&encoding.ids, &encoding.attention_mask)?;
    let explanation = AttentionExplainer::explain(&output, &span)?;

    let label = classifier
        .model
        .label(explanation.label_index)
        .unwrap_or_else(|| format!("LABEL_{}", explanation.label_index));
    let verdict = Verdict::from_label(&label);
    let hotspot_tokens = explanation
        .hotspot_positions
        .iter()
        .map(|pos| tokenizer.token_text(encoding.ids[*pos]))
        .collect();

    Ok(ComplianceResult {
        verdict,
        reason: verdict.reason(&label),
        label,
        score: explanation.score,
        explainability: Explainability {
            distraction_score: explanation.distraction_score,
            hotspot_tokens,
        },
    })
}

/// Runs compliance evaluation on the worker pool against the shared classifier.
pub struct ComplianceScorer {
    context: Arc<ClassifierContext>,
    workers: WorkerPool,
    max_sequence_length: usize,
}

impl ComplianceScorer {
    pub fn new(context: Arc<ClassifierContext>, workers: WorkerPool, max_sequence_length: usize) -> Self {
        Self {
            context,
            workers,
            max_sequence_length,
        }
    }

    pub async fn evaluate(
        &self,
        prompt: String,
        response: String,
    ) -> Result<ComplianceResult, EngineError> {
        let Some(classifier) = self.context.get() else {
            if let Readiness::Failed(reason) = self.context.readiness() {
                tracing::debug!("Compliance request rejected, classifier failed: {reason}");
            }
            return Err(EngineError::Unavailable(NOT_READY_MESSAGE.into()));
        };

        let max_len = self.max_sequence_length;
        let result = self
            .workers
            .run(move || score_pair(&classifier, &prompt, &response, max_len))
            .await?;

        match result {
            Ok(result) => {
                tracing::debug!(
                    verdict = ?result.verdict,
                    score = result.score,
                    "Compliance evaluated"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::warn!("Compliance analysis failed: {e:#}");
                Err(EngineError::inference(&e))
            }
        }
    }
}
