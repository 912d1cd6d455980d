//! Compliance classification of prompt/response pairs.
//!
//! A fixed classifier is loaded once in the background at startup and
//! published into a process-wide [`ClassifierContext`]. The
//! [`ComplianceScorer`] then judges whether a response complied with or
//! refused an instruction, with an attention-based explanation.

pub mod bert;
pub mod classifier;
pub mod explainer;
pub mod loader;
pub mod scorer;

pub use bert::HfClassifierLoader;
pub use classifier::{ClassifierContext, ClassifierLoader, LoadedClassifier, Readiness};
pub use explainer::{AttentionExplainer, Verdict};
pub use loader::BackgroundLoader;
pub use scorer::{ComplianceResult, ComplianceScorer};
