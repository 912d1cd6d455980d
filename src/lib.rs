//! Local inference sidecar.
//!
//! Keeps at most one heavyweight model resident (file-backed GGUF or a
//! model directory), forwards queries to it or to a remote Ollama daemon,
//! and judges prompt/response pairs with an attention-explained compliance
//! classifier loaded once in the background.

pub mod backends;
pub mod compliance;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod slot;
pub mod worker;

pub use config::Config;
pub use error::EngineError;
