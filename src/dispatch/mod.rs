//! Query dispatch across the three backend kinds.
//!
//! Selection precedence, first match wins:
//! 1. Slot holds a directory-backed model → use it, whatever the request says.
//! 2. Request names a file model and the slot holds that same file model → use it.
//! 3. Request names a remote-daemon model → forward to the daemon.
//! 4. Otherwise → dispatch error.
//!
//! Each backend's raw output is normalized into plain text.

use crate::backends::{
    strip_prompt_echo, truncate_at_stop, BackendKind, GenerationRequest, RemoteGenerator,
    TextGenerator,
};
use crate::error::EngineError;
use crate::slot::{ActiveModel, ModelSlotManager};
use crate::worker::WorkerPool;
use std::path::PathBuf;
use std::sync::Arc;

pub const NO_BACKEND_MESSAGE: &str = "no valid local model query specified.";

/// Optional backend selectors carried by a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSelector {
    pub file_model: Option<PathBuf>,
    pub remote_model: Option<String>,
}

/// A generation request addressed to whichever backend wins selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub selector: BackendSelector,
}

/// The backend chosen for one query.
pub enum Route {
    Directory(Arc<dyn TextGenerator>),
    File(Arc<dyn TextGenerator>),
    Remote(String),
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Directory(_) => "directory",
            Self::File(_) => "file",
            Self::Remote(_) => "remote",
        }
    }
}

/// Apply the selection precedence to the current slot occupant.
pub fn select_route(
    active: Option<&ActiveModel>,
    selector: &BackendSelector,
) -> Result<Route, EngineError> {
    match (active, selector) {
        (Some(model), _) if model.kind == BackendKind::Directory => {
            Ok(Route::Directory(Arc::clone(&model.handle)))
        }
        (
            Some(model),
            BackendSelector {
                file_model: Some(path),
                ..
            },
        ) if model.kind == BackendKind::File && model.identifier == *path => {
            Ok(Route::File(Arc::clone(&model.handle)))
        }
        (
            _,
            BackendSelector {
                remote_model: Some(name),
                ..
            },
        ) if !name.trim().is_empty() => Ok(Route::Remote(name.clone())),
        _ => Err(EngineError::Dispatch(NO_BACKEND_MESSAGE.into())),
    }
}

pub struct QueryDispatcher {
    slots: Arc<ModelSlotManager>,
    remote: Arc<dyn RemoteGenerator>,
    workers: WorkerPool,
    stop_sequences: Arc<[String]>,
}

impl QueryDispatcher {
    pub fn new(
        slots: Arc<ModelSlotManager>,
        remote: Arc<dyn RemoteGenerator>,
        workers: WorkerPool,
        stop_sequences: Vec<String>,
    ) -> Self {
        Self {
            slots,
            remote,
            workers,
            stop_sequences: stop_sequences.into(),
        }
    }

    pub async fn query(&self, request: QueryRequest) -> Result<String, EngineError> {
        let active = self.slots.active();
        let route = select_route(active.as_ref(), &request.selector)?;
        drop(active);
        tracing::debug!(route = route.label(), max_tokens = request.max_tokens, "Dispatching query");

        match route {
            Route::Directory(handle) => {
                let prompt = request.prompt;
                let max_tokens = request.max_tokens;
                let raw = self
                    .workers
                    .run(move || {
                        handle.generate(&GenerationRequest {
                            prompt: &prompt,
                            max_tokens,
                            stop: &[],
                        })
                        .map(|out| strip_prompt_echo(&prompt, &out).to_string())
                    })
                    .await?;
                raw.map_err(|e| self.inference_failure("directory", &e))
            }
            Route::File(handle) => {
                let prompt = request.prompt;
                let max_tokens = request.max_tokens;
                let stop = Arc::clone(&self.stop_sequences);
                let raw = self
                    .workers
                    .run(move || {
                        handle
                            .generate(&GenerationRequest {
                                prompt: &prompt,
                                max_tokens,
                                stop: &stop,
                            })
                            .map(|out| truncate_at_stop(&out, &stop).trim().to_string())
                    })
                    .await?;
                raw.map_err(|e| self.inference_failure("file", &e))
            }
            Route::Remote(model) => self
                .remote
                .chat(&model, &request.prompt, request.max_tokens)
                .await
                .map(|text| text.trim().to_string())
                .map_err(|e| self.inference_failure("remote", &e)),
        }
    }

    fn inference_failure(&self, route: &str, err: &anyhow::Error) -> EngineError {
        tracing::warn!(route, "Inference failed: {err:#}");
        EngineError::inference(err)
    }
}
