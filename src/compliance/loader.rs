//! One-shot background construction of the classifier.

use super::classifier::{ClassifierContext, ClassifierLoader};
use crate::worker::WorkerPool;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

pub struct BackgroundLoader;

impl BackgroundLoader {
    /// Start loading off the request loop. Runs exactly once; on failure the
    /// context is marked failed for the rest of the process lifetime.
    pub fn spawn(
        context: Arc<ClassifierContext>,
        loader: Arc<dyn ClassifierLoader>,
        workers: WorkerPool,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let source = loader.describe();
            tracing::info!(source = %source, "Loading compliance classifier");
            let started = Instant::now();

            match workers.run(move || loader.load()).await {
                Ok(Ok(classifier)) => {
                    if context.publish(classifier) {
                        tracing::info!(
                            source = %source,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Compliance classifier ready"
                        );
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(source = %source, "Compliance classifier failed to load: {e:#}");
                    context.fail(format!("{e:#}"));
                }
                Err(e) => {
                    tracing::error!(source = %source, "Compliance classifier loader crashed: {e}");
                    context.fail(e.to_string());
                }
            }
        })
    }

    /// Settle the context immediately when classification is turned off.
    pub fn disabled(context: &ClassifierContext) {
        tracing::info!("Compliance classifier disabled by configuration");
        context.fail("classifier disabled by configuration");
    }
}
