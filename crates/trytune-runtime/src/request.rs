use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use trytune_core::TensorMap;

use crate::{DispatchError, ModuleDescriptor};

#[derive(Debug)]
pub struct InferenceRequest {
    pub module: Arc<ModuleDescriptor>,
    pub inputs: TensorMap,
    pub enqueued_at: Instant,
    pub resp_tx: oneshot::Sender<InferenceResponse>,
}

impl InferenceRequest {
    /// The caller stopped waiting, e.g. because its pipeline run was aborted.
    pub fn is_cancelled(&self) -> bool {
        self.resp_tx.is_closed()
    }

    pub fn respond(self, outputs: Result<TensorMap, DispatchError>, timings: Timings) {
        // A dropped receiver only means nobody is waiting any more.
        let _ = self.resp_tx.send(InferenceResponse { outputs, timings });
    }
}

#[derive(Debug)]
pub struct InferenceResponse {
    pub outputs: Result<TensorMap, DispatchError>,
    pub timings: Timings,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    pub queued_us: u64,
    pub backend_us: u64,
    pub batch: usize,
}

/// Enqueues one call on a per-module queue and waits for its response.
pub(crate) async fn submit(
    queue: &mpsc::UnboundedSender<InferenceRequest>,
    module: Arc<ModuleDescriptor>,
    inputs: TensorMap,
) -> Result<TensorMap, DispatchError> {
    let name = module.name.clone();
    let (resp_tx, resp_rx) = oneshot::channel();
    queue
        .send(InferenceRequest {
            module,
            inputs,
            enqueued_at: Instant::now(),
            resp_tx,
        })
        .map_err(|_| DispatchError::QueueClosed {
            module: name.clone(),
        })?;

    let InferenceResponse { outputs, timings } = resp_rx
        .await
        .map_err(|_| DispatchError::QueueClosed {
            module: name.clone(),
        })?;
    debug!(
        module = %name,
        queued_us = timings.queued_us,
        backend_us = timings.backend_us,
        batch = timings.batch,
        "inference answered"
    );
    outputs
}
