use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{InferenceRequest, Timings};

/// Serves one module's queue, one request at a time, in arrival order.
pub struct Worker {
    pub module: String,
    pub inbox: mpsc::UnboundedReceiver<InferenceRequest>,
}

impl Worker {
    pub async fn run(mut self) {
        info!(module = %self.module, "worker started");
        while let Some(mut req) = self.inbox.recv().await {
            if req.is_cancelled() {
                debug!(module = %self.module, "skipping cancelled request");
                continue;
            }
            let queued_us = req.enqueued_at.elapsed().as_micros() as u64;

            let t0 = Instant::now();
            let inputs = std::mem::take(&mut req.inputs);
            let outputs = Arc::clone(&req.module).invoke_isolated(inputs).await;
            let backend_us = t0.elapsed().as_micros() as u64;

            req.respond(
                outputs,
                Timings {
                    queued_us,
                    backend_us,
                    batch: 1,
                },
            );
        }
        info!(module = %self.module, "worker stopped");
    }
}
