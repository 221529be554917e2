use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};
use trytune_core::{Tensor, TensorMap};

use crate::{DispatchError, InferenceRequest, Timings};

fn default_max_batch() -> usize {
    8
}

fn default_max_delay_ms() -> u64 {
    5
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchPolicy {
    /// Most requests merged into one backend call.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// How long the first queued request may wait for company.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BatchPolicy {
    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Collects requests for one module and merges compatible ones along the
/// leading dimension. Requests are answered in arrival order.
pub struct Batcher {
    module: String,
    policy: BatchPolicy,
    rx: mpsc::UnboundedReceiver<InferenceRequest>,
}

impl Batcher {
    pub fn new(
        module: String,
        policy: BatchPolicy,
        rx: mpsc::UnboundedReceiver<InferenceRequest>,
    ) -> Self {
        Self { module, policy, rx }
    }

    pub async fn run(mut self) {
        info!(module = %self.module, max_batch = self.policy.max_batch, "batcher started");
        let mut pending: Vec<InferenceRequest> = Vec::new();
        let mut first_seen: Option<Instant> = None;

        loop {
            tokio::select! {
                maybe_req = self.rx.recv() => {
                    match maybe_req {
                        None => break,
                        Some(req) => {
                            if !pending.is_empty() && !self.fits(&pending, &req) {
                                self.flush(&mut pending).await;
                            }
                            if pending.is_empty() { first_seen = Some(Instant::now()); }
                            pending.push(req);
                            if self.is_full(&pending) {
                                self.flush(&mut pending).await;
                                first_seen = None;
                            }
                        }
                    }
                }
                _ = async {
                    if let Some(t0) = first_seen {
                        sleep(self.policy.max_delay().saturating_sub(t0.elapsed())).await;
                    }
                }, if first_seen.is_some() => {
                    self.flush(&mut pending).await;
                    first_seen = None;
                }
            }
        }

        // Senders are gone once the policy has been replaced; finish what was admitted.
        self.flush(&mut pending).await;
        info!(module = %self.module, "batcher stopped");
    }

    fn fits(&self, pending: &[InferenceRequest], req: &InferenceRequest) -> bool {
        let head = &pending[0];
        let max_rows = head.module.spec().max_batch;
        if !Arc::ptr_eq(&head.module, &req.module) || max_rows == 0 {
            return false;
        }
        let (Some(rows), Some(incoming)) = (pending_rows(pending), batch_rows(&req.inputs)) else {
            return false;
        };
        pending.len() < self.policy.max_batch
            && rows + incoming <= max_rows
            && same_layout(&head.inputs, &req.inputs)
    }

    fn is_full(&self, pending: &[InferenceRequest]) -> bool {
        let max_rows = pending[0].module.spec().max_batch;
        if max_rows == 0 || pending.len() >= self.policy.max_batch {
            return true;
        }
        pending_rows(pending).map_or(true, |rows| rows >= max_rows)
    }

    async fn flush(&self, pending: &mut Vec<InferenceRequest>) {
        let mut reqs: Vec<InferenceRequest> = std::mem::take(pending)
            .into_iter()
            .filter(|req| !req.is_cancelled())
            .collect();
        if reqs.is_empty() {
            return;
        }

        let queued_us = reqs[0].enqueued_at.elapsed().as_micros() as u64;
        let module = Arc::clone(&reqs[0].module);
        debug!(module = %self.module, batch = reqs.len(), "dispatching batch");

        let t0 = Instant::now();
        if reqs.len() == 1 {
            let Some(mut req) = reqs.pop() else { return };
            let outputs = module.invoke_isolated(std::mem::take(&mut req.inputs)).await;
            req.respond(
                outputs,
                Timings {
                    queued_us,
                    backend_us: t0.elapsed().as_micros() as u64,
                    batch: 1,
                },
            );
            return;
        }

        let batch = reqs.len();
        let result = self.run_merged(&reqs).await;
        let timings = Timings {
            queued_us,
            backend_us: t0.elapsed().as_micros() as u64,
            batch,
        };
        match result {
            Ok(per_request) => {
                for (req, outputs) in reqs.into_iter().zip(per_request) {
                    req.respond(Ok(outputs), timings);
                }
            }
            Err(err) => {
                let reason = format!("{:#}", anyhow::Error::from(err));
                for req in reqs {
                    req.respond(
                        Err(DispatchError::Backend {
                            module: self.module.clone(),
                            source: anyhow::anyhow!("batched call failed: {reason}"),
                        }),
                        timings,
                    );
                }
            }
        }
    }

    async fn run_merged(&self, reqs: &[InferenceRequest]) -> Result<Vec<TensorMap>, DispatchError> {
        let module = &reqs[0].module;
        let backend_err = |source: anyhow::Error| DispatchError::Backend {
            module: self.module.clone(),
            source,
        };

        let sizes: Vec<usize> = reqs
            .iter()
            .map(|r| batch_rows(&r.inputs).unwrap_or(0))
            .collect();

        let mut merged = TensorMap::new();
        for port in reqs[0].inputs.keys() {
            let parts: Vec<&Tensor> = reqs.iter().filter_map(|r| r.inputs.get(port)).collect();
            let tensor = Tensor::concat_batch(&parts).map_err(|e| backend_err(e.into()))?;
            merged.insert(port.clone(), tensor);
        }

        let outputs = Arc::clone(module).invoke_isolated(merged).await?;

        let mut per_request = vec![TensorMap::new(); reqs.len()];
        for (port, tensor) in outputs {
            let parts = tensor.split_batch(&sizes).map_err(|e| backend_err(e.into()))?;
            for (slot, part) in per_request.iter_mut().zip(parts) {
                slot.insert(port.clone(), part);
            }
        }
        Ok(per_request)
    }
}

/// Leading dimension shared by every input, if there is one.
fn batch_rows(inputs: &TensorMap) -> Option<usize> {
    let mut rows = None;
    for tensor in inputs.values() {
        if tensor.shape().rank() == 0 {
            return None;
        }
        match rows {
            None => rows = Some(tensor.batch_size()),
            Some(r) if r != tensor.batch_size() => return None,
            Some(_) => {}
        }
    }
    rows
}

fn pending_rows(pending: &[InferenceRequest]) -> Option<usize> {
    pending.iter().map(|r| batch_rows(&r.inputs)).sum()
}

fn same_layout(a: &TensorMap, b: &TensorMap) -> bool {
    a.len() == b.len()
        && a.iter().all(|(port, ta)| {
            b.get(port).is_some_and(|tb| {
                ta.dtype() == tb.dtype() && ta.shape().dims()[1..] == tb.shape().dims()[1..]
            })
        })
}
