//! Dataflow execution of a registered pipeline.
//!
//! One control loop per run owns the tensor space. Stage tasks never touch it:
//! they report back over a channel, and the loop fires every stage whose
//! inputs have all arrived. Dropping the run (error, timeout or a caller that
//! stopped waiting) drops the `JoinSet`, which cancels the stages in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, info, warn};
use trytune_core::{Tensor, TensorMap, ValidationError};

use crate::{DispatchError, Dispatcher, PipelineGraph, RuntimeError};

#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutorConfig {
    /// Upper bound on a single stage's module call.
    pub stage_timeout: Option<Duration>,
    /// Upper bound on a whole pipeline run.
    pub run_timeout: Option<Duration>,
}

#[derive(Debug)]
enum StageEvent {
    TensorReady { name: String, tensor: Tensor },
    Failed { stage: String, error: RuntimeError },
}

enum Next {
    Event(StageEvent),
    Joined(Result<(), JoinError>),
}

#[derive(Clone)]
pub struct PipelineExecutor {
    dispatcher: Dispatcher,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(dispatcher: Dispatcher, config: ExecutorConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    /// Runs `graph` on `inputs` and returns exactly its declared outputs.
    pub async fn run(
        &self,
        graph: Arc<PipelineGraph>,
        inputs: TensorMap,
    ) -> Result<TensorMap, RuntimeError> {
        let started = Instant::now();
        let result = match self.config.run_timeout {
            None => self.execute(&graph, inputs).await,
            Some(after) => tokio::time::timeout(after, self.execute(&graph, inputs))
                .await
                .map_err(|_| RuntimeError::RunTimeout {
                    pipeline: graph.name.clone(),
                    after,
                })
                .and_then(|result| result),
        };
        match &result {
            Ok(_) => info!(
                pipeline = %graph.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pipeline run finished"
            ),
            Err(err) => warn!(pipeline = %graph.name, error = %err, "pipeline run failed"),
        }
        result
    }

    async fn execute(
        &self,
        graph: &Arc<PipelineGraph>,
        inputs: TensorMap,
    ) -> Result<TensorMap, RuntimeError> {
        if let Some(name) = inputs.keys().find(|n| !graph.inputs.contains_key(*n)) {
            return Err(RuntimeError::UnknownInput(name.clone()));
        }
        if let Some(name) = graph.inputs.keys().find(|n| !inputs.contains_key(*n)) {
            return Err(RuntimeError::MissingInput(name.clone()));
        }

        let mut space = inputs;
        let mut fired = vec![false; graph.stages.len()];
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut stage_of: HashMap<task::Id, String> = HashMap::new();

        self.fire_ready(graph, &space, &mut fired, &tx, &mut tasks, &mut stage_of);

        loop {
            if fired.iter().all(|f| *f) && graph.outputs.iter().all(|o| space.contains_key(o)) {
                return Ok(graph
                    .outputs
                    .iter()
                    .filter_map(|name| space.get(name).map(|t| (name.clone(), t.clone())))
                    .collect());
            }

            // Every finished task sent its events before exiting, so with no
            // task left the channel holds everything that will ever arrive.
            let next = if tasks.is_empty() {
                match rx.try_recv() {
                    Ok(event) => Next::Event(event),
                    Err(_) => return Err(RuntimeError::Stalled(graph.name.clone())),
                }
            } else {
                tokio::select! {
                    biased;
                    Some(event) = rx.recv() => Next::Event(event),
                    Some(joined) = tasks.join_next() => Next::Joined(joined),
                    else => return Err(RuntimeError::Stalled(graph.name.clone())),
                }
            };

            match next {
                Next::Event(StageEvent::Failed { stage, error }) => {
                    return Err(RuntimeError::Stage {
                        stage,
                        source: Box::new(error),
                    });
                }
                Next::Event(StageEvent::TensorReady { name, tensor }) => {
                    if space.contains_key(&name) {
                        return Err(RuntimeError::DuplicateTensor(name));
                    }
                    debug!(pipeline = %graph.name, tensor = %name, shape = %tensor.shape(), "tensor ready");
                    space.insert(name, tensor);
                    self.fire_ready(graph, &space, &mut fired, &tx, &mut tasks, &mut stage_of);
                }
                Next::Joined(Ok(())) => {}
                Next::Joined(Err(err)) => {
                    let stage = stage_of.remove(&err.id()).unwrap_or_default();
                    let reason = if err.is_panic() { "panicked" } else { "cancelled" };
                    return Err(RuntimeError::TaskAborted {
                        stage,
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }

    /// Fires, in declaration order, every unfired stage whose inputs are all
    /// present in the tensor space.
    fn fire_ready(
        &self,
        graph: &Arc<PipelineGraph>,
        space: &TensorMap,
        fired: &mut [bool],
        tx: &mpsc::UnboundedSender<StageEvent>,
        tasks: &mut JoinSet<()>,
        stage_of: &mut HashMap<task::Id, String>,
    ) {
        for (idx, stage) in graph.stages.iter().enumerate() {
            if fired[idx] {
                continue;
            }
            let gathered: Option<TensorMap> = stage
                .inputs
                .values()
                .map(|b| space.get(&b.tensor).map(|t| (b.tensor.clone(), t.clone())))
                .collect();
            let Some(gathered) = gathered else {
                continue;
            };

            fired[idx] = true;
            debug!(pipeline = %graph.name, stage = %stage.name, module = %stage.module.name, "firing stage");
            let handle = tasks.spawn(run_stage(
                self.dispatcher.clone(),
                Arc::clone(graph),
                idx,
                gathered,
                self.config.stage_timeout,
                tx.clone(),
            ));
            stage_of.insert(handle.id(), stage.name.clone());
        }
    }
}

/// Body of one stage task. Sends one `TensorReady` per output binding, or a
/// single `Failed`; outputs are only sent once every one of them is ready.
async fn run_stage(
    dispatcher: Dispatcher,
    graph: Arc<PipelineGraph>,
    idx: usize,
    gathered: TensorMap,
    timeout: Option<Duration>,
    tx: mpsc::UnboundedSender<StageEvent>,
) {
    let stage = &graph.stages[idx];
    let result: Result<Vec<(String, Tensor)>, RuntimeError> = async {
        let mut inputs = TensorMap::new();
        for (port, binding) in &stage.inputs {
            let tensor = gathered
                .get(&binding.tensor)
                .ok_or_else(|| RuntimeError::MissingInput(binding.tensor.clone()))?;
            inputs.insert(port.clone(), apply_reshape(tensor, &binding.tensor, &binding.reshape)?);
        }

        let call = dispatcher.infer_with(Arc::clone(&stage.module), inputs);
        let outputs = match timeout {
            None => call.await?,
            Some(after) => tokio::time::timeout(after, call)
                .await
                .map_err(|_| DispatchError::Timeout {
                    module: stage.module.name.clone(),
                    after,
                })??,
        };

        let mut ready = Vec::with_capacity(stage.outputs.len());
        for (port, binding) in &stage.outputs {
            let tensor = outputs.get(port).ok_or_else(|| DispatchError::InvalidOutput {
                module: stage.module.name.clone(),
                source: ValidationError::Missing { port: port.clone() },
            })?;
            ready.push((
                binding.tensor.clone(),
                apply_reshape(tensor, &binding.tensor, &binding.reshape)?,
            ));
        }
        Ok(ready)
    }
    .await;

    // Send failures mean the run was already abandoned.
    match result {
        Ok(ready) => {
            for (name, tensor) in ready {
                let _ = tx.send(StageEvent::TensorReady { name, tensor });
            }
        }
        Err(error) => {
            let _ = tx.send(StageEvent::Failed {
                stage: stage.name.clone(),
                error,
            });
        }
    }
}

fn apply_reshape(
    tensor: &Tensor,
    name: &str,
    reshape: &Option<Vec<i64>>,
) -> Result<Tensor, RuntimeError> {
    match reshape {
        None => Ok(tensor.clone()),
        Some(shape) => tensor.reshape(shape).map_err(|source| RuntimeError::Tensor {
            tensor: name.to_string(),
            source,
        }),
    }
}
