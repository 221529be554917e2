use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use trytune_core::TensorMap;

use crate::request::submit;
use crate::{BatchPolicy, Batcher, DispatchError, InferenceRequest, ModuleDescriptor, SchedulerError, Worker};

/// Decides when and how an admitted call reaches its module.
#[async_trait]
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs `inputs` through `module`. Inputs have already been validated.
    async fn admit(
        &self,
        module: Arc<ModuleDescriptor>,
        inputs: TensorMap,
    ) -> Result<TensorMap, DispatchError>;

    /// Drops any per-module state the policy keeps between calls.
    fn release_queues(&self) {}
}

pub const POLICIES: &[&str] = &[FifoPolicy::NAME, DynamicBatchPolicy::NAME];

/// Builds a policy from its name and JSON configuration.
pub fn build_policy(name: &str, config: &Value) -> Result<Arc<dyn SchedulingPolicy>, SchedulerError> {
    match name {
        FifoPolicy::NAME => {
            let FifoConfig {} = parse_config(name, config)?;
            Ok(Arc::new(FifoPolicy::new()))
        }
        DynamicBatchPolicy::NAME => {
            let policy: BatchPolicy = parse_config(name, config)?;
            Ok(Arc::new(DynamicBatchPolicy::new(policy)))
        }
        other => Err(SchedulerError::UnknownPolicy(other.to_string())),
    }
}

fn parse_config<T: DeserializeOwned>(policy: &str, config: &Value) -> Result<T, SchedulerError> {
    let config = match config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|source| SchedulerError::Config {
        policy: policy.to_string(),
        source,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FifoConfig {}

/// Holds the active policy. Swapping it affects calls admitted afterwards;
/// calls already admitted finish under the policy they started with.
pub struct Scheduler {
    active: RwLock<Arc<dyn SchedulingPolicy>>,
}

impl Scheduler {
    pub fn new(policy: Arc<dyn SchedulingPolicy>) -> Self {
        Self {
            active: RwLock::new(policy),
        }
    }

    pub fn from_config(name: &str, config: &Value) -> Result<Self, SchedulerError> {
        Ok(Self::new(build_policy(name, config)?))
    }

    pub fn current(&self) -> Arc<dyn SchedulingPolicy> {
        Arc::clone(&self.active.read())
    }

    /// Replaces the active policy. On error the previous one stays active.
    pub fn set(&self, name: &str, config: &Value) -> Result<(), SchedulerError> {
        let policy = build_policy(name, config)?;
        let previous = std::mem::replace(&mut *self.active.write(), policy);
        info!(from = previous.name(), to = name, "scheduling policy replaced");
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Arc::new(FifoPolicy::new()))
    }
}

/// One lazily spawned queue per module name. Dropping the map closes every
/// queue; the tasks drain what they already hold and exit.
struct Queues {
    senders: DashMap<String, mpsc::UnboundedSender<InferenceRequest>>,
}

impl Queues {
    fn new() -> Self {
        Self {
            senders: DashMap::new(),
        }
    }

    /// Returns the module's queue, spawning its task on first use or when
    /// the previous task has exited.
    fn sender<F>(&self, module: &str, spawn: F) -> mpsc::UnboundedSender<InferenceRequest>
    where
        F: FnOnce(mpsc::UnboundedReceiver<InferenceRequest>),
    {
        let open = |spawn: F| {
            let (tx, rx) = mpsc::unbounded_channel();
            spawn(rx);
            tx
        };
        match self.senders.entry(module.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_closed() {
                    warn!(module, "queue task exited, restarting it");
                    slot.insert(open(spawn));
                }
                slot.get().clone()
            }
            Entry::Vacant(slot) => slot.insert(open(spawn)).clone(),
        }
    }

    fn clear(&self) {
        self.senders.clear();
    }
}

/// Every call for a module goes through a single worker in arrival order.
pub struct FifoPolicy {
    queues: Queues,
}

impl FifoPolicy {
    pub const NAME: &'static str = "fifo";

    pub fn new() -> Self {
        Self {
            queues: Queues::new(),
        }
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchedulingPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn admit(
        &self,
        module: Arc<ModuleDescriptor>,
        inputs: TensorMap,
    ) -> Result<TensorMap, DispatchError> {
        let queue = self.queues.sender(&module.name, |inbox| {
            let worker = Worker {
                module: module.name.clone(),
                inbox,
            };
            tokio::spawn(worker.run());
        });
        submit(&queue, module, inputs).await
    }

    fn release_queues(&self) {
        self.queues.clear();
    }
}

/// Merges concurrent calls to batch-capable modules into one backend call.
pub struct DynamicBatchPolicy {
    policy: BatchPolicy,
    queues: Queues,
}

impl DynamicBatchPolicy {
    pub const NAME: &'static str = "dynamic_batching";

    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            queues: Queues::new(),
        }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }
}

#[async_trait]
impl SchedulingPolicy for DynamicBatchPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn admit(
        &self,
        module: Arc<ModuleDescriptor>,
        inputs: TensorMap,
    ) -> Result<TensorMap, DispatchError> {
        let queue = self.queues.sender(&module.name, |rx| {
            let batcher = Batcher::new(module.name.clone(), self.policy.clone(), rx);
            tokio::spawn(batcher.run());
        });
        submit(&queue, module, inputs).await
    }

    fn release_queues(&self) {
        self.queues.clear();
    }
}
