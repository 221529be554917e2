use std::sync::Arc;

use tracing::debug;
use trytune_core::{validate, TensorMap};

use crate::{DispatchError, ModuleDescriptor, ModuleRegistry, RuntimeError, Scheduler};

/// Validates a call against the module's contract, hands it to the active
/// scheduling policy and checks what comes back.
#[derive(Clone)]
pub struct Dispatcher {
    modules: Arc<ModuleRegistry>,
    scheduler: Arc<Scheduler>,
}

impl Dispatcher {
    pub fn new(modules: Arc<ModuleRegistry>, scheduler: Arc<Scheduler>) -> Self {
        Self { modules, scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Looks `name` up in the registry and runs one inference on it.
    pub async fn infer(&self, name: &str, inputs: TensorMap) -> Result<TensorMap, RuntimeError> {
        let module = self
            .modules
            .get(name)
            .ok_or_else(|| RuntimeError::not_found("module", name))?;
        self.infer_with(module, inputs).await
    }

    /// Runs one inference on an already resolved descriptor.
    pub async fn infer_with(
        &self,
        module: Arc<ModuleDescriptor>,
        inputs: TensorMap,
    ) -> Result<TensorMap, RuntimeError> {
        let spec = module.spec();
        validate(&inputs, &spec.inputs, spec.dynamic_batch()).map_err(|source| {
            RuntimeError::Validation {
                target: module.name.clone(),
                source,
            }
        })?;

        let policy = self.scheduler.current();
        debug!(module = %module.name, policy = policy.name(), "admitting call");
        let mut outputs = policy.admit(Arc::clone(&module), inputs).await?;

        let spec = module.spec();
        outputs.retain(|port, _| spec.output(port).is_some());
        validate(&outputs, &spec.outputs, spec.dynamic_batch()).map_err(|source| {
            DispatchError::InvalidOutput {
                module: module.name.clone(),
                source,
            }
        })?;
        Ok(outputs)
    }
}
