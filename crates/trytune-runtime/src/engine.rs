use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::info;
use trytune_backend_builtin::BuiltinInfo;
use trytune_backend_remote::RemoteBackend;
use trytune_core::{PipelineSpec, PortSpec, TensorMap, TensorPayload};

use crate::{
    AddModule, Dispatcher, ExecutorConfig, ModuleDescriptor, ModuleLoader, ModuleRegistry,
    PipelineExecutor, PipelineGraph, PipelineRegistry, RegistrationError, RuntimeError, Scheduler,
};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub scheduler: String,
    pub scheduler_config: Value,
    pub executor: ExecutorConfig,
    /// Per-request timeout of the remote backend's HTTP client.
    pub remote_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: "fifo".to_string(),
            scheduler_config: Value::Null,
            executor: ExecutorConfig::default(),
            remote_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide state: module and pipeline registries, the active
/// scheduling policy and the executor. Cheap to share behind an `Arc`.
pub struct Engine {
    loader: ModuleLoader,
    modules: Arc<ModuleRegistry>,
    pipelines: PipelineRegistry,
    dispatcher: Dispatcher,
    executor: PipelineExecutor,
}

impl Engine {
    pub fn init(config: EngineConfig) -> anyhow::Result<Self> {
        let remote = RemoteBackend::new(config.remote_timeout)?;
        let scheduler = Scheduler::from_config(&config.scheduler, &config.scheduler_config)
            .with_context(|| format!("failed to set up scheduler {}", config.scheduler))?;

        let modules = Arc::new(ModuleRegistry::new("module"));
        let dispatcher = Dispatcher::new(Arc::clone(&modules), Arc::new(scheduler));
        let executor = PipelineExecutor::new(dispatcher.clone(), config.executor);
        info!(scheduler = %config.scheduler, "engine initialised");

        Ok(Self {
            loader: ModuleLoader::new(remote),
            modules,
            pipelines: PipelineRegistry::new("pipeline"),
            dispatcher,
            executor,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn available_builtins(&self) -> Vec<BuiltinInfo> {
        self.loader.available_builtins()
    }

    /// Loads and registers a module. Rejected modules leave no trace.
    pub async fn add_module(
        &self,
        request: AddModule,
    ) -> Result<Arc<ModuleDescriptor>, RegistrationError> {
        if request.name.is_empty() {
            return Err(RegistrationError::EmptyName { kind: "module" });
        }
        // Checked up front so a duplicate never reaches the network.
        if self.modules.contains(&request.name) {
            return Err(RegistrationError::AlreadyExists {
                kind: "module",
                name: request.name,
            });
        }
        let descriptor = self.loader.load(request).await?;
        let name = descriptor.name.clone();
        self.modules.insert(&name, descriptor)
    }

    pub fn module(&self, name: &str) -> Result<Arc<ModuleDescriptor>, RuntimeError> {
        self.modules
            .get(name)
            .ok_or_else(|| RuntimeError::not_found("module", name))
    }

    pub fn modules(&self) -> Vec<(String, Arc<ModuleDescriptor>)> {
        self.modules.list()
    }

    /// Removes every module and lets the active policy's per-module queues
    /// wind down once their in-flight calls are answered.
    pub fn clear_modules(&self) -> usize {
        let removed = self.modules.clear();
        self.dispatcher.scheduler().current().release_queues();
        removed
    }

    /// Decodes request payloads against the module's input ports and runs
    /// one inference.
    pub async fn infer_module(
        &self,
        name: &str,
        payloads: BTreeMap<String, TensorPayload>,
    ) -> Result<TensorMap, RuntimeError> {
        let module = self.module(name)?;
        let inputs = decode(payloads, |port| module.spec().input(port).cloned())?;
        self.dispatcher.infer_with(module, inputs).await
    }

    pub fn add_pipeline(&self, spec: PipelineSpec) -> Result<Arc<PipelineGraph>, RegistrationError> {
        if self.pipelines.contains(&spec.name) {
            return Err(RegistrationError::AlreadyExists {
                kind: "pipeline",
                name: spec.name,
            });
        }
        let graph = PipelineGraph::build(spec, &self.modules)?;
        let name = graph.name.clone();
        self.pipelines.insert(&name, graph)
    }

    pub fn pipeline(&self, name: &str) -> Result<Arc<PipelineGraph>, RuntimeError> {
        self.pipelines
            .get(name)
            .ok_or_else(|| RuntimeError::not_found("pipeline", name))
    }

    pub fn pipelines(&self) -> Vec<(String, Arc<PipelineGraph>)> {
        self.pipelines.list()
    }

    pub fn clear_pipelines(&self) -> usize {
        self.pipelines.clear()
    }

    /// Runs a registered pipeline on already decoded tensors.
    pub async fn run_pipeline(
        &self,
        name: &str,
        inputs: TensorMap,
    ) -> Result<TensorMap, RuntimeError> {
        let graph = self.pipeline(name)?;
        self.executor.run(graph, inputs).await
    }

    /// Decodes request payloads against the pipeline's input contracts and
    /// runs it.
    pub async fn infer_pipeline(
        &self,
        name: &str,
        payloads: BTreeMap<String, TensorPayload>,
    ) -> Result<TensorMap, RuntimeError> {
        let graph = self.pipeline(name)?;
        let inputs = decode(payloads, |tensor| graph.inputs.get(tensor).cloned())?;
        self.executor.run(graph, inputs).await
    }

    pub fn set_scheduler(&self, name: &str, config: &Value) -> Result<(), RuntimeError> {
        self.dispatcher.scheduler().set(name, config)?;
        Ok(())
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.dispatcher.scheduler().current().name()
    }
}

fn decode<F>(payloads: BTreeMap<String, TensorPayload>, contract: F) -> Result<TensorMap, RuntimeError>
where
    F: Fn(&str) -> Option<PortSpec>,
{
    let mut tensors = TensorMap::new();
    for (name, payload) in payloads {
        let port = contract(&name).ok_or_else(|| RuntimeError::UnknownInput(name.clone()))?;
        let tensor = payload
            .into_tensor(port.dtype, &port.dims)
            .map_err(|source| RuntimeError::Tensor {
                tensor: name.clone(),
                source,
            })?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}
