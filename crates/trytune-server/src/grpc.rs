use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;

use serde_json::Value;
use tonic::{Request, Response, Status};
use tracing::warn;
use trytune_core::{PipelineSpec, PortSpec, StageSpec, TensorBinding, TensorMap, TensorPayload};
use trytune_proto::trytune::v1 as pb;
use trytune_runtime::{
    AddModule, DispatchError, Engine, ModuleDescriptor, ModuleSource, PipelineGraph,
    RegistrationError, RuntimeError, POLICIES,
};

pub struct ModuleSvc {
    engine: Arc<Engine>,
}

impl ModuleSvc {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl pb::module_service_server::ModuleService for ModuleSvc {
    async fn available_builtins(
        &self,
        _req: Request<pb::AvailableBuiltinsRequest>,
    ) -> Result<Response<pb::AvailableBuiltinsResponse>, Status> {
        let builtins = self
            .engine
            .available_builtins()
            .into_iter()
            .map(|info| pb::BuiltinInfo {
                target: info.target.to_string(),
                description: info.description.to_string(),
            })
            .collect();
        Ok(Response::new(pb::AvailableBuiltinsResponse { builtins }))
    }

    async fn add_module(
        &self,
        req: Request<pb::AddModuleRequest>,
    ) -> Result<Response<pb::ModuleMetadata>, Status> {
        let req = req.into_inner();
        let source = match pb::ModuleType::try_from(req.r#type) {
            Ok(pb::ModuleType::Remote) => {
                if req.urls.is_empty() {
                    return Err(Status::invalid_argument("no urls provided"));
                }
                ModuleSource::Remote {
                    urls: req.urls.into_iter().collect(),
                }
            }
            Ok(pb::ModuleType::Builtin) => {
                if req.builtin_args.trim().is_empty() {
                    return Err(Status::invalid_argument("no builtin_args provided"));
                }
                let args: Value = serde_json::from_str(&req.builtin_args).map_err(|e| {
                    Status::invalid_argument(format!("builtin_args is not valid JSON: {e}"))
                })?;
                ModuleSource::Builtin { args }
            }
            Ok(pb::ModuleType::Unspecified) | Err(_) => {
                return Err(Status::invalid_argument(format!(
                    "unsupported module type {}",
                    req.r#type
                )));
            }
        };

        let module = self
            .engine
            .add_module(AddModule {
                name: req.name,
                source,
            })
            .await
            .map_err(|e| registration_status(&e))?;
        Ok(Response::new(module_metadata(&module)))
    }

    async fn list_modules(
        &self,
        _req: Request<pb::ListModulesRequest>,
    ) -> Result<Response<pb::ListModulesResponse>, Status> {
        let modules = self
            .engine
            .modules()
            .iter()
            .map(|(_, module)| module_metadata(module))
            .collect();
        Ok(Response::new(pb::ListModulesResponse { modules }))
    }

    async fn get_module(
        &self,
        req: Request<pb::GetModuleRequest>,
    ) -> Result<Response<pb::ModuleMetadata>, Status> {
        let name = req.into_inner().name;
        let module = self.engine.module(&name).map_err(|e| to_status(&e))?;
        Ok(Response::new(module_metadata(&module)))
    }

    async fn clear_modules(
        &self,
        _req: Request<pb::ClearRequest>,
    ) -> Result<Response<pb::ClearResponse>, Status> {
        let removed = self.engine.clear_modules();
        Ok(Response::new(pb::ClearResponse {
            removed: removed as u32,
        }))
    }

    async fn infer(
        &self,
        req: Request<pb::InferRequest>,
    ) -> Result<Response<pb::InferResponse>, Status> {
        let (name, payloads) = infer_request(req.into_inner())?;
        let outputs = self
            .engine
            .infer_module(&name, payloads)
            .await
            .map_err(|e| to_status(&e))?;
        Ok(Response::new(infer_response(outputs)))
    }
}

pub struct PipelineSvc {
    engine: Arc<Engine>,
}

impl PipelineSvc {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl pb::pipeline_service_server::PipelineService for PipelineSvc {
    async fn add_pipeline(
        &self,
        req: Request<pb::AddPipelineRequest>,
    ) -> Result<Response<pb::PipelineMetadata>, Status> {
        let req = req.into_inner();
        let spec = PipelineSpec {
            name: req.name,
            inputs: req.inputs,
            outputs: req.outputs,
            stages: req.stages.into_iter().map(stage_spec).collect(),
        };
        let graph = self
            .engine
            .add_pipeline(spec)
            .map_err(|e| registration_status(&e))?;
        Ok(Response::new(pipeline_metadata(&graph)))
    }

    async fn list_pipelines(
        &self,
        _req: Request<pb::ListPipelinesRequest>,
    ) -> Result<Response<pb::ListPipelinesResponse>, Status> {
        let pipelines = self
            .engine
            .pipelines()
            .iter()
            .map(|(_, graph)| pipeline_metadata(graph))
            .collect();
        Ok(Response::new(pb::ListPipelinesResponse { pipelines }))
    }

    async fn get_pipeline(
        &self,
        req: Request<pb::GetPipelineRequest>,
    ) -> Result<Response<pb::PipelineMetadata>, Status> {
        let name = req.into_inner().name;
        let graph = self.engine.pipeline(&name).map_err(|e| to_status(&e))?;
        Ok(Response::new(pipeline_metadata(&graph)))
    }

    async fn clear_pipelines(
        &self,
        _req: Request<pb::ClearRequest>,
    ) -> Result<Response<pb::ClearResponse>, Status> {
        let removed = self.engine.clear_pipelines();
        Ok(Response::new(pb::ClearResponse {
            removed: removed as u32,
        }))
    }

    async fn infer(
        &self,
        req: Request<pb::InferRequest>,
    ) -> Result<Response<pb::InferResponse>, Status> {
        let (name, payloads) = infer_request(req.into_inner())?;
        let outputs = self
            .engine
            .infer_pipeline(&name, payloads)
            .await
            .map_err(|e| to_status(&e))?;
        Ok(Response::new(infer_response(outputs)))
    }
}

pub struct SchedulerSvc {
    engine: Arc<Engine>,
}

impl SchedulerSvc {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn info(&self) -> pb::SchedulerInfo {
        pb::SchedulerInfo {
            name: self.engine.scheduler_name().to_string(),
            available: POLICIES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[tonic::async_trait]
impl pb::scheduler_service_server::SchedulerService for SchedulerSvc {
    async fn set_scheduler(
        &self,
        req: Request<pb::SetSchedulerRequest>,
    ) -> Result<Response<pb::SchedulerInfo>, Status> {
        let req = req.into_inner();
        let config = if req.config.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&req.config)
                .map_err(|e| Status::invalid_argument(format!("config is not valid JSON: {e}")))?
        };
        self.engine
            .set_scheduler(&req.name, &config)
            .map_err(|e| to_status(&e))?;
        Ok(Response::new(self.info()))
    }

    async fn get_scheduler(
        &self,
        _req: Request<pb::GetSchedulerRequest>,
    ) -> Result<Response<pb::SchedulerInfo>, Status> {
        Ok(Response::new(self.info()))
    }
}

fn infer_request(
    req: pb::InferRequest,
) -> Result<(String, BTreeMap<String, TensorPayload>), Status> {
    if req.name != req.target {
        return Err(Status::invalid_argument(format!(
            "{} does not match the target inside the request {}",
            req.name, req.target
        )));
    }
    let payloads = req
        .inputs
        .into_iter()
        .map(|(name, t)| {
            let payload = TensorPayload {
                data: t.data,
                shape: t.shape.map(|s| s.dims),
            };
            (name, payload)
        })
        .collect();
    Ok((req.name, payloads))
}

fn infer_response(outputs: TensorMap) -> pb::InferResponse {
    let outputs = outputs
        .into_iter()
        .map(|(name, t)| {
            let tensor = pb::OutputTensor {
                datatype: t.dtype().as_str().to_string(),
                shape: t.shape().dims().iter().map(|d| *d as i64).collect(),
                data: t.to_values(),
            };
            (name, tensor)
        })
        .collect();
    pb::InferResponse { outputs }
}

fn port(spec: &PortSpec) -> pb::Port {
    pb::Port {
        name: spec.name.clone(),
        datatype: spec.dtype.as_str().to_string(),
        shape: spec.wire_dims(),
    }
}

fn module_metadata(module: &ModuleDescriptor) -> pb::ModuleMetadata {
    let spec = module.spec();
    let kind = match module.kind() {
        trytune_core::ModuleKind::Remote => pb::ModuleType::Remote,
        trytune_core::ModuleKind::Builtin => pb::ModuleType::Builtin,
    };
    pb::ModuleMetadata {
        name: module.name.clone(),
        r#type: kind as i32,
        inputs: spec.inputs.iter().map(port).collect(),
        outputs: spec.outputs.iter().map(port).collect(),
        max_batch_size: spec.max_batch as u32,
        urls: module
            .endpoints()
            .iter()
            .map(|e| (e.instance.clone(), e.url.clone()))
            .collect(),
    }
}

fn stage_spec(stage: pb::Stage) -> StageSpec {
    let bindings = |map: std::collections::HashMap<String, pb::TensorBinding>| {
        map.into_iter()
            .map(|(port, b)| {
                let binding = TensorBinding {
                    tensor: b.tensor,
                    reshape: b.reshape.map(|s| s.dims),
                };
                (port, binding)
            })
            .collect()
    };
    StageSpec {
        name: stage.name,
        module: stage.module,
        inputs: bindings(stage.inputs),
        outputs: bindings(stage.outputs),
    }
}

fn pipeline_metadata(graph: &PipelineGraph) -> pb::PipelineMetadata {
    let bindings = |map: &BTreeMap<String, TensorBinding>| {
        map.iter()
            .map(|(port, b)| {
                let binding = pb::TensorBinding {
                    tensor: b.tensor.clone(),
                    reshape: b.reshape.clone().map(|dims| pb::Shape { dims }),
                };
                (port.clone(), binding)
            })
            .collect()
    };
    pb::PipelineMetadata {
        name: graph.name.clone(),
        inputs: graph
            .spec
            .inputs
            .iter()
            .filter_map(|name| graph.inputs.get(name))
            .map(port)
            .collect(),
        outputs: graph.outputs.clone(),
        stages: graph
            .spec
            .stages
            .iter()
            .map(|s| pb::Stage {
                name: s.name.clone(),
                module: s.module.clone(),
                inputs: bindings(&s.inputs),
                outputs: bindings(&s.outputs),
            })
            .collect(),
    }
}

/// Message with every source in the chain, outermost first.
fn describe(err: &dyn StdError) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

fn registration_status(err: &RegistrationError) -> Status {
    Status::invalid_argument(describe(err))
}

fn to_status(err: &RuntimeError) -> Status {
    let msg = describe(err);
    match err.root() {
        RuntimeError::NotFound { .. } => Status::not_found(msg),
        RuntimeError::Validation { .. }
        | RuntimeError::Tensor { .. }
        | RuntimeError::UnknownInput(_)
        | RuntimeError::MissingInput(_)
        | RuntimeError::Registration(_)
        | RuntimeError::Scheduler(_) => Status::invalid_argument(msg),
        RuntimeError::Dispatch(DispatchError::Timeout { .. }) | RuntimeError::RunTimeout { .. } => {
            Status::deadline_exceeded(msg)
        }
        RuntimeError::Dispatch(_)
        | RuntimeError::DuplicateTensor(_)
        | RuntimeError::Stage { .. }
        | RuntimeError::TaskAborted { .. }
        | RuntimeError::Stalled(_) => {
            warn!(error = %msg, "request failed");
            Status::internal(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tonic::Code;
    use trytune_runtime::EngineConfig;

    use super::*;
    use pb::module_service_server::ModuleService;
    use pb::pipeline_service_server::PipelineService;
    use pb::scheduler_service_server::SchedulerService;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::init(EngineConfig::default()).unwrap())
    }

    async fn add_identity(svc: &ModuleSvc, name: &str) {
        svc.add_module(Request::new(pb::AddModuleRequest {
            name: name.to_string(),
            r#type: pb::ModuleType::Builtin as i32,
            urls: HashMap::new(),
            builtin_args: r#"{"target": "Identity", "shape": [-1, 2]}"#.to_string(),
        }))
        .await
        .unwrap();
    }

    fn infer(name: &str, target: &str, data: Vec<f64>) -> Request<pb::InferRequest> {
        let mut inputs = HashMap::new();
        inputs.insert("x".to_string(), pb::InputTensor { data, shape: None });
        Request::new(pb::InferRequest {
            name: name.to_string(),
            target: target.to_string(),
            inputs,
        })
    }

    #[tokio::test]
    async fn module_round_trip() {
        let svc = ModuleSvc::new(engine());
        add_identity(&svc, "id").await;

        let meta = svc
            .get_module(Request::new(pb::GetModuleRequest { name: "id".into() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(meta.r#type, pb::ModuleType::Builtin as i32);
        assert_eq!(meta.inputs[0].shape, vec![-1, 2]);
        assert_eq!(meta.inputs[0].datatype, "FP32");

        let out = svc
            .infer(infer("id", "id", vec![1.0, 2.0, 3.0, 4.0]))
            .await
            .unwrap()
            .into_inner();
        let y = &out.outputs["y"];
        assert_eq!(y.shape, vec![2, 2]);
        assert_eq!(y.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn maps_errors_to_codes() {
        let svc = ModuleSvc::new(engine());
        add_identity(&svc, "id").await;

        let err = svc.infer(infer("id", "other", vec![1.0, 2.0])).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = svc.infer(infer("nope", "nope", vec![1.0, 2.0])).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let err = svc.infer(infer("id", "id", vec![1.0, 2.0, 3.0])).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut huge = infer("id", "id", vec![]);
        huge.get_mut().inputs.get_mut("x").unwrap().shape = Some(pb::Shape {
            dims: vec![1 << 32, 1 << 32],
        });
        let err = svc.infer(huge).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.message().contains("invalid shape"), "{}", err.message());

        let err = svc
            .add_module(Request::new(pb::AddModuleRequest {
                name: "id".into(),
                r#type: pb::ModuleType::Builtin as i32,
                urls: HashMap::new(),
                builtin_args: r#"{"target": "Identity"}"#.into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.message().contains("already exists"), "{}", err.message());
    }

    #[tokio::test]
    async fn pipeline_round_trip() {
        let engine = engine();
        add_identity(&ModuleSvc::new(Arc::clone(&engine)), "id").await;
        let svc = PipelineSvc::new(engine);

        let bind = |tensor: &str| pb::TensorBinding {
            tensor: tensor.to_string(),
            reshape: None,
        };
        let meta = svc
            .add_pipeline(Request::new(pb::AddPipelineRequest {
                name: "echo".into(),
                inputs: vec!["x".into()],
                outputs: vec!["y".into()],
                stages: vec![pb::Stage {
                    name: "only".into(),
                    module: "id".into(),
                    inputs: HashMap::from([("x".to_string(), bind("x"))]),
                    outputs: HashMap::from([("y".to_string(), bind("y"))]),
                }],
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(meta.inputs[0].name, "x");
        assert_eq!(meta.inputs[0].shape, vec![-1, 2]);

        let out = svc
            .infer(infer("echo", "echo", vec![5.0, 6.0]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(out.outputs.len(), 1);
        assert_eq!(out.outputs["y"].data, vec![5.0, 6.0]);

        let cleared = svc
            .clear_pipelines(Request::new(pb::ClearRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(cleared.removed, 1);
        let err = svc
            .get_pipeline(Request::new(pb::GetPipelineRequest { name: "echo".into() }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn scheduler_swap() {
        let svc = SchedulerSvc::new(engine());
        let info = svc
            .set_scheduler(Request::new(pb::SetSchedulerRequest {
                name: "dynamic_batching".into(),
                config: r#"{"max_batch": 4}"#.into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, "dynamic_batching");
        assert_eq!(info.available, vec!["fifo", "dynamic_batching"]);

        let err = svc
            .set_scheduler(Request::new(pb::SetSchedulerRequest {
                name: "lottery".into(),
                config: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
