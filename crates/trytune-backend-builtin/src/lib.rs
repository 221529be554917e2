mod ops;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use trytune_core::{BackendModel, DType, ModuleKind, ModuleSpec, PortSpec, TensorMap};

pub use ops::{CropArgs, IdentityArgs, NormalizeArgs, SoftmaxArgs};

/// Construction arguments, selected by their `target` key.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "target")]
pub enum BuiltinArgs {
    Identity(IdentityArgs),
    Normalize(NormalizeArgs),
    Softmax(SoftmaxArgs),
    Crop(CropArgs),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuiltinInfo {
    pub target: &'static str,
    pub description: &'static str,
}

/// Factory for in-process modules.
pub struct BuiltinBackend;

impl BuiltinBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn available(&self) -> Vec<BuiltinInfo> {
        vec![
            BuiltinInfo {
                target: "Identity",
                description: "returns its input x unchanged as y",
            },
            BuiltinInfo {
                target: "Normalize",
                description: "per-channel (IMAGE - mean) / std over NCHW images",
            },
            BuiltinInfo {
                target: "Softmax",
                description: "softmax of LOGITS over the last axis",
            },
            BuiltinInfo {
                target: "Crop",
                description: "crops detections above a score threshold out of an image",
            },
        ]
    }

    pub fn load(&self, args: &Value) -> Result<BuiltinModel> {
        let args: BuiltinArgs =
            serde_json::from_value(args.clone()).context("invalid builtin_args")?;
        let op = match args {
            BuiltinArgs::Identity(args) => BuiltinOp::Identity(args.build()?),
            BuiltinArgs::Normalize(args) => BuiltinOp::Normalize(args.build()?),
            BuiltinArgs::Softmax(args) => BuiltinOp::Softmax(args.build()),
            BuiltinArgs::Crop(args) => BuiltinOp::Crop(args.build()),
        };
        let spec = op.spec();
        debug!(builtin = op.target(), "loaded builtin module");
        Ok(BuiltinModel { spec, op })
    }
}

impl Default for BuiltinBackend {
    fn default() -> Self {
        Self::new()
    }
}

enum BuiltinOp {
    Identity(ops::Identity),
    Normalize(ops::Normalize),
    Softmax(ops::Softmax),
    Crop(ops::Crop),
}

impl BuiltinOp {
    fn target(&self) -> &'static str {
        match self {
            BuiltinOp::Identity(_) => "Identity",
            BuiltinOp::Normalize(_) => "Normalize",
            BuiltinOp::Softmax(_) => "Softmax",
            BuiltinOp::Crop(_) => "Crop",
        }
    }

    fn spec(&self) -> ModuleSpec {
        match self {
            BuiltinOp::Identity(op) => op.spec(),
            BuiltinOp::Normalize(op) => op.spec(),
            BuiltinOp::Softmax(op) => op.spec(),
            BuiltinOp::Crop(_) => ops::Crop::spec(),
        }
    }

    fn run(&self, inputs: TensorMap) -> Result<TensorMap> {
        match self {
            BuiltinOp::Identity(op) => op.run(inputs),
            BuiltinOp::Normalize(op) => op.run(inputs),
            BuiltinOp::Softmax(op) => op.run(inputs),
            BuiltinOp::Crop(op) => op.run(inputs),
        }
    }
}

pub struct BuiltinModel {
    spec: ModuleSpec,
    op: BuiltinOp,
}

impl BuiltinModel {
    pub fn target(&self) -> &'static str {
        self.op.target()
    }
}

#[async_trait]
impl BackendModel for BuiltinModel {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Builtin
    }

    fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    async fn infer(&self, inputs: TensorMap) -> Result<TensorMap> {
        self.op.run(inputs)
    }
}

fn f32_port(name: &str, dims: &[i64]) -> PortSpec {
    PortSpec::from_wire(name, DType::F32, dims)
}
