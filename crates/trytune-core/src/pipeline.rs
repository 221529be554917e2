use std::collections::BTreeMap;

/// Binds a module port to a pipeline-wide tensor name, optionally reshaping
/// the tensor on the way in or out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorBinding {
    pub tensor: String,
    pub reshape: Option<Vec<i64>>,
}

impl TensorBinding {
    pub fn new(tensor: impl Into<String>) -> Self {
        Self {
            tensor: tensor.into(),
            reshape: None,
        }
    }

    pub fn reshaped(mut self, shape: Vec<i64>) -> Self {
        self.reshape = Some(shape);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub module: String,
    pub inputs: BTreeMap<String, TensorBinding>,
    pub outputs: BTreeMap<String, TensorBinding>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn input(mut self, port: impl Into<String>, binding: TensorBinding) -> Self {
        self.inputs.insert(port.into(), binding);
        self
    }

    pub fn output(mut self, port: impl Into<String>, binding: TensorBinding) -> Self {
        self.outputs.insert(port.into(), binding);
        self
    }
}

/// A pipeline as submitted for registration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineSpec {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub stages: Vec<StageSpec>,
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, tensor: impl Into<String>) -> Self {
        self.inputs.push(tensor.into());
        self
    }

    pub fn output(mut self, tensor: impl Into<String>) -> Self {
        self.outputs.push(tensor.into());
        self
    }

    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }
}
