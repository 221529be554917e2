use serde::{Deserialize, Serialize};

use crate::DType;

/// Declared contract of one module input or output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl PortSpec {
    pub fn new(name: impl Into<String>, dtype: DType, dims: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims,
        }
    }

    /// Builds a port from wire-style dims where `-1` is dynamic.
    pub fn from_wire(name: impl Into<String>, dtype: DType, dims: &[i64]) -> Self {
        let dims = dims
            .iter()
            .map(|d| if *d < 0 { None } else { Some(*d as usize) })
            .collect();
        Self::new(name, dtype, dims)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn wire_dims(&self) -> Vec<i64> {
        self.dims
            .iter()
            .map(|d| d.map(|d| d as i64).unwrap_or(-1))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleSpec {
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    pub max_batch: usize,
}

impl ModuleSpec {
    /// Leading-dimension relaxation applies only to modules that batch.
    pub fn dynamic_batch(&self) -> bool {
        self.max_batch > 0
    }

    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// Which backend family serves a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Remote,
    Builtin,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Remote => "remote",
            ModuleKind::Builtin => "builtin",
        }
    }
}
