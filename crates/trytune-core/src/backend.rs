use anyhow::Result;
use async_trait::async_trait;

use crate::{ModuleKind, ModuleSpec, TensorMap};

/// A loaded module instance able to run inference.
#[async_trait]
pub trait BackendModel: Send + Sync + 'static {
    fn kind(&self) -> ModuleKind;

    fn spec(&self) -> &ModuleSpec;

    /// Inputs are keyed by port name and have already passed validation.
    async fn infer(&self, inputs: TensorMap) -> Result<TensorMap>;
}
