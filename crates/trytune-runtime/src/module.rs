use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use trytune_backend_builtin::{BuiltinBackend, BuiltinInfo, BuiltinModel};
use trytune_backend_remote::{Endpoint, RemoteBackend, RemoteModel};
use tracing::warn;
use trytune_core::{BackendModel, ModuleKind, ModuleSpec, TensorMap};

use crate::{DispatchError, RegistrationError};

/// Closed set of module backends.
pub enum ModuleBackend {
    Remote(RemoteModel),
    Builtin(BuiltinModel),
}

impl ModuleBackend {
    fn model(&self) -> &dyn BackendModel {
        match self {
            ModuleBackend::Remote(model) => model,
            ModuleBackend::Builtin(model) => model,
        }
    }

    pub fn kind(&self) -> ModuleKind {
        self.model().kind()
    }

    pub fn spec(&self) -> &ModuleSpec {
        self.model().spec()
    }
}

/// A registered module. Immutable once created; shared as `Arc` snapshots.
pub struct ModuleDescriptor {
    pub name: String,
    pub backend: ModuleBackend,
}

impl ModuleDescriptor {
    pub fn spec(&self) -> &ModuleSpec {
        self.backend.spec()
    }

    pub fn kind(&self) -> ModuleKind {
        self.backend.kind()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        match &self.backend {
            ModuleBackend::Remote(model) => model.endpoints(),
            ModuleBackend::Builtin(_) => &[],
        }
    }

    /// Calls the backend directly, bypassing validation and scheduling.
    pub async fn invoke(&self, inputs: TensorMap) -> Result<TensorMap, DispatchError> {
        self.backend
            .model()
            .infer(inputs)
            .await
            .map_err(|source| DispatchError::Backend {
                module: self.name.clone(),
                source,
            })
    }

    /// Like [`ModuleDescriptor::invoke`], but on a task of its own: a backend
    /// that panics fails this call and leaves the caller running.
    pub async fn invoke_isolated(
        self: Arc<Self>,
        inputs: TensorMap,
    ) -> Result<TensorMap, DispatchError> {
        let name = self.name.clone();
        isolate(&name, async move { self.invoke(inputs).await }).await
    }
}

async fn isolate<F>(module: &str, call: F) -> Result<TensorMap, DispatchError>
where
    F: Future<Output = Result<TensorMap, DispatchError>> + Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(result) => result,
        Err(err) => {
            warn!(module, error = %err, "backend call did not complete");
            Err(DispatchError::Backend {
                module: module.to_string(),
                source: anyhow::anyhow!("backend call did not complete: {err}"),
            })
        }
    }
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("spec", self.spec())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum ModuleSource {
    /// Instance type → base URL of a KServe v2 server hosting the module.
    Remote { urls: BTreeMap<String, String> },
    /// Builtin construction arguments; `target` selects the capability.
    Builtin { args: Value },
}

#[derive(Clone, Debug)]
pub struct AddModule {
    pub name: String,
    pub source: ModuleSource,
}

pub struct ModuleLoader {
    remote: RemoteBackend,
    builtin: BuiltinBackend,
}

impl ModuleLoader {
    pub fn new(remote: RemoteBackend) -> Self {
        Self {
            remote,
            builtin: BuiltinBackend::new(),
        }
    }

    pub fn available_builtins(&self) -> Vec<BuiltinInfo> {
        self.builtin.available()
    }

    pub async fn load(&self, request: AddModule) -> Result<ModuleDescriptor, RegistrationError> {
        let AddModule { name, source } = request;
        let backend = match source {
            ModuleSource::Remote { urls } => self
                .remote
                .load(&name, &urls)
                .await
                .map(ModuleBackend::Remote),
            ModuleSource::Builtin { args } => {
                self.builtin.load(&args).map(ModuleBackend::Builtin)
            }
        }
        .map_err(|source| RegistrationError::Backend {
            module: name.clone(),
            source,
        })?;

        Ok(ModuleDescriptor { name, backend })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn explode() -> Result<TensorMap, DispatchError> {
        panic!("overflow")
    }

    #[tokio::test]
    async fn panicking_call_becomes_backend_error() {
        let err = isolate("m", explode()).await.unwrap_err();
        assert!(matches!(&err, DispatchError::Backend { module, .. } if module == "m"));
        assert!(format!("{:#}", anyhow::Error::from(err)).contains("panicked"));

        let ok = isolate("m", async { Ok::<_, DispatchError>(TensorMap::new()) })
            .await
            .unwrap();
        assert!(ok.is_empty());
    }
}
