use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use trytune_core::{
    BackendModel, DType, ModuleKind, ModuleSpec, PortSpec, Shape, Tensor, TensorMap,
};

/// Client for inference servers speaking the KServe v2 HTTP/JSON protocol
/// (Triton and friends).
#[derive(Clone)]
pub struct RemoteBackend {
    client: reqwest::Client,
}

impl RemoteBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetches metadata for `model` from every endpoint. All endpoints must
    /// agree, otherwise loading fails.
    pub async fn load(&self, model: &str, urls: &BTreeMap<String, String>) -> Result<RemoteModel> {
        ensure!(!urls.is_empty(), "no endpoint urls provided for {model}");

        let endpoints: Vec<Endpoint> = urls
            .iter()
            .map(|(instance, url)| Endpoint {
                instance: instance.clone(),
                url: url.trim_end_matches('/').to_string(),
            })
            .collect();

        let first = &endpoints[0];
        let metadata = self.fetch_metadata(model, &first.url).await?;
        for other in &endpoints[1..] {
            let theirs = self.fetch_metadata(model, &other.url).await?;
            if theirs != metadata {
                bail!(
                    "module metadata mismatch: {} reports {:?}, {} reports {:?}",
                    first.url,
                    metadata,
                    other.url,
                    theirs
                );
            }
        }

        let spec = metadata.to_spec()?;
        info!(
            model,
            endpoints = endpoints.len(),
            max_batch = spec.max_batch,
            "loaded remote module metadata"
        );

        Ok(RemoteModel {
            spec,
            model: model.to_string(),
            endpoints,
            client: self.client.clone(),
            rr: AtomicUsize::new(0),
        })
    }

    async fn fetch_metadata(&self, model: &str, url: &str) -> Result<RemoteMetadata> {
        let target = format!("{url}/v2/models/{model}");
        let response = self
            .client
            .get(&target)
            .send()
            .await
            .with_context(|| format!("while getting metadata from {target}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{status} from {target}: {body}");
        }
        let model_metadata: ModelMetadata = response
            .json()
            .await
            .with_context(|| format!("invalid metadata from {target}"))?;

        // The config endpoint is optional; servers without it are treated as non-batching.
        let config_target = format!("{target}/config");
        let max_batch_size = match self.client.get(&config_target).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<ModelConfig>()
                .await
                .map(|c| c.max_batch_size)
                .unwrap_or(0),
            _ => 0,
        };
        debug!(url = %target, max_batch_size, "fetched remote metadata");

        Ok(RemoteMetadata {
            model: model_metadata,
            max_batch_size,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub instance: String,
    pub url: String,
}

pub struct RemoteModel {
    spec: ModuleSpec,
    model: String,
    endpoints: Vec<Endpoint>,
    client: reqwest::Client,
    rr: AtomicUsize,
}

impl RemoteModel {
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn next_endpoint(&self) -> &Endpoint {
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[idx]
    }
}

#[async_trait]
impl BackendModel for RemoteModel {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Remote
    }

    fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    async fn infer(&self, inputs: TensorMap) -> Result<TensorMap> {
        let request = InferRequest {
            inputs: inputs
                .iter()
                .map(|(name, tensor)| WireTensor::from_tensor(name, tensor))
                .collect::<Result<_>>()?,
            outputs: self
                .spec
                .outputs
                .iter()
                .map(|p| OutputRequest {
                    name: p.name.clone(),
                })
                .collect(),
        };

        let endpoint = self.next_endpoint();
        let target = format!("{}/v2/models/{}/infer", endpoint.url, self.model);
        debug!(url = %target, instance = %endpoint.instance, "remote inference");

        let response = self
            .client
            .post(&target)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("inference request to {target} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{status} from {target}: {body}");
        }

        let response: InferResponse = response
            .json()
            .await
            .with_context(|| format!("invalid inference response from {target}"))?;

        let mut outputs = TensorMap::new();
        for output in response.outputs {
            let tensor = output.to_tensor()?;
            outputs.insert(output.name, tensor);
        }
        Ok(outputs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub platform: String,
    pub inputs: Vec<PortMetadata>,
    pub outputs: Vec<PortMetadata>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMetadata {
    pub name: String,
    pub datatype: String,
    pub shape: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    #[serde(default)]
    max_batch_size: usize,
}

#[derive(Clone, Debug, PartialEq)]
struct RemoteMetadata {
    model: ModelMetadata,
    max_batch_size: usize,
}

impl RemoteMetadata {
    fn to_spec(&self) -> Result<ModuleSpec> {
        let ports = |ports: &[PortMetadata]| -> Result<Vec<PortSpec>> {
            ports
                .iter()
                .map(|p| {
                    let dtype: DType = p.datatype.parse()?;
                    Ok(PortSpec::from_wire(&p.name, dtype, &p.shape))
                })
                .collect()
        };
        Ok(ModuleSpec {
            inputs: ports(&self.model.inputs)?,
            outputs: ports(&self.model.outputs)?,
            max_batch: self.max_batch_size,
        })
    }
}

#[derive(Debug, Serialize)]
struct InferRequest {
    inputs: Vec<WireTensor>,
    outputs: Vec<OutputRequest>,
}

#[derive(Debug, Serialize)]
struct OutputRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    outputs: Vec<WireTensor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTensor {
    name: String,
    datatype: String,
    shape: Vec<i64>,
    data: Vec<Value>,
}

impl WireTensor {
    fn from_tensor(name: &str, tensor: &Tensor) -> Result<Self> {
        let dtype = tensor.dtype();
        // INT64 goes over the wire as JSON integers so large values stay exact.
        let data = match dtype {
            DType::I64 => tensor.to_i64()?.into_iter().map(Value::from).collect(),
            _ => tensor
                .to_values()
                .into_iter()
                .map(|v| match dtype {
                    DType::Bool => Value::Bool(v != 0.0),
                    DType::F16 | DType::F32 | DType::F64 => Value::from(v),
                    _ => Value::from(v as i64),
                })
                .collect(),
        };
        Ok(Self {
            name: name.to_string(),
            datatype: dtype.as_str().to_string(),
            shape: tensor.shape().dims().iter().map(|d| *d as i64).collect(),
            data,
        })
    }

    fn to_tensor(&self) -> Result<Tensor> {
        let dtype: DType = self.datatype.parse()?;
        let dims = self
            .shape
            .iter()
            .map(|d| usize::try_from(*d).with_context(|| format!("negative dim in {}", self.name)))
            .collect::<Result<Vec<_>>>()?;
        let shape = Shape::from_slice(&dims);

        if dtype == DType::I64 {
            let values = self
                .data
                .iter()
                .map(|v| {
                    v.as_i64()
                        .with_context(|| format!("non-integer INT64 element {v} in {}", self.name))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Tensor::from_i64(shape, &values)?);
        }

        let values = self
            .data
            .iter()
            .map(|v| match v {
                Value::Bool(b) => Ok(f64::from(u8::from(*b))),
                Value::Number(n) => n
                    .as_f64()
                    .with_context(|| format!("non-numeric element in {}", self.name)),
                other => bail!("unsupported element {other} in {}", self.name),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::from_values(dtype, shape, &values)?)
    }
}
