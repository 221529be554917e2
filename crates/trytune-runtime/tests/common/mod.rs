#![allow(dead_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{json, Value};
use trytune_core::{Shape, Tensor, TensorMap};
use trytune_runtime::{AddModule, Engine, EngineConfig, ModuleSource};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn engine() -> Result<Engine> {
    Engine::init(EngineConfig::default())
}

pub async fn add_builtin(engine: &Engine, name: &str, args: Value) -> Result<()> {
    engine
        .add_module(AddModule {
            name: name.to_string(),
            source: ModuleSource::Builtin { args },
        })
        .await?;
    Ok(())
}

/// Identity over FP32 tensors of the given wire shape.
pub async fn add_identity(engine: &Engine, name: &str, shape: &[i64], max_batch: usize) -> Result<()> {
    add_builtin(
        engine,
        name,
        json!({"target": "Identity", "shape": shape, "max_batch_size": max_batch}),
    )
    .await
}

pub async fn add_remote(engine: &Engine, name: &str, servers: &[&MockServer]) -> Result<()> {
    let urls: BTreeMap<String, String> = servers
        .iter()
        .enumerate()
        .map(|(i, s)| (format!("instance-{i}"), s.uri()))
        .collect();
    engine
        .add_module(AddModule {
            name: name.to_string(),
            source: ModuleSource::Remote { urls },
        })
        .await?;
    Ok(())
}

/// Serves KServe metadata for `model` with one FP32 input `INPUT` and one
/// FP32 output `OUTPUT`.
pub async fn serve_metadata(
    server: &MockServer,
    model: &str,
    input_shape: &[i64],
    output_shape: &[i64],
    max_batch: usize,
) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/models/{model}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": model,
            "versions": ["1"],
            "platform": "onnxruntime_onnx",
            "inputs": [{"name": "INPUT", "datatype": "FP32", "shape": input_shape}],
            "outputs": [{"name": "OUTPUT", "datatype": "FP32", "shape": output_shape}],
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/models/{model}/config")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"max_batch_size": max_batch})))
        .mount(server)
        .await;
}

pub fn infer_reply(shape: &[i64], data: &[f32]) -> Value {
    json!({
        "outputs": [{"name": "OUTPUT", "datatype": "FP32", "shape": shape, "data": data}]
    })
}

pub fn f32_tensor(dims: &[usize], values: &[f32]) -> Result<Tensor> {
    Ok(Tensor::from_f32(Shape::from_slice(dims), values)?)
}

pub fn tensors(entries: Vec<(&str, Tensor)>) -> TensorMap {
    entries
        .into_iter()
        .map(|(name, tensor)| (name.to_string(), tensor))
        .collect()
}
