use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use trytune_backend_remote::RemoteBackend;
use trytune_core::{BackendModel, DType, Shape, Tensor, TensorMap};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn metadata(output_shape: &[i64]) -> serde_json::Value {
    json!({
        "name": "doubler",
        "versions": ["1"],
        "platform": "onnxruntime_onnx",
        "inputs": [{"name": "INPUT", "datatype": "FP32", "shape": [-1, 3]}],
        "outputs": [{"name": "OUTPUT", "datatype": "FP32", "shape": output_shape}],
    })
}

async fn serve_metadata(server: &MockServer, output_shape: &[i64], max_batch: usize) {
    Mock::given(method("GET"))
        .and(path("/v2/models/doubler"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metadata(output_shape)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/models/doubler/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"max_batch_size": max_batch})))
        .mount(server)
        .await;
}

fn urls(servers: &[&MockServer]) -> BTreeMap<String, String> {
    servers
        .iter()
        .enumerate()
        .map(|(i, s)| (format!("instance-{i}"), s.uri()))
        .collect()
}

#[tokio::test]
async fn loads_spec_from_metadata_and_config() -> Result<()> {
    let server = MockServer::start().await;
    serve_metadata(&server, &[-1, 3], 8).await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let model = backend.load("doubler", &urls(&[&server])).await?;

    let spec = model.spec();
    assert_eq!(spec.max_batch, 8);
    assert_eq!(spec.inputs[0].name, "INPUT");
    assert_eq!(spec.inputs[0].dtype, DType::F32);
    assert_eq!(spec.inputs[0].dims, vec![None, Some(3)]);
    assert_eq!(spec.outputs[0].name, "OUTPUT");
    Ok(())
}

#[tokio::test]
async fn missing_config_endpoint_means_no_batching() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/models/doubler"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metadata(&[-1, 3])))
        .mount(&server)
        .await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let model = backend.load("doubler", &urls(&[&server])).await?;
    assert_eq!(model.spec().max_batch, 0);
    Ok(())
}

#[tokio::test]
async fn mismatched_endpoints_are_rejected_naming_both() -> Result<()> {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    serve_metadata(&a, &[-1, 3], 8).await;
    serve_metadata(&b, &[-1, 4], 8).await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let err = match backend.load("doubler", &urls(&[&a, &b])).await {
        Ok(_) => panic!("mismatched metadata must not load"),
        Err(err) => err.to_string(),
    };
    assert!(err.contains("mismatch"), "{err}");
    assert!(err.contains(&a.uri()), "{err}");
    assert!(err.contains(&b.uri()), "{err}");
    Ok(())
}

#[tokio::test]
async fn unreachable_metadata_fails_load() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/models/doubler"))
        .respond_with(ResponseTemplate::new(404).set_body_string("unknown model"))
        .mount(&server)
        .await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    assert!(backend.load("doubler", &urls(&[&server])).await.is_err());
    Ok(())
}

#[tokio::test]
async fn infer_posts_kserve_request_and_decodes_outputs() -> Result<()> {
    let server = MockServer::start().await;
    serve_metadata(&server, &[-1, 3], 0).await;
    Mock::given(method("POST"))
        .and(path("/v2/models/doubler/infer"))
        .and(body_partial_json(json!({
            "inputs": [{"name": "INPUT", "datatype": "FP32", "shape": [1, 3], "data": [1.0, 2.0, 3.0]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model_name": "doubler",
            "outputs": [{"name": "OUTPUT", "datatype": "FP32", "shape": [1, 3], "data": [2.0, 4.0, 6.0]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let model = backend.load("doubler", &urls(&[&server])).await?;

    let mut inputs = TensorMap::new();
    inputs.insert(
        "INPUT".to_string(),
        Tensor::from_f32(Shape::from_slice(&[1, 3]), &[1.0, 2.0, 3.0])?,
    );
    let outputs = model.infer(inputs).await?;

    let out = &outputs["OUTPUT"];
    assert_eq!(out.shape(), &Shape::from_slice(&[1, 3]));
    assert_eq!(out.to_f32()?, vec![2.0, 4.0, 6.0]);
    Ok(())
}

#[tokio::test]
async fn infer_rotates_over_endpoints() -> Result<()> {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let reply = json!({
        "outputs": [{"name": "OUTPUT", "datatype": "FP32", "shape": [1, 3], "data": [0, 0, 0]}]
    });
    for server in [&a, &b] {
        serve_metadata(server, &[-1, 3], 0).await;
        Mock::given(method("POST"))
            .and(path("/v2/models/doubler/infer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply.clone()))
            .expect(1)
            .mount(server)
            .await;
    }

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let model = backend.load("doubler", &urls(&[&a, &b])).await?;
    for _ in 0..2 {
        let mut inputs = TensorMap::new();
        inputs.insert(
            "INPUT".to_string(),
            Tensor::from_f32(Shape::from_slice(&[1, 3]), &[0.0; 3])?,
        );
        model.infer(inputs).await?;
    }
    Ok(())
}

#[tokio::test]
async fn server_error_surfaces_as_failure() -> Result<()> {
    let server = MockServer::start().await;
    serve_metadata(&server, &[-1, 3], 0).await;
    Mock::given(method("POST"))
        .and(path("/v2/models/doubler/infer"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let model = backend.load("doubler", &urls(&[&server])).await?;
    let mut inputs = TensorMap::new();
    inputs.insert(
        "INPUT".to_string(),
        Tensor::from_f32(Shape::from_slice(&[1, 3]), &[0.0; 3])?,
    );
    let err = model.infer(inputs).await.unwrap_err();
    assert!(err.to_string().contains("500"), "{err}");
    Ok(())
}

#[tokio::test]
async fn int64_values_cross_the_wire_exactly() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/models/ids"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "ids",
            "inputs": [{"name": "IDS", "datatype": "INT64", "shape": [-1]}],
            "outputs": [{"name": "NEXT", "datatype": "INT64", "shape": [-1]}],
        })))
        .mount(&server)
        .await;
    let big = (1i64 << 53) + 1;
    Mock::given(method("POST"))
        .and(path("/v2/models/ids/infer"))
        .and(body_partial_json(json!({
            "inputs": [{"name": "IDS", "datatype": "INT64", "shape": [2], "data": [big, -1]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputs": [{"name": "NEXT", "datatype": "INT64", "shape": [2], "data": [big + 1, i64::MAX]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let model = backend.load("ids", &urls(&[&server])).await?;
    let mut inputs = TensorMap::new();
    inputs.insert("IDS".to_string(), Tensor::from_i64(Shape::from_slice(&[2]), &[big, -1])?);
    let outputs = model.infer(inputs).await?;
    assert_eq!(outputs["NEXT"].to_i64()?, vec![big + 1, i64::MAX]);
    Ok(())
}

#[tokio::test]
async fn malformed_output_is_an_error() -> Result<()> {
    let server = MockServer::start().await;
    serve_metadata(&server, &[-1, 3], 0).await;
    Mock::given(method("POST"))
        .and(path("/v2/models/doubler/infer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputs": [{"name": "OUTPUT", "datatype": "FP32", "shape": [4294967296u64, 4294967296u64], "data": []}]
        })))
        .mount(&server)
        .await;

    let backend = RemoteBackend::new(Duration::from_secs(5))?;
    let model = backend.load("doubler", &urls(&[&server])).await?;
    let mut inputs = TensorMap::new();
    inputs.insert(
        "INPUT".to_string(),
        Tensor::from_f32(Shape::from_slice(&[1, 3]), &[0.0; 3])?,
    );
    let err = model.infer(inputs).await.unwrap_err();
    assert!(format!("{err:#}").contains("invalid shape"), "{err:#}");
    Ok(())
}
