mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use trytune_core::{PipelineSpec, Shape, StageSpec, TensorBinding, TensorPayload};
use trytune_runtime::{DispatchError, Engine, EngineConfig, ExecutorConfig, RuntimeError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{add_identity, add_remote, engine, f32_tensor, infer_reply, serve_metadata, tensors};

fn bind(tensor: &str) -> TensorBinding {
    TensorBinding::new(tensor)
}

fn identity_stage(name: &str, module: &str, from: &str, to: &str) -> StageSpec {
    StageSpec::new(name, module).input("x", bind(from)).output("y", bind(to))
}

fn remote_stage(name: &str, from: &str, to: &str) -> StageSpec {
    StageSpec::new(name, "doubler")
        .input("INPUT", bind(from))
        .output("OUTPUT", bind(to))
}

fn chain() -> PipelineSpec {
    PipelineSpec::new("chain")
        .input("x")
        .output("z")
        .stage(identity_stage("a", "id", "x", "y"))
        .stage(identity_stage("b", "id", "y", "z"))
}

async fn chain_engine() -> Result<Engine> {
    let engine = engine()?;
    add_identity(&engine, "id", &[-1, 3], 0).await?;
    engine.add_pipeline(chain())?;
    Ok(engine)
}

#[tokio::test]
async fn chain_returns_exactly_declared_outputs() -> Result<()> {
    let engine = chain_engine().await?;
    let x = f32_tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;

    let outputs = engine.run_pipeline("chain", tensors(vec![("x", x.clone())])).await?;
    assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["z"]);
    assert_eq!(outputs["z"], x);
    Ok(())
}

#[tokio::test]
async fn repeated_runs_are_deterministic() -> Result<()> {
    let engine = chain_engine().await?;
    let x = f32_tensor(&[1, 3], &[0.5, -1.5, 2.0])?;

    let first = engine.run_pipeline("chain", tensors(vec![("x", x.clone())])).await?;
    for _ in 0..5 {
        let again = engine.run_pipeline("chain", tensors(vec![("x", x.clone())])).await?;
        assert_eq!(again, first);
    }
    Ok(())
}

#[tokio::test]
async fn decodes_payloads_against_input_contracts() -> Result<()> {
    let engine = chain_engine().await?;

    // No explicit shape: [-1, 3] with six elements resolves to [2, 3].
    let mut payloads = BTreeMap::new();
    payloads.insert("x".to_string(), TensorPayload::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    let outputs = engine.infer_pipeline("chain", payloads).await?;
    assert_eq!(outputs["z"].shape(), &Shape::from_slice(&[2, 3]));

    let mut payloads = BTreeMap::new();
    payloads.insert(
        "x".to_string(),
        TensorPayload::new(vec![1.0, 2.0, 3.0]).with_shape(vec![2, 3]),
    );
    let err = engine.infer_pipeline("chain", payloads).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Tensor { ref tensor, .. } if tensor == "x"));

    let mut payloads = BTreeMap::new();
    payloads.insert("w".to_string(), TensorPayload::new(vec![1.0]));
    let err = engine.infer_pipeline("chain", payloads).await.unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownInput(ref name) if name == "w"));
    Ok(())
}

#[tokio::test]
async fn rejects_missing_and_undeclared_inputs() -> Result<()> {
    let engine = chain_engine().await?;
    let x = f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])?;

    let err = engine.run_pipeline("chain", tensors(vec![])).await.unwrap_err();
    assert!(matches!(err, RuntimeError::MissingInput(ref name) if name == "x"));

    let err = engine
        .run_pipeline("chain", tensors(vec![("x", x.clone()), ("extra", x)]))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownInput(ref name) if name == "extra"));

    let err = engine.run_pipeline("nope", tensors(vec![])).await.unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound { kind: "pipeline", .. }));
    Ok(())
}

#[tokio::test]
async fn contract_violation_names_the_stage() -> Result<()> {
    let engine = chain_engine().await?;
    let x = f32_tensor(&[1, 4], &[1.0, 2.0, 3.0, 4.0])?;

    let err = engine.run_pipeline("chain", tensors(vec![("x", x)])).await.unwrap_err();
    let RuntimeError::Stage { ref stage, .. } = err else {
        panic!("expected a stage failure, got {err:?}");
    };
    assert_eq!(stage, "a");
    assert!(matches!(err.root(), RuntimeError::Validation { target, .. } if target == "id"));
    Ok(())
}

#[tokio::test]
async fn reshapes_on_binding() -> Result<()> {
    let engine = engine()?;
    add_identity(&engine, "grid", &[2, 3], 0).await?;
    engine.add_pipeline(
        PipelineSpec::new("flatten").input("x").output("z").stage(
            StageSpec::new("g", "grid")
                .input("x", bind("x").reshaped(vec![2, 3]))
                .output("y", bind("z").reshaped(vec![-1])),
        ),
    )?;

    let mut payloads = BTreeMap::new();
    payloads.insert("x".to_string(), TensorPayload::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    let outputs = engine.infer_pipeline("flatten", payloads).await?;
    let z = outputs.get("z").context("missing z")?;
    assert_eq!(z.shape(), &Shape::from_slice(&[6]));
    assert_eq!(z.to_f32()?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    Ok(())
}

#[tokio::test]
async fn shared_stage_fires_once_for_fan_out() -> Result<()> {
    let server = MockServer::start().await;
    serve_metadata(&server, "doubler", &[-1, 3], &[-1, 3], 0).await;
    Mock::given(method("POST"))
        .and(path("/v2/models/doubler/infer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(infer_reply(&[1, 3], &[2.0, 4.0, 6.0])))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine()?;
    add_identity(&engine, "id", &[-1, 3], 0).await?;
    add_remote(&engine, "doubler", &[&server]).await?;
    engine.add_pipeline(
        PipelineSpec::new("fan")
            .input("x")
            .output("left")
            .output("right")
            .stage(remote_stage("double", "x", "d"))
            .stage(identity_stage("l", "id", "d", "left"))
            .stage(identity_stage("r", "id", "d", "right")),
    )?;

    let x = f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])?;
    let outputs = engine.run_pipeline("fan", tensors(vec![("x", x)])).await?;
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs["left"].to_f32()?, vec![2.0, 4.0, 6.0]);
    assert_eq!(outputs["left"], outputs["right"]);
    Ok(())
}

#[tokio::test]
async fn failing_branch_fails_the_whole_run() -> Result<()> {
    let server = MockServer::start().await;
    serve_metadata(&server, "doubler", &[-1, 3], &[-1, 3], 0).await;
    Mock::given(method("POST"))
        .and(path("/v2/models/doubler/infer"))
        .respond_with(ResponseTemplate::new(500).set_body_string("out of memory"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine()?;
    add_identity(&engine, "id", &[-1, 3], 0).await?;
    add_remote(&engine, "doubler", &[&server]).await?;
    engine.add_pipeline(
        PipelineSpec::new("split")
            .input("x")
            .output("kept")
            .output("doubled")
            .stage(identity_stage("good", "id", "x", "kept"))
            .stage(remote_stage("bad", "x", "doubled")),
    )?;

    let x = f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])?;
    let err = engine.run_pipeline("split", tensors(vec![("x", x)])).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Stage { ref stage, .. } if stage == "bad"));
    assert!(matches!(
        err.root(),
        RuntimeError::Dispatch(DispatchError::Backend { module, .. }) if module == "doubler"
    ));
    Ok(())
}

#[tokio::test]
async fn abort_skips_queued_sibling_calls() -> Result<()> {
    let server = MockServer::start().await;
    serve_metadata(&server, "slow", &[-1, 3], &[-1, 3], 0).await;
    serve_metadata(&server, "broken", &[-1, 3], &[-1, 3], 0).await;
    // Only the call already at the backend gets through; its queued sibling
    // belongs to an aborted run.
    Mock::given(method("POST"))
        .and(path("/v2/models/slow/infer"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(infer_reply(&[1, 3], &[0.0, 0.0, 0.0]))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/models/broken/infer"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string("boom")
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine()?;
    add_remote(&engine, "slow", &[&server]).await?;
    add_remote(&engine, "broken", &[&server]).await?;
    let stage = |name: &str, module: &str, to: &str| {
        StageSpec::new(name, module)
            .input("INPUT", bind("x"))
            .output("OUTPUT", bind(to))
    };
    engine.add_pipeline(
        PipelineSpec::new("race")
            .input("x")
            .output("a")
            .output("b")
            .output("c")
            .stage(stage("first", "slow", "a"))
            .stage(stage("second", "slow", "b"))
            .stage(stage("fails", "broken", "c")),
    )?;

    let x = f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])?;
    let err = engine.run_pipeline("race", tensors(vec![("x", x)])).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Stage { ref stage, .. } if stage == "fails"));

    // Give the FIFO worker time to reach the second request.
    tokio::time::sleep(Duration::from_millis(600)).await;
    Ok(())
}

#[tokio::test]
async fn runs_against_registration_snapshot() -> Result<()> {
    let engine = chain_engine().await?;
    assert_eq!(engine.clear_modules(), 1);

    let x = f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])?;
    let outputs = engine.run_pipeline("chain", tensors(vec![("x", x.clone())])).await?;
    assert_eq!(outputs["z"], x);

    let mut payloads = BTreeMap::new();
    payloads.insert("x".to_string(), TensorPayload::new(vec![1.0, 2.0, 3.0]));
    let err = engine.infer_module("id", payloads).await.unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound { kind: "module", .. }));
    Ok(())
}

async fn slow_engine(executor: ExecutorConfig, server: &MockServer) -> Result<Engine> {
    serve_metadata(server, "doubler", &[-1, 3], &[-1, 3], 0).await;
    Mock::given(method("POST"))
        .and(path("/v2/models/doubler/infer"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(infer_reply(&[1, 3], &[0.0, 0.0, 0.0]))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(server)
        .await;

    let engine = Engine::init(EngineConfig {
        executor,
        ..EngineConfig::default()
    })?;
    add_remote(&engine, "doubler", &[server]).await?;
    engine.add_pipeline(
        PipelineSpec::new("slow")
            .input("x")
            .output("y")
            .stage(remote_stage("double", "x", "y")),
    )?;
    Ok(engine)
}

#[tokio::test]
async fn stage_timeout_aborts_the_run() -> Result<()> {
    let server = MockServer::start().await;
    let engine = slow_engine(
        ExecutorConfig {
            stage_timeout: Some(Duration::from_millis(50)),
            run_timeout: None,
        },
        &server,
    )
    .await?;

    let x = f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])?;
    let err = engine.run_pipeline("slow", tensors(vec![("x", x)])).await.unwrap_err();
    assert!(matches!(
        err.root(),
        RuntimeError::Dispatch(DispatchError::Timeout { module, .. }) if module == "doubler"
    ));
    Ok(())
}

#[tokio::test]
async fn run_timeout_aborts_the_run() -> Result<()> {
    let server = MockServer::start().await;
    let engine = slow_engine(
        ExecutorConfig {
            stage_timeout: None,
            run_timeout: Some(Duration::from_millis(50)),
        },
        &server,
    )
    .await?;

    let x = f32_tensor(&[1, 3], &[1.0, 2.0, 3.0])?;
    let err = engine.run_pipeline("slow", tensors(vec![("x", x)])).await.unwrap_err();
    assert!(matches!(err, RuntimeError::RunTimeout { ref pipeline, .. } if pipeline == "slow"));
    Ok(())
}
