mod cli;
mod grpc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing_subscriber::EnvFilter;
use trytune_proto::trytune::v1::module_service_server::ModuleServiceServer;
use trytune_proto::trytune::v1::pipeline_service_server::PipelineServiceServer;
use trytune_proto::trytune::v1::scheduler_service_server::SchedulerServiceServer;
use trytune_runtime::{Engine, EngineConfig, ExecutorConfig};

use grpc::{ModuleSvc, PipelineSvc, SchedulerSvc};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            grpc_addr,
            log,
            scheduler,
            scheduler_config,
            stage_timeout_ms,
            run_timeout_ms,
            remote_timeout_ms,
        } => {
            let scheduler_config = serde_json::from_str(&scheduler_config)
                .context("--scheduler-config is not valid JSON")?;
            let config = EngineConfig {
                scheduler,
                scheduler_config,
                executor: ExecutorConfig {
                    stage_timeout: stage_timeout_ms.map(Duration::from_millis),
                    run_timeout: run_timeout_ms.map(Duration::from_millis),
                },
                remote_timeout: Duration::from_millis(remote_timeout_ms),
            };
            serve(grpc_addr, log, config).await
        }
    }
}

async fn serve(grpc_addr: String, log: String, config: EngineConfig) -> Result<()> {
    std::env::set_var("RUST_LOG", &log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let engine = Arc::new(Engine::init(config)?);

    let addr = grpc_addr
        .parse()
        .with_context(|| format!("invalid --grpc-addr {grpc_addr}"))?;

    tracing::info!(%addr, scheduler = engine.scheduler_name(), "trytuned gRPC listening");
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(trytune_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| anyhow::anyhow!("reflection build failed: {e}"))?;

    tonic::transport::Server::builder()
        .add_service(ModuleServiceServer::new(ModuleSvc::new(Arc::clone(&engine))))
        .add_service(PipelineServiceServer::new(PipelineSvc::new(Arc::clone(&engine))))
        .add_service(SchedulerServiceServer::new(SchedulerSvc::new(engine)))
        .add_service(reflection)
        .serve(addr)
        .await?;

    Ok(())
}
