use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "trytuned", version, about = "trytune inference pipeline daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gRPC server
    Serve {
        /// Bind address for gRPC
        #[arg(long, default_value = "0.0.0.0:50051")]
        grpc_addr: String,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,

        /// Scheduling policy active at startup (fifo or dynamic_batching)
        #[arg(long, default_value = "fifo")]
        scheduler: String,

        /// JSON config for the startup scheduling policy
        #[arg(long, default_value = "{}")]
        scheduler_config: String,

        /// Per-stage timeout for pipeline runs, in milliseconds
        #[arg(long, env = "TRYTUNE_STAGE_TIMEOUT_MS")]
        stage_timeout_ms: Option<u64>,

        /// Whole-run timeout for pipeline runs, in milliseconds
        #[arg(long, env = "TRYTUNE_RUN_TIMEOUT_MS")]
        run_timeout_ms: Option<u64>,

        /// HTTP timeout for remote module calls, in milliseconds
        #[arg(long, default_value_t = 30_000)]
        remote_timeout_ms: u64,
    },
}
