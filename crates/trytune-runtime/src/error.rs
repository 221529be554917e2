use std::time::Duration;

use trytune_core::{DType, TensorError, ValidationError};

/// A module or pipeline was rejected at registration. Nothing is stored.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("module {module} could not be loaded")]
    Backend {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage name {0} is used more than once")]
    DuplicateStage(String),

    #[error("stage {stage} references unknown module {module}")]
    UnknownModule { stage: String, module: String },

    #[error("stage {stage} leaves {direction} port {port} of module {module} unbound")]
    UnboundPort {
        stage: String,
        module: String,
        port: String,
        direction: &'static str,
    },

    #[error("stage {stage} binds {direction} port {port}, which module {module} does not declare")]
    UnknownPort {
        stage: String,
        module: String,
        port: String,
        direction: &'static str,
    },

    #[error("binding of {tensor} in stage {stage} has invalid reshape {shape:?}")]
    InvalidReshape {
        stage: String,
        tensor: String,
        shape: Vec<i64>,
    },

    #[error("tensor {tensor} is produced by both {first} and {second}")]
    DuplicateProducer {
        tensor: String,
        first: String,
        second: String,
    },

    #[error("declared input {tensor} is produced by stage {stage}")]
    ProducedInput { tensor: String, stage: String },

    #[error("declared output {0} is not produced by any stage")]
    UnproducedOutput(String),

    #[error("declared input {0} is not consumed by any stage")]
    UnusedInput(String),

    #[error("declared input {tensor} is consumed both as {first} and as {second}")]
    ConflictingInput {
        tensor: String,
        first: DType,
        second: DType,
    },

    #[error("stage {stage} consumes {tensor}, which is neither a declared input nor produced by any stage")]
    Unreachable { stage: String, tensor: String },

    #[error("stage dependency cycle: {0}")]
    Cycle(String),
}

/// A call made it past input validation but did not produce valid outputs.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("module {module} failed")]
    Backend {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module {module} returned invalid output")]
    InvalidOutput {
        module: String,
        #[source]
        source: ValidationError,
    },

    #[error("scheduler queue for module {module} is closed")]
    QueueClosed { module: String },

    #[error("module {module} did not answer within {after:?}")]
    Timeout { module: String, after: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown scheduling policy {0}")]
    UnknownPolicy(String),

    #[error("invalid config for scheduling policy {policy}")]
    Config {
        policy: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid input for {target}")]
    Validation {
        target: String,
        #[source]
        source: ValidationError,
    },

    #[error("invalid tensor {tensor}")]
    Tensor {
        tensor: String,
        #[source]
        source: TensorError,
    },

    #[error("{0} is not a declared input")]
    UnknownInput(String),

    #[error("missing input {0}")]
    MissingInput(String),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("tensor {0} was produced twice in one run")]
    DuplicateTensor(String),

    #[error("stage {stage} failed")]
    Stage {
        stage: String,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("stage {stage} task ended without reporting: {reason}")]
    TaskAborted { stage: String, reason: String },

    #[error("pipeline {0} stalled with stages still pending")]
    Stalled(String),

    #[error("pipeline {pipeline} did not finish within {after:?}")]
    RunTimeout { pipeline: String, after: Duration },
}

impl RuntimeError {
    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    /// Innermost error once stage context wrappers are peeled off.
    pub fn root(&self) -> &RuntimeError {
        match self {
            RuntimeError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}
