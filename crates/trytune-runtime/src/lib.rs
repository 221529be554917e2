pub mod batcher;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod module;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod worker;

pub use batcher::*;
pub use dispatcher::*;
pub use engine::*;
pub use error::*;
pub use executor::*;
pub use module::*;
pub use pipeline::*;
pub use registry::*;
pub use request::*;
pub use scheduler::*;
pub use worker::*;
