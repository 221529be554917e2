pub mod backend;
pub mod error;
pub mod pipeline;
pub mod spec;
pub mod tensor;
pub mod validate;

pub use backend::*;
pub use error::*;
pub use pipeline::*;
pub use spec::*;
pub use tensor::*;
pub use validate::*;
