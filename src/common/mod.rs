pub mod error;
pub mod fs;

pub use error::{AgentError, ErrorKind, Result};
