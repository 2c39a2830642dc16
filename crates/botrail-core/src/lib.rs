pub mod config;
pub mod error;
pub mod types;

pub use config::{CompileConfig, EngineConfig, RuntimeConfig, StoreConfig};
pub use error::{EngineError, Result, StepError, ValidationError};
pub use serde_json::Value;
pub use types::TypeTag;
