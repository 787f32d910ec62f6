pub mod config;
pub mod error;
pub mod types;

pub use config::{DmScope, StoreConfig};
pub use error::{Result, StoreError};
pub use types::{meta_keys, new_id, AgentId, Metadata, Value};
