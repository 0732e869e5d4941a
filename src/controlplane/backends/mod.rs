//! Array Backend Adapters
//!
//! Provides implementations of the [`ArrayClient`](crate::domain::ports::ArrayClient) port:
//! - REST: the array's HTTP management API
//! - Memory: an in-process array speaking the same fault codes

pub mod memory;
pub mod rest;

pub use memory::*;
pub use rest::*;

use crate::domain::ports::ArrayClientRef;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for creating array backends
pub struct BackendFactory;

impl BackendFactory {
    /// Create an array backend by name
    pub fn create(name: &str, config: BackendConfig) -> Result<ArrayClientRef> {
        match name.to_lowercase().as_str() {
            "rest" | "http" => Ok(Arc::new(RestArrayClient::new(config.rest)?)),
            "memory" | "standalone" => Ok(Arc::new(InMemoryArray::new())),
            _ => Err(Error::Configuration(format!("unknown array backend: {}", name))),
        }
    }
}

/// Combined backend configuration
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub rest: RestArrayConfig,
}
