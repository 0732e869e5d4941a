//! Domain layer - Core types and port definitions
//!
//! This module defines the traits (ports) that adapters implement, the decoded
//! array fault model, and the per-operation request types.

pub mod fault;
pub mod ports;
pub mod request;

pub use fault::*;
pub use ports::*;
pub use request::*;
