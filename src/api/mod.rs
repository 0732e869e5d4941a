//! Transport adapter: the plugin RPC contract over HTTP

pub mod metrics;
pub mod rest;
pub mod server;

pub use metrics::*;
pub use rest::*;
pub use server::*;
