//! Control Plane Module
//!
//! Allocates array-side resources: volumes, LUNs, host mappings and
//! snapshots. All mutating operations share one array session guarded by the
//! [`MutationSerializer`].

pub mod backends;
pub mod controller;
pub mod lun;
pub mod session;
pub mod snapshots;
pub mod volumes;

pub use backends::*;
pub use controller::*;
pub use lun::*;
pub use session::*;
pub use snapshots::*;
pub use volumes::*;
