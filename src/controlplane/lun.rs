//! LUN Allocation
//!
//! First-fit search for the lowest free LUN given the live host mappings. LUN
//! slots are never persisted; they are recomputed from the array on every
//! publish.

use crate::domain::ports::HostMapping;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Upper bound (exclusive) for allocated LUNs
pub const MAXIMUM_LUN: u32 = 255;

/// Which mappings the allocator must avoid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LunScope {
    /// LUNs are unique per initiator
    #[default]
    PerInitiator,
    /// LUNs are unique across every host on the array
    Array,
}

impl std::str::FromStr for LunScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "per-initiator" | "initiator" | "host" => Ok(LunScope::PerInitiator),
            "array" | "global" => Ok(LunScope::Array),
            other => Err(Error::Configuration(format!("unknown LUN scope: {}", other))),
        }
    }
}

/// Return the lowest free LUN in `[1, MAXIMUM_LUN)` for the given mappings
pub fn next_available_lun(mappings: &[HostMapping]) -> Result<u32> {
    let mut luns: Vec<u32> = mappings.iter().map(|m| m.lun).collect();
    luns.sort_unstable();

    trace!("checking if LUN 1 is not already in use");
    match luns.first() {
        None => return Ok(1),
        Some(&first) if first > 1 => return Ok(1),
        _ => {}
    }

    trace!("searching for an available LUN between LUNs in use");
    for pair in luns.windows(2) {
        if pair[1] - pair[0] > 1 {
            return Ok(pair[0] + 1);
        }
    }

    trace!("checking if next LUN is not above maximum LUNs limit");
    let last = luns[luns.len() - 1];
    if last + 1 < MAXIMUM_LUN {
        return Ok(last + 1);
    }

    Err(Error::LunExhausted)
}
