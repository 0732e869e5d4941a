//! Node identity and readiness
//!
//! A node is identified by its iSCSI initiator name. It is ready once the
//! kernel exposes the iSCSI transport and device-mapper multipath, and, when
//! running sandboxed, once the host tools the agent shells out to are present.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Key of the initiator name in the open-iscsi configuration file
pub const INITIATOR_NAME_KEY: &str = "InitiatorName";

/// Read the local initiator name from an `initiatorname.iscsi` file
pub async fn read_initiator_name(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|e| Error::InitiatorName {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    parse_initiator_name(&contents).ok_or_else(|| Error::InitiatorName {
        path: path.display().to_string(),
        reason: format!("{} key is missing", INITIATOR_NAME_KEY),
    })
}

fn parse_initiator_name(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == INITIATOR_NAME_KEY)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// =============================================================================
// Readiness Probe
// =============================================================================

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Where loaded kernel modules show up (`/sys/module`)
    pub sys_module_dir: PathBuf,
    pub required_modules: Vec<String>,
    pub required_binaries: Vec<String>,
    /// Only check binaries when running with a sandboxed host view
    pub check_binaries: bool,
    /// Directories searched for binaries
    pub search_path: Vec<PathBuf>,
}

impl ReadinessProbe {
    /// Fail with the first missing kernel module or binary
    pub async fn check(&self) -> Result<()> {
        for module in &self.required_modules {
            let path = self.sys_module_dir.join(module);
            if fs::metadata(&path).await.is_err() {
                warn!(module = %module, "required kernel module is not loaded");
                return Err(Error::NodeNotReady(format!(
                    "kernel module {} is not loaded",
                    module
                )));
            }
        }

        if self.check_binaries {
            for binary in &self.required_binaries {
                if !self.has_binary(binary).await {
                    warn!(binary = %binary, "required binary not found");
                    return Err(Error::NodeNotReady(format!(
                        "binary {} not found in {:?}",
                        binary, self.search_path
                    )));
                }
            }
        }

        debug!("node is ready");
        Ok(())
    }

    async fn has_binary(&self, binary: &str) -> bool {
        for dir in &self.search_path {
            if let Ok(metadata) = fs::metadata(dir.join(binary)).await {
                if metadata.is_file() {
                    return true;
                }
            }
        }
        false
    }
}

/// Directories listed in `$PATH`
pub fn system_search_path() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_else(|| {
            ["/usr/local/sbin", "/usr/local/bin", "/usr/sbin", "/usr/bin", "/sbin", "/bin"]
                .iter()
                .map(PathBuf::from)
                .collect()
        })
}
