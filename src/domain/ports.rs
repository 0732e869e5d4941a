//! Domain Ports - Core trait definitions for the driver
//!
//! These traits define the boundaries between the orchestration logic and the
//! systems it drives: the storage array's management API on the control plane,
//! and the iSCSI initiator and filesystem tools on the node.

use crate::domain::fault::ArrayOutcome;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Access Modes
// =============================================================================

/// Volume access modes defined by the orchestration protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::SingleNodeWriter => write!(f, "SINGLE_NODE_WRITER"),
            AccessMode::SingleNodeReaderOnly => write!(f, "SINGLE_NODE_READER_ONLY"),
            AccessMode::MultiNodeReaderOnly => write!(f, "MULTI_NODE_READER_ONLY"),
            AccessMode::MultiNodeSingleWriter => write!(f, "MULTI_NODE_SINGLE_WRITER"),
            AccessMode::MultiNodeMultiWriter => write!(f, "MULTI_NODE_MULTI_WRITER"),
        }
    }
}

/// Requested volume capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Access mode
    pub access_mode: AccessMode,
    /// Filesystem type requested by a mount capability
    #[serde(default)]
    pub fs_type: Option<String>,
    /// Extra mount flags
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

impl VolumeCapability {
    /// The only capability this driver accepts
    pub fn single_node_writer() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            fs_type: None,
            mount_flags: Vec::new(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.access_mode == AccessMode::SingleNodeWriter
    }
}

// =============================================================================
// Array Objects
// =============================================================================

/// Credentials and address of the array management API
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayCredentials {
    pub address: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ArrayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayCredentials")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Volume as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayVolume {
    pub name: String,
    pub size_bytes: u64,
    pub pool: String,
}

/// Binding of a volume to an initiator at a LUN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMapping {
    pub lun: u32,
    pub volume: String,
    pub initiator: String,
}

/// Snapshot as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySnapshot {
    pub name: String,
    pub source_volume: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Array Client Port
// =============================================================================

/// Port for the storage array's management API
///
/// `Err` is reserved for transport and protocol failures; anything the array
/// itself answered comes back as an [`ArrayOutcome`].
#[async_trait]
pub trait ArrayClient: Send + Sync {
    /// Authenticate against the array, replacing any previous session
    async fn login(&self, credentials: &ArrayCredentials) -> Result<()>;

    /// Drop pooled idle connections to the array
    fn close_idle_connections(&self);

    async fn create_volume(&self, name: &str, size_bytes: u64, pool: &str)
        -> Result<ArrayOutcome<()>>;

    async fn copy_volume(&self, source: &str, name: &str, pool: &str) -> Result<ArrayOutcome<()>>;

    async fn delete_volume(&self, name: &str) -> Result<ArrayOutcome<()>>;

    /// Grow a volume by `delta_bytes`
    async fn expand_volume(&self, name: &str, delta_bytes: u64) -> Result<ArrayOutcome<()>>;

    /// List volumes, optionally filtered by name
    async fn show_volumes(&self, name: Option<&str>) -> Result<ArrayOutcome<Vec<ArrayVolume>>>;

    /// Initiators a volume is currently mapped to
    async fn show_volume_maps(&self, volume: &str) -> Result<ArrayOutcome<Vec<String>>>;

    async fn map_volume(
        &self,
        volume: &str,
        initiator: &str,
        mode: &str,
        lun: u32,
    ) -> Result<ArrayOutcome<()>>;

    async fn unmap_volume(&self, volume: &str, initiator: &str) -> Result<ArrayOutcome<()>>;

    /// Host mappings, for one initiator or for the whole array
    async fn show_host_maps(&self, initiator: Option<&str>)
        -> Result<ArrayOutcome<Vec<HostMapping>>>;

    async fn create_host(&self, nickname: &str, initiator: &str) -> Result<ArrayOutcome<()>>;

    async fn create_snapshot(&self, source: &str, name: &str) -> Result<ArrayOutcome<()>>;

    async fn delete_snapshot(&self, name: &str) -> Result<ArrayOutcome<()>>;

    /// List snapshots, optionally filtered by name
    async fn show_snapshots(&self, name: Option<&str>)
        -> Result<ArrayOutcome<Vec<ArraySnapshot>>>;
}

// =============================================================================
// Node Ports
// =============================================================================

/// One iSCSI path to a target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IscsiTarget {
    pub iqn: String,
    /// Portal as `host:port`
    pub portal: String,
}

/// Block device produced by an iSCSI attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDevice {
    /// Device the filesystem lives on (multipath map or single path)
    pub device_path: String,
    /// Per-session devices backing `device_path`
    pub path_devices: Vec<String>,
}

impl AttachedDevice {
    /// Multipath maps show up as device-mapper nodes
    pub fn is_multipath(&self) -> bool {
        is_multipath_device(&self.device_path)
    }
}

/// Whether a device path names a device-mapper (multipath) node
pub fn is_multipath_device(device_path: &str) -> bool {
    device_path.starts_with("/dev/dm-") || device_path.starts_with("/dev/mapper/")
}

/// Port for the node's iSCSI initiator
#[async_trait]
pub trait IscsiConnector: Send + Sync {
    /// Log into every target and return the resulting block device
    async fn connect(&self, targets: &[IscsiTarget], lun: u32) -> Result<AttachedDevice>;

    /// Remove the block devices and close the sessions that served them
    async fn disconnect(
        &self,
        targets: &[IscsiTarget],
        lun: u32,
        device: &AttachedDevice,
    ) -> Result<()>;

    /// Ask the kernel to re-read the size of one path device
    async fn rescan(&self, path_device: &str) -> Result<()>;

    /// Propagate a path size change to a multipath map
    async fn resize_multipath(&self, device_path: &str) -> Result<()>;
}

/// Port for local filesystem tooling
#[async_trait]
pub trait FilesystemTools: Send + Sync {
    /// Filesystem type on a device, `None` if unformatted
    async fn detect(&self, device: &str) -> Result<Option<String>>;

    async fn format(&self, device: &str, fs_type: &str) -> Result<()>;

    /// Consistency check; corruption surfaces as `Error::FilesystemCorrupted`
    async fn check(&self, device: &str, fs_type: &str) -> Result<()>;

    async fn mount(&self, device: &str, target: &Path, fs_type: &str, flags: &[String])
        -> Result<()>;

    /// Unmount; returns `false` if the target was not a mount point
    async fn unmount(&self, target: &Path) -> Result<bool>;

    /// Current mount points of a device
    async fn mount_points(&self, device: &str) -> Result<Vec<String>>;

    /// Whether the device node still exists
    async fn device_exists(&self, device: &str) -> Result<bool>;

    /// Grow the filesystem to fill its device
    async fn resize(&self, device: &str, fs_type: &str, mount_point: Option<&Path>) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ArrayClientRef = Arc<dyn ArrayClient>;
pub type IscsiConnectorRef = Arc<dyn IscsiConnector>;
pub type FilesystemToolsRef = Arc<dyn FilesystemTools>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_display() {
        assert_eq!(format!("{}", AccessMode::SingleNodeWriter), "SINGLE_NODE_WRITER");
        assert_eq!(
            format!("{}", AccessMode::MultiNodeMultiWriter),
            "MULTI_NODE_MULTI_WRITER"
        );
    }

    #[test]
    fn test_multipath_detection() {
        assert!(is_multipath_device("/dev/dm-3"));
        assert!(is_multipath_device("/dev/mapper/3600c0ff000"));
        assert!(!is_multipath_device("/dev/sdb"));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = ArrayCredentials {
            address: "https://array.local".into(),
            username: "manage".into(),
            password: "s3cret".into(),
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("manage"));
    }
}
