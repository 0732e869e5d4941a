//! Per-operation request and response types
//!
//! One struct per protocol method. The transport adapter deserializes straight
//! into these, so the orchestrators never have to probe a request for optional
//! secrets, parameters or capabilities.

use crate::domain::ports::{ArrayCredentials, VolumeCapability};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Well-known Keys
// =============================================================================

pub const FS_TYPE_KEY: &str = "fsType";
pub const POOL_KEY: &str = "pool";
pub const TARGET_IQN_KEY: &str = "iqn";
pub const PORTALS_KEY: &str = "portals";
pub const API_ADDRESS_KEY: &str = "apiAddress";
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const LUN_KEY: &str = "lun";

/// Storage-class parameters every provisioned volume needs
pub const REQUIRED_PARAMETERS: [&str; 4] = [FS_TYPE_KEY, POOL_KEY, TARGET_IQN_KEY, PORTALS_KEY];

pub type Secrets = BTreeMap<String, String>;

/// Extract array credentials from a request's secrets
pub fn credentials_from_secrets(secrets: &Secrets) -> Result<ArrayCredentials> {
    if secrets.is_empty() {
        return Err(Error::MissingCredentials);
    }

    let field = |key: &str| secrets.get(key).map(String::as_str).unwrap_or_default();
    let (address, username, password) = (
        field(API_ADDRESS_KEY),
        field(USERNAME_KEY),
        field(PASSWORD_KEY),
    );

    if address.is_empty() || username.is_empty() || password.is_empty() {
        return Err(Error::InvalidArgument(
            "at least one field is missing in credentials secret".into(),
        ));
    }

    Ok(ArrayCredentials {
        address: address.to_string(),
        username: username.to_string(),
        password: password.to_string(),
    })
}

// =============================================================================
// Shared Types
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: u64,
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    /// Size to provision: the required size, falling back to the limit
    pub fn requested_bytes(&self) -> u64 {
        if self.required_bytes == 0 {
            self.limit_bytes
        } else {
            self.required_bytes
        }
    }
}

/// Pre-populate a new volume from an existing object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeContentSource {
    Volume { volume_id: String },
    Snapshot { snapshot_id: String },
}

impl VolumeContentSource {
    pub fn source_id(&self) -> &str {
        match self {
            VolumeContentSource::Volume { volume_id } => volume_id,
            VolumeContentSource::Snapshot { snapshot_id } => snapshot_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: u64,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
}

// =============================================================================
// Controller Requests
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub volume_content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerPublishVolumeResponse {
    pub publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedCapabilities {
    pub volume_capabilities: Vec<VolumeCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    pub confirmed: Option<ConfirmedCapabilities>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub source_volume_id: Option<String>,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<Snapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    CreateDeleteSnapshot,
    ListSnapshots,
    CloneVolume,
    ExpandVolume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<ControllerCapability>,
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPluginInfoResponse {
    pub name: String,
    pub vendor_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    ControllerService,
    OnlineVolumeExpansion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<PluginCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}

// =============================================================================
// Node Requests
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_path: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    ExpandVolume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeCapability>,
}
