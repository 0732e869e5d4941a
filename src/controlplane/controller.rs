//! Controller Service
//!
//! Entry point for every control-plane method. Runs the preflight checks that
//! apply to whole classes of requests (storage-class parameters, capabilities,
//! credentials), then hands off to the volume and snapshot orchestrators.
//! Identity and capability methods never touch the array session.

use crate::controlplane::lun::LunScope;
use crate::controlplane::session::MutationSerializer;
use crate::controlplane::snapshots::SnapshotOrchestrator;
use crate::controlplane::volumes::{VolumeOrchestrator, VOLUME_NAME_MAX_LENGTH};
use crate::domain::ports::{ArrayClientRef, VolumeCapability};
use crate::domain::request::*;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default plugin name advertised to the orchestrator
pub const DEFAULT_PLUGIN_NAME: &str = "blockarray.csi.storage.io";

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the controller service
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name reported by GetPluginInfo
    pub plugin_name: String,
    /// Which mappings the LUN allocator avoids
    pub lun_scope: LunScope,
    /// Longest volume name the array accepts
    pub volume_name_max_len: usize,
    /// Access mode used when mapping volumes
    pub default_map_mode: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_string(),
            lun_scope: LunScope::default(),
            volume_name_max_len: VOLUME_NAME_MAX_LENGTH,
            default_map_mode: "rw".to_string(),
        }
    }
}

// =============================================================================
// Preflight Checks
// =============================================================================

/// Every storage-class parameter a volume needs must be present
pub fn check_parameters(parameters: &BTreeMap<String, String>) -> Result<()> {
    for key in REQUIRED_PARAMETERS {
        if !parameters.contains_key(key) {
            return Err(Error::MissingParameter { key: key.into() });
        }
    }
    Ok(())
}

/// Capabilities must be present and all single-node writer
pub fn check_capabilities(capabilities: &[VolumeCapability]) -> Result<()> {
    if capabilities.is_empty() {
        return Err(Error::InvalidArgument("missing volume capabilities".into()));
    }
    match capabilities.iter().find(|c| !c.is_supported()) {
        Some(unsupported) => Err(Error::UnsupportedAccessMode {
            mode: unsupported.access_mode.to_string(),
        }),
        None => Ok(()),
    }
}

// =============================================================================
// Controller Service
// =============================================================================

pub struct ControllerService {
    config: ControllerConfig,
    volumes: VolumeOrchestrator,
    snapshots: SnapshotOrchestrator,
}

impl ControllerService {
    pub fn new(config: ControllerConfig, client: ArrayClientRef) -> Arc<Self> {
        let serializer = Arc::new(MutationSerializer::new(client));
        let volumes = VolumeOrchestrator::new(
            serializer.clone(),
            config.lun_scope,
            config.volume_name_max_len,
            config.default_map_mode.clone(),
        );
        let snapshots = SnapshotOrchestrator::new(serializer, config.volume_name_max_len);

        info!(
            plugin = %config.plugin_name,
            lun_scope = ?config.lun_scope,
            "controller service initialized"
        );
        Arc::new(Self {
            config,
            volumes,
            snapshots,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    pub fn plugin_info(&self) -> GetPluginInfoResponse {
        GetPluginInfoResponse {
            name: self.config.plugin_name.clone(),
            vendor_version: crate::VERSION.to_string(),
        }
    }

    pub fn plugin_capabilities(&self) -> GetPluginCapabilitiesResponse {
        GetPluginCapabilitiesResponse {
            capabilities: vec![
                PluginCapability::ControllerService,
                PluginCapability::OnlineVolumeExpansion,
            ],
        }
    }

    pub fn probe(&self) -> ProbeResponse {
        ProbeResponse { ready: true }
    }

    pub fn capabilities(&self) -> ControllerGetCapabilitiesResponse {
        ControllerGetCapabilitiesResponse {
            capabilities: vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::PublishUnpublishVolume,
                ControllerCapability::CreateDeleteSnapshot,
                ControllerCapability::ListSnapshots,
                ControllerCapability::CloneVolume,
                ControllerCapability::ExpandVolume,
            ],
        }
    }

    // -------------------------------------------------------------------------
    // Volumes
    // -------------------------------------------------------------------------

    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        check_parameters(&request.parameters)?;
        check_capabilities(&request.volume_capabilities)?;
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.volumes.create(&credentials, &request).await
    }

    pub async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<()> {
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.volumes.delete(&credentials, &request).await
    }

    pub async fn publish_volume(
        &self,
        request: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        if let Some(capability) = &request.volume_capability {
            check_capabilities(std::slice::from_ref(capability))?;
        }
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.volumes.publish(&credentials, &request).await
    }

    pub async fn unpublish_volume(&self, request: ControllerUnpublishVolumeRequest) -> Result<()> {
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.volumes.unpublish(&credentials, &request).await
    }

    pub async fn expand_volume(
        &self,
        request: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        if let Some(capability) = &request.volume_capability {
            check_capabilities(std::slice::from_ref(capability))?;
        }
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.volumes.expand(&credentials, &request).await
    }

    pub async fn validate_volume_capabilities(
        &self,
        request: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot validate volume with empty ID".into(),
            ));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot validate volume without capabilities".into(),
            ));
        }

        let credentials = credentials_from_secrets(&request.secrets)?;
        if self
            .volumes
            .lookup(&credentials, &request.volume_id)
            .await?
            .is_none()
        {
            return Err(Error::VolumeNotFound {
                volume_id: request.volume_id,
            });
        }

        if request.volume_capabilities.iter().all(|c| c.is_supported()) {
            debug!(volume_id = %request.volume_id, "capabilities confirmed");
            Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: Some(ConfirmedCapabilities {
                    volume_capabilities: request.volume_capabilities,
                }),
                message: String::new(),
            })
        } else {
            Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "only single-node read/write access mode is supported".into(),
            })
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse> {
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.snapshots.create(&credentials, &request).await
    }

    pub async fn delete_snapshot(&self, request: DeleteSnapshotRequest) -> Result<()> {
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.snapshots.delete(&credentials, &request).await
    }

    pub async fn list_snapshots(
        &self,
        request: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse> {
        let credentials = credentials_from_secrets(&request.secrets)?;
        self.snapshots.list(&credentials, &request).await
    }
}
