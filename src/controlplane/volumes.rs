//! Volume Orchestrator
//!
//! Create, delete, publish, unpublish and expand for array volumes. Every
//! operation here runs under the [`MutationSerializer`]; array faults are
//! either absorbed (idempotent success) or translated into [`Error`] variants
//! before returning.

use crate::controlplane::lun::{next_available_lun, LunScope};
use crate::controlplane::session::{MutationSerializer, SessionGuard};
use crate::domain::fault::{ArrayOutcome, FaultCode};
use crate::domain::ports::{ArrayClient, ArrayCredentials, ArrayVolume, HostMapping};
use crate::domain::request::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, Volume, LUN_KEY, POOL_KEY,
};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Smallest volume the array will create
pub const MINIMUM_VOLUME_BYTES: u64 = 4096;

/// Longest volume name the array accepts
pub const VOLUME_NAME_MAX_LENGTH: usize = 32;

/// Size actually provisioned for a request of `requested` bytes
pub fn normalized_size(requested: u64) -> u64 {
    if requested == 0 {
        MINIMUM_VOLUME_BYTES
    } else {
        requested
    }
}

/// Derive the array-side volume name from the orchestrator's volume name
///
/// Names longer than `max_len` lose their 4-character prefix (`pvc-`) and
/// separators, then are truncated.
pub fn sanitize_volume_id(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        return name.to_string();
    }
    name.chars()
        .skip(4)
        .filter(|c| *c != '-')
        .take(max_len)
        .collect()
}

/// Host nickname for an initiator: the IQN without its `iqn.yyyy-mm.domain` part
pub fn host_nickname(initiator: &str) -> Result<String> {
    let parts: Vec<&str> = initiator.split(':').collect();
    if parts.len() < 2 {
        return Err(Error::InvalidArgument(format!(
            "node id {} is not a valid IQN",
            initiator
        )));
    }
    Ok(parts[1..].join(":"))
}

// =============================================================================
// Volume Orchestrator
// =============================================================================

pub struct VolumeOrchestrator {
    serializer: Arc<MutationSerializer>,
    lun_scope: LunScope,
    volume_name_max_len: usize,
    map_mode: String,
}

impl VolumeOrchestrator {
    pub fn new(
        serializer: Arc<MutationSerializer>,
        lun_scope: LunScope,
        volume_name_max_len: usize,
        map_mode: impl Into<String>,
    ) -> Self {
        Self {
            serializer,
            lun_scope,
            volume_name_max_len,
            map_mode: map_mode.into(),
        }
    }

    /// Create a volume, or confirm an identical one already exists
    pub async fn create(
        &self,
        credentials: &ArrayCredentials,
        request: &CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot create volume with empty name".into(),
            ));
        }

        let pool = request
            .parameters
            .get(POOL_KEY)
            .ok_or_else(|| Error::MissingParameter {
                key: POOL_KEY.into(),
            })?;
        let declared_bytes = request
            .capacity_range
            .map(|range| range.requested_bytes())
            .unwrap_or(0);
        let size_bytes = normalized_size(declared_bytes);
        let volume_id = sanitize_volume_id(&request.name, self.volume_name_max_len);

        info!(volume_id = %volume_id, size_bytes, pool = %pool, "creating volume");

        let array = self.serializer.acquire(credentials).await?;
        match find_volume(&*array, &volume_id).await? {
            Some(existing) if existing.size_bytes != size_bytes => {
                return Err(Error::VolumeConflict {
                    volume_id,
                    existing_bytes: existing.size_bytes,
                    requested_bytes: size_bytes,
                });
            }
            Some(_) => {
                info!(volume_id = %volume_id, "volume already exists with the requested size");
            }
            None => match &request.volume_content_source {
                Some(source) => {
                    let source_id = source.source_id();
                    debug!(volume_id = %volume_id, source = %source_id, "cloning volume");
                    match array.copy_volume(source_id, &volume_id, pool).await? {
                        ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => {
                            return Err(Error::VolumeNotFound {
                                volume_id: source_id.to_string(),
                            });
                        }
                        outcome => outcome.into_result("copy volume")?,
                    }
                }
                None => array
                    .create_volume(&volume_id, size_bytes, pool)
                    .await?
                    .into_result("create volume")?,
            },
        }

        info!(volume_id = %volume_id, "created volume");
        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id,
                capacity_bytes: declared_bytes,
                volume_context: request.parameters.clone(),
                content_source: request.volume_content_source.clone(),
            },
        })
    }

    /// Delete a volume; a volume that is already gone counts as deleted
    pub async fn delete(
        &self,
        credentials: &ArrayCredentials,
        request: &DeleteVolumeRequest,
    ) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot delete volume with empty ID".into(),
            ));
        }

        info!(volume_id = %request.volume_id, "deleting volume");
        let array = self.serializer.acquire(credentials).await?;
        match array.delete_volume(&request.volume_id).await? {
            ArrayOutcome::Ok(()) => {
                info!(volume_id = %request.volume_id, "successfully deleted volume");
                Ok(())
            }
            ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => {
                info!(
                    volume_id = %request.volume_id,
                    "volume does not exist, assuming it has already been deleted"
                );
                Ok(())
            }
            ArrayOutcome::KnownFault(FaultCode::VolumeHasSnapshots) => {
                Err(Error::VolumeHasSnapshots {
                    volume_id: request.volume_id.clone(),
                })
            }
            outcome => outcome.into_result("delete volume"),
        }
    }

    /// Map a volume to the requesting initiator and return its LUN
    pub async fn publish(
        &self,
        credentials: &ArrayCredentials,
        request: &ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot publish volume with empty ID".into(),
            ));
        }
        if request.node_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot publish volume to a node with empty ID".into(),
            ));
        }
        if request.volume_capability.is_none() {
            return Err(Error::InvalidArgument(
                "cannot publish volume without capabilities".into(),
            ));
        }

        let volume_id = request.volume_id.as_str();
        let initiator = request.node_id.as_str();
        info!(volume_id = %volume_id, initiator = %initiator, "attach request");

        let array = self.serializer.acquire(credentials).await?;

        let mapped_to = match array.show_volume_maps(volume_id).await? {
            ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => {
                return Err(Error::VolumeNotFound {
                    volume_id: volume_id.to_string(),
                });
            }
            outcome => outcome.into_result("show volume maps")?,
        };
        if mapped_to.iter().any(|host| host != initiator) {
            return Err(Error::VolumeAttachedElsewhere {
                volume_id: volume_id.to_string(),
            });
        }

        if !mapped_to.is_empty() {
            let existing = host_mappings(&*array, Some(initiator))
                .await?
                .into_iter()
                .find(|m| m.volume == volume_id);
            if let Some(mapping) = existing {
                info!(volume_id = %volume_id, lun = mapping.lun, "volume is already mapped to this initiator");
                return Ok(publish_context(mapping.lun));
            }
        }

        let lun = self.choose_lun(&array, initiator).await?;
        info!(lun, "using LUN");

        self.map_volume(&array, volume_id, initiator, lun).await?;

        info!(volume_id = %volume_id, initiator = %initiator, lun, "successfully mapped volume");
        Ok(publish_context(lun))
    }

    /// Remove a volume's mapping; nothing to unmap counts as success
    pub async fn unpublish(
        &self,
        credentials: &ArrayCredentials,
        request: &ControllerUnpublishVolumeRequest,
    ) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot unpublish volume with empty ID".into(),
            ));
        }

        info!(volume_id = %request.volume_id, initiator = %request.node_id, "unmapping volume");
        let array = self.serializer.acquire(credentials).await?;
        match array
            .unmap_volume(&request.volume_id, &request.node_id)
            .await?
        {
            ArrayOutcome::Ok(()) => {
                info!(volume_id = %request.volume_id, "successfully unmapped volume");
                Ok(())
            }
            ArrayOutcome::KnownFault(FaultCode::UnmapFailed) => {
                info!("unmap failed, assuming volume is already unmapped");
                Ok(())
            }
            ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => {
                info!(volume_id = %request.volume_id, "volume does not exist, nothing to unmap");
                Ok(())
            }
            outcome => outcome.into_result("unmap volume"),
        }
    }

    /// Grow a volume to the requested size
    pub async fn expand(
        &self,
        credentials: &ArrayCredentials,
        request: &ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot expand a volume with an empty ID".into(),
            ));
        }
        let requested_bytes = request
            .capacity_range
            .map(|range| range.requested_bytes())
            .unwrap_or(0);
        if requested_bytes == 0 {
            return Err(Error::InvalidArgument(
                "cannot expand a volume without a capacity range".into(),
            ));
        }

        let volume_id = request.volume_id.as_str();
        info!(volume_id = %volume_id, requested_bytes, "expanding volume");

        let array = self.serializer.acquire(credentials).await?;
        let current = find_volume(&*array, volume_id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound {
                volume_id: volume_id.to_string(),
            })?;

        if requested_bytes < current.size_bytes {
            return Err(Error::VolumeShrink {
                volume_id: volume_id.to_string(),
                current_bytes: current.size_bytes,
                requested_bytes,
            });
        }

        let delta = requested_bytes - current.size_bytes;
        if delta == 0 {
            debug!(volume_id = %volume_id, "volume already has the requested size");
        } else {
            debug!(volume_id = %volume_id, current_bytes = current.size_bytes, delta, "expanding by delta");
            match array.expand_volume(volume_id, delta).await? {
                ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => {
                    return Err(Error::VolumeNotFound {
                        volume_id: volume_id.to_string(),
                    });
                }
                outcome => outcome.into_result("expand volume")?,
            }
        }

        info!(volume_id = %volume_id, capacity_bytes = requested_bytes, "expanded volume");
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: requested_bytes,
            node_expansion_required: true,
        })
    }

    /// Read-only lookup of a volume on the array
    pub async fn lookup(
        &self,
        credentials: &ArrayCredentials,
        volume_id: &str,
    ) -> Result<Option<ArrayVolume>> {
        let array = self.serializer.reader(credentials).await?;
        find_volume(&*array, volume_id).await
    }

    async fn choose_lun(&self, array: &SessionGuard<'_>, initiator: &str) -> Result<u32> {
        let scope = match self.lun_scope {
            LunScope::PerInitiator => Some(initiator),
            LunScope::Array => None,
        };
        debug!(scope = ?self.lun_scope, "listing LUN mappings");
        let mappings = host_mappings(&**array, scope).await?;
        next_available_lun(&mappings)
    }

    async fn map_volume(
        &self,
        array: &SessionGuard<'_>,
        volume_id: &str,
        initiator: &str,
        lun: u32,
    ) -> Result<()> {
        debug!(volume_id = %volume_id, initiator = %initiator, lun, "trying to map volume");
        match array
            .map_volume(volume_id, initiator, &self.map_mode, lun)
            .await?
        {
            ArrayOutcome::Ok(()) => Ok(()),
            ArrayOutcome::KnownFault(FaultCode::HostDoesNotExist) => {
                let nickname = host_nickname(initiator)?;
                info!(nickname = %nickname, "initiator does not exist, creating it");
                array
                    .create_host(&nickname, initiator)
                    .await?
                    .into_result("create host")?;

                info!("retrying to map volume");
                array
                    .map_volume(volume_id, initiator, &self.map_mode, lun)
                    .await?
                    .into_result("map volume")
            }
            ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => Err(Error::VolumeNotFound {
                volume_id: volume_id.to_string(),
            }),
            outcome => outcome.into_result("map volume"),
        }
    }
}

fn publish_context(lun: u32) -> ControllerPublishVolumeResponse {
    let mut publish_context = BTreeMap::new();
    publish_context.insert(LUN_KEY.to_string(), lun.to_string());
    ControllerPublishVolumeResponse { publish_context }
}

/// Volume by exact name, `None` if the array does not know it
pub(crate) async fn find_volume(
    array: &dyn ArrayClient,
    volume_id: &str,
) -> Result<Option<ArrayVolume>> {
    match array.show_volumes(Some(volume_id)).await? {
        ArrayOutcome::Ok(volumes) => Ok(volumes.into_iter().find(|v| v.name == volume_id)),
        ArrayOutcome::KnownFault(FaultCode::ObjectNotFound)
        | ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => Ok(None),
        outcome => {
            warn!(volume_id = %volume_id, "failed to list volumes");
            outcome.into_result("show volumes").map(|_| None)
        }
    }
}

/// Host mappings in scope; an initiator without mappings yet has none
async fn host_mappings(array: &dyn ArrayClient, initiator: Option<&str>) -> Result<Vec<HostMapping>> {
    match array.show_host_maps(initiator).await? {
        ArrayOutcome::KnownFault(FaultCode::HostMapDoesNotExist) => {
            debug!("initiator has no mappings yet");
            Ok(Vec::new())
        }
        outcome => outcome.into_result("show host maps"),
    }
}
