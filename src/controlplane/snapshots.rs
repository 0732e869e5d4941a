//! Snapshot Orchestrator
//!
//! Snapshot ids are derived from the orchestrator's snapshot name, so a
//! retried create lands on the same array object; the snapshot is always read
//! back after creation to confirm it belongs to the requested source volume.

use crate::controlplane::session::MutationSerializer;
use crate::domain::fault::{ArrayOutcome, FaultCode};
use crate::domain::ports::{ArrayClient, ArrayCredentials, ArraySnapshot};
use crate::domain::request::{
    CreateSnapshotRequest, CreateSnapshotResponse, DeleteSnapshotRequest, ListSnapshotsRequest,
    ListSnapshotsResponse, Snapshot,
};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix the orchestrator puts in front of snapshot names
pub const SNAPSHOT_NAME_PREFIX: &str = "snapshot-";

/// Array-side snapshot id for a snapshot name
pub fn snapshot_id(name: &str, max_len: usize) -> String {
    name.strip_prefix(SNAPSHOT_NAME_PREFIX)
        .unwrap_or(name)
        .chars()
        .filter(|c| *c != '-')
        .take(max_len)
        .collect()
}

fn project(snapshot: ArraySnapshot) -> Snapshot {
    Snapshot {
        snapshot_id: snapshot.name,
        source_volume_id: snapshot.source_volume,
        size_bytes: snapshot.size_bytes,
        creation_time: snapshot.created_at,
        ready_to_use: true,
    }
}

// =============================================================================
// Snapshot Orchestrator
// =============================================================================

pub struct SnapshotOrchestrator {
    serializer: Arc<MutationSerializer>,
    snapshot_name_max_len: usize,
}

impl SnapshotOrchestrator {
    pub fn new(serializer: Arc<MutationSerializer>, snapshot_name_max_len: usize) -> Self {
        Self {
            serializer,
            snapshot_name_max_len,
        }
    }

    pub async fn create(
        &self,
        credentials: &ArrayCredentials,
        request: &CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot create snapshot with empty name".into(),
            ));
        }
        if request.source_volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot create snapshot without source volume".into(),
            ));
        }

        let id = snapshot_id(&request.name, self.snapshot_name_max_len);
        info!(snapshot_id = %id, source = %request.source_volume_id, "creating snapshot");

        let array = self.serializer.acquire(credentials).await?;
        match array.create_snapshot(&request.source_volume_id, &id).await? {
            ArrayOutcome::Ok(()) => {}
            ArrayOutcome::KnownFault(FaultCode::SnapshotAlreadyExists) => {
                debug!(snapshot_id = %id, "snapshot already exists, reading it back");
            }
            ArrayOutcome::KnownFault(FaultCode::VolumeNotFound) => {
                return Err(Error::VolumeNotFound {
                    volume_id: request.source_volume_id.clone(),
                });
            }
            outcome => outcome.into_result("create snapshot")?,
        }

        let snapshot = find_snapshot(&*array, &id)
            .await?
            .ok_or_else(|| Error::Internal(format!("snapshot {} not found after creation", id)))?;

        if snapshot.source_volume != request.source_volume_id {
            return Err(Error::SnapshotConflict {
                snapshot_id: id,
                existing_source: snapshot.source_volume,
            });
        }

        info!(snapshot_id = %id, "created snapshot");
        Ok(CreateSnapshotResponse {
            snapshot: project(snapshot),
        })
    }

    /// Delete a snapshot; one that is already gone counts as deleted
    pub async fn delete(
        &self,
        credentials: &ArrayCredentials,
        request: &DeleteSnapshotRequest,
    ) -> Result<()> {
        if request.snapshot_id.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot delete snapshot with empty ID".into(),
            ));
        }

        info!(snapshot_id = %request.snapshot_id, "deleting snapshot");
        let array = self.serializer.acquire(credentials).await?;
        match array.delete_snapshot(&request.snapshot_id).await? {
            ArrayOutcome::KnownFault(FaultCode::SnapshotNotFound) => {
                info!(
                    snapshot_id = %request.snapshot_id,
                    "snapshot does not exist, assuming it has already been deleted"
                );
                Ok(())
            }
            outcome => outcome.into_result("delete snapshot"),
        }
    }

    /// List snapshots, narrowed by the request's optional filters
    pub async fn list(
        &self,
        credentials: &ArrayCredentials,
        request: &ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse> {
        let array = self.serializer.reader(credentials).await?;
        let snapshots = match array.show_snapshots(None).await? {
            ArrayOutcome::KnownFault(FaultCode::ObjectNotFound) => Vec::new(),
            outcome => outcome.into_result("show snapshots")?,
        };

        let filter = |value: &Option<String>, actual: &str| match value.as_deref() {
            None | Some("") => true,
            Some(wanted) => wanted == actual,
        };

        let entries: Vec<Snapshot> = snapshots
            .into_iter()
            .filter(|s| filter(&request.snapshot_id, &s.name))
            .filter(|s| filter(&request.source_volume_id, &s.source_volume))
            .map(project)
            .collect();

        debug!(count = entries.len(), "listed snapshots");
        Ok(ListSnapshotsResponse { entries })
    }
}

async fn find_snapshot(array: &dyn ArrayClient, id: &str) -> Result<Option<ArraySnapshot>> {
    match array.show_snapshots(Some(id)).await? {
        ArrayOutcome::KnownFault(FaultCode::ObjectNotFound) => Ok(None),
        outcome => Ok(outcome
            .into_result("show snapshots")?
            .into_iter()
            .find(|s| s.name == id)),
    }
}
