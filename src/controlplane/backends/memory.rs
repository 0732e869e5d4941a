//! In-memory Block Array
//!
//! A faithful stand-in for the array's management API: volumes, hosts, host
//! mappings and snapshots live in memory, and every refusal is reported with
//! the same numeric codes the real array uses. Backs the test suite and
//! `--standalone` mode.

use crate::domain::fault::{ArrayOutcome, FaultCode, SUCCESS_CODE};
use crate::domain::ports::{
    ArrayClient, ArrayCredentials, ArraySnapshot, ArrayVolume, HostMapping,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Code returned when a name is already taken by another object
pub const NAME_IN_USE_CODE: i64 = -10132;
/// Code returned when a LUN is already used by the initiator
pub const LUN_IN_USE_CODE: i64 = -10341;

// =============================================================================
// Array State
// =============================================================================

#[derive(Debug, Default)]
struct ArrayState {
    volumes: BTreeMap<String, ArrayVolume>,
    /// initiator id -> nickname
    hosts: BTreeMap<String, String>,
    mappings: Vec<HostMapping>,
    snapshots: BTreeMap<String, ArraySnapshot>,
}

/// Call counters, for asserting on side effects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayStats {
    pub logins: u64,
    pub idle_closes: u64,
    pub volume_creates: u64,
    pub volume_copies: u64,
    pub volume_expands: u64,
    pub host_creates: u64,
    pub maps: u64,
    pub snapshot_creates: u64,
}

// =============================================================================
// In-memory Array
// =============================================================================

pub struct InMemoryArray {
    /// Accepted (username, password); `None` accepts anything
    accepted: Option<(String, String)>,
    state: RwLock<ArrayState>,
    stats: Mutex<ArrayStats>,
    /// One-shot failures keyed by operation name
    injected: Mutex<HashMap<&'static str, (i64, String)>>,
}

impl Default for InMemoryArray {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArray {
    /// Array that accepts any credentials
    pub fn new() -> Self {
        Self {
            accepted: None,
            state: RwLock::new(ArrayState::default()),
            stats: Mutex::new(ArrayStats::default()),
            injected: Mutex::new(HashMap::new()),
        }
    }

    /// Array that only accepts the given user
    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self {
            accepted: Some((username.to_string(), password.to_string())),
            ..Self::new()
        }
    }

    pub fn stats(&self) -> ArrayStats {
        *self.stats.lock()
    }

    /// Make the next call to `operation` fail with `code`
    pub fn fail_next(&self, operation: &'static str, code: i64, message: &str) {
        self.injected
            .lock()
            .insert(operation, (code, message.to_string()));
    }

    /// Register a host directly, as an administrator would
    pub fn add_host(&self, nickname: &str, initiator: &str) {
        self.state
            .write()
            .hosts
            .insert(initiator.to_string(), nickname.to_string());
    }

    /// Mappings currently held by the array
    pub fn mappings(&self) -> Vec<HostMapping> {
        self.state.read().mappings.clone()
    }

    pub fn volume(&self, name: &str) -> Option<ArrayVolume> {
        self.state.read().volumes.get(name).cloned()
    }

    pub fn has_host(&self, initiator: &str) -> bool {
        self.state.read().hosts.contains_key(initiator)
    }

    fn injected<T>(&self, operation: &'static str) -> Option<ArrayOutcome<T>> {
        let (code, message) = self.injected.lock().remove(operation)?;
        match FaultCode::from_code(code) {
            Some(fault) => Some(ArrayOutcome::KnownFault(fault)),
            None if code == SUCCESS_CODE => None,
            None => Some(ArrayOutcome::Unknown { code, message }),
        }
    }

    fn fault<T>(fault: FaultCode) -> Result<ArrayOutcome<T>> {
        Ok(ArrayOutcome::KnownFault(fault))
    }

    fn unknown<T>(code: i64, message: &str) -> Result<ArrayOutcome<T>> {
        Ok(ArrayOutcome::Unknown {
            code,
            message: message.to_string(),
        })
    }
}

#[async_trait]
impl ArrayClient for InMemoryArray {
    async fn login(&self, credentials: &ArrayCredentials) -> Result<()> {
        self.stats.lock().logins += 1;
        match &self.accepted {
            Some((user, pass)) if *user != credentials.username || *pass != credentials.password => {
                Err(Error::Unauthenticated {
                    address: credentials.address.clone(),
                    username: credentials.username.clone(),
                    reason: "Invalid sessionkey".into(),
                })
            }
            _ => Ok(()),
        }
    }

    fn close_idle_connections(&self) {
        self.stats.lock().idle_closes += 1;
    }

    async fn create_volume(
        &self,
        name: &str,
        size_bytes: u64,
        pool: &str,
    ) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("create_volume") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        if state.volumes.contains_key(name) || state.snapshots.contains_key(name) {
            return Self::unknown(NAME_IN_USE_CODE, "The name is already in use.");
        }

        info!(volume = %name, size_bytes, pool = %pool, "array: creating volume");
        state.volumes.insert(
            name.to_string(),
            ArrayVolume {
                name: name.to_string(),
                size_bytes,
                pool: pool.to_string(),
            },
        );
        self.stats.lock().volume_creates += 1;
        Ok(ArrayOutcome::Ok(()))
    }

    async fn copy_volume(&self, source: &str, name: &str, pool: &str) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("copy_volume") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        let size_bytes = match (state.volumes.get(source), state.snapshots.get(source)) {
            (Some(volume), _) => volume.size_bytes,
            (None, Some(snapshot)) => snapshot.size_bytes,
            (None, None) => return Self::fault(FaultCode::VolumeNotFound),
        };
        if state.volumes.contains_key(name) {
            return Self::unknown(NAME_IN_USE_CODE, "The name is already in use.");
        }

        info!(source = %source, volume = %name, "array: copying volume");
        state.volumes.insert(
            name.to_string(),
            ArrayVolume {
                name: name.to_string(),
                size_bytes,
                pool: pool.to_string(),
            },
        );
        self.stats.lock().volume_copies += 1;
        Ok(ArrayOutcome::Ok(()))
    }

    async fn delete_volume(&self, name: &str) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("delete_volume") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        if !state.volumes.contains_key(name) {
            return Self::fault(FaultCode::VolumeNotFound);
        }
        if state.snapshots.values().any(|s| s.source_volume == name) {
            return Self::fault(FaultCode::VolumeHasSnapshots);
        }

        state.volumes.remove(name);
        state.mappings.retain(|m| m.volume != name);
        debug!(volume = %name, "array: deleted volume");
        Ok(ArrayOutcome::Ok(()))
    }

    async fn expand_volume(&self, name: &str, delta_bytes: u64) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("expand_volume") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        match state.volumes.get_mut(name) {
            Some(volume) => {
                volume.size_bytes += delta_bytes;
                self.stats.lock().volume_expands += 1;
                Ok(ArrayOutcome::Ok(()))
            }
            None => Self::fault(FaultCode::VolumeNotFound),
        }
    }

    async fn show_volumes(&self, name: Option<&str>) -> Result<ArrayOutcome<Vec<ArrayVolume>>> {
        if let Some(outcome) = self.injected("show_volumes") {
            return Ok(outcome);
        }

        let state = self.state.read();
        match name {
            Some(name) => match state.volumes.get(name) {
                Some(volume) => Ok(ArrayOutcome::Ok(vec![volume.clone()])),
                None => Self::fault(FaultCode::ObjectNotFound),
            },
            None => Ok(ArrayOutcome::Ok(state.volumes.values().cloned().collect())),
        }
    }

    async fn show_volume_maps(&self, volume: &str) -> Result<ArrayOutcome<Vec<String>>> {
        if let Some(outcome) = self.injected("show_volume_maps") {
            return Ok(outcome);
        }

        let state = self.state.read();
        if !state.volumes.contains_key(volume) {
            return Self::fault(FaultCode::VolumeNotFound);
        }
        Ok(ArrayOutcome::Ok(
            state
                .mappings
                .iter()
                .filter(|m| m.volume == volume)
                .map(|m| m.initiator.clone())
                .collect(),
        ))
    }

    async fn map_volume(
        &self,
        volume: &str,
        initiator: &str,
        mode: &str,
        lun: u32,
    ) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("map_volume") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        if !state.volumes.contains_key(volume) {
            return Self::fault(FaultCode::VolumeNotFound);
        }
        if !state.hosts.contains_key(initiator) {
            return Self::fault(FaultCode::HostDoesNotExist);
        }
        if state
            .mappings
            .iter()
            .any(|m| m.initiator == initiator && m.lun == lun && m.volume != volume)
        {
            return Self::unknown(LUN_IN_USE_CODE, "The specified LUN is already in use.");
        }

        debug!(volume = %volume, initiator = %initiator, lun, mode = %mode, "array: mapping volume");
        state
            .mappings
            .retain(|m| !(m.volume == volume && m.initiator == initiator));
        state.mappings.push(HostMapping {
            lun,
            volume: volume.to_string(),
            initiator: initiator.to_string(),
        });
        self.stats.lock().maps += 1;
        Ok(ArrayOutcome::Ok(()))
    }

    async fn unmap_volume(&self, volume: &str, initiator: &str) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("unmap_volume") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        let before = state.mappings.len();
        state
            .mappings
            .retain(|m| !(m.volume == volume && (initiator.is_empty() || m.initiator == initiator)));
        if state.mappings.len() == before {
            return Self::fault(FaultCode::UnmapFailed);
        }
        Ok(ArrayOutcome::Ok(()))
    }

    async fn show_host_maps(
        &self,
        initiator: Option<&str>,
    ) -> Result<ArrayOutcome<Vec<HostMapping>>> {
        if let Some(outcome) = self.injected("show_host_maps") {
            return Ok(outcome);
        }

        let state = self.state.read();
        match initiator {
            Some(initiator) if !state.hosts.contains_key(initiator) => {
                Self::fault(FaultCode::HostMapDoesNotExist)
            }
            Some(initiator) => Ok(ArrayOutcome::Ok(
                state
                    .mappings
                    .iter()
                    .filter(|m| m.initiator == initiator)
                    .cloned()
                    .collect(),
            )),
            None => Ok(ArrayOutcome::Ok(state.mappings.clone())),
        }
    }

    async fn create_host(&self, nickname: &str, initiator: &str) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("create_host") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        if state.hosts.contains_key(initiator) || state.hosts.values().any(|n| n == nickname) {
            return Self::unknown(NAME_IN_USE_CODE, "The name is already in use.");
        }

        info!(nickname = %nickname, initiator = %initiator, "array: creating host");
        state
            .hosts
            .insert(initiator.to_string(), nickname.to_string());
        self.stats.lock().host_creates += 1;
        Ok(ArrayOutcome::Ok(()))
    }

    async fn create_snapshot(&self, source: &str, name: &str) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("create_snapshot") {
            return Ok(outcome);
        }

        let mut state = self.state.write();
        let size_bytes = match state.volumes.get(source) {
            Some(volume) => volume.size_bytes,
            None => return Self::fault(FaultCode::VolumeNotFound),
        };
        if state.snapshots.contains_key(name) {
            return Self::fault(FaultCode::SnapshotAlreadyExists);
        }

        info!(source = %source, snapshot = %name, "array: creating snapshot");
        state.snapshots.insert(
            name.to_string(),
            ArraySnapshot {
                name: name.to_string(),
                source_volume: source.to_string(),
                size_bytes,
                created_at: chrono::Utc::now(),
            },
        );
        self.stats.lock().snapshot_creates += 1;
        Ok(ArrayOutcome::Ok(()))
    }

    async fn delete_snapshot(&self, name: &str) -> Result<ArrayOutcome<()>> {
        if let Some(outcome) = self.injected("delete_snapshot") {
            return Ok(outcome);
        }

        match self.state.write().snapshots.remove(name) {
            Some(_) => Ok(ArrayOutcome::Ok(())),
            None => Self::fault(FaultCode::SnapshotNotFound),
        }
    }

    async fn show_snapshots(
        &self,
        name: Option<&str>,
    ) -> Result<ArrayOutcome<Vec<ArraySnapshot>>> {
        if let Some(outcome) = self.injected("show_snapshots") {
            return Ok(outcome);
        }

        let state = self.state.read();
        match name {
            Some(name) => match state.snapshots.get(name) {
                Some(snapshot) => Ok(ArrayOutcome::Ok(vec![snapshot.clone()])),
                None => Self::fault(FaultCode::ObjectNotFound),
            },
            None => Ok(ArrayOutcome::Ok(state.snapshots.values().cloned().collect())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_map_requires_host() {
        let array = InMemoryArray::new();
        array.create_volume("vol1", 1 << 30, "A").await.unwrap();

        let outcome = array
            .map_volume("vol1", "iqn.2004-10.com.ubuntu:01:node1", "rw", 1)
            .await
            .unwrap();
        assert!(outcome.is_fault(FaultCode::HostDoesNotExist));

        array.add_host("node1", "iqn.2004-10.com.ubuntu:01:node1");
        let outcome = array
            .map_volume("vol1", "iqn.2004-10.com.ubuntu:01:node1", "rw", 1)
            .await
            .unwrap();
        assert_eq!(outcome, ArrayOutcome::Ok(()));
    }

    #[tokio::test]
    async fn test_delete_refused_with_snapshots() {
        let array = InMemoryArray::new();
        array.create_volume("vol1", 1 << 30, "A").await.unwrap();
        array.create_snapshot("vol1", "snap1").await.unwrap();

        let outcome = array.delete_volume("vol1").await.unwrap();
        assert!(outcome.is_fault(FaultCode::VolumeHasSnapshots));

        array.delete_snapshot("snap1").await.unwrap();
        assert_eq!(array.delete_volume("vol1").await.unwrap(), ArrayOutcome::Ok(()));
        assert!(array
            .delete_volume("vol1")
            .await
            .unwrap()
            .is_fault(FaultCode::VolumeNotFound));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let array = InMemoryArray::new();
        array.fail_next("create_volume", -10999, "controller busy");

        let outcome = array.create_volume("vol1", 4096, "A").await.unwrap();
        assert_eq!(
            outcome,
            ArrayOutcome::Unknown {
                code: -10999,
                message: "controller busy".into()
            }
        );
        assert_eq!(
            array.create_volume("vol1", 4096, "A").await.unwrap(),
            ArrayOutcome::Ok(())
        );
    }
}
