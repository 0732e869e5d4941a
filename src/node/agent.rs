//! Node Attachment Agent
//!
//! Drives one volume on one node through
//! `DETACHED -> ISCSI_CONNECTED -> FS_READY -> MOUNTED` on publish and back on
//! unpublish. The connector file written at the end of publish is the only
//! thing unpublish and expand trust; its absence means there is nothing to
//! undo.
//!
//! Publish is admitted through a gate of weight one. A second publish on the
//! same node is turned away with [`Error::NodeBusy`] instead of queueing.

use crate::controlplane::controller::DEFAULT_PLUGIN_NAME;
use crate::domain::ports::{FilesystemToolsRef, IscsiConnectorRef, IscsiTarget};
use crate::domain::request::*;
use crate::error::{Error, Result};
use crate::node::connector::{ConnectorState, ConnectorStore};
use crate::node::identity::{read_initiator_name, system_search_path, ReadinessProbe};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Filesystem used when neither the capability nor the volume context names one
pub const DEFAULT_FS_TYPE: &str = "ext4";

// =============================================================================
// Node Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name reported by GetPluginInfo, `.node` is appended
    pub plugin_name: String,
    /// Directory holding the connector files
    pub plugin_dir: PathBuf,
    /// open-iscsi initiator name file
    pub initiator_name_path: PathBuf,
    /// Port added to portals given without one
    pub default_iscsi_port: u16,
    pub max_volumes_per_node: u32,
    pub sys_module_dir: PathBuf,
    pub required_modules: Vec<String>,
    pub required_binaries: Vec<String>,
    /// Check host binaries, for sandboxed deployments
    pub check_binaries: bool,
    pub device_wait_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_string(),
            plugin_dir: PathBuf::from(format!("/var/lib/kubelet/plugins/{}", DEFAULT_PLUGIN_NAME)),
            initiator_name_path: PathBuf::from("/etc/iscsi/initiatorname.iscsi"),
            default_iscsi_port: 3260,
            max_volumes_per_node: 255,
            sys_module_dir: PathBuf::from("/sys/module"),
            required_modules: vec!["iscsi_tcp".to_string(), "dm_multipath".to_string()],
            required_binaries: ["iscsiadm", "multipath", "multipathd", "blkid", "mount", "umount"]
                .iter()
                .map(|b| b.to_string())
                .collect(),
            check_binaries: false,
            device_wait_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    pub fn readiness_probe(&self) -> ReadinessProbe {
        ReadinessProbe {
            sys_module_dir: self.sys_module_dir.clone(),
            required_modules: self.required_modules.clone(),
            required_binaries: self.required_binaries.clone(),
            check_binaries: self.check_binaries,
            search_path: system_search_path(),
        }
    }
}

// =============================================================================
// Attachment State
// =============================================================================

/// Where a volume stands on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Detached,
    IscsiConnected,
    FsReady,
    Mounted,
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentState::Detached => write!(f, "DETACHED"),
            AttachmentState::IscsiConnected => write!(f, "ISCSI_CONNECTED"),
            AttachmentState::FsReady => write!(f, "FS_READY"),
            AttachmentState::Mounted => write!(f, "MOUNTED"),
        }
    }
}

// =============================================================================
// Request Parsing
// =============================================================================

/// Split a comma separated portal list, adding `default_port` where missing
pub fn parse_portals(portals: &str, default_port: u16) -> Vec<String> {
    portals
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|portal| {
            let has_port = portal
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if has_port {
                portal.to_string()
            } else {
                format!("{}:{}", portal, default_port)
            }
        })
        .collect()
}

fn context_value<'a>(
    context: &'a std::collections::BTreeMap<String, String>,
    key: &str,
) -> Result<&'a str> {
    context
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::MissingParameter { key: key.into() })
}

fn parse_lun(value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid LUN '{}'", value)))
}

/// Requested filesystem: capability, then volume context, then ext4
fn requested_fs_type(request: &NodePublishVolumeRequest) -> String {
    request
        .volume_capability
        .as_ref()
        .and_then(|c| c.fs_type.clone())
        .filter(|fs| !fs.is_empty())
        .or_else(|| {
            request
                .volume_context
                .get(FS_TYPE_KEY)
                .filter(|fs| !fs.is_empty())
                .cloned()
        })
        .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string())
}

// =============================================================================
// Node Agent
// =============================================================================

pub struct NodeAgent {
    config: NodeConfig,
    iscsi: IscsiConnectorRef,
    fs: FilesystemToolsRef,
    store: ConnectorStore,
    probe: ReadinessProbe,
    /// Admission gate for publish
    gate: Semaphore,
}

impl NodeAgent {
    pub fn new(config: NodeConfig, iscsi: IscsiConnectorRef, fs: FilesystemToolsRef) -> Self {
        let store = ConnectorStore::new(config.plugin_dir.clone());
        let probe = config.readiness_probe();
        info!(
            plugin_dir = %config.plugin_dir.display(),
            "node agent initialized"
        );
        Self {
            config,
            iscsi,
            fs,
            store,
            probe,
            gate: Semaphore::new(1),
        }
    }

    /// Replace the readiness probe, e.g. to point it at a different sysfs root
    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &ConnectorStore {
        &self.store
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    pub fn plugin_info(&self) -> GetPluginInfoResponse {
        GetPluginInfoResponse {
            name: format!("{}.node", self.config.plugin_name),
            vendor_version: crate::VERSION.to_string(),
        }
    }

    pub fn plugin_capabilities(&self) -> GetPluginCapabilitiesResponse {
        GetPluginCapabilitiesResponse {
            capabilities: Vec::new(),
        }
    }

    pub async fn probe(&self) -> Result<ProbeResponse> {
        self.probe.check().await?;
        Ok(ProbeResponse { ready: true })
    }

    pub async fn get_info(&self) -> Result<NodeGetInfoResponse> {
        let node_id = read_initiator_name(&self.config.initiator_name_path).await?;
        Ok(NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: self.config.max_volumes_per_node,
        })
    }

    pub fn capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse {
            capabilities: vec![NodeCapability::ExpandVolume],
        }
    }

    // -------------------------------------------------------------------------
    // Publish
    // -------------------------------------------------------------------------

    pub async fn publish_volume(&self, request: NodePublishVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("cannot publish volume with empty ID".into()));
        }
        if request.target_path.is_empty() {
            return Err(Error::InvalidArgument("cannot publish volume without a target path".into()));
        }
        let capability = request
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("cannot publish volume without capabilities".into()))?;
        if !capability.is_supported() {
            return Err(Error::UnsupportedAccessMode {
                mode: capability.access_mode.to_string(),
            });
        }

        let _permit = self.gate.try_acquire().map_err(|_| {
            warn!(volume_id = %request.volume_id, "rejecting publish, node is busy");
            Error::NodeBusy
        })?;

        let volume_id = request.volume_id.as_str();
        let iqn = context_value(&request.volume_context, TARGET_IQN_KEY)?;
        let portals = parse_portals(
            context_value(&request.volume_context, PORTALS_KEY)?,
            self.config.default_iscsi_port,
        );
        if portals.is_empty() {
            return Err(Error::InvalidArgument("no iSCSI portals given".into()));
        }
        let lun = parse_lun(context_value(&request.publish_context, LUN_KEY)?)?;
        let fs_type = requested_fs_type(&request);
        let target_path = Path::new(&request.target_path);

        let targets: Vec<IscsiTarget> = portals
            .into_iter()
            .map(|portal| IscsiTarget {
                iqn: iqn.to_string(),
                portal,
            })
            .collect();

        info!(
            volume_id = %volume_id,
            iqn = %iqn,
            lun,
            portals = targets.len(),
            target = %request.target_path,
            "publishing volume on node"
        );

        let device = self.iscsi.connect(&targets, lun).await?;
        let device_path = device.device_path.as_str();
        info!(
            volume_id = %volume_id,
            device = %device_path,
            multipath = device.is_multipath(),
            state = %AttachmentState::IscsiConnected,
            "iSCSI device attached"
        );

        match self.fs.detect(device_path).await? {
            None => {
                info!(device = %device_path, fs_type = %fs_type, "device is unformatted");
                self.fs.format(device_path, &fs_type).await?;
            }
            Some(existing) if existing != fs_type => {
                return Err(Error::FilesystemMismatch {
                    device: device_path.to_string(),
                    existing,
                    requested: fs_type,
                });
            }
            Some(_) => debug!(device = %device_path, fs_type = %fs_type, "filesystem already present"),
        }

        // fsck refuses mounted filesystems, only check before the first mount
        let mount_points = self.fs.mount_points(device_path).await?;
        match mount_points.as_slice() {
            [] => {
                self.fs.check(device_path, &fs_type).await?;
                info!(volume_id = %volume_id, state = %AttachmentState::FsReady, "filesystem ready");

                tokio::fs::create_dir_all(target_path).await?;
                let mut flags = capability.mount_flags.clone();
                if request.readonly {
                    flags.push("ro".to_string());
                }
                self.fs.mount(device_path, target_path, &fs_type, &flags).await?;
            }
            [existing] if Path::new(existing) == target_path => {
                info!(
                    volume_id = %volume_id,
                    target = %request.target_path,
                    "volume already mounted at target"
                );
            }
            [existing] => {
                return Err(Error::MountedElsewhere {
                    device: device_path.to_string(),
                    mount_point: existing.clone(),
                });
            }
            _ => {
                return Err(Error::AmbiguousMounts {
                    device: device_path.to_string(),
                    mount_points: mount_points.clone(),
                });
            }
        }

        let state = ConnectorState::new(volume_id, &targets, lun, &device, &fs_type);
        self.store.save(volume_id, &state).await?;

        info!(
            volume_id = %volume_id,
            target = %request.target_path,
            state = %AttachmentState::Mounted,
            "volume published on node"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Unpublish
    // -------------------------------------------------------------------------

    pub async fn unpublish_volume(&self, request: NodeUnpublishVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("cannot unpublish volume with empty ID".into()));
        }
        if request.target_path.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot unpublish volume without a target path".into(),
            ));
        }
        let volume_id = request.volume_id.as_str();
        let target_path = Path::new(&request.target_path);

        info!(volume_id = %volume_id, target = %request.target_path, "unpublishing volume from node");

        if tokio::fs::metadata(target_path).await.is_ok() {
            if !self.fs.unmount(target_path).await? {
                debug!(target = %request.target_path, "target was not mounted");
            }
            match tokio::fs::remove_dir(target_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            debug!(target = %request.target_path, "target path already gone");
        }

        let state = match self.store.load(volume_id).await? {
            Some(state) => state,
            None => {
                info!(volume_id = %volume_id, "no connector state, volume already detached");
                return Ok(());
            }
        };
        let device_path = state.device_path.as_str();

        let remaining = self.fs.mount_points(device_path).await?;
        if !remaining.is_empty() {
            warn!(
                volume_id = %volume_id,
                device = %device_path,
                mount_points = ?remaining,
                "device still mounted elsewhere, keeping iSCSI session"
            );
            return Ok(());
        }

        if !self.fs.device_exists(device_path).await? {
            info!(volume_id = %volume_id, device = %device_path, "device already disconnected");
            self.store.remove(volume_id).await?;
            return Ok(());
        }

        let fs_type = if state.fs_type.is_empty() {
            self.fs.detect(device_path).await?
        } else {
            Some(state.fs_type.clone())
        };
        if let Some(fs_type) = fs_type {
            self.fs.check(device_path, &fs_type).await?;
        }

        self.iscsi
            .disconnect(&state.targets(), state.lun, &state.device())
            .await?;
        self.store.remove(volume_id).await?;

        info!(
            volume_id = %volume_id,
            device = %device_path,
            state = %AttachmentState::Detached,
            "volume unpublished from node"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Expand
    // -------------------------------------------------------------------------

    pub async fn expand_volume(
        &self,
        request: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("cannot expand volume with empty ID".into()));
        }
        let volume_id = request.volume_id.as_str();
        let state = self
            .store
            .load(volume_id)
            .await?
            .ok_or_else(|| Error::ConnectorStateMissing {
                volume_id: volume_id.to_string(),
            })?;

        info!(volume_id = %volume_id, device = %state.device_path, "expanding volume on node");

        if state.path_devices.is_empty() {
            self.iscsi.rescan(&state.device_path).await?;
        } else {
            for path in &state.path_devices {
                self.iscsi.rescan(path).await?;
            }
        }

        if state.multipath {
            self.iscsi.resize_multipath(&state.device_path).await?;
        }

        let fs_type = if state.fs_type.is_empty() {
            self.fs
                .detect(&state.device_path)
                .await?
                .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string())
        } else {
            state.fs_type.clone()
        };
        let mount_point = (!request.volume_path.is_empty()).then(|| Path::new(&request.volume_path));
        self.fs.resize(&state.device_path, &fs_type, mount_point).await?;

        let capacity_bytes = request
            .capacity_range
            .as_ref()
            .map(CapacityRange::requested_bytes)
            .unwrap_or_default();
        info!(volume_id = %volume_id, capacity_bytes, "volume expanded on node");
        Ok(NodeExpandVolumeResponse { capacity_bytes })
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Derive the current state of a volume from its connector file and the host
    pub async fn attachment_state(&self, volume_id: &str) -> Result<AttachmentState> {
        let state = match self.store.load(volume_id).await? {
            Some(state) => state,
            None => return Ok(AttachmentState::Detached),
        };
        if !self.fs.device_exists(&state.device_path).await? {
            return Ok(AttachmentState::Detached);
        }
        if self.fs.mount_points(&state.device_path).await?.is_empty() {
            Ok(AttachmentState::FsReady)
        } else {
            Ok(AttachmentState::Mounted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{
        AttachedDevice, FilesystemTools, IscsiConnector, VolumeCapability,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::{oneshot, Notify};

    #[derive(Default)]
    struct FakeIscsi {
        connects: Mutex<Vec<(Vec<IscsiTarget>, u32)>>,
        disconnects: Mutex<u32>,
        rescans: Mutex<Vec<String>>,
        multipath_resizes: Mutex<u32>,
        paths: Vec<String>,
        entered: Notify,
        hold: Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl IscsiConnector for FakeIscsi {
        async fn connect(&self, targets: &[IscsiTarget], lun: u32) -> Result<AttachedDevice> {
            self.connects.lock().push((targets.to_vec(), lun));
            self.entered.notify_one();
            let hold = self.hold.lock().take();
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            let device_path = if self.paths.len() > 1 {
                "/dev/dm-0".to_string()
            } else {
                "/dev/sdb".to_string()
            };
            Ok(AttachedDevice {
                device_path,
                path_devices: self.paths.clone(),
            })
        }

        async fn disconnect(&self, _: &[IscsiTarget], _: u32, _: &AttachedDevice) -> Result<()> {
            *self.disconnects.lock() += 1;
            Ok(())
        }

        async fn rescan(&self, path_device: &str) -> Result<()> {
            self.rescans.lock().push(path_device.to_string());
            Ok(())
        }

        async fn resize_multipath(&self, _: &str) -> Result<()> {
            *self.multipath_resizes.lock() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFs {
        formatted: Mutex<HashMap<String, String>>,
        mounts: Mutex<HashMap<String, Vec<String>>>,
        formats: Mutex<u32>,
        mount_calls: Mutex<Vec<Vec<String>>>,
        resizes: Mutex<u32>,
    }

    #[async_trait]
    impl FilesystemTools for FakeFs {
        async fn detect(&self, device: &str) -> Result<Option<String>> {
            Ok(self.formatted.lock().get(device).cloned())
        }

        async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
            *self.formats.lock() += 1;
            self.formatted.lock().insert(device.into(), fs_type.into());
            Ok(())
        }

        async fn check(&self, device: &str, fs_type: &str) -> Result<()> {
            if self.mounts.lock().get(device).is_some_and(|m| !m.is_empty()) {
                return Err(Error::Command {
                    command: format!("fsck.{} -n {}", fs_type, device),
                    output: format!("{} is mounted", device),
                });
            }
            Ok(())
        }

        async fn mount(&self, device: &str, target: &Path, _: &str, flags: &[String]) -> Result<()> {
            self.mount_calls.lock().push(flags.to_vec());
            self.mounts
                .lock()
                .entry(device.into())
                .or_default()
                .push(target.display().to_string());
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<bool> {
            let target = target.display().to_string();
            let mut removed = false;
            for points in self.mounts.lock().values_mut() {
                let before = points.len();
                points.retain(|p| *p != target);
                removed |= points.len() != before;
            }
            Ok(removed)
        }

        async fn mount_points(&self, device: &str) -> Result<Vec<String>> {
            Ok(self.mounts.lock().get(device).cloned().unwrap_or_default())
        }

        async fn device_exists(&self, _: &str) -> Result<bool> {
            Ok(true)
        }

        async fn resize(&self, _: &str, _: &str, _: Option<&Path>) -> Result<()> {
            *self.resizes.lock() += 1;
            Ok(())
        }
    }

    struct Fixture {
        tmp: TempDir,
        iscsi: Arc<FakeIscsi>,
        fs: Arc<FakeFs>,
        agent: Arc<NodeAgent>,
    }

    fn fixture(iscsi: FakeIscsi) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let iscsi = Arc::new(iscsi);
        let fs = Arc::new(FakeFs::default());
        let config = NodeConfig {
            plugin_dir: tmp.path().join("plugin"),
            ..Default::default()
        };
        let agent = Arc::new(NodeAgent::new(config, iscsi.clone(), fs.clone()));
        Fixture { tmp, iscsi, fs, agent }
    }

    fn publish_request(fx: &Fixture, target: &str) -> NodePublishVolumeRequest {
        let volume_context: BTreeMap<String, String> = [
            (TARGET_IQN_KEY, "iqn.2015-11.com.hpe:storage.msa2050"),
            (PORTALS_KEY, "10.0.0.10,10.0.0.11:3261"),
            (FS_TYPE_KEY, "ext4"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        NodePublishVolumeRequest {
            volume_id: "vol1".into(),
            target_path: fx.tmp.path().join(target).display().to_string(),
            volume_capability: Some(VolumeCapability::single_node_writer()),
            publish_context: [(LUN_KEY.to_string(), "3".to_string())].into_iter().collect(),
            volume_context,
            readonly: false,
        }
    }

    #[test]
    fn test_parse_portals() {
        assert_eq!(
            parse_portals("10.0.0.1, 10.0.0.2:3261,,", 3260),
            vec!["10.0.0.1:3260", "10.0.0.2:3261"]
        );
        assert!(parse_portals("", 3260).is_empty());
    }

    #[test]
    fn test_attachment_state_display() {
        assert_eq!(AttachmentState::IscsiConnected.to_string(), "ISCSI_CONNECTED");
        assert_eq!(AttachmentState::FsReady.to_string(), "FS_READY");
    }

    #[tokio::test]
    async fn test_publish_formats_mounts_and_persists() {
        let fx = fixture(FakeIscsi::default());
        let request = publish_request(&fx, "mount");
        fx.agent.publish_volume(request.clone()).await.unwrap();

        let connects = fx.iscsi.connects.lock().clone();
        assert_eq!(connects.len(), 1);
        let (targets, lun) = &connects[0];
        assert_eq!(*lun, 3);
        assert_eq!(targets[0].portal, "10.0.0.10:3260");
        assert_eq!(targets[1].portal, "10.0.0.11:3261");
        assert_eq!(*fx.fs.formats.lock(), 1);

        let state = fx.agent.store().load("vol1").await.unwrap().unwrap();
        assert_eq!(state.lun, 3);
        assert_eq!(state.fs_type, "ext4");
        assert_eq!(
            fx.agent.attachment_state("vol1").await.unwrap(),
            AttachmentState::Mounted
        );

        // republish to the same target is a no-op
        fx.agent.publish_volume(request).await.unwrap();
        assert_eq!(*fx.fs.formats.lock(), 1);
        assert_eq!(fx.fs.mount_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_readonly_adds_flag() {
        let fx = fixture(FakeIscsi::default());
        let mut request = publish_request(&fx, "mount");
        request.readonly = true;
        fx.agent.publish_volume(request).await.unwrap();
        assert_eq!(fx.fs.mount_calls.lock()[0], vec!["ro".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_rejects_other_filesystem() {
        let fx = fixture(FakeIscsi::default());
        fx.fs.formatted.lock().insert("/dev/sdb".into(), "xfs".into());

        let err = fx
            .agent
            .publish_volume(publish_request(&fx, "mount"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::FilesystemMismatch { ref existing, .. } if existing == "xfs");
        assert!(fx.agent.store().load("vol1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let fx = fixture(FakeIscsi::default());

        let mut request = publish_request(&fx, "mount");
        request.volume_capability = None;
        assert_matches!(
            fx.agent.publish_volume(request).await,
            Err(Error::InvalidArgument(_))
        );

        let mut request = publish_request(&fx, "mount");
        request.publish_context.clear();
        assert_matches!(
            fx.agent.publish_volume(request).await,
            Err(Error::MissingParameter { ref key }) if key == LUN_KEY
        );

        let mut request = publish_request(&fx, "mount");
        request
            .publish_context
            .insert(LUN_KEY.to_string(), "three".to_string());
        assert_matches!(
            fx.agent.publish_volume(request).await,
            Err(Error::InvalidArgument(_))
        );
        assert!(fx.iscsi.connects.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_publish_is_rejected() {
        let (release, hold) = oneshot::channel();
        let iscsi = FakeIscsi {
            hold: Mutex::new(Some(hold)),
            ..Default::default()
        };
        let fx = fixture(iscsi);

        let first = {
            let agent = fx.agent.clone();
            let request = publish_request(&fx, "first");
            tokio::spawn(async move { agent.publish_volume(request).await })
        };
        fx.iscsi.entered.notified().await;

        let err = fx
            .agent
            .publish_volume(publish_request(&fx, "second"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NodeBusy);
        assert!(err.is_retryable());

        release.send(()).unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unpublish_detaches_and_forgets() {
        let fx = fixture(FakeIscsi::default());
        let request = publish_request(&fx, "mount");
        fx.agent.publish_volume(request.clone()).await.unwrap();

        let unpublish = NodeUnpublishVolumeRequest {
            volume_id: "vol1".into(),
            target_path: request.target_path.clone(),
        };
        fx.agent.unpublish_volume(unpublish.clone()).await.unwrap();
        assert_eq!(*fx.iscsi.disconnects.lock(), 1);
        assert!(!Path::new(&request.target_path).exists());
        assert_eq!(
            fx.agent.attachment_state("vol1").await.unwrap(),
            AttachmentState::Detached
        );

        // second unpublish finds nothing to undo
        fx.agent.unpublish_volume(unpublish).await.unwrap();
        assert_eq!(*fx.iscsi.disconnects.lock(), 1);
    }

    #[tokio::test]
    async fn test_expand_rescans_every_path() {
        let iscsi = FakeIscsi {
            paths: vec!["/dev/sdb".into(), "/dev/sdc".into()],
            ..Default::default()
        };
        let fx = fixture(iscsi);
        fx.agent
            .publish_volume(publish_request(&fx, "mount"))
            .await
            .unwrap();

        let response = fx
            .agent
            .expand_volume(NodeExpandVolumeRequest {
                volume_id: "vol1".into(),
                volume_path: String::new(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 2 << 30,
                    limit_bytes: 0,
                }),
            })
            .await
            .unwrap();
        assert_eq!(response.capacity_bytes, 2 << 30);
        assert_eq!(*fx.iscsi.rescans.lock(), vec!["/dev/sdb", "/dev/sdc"]);
        assert_eq!(*fx.iscsi.multipath_resizes.lock(), 1);
        assert_eq!(*fx.fs.resizes.lock(), 1);
    }

    #[tokio::test]
    async fn test_expand_without_connector_state() {
        let fx = fixture(FakeIscsi::default());
        let err = fx
            .agent
            .expand_volume(NodeExpandVolumeRequest {
                volume_id: "vol9".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::ConnectorStateMissing { .. });
    }

    #[test]
    fn test_identity() {
        let fx = fixture(FakeIscsi::default());
        assert_eq!(fx.agent.plugin_info().name, format!("{}.node", DEFAULT_PLUGIN_NAME));
        assert!(fx.agent.plugin_capabilities().capabilities.is_empty());
        assert_eq!(
            fx.agent.capabilities().capabilities,
            vec![NodeCapability::ExpandVolume]
        );
    }
}
