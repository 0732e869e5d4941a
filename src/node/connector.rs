//! Persisted Connector State
//!
//! One JSON file per attached volume, `iscsi-<volume id>.json` under the
//! plugin directory. The file is written as the last step of a successful
//! publish and is the only record of what unpublish has to undo; a missing
//! file means the volume is detached.

use crate::domain::ports::{is_multipath_device, AttachedDevice, IscsiTarget};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

// =============================================================================
// Connector State
// =============================================================================

/// Everything needed to tear down one volume's iSCSI attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorState {
    #[serde(default)]
    pub volume_name: String,
    pub target_iqn: String,
    /// Portals as `host:port`
    pub target_portals: Vec<String>,
    pub lun: u32,
    pub device_path: String,
    #[serde(default)]
    pub path_devices: Vec<String>,
    pub multipath: bool,
    /// Filesystem created on the device
    #[serde(default)]
    pub fs_type: String,
}

impl ConnectorState {
    pub fn new(
        volume_name: &str,
        targets: &[IscsiTarget],
        lun: u32,
        device: &AttachedDevice,
        fs_type: &str,
    ) -> Self {
        Self {
            volume_name: volume_name.to_string(),
            target_iqn: targets.first().map(|t| t.iqn.clone()).unwrap_or_default(),
            target_portals: targets.iter().map(|t| t.portal.clone()).collect(),
            lun,
            device_path: device.device_path.clone(),
            path_devices: device.path_devices.clone(),
            multipath: device.is_multipath(),
            fs_type: fs_type.to_string(),
        }
    }

    pub fn targets(&self) -> Vec<IscsiTarget> {
        self.target_portals
            .iter()
            .map(|portal| IscsiTarget {
                iqn: self.target_iqn.clone(),
                portal: portal.clone(),
            })
            .collect()
    }

    pub fn device(&self) -> AttachedDevice {
        AttachedDevice {
            device_path: self.device_path.clone(),
            path_devices: self.path_devices.clone(),
        }
    }
}

// =============================================================================
// On-disk Layouts
// =============================================================================

/// Target entry of the older, per-portal layout
#[derive(Debug, Deserialize)]
struct LegacyTarget {
    iqn: String,
    portal: String,
    #[serde(default)]
    port: String,
}

/// Union of the current and the legacy layout
#[derive(Debug, Deserialize)]
struct StoredConnector {
    #[serde(default)]
    volume_name: String,
    #[serde(default)]
    target_iqn: String,
    #[serde(default, alias = "target_portal")]
    target_portals: Vec<String>,
    #[serde(default)]
    targets: Vec<LegacyTarget>,
    #[serde(default)]
    lun: u32,
    #[serde(default)]
    device_path: String,
    #[serde(default)]
    path_devices: Vec<String>,
    #[serde(default)]
    multipath: Option<bool>,
    #[serde(default)]
    fs_type: String,
}

impl From<StoredConnector> for ConnectorState {
    fn from(stored: StoredConnector) -> Self {
        let (target_iqn, target_portals) =
            if stored.target_iqn.is_empty() || stored.target_portals.is_empty() {
                let iqn = stored
                    .targets
                    .first()
                    .map(|t| t.iqn.clone())
                    .unwrap_or(stored.target_iqn);
                let portals = stored
                    .targets
                    .iter()
                    .filter(|t| !t.portal.is_empty())
                    .map(|t| {
                        if t.port.is_empty() {
                            t.portal.clone()
                        } else {
                            format!("{}:{}", t.portal, t.port)
                        }
                    })
                    .collect();
                (iqn, portals)
            } else {
                (stored.target_iqn, stored.target_portals)
            };

        let multipath = stored
            .multipath
            .unwrap_or_else(|| is_multipath_device(&stored.device_path));

        Self {
            volume_name: stored.volume_name,
            target_iqn,
            target_portals,
            lun: stored.lun,
            device_path: stored.device_path,
            path_devices: stored.path_devices,
            multipath,
            fs_type: stored.fs_type,
        }
    }
}

/// Parse a connector file in either layout
pub fn parse_connector(contents: &str) -> Result<ConnectorState> {
    let stored: StoredConnector = serde_json::from_str(contents)?;
    Ok(stored.into())
}

// =============================================================================
// Connector Store
// =============================================================================

/// Directory holding one connector file per attached volume
#[derive(Debug, Clone)]
pub struct ConnectorStore {
    dir: PathBuf,
}

impl ConnectorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, volume_id: &str) -> PathBuf {
        self.dir.join(format!("iscsi-{}.json", volume_id))
    }

    /// Persist state, replacing any previous file atomically
    pub async fn save(&self, volume_id: &str, state: &ConnectorState) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(volume_id);
        let tmp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(state)?;

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;

        info!(path = %path.display(), "saved iSCSI connection info");
        Ok(())
    }

    /// Load state; `None` when the volume has no connector file
    pub async fn load(&self, volume_id: &str) -> Result<Option<ConnectorState>> {
        let path = self.path_for(volume_id);
        debug!(path = %path.display(), "loading iSCSI connection info");
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(parse_connector(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove state; removing an absent file is not an error
    pub async fn remove(&self, volume_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(volume_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
