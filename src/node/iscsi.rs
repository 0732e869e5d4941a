//! iSCSI Connector
//!
//! Implements [`IscsiConnector`] with `iscsiadm` and sysfs. One session is
//! opened per portal; when several paths show up for the LUN the device-mapper
//! map that holds them is returned instead of a single path device.

use crate::domain::ports::{AttachedDevice, IscsiConnector, IscsiTarget};
use crate::error::{Error, Result};
use crate::node::{run, run_checked};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// `iscsiadm` exit code for "session already exists"
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// `iscsiadm` exit code for "no matching sessions"
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct IscsiConfig {
    pub iscsiadm: String,
    pub multipath: String,
    pub multipathd: String,
    /// Stable device links (`/dev/disk/by-path`)
    pub by_path_dir: PathBuf,
    /// Block device view in sysfs (`/sys/block`)
    pub sys_block_dir: PathBuf,
    /// How long to wait for devices to appear after login
    pub device_wait_timeout: Duration,
}

impl Default for IscsiConfig {
    fn default() -> Self {
        Self {
            iscsiadm: "iscsiadm".to_string(),
            multipath: "multipath".to_string(),
            multipathd: "multipathd".to_string(),
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            sys_block_dir: PathBuf::from("/sys/block"),
            device_wait_timeout: Duration::from_secs(10),
        }
    }
}

/// by-path link name of one LUN behind one portal
pub fn by_path_name(target: &IscsiTarget, lun: u32) -> String {
    format!("ip-{}-iscsi-{}-lun-{}", target.portal, target.iqn, lun)
}

/// Kernel name of a device node (`/dev/sdb` -> `sdb`)
pub fn kernel_name(device: &str) -> &str {
    device.rsplit('/').next().unwrap_or(device)
}

// =============================================================================
// iscsiadm Connector
// =============================================================================

pub struct IscsiAdm {
    config: IscsiConfig,
}

impl IscsiAdm {
    pub fn new(config: IscsiConfig) -> Self {
        Self { config }
    }

    async fn login(&self, target: &IscsiTarget) -> Result<()> {
        let portal = target.portal.as_str();
        let iqn = target.iqn.as_str();
        debug!(portal = %portal, iqn = %iqn, "creating iSCSI node record");
        run_checked(
            &self.config.iscsiadm,
            &["-m", "node", "-T", iqn, "-p", portal, "-o", "new"],
        )
        .await?;

        info!(portal = %portal, iqn = %iqn, "logging into iSCSI target");
        let output = run(
            &self.config.iscsiadm,
            &["-m", "node", "-T", iqn, "-p", portal, "--login"],
        )
        .await?;
        match output.status {
            Some(0) => Ok(()),
            Some(ISCSI_ERR_SESS_EXISTS) => {
                debug!(portal = %portal, "session already exists");
                Ok(())
            }
            _ => Err(Error::Iscsi(format!(
                "login to {} at {} failed: {}",
                iqn,
                portal,
                output.combined()
            ))),
        }
    }

    async fn logout(&self, target: &IscsiTarget) -> Result<()> {
        let portal = target.portal.as_str();
        let iqn = target.iqn.as_str();
        info!(portal = %portal, iqn = %iqn, "logging out of iSCSI target");
        let output = run(
            &self.config.iscsiadm,
            &["-m", "node", "-T", iqn, "-p", portal, "--logout"],
        )
        .await?;
        match output.status {
            Some(0) | Some(ISCSI_ERR_NO_OBJS_FOUND) => Ok(()),
            _ => Err(Error::Iscsi(format!(
                "logout from {} at {} failed: {}",
                iqn,
                portal,
                output.combined()
            ))),
        }
    }

    /// Resolve the by-path link of one path, waiting for udev to create it
    async fn wait_for_path(&self, target: &IscsiTarget, lun: u32) -> Result<String> {
        let link = self.config.by_path_dir.join(by_path_name(target, lun));
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(1))
            .with_max_elapsed_time(Some(self.config.device_wait_timeout))
            .build();

        let resolved = backoff::future::retry(policy, || async {
            fs::canonicalize(&link)
                .await
                .map_err(backoff::Error::transient)
        })
        .await
        .map_err(|e| {
            Error::Iscsi(format!("device {} did not appear: {}", link.display(), e))
        })?;

        Ok(resolved.display().to_string())
    }

    /// Device-mapper map holding a path device, if any
    fn find_holder(&self, path_device: &str) -> Result<Option<String>> {
        find_holder(&self.config.sys_block_dir, path_device)
    }

    async fn wait_for_holder(&self, path_device: &str) -> Result<String> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(1))
            .with_max_elapsed_time(Some(self.config.device_wait_timeout))
            .build();

        backoff::future::retry(policy, || async {
            match self.find_holder(path_device) {
                Ok(Some(holder)) => Ok(holder),
                Ok(None) => Err(backoff::Error::transient(Error::Iscsi(format!(
                    "no multipath map holds {}",
                    path_device
                )))),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn write_sysfs(&self, path_device: &str, attribute: &str) -> Result<()> {
        let path = self
            .config
            .sys_block_dir
            .join(kernel_name(path_device))
            .join("device")
            .join(attribute);
        debug!(path = %path.display(), "writing sysfs attribute");
        fs::write(&path, "1").await?;
        Ok(())
    }

    /// Whether other LUNs of the target are still attached through `target`
    async fn target_in_use(&self, target: &IscsiTarget) -> Result<bool> {
        let pattern = self
            .config
            .by_path_dir
            .join(format!("ip-{}-iscsi-{}-lun-*", target.portal, target.iqn));
        let pattern = pattern.display().to_string();
        let matches = glob::glob(&pattern)
            .map_err(|e| Error::Internal(format!("invalid glob {}: {}", pattern, e)))?;
        Ok(matches.filter_map(|entry| entry.ok()).next().is_some())
    }
}

/// Look for `<sys_block>/<dev>/holders/dm-*`
pub fn find_holder(sys_block_dir: &Path, path_device: &str) -> Result<Option<String>> {
    let pattern = sys_block_dir
        .join(kernel_name(path_device))
        .join("holders")
        .join("dm-*");
    let pattern = pattern.display().to_string();
    let mut holders = glob::glob(&pattern)
        .map_err(|e| Error::Internal(format!("invalid glob {}: {}", pattern, e)))?
        .filter_map(|entry| entry.ok());

    Ok(holders.next().and_then(|holder| {
        holder
            .file_name()
            .map(|name| format!("/dev/{}", name.to_string_lossy()))
    }))
}

#[async_trait]
impl IscsiConnector for IscsiAdm {
    async fn connect(&self, targets: &[IscsiTarget], lun: u32) -> Result<AttachedDevice> {
        if targets.is_empty() {
            return Err(Error::InvalidArgument("no iSCSI portals given".into()));
        }

        let mut path_devices = Vec::new();
        for target in targets {
            if let Err(e) = self.login(target).await {
                warn!(portal = %target.portal, error = %e, "skipping unreachable portal");
                continue;
            }
            match self.wait_for_path(target, lun).await {
                Ok(device) => path_devices.push(device),
                Err(e) => warn!(portal = %target.portal, error = %e, "path did not appear"),
            }
        }

        let first = match path_devices.first() {
            Some(first) => first.clone(),
            None => {
                return Err(Error::Iscsi(format!(
                    "no path to LUN {} could be established",
                    lun
                )))
            }
        };

        let device_path = if path_devices.len() > 1 {
            self.wait_for_holder(&first).await?
        } else {
            self.find_holder(&first)?.unwrap_or(first)
        };

        info!(device = %device_path, paths = path_devices.len(), "attached iSCSI device");
        Ok(AttachedDevice {
            device_path,
            path_devices,
        })
    }

    async fn disconnect(
        &self,
        targets: &[IscsiTarget],
        lun: u32,
        device: &AttachedDevice,
    ) -> Result<()> {
        if device.is_multipath() {
            info!(device = %device.device_path, "flushing multipath map");
            run_checked(&self.config.multipath, &["-f", &device.device_path]).await?;
        }

        for path in &device.path_devices {
            match self.write_sysfs(path, "delete").await {
                Ok(()) => debug!(device = %path, "removed path device"),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(device = %path, "path device already gone")
                }
                Err(e) => return Err(e),
            }
        }

        for target in targets {
            if self.target_in_use(target).await? {
                debug!(portal = %target.portal, lun, "target still serves other LUNs, keeping session");
                continue;
            }
            self.logout(target).await?;
        }
        Ok(())
    }

    async fn rescan(&self, path_device: &str) -> Result<()> {
        debug!(device = %path_device, "rescanning device");
        self.write_sysfs(path_device, "rescan").await
    }

    async fn resize_multipath(&self, device_path: &str) -> Result<()> {
        let name_file = self
            .config
            .sys_block_dir
            .join(kernel_name(device_path))
            .join("dm")
            .join("name");
        let map = fs::read_to_string(&name_file).await?;
        let map = map.trim();

        info!(map = %map, "resizing multipath map");
        run_checked(&self.config.multipathd, &["resize", "map", map]).await?;
        Ok(())
    }
}
