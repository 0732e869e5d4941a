//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use blockarray_csi::domain::request::*;
use blockarray_csi::{
    AttachedDevice, FilesystemTools, IscsiConnector, IscsiTarget, Result,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

pub const ARRAY_ADDRESS: &str = "https://array.local";
pub const TARGET_IQN: &str = "iqn.2015-11.com.hpe:storage.msa2050.18323cc9b3";
pub const NODE_A: &str = "iqn.1993-08.org.debian:01:host-a";
pub const NODE_B: &str = "iqn.1993-08.org.debian:01:host-b";

pub fn pairs(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn secrets() -> Secrets {
    pairs(&[
        (API_ADDRESS_KEY, ARRAY_ADDRESS),
        (USERNAME_KEY, "manage"),
        (PASSWORD_KEY, "!manage"),
    ])
}

pub fn parameters() -> BTreeMap<String, String> {
    pairs(&[
        (FS_TYPE_KEY, "ext4"),
        (POOL_KEY, "A"),
        (TARGET_IQN_KEY, TARGET_IQN),
        (PORTALS_KEY, "10.0.0.10,10.0.0.11"),
    ])
}

// =============================================================================
// Fake iSCSI initiator
// =============================================================================

/// Hands out one device per LUN; two portals produce a multipath map
#[derive(Default)]
pub struct FakeIscsi {
    pub connects: Mutex<Vec<(Vec<IscsiTarget>, u32)>>,
    pub disconnects: Mutex<Vec<AttachedDevice>>,
    pub rescans: Mutex<Vec<String>>,
    pub multipath_resizes: Mutex<Vec<String>>,
}

impl FakeIscsi {
    pub fn device_for(lun: u32, paths: usize) -> AttachedDevice {
        let path_devices: Vec<String> = (0..paths)
            .map(|i| format!("/dev/sd{}", (b'b' + (lun as u8) * 2 + i as u8) as char))
            .collect();
        let device_path = if paths > 1 {
            format!("/dev/dm-{}", lun)
        } else {
            path_devices[0].clone()
        };
        AttachedDevice {
            device_path,
            path_devices,
        }
    }
}

#[async_trait]
impl IscsiConnector for FakeIscsi {
    async fn connect(&self, targets: &[IscsiTarget], lun: u32) -> Result<AttachedDevice> {
        self.connects.lock().push((targets.to_vec(), lun));
        Ok(Self::device_for(lun, targets.len()))
    }

    async fn disconnect(&self, _: &[IscsiTarget], _: u32, device: &AttachedDevice) -> Result<()> {
        self.disconnects.lock().push(device.clone());
        Ok(())
    }

    async fn rescan(&self, path_device: &str) -> Result<()> {
        self.rescans.lock().push(path_device.to_string());
        Ok(())
    }

    async fn resize_multipath(&self, device_path: &str) -> Result<()> {
        self.multipath_resizes.lock().push(device_path.to_string());
        Ok(())
    }
}

// =============================================================================
// Fake filesystem tools
// =============================================================================

/// Tracks filesystems and mounts per device
#[derive(Default)]
pub struct FakeFs {
    pub filesystems: Mutex<HashMap<String, String>>,
    pub mounts: Mutex<HashMap<String, Vec<String>>>,
    pub missing_devices: Mutex<HashSet<String>>,
    pub corrupted: Mutex<HashSet<String>>,
    pub formats: Mutex<Vec<String>>,
    pub checks: Mutex<Vec<String>>,
    pub mount_calls: Mutex<u32>,
    pub resizes: Mutex<Vec<(String, String)>>,
}

impl FakeFs {
    /// Mount a device somewhere outside the agent's control
    pub fn mount_externally(&self, device: &str, target: &str) {
        self.mounts
            .lock()
            .entry(device.to_string())
            .or_default()
            .push(target.to_string());
    }
}

#[async_trait]
impl FilesystemTools for FakeFs {
    async fn detect(&self, device: &str) -> Result<Option<String>> {
        Ok(self.filesystems.lock().get(device).cloned())
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        self.formats.lock().push(device.to_string());
        self.filesystems
            .lock()
            .insert(device.to_string(), fs_type.to_string());
        Ok(())
    }

    async fn check(&self, device: &str, fs_type: &str) -> Result<()> {
        self.checks.lock().push(device.to_string());
        if self.mounts.lock().get(device).is_some_and(|m| !m.is_empty()) {
            return Err(blockarray_csi::Error::Command {
                command: format!("fsck.{} -n {}", fs_type, device),
                output: format!("{} is mounted", device),
            });
        }
        if self.corrupted.lock().contains(device) {
            return Err(blockarray_csi::Error::FilesystemCorrupted {
                device: device.to_string(),
                reason: "bad superblock".into(),
            });
        }
        Ok(())
    }

    async fn mount(&self, device: &str, target: &Path, _: &str, _: &[String]) -> Result<()> {
        *self.mount_calls.lock() += 1;
        self.mount_externally(device, &target.display().to_string());
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

    async fn device_exists(&self, device: &str) -> Result<bool> {
        Ok(!self.missing_devices.lock().contains(device))
    }

    async fn resize(&self, device: &str, fs_type: &str, _: Option<&Path>) -> Result<()> {
        self.resizes
            .lock()
            .push((device.to_string(), fs_type.to_string()));
        Ok(())
    }
}
