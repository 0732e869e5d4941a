//! Host filesystem tools
//!
//! Implements [`FilesystemTools`] with the usual util-linux, e2fsprogs and
//! xfsprogs commands. Mount points are read from the kernel mount table.

use crate::domain::ports::FilesystemTools;
use crate::error::{Error, Result};
use crate::node::{run, run_checked, CommandOutput};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// `blkid` exit code when the device holds no recognisable filesystem
const BLKID_NOT_FOUND: i32 = 2;

/// Outcome of a filesystem consistency check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckVerdict {
    Clean,
    Corrupted,
    Failed,
}

/// Interpret the exit code of the check command for `fs_type`
pub fn fsck_verdict(fs_type: &str, status: Option<i32>) -> FsckVerdict {
    match (fs_type, status) {
        ("xfs", Some(0)) => FsckVerdict::Clean,
        ("xfs", Some(1)) => FsckVerdict::Corrupted,
        // fsck: 1 and 2 only come back from a repairing pass
        (_, Some(0..=2)) if fs_type != "xfs" => FsckVerdict::Clean,
        (_, Some(4)) if fs_type != "xfs" => FsckVerdict::Corrupted,
        _ => FsckVerdict::Failed,
    }
}

/// Read-only consistency check command for `fs_type` on `device`
///
/// Never repairs: a dirty volume is reported, not modified.
pub fn fsck_command<'a>(fs_type: &str, device: &'a str) -> (String, Vec<&'a str>) {
    if fs_type == "xfs" {
        ("xfs_repair".to_string(), vec!["-n", device])
    } else {
        (format!("fsck.{}", fs_type), vec!["-n", device])
    }
}

/// Arguments for creating `fs_type` on `device`
pub fn mkfs_args<'a>(fs_type: &str, device: &'a str) -> Vec<&'a str> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => vec!["-F", device],
        "xfs" => vec!["-f", device],
        _ => vec![device],
    }
}

/// Undo the octal escapes the kernel uses in the mount table
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    for _ in 0..3 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// `(source, target)` pairs of a mount table
pub fn parse_mount_table(mount_table: &str) -> Vec<(String, String)> {
    mount_table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some((unescape_mount_field(source), unescape_mount_field(target)))
        })
        .collect()
}

/// Mount points whose source is literally `device`
pub fn parse_mount_points(mount_table: &str, device: &str) -> Vec<String> {
    parse_mount_table(mount_table)
        .into_iter()
        .filter(|(source, _)| source == device)
        .map(|(_, target)| target)
        .collect()
}

fn command_error(program: &str, args: &[&str], output: &CommandOutput) -> Error {
    Error::Command {
        command: format!("{} {}", program, args.join(" ")),
        output: output.combined(),
    }
}

// =============================================================================
// Host Filesystem
// =============================================================================

pub struct HostFilesystem {
    /// Kernel mount table (`/proc/mounts`)
    mounts_file: PathBuf,
}

impl Default for HostFilesystem {
    fn default() -> Self {
        Self::new("/proc/mounts")
    }
}

impl HostFilesystem {
    pub fn new(mounts_file: impl Into<PathBuf>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
        }
    }
}

#[async_trait]
impl FilesystemTools for HostFilesystem {
    async fn detect(&self, device: &str) -> Result<Option<String>> {
        let args = ["-p", "-s", "TYPE", "-o", "value", device];
        let output = run("blkid", &args).await?;
        match output.status {
            Some(0) => {
                let fs_type = output.stdout.trim();
                Ok((!fs_type.is_empty()).then(|| fs_type.to_string()))
            }
            Some(BLKID_NOT_FOUND) => Ok(None),
            _ => Err(command_error("blkid", &args, &output)),
        }
    }

    async fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        info!(device = %device, fs_type = %fs_type, "creating filesystem");
        let program = format!("mkfs.{}", fs_type);
        run_checked(&program, &mkfs_args(fs_type, device)).await?;
        Ok(())
    }

    async fn check(&self, device: &str, fs_type: &str) -> Result<()> {
        let (program, args) = fsck_command(fs_type, device);

        debug!(device = %device, program = %program, "checking filesystem");
        let output = run(&program, &args).await?;
        match fsck_verdict(fs_type, output.status) {
            FsckVerdict::Clean => Ok(()),
            FsckVerdict::Corrupted => Err(Error::FilesystemCorrupted {
                device: device.to_string(),
                reason: output.combined(),
            }),
            FsckVerdict::Failed => Err(command_error(&program, &args, &output)),
        }
    }

    async fn mount(
        &self,
        device: &str,
        target: &Path,
        fs_type: &str,
        flags: &[String],
    ) -> Result<()> {
        let target = target.display().to_string();
        let options = flags.join(",");
        let mut args = vec!["-t", fs_type];
        if !options.is_empty() {
            args.extend(["-o", options.as_str()]);
        }
        args.extend([device, target.as_str()]);

        info!(device = %device, target = %target, "mounting volume");
        run_checked("mount", &args).await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<bool> {
        let target = target.display().to_string();
        let output = run("umount", &[target.as_str()]).await?;
        if output.success() {
            info!(target = %target, "unmounted volume");
            return Ok(true);
        }

        let combined = output.combined();
        if combined.contains("not mounted") || combined.contains("no mount point") {
            debug!(target = %target, "target is not a mount point");
            return Ok(false);
        }
        Err(command_error("umount", &[target.as_str()], &output))
    }

    async fn mount_points(&self, device: &str) -> Result<Vec<String>> {
        let table = fs::read_to_string(&self.mounts_file).await?;
        // multipath maps are listed as /dev/mapper/<name>, not /dev/dm-N
        let canonical = fs::canonicalize(device).await.ok();

        let mut points = Vec::new();
        for (source, target) in parse_mount_table(&table) {
            if source == device {
                points.push(target);
                continue;
            }
            if !source.starts_with("/dev/") {
                continue;
            }
            if let (Some(canonical), Ok(resolved)) = (&canonical, fs::canonicalize(&source).await) {
                if resolved == *canonical {
                    points.push(target);
                }
            }
        }
        Ok(points)
    }

    async fn device_exists(&self, device: &str) -> Result<bool> {
        match fs::metadata(device).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn resize(&self, device: &str, fs_type: &str, mount_point: Option<&Path>) -> Result<()> {
        info!(device = %device, fs_type = %fs_type, "resizing filesystem");
        match fs_type {
            "ext2" | "ext3" | "ext4" => {
                run_checked("resize2fs", &[device]).await?;
            }
            "xfs" => {
                let mount_point = mount_point.ok_or_else(|| {
                    Error::InvalidArgument("xfs can only be grown while mounted".into())
                })?;
                let mount_point = mount_point.display().to_string();
                run_checked("xfs_growfs", &[mount_point.as_str()]).await?;
            }
            other => {
                return Err(Error::Unimplemented(format!(
                    "resizing {} filesystems",
                    other
                )))
            }
        }
        Ok(())
    }
}
