//! Partition mounting.
//!
//! Every discovered partition is mounted at `<mount_root>/<loopN>p<i>` with
//! a fixed, restrictive flag set. Teardown force-unmounts and removes the
//! mount points and may be repeated safely.

use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use baas_shared::errors::{BaasError, BaasResult};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};

use super::partition::PartitionSet;

/// Flags used for every partition mount.
pub fn mount_flags() -> MsFlags {
    MsFlags::MS_NOATIME
        | MsFlags::MS_NODEV
        | MsFlags::MS_NOEXEC
        | MsFlags::MS_NOSUID
        | MsFlags::MS_SILENT
}

/// Filesystem-specific mount data.
pub fn mount_options(filesystem: &str) -> Option<&'static str> {
    match filesystem {
        "ext4" => Some("journal_checksum,errors=remount-ro,data=ordered"),
        "ext3" => Some("errors=remount-ro,data=ordered"),
        "ext2" => Some("errors=remount-ro"),
        _ => None,
    }
}

fn is_mountable(filesystem: &str) -> bool {
    !matches!(filesystem, "" | "swap")
}

/// One mounted partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRecord {
    /// Partition number the record belongs to
    pub index: usize,
    pub mount_point: PathBuf,
    pub source_device: PathBuf,
    pub filesystem_type: String,
}

/// mount(2)/umount2(2).
pub trait Mounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    fn unmount(&self, target: &Path, flags: MntFlags) -> nix::Result<()>;
}

impl<T: Mounter + ?Sized> Mounter for &T {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        (**self).mount(source, target, fstype, flags, data)
    }

    fn unmount(&self, target: &Path, flags: MntFlags) -> nix::Result<()> {
        (**self).unmount(target, flags)
    }
}

/// Mounts through the kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyscallMounter;

impl Mounter for SyscallMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        nix::mount::mount(Some(source), target, Some(fstype), flags, data)
    }

    fn unmount(&self, target: &Path, flags: MntFlags) -> nix::Result<()> {
        nix::mount::umount2(target, flags)
    }
}

/// Creates mount points and mounts partitions under one root.
pub struct MountOrchestrator<M> {
    mounter: M,
    root: PathBuf,
}

impl<M: Mounter> MountOrchestrator<M> {
    pub fn new(mounter: M, root: impl Into<PathBuf>) -> Self {
        Self {
            mounter,
            root: root.into(),
        }
    }

    /// Mount point of partition `index` of `loop_device`.
    pub fn mount_point(&self, loop_device: &Path, index: usize) -> PathBuf {
        let name = loop_device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.join(format!("{}p{}", name, index))
    }

    /// Mount every partition in `set`. The first mount failure aborts.
    pub fn mount_all(&self, set: &PartitionSet) -> BaasResult<Vec<MountRecord>> {
        let mut records = Vec::with_capacity(set.len());

        for partition in &set.partitions {
            if !is_mountable(&partition.filesystem_type) {
                tracing::warn!(
                    "Skipping {}: no mountable filesystem (type '{}')",
                    partition.device.display(),
                    partition.filesystem_type
                );
                continue;
            }

            let mount_point = self.mount_point(&set.loop_device, partition.index);
            create_mount_point(&mount_point)?;

            let fstype = partition.filesystem_type.as_str();
            let data = mount_options(fstype);
            tracing::info!(
                "Mounting {} → {} (type={}, options={})",
                partition.device.display(),
                mount_point.display(),
                fstype,
                data.unwrap_or("-")
            );

            self.mounter
                .mount(&partition.device, &mount_point, fstype, mount_flags(), data)
                .map_err(|e| {
                    BaasError::Mount(format!(
                        "Failed to mount {} to {}: {}",
                        partition.device.display(),
                        mount_point.display(),
                        e
                    ))
                })?;

            records.push(MountRecord {
                index: partition.index,
                mount_point,
                source_device: partition.device.clone(),
                filesystem_type: partition.filesystem_type.clone(),
            });
        }

        Ok(records)
    }

    /// Force-unmount and remove every mount point in `records`.
    ///
    /// Mount points that are already unmounted or already removed are
    /// skipped, so calling this twice is harmless.
    pub fn unmount_all(&self, records: &[MountRecord]) -> BaasResult<()> {
        for record in records {
            match self.mounter.unmount(&record.mount_point, MntFlags::MNT_FORCE) {
                Ok(()) => {
                    tracing::info!("Unmounted {}", record.mount_point.display());
                }
                Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                    tracing::debug!("{} not mounted", record.mount_point.display());
                }
                Err(e) => {
                    return Err(BaasError::Mount(format!(
                        "Failed to unmount {}: {}",
                        record.mount_point.display(),
                        e
                    )));
                }
            }

            match std::fs::remove_dir(&record.mount_point) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        "Failed to remove mount point {}: {}",
                        record.mount_point.display(),
                        e
                    );
                }
            }
        }
        Ok(())
    }
}

fn create_mount_point(path: &Path) -> BaasResult<()> {
    match DirBuilder::new().recursive(false).mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // Mount root itself is missing
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(path)
                .map_err(|e| mount_point_error(path, e))
        }
        Err(e) => Err(mount_point_error(path, e)),
    }
}

fn mount_point_error(path: &Path, e: std::io::Error) -> BaasError {
    BaasError::Mount(format!(
        "Failed to create mount point {}: {}",
        path.display(),
        e
    ))
}
