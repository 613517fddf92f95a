//! Loop device allocation and attachment.
//!
//! Binds a backing file to a free `/dev/loopN` and turns on partition
//! scanning so the kernel exposes `/dev/loopNpM` for every partition in the
//! image.
//!
//! Sequence for one image:
//! ```text
//! open /dev/loop-control ── LOOP_CTL_GET_FREE ──> N
//! open /dev/loopN, open backing file
//! LOOP_SET_FD(backing)                           (backing fd closed here)
//! LOOP_GET_STATUS64 ── flags |= PARTSCAN ──> LOOP_SET_STATUS64
//! ```

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use baas_shared::constants::loop_device;
use baas_shared::errors::{BaasError, BaasResult};
use bitflags::bitflags;
use nix::libc::c_int;

// linux/loop.h
const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_SET_STATUS64: u32 = 0x4C04;
const LOOP_GET_STATUS64: u32 = 0x4C05;
const LOOP_CTL_GET_FREE: u32 = 0x4C82;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64`
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

nix::ioctl_none_bad!(loop_ctl_get_free, LOOP_CTL_GET_FREE);
nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
nix::ioctl_read_bad!(loop_get_status64, LOOP_GET_STATUS64, LoopInfo64);
nix::ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);

bitflags! {
    /// `LO_FLAGS_*`
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LoopFlags: u32 {
        const READ_ONLY = 1;
        const AUTOCLEAR = 4;
        const PARTSCAN = 8;
        const DIRECT_IO = 16;
    }
}

impl LoopFlags {
    /// Flags to write back after attaching: the current flags with
    /// partition scanning turned on. Nothing is cleared.
    pub fn with_partition_scan(self) -> Self {
        self | LoopFlags::PARTSCAN
    }
}

/// An attached loop device.
///
/// Holds the open device descriptor; dropping the handle closes it. The
/// backing file descriptor is already closed by the time a handle exists.
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    // Held open for the lifetime of the handle
    _device: File,
    flags: LoopFlags,
}

impl LoopDevice {
    pub(crate) fn new(path: PathBuf, device: File, flags: LoopFlags) -> Self {
        Self {
            path,
            _device: device,
            flags,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> LoopFlags {
        self.flags
    }

    /// Node of partition `index` (1-based): `/dev/loopK` -> `/dev/loopKp{index}`.
    pub fn partition_path(&self, index: usize) -> PathBuf {
        partition_path(&self.path, index)
    }
}

/// Node of partition `index` (1-based) on `device`.
pub fn partition_path(device: &Path, index: usize) -> PathBuf {
    let mut name = device.as_os_str().to_owned();
    name.push(format!("p{}", index));
    PathBuf::from(name)
}

/// Loop device operations used by the boot pipeline.
pub trait LoopAttach {
    /// Find a free loop device and return its node path.
    fn allocate_free_device(&self) -> BaasResult<PathBuf>;

    /// Bind `backing` to `device` with partition scanning enabled.
    fn attach(&self, device: &Path, backing: &Path) -> BaasResult<LoopDevice>;

    /// Allocate a free device and attach `backing` to it.
    fn attach_free(&self, backing: &Path) -> BaasResult<LoopDevice> {
        let device = self.allocate_free_device()?;
        self.attach(&device, backing)
    }
}

impl<T: LoopAttach + ?Sized> LoopAttach for &T {
    fn allocate_free_device(&self) -> BaasResult<PathBuf> {
        (**self).allocate_free_device()
    }

    fn attach(&self, device: &Path, backing: &Path) -> BaasResult<LoopDevice> {
        (**self).attach(device, backing)
    }
}

/// Kernel loop driver, reached through the loop control node.
pub struct LoopDeviceAllocator {
    control: PathBuf,
}

impl LoopDeviceAllocator {
    pub fn new(control: impl Into<PathBuf>) -> Self {
        Self {
            control: control.into(),
        }
    }
}

impl Default for LoopDeviceAllocator {
    fn default() -> Self {
        Self::new(loop_device::CONTROL)
    }
}

impl LoopAttach for LoopDeviceAllocator {
    fn allocate_free_device(&self) -> BaasResult<PathBuf> {
        let control = open_rw(&self.control)?;

        // SAFETY: LOOP_CTL_GET_FREE takes no argument.
        let number = unsafe { loop_ctl_get_free(control.as_raw_fd()) }.map_err(|e| {
            BaasError::Resource(format!(
                "LOOP_CTL_GET_FREE on {}: {}",
                self.control.display(),
                e
            ))
        })?;

        let device = PathBuf::from(format!("{}{}", loop_device::DEVICE_PREFIX, number));
        tracing::info!("Allocated free loop device {}", device.display());
        Ok(device)
    }

    fn attach(&self, device: &Path, backing: &Path) -> BaasResult<LoopDevice> {
        tracing::info!(
            "Attaching {} → {}",
            backing.display(),
            device.display()
        );

        let device_file = open_rw(device)?;

        // Scoped so the backing descriptor is closed right after binding,
        // whether or not the bind succeeded.
        {
            let backing_file = open_rw(backing)?;
            // SAFETY: both descriptors are open for the duration of the call.
            unsafe {
                loop_set_fd(
                    device_file.as_raw_fd(),
                    backing_file.as_raw_fd() as c_int,
                )
            }
            .map_err(|e| {
                BaasError::Resource(format!(
                    "LOOP_SET_FD {} on {}: {}",
                    backing.display(),
                    device.display(),
                    e
                ))
            })?;
        }

        let mut info = LoopInfo64::default();
        // SAFETY: `info` is a valid, writable loop_info64.
        unsafe { loop_get_status64(device_file.as_raw_fd(), &mut info) }.map_err(|e| {
            BaasError::Resource(format!("LOOP_GET_STATUS64 on {}: {}", device.display(), e))
        })?;

        let flags = LoopFlags::from_bits_retain(info.lo_flags).with_partition_scan();
        info.lo_flags = flags.bits();

        // SAFETY: `info` was filled in by the kernel above.
        unsafe { loop_set_status64(device_file.as_raw_fd(), &info) }.map_err(|e| {
            BaasError::Resource(format!("LOOP_SET_STATUS64 on {}: {}", device.display(), e))
        })?;

        tracing::debug!("{} flags now {:?}", device.display(), flags);
        Ok(LoopDevice::new(device.to_path_buf(), device_file, flags))
    }
}

fn open_rw(path: &Path) -> BaasResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| BaasError::Resource(format!("Failed to open {}: {}", path.display(), e)))
}
