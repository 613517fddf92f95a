//! Storage operations (image attachment and mounting).
//!
//! - Loop devices: bind downloaded images to `/dev/loopN`
//! - Partitions: discover `/dev/loopNpM` and their filesystems
//! - Mounts: mount discovered partitions under the mount root

pub mod decompress;
pub mod loop_device;
pub mod mount;
pub mod partition;

pub use decompress::{Compression, DecodingWriter};
pub use loop_device::{LoopAttach, LoopDevice, LoopDeviceAllocator};
pub use mount::{MountOrchestrator, MountRecord, Mounter, SyscallMounter};
pub use partition::{BlkidProbe, FilesystemProbe, PartitionProber, PartitionSet};
