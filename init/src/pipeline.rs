//! Boot image pipeline.
//!
//! Fetches the manifest, then for every entry in manifest order:
//!
//! ```text
//! download (+ decompress) -> scratch file
//!   -> attach to free /dev/loopN (PARTSCAN)
//!   -> probe /dev/loopNpM
//!   -> mount under <mount_root>/loopNpM
//! ```
//!
//! Entries are processed strictly one after another and the first failure
//! aborts the run. Nothing already mounted is rolled back.

use std::fs::File;
use std::path::{Path, PathBuf};

use baas_shared::errors::{BaasError, BaasResult};
use baas_shared::manifest::{FrozenImageRef, ImageDescriptor, ImageManifest};

use crate::config::InitConfig;
use crate::fetch::{AssetFetch, HttpFetcher};
use crate::storage::loop_device::LoopFlags;
use crate::storage::{
    BlkidProbe, Compression, DecodingWriter, FilesystemProbe, LoopAttach, LoopDeviceAllocator,
    MountOrchestrator, MountRecord, Mounter, PartitionProber, SyscallMounter,
};

/// Outcome of one manifest entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachedImage {
    pub uuid: String,
    pub version: u64,
    pub backing_file: PathBuf,
    pub loop_device: PathBuf,
    pub loop_flags: LoopFlags,
    pub mounts: Vec<MountRecord>,
}

/// Pipeline wired to the real kernel and network.
pub type SystemPipeline =
    BootPipeline<HttpFetcher, LoopDeviceAllocator, BlkidProbe, SyscallMounter>;

pub struct BootPipeline<F, L, P, M> {
    fetcher: F,
    loops: L,
    prober: PartitionProber<P>,
    mounts: MountOrchestrator<M>,
    manifest_url: String,
    image_server: String,
    scratch_dir: PathBuf,
}

impl SystemPipeline {
    pub fn from_config(config: &InitConfig) -> Self {
        BootPipeline::new(
            config,
            HttpFetcher::new(config.origin.clone(), config.http_timeout()),
            LoopDeviceAllocator::new(&config.loop_control),
            BlkidProbe,
            SyscallMounter,
        )
    }
}

impl<F, L, P, M> BootPipeline<F, L, P, M>
where
    F: AssetFetch,
    L: LoopAttach,
    P: FilesystemProbe,
    M: Mounter,
{
    pub fn new(config: &InitConfig, fetcher: F, loops: L, probe: P, mounter: M) -> Self {
        Self {
            fetcher,
            loops,
            prober: PartitionProber::new(probe, config.settle_delay()),
            mounts: MountOrchestrator::new(mounter, &config.mount_root),
            manifest_url: config.manifest_url.clone(),
            image_server: config.image_server.trim_end_matches('/').to_string(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }

    /// Run the pipeline to completion.
    ///
    /// Consumes the pipeline: the fetch client lives exactly as long as
    /// the run.
    pub fn run(self) -> BaasResult<Vec<AttachedImage>> {
        tracing::info!("Fetching manifest from {}", self.manifest_url);
        let body = self.fetcher.fetch_to_vec(&self.manifest_url)?;
        let manifest = ImageManifest::from_slice(&body)?;
        manifest.check_entries()?;

        tracing::info!(
            "Setup '{}' ({}) for {}: {} image(s)",
            manifest.setup_name,
            manifest.setup_uuid,
            manifest.owner_username,
            manifest.len()
        );

        let mut attached = Vec::with_capacity(manifest.len());
        for (position, entry) in manifest.images.iter().enumerate() {
            tracing::info!(
                "[{}/{}] image '{}' {} v{}",
                position + 1,
                manifest.len(),
                entry.image.name,
                entry.image.uuid,
                entry.image.version
            );
            attached.push(self.process_entry(entry)?);
        }

        tracing::info!("All {} image(s) attached and mounted", attached.len());
        Ok(attached)
    }

    fn process_entry(&self, entry: &FrozenImageRef) -> BaasResult<AttachedImage> {
        let image = &entry.image;

        if image.file_type.eq_ignore_ascii_case("qcow2") {
            return Err(BaasError::Decode(format!(
                "image {} is qcow2 and cannot be attached to a loop device",
                image.uuid
            )));
        }
        let compression = Compression::from_strategy(&image.compression_strategy)?;

        let backing_file = self.scratch_dir.join(image.scratch_file_name());
        self.download(image, compression, &backing_file)?;

        // Handle dropped at the end of this entry, closing the device fd
        let device = self.loops.attach_free(&backing_file)?;
        let partitions = self.prober.probe(&device)?;
        let mounts = self.mounts.mount_all(&partitions)?;

        Ok(AttachedImage {
            uuid: image.uuid.clone(),
            version: image.version,
            backing_file,
            loop_device: device.path().to_path_buf(),
            loop_flags: device.flags(),
            mounts,
        })
    }

    fn download(
        &self,
        image: &ImageDescriptor,
        compression: Compression,
        target: &Path,
    ) -> BaasResult<()> {
        let url = format!("{}{}", self.image_server, image.download_path());
        tracing::info!(
            "Downloading {} → {} ({:?})",
            url,
            target.display(),
            compression
        );

        let file = File::create(target).map_err(|e| {
            BaasError::Resource(format!("Failed to create {}: {}", target.display(), e))
        })?;
        let mut writer = DecodingWriter::new(compression, file).map_err(|e| {
            BaasError::Decode(format!(
                "Failed to set up {:?} decoder: {}",
                compression, e
            ))
        })?;

        let received = self.fetcher.fetch(&url, &mut writer)?;

        let file = writer.finish().map_err(|e| {
            BaasError::Decode(format!("Failed to finish decoding {}: {}", url, e))
        })?;
        file.sync_all().map_err(|e| {
            BaasError::Resource(format!("Failed to sync {}: {}", target.display(), e))
        })?;

        tracing::info!("Received {} bytes for {}", received, image.uuid);
        Ok(())
    }
}
