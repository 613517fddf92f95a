//! Partition discovery on attached loop devices.
//!
//! The partition table is read with `sfdisk --json`, and each partition
//! node is identified with `blkid -p` (UUID, LABEL, TYPE). Both tools ship
//! with util-linux in the boot image.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use baas_shared::errors::{BaasError, BaasResult};
use serde::Deserialize;

use super::loop_device::LoopDevice;

/// Identifying attributes of one partition. Any field may be empty when
/// probing could not determine it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    /// 1-based partition number, the `N` in `/dev/loopKpN`
    pub index: usize,
    pub device: PathBuf,
    pub uuid: String,
    pub label: String,
    pub filesystem_type: String,
}

/// Partitions found on one loop device, in table order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionSet {
    pub loop_device: PathBuf,
    pub partitions: Vec<PartitionInfo>,
}

impl PartitionSet {
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Values reported for a partition node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeValues {
    pub uuid: String,
    pub label: String,
    pub filesystem_type: String,
}

/// Partition table and filesystem probing.
pub trait FilesystemProbe {
    /// Partition numbers in the table of `device`, or `None` when the
    /// device carries no partition table.
    fn partition_numbers(&self, device: &LoopDevice) -> BaasResult<Option<Vec<usize>>>;

    /// UUID, LABEL and TYPE of a partition node.
    fn probe_values(&self, node: &Path) -> BaasResult<ProbeValues>;
}

impl<T: FilesystemProbe + ?Sized> FilesystemProbe for &T {
    fn partition_numbers(&self, device: &LoopDevice) -> BaasResult<Option<Vec<usize>>> {
        (**self).partition_numbers(device)
    }

    fn probe_values(&self, node: &Path) -> BaasResult<ProbeValues> {
        (**self).probe_values(node)
    }
}

/// Resolves the partitions of attached loop devices.
pub struct PartitionProber<P> {
    probe: P,
    settle_delay: Duration,
}

impl<P: FilesystemProbe> PartitionProber<P> {
    pub fn new(probe: P, settle_delay: Duration) -> Self {
        Self {
            probe,
            settle_delay,
        }
    }

    /// Enumerate the partitions of `device`.
    ///
    /// A device without a partition table yields an empty set. Partition
    /// nodes that do not exist are skipped.
    pub fn probe(&self, device: &LoopDevice) -> BaasResult<PartitionSet> {
        let mut set = PartitionSet {
            loop_device: device.path().to_path_buf(),
            partitions: Vec::new(),
        };

        let Some(numbers) = self.probe.partition_numbers(device)? else {
            tracing::info!("No partition table on {}", device.path().display());
            return Ok(set);
        };
        tracing::info!(
            "{} partitions on {}",
            numbers.len(),
            device.path().display()
        );
        if numbers.is_empty() {
            return Ok(set);
        }

        // The kernel creates the pN nodes asynchronously after PARTSCAN.
        std::thread::sleep(self.settle_delay);

        for index in numbers {
            let node = device.partition_path(index);

            match std::fs::File::open(&node) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("Partition node {} not present, skipping", node.display());
                    continue;
                }
                Err(e) => {
                    return Err(BaasError::Resource(format!(
                        "Failed to open partition {}: {}",
                        node.display(),
                        e
                    )));
                }
            }

            let values = self.probe.probe_values(&node).unwrap_or_else(|e| {
                tracing::warn!("Probe of {} failed: {}", node.display(), e);
                ProbeValues::default()
            });

            tracing::info!(
                "Name={}, UUID={}, LABEL={}, TYPE={}",
                node.display(),
                values.uuid,
                values.label,
                values.filesystem_type
            );

            set.partitions.push(PartitionInfo {
                index,
                device: node,
                uuid: values.uuid,
                label: values.label,
                filesystem_type: values.filesystem_type,
            });
        }

        Ok(set)
    }
}

// ============================================================================
// util-linux backend
// ============================================================================

/// Probes with `sfdisk` and `blkid`.
#[derive(Clone, Debug, Default)]
pub struct BlkidProbe;

impl FilesystemProbe for BlkidProbe {
    fn partition_numbers(&self, device: &LoopDevice) -> BaasResult<Option<Vec<usize>>> {
        let output = Command::new("sfdisk")
            .arg("--json")
            .arg(device.path())
            .output()
            .map_err(|e| BaasError::Resource(format!("Failed to run sfdisk: {}", e)))?;

        if !output.status.success() {
            return sfdisk_failure(device.path(), &String::from_utf8_lossy(&output.stderr));
        }

        parse_sfdisk_json(device.path(), &output.stdout).map(Some)
    }

    fn probe_values(&self, node: &Path) -> BaasResult<ProbeValues> {
        let output = Command::new("blkid")
            .args(["-p", "-o", "export"])
            .arg(node)
            .output()
            .map_err(|e| BaasError::Resource(format!("Failed to run blkid: {}", e)))?;

        match output.status.code() {
            Some(0) => Ok(parse_blkid_export(&String::from_utf8_lossy(&output.stdout))),
            // 2: nothing recognised on the partition
            Some(2) => Ok(ProbeValues::default()),
            _ => Err(BaasError::Resource(format!(
                "blkid {} failed: {}",
                node.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

#[derive(Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Deserialize)]
struct SfdiskTable {
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Deserialize)]
struct SfdiskPartition {
    node: String,
}

/// Partition numbers from `sfdisk --json` output, in table order.
fn parse_sfdisk_json(device: &Path, json: &[u8]) -> BaasResult<Vec<usize>> {
    let dump: SfdiskDump = serde_json::from_slice(json).map_err(|e| {
        BaasError::Resource(format!(
            "Unreadable sfdisk output for {}: {}",
            device.display(),
            e
        ))
    })?;

    let prefix = format!("{}p", device.display());
    dump.partitiontable
        .partitions
        .iter()
        .map(|p| {
            p.node
                .strip_prefix(&prefix)
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| {
                    BaasError::Resource(format!(
                        "Unexpected partition node {} on {}",
                        p.node,
                        device.display()
                    ))
                })
        })
        .collect()
}

/// Classify a failed `sfdisk --json` run. Only a device without a
/// recognised table is "no partitions"; anything else (EACCES, EIO, EBUSY)
/// is fatal.
fn sfdisk_failure(device: &Path, stderr: &str) -> BaasResult<Option<Vec<usize>>> {
    let stderr = stderr.trim();
    if stderr.contains("does not contain a recognized partition table") {
        tracing::debug!("sfdisk on {}: {}", device.display(), stderr);
        return Ok(None);
    }
    Err(BaasError::Resource(format!(
        "sfdisk {} failed: {}",
        device.display(),
        stderr
    )))
}

/// Parse `blkid -o export` output (`KEY=value` lines).
fn parse_blkid_export(text: &str) -> ProbeValues {
    let mut values = ProbeValues::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "UUID" => values.uuid = value.to_string(),
            "LABEL" => values.label = value.to_string(),
            "TYPE" => values.filesystem_type = value.to_string(),
            _ => {}
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::loop_device::LoopFlags;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Probe with a canned table that records which nodes it was asked about.
    struct FakeProbe {
        numbers: Option<Vec<usize>>,
        probed: RefCell<Vec<PathBuf>>,
    }

    impl FakeProbe {
        fn new(numbers: Option<Vec<usize>>) -> Self {
            Self {
                numbers,
                probed: RefCell::new(Vec::new()),
            }
        }
    }

    impl FilesystemProbe for FakeProbe {
        fn partition_numbers(&self, _device: &LoopDevice) -> BaasResult<Option<Vec<usize>>> {
            Ok(self.numbers.clone())
        }

        fn probe_values(&self, node: &Path) -> BaasResult<ProbeValues> {
            self.probed.borrow_mut().push(node.to_path_buf());
            if node.to_string_lossy().ends_with("p3") {
                return Err(BaasError::Resource("probe failed".to_string()));
            }
            Ok(ProbeValues {
                uuid: format!("uuid-{}", node.display()),
                label: "root".to_string(),
                filesystem_type: "ext4".to_string(),
            })
        }
    }

    /// A fake `/dev/loop7` inside `dir`, with partition nodes for `present`.
    fn fake_device(dir: &TempDir, present: &[usize]) -> LoopDevice {
        let path = dir.path().join("loop7");
        let file = std::fs::File::create(&path).unwrap();
        for i in present {
            std::fs::File::create(dir.path().join(format!("loop7p{}", i))).unwrap();
        }
        LoopDevice::new(path, file, LoopFlags::PARTSCAN)
    }

    #[test]
    fn test_no_table_is_empty_set() {
        let dir = TempDir::new().unwrap();
        let device = fake_device(&dir, &[]);
        let prober = PartitionProber::new(FakeProbe::new(None), Duration::ZERO);

        let set = prober.probe(&device).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.loop_device, device.path());
    }

    #[test]
    fn test_partitions_resolved_by_suffix() {
        let dir = TempDir::new().unwrap();
        let device = fake_device(&dir, &[1, 2]);
        let prober = PartitionProber::new(FakeProbe::new(Some(vec![1, 2])), Duration::ZERO);

        let set = prober.probe(&device).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.partitions[0].index, 1);
        assert_eq!(set.partitions[0].device, dir.path().join("loop7p1"));
        assert_eq!(set.partitions[1].device, dir.path().join("loop7p2"));
        assert_eq!(set.partitions[1].filesystem_type, "ext4");
    }

    #[test]
    fn test_absent_node_is_skipped() {
        let dir = TempDir::new().unwrap();
        let device = fake_device(&dir, &[1, 3]);
        let probe = FakeProbe::new(Some(vec![1, 2, 3]));
        let prober = PartitionProber::new(probe, Duration::ZERO);

        let set = prober.probe(&device).unwrap();
        let indices: Vec<_> = set.partitions.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(prober.probe.probed.borrow().len(), 2);
    }

    #[test]
    fn test_failed_probe_records_empty_values() {
        let dir = TempDir::new().unwrap();
        let device = fake_device(&dir, &[3]);
        let prober = PartitionProber::new(FakeProbe::new(Some(vec![3])), Duration::ZERO);

        let set = prober.probe(&device).unwrap();
        assert_eq!(set.partitions[0].index, 3);
        assert_eq!(set.partitions[0].uuid, "");
        assert_eq!(set.partitions[0].filesystem_type, "");
    }

    #[test]
    fn test_parse_sfdisk_json() {
        let json = br#"{
            "partitiontable": {
                "label": "gpt",
                "device": "/dev/loop0",
                "unit": "sectors",
                "partitions": [
                    {"node": "/dev/loop0p1", "start": 2048, "size": 1048576, "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"},
                    {"node": "/dev/loop0p2", "start": 1050624, "size": 8386527, "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"}
                ]
            }
        }"#;

        assert_eq!(
            parse_sfdisk_json(Path::new("/dev/loop0"), json).unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_parse_sfdisk_json_rejects_foreign_nodes() {
        let json = br#"{"partitiontable": {"partitions": [{"node": "/dev/sda1"}]}}"#;
        assert!(parse_sfdisk_json(Path::new("/dev/loop0"), json).is_err());
    }

    #[test]
    fn test_sfdisk_without_table_is_no_partitions() {
        let result = sfdisk_failure(
            Path::new("/dev/loop0"),
            "sfdisk: /dev/loop0: does not contain a recognized partition table\n",
        );
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn test_sfdisk_other_failures_are_resource_errors() {
        for stderr in [
            "sfdisk: cannot open /dev/loop0: Permission denied",
            "sfdisk: cannot open /dev/loop0: Device or resource busy",
            "sfdisk: /dev/loop0: read failed: Input/output error",
            "",
        ] {
            let err = sfdisk_failure(Path::new("/dev/loop0"), stderr).unwrap_err();
            assert!(matches!(err, BaasError::Resource(_)), "stderr {:?}", stderr);
        }
    }

    #[test]
    fn test_parse_blkid_export() {
        let values = parse_blkid_export(
            "DEVNAME=/dev/loop0p2\nUUID=0b8e-11\nLABEL=rootfs\nTYPE=ext4\nUSAGE=filesystem\n",
        );
        assert_eq!(
            values,
            ProbeValues {
                uuid: "0b8e-11".to_string(),
                label: "rootfs".to_string(),
                filesystem_type: "ext4".to_string(),
            }
        );
        assert_eq!(parse_blkid_export(""), ProbeValues::default());
    }
}
