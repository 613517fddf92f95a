//! Boot manifest schema.
//!
//! The control server answers the manifest request with a JSON document:
//!
//! ```text
//! {
//!   "Name": "...", "Username": "...", "UUID": "...",
//!   "Images": [
//!     { "Image": { "Name", "UUID", "Username", "DiskCompressionStrategy",
//!                  "ImageFileType", "type", "Checksum", "Filesystem" },
//!       "Version": 1650000000,
//!       "Update": true }
//!   ]
//! }
//! ```
//!
//! Decoding is strict per document and tolerant per field: the document must
//! be a JSON object with an `Images` array, but any individual field that is
//! absent or carries the wrong JSON type takes its default (`""`, `0` or
//! `false`).

use std::collections::HashSet;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::errors::{BaasError, BaasResult};

/// A boot setup: the ordered list of images to attach.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageManifest {
    pub setup_name: String,
    pub setup_uuid: String,
    pub owner_username: String,
    /// Processed strictly in this order.
    pub images: Vec<FrozenImageRef>,
}

/// An image pinned to one version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrozenImageRef {
    pub image: ImageDescriptor,
    pub update: bool,
}

/// Metadata of one disk image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub name: String,
    pub uuid: String,
    pub username: String,
    pub compression_strategy: String,
    pub file_type: String,
    pub kind: String,
    pub checksum: String,
    pub filesystem: String,
    /// Always the enclosing ref's `Version`.
    pub version: u64,
}

impl ImageDescriptor {
    /// Path of this image version on the image server.
    pub fn download_path(&self) -> String {
        format!("/image/{}/{}", self.uuid, self.version)
    }

    /// File name used for the local copy of this image version.
    pub fn scratch_file_name(&self) -> String {
        format!("{}-{}.img", self.uuid, self.version)
    }
}

impl ImageManifest {
    /// Decode a manifest from the raw response body.
    ///
    /// Fails without producing a partial manifest when the body is not JSON,
    /// is not an object, or lacks the `Images` array.
    pub fn from_slice(bytes: &[u8]) -> BaasResult<Self> {
        let document: Value = serde_json::from_slice(bytes)
            .map_err(|e| BaasError::Decode(format!("invalid manifest: {}", e)))?;

        // Derived Deserialize also accepts sequences for structs, so the
        // object shape is checked on the untyped value first.
        let Value::Object(fields) = &document else {
            return Err(BaasError::Decode(
                "invalid manifest: document is not a JSON object".to_string(),
            ));
        };
        if let Some(Value::Array(images)) = fields.get("Images") {
            if let Some(pos) = images.iter().position(|entry| !entry.is_object()) {
                return Err(BaasError::Decode(format!(
                    "invalid manifest: Images[{}] is not a JSON object",
                    pos
                )));
            }
        }

        let raw: RawSetup = serde_json::from_value(document)
            .map_err(|e| BaasError::Decode(format!("invalid manifest: {}", e)))?;
        Ok(raw.into())
    }

    /// Reject entries that cannot be stored safely: a UUID outside
    /// `[A-Za-z0-9-]`, or the same UUID and version listed twice.
    ///
    /// The UUID names the local scratch file and is part of the download
    /// URL, so it must never carry path separators.
    pub fn check_entries(&self) -> BaasResult<()> {
        let mut seen = HashSet::with_capacity(self.images.len());
        for (pos, entry) in self.images.iter().enumerate() {
            let image = &entry.image;
            if !is_valid_uuid(&image.uuid) {
                return Err(BaasError::Decode(format!(
                    "Images[{}]: invalid image UUID {:?}",
                    pos, image.uuid
                )));
            }
            if !seen.insert((image.uuid.as_str(), image.version)) {
                return Err(BaasError::Decode(format!(
                    "Images[{}]: image {} version {} listed twice",
                    pos, image.uuid, image.version
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

fn is_valid_uuid(uuid: &str) -> bool {
    !uuid.is_empty() && uuid.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Deserialize)]
struct RawSetup {
    #[serde(rename = "Name", default, deserialize_with = "lenient_string")]
    name: String,
    #[serde(rename = "Username", default, deserialize_with = "lenient_string")]
    username: String,
    #[serde(rename = "UUID", default, deserialize_with = "lenient_string")]
    uuid: String,
    #[serde(rename = "Images")]
    images: Vec<RawFrozenRef>,
}

#[derive(Deserialize)]
struct RawFrozenRef {
    #[serde(rename = "Image", default, deserialize_with = "lenient_image")]
    image: Option<RawImage>,
    #[serde(rename = "Version", default, deserialize_with = "lenient_u64")]
    version: u64,
    #[serde(rename = "Update", default, deserialize_with = "lenient_bool")]
    update: bool,
}

// Unknown keys (including any nested version data) are ignored.
#[derive(Default, Deserialize)]
struct RawImage {
    #[serde(rename = "Name", default, deserialize_with = "lenient_string")]
    name: String,
    #[serde(rename = "UUID", default, deserialize_with = "lenient_string")]
    uuid: String,
    #[serde(rename = "Username", default, deserialize_with = "lenient_string")]
    username: String,
    #[serde(
        rename = "DiskCompressionStrategy",
        default,
        deserialize_with = "lenient_string"
    )]
    compression_strategy: String,
    #[serde(rename = "ImageFileType", default, deserialize_with = "lenient_string")]
    file_type: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    kind: String,
    #[serde(rename = "Checksum", default, deserialize_with = "lenient_string")]
    checksum: String,
    #[serde(rename = "Filesystem", default, deserialize_with = "lenient_string")]
    filesystem: String,
}

impl From<RawSetup> for ImageManifest {
    fn from(raw: RawSetup) -> Self {
        Self {
            setup_name: raw.name,
            setup_uuid: raw.uuid,
            owner_username: raw.username,
            images: raw.images.into_iter().map(FrozenImageRef::from).collect(),
        }
    }
}

impl From<RawFrozenRef> for FrozenImageRef {
    fn from(raw: RawFrozenRef) -> Self {
        let image = raw.image.unwrap_or_default();
        Self {
            image: ImageDescriptor {
                name: image.name,
                uuid: image.uuid,
                username: image.username,
                compression_strategy: image.compression_strategy,
                file_type: image.file_type,
                kind: image.kind,
                checksum: image.checksum,
                filesystem: image.filesystem,
                version: raw.version,
            },
            update: raw.update,
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        _ => String::new(),
    })
}

fn lenient_image<'de, D>(deserializer: D) -> Result<Option<RawImage>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        _ => 0,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().is_some_and(|v| v != 0),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_path_uses_uuid_and_version() {
        let image = ImageDescriptor {
            uuid: "abc".to_string(),
            version: 7,
            ..Default::default()
        };
        assert_eq!(image.download_path(), "/image/abc/7");
        assert_eq!(image.scratch_file_name(), "abc-7.img");
    }

    #[test]
    fn test_wrong_typed_fields_take_defaults() {
        let manifest = ImageManifest::from_slice(
            br#"{"Name": 5, "Images": [{"Image": {"Name": null, "UUID": ["x"]}, "Version": "3", "Update": 1}]}"#,
        )
        .unwrap();

        assert_eq!(manifest.setup_name, "");
        let entry = &manifest.images[0];
        assert_eq!(entry.image.name, "");
        assert_eq!(entry.image.uuid, "");
        assert_eq!(entry.image.version, 0);
        assert!(entry.update);
    }

    #[test]
    fn test_negative_version_is_zero() {
        let manifest =
            ImageManifest::from_slice(br#"{"Images": [{"Image": {}, "Version": -4}]}"#).unwrap();
        assert_eq!(manifest.images[0].image.version, 0);
    }

    #[test]
    fn test_non_object_image_yields_defaults() {
        let manifest =
            ImageManifest::from_slice(br#"{"Images": [{"Image": "ubuntu", "Version": 9}]}"#)
                .unwrap();
        assert_eq!(
            manifest.images[0].image,
            ImageDescriptor {
                version: 9,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_missing_image_object_yields_defaults() {
        let manifest = ImageManifest::from_slice(br#"{"Images": [{"Version": 2}]}"#).unwrap();
        assert_eq!(manifest.images[0].image.uuid, "");
        assert_eq!(manifest.images[0].image.version, 2);
        assert!(!manifest.images[0].update);
    }

    fn manifest_with(entries: &[(&str, u64)]) -> ImageManifest {
        ImageManifest {
            images: entries
                .iter()
                .map(|(uuid, version)| FrozenImageRef {
                    image: ImageDescriptor {
                        uuid: uuid.to_string(),
                        version: *version,
                        ..Default::default()
                    },
                    update: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_check_entries_accepts_uuids_and_distinct_versions() {
        let manifest = manifest_with(&[
            ("3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b", 1),
            ("3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b", 2),
            ("DATA01", 1),
        ]);
        manifest.check_entries().unwrap();
    }

    #[test]
    fn test_check_entries_rejects_path_like_uuids() {
        for uuid in ["", "../escaped", "/etc/passwd", "a/b", "x.img", "a b", "a?b=c"] {
            let err = manifest_with(&[(uuid, 1)]).check_entries().unwrap_err();
            assert!(matches!(err, BaasError::Decode(_)), "uuid {:?}", uuid);
        }
    }

    #[test]
    fn test_check_entries_rejects_duplicate_versions() {
        let err = manifest_with(&[("abc", 1), ("def", 1), ("abc", 1)])
            .check_entries()
            .unwrap_err();
        assert!(matches!(err, BaasError::Decode(ref m) if m.contains("Images[2]")));
    }
}
