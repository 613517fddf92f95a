//! BAAS Shared - common code for the boot supervisor and the control server
//!
//! This crate contains the manifest schema, the error taxonomy and the
//! constants both sides of the boot protocol agree on.

pub mod constants;
pub mod errors;
pub mod manifest;

pub use errors::{BaasError, BaasResult};
pub use manifest::{FrozenImageRef, ImageDescriptor, ImageManifest};
