//! # OSSB build core
//!
//! The daemonless parts of an OCI image builder that have no business
//! talking to a registry or a process supervisor: detecting filesystem
//! changes between two trees, packing those changes into OCI layer blobs,
//! and translating a Dockerfile-like instruction sequence plus a layer list
//! into OCI image config/manifest/index documents.
//!
//! Three components, used in this order by a caller:
//!
//! - [`change`] — the Change Detector & Applier: `detect_changes`/
//!   `apply_changes` between directory trees.
//! - [`layer`] — the Layer Engine: [`layer::LayerEngine`] turns a
//!   [`change::FileChange`] list into a [`layer::Layer`] blob and back.
//! - [`manifest`] — the Manifest Generator: [`manifest::ManifestGenerator`]
//!   synthesizes an [`manifest::ImageConfig`] from instructions, attaches
//!   layers to it, and emits/digests/validates the final OCI documents.
//!
//! This crate has no CLI, no network I/O, and no on-disk persistence of its
//! own; it is a library dependency for the builder's outer layers.

pub mod change;
pub mod content;
pub mod error;
pub mod layer;
pub mod manifest;

pub use cap_std_ext::cap_std;
pub use oci_spec;

pub use change::{apply_changes, detect_changes, ChangeType, FileChange};
pub use content::ByteSource;
pub use error::{CoreError, Result};
pub use layer::{Compression, Layer, LayerConfig, LayerEngine};
pub use manifest::{ConfigOptions, ImageConfig, Instruction, ManifestGenerator, Platform, PlatformManifest};
