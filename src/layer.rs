//! The Layer Engine: packs a [`FileChange`](crate::change::FileChange) list
//! into an OCI layer blob, and the inverse operation of materializing a layer
//! back onto a directory tree.
//!
//! The shape of this module follows the teacher crate's blob-writing path
//! (tee a SHA-256 hasher around a compressor, commit the result, hand back a
//! digest) generalized over a selectable compression scheme and given a
//! reverse (`extract_layer`) direction the teacher never needed, since
//! `ocidir` only ever writes layers it is handed from the caller's own tar
//! stream.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, DirBuilderExt, OpenOptionsExt};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use fs_set_times::{SetTimes, SystemTimeSpec};

use crate::change::{ensure_parent, ignore_already_exists, remove_path, ChangeType, FileChange};
use crate::error::{CoreError, Result};

/// Layer media types this engine recognizes as valid filesystem layers.
pub const LAYER_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.oci.image.layer.v1.tar+zstd",
    "application/vnd.oci.image.layer.nondistributable.v1.tar",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd",
];

/// The compression scheme a layer's tar stream is wrapped in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Uncompressed tar.
    None,
    /// gzip, via `flate2`. The default, matching the teacher crate.
    #[default]
    Gzip,
    /// zstd, via the `zstd` crate.
    Zstd,
}

impl Compression {
    /// The OCI media type a layer written with this compression carries.
    pub fn media_type(self) -> &'static str {
        match self {
            Compression::None => LAYER_MEDIA_TYPES[0],
            Compression::Gzip => LAYER_MEDIA_TYPES[1],
            Compression::Zstd => LAYER_MEDIA_TYPES[2],
        }
    }
}

/// Options governing how [`LayerEngine::create_layer`] packs a layer.
#[derive(Clone, Debug, Default)]
pub struct LayerConfig {
    compression: Compression,
    skip_empty: bool,
    timestamp: Option<DateTime<Utc>>,
}

impl LayerConfig {
    /// Select the compression scheme. Defaults to [`Compression::Gzip`].
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// When set, an empty change list produces an empty-layer marker
    /// instead of a zero-entry tar stream.
    pub fn with_skip_empty(mut self, skip_empty: bool) -> Self {
        self.skip_empty = skip_empty;
        self
    }

    /// Fix the `created`/entry mtimes to a specific instant, overriding the
    /// per-change timestamps, for reproducible builds. When unset, each
    /// entry keeps its own [`FileChange::timestamp`].
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A packed OCI layer: a compressed tar blob plus the metadata that goes
/// with it into an image manifest and config history.
#[derive(Clone)]
pub struct Layer {
    digest: String,
    size: u64,
    media_type: String,
    blob: Vec<u8>,
    created: DateTime<Utc>,
    created_by: Option<String>,
    comment: Option<String>,
    empty_layer: bool,
    annotations: Option<std::collections::BTreeMap<String, String>>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("digest", &self.digest)
            .field("size", &self.size)
            .field("media_type", &self.media_type)
            .field("empty_layer", &self.empty_layer)
            .finish()
    }
}

impl Layer {
    fn empty(compression: Compression, created: DateTime<Utc>) -> Self {
        Layer {
            digest: String::new(),
            size: 0,
            media_type: compression.media_type().to_string(),
            blob: Vec::new(),
            created,
            created_by: None,
            comment: None,
            empty_layer: true,
            annotations: None,
        }
    }

    /// The `sha256:...` digest of the compressed blob. Empty for a
    /// [`Layer::is_empty_layer`] marker.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The size in bytes of the compressed blob.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The OCI media type of this layer's blob.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// The instant this layer's history entry should be stamped with.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// The `created_by` history field, when one was attached.
    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    /// Attach a `created_by` description (a build-step label) to this layer.
    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    /// Attach a free-text comment to this layer's history entry.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The comment attached to this layer's history entry, if any.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// True when this layer contributes no diff ID and no blob (an
    /// empty-layer marker emitted for a no-op build step).
    pub fn is_empty_layer(&self) -> bool {
        self.empty_layer
    }

    /// Per-layer descriptor annotations.
    pub fn annotations(&self) -> Option<&std::collections::BTreeMap<String, String>> {
        self.annotations.as_ref()
    }

    /// Attach descriptor annotations to this layer.
    pub fn with_annotations(mut self, annotations: std::collections::BTreeMap<String, String>) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Open a fresh reader over the compressed blob bytes. Safe to call more
    /// than once; each call yields an independent cursor over the same
    /// owned buffer, so handing a `Layer` to several consumers never
    /// requires them to coordinate over a shared stream position.
    pub fn read_blob(&self) -> impl Read + '_ {
        io::Cursor::new(self.blob.as_slice())
    }
}

/// Packs [`FileChange`] lists into layers and unpacks layers back onto a
/// directory tree.
///
/// One instance owns one content-addressed cache of the layers it has
/// produced; digest-identical `create_layer` calls against the same engine
/// return a clone of the cached [`Layer`] rather than repacking. The cache
/// is plain instance state, never a process-global table, so two engines
/// never contend over it (see spec's "Global mutable state" design note).
#[derive(Default)]
pub struct LayerEngine {
    cache: HashMap<String, Layer>,
}

impl LayerEngine {
    /// Construct an engine with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pack `changes` into a single layer per `config`.
    ///
    /// Entries are emitted in path-sorted order, one tar entry per change:
    /// directories and symlinks as zero-size metadata entries, regular
    /// files with their content streamed through, deletions as AUFS-style
    /// whiteout markers (`.wh.<basename>`) rather than tombstone-flagged
    /// regular entries. The resulting tar stream is compressed per
    /// `config`'s [`Compression`], then hashed; a cache hit on the
    /// resulting digest short-circuits to a clone of the previously built
    /// layer.
    #[tracing::instrument(skip(self, changes), fields(changes = changes.len()))]
    pub fn create_layer(&mut self, mut changes: Vec<FileChange>, config: &LayerConfig) -> Result<Layer> {
        let created = config.timestamp.unwrap_or_else(Utc::now);
        if changes.is_empty() && config.skip_empty {
            tracing::debug!("empty change set, emitting empty-layer marker");
            return Ok(Layer::empty(config.compression, created));
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        let tar_bytes = build_tar(&mut changes)?;
        let blob = compress(&tar_bytes, config.compression)?;
        let digest = format!("sha256:{}", sha256_hex(&blob)?);
        if let Some(cached) = self.cache.get(&digest) {
            tracing::debug!(%digest, "layer cache hit");
            return Ok(cached.clone());
        }
        let layer = Layer {
            digest: digest.clone(),
            size: blob.len() as u64,
            media_type: config.compression.media_type().to_string(),
            blob,
            created,
            created_by: None,
            comment: None,
            empty_layer: false,
            annotations: None,
        };
        tracing::debug!(%digest, size = layer.size, "layer created");
        self.cache.insert(digest, layer.clone());
        Ok(layer)
    }

    /// Unpack `layer`'s tar stream onto `target_root`, creating it if
    /// necessary. Whiteout entries remove their sibling target instead of
    /// being materialized; every other entry type is recreated with its
    /// recorded mode, ownership, and (for regular files and directories)
    /// mtime. A no-op for an empty-layer marker.
    #[tracing::instrument(skip(self, layer))]
    pub fn extract_layer(&self, layer: &Layer, target_root: &Utf8Path) -> Result<()> {
        if layer.empty_layer {
            return Ok(());
        }
        let tar_bytes = decompress(&layer.blob, &layer.media_type)?;
        std::fs::create_dir_all(target_root)
            .map_err(|e| CoreError::layer_io_at("extract_layer", target_root.as_str(), e))?;
        let dir = Dir::open_ambient_dir(target_root, cap_std::ambient_authority())
            .map_err(|e| CoreError::layer_io_at("extract_layer", target_root.as_str(), e))?;
        let mut archive = tar::Archive::new(io::Cursor::new(tar_bytes));
        let entries = archive
            .entries()
            .map_err(|e| CoreError::layer_io("extract_layer", e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| CoreError::layer_io("extract_layer", e))?;
            let path = entry
                .path()
                .map_err(|e| CoreError::layer_io("extract_layer", e))?
                .to_string_lossy()
                .into_owned();
            materialize_entry(&dir, &path, &mut entry)
                .map_err(|e| CoreError::layer_io_at("extract_layer", &path, e))?;
        }
        Ok(())
    }

    /// Structural validation of a layer's descriptor-facing fields: a valid
    /// digest and a recognized layer media type. Always `Ok` for an
    /// empty-layer marker, which carries neither.
    pub fn validate_layer(&self, layer: &Layer) -> Result<()> {
        if layer.empty_layer {
            return Ok(());
        }
        if !is_valid_digest(&layer.digest) {
            return Err(CoreError::validation(
                "validate_layer",
                format!("{:?} is not a valid sha256 digest", layer.digest),
            ));
        }
        if !LAYER_MEDIA_TYPES.contains(&layer.media_type.as_str()) {
            return Err(CoreError::validation(
                "validate_layer",
                format!("{:?} is not a recognized layer media type", layer.media_type),
            ));
        }
        Ok(())
    }

    /// Remove later duplicates by digest, preserving first-occurrence order.
    pub fn dedup_layers(&self, layers: Vec<Layer>) -> Vec<Layer> {
        let mut seen = std::collections::HashSet::new();
        layers
            .into_iter()
            .filter(|l| l.empty_layer || seen.insert(l.digest.clone()))
            .collect()
    }

    /// Drop zero-size empty-layer markers, preserving the order of
    /// everything else.
    pub fn optimize_layers(&self, layers: Vec<Layer>) -> Vec<Layer> {
        layers.into_iter().filter(|l| !(l.empty_layer && l.size == 0)).collect()
    }
}

pub(crate) fn is_valid_digest(s: &str) -> bool {
    match s.strip_prefix("sha256:") {
        Some(hex) => hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)),
        None => false,
    }
}

fn build_tar(changes: &mut [FileChange]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for change in changes.iter_mut() {
        append_change(&mut builder, change)?;
    }
    builder
        .into_inner()
        .map_err(|e| CoreError::layer_io("create_layer", e))
}

fn unix_seconds(timestamp: i64) -> u64 {
    u64::try_from(timestamp).unwrap_or(0)
}

fn whiteout_path(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((dir, base)) => format!("{dir}/.wh.{base}"),
        None => format!(".wh.{rel}"),
    }
}

fn base_header(change: &FileChange, entry_type: tar::EntryType, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mtime(unix_seconds(change.timestamp));
    header.set_uid(change.uid as u64);
    header.set_gid(change.gid as u64);
    header
}

fn append_change(builder: &mut tar::Builder<Vec<u8>>, change: &mut FileChange) -> Result<()> {
    let rel = change.path.trim_start_matches('/');
    let op = "create_layer";
    if change.change_type == ChangeType::Delete {
        let mut header = base_header(change, tar::EntryType::Regular, 0);
        header.set_mode(0o644);
        header.set_cksum();
        return builder
            .append_data(&mut header, whiteout_path(rel), io::empty())
            .map_err(|e| CoreError::layer_io_at(op, &change.path, e));
    }
    if crate::change::is_dir_mode(change.mode) {
        let mut header = base_header(change, tar::EntryType::Directory, 0);
        header.set_mode(change.mode & 0o777);
        header.set_cksum();
        return builder
            .append_data(&mut header, rel, io::empty())
            .map_err(|e| CoreError::layer_io_at(op, &change.path, e));
    }
    if crate::change::is_symlink_mode(change.mode) {
        let mut header = base_header(change, tar::EntryType::Symlink, 0);
        header.set_mode(change.mode & 0o777);
        header
            .set_link_name(&change.linkname)
            .map_err(|e| CoreError::layer_io_at(op, &change.path, e))?;
        header.set_cksum();
        return builder
            .append_data(&mut header, rel, io::empty())
            .map_err(|e| CoreError::layer_io_at(op, &change.path, e));
    }
    let mut bytes = Vec::with_capacity(change.size as usize);
    if let Some(content) = change.content.as_mut() {
        let mut reader = content
            .open()
            .map_err(|e| CoreError::layer_io_at(op, &change.path, e))?;
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| CoreError::layer_io_at(op, &change.path, e))?;
    }
    if bytes.len() as u64 != change.size {
        return Err(CoreError::validation(
            op,
            format!(
                "{}: declared size {} does not match {} streamed bytes",
                change.path,
                change.size,
                bytes.len()
            ),
        ));
    }
    let mut header = base_header(change, tar::EntryType::Regular, change.size);
    header.set_mode(change.mode & 0o777);
    header.set_cksum();
    builder
        .append_data(&mut header, rel, bytes.as_slice())
        .map_err(|e| CoreError::layer_io_at(op, &change.path, e))
}

fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| CoreError::layer_io("create_layer", e))?;
            encoder.finish().map_err(|e| CoreError::layer_io("create_layer", e))
        }
        Compression::Zstd => zstd::encode_all(data, 0).map_err(|e| CoreError::layer_io("create_layer", e)),
    }
}

fn decompress(data: &[u8], media_type: &str) -> Result<Vec<u8>> {
    let op = "extract_layer";
    match media_type {
        t if t == Compression::None.media_type() => Ok(data.to_vec()),
        t if t == Compression::Gzip.media_type() => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| CoreError::layer_io(op, e))?;
            Ok(out)
        }
        t if t == Compression::Zstd.media_type() => zstd::decode_all(data).map_err(|e| CoreError::layer_io(op, e)),
        other => Err(CoreError::validation(op, format!("unsupported layer media type {other}"))),
    }
}

fn sha256_hex(bytes: &[u8]) -> Result<String> {
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::sha256(), bytes)
        .map_err(|e| CoreError::digest("create_layer", io::Error::new(io::ErrorKind::Other, e.to_string())))?;
    Ok(hex::encode(digest))
}

fn materialize_entry<R: Read>(dir: &Dir, path: &str, entry: &mut tar::Entry<'_, R>) -> io::Result<()> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    if let Some(target_base) = file_name.strip_prefix(".wh.") {
        let sibling = match path.rsplit_once('/') {
            Some((parent, _)) => format!("{parent}/{target_base}"),
            None => target_base.to_string(),
        };
        return remove_path(dir, &sibling);
    }
    ensure_parent(dir, path)?;
    let header = entry.header().clone();
    match header.entry_type() {
        tar::EntryType::Directory => {
            let mut builder = cap_std::fs::DirBuilder::new();
            builder.recursive(true);
            builder.mode(header.mode().unwrap_or(0o755) & 0o777);
            dir.create_dir_with(path, &builder)
                .or_else(ignore_already_exists)?;
        }
        tar::EntryType::Symlink => {
            let link = entry
                .link_name()?
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "symlink entry with no link name"))?
                .to_string_lossy()
                .into_owned();
            let _ = dir.remove_file(path);
            let _ = dir.remove_dir_all(path);
            dir.symlink(link, path)?;
        }
        _ => {
            let mode = header.mode().unwrap_or(0o644) & 0o777;
            let mut options = cap_std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true).mode(mode);
            let mut file = dir.open_with(path, &options)?;
            io::copy(entry, &mut file)?;
            if let Ok(mtime) = header.mtime() {
                let spec = SystemTimeSpec::Absolute(std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime));
                let _ = file.set_times(None, Some(spec));
            }
        }
    }
    Ok(())
}
