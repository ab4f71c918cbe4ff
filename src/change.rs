//! Change Detector & Applier: diff two directory trees into a canonical
//! [`FileChange`] list, or materialize such a list onto a target tree.
//!
//! Like the teacher crate this module is descended from, traversal is
//! capability-oriented: every walk opens its root once via
//! [`cap_std::fs::Dir::open_ambient_dir`] and never escapes it, which matters
//! here because a build's "old" and "new" trees are untrusted build output.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, DirBuilderExt, MetadataExt, OpenOptionsExt};
use fs_set_times::{SetTimes, SystemTimeSpec};

use crate::content::{ByteSource, FileSource, MemorySource};
use crate::error::{CoreError, Result};

/// The three kinds of delta a [`FileChange`] can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
}

/// One filesystem delta between an old tree and a new tree.
///
/// `mode` carries the type discriminator in its high bits (`S_IFDIR`,
/// `S_IFLNK`, `S_IFREG`, masked with `libc::S_IFMT`) alongside the low-nine
/// permission bits, exactly as `stat(2)` reports it. `content` is a
/// once-only stream populated only for `Add`/`Modify` of a regular file with
/// positive size; the caller hands it to
/// [`crate::layer::LayerEngine::create_layer`] exactly once.
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeType,
    pub mode: u32,
    pub size: u64,
    pub timestamp: i64,
    pub uid: u32,
    pub gid: u32,
    pub linkname: String,
    pub content: Option<Box<dyn ByteSource>>,
}

impl std::fmt::Debug for FileChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChange")
            .field("path", &self.path)
            .field("change_type", &self.change_type)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("size", &self.size)
            .field("timestamp", &self.timestamp)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("linkname", &self.linkname)
            .field("content", &self.content.is_some())
            .finish()
    }
}

/// Is `mode`'s type bits a directory, per `S_IFMT`?
pub fn is_dir_mode(mode: u32) -> bool {
    mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
}

/// Is `mode`'s type bits a symlink, per `S_IFMT`?
pub fn is_symlink_mode(mode: u32) -> bool {
    mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
}

/// A tree entry's kind, as recorded by [`scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    Regular,
    Symlink,
}

/// One entry of the mapping [`scan`] returns.
#[derive(Debug, Clone)]
struct ScanEntry {
    kind: EntryKind,
    mode: u32,
    size: u64,
    mtime: i64,
    uid: u32,
    gid: u32,
    linkname: String,
}

impl ScanEntry {
    fn to_change(&self, path: String, change_type: ChangeType) -> FileChange {
        FileChange {
            path,
            change_type,
            mode: self.mode,
            size: self.size,
            timestamp: self.mtime,
            uid: self.uid,
            gid: self.gid,
            linkname: self.linkname.clone(),
            content: None,
        }
    }
}

/// Walk `root` and return a mapping from canonical slash-paths to metadata.
///
/// A missing `root` yields an empty mapping, not an error; every other I/O
/// failure (including a readlink failure) is fatal and surfaces as
/// [`CoreError::LayerIo`] naming the offending path.
pub(crate) fn scan(root: &Utf8Path) -> Result<BTreeMap<String, ScanEntry>> {
    let mut out = BTreeMap::new();
    let dir = match Dir::open_ambient_dir(root, cap_std::ambient_authority()) {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(CoreError::layer_io_at("scan", root.as_str(), e)),
    };
    walk(&dir, Utf8Path::new(""), &mut out)?;
    Ok(out)
}

fn walk(dir: &Dir, rel: &Utf8Path, out: &mut BTreeMap<String, ScanEntry>) -> Result<()> {
    let entries = dir
        .entries()
        .map_err(|e| CoreError::layer_io_at("scan", rel.as_str(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CoreError::layer_io_at("scan", rel.as_str(), e))?;
        let name = entry.file_name();
        let name = name.to_str().ok_or_else(|| {
            CoreError::validation("scan", format!("non-UTF-8 entry name under /{rel}"))
        })?;
        let child_rel: Utf8PathBuf = if rel.as_str().is_empty() {
            Utf8PathBuf::from(name)
        } else {
            rel.join(name)
        };
        let canonical = format!("/{child_rel}");
        let meta = dir
            .symlink_metadata(name)
            .map_err(|e| CoreError::layer_io_at("scan", &canonical, e))?;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = dir
                .read_link(name)
                .map_err(|e| CoreError::layer_io_at("scan", &canonical, e))?;
            let target = target.to_str().ok_or_else(|| {
                CoreError::validation("scan", format!("non-UTF-8 symlink target at {canonical}"))
            })?;
            out.insert(
                canonical,
                ScanEntry {
                    kind: EntryKind::Symlink,
                    mode: (meta.mode() & !libc::S_IFMT as u32) | libc::S_IFLNK as u32,
                    size: 0,
                    mtime: meta.mtime(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    linkname: target.to_string(),
                },
            );
        } else if file_type.is_dir() {
            out.insert(
                canonical.clone(),
                ScanEntry {
                    kind: EntryKind::Directory,
                    mode: (meta.mode() & !libc::S_IFMT as u32) | libc::S_IFDIR as u32,
                    size: 0,
                    mtime: meta.mtime(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    linkname: String::new(),
                },
            );
            let child_dir = dir
                .open_dir(name)
                .map_err(|e| CoreError::layer_io_at("scan", &canonical, e))?;
            walk(&child_dir, &child_rel, out)?;
        } else {
            out.insert(
                canonical.clone(),
                ScanEntry {
                    kind: EntryKind::Regular,
                    mode: (meta.mode() & !libc::S_IFMT as u32) | libc::S_IFREG as u32,
                    size: meta.len(),
                    mtime: meta.mtime(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    linkname: String::new(),
                },
            );
        }
    }
    Ok(())
}

/// `true` when `old` and `new` describe the same file for change-detection
/// purposes — i.e. neither `Add` nor `Modify` applies.
fn unchanged(old: &ScanEntry, new: &ScanEntry) -> bool {
    if old.kind != new.kind {
        return false;
    }
    if old.mode != new.mode
        || old.size != new.size
        || old.uid != new.uid
        || old.gid != new.gid
        || old.linkname != new.linkname
    {
        return false;
    }
    if old.kind == EntryKind::Regular || old.kind == EntryKind::Directory {
        return old.mtime == new.mtime;
    }
    true
}

/// Diff two directory trees into a canonical [`FileChange`] list.
///
/// Per the change-detection predicate, a path present in both trees but
/// differing in *type* (e.g. a regular file replaced by a directory) is a
/// `Modify`, never a `Delete` followed by an `Add`. Regular-file `Add`s and
/// `Modify`s carry an open [`ByteSource`] over the file on `new_root`; the
/// returned list's order is unspecified (the Layer Engine sorts it before
/// packaging).
pub fn detect_changes(old_root: &Utf8Path, new_root: &Utf8Path) -> Result<Vec<FileChange>> {
    let old = scan(old_root)?;
    let new = scan(new_root)?;

    let mut changes = Vec::new();
    for (path, new_entry) in &new {
        let change_type = match old.get(path) {
            None => Some(ChangeType::Add),
            Some(old_entry) if !unchanged(old_entry, new_entry) => Some(ChangeType::Modify),
            Some(_) => None,
        };
        let Some(change_type) = change_type else {
            continue;
        };
        let mut change = new_entry.to_change(path.clone(), change_type);
        if new_entry.kind == EntryKind::Regular && new_entry.size > 0 {
            let abs = new_root.join(path.trim_start_matches('/'));
            change.content = Some(Box::new(FileSource::new(abs, new_entry.size)));
        }
        changes.push(change);
    }
    for (path, old_entry) in &old {
        if !new.contains_key(path) {
            changes.push(old_entry.to_change(path.clone(), ChangeType::Delete));
        }
    }
    Ok(changes)
}

/// Materialize a [`FileChange`] list onto `base`, in input order.
///
/// The first per-change failure aborts the whole operation and is reported
/// with the offending path; there is no retry and no rollback of changes
/// already applied.
pub fn apply_changes(base: &Utf8Path, changes: &mut [FileChange]) -> Result<()> {
    let dir = Dir::open_ambient_dir(base, cap_std::ambient_authority())
        .map_err(|e| CoreError::layer_io_at("apply", base.as_str(), e))?;
    for change in changes.iter_mut() {
        apply_one(&dir, change).map_err(|e| CoreError::layer_io_at("apply", &change.path, e))?;
    }
    Ok(())
}

fn apply_one(dir: &Dir, change: &mut FileChange) -> io::Result<()> {
    let rel = change.path.trim_start_matches('/');
    if change.change_type == ChangeType::Delete {
        return remove_path(dir, rel);
    }
    ensure_parent(dir, rel)?;
    let perm_bits = change.mode & 0o777;
    if is_symlink_mode(change.mode) {
        let _ = dir.remove_file(rel);
        let _ = dir.remove_dir_all(rel);
        dir.symlink(&change.linkname, rel)?;
        return Ok(());
    }
    if is_dir_mode(change.mode) {
        let mut builder = cap_std::fs::DirBuilder::new();
        builder.recursive(true);
        builder.mode(perm_bits);
        dir.create_dir_with(rel, &builder)
            .or_else(|e| ignore_already_exists(e))?;
        return Ok(());
    }
    let mut opts = cap_std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(perm_bits);
    let mut file = dir.open_with(rel, &opts)?;
    if let Some(content) = change.content.as_mut() {
        let mut reader = content.open()?;
        std::io::copy(&mut reader, &mut file)?;
    }
    file.set_times(None, Some(SystemTimeSpec::Absolute(unix_time(change.timestamp))))?;
    Ok(())
}

pub(crate) fn ensure_parent(dir: &Dir, rel: &str) -> io::Result<()> {
    if let Some(parent) = Utf8Path::new(rel)
        .parent()
        .filter(|p| !p.as_str().is_empty())
    {
        let mut builder = cap_std::fs::DirBuilder::new();
        builder.recursive(true);
        builder.mode(0o755);
        dir.create_dir_with(parent, &builder)
            .or_else(ignore_already_exists)?;
    }
    Ok(())
}

pub(crate) fn remove_path(dir: &Dir, rel: &str) -> io::Result<()> {
    match dir.symlink_metadata(rel) {
        Ok(meta) if meta.is_dir() => dir.remove_dir_all(rel).or_else(ignore_not_found),
        Ok(_) => dir.remove_file(rel).or_else(ignore_not_found),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

pub(crate) fn ignore_already_exists(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::AlreadyExists {
        Ok(())
    } else {
        Err(e)
    }
}

fn unix_time(seconds: i64) -> std::time::SystemTime {
    if seconds >= 0 {
        std::time::UNIX_EPOCH + std::time::Duration::from_secs(seconds as u64)
    } else {
        std::time::UNIX_EPOCH - std::time::Duration::from_secs((-seconds) as u64)
    }
}

/// Construct a `FileChange` for a regular file carrying in-memory content,
/// for callers (and tests) that do not go through [`detect`].
pub fn memory_file_change(
    path: impl Into<String>,
    change_type: ChangeType,
    mode: u32,
    uid: u32,
    gid: u32,
    timestamp: i64,
    bytes: Vec<u8>,
) -> FileChange {
    let size = bytes.len() as u64;
    FileChange {
        path: path.into(),
        change_type,
        mode: (mode & !(libc::S_IFMT as u32)) | libc::S_IFREG as u32,
        size,
        timestamp,
        uid,
        gid,
        linkname: String::new(),
        content: if size > 0 {
            Some(Box::new(MemorySource::new(bytes)))
        } else {
            None
        },
    }
}
