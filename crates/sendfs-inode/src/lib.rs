#![forbid(unsafe_code)]
//! Inode builders and the frozen records they become.
//!
//! While a stream is being applied, each inode is an [`IncompleteInode`]:
//! a mutable builder whose variant (file, directory, device, ...) is fixed
//! by the item that created it, and whose remaining metadata fills in as
//! `chmod`/`chown`/`utimes`/xattr items arrive. Once the whole stream (or
//! set of streams) has been applied, builders freeze into immutable
//! [`Inode`] records; file data forks become [`Chunk`] sequences with
//! cross-references to every other inode sharing the same bytes.
//!
//! Item/variant mismatches (chmod on a symlink, write to a directory,
//! file-type bits in a chmod mode) are surfaced immediately as
//! [`ApplyError::InvalidOperation`]; missing metadata is only a defect at
//! validation time, since a builder is allowed to be partial mid-stream.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sendfs_error::{ApplyError, Result};
use sendfs_extent::{Extent, ExtentError, Kind};
use sendfs_path::InodeId;
use sendfs_types::{display_path, TimeSpec};
use sendfs_wire::SendStreamItem;
use tracing::trace;

const S_IFMT: u64 = 0o170000;
const S_IFBLK: u64 = 0o060000;
const S_IFCHR: u64 = 0o020000;

/// The `S_IFMT` file type of an inode, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Block,
    Char,
    Dir,
    Fifo,
    File,
    Symlink,
    Sock,
}

impl FileType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            FileType::Block => "Block",
            FileType::Char => "Char",
            FileType::Dir => "Dir",
            FileType::Fifo => "FIFO",
            FileType::File => "File",
            FileType::Symlink => "Symlink",
            FileType::Sock => "Sock",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `uid:gid`, as set by a `chown` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeOwner {
    pub uid: u64,
    pub gid: u64,
}

impl fmt::Display for InodeOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// The three timestamps of a `utimes` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeUtimes {
    pub ctime: TimeSpec,
    pub mtime: TimeSpec,
    pub atime: TimeSpec,
}

fn time_ns(t: TimeSpec) -> i128 {
    i128::from(t.sec) * 1_000_000_000 + i128::from(t.nsec)
}

/// `+5.25`-style signed delta between two timestamps, milliseconds with
/// trailing zeros trimmed.
fn fmt_delta(f: &mut fmt::Formatter<'_>, from: TimeSpec, to: TimeSpec) -> fmt::Result {
    let delta = time_ns(to) - time_ns(from);
    let sign = if delta < 0 { '-' } else { '+' };
    let magnitude = delta.unsigned_abs();
    let sec = magnitude / 1_000_000_000;
    let ms = (magnitude % 1_000_000_000) / 1_000_000;
    if ms == 0 {
        write!(f, "{sign}{sec}")
    } else {
        let text = format!("{ms:03}");
        write!(f, "{sign}{sec}.{}", text.trim_end_matches('0'))
    }
}

impl fmt::Display for InodeUtimes {
    /// Renders ctime, then mtime and atime as deltas off the previous
    /// stamp: `100.5+0+2` says mtime == ctime and atime is 2s later.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ctime)?;
        fmt_delta(f, self.ctime, self.mtime)?;
        fmt_delta(f, self.mtime, self.atime)
    }
}

/// A reference to a byte interval of another (or the same) inode's data
/// fork. Has to point at an [`InodeId`] rather than an [`Inode`]: A can
/// clone from B while B clones from A, and value-level cycles cannot be
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloneRef {
    pub inode_id: InodeId,
    pub offset: u64,
    pub length: u64,
}

impl fmt::Display for CloneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.inode_id, self.offset, self.length)
    }
}

/// A clone covering part of a chunk. The offset of the cloned bytes
/// *within the chunk* lives here, outside [`CloneRef`], so merging two
/// chunks only has to shift this field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkClone {
    /// Offset into the containing chunk.
    pub offset: u64,
    pub clone: CloneRef,
}

impl fmt::Display for ChunkClone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clone, self.offset)
    }
}

/// One maximal run of a frozen file's data fork: `length` bytes of DATA
/// or HOLE, with every cross-inode share of those bytes listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: Kind,
    pub length: u64,
    pub clones: BTreeSet<ChunkClone>,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::Data => "DATA",
            Kind::Hole => "HOLE",
        };
        write!(f, "({kind}/{}", self.length)?;
        if !self.clones.is_empty() {
            let clones = self
                .clones
                .iter()
                .map(ChunkClone::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, ": {clones}")?;
        }
        write!(f, ")")
    }
}

/// Variant-specific builder state.
#[derive(Debug, Clone)]
enum Payload {
    File { extent: Extent },
    Device { dev: u64 },
    Symlink { dest: Vec<u8> },
    Bare,
}

/// Mutable inode state while a stream is being applied.
///
/// Holds *just* the inode's data: its identity lives in the path map, and
/// keeping it out of here is what makes subvolume snapshots a plain
/// structural copy.
#[derive(Debug, Clone)]
pub struct IncompleteInode {
    file_type: FileType,
    mode: Option<u64>,
    owner: Option<InodeOwner>,
    utimes: Option<InodeUtimes>,
    xattrs: BTreeMap<Vec<u8>, Vec<u8>>,
    payload: Payload,
}

impl IncompleteInode {
    /// Builds the inode the creation item describes. Fails on any item
    /// kind that does not create an inode, and on a `mknod` whose mode is
    /// not a block or character device.
    pub fn new(item: &SendStreamItem) -> Result<Self> {
        let (file_type, mode, payload) = match item {
            SendStreamItem::Mkfile { .. } => (
                FileType::File,
                None,
                Payload::File {
                    extent: Extent::empty(),
                },
            ),
            SendStreamItem::Mkdir { .. } => (FileType::Dir, None, Payload::Bare),
            SendStreamItem::Mkfifo { .. } => (FileType::Fifo, None, Payload::Bare),
            SendStreamItem::Mksock { .. } => (FileType::Sock, None, Payload::Bare),
            SendStreamItem::Symlink { dest, .. } => (
                FileType::Symlink,
                None,
                Payload::Symlink { dest: dest.clone() },
            ),
            SendStreamItem::Mknod { mode, dev, .. } => {
                let file_type = match *mode & S_IFMT {
                    S_IFBLK => FileType::Block,
                    S_IFCHR => FileType::Char,
                    _ => {
                        return Err(ApplyError::InvalidOperation {
                            inode: "new device".to_owned(),
                            item: item.to_string(),
                            detail: "mknod mode is not a block or char device".to_owned(),
                        })
                    }
                };
                // `btrfs send` also emits a redundant chmod after mknod,
                // but the type bits are already captured here.
                (file_type, Some(*mode & !S_IFMT), Payload::Device { dev: *dev })
            }
            other => {
                return Err(ApplyError::InvalidOperation {
                    inode: "new inode".to_owned(),
                    item: other.to_string(),
                    detail: "not an inode-creating item".to_owned(),
                })
            }
        };
        Ok(IncompleteInode {
            file_type,
            mode,
            owner: None,
            utimes: None,
            xattrs: BTreeMap::new(),
            payload,
        })
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }

    /// The data-fork history; `None` for anything but a regular file.
    #[must_use]
    pub fn extent(&self) -> Option<&Extent> {
        match &self.payload {
            Payload::File { extent } => Some(extent),
            _ => None,
        }
    }

    fn invalid(&self, item: &SendStreamItem, detail: &str) -> ApplyError {
        ApplyError::InvalidOperation {
            inode: self.to_string(),
            item: item.to_string(),
            detail: detail.to_owned(),
        }
    }

    /// Applies one metadata or data item. `clone` items must go through
    /// [`IncompleteInode::apply_clone_from_extent`] instead, since they
    /// need the source inode's extent.
    pub fn apply_item(&mut self, item: &SendStreamItem) -> Result<()> {
        trace!(item = %item, "apply to inode");
        match item {
            SendStreamItem::Truncate { size, .. } => {
                let Payload::File { extent } = &mut self.payload else {
                    return Err(self.invalid(item, "only files can be truncated"));
                };
                *extent = extent.truncate(*size);
                Ok(())
            }
            SendStreamItem::Write { offset, data, .. } => {
                let Payload::File { extent } = &mut self.payload else {
                    return Err(self.invalid(item, "only files can be written"));
                };
                *extent = extent
                    .write(*offset, data.len() as u64)
                    .map_err(|err| extent_error(item, err))?;
                Ok(())
            }
            SendStreamItem::UpdateExtent { offset, len, .. } => {
                let Payload::File { extent } = &mut self.payload else {
                    return Err(self.invalid(item, "only files have extents"));
                };
                *extent = extent
                    .write(*offset, *len)
                    .map_err(|err| extent_error(item, err))?;
                Ok(())
            }
            SendStreamItem::Chmod { mode, .. } => {
                if self.file_type == FileType::Symlink {
                    return Err(self.invalid(item, "symlinks have no mode"));
                }
                if *mode & S_IFMT != 0 {
                    return Err(self.invalid(item, "chmod cannot change file-type bits"));
                }
                self.mode = Some(*mode);
                Ok(())
            }
            SendStreamItem::Chown { uid, gid, .. } => {
                self.owner = Some(InodeOwner {
                    uid: *uid,
                    gid: *gid,
                });
                Ok(())
            }
            SendStreamItem::Utimes {
                ctime,
                mtime,
                atime,
                ..
            } => {
                self.utimes = Some(InodeUtimes {
                    ctime: *ctime,
                    mtime: *mtime,
                    atime: *atime,
                });
                Ok(())
            }
            SendStreamItem::SetXattr { name, data, .. } => {
                self.xattrs.insert(name.clone(), data.clone());
                Ok(())
            }
            SendStreamItem::RemoveXattr { name, .. } => {
                if self.xattrs.remove(name).is_none() {
                    return Err(ApplyError::MissingXattr {
                        inode: self.to_string(),
                        name: display_path(name),
                    });
                }
                Ok(())
            }
            other => Err(self.invalid(other, "this item cannot apply to an inode")),
        }
    }

    /// First half of a `clone` item: validate the range against this
    /// inode as the *source*, and hand out a cheap identity-preserving
    /// handle on its extent.
    ///
    /// Split from [`apply_clone_from_extent`] because the source and
    /// destination may be the same inode, or two inodes in one table;
    /// taking the extent by value first sidesteps the aliasing.
    pub fn clone_source_extent(&self, item: &SendStreamItem) -> Result<Extent> {
        let SendStreamItem::Clone {
            len, clone_offset, ..
        } = item
        else {
            return Err(self.invalid(item, "not a clone item"));
        };
        let Payload::File { extent } = &self.payload else {
            return Err(self.invalid(item, "clone source must be a file"));
        };
        // `clone_range` would catch out-of-bounds anyway, but a range
        // error against the source is the more useful report.
        let length = extent.length();
        let end = clone_offset.checked_add(*len);
        if *clone_offset >= length || end.is_none() || end.is_some_and(|e| e == 0 || e > length) {
            return Err(ApplyError::CloneSourceRange {
                item: item.to_string(),
                detail: format!(
                    "range {clone_offset}+{len} not in source of length {length}"
                ),
            });
        }
        Ok(extent.clone())
    }

    /// Second half of a `clone` item: overlay the source view onto this
    /// inode's data fork.
    pub fn apply_clone_from_extent(&mut self, item: &SendStreamItem, src: Extent) -> Result<()> {
        let SendStreamItem::Clone {
            offset,
            len,
            clone_offset,
            ..
        } = item
        else {
            return Err(self.invalid(item, "not a clone item"));
        };
        let Payload::File { extent } = &mut self.payload else {
            return Err(self.invalid(item, "clone destination must be a file"));
        };
        *extent = extent
            .clone_range(*offset, &src, *clone_offset, *len)
            .map_err(|err| extent_error(item, err))?;
        Ok(())
    }

    /// Freeze into an immutable [`Inode`]. Files must be given their
    /// resolver-computed chunks; everything else must not.
    pub fn freeze(&self, chunks: Option<Vec<Chunk>>) -> Result<Inode> {
        let payload = match (&self.payload, chunks) {
            (Payload::File { .. }, Some(chunks)) => InodePayload::File { chunks },
            (Payload::File { .. }, None) => {
                return Err(ApplyError::Internal {
                    detail: format!("freezing file {self} without resolved chunks"),
                })
            }
            (payload, Some(_)) => {
                return Err(ApplyError::Internal {
                    detail: format!(
                        "chunks supplied for non-file {} inode",
                        payload_name(payload)
                    ),
                })
            }
            (Payload::Device { dev }, None) => InodePayload::Device { dev: *dev },
            (Payload::Symlink { dest }, None) => InodePayload::Symlink { dest: dest.clone() },
            (Payload::Bare, None) => InodePayload::Bare,
        };
        Ok(Inode {
            file_type: self.file_type,
            mode: self.mode,
            owner: self.owner,
            utimes: self.utimes,
            xattrs: self.xattrs.clone(),
            payload,
        })
    }
}

fn payload_name(payload: &Payload) -> &'static str {
    match payload {
        Payload::File { .. } => "file",
        Payload::Device { .. } => "device",
        Payload::Symlink { .. } => "symlink",
        Payload::Bare => "bare",
    }
}

fn extent_error(item: &SendStreamItem, err: ExtentError) -> ApplyError {
    match err {
        ExtentError::ZeroLengthOverlay { .. } => ApplyError::InvalidOperation {
            inode: display_path(item.path()),
            item: item.to_string(),
            detail: err.to_string(),
        },
        ExtentError::SourceRangeOutOfBounds { .. } => ApplyError::CloneSourceRange {
            item: item.to_string(),
            detail: err.to_string(),
        },
    }
}

impl fmt::Display for IncompleteInode {
    /// Same compact form as the frozen [`Inode`]; file runs come straight
    /// off the extent, with no clone annotations.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.file_type)?;
        fmt_common_fields(f, self.mode, self.owner, self.utimes, &self.xattrs)?;
        match &self.payload {
            Payload::File { extent } => {
                let runs = extent.to_string();
                if !runs.is_empty() {
                    write!(f, " {runs}")?;
                }
            }
            Payload::Device { dev } => write!(f, " {dev:x}")?,
            Payload::Symlink { dest } => write!(f, " {}", display_path(dest))?,
            Payload::Bare => {}
        }
        write!(f, ")")
    }
}

fn fmt_common_fields(
    f: &mut fmt::Formatter<'_>,
    mode: Option<u64>,
    owner: Option<InodeOwner>,
    utimes: Option<InodeUtimes>,
    xattrs: &BTreeMap<Vec<u8>, Vec<u8>>,
) -> fmt::Result {
    if let Some(mode) = mode {
        write!(f, " m{mode:o}")?;
    }
    if let Some(owner) = owner {
        write!(f, " o{owner}")?;
    }
    if let Some(utimes) = utimes {
        write!(f, " t{utimes}")?;
    }
    if !xattrs.is_empty() {
        let rendered = xattrs
            .iter()
            .map(|(k, v)| format!("'{}'='{}'", display_path(k), display_path(v)))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, " x{rendered}")?;
    }
    Ok(())
}

/// Variant payload of a frozen inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodePayload {
    File { chunks: Vec<Chunk> },
    Device { dev: u64 },
    Symlink { dest: Vec<u8> },
    Bare,
}

/// The final, immutable state of one inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub file_type: FileType,
    pub mode: Option<u64>,
    pub owner: Option<InodeOwner>,
    pub utimes: Option<InodeUtimes>,
    pub xattrs: BTreeMap<Vec<u8>, Vec<u8>>,
    pub payload: InodePayload,
}

impl Inode {
    /// A well-formed filesystem sets every metadata field on every inode;
    /// partial state is legal mid-stream but a defect in a finished
    /// volume. Symlinks are the exception: they carry no mode.
    pub fn check_complete(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.owner.is_none() {
            missing.push("owner");
        }
        if self.utimes.is_none() {
            missing.push("utimes");
        }
        match (self.file_type == FileType::Symlink, self.mode.is_some()) {
            (false, false) => missing.push("mode"),
            (true, true) => missing.push("absence of mode (symlink)"),
            _ => {}
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ApplyError::Incomplete {
                inode: self.to_string(),
                missing,
            })
        }
    }

    #[must_use]
    pub fn chunks(&self) -> Option<&[Chunk]> {
        match &self.payload {
            InodePayload::File { chunks } => Some(chunks),
            _ => None,
        }
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.file_type)?;
        fmt_common_fields(f, self.mode, self.owner, self.utimes, &self.xattrs)?;
        match &self.payload {
            InodePayload::File { chunks } => {
                if !chunks.is_empty() {
                    write!(f, " ")?;
                    for chunk in chunks {
                        write!(f, "{}{}", chunk.kind.abbrev(), chunk.length)?;
                        if !chunk.clones.is_empty() {
                            let clones = chunk
                                .clones
                                .iter()
                                .map(ChunkClone::to_string)
                                .collect::<Vec<_>>()
                                .join("/");
                            write!(f, "({clones})")?;
                        }
                    }
                }
            }
            InodePayload::Device { dev } => write!(f, " {dev:x}")?,
            InodePayload::Symlink { dest } => write!(f, " {}", display_path(dest))?,
            InodePayload::Bare => {}
        }
        write!(f, ")")
    }
}
