#![forbid(unsafe_code)]
//! Error types for sendfs stream application.
//!
//! # Error Taxonomy
//!
//! sendfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Format | `ParseError` | `sendfs-types` | Wire-format violations detected while decoding the binary stream |
//! | Semantic | `ApplyError` | `sendfs-error` (this crate) | Violations detected while applying decoded items to the filesystem model |
//!
//! Format errors abort decoding immediately and never produce a partial
//! item sequence. Semantic errors are raised synchronously at the point of
//! application; after one is raised the mutable model is potentially
//! inconsistent, and callers must discard it — there is no partial-recovery
//! contract.
//!
//! Completeness errors (`Incomplete`) are different from both: they are
//! only produced by the explicit post-hoc validation pass over frozen
//! inodes, never by the streaming path.
//!
//! ## Design Constraints
//!
//! - `sendfs-error` MUST NOT depend on any other sendfs crate, so that the
//!   whole workspace can converge on it without cycles. Crate-internal
//!   errors (like the extent crate's `ExtentError`) convert into
//!   `ApplyError` at their crate boundaries.
//! - All string payloads are owned (`String`) so errors can outlive the
//!   items and paths they describe. Offending items are rendered into the
//!   error at construction time, which keeps every error actionable in
//!   test assertions without holding borrows.

use thiserror::Error;

/// Semantic errors raised while applying stream items to the model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The item addresses a path that does not exist.
    #[error("cannot apply {item}: {path} does not exist")]
    NotFound { item: String, path: String },

    /// A creation or link item targets a name that is already taken.
    #[error("cannot apply {item}: {path} already exists")]
    Exists { item: String, path: String },

    /// A non-final path component resolved to a file.
    #[error("cannot resolve {path}: a non-final component is a file")]
    AncestorIsFile { path: String },

    /// The path's parent directory is missing.
    #[error("cannot apply at {path}: missing ancestor directory")]
    MissingAncestor { path: String },

    /// Paths in the stream must be relative to the subvolume root.
    #[error("need a relative path, got {path}")]
    AbsolutePath { path: String },

    /// The subvolume root itself may never be removed or renamed away.
    #[error("cannot remove the subvolume root")]
    RootRemoval,

    /// `rmdir` (or an implicit delete) targeted a non-empty directory.
    #[error("cannot remove {path}: directory is not empty")]
    NotEmpty { path: String },

    /// The operation requires a directory but the target is not one,
    /// or vice versa.
    #[error("cannot apply {item}: {detail}")]
    WrongTarget { item: String, detail: String },

    /// Hardlinks to directories are not representable.
    #[error("cannot apply {item}: hardlink target is a directory")]
    HardlinkToDirectory { item: String },

    /// `rename` would move a directory into its own subtree.
    #[error("{item} makes a path its own subdirectory")]
    RenameIntoOwnSubtree { item: String },

    /// `rename` over an existing destination with an incompatible type.
    #[error("cannot apply {item}: {detail}")]
    OverwriteMismatch { item: String, detail: String },

    /// An `InodeId` was used with a path map other than its owner.
    #[error("InodeId #{id} used with a map that does not own it")]
    ForeignInodeId { id: u64 },

    /// A clone item's source range falls outside the source file.
    #[error("bad source range in {item}: {detail}")]
    CloneSourceRange { item: String, detail: String },

    /// A clone item names a subvolume UUID this set has never seen.
    #[error("unknown clone-source subvolume {uuid} in {item}")]
    UnknownCloneSource { item: String, uuid: String },

    /// A snapshot item names a parent UUID this set has never seen.
    #[error("unknown snapshot parent subvolume {uuid} in {item}")]
    UnknownSnapshotParent { item: String, uuid: String },

    /// Two subvolumes in one set may not share a UUID.
    #[error("subvolume uuid {uuid} is already in use")]
    DuplicateSubvolume { uuid: String },

    /// The first item of a stream must establish the subvolume.
    #[error("{item} must specify a subvolume (subvol or snapshot)")]
    StreamWithoutSubvolume { item: String },

    /// An item kind the addressed inode cannot accept (chmod on a
    /// symlink, write to a non-file, file-type bits in a chmod mode...).
    #[error("inode {inode} cannot apply {item}: {detail}")]
    InvalidOperation {
        inode: String,
        item: String,
        detail: String,
    },

    /// `remove_xattr` for a name the inode does not carry.
    #[error("inode {inode} has no xattr {name} to remove")]
    MissingXattr { inode: String, name: String },

    /// Post-hoc completeness check: a frozen inode is missing required
    /// metadata. Never raised by the streaming path.
    #[error("incomplete inode {inode}: missing {missing:?}")]
    Incomplete {
        inode: String,
        missing: Vec<&'static str>,
    },

    /// Internal invariant breach surfaced as an error rather than a panic.
    #[error("internal invariant violated: {detail}")]
    Internal { detail: String },
}

pub type Result<T> = std::result::Result<T, ApplyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = ApplyError::NotFound {
            item: "unlink 'a/b'".to_owned(),
            path: "a/b".to_owned(),
        };
        let text = err.to_string();
        assert!(text.contains("unlink 'a/b'"), "got: {text}");
        assert!(text.contains("does not exist"), "got: {text}");
    }

    #[test]
    fn incomplete_lists_missing_fields() {
        let err = ApplyError::Incomplete {
            inode: "(File)".to_owned(),
            missing: vec!["owner", "utimes"],
        };
        let text = err.to_string();
        assert!(text.contains("owner"), "got: {text}");
        assert!(text.contains("utimes"), "got: {text}");
    }
}
