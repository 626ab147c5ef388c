#![forbid(unsafe_code)]
//! Public API facade for the sendfs workspace.
//!
//! Re-exports the types downstream consumers need to parse btrfs
//! send-streams and reconstruct the filesystems they describe:
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! use sendfs::{SendStream, SubvolumeSet};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut set = SubvolumeSet::new();
//! for path in ["parent.sendstream", "child.sendstream"] {
//!     let stream = SendStream::new(BufReader::new(File::open(path)?))?;
//!     set.receive(stream)?;
//! }
//! let frozen = set.freeze()?;
//! frozen.check_complete()?;
//! for (name, rendered) in frozen.render()? {
//!     println!("{name}: {rendered}");
//! }
//! # Ok(())
//! # }
//! ```

pub use sendfs_clone::extents_to_chunks_with_clones;
pub use sendfs_error::{ApplyError, Result};
pub use sendfs_extent::{Extent, Kind};
pub use sendfs_inode::{
    Chunk, ChunkClone, CloneRef, FileType, IncompleteInode, Inode, InodeOwner, InodePayload,
    InodeUtimes,
};
pub use sendfs_path::{InodeId, InodeIdMap};
pub use sendfs_subvol::{
    FrozenSubvolume, FrozenSubvolumeSet, ReceiveError, Subvolume, SubvolumeMeta, SubvolumeSet,
    SubvolumeSetMutator,
};
pub use sendfs_types::{ParseError, TimeSpec, SEND_STREAM_MAGIC, SEND_STREAM_VERSION};
pub use sendfs_wire::{parse_send_stream, AttrKind, CommandKind, SendStream, SendStreamItem};
