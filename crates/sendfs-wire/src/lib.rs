#![forbid(unsafe_code)]
//! Decoder for the btrfs send-stream binary format, version 1.
//!
//! Layout: a 13-byte magic (`btrfs-stream\0`), a `u32` little-endian
//! version, then a sequence of commands. Each command is a 10-byte header
//! (`length: u32`, `kind: u16`, `crc: u32`) followed by `length` bytes of
//! TLV attributes (`kind: u16`, `length: u16`, data). The CRC is read but
//! not verified.
//!
//! Decoding is strict: unknown command or attribute kinds, duplicated
//! attributes, missing required attributes, and truncation are all fatal.
//! The stream ends at the `END` command; bytes after it are ignored.
//!
//! Path attributes are lexically normalized as they are read, except
//! `PATH_LINK`, which is carried verbatim at the attribute level: for a
//! `symlink` item it is the link *content*. The `symlink` and `link` item
//! constructors then normalize their destination, matching how the
//! reference receiver treats these commands.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use sendfs_types::{
    display_path, normalize_path, read_fixed, read_le_u16, read_le_u32, read_le_u64, ParseError,
    TimeSpec, ATTRIBUTE_HEADER_SIZE, COMMAND_HEADER_SIZE, SEND_STREAM_MAGIC, SEND_STREAM_VERSION,
};
use tracing::trace;
use uuid::Uuid;

/// Command kinds of stream version 1. Kind 0 (`UNSPEC`) is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Subvol,
    Snapshot,
    Mkfile,
    Mkdir,
    Mknod,
    Mkfifo,
    Mksock,
    Symlink,
    Rename,
    Link,
    Unlink,
    Rmdir,
    SetXattr,
    RemoveXattr,
    Write,
    Clone,
    Truncate,
    Chmod,
    Chown,
    Utimes,
    End,
    UpdateExtent,
}

impl CommandKind {
    fn from_raw(raw: u16) -> Result<Self, ParseError> {
        Ok(match raw {
            1 => CommandKind::Subvol,
            2 => CommandKind::Snapshot,
            3 => CommandKind::Mkfile,
            4 => CommandKind::Mkdir,
            5 => CommandKind::Mknod,
            6 => CommandKind::Mkfifo,
            7 => CommandKind::Mksock,
            8 => CommandKind::Symlink,
            9 => CommandKind::Rename,
            10 => CommandKind::Link,
            11 => CommandKind::Unlink,
            12 => CommandKind::Rmdir,
            13 => CommandKind::SetXattr,
            14 => CommandKind::RemoveXattr,
            15 => CommandKind::Write,
            16 => CommandKind::Clone,
            17 => CommandKind::Truncate,
            18 => CommandKind::Chmod,
            19 => CommandKind::Chown,
            20 => CommandKind::Utimes,
            21 => CommandKind::End,
            22 => CommandKind::UpdateExtent,
            _ => return Err(ParseError::UnknownCommand { raw }),
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Subvol => "subvol",
            CommandKind::Snapshot => "snapshot",
            CommandKind::Mkfile => "mkfile",
            CommandKind::Mkdir => "mkdir",
            CommandKind::Mknod => "mknod",
            CommandKind::Mkfifo => "mkfifo",
            CommandKind::Mksock => "mksock",
            CommandKind::Symlink => "symlink",
            CommandKind::Rename => "rename",
            CommandKind::Link => "link",
            CommandKind::Unlink => "unlink",
            CommandKind::Rmdir => "rmdir",
            CommandKind::SetXattr => "set_xattr",
            CommandKind::RemoveXattr => "remove_xattr",
            CommandKind::Write => "write",
            CommandKind::Clone => "clone",
            CommandKind::Truncate => "truncate",
            CommandKind::Chmod => "chmod",
            CommandKind::Chown => "chown",
            CommandKind::Utimes => "utimes",
            CommandKind::End => "end",
            CommandKind::UpdateExtent => "update_extent",
        }
    }
}

/// Attribute kinds of stream version 1. Kind 0 (`UNSPEC`) is an error;
/// kind 12 (`OTIME`) never occurs in v1 streams and is rejected too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttrKind {
    Uuid,
    Ctransid,
    Ino,
    Size,
    Mode,
    Uid,
    Gid,
    Rdev,
    Ctime,
    Mtime,
    Atime,
    XattrName,
    XattrData,
    Path,
    PathTo,
    PathLink,
    FileOffset,
    Data,
    CloneUuid,
    CloneCtransid,
    ClonePath,
    CloneOffset,
    CloneLen,
}

impl AttrKind {
    fn from_raw(raw: u16, command: &'static str) -> Result<Self, ParseError> {
        Ok(match raw {
            1 => AttrKind::Uuid,
            2 => AttrKind::Ctransid,
            3 => AttrKind::Ino,
            4 => AttrKind::Size,
            5 => AttrKind::Mode,
            6 => AttrKind::Uid,
            7 => AttrKind::Gid,
            8 => AttrKind::Rdev,
            9 => AttrKind::Ctime,
            10 => AttrKind::Mtime,
            11 => AttrKind::Atime,
            13 => AttrKind::XattrName,
            14 => AttrKind::XattrData,
            15 => AttrKind::Path,
            16 => AttrKind::PathTo,
            17 => AttrKind::PathLink,
            18 => AttrKind::FileOffset,
            19 => AttrKind::Data,
            20 => AttrKind::CloneUuid,
            21 => AttrKind::CloneCtransid,
            22 => AttrKind::ClonePath,
            23 => AttrKind::CloneOffset,
            24 => AttrKind::CloneLen,
            _ => return Err(ParseError::UnknownAttribute { raw, command }),
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AttrKind::Uuid => "uuid",
            AttrKind::Ctransid => "ctransid",
            AttrKind::Ino => "ino",
            AttrKind::Size => "size",
            AttrKind::Mode => "mode",
            AttrKind::Uid => "uid",
            AttrKind::Gid => "gid",
            AttrKind::Rdev => "rdev",
            AttrKind::Ctime => "ctime",
            AttrKind::Mtime => "mtime",
            AttrKind::Atime => "atime",
            AttrKind::XattrName => "xattr_name",
            AttrKind::XattrData => "xattr_data",
            AttrKind::Path => "path",
            AttrKind::PathTo => "path_to",
            AttrKind::PathLink => "path_link",
            AttrKind::FileOffset => "file_offset",
            AttrKind::Data => "data",
            AttrKind::CloneUuid => "clone_uuid",
            AttrKind::CloneCtransid => "clone_ctransid",
            AttrKind::ClonePath => "clone_path",
            AttrKind::CloneOffset => "clone_offset",
            AttrKind::CloneLen => "clone_len",
        }
    }
}

/// A decoded attribute value. The numeric width and byte order match the
/// wire format; typing happens here so item construction is table lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrValue {
    Uuid(Uuid),
    U64(u64),
    Time(TimeSpec),
    Bytes(Vec<u8>),
}

fn decode_attr(kind: AttrKind, data: &[u8]) -> Result<AttrValue, ParseError> {
    let u64_of = |data: &[u8]| -> Result<u64, ParseError> {
        if data.len() != 8 {
            return Err(ParseError::Truncated {
                context: "u64 attribute",
                needed: 8,
                actual: data.len(),
            });
        }
        read_le_u64(data, 0, "u64 attribute")
    };
    Ok(match kind {
        AttrKind::Uuid | AttrKind::CloneUuid => {
            if data.len() != 16 {
                return Err(ParseError::Truncated {
                    context: "uuid attribute",
                    needed: 16,
                    actual: data.len(),
                });
            }
            // The wire carries RFC 4122 big-endian uuid bytes.
            AttrValue::Uuid(Uuid::from_bytes(read_fixed::<16>(data, 0, "uuid attribute")?))
        }
        AttrKind::Ctransid
        | AttrKind::Ino
        | AttrKind::Size
        | AttrKind::Mode
        | AttrKind::Uid
        | AttrKind::Gid
        | AttrKind::Rdev
        | AttrKind::FileOffset
        | AttrKind::CloneCtransid
        | AttrKind::CloneOffset
        | AttrKind::CloneLen => AttrValue::U64(u64_of(data)?),
        AttrKind::Ctime | AttrKind::Mtime | AttrKind::Atime => {
            if data.len() != 12 {
                return Err(ParseError::Truncated {
                    context: "timespec attribute",
                    needed: 12,
                    actual: data.len(),
                });
            }
            AttrValue::Time(TimeSpec {
                sec: read_le_u64(data, 0, "timespec seconds")?,
                nsec: read_le_u32(data, 8, "timespec nanoseconds")?,
            })
        }
        AttrKind::Path | AttrKind::PathTo | AttrKind::ClonePath => {
            AttrValue::Bytes(normalize_path(data))
        }
        // Not normalized here: for `symlink` this is the link content.
        AttrKind::PathLink => AttrValue::Bytes(data.to_vec()),
        AttrKind::XattrName | AttrKind::XattrData | AttrKind::Data => {
            AttrValue::Bytes(data.to_vec())
        }
    })
}

/// One decoded send-stream command, with its attributes typed and checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStreamItem {
    Subvol {
        path: Vec<u8>,
        uuid: Uuid,
        ctransid: u64,
    },
    Snapshot {
        path: Vec<u8>,
        uuid: Uuid,
        ctransid: u64,
        parent_uuid: Uuid,
        parent_ctransid: u64,
    },
    Mkfile {
        path: Vec<u8>,
    },
    Mkdir {
        path: Vec<u8>,
    },
    Mknod {
        path: Vec<u8>,
        mode: u64,
        dev: u64,
    },
    Mkfifo {
        path: Vec<u8>,
    },
    Mksock {
        path: Vec<u8>,
    },
    Symlink {
        path: Vec<u8>,
        dest: Vec<u8>,
    },
    Rename {
        path: Vec<u8>,
        dest: Vec<u8>,
    },
    Link {
        path: Vec<u8>,
        dest: Vec<u8>,
    },
    Unlink {
        path: Vec<u8>,
    },
    Rmdir {
        path: Vec<u8>,
    },
    SetXattr {
        path: Vec<u8>,
        name: Vec<u8>,
        data: Vec<u8>,
    },
    RemoveXattr {
        path: Vec<u8>,
        name: Vec<u8>,
    },
    Write {
        path: Vec<u8>,
        offset: u64,
        data: Vec<u8>,
    },
    Clone {
        path: Vec<u8>,
        offset: u64,
        len: u64,
        from_uuid: Uuid,
        from_ctransid: u64,
        from_path: Vec<u8>,
        clone_offset: u64,
    },
    Truncate {
        path: Vec<u8>,
        size: u64,
    },
    Chmod {
        path: Vec<u8>,
        mode: u64,
    },
    Chown {
        path: Vec<u8>,
        uid: u64,
        gid: u64,
    },
    Utimes {
        path: Vec<u8>,
        ctime: TimeSpec,
        mtime: TimeSpec,
        atime: TimeSpec,
    },
    UpdateExtent {
        path: Vec<u8>,
        offset: u64,
        len: u64,
    },
}

impl SendStreamItem {
    /// The command name as it appears in the wire format documentation.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            SendStreamItem::Subvol { .. } => CommandKind::Subvol,
            SendStreamItem::Snapshot { .. } => CommandKind::Snapshot,
            SendStreamItem::Mkfile { .. } => CommandKind::Mkfile,
            SendStreamItem::Mkdir { .. } => CommandKind::Mkdir,
            SendStreamItem::Mknod { .. } => CommandKind::Mknod,
            SendStreamItem::Mkfifo { .. } => CommandKind::Mkfifo,
            SendStreamItem::Mksock { .. } => CommandKind::Mksock,
            SendStreamItem::Symlink { .. } => CommandKind::Symlink,
            SendStreamItem::Rename { .. } => CommandKind::Rename,
            SendStreamItem::Link { .. } => CommandKind::Link,
            SendStreamItem::Unlink { .. } => CommandKind::Unlink,
            SendStreamItem::Rmdir { .. } => CommandKind::Rmdir,
            SendStreamItem::SetXattr { .. } => CommandKind::SetXattr,
            SendStreamItem::RemoveXattr { .. } => CommandKind::RemoveXattr,
            SendStreamItem::Write { .. } => CommandKind::Write,
            SendStreamItem::Clone { .. } => CommandKind::Clone,
            SendStreamItem::Truncate { .. } => CommandKind::Truncate,
            SendStreamItem::Chmod { .. } => CommandKind::Chmod,
            SendStreamItem::Chown { .. } => CommandKind::Chown,
            SendStreamItem::Utimes { .. } => CommandKind::Utimes,
            SendStreamItem::UpdateExtent { .. } => CommandKind::UpdateExtent,
        }
    }

    /// The path this command applies to (the new name, for `rename` and
    /// `link`, it is `self.path`, not the destination).
    #[must_use]
    pub fn path(&self) -> &[u8] {
        match self {
            SendStreamItem::Subvol { path, .. }
            | SendStreamItem::Snapshot { path, .. }
            | SendStreamItem::Mkfile { path }
            | SendStreamItem::Mkdir { path }
            | SendStreamItem::Mknod { path, .. }
            | SendStreamItem::Mkfifo { path }
            | SendStreamItem::Mksock { path }
            | SendStreamItem::Symlink { path, .. }
            | SendStreamItem::Rename { path, .. }
            | SendStreamItem::Link { path, .. }
            | SendStreamItem::Unlink { path }
            | SendStreamItem::Rmdir { path }
            | SendStreamItem::SetXattr { path, .. }
            | SendStreamItem::RemoveXattr { path, .. }
            | SendStreamItem::Write { path, .. }
            | SendStreamItem::Clone { path, .. }
            | SendStreamItem::Truncate { path, .. }
            | SendStreamItem::Chmod { path, .. }
            | SendStreamItem::Chown { path, .. }
            | SendStreamItem::Utimes { path, .. }
            | SendStreamItem::UpdateExtent { path, .. } => path,
        }
    }

    /// True for the two commands that name the subvolume itself rather
    /// than a path inside it.
    #[must_use]
    pub fn names_subvolume(&self) -> bool {
        matches!(
            self,
            SendStreamItem::Subvol { .. } | SendStreamItem::Snapshot { .. }
        )
    }
}

impl fmt::Display for SendStreamItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name())?;
        match self {
            SendStreamItem::Subvol { path, uuid, ctransid } => {
                write!(f, "{} uuid={uuid} transid={ctransid}", display_path(path))?;
            }
            SendStreamItem::Snapshot {
                path,
                uuid,
                ctransid,
                parent_uuid,
                parent_ctransid,
            } => {
                write!(
                    f,
                    "{} uuid={uuid} transid={ctransid} parent={parent_uuid}/{parent_ctransid}",
                    display_path(path)
                )?;
            }
            SendStreamItem::Mkfile { path }
            | SendStreamItem::Mkdir { path }
            | SendStreamItem::Mkfifo { path }
            | SendStreamItem::Mksock { path }
            | SendStreamItem::Unlink { path }
            | SendStreamItem::Rmdir { path } => write!(f, "{}", display_path(path))?,
            SendStreamItem::Mknod { path, mode, dev } => {
                write!(f, "{} mode={mode:o} dev={dev:#x}", display_path(path))?;
            }
            SendStreamItem::Symlink { path, dest } => {
                write!(f, "{} -> {}", display_path(path), display_path(dest))?;
            }
            SendStreamItem::Rename { path, dest } => {
                write!(f, "{} -> {}", display_path(path), display_path(dest))?;
            }
            SendStreamItem::Link { path, dest } => {
                write!(f, "{} -> {}", display_path(path), display_path(dest))?;
            }
            SendStreamItem::SetXattr { path, name, data } => {
                write!(
                    f,
                    "{} {}={} bytes",
                    display_path(path),
                    display_path(name),
                    data.len()
                )?;
            }
            SendStreamItem::RemoveXattr { path, name } => {
                write!(f, "{} {}", display_path(path), display_path(name))?;
            }
            SendStreamItem::Write { path, offset, data } => {
                write!(
                    f,
                    "{} offset={offset} data={} bytes",
                    display_path(path),
                    data.len()
                )?;
            }
            SendStreamItem::Clone {
                path,
                offset,
                len,
                from_uuid,
                from_ctransid: _,
                from_path,
                clone_offset,
            } => {
                write!(
                    f,
                    "{} offset={offset} len={len} from {}@{from_uuid}:{clone_offset}",
                    display_path(path),
                    display_path(from_path)
                )?;
            }
            SendStreamItem::Truncate { path, size } => {
                write!(f, "{} size={size}", display_path(path))?;
            }
            SendStreamItem::Chmod { path, mode } => {
                write!(f, "{} mode={mode:o}", display_path(path))?;
            }
            SendStreamItem::Chown { path, uid, gid } => {
                write!(f, "{} {uid}:{gid}", display_path(path))?;
            }
            SendStreamItem::Utimes {
                path,
                ctime,
                mtime,
                atime,
            } => {
                write!(
                    f,
                    "{} c={ctime} m={mtime} a={atime}",
                    display_path(path)
                )?;
            }
            SendStreamItem::UpdateExtent { path, offset, len } => {
                write!(f, "{} offset={offset} len={len}", display_path(path))?;
            }
        }
        write!(f, ")")
    }
}

/// Typed attribute table of one command, with duplicate detection at
/// insert and required-attribute errors at extraction.
struct AttrMap {
    command: &'static str,
    map: BTreeMap<AttrKind, AttrValue>,
}

impl AttrMap {
    fn parse(payload: &[u8], command: &'static str) -> Result<Self, ParseError> {
        let mut map = BTreeMap::new();
        let mut pos = 0_usize;
        while pos < payload.len() {
            let raw_kind = read_le_u16(payload, pos, "attribute header")?;
            let length = read_le_u16(payload, pos + 2, "attribute header")? as usize;
            pos += ATTRIBUTE_HEADER_SIZE;
            let data = sendfs_types::ensure_slice(payload, pos, length, "attribute data")?;
            pos += length;
            let kind = AttrKind::from_raw(raw_kind, command)?;
            let value = decode_attr(kind, data)?;
            if map.insert(kind, value).is_some() {
                return Err(ParseError::DuplicateAttribute {
                    command,
                    attribute: kind.name(),
                });
            }
        }
        Ok(AttrMap { command, map })
    }

    fn take(&mut self, kind: AttrKind) -> Result<AttrValue, ParseError> {
        self.map.remove(&kind).ok_or(ParseError::MissingAttribute {
            command: self.command,
            attribute: kind.name(),
        })
    }

    fn bytes(&mut self, kind: AttrKind) -> Result<Vec<u8>, ParseError> {
        match self.take(kind)? {
            AttrValue::Bytes(bytes) => Ok(bytes),
            _ => Err(ParseError::InvalidField {
                field: kind.name(),
                reason: "expected a byte-string attribute",
            }),
        }
    }

    fn u64(&mut self, kind: AttrKind) -> Result<u64, ParseError> {
        match self.take(kind)? {
            AttrValue::U64(value) => Ok(value),
            _ => Err(ParseError::InvalidField {
                field: kind.name(),
                reason: "expected a u64 attribute",
            }),
        }
    }

    fn uuid(&mut self, kind: AttrKind) -> Result<Uuid, ParseError> {
        match self.take(kind)? {
            AttrValue::Uuid(uuid) => Ok(uuid),
            _ => Err(ParseError::InvalidField {
                field: kind.name(),
                reason: "expected a uuid attribute",
            }),
        }
    }

    fn time(&mut self, kind: AttrKind) -> Result<TimeSpec, ParseError> {
        match self.take(kind)? {
            AttrValue::Time(time) => Ok(time),
            _ => Err(ParseError::InvalidField {
                field: kind.name(),
                reason: "expected a timespec attribute",
            }),
        }
    }
}

fn build_item(kind: CommandKind, mut attrs: AttrMap) -> Result<Option<SendStreamItem>, ParseError> {
    let item = match kind {
        CommandKind::Subvol => SendStreamItem::Subvol {
            path: attrs.bytes(AttrKind::Path)?,
            uuid: attrs.uuid(AttrKind::Uuid)?,
            ctransid: attrs.u64(AttrKind::Ctransid)?,
        },
        CommandKind::Snapshot => SendStreamItem::Snapshot {
            path: attrs.bytes(AttrKind::Path)?,
            uuid: attrs.uuid(AttrKind::Uuid)?,
            ctransid: attrs.u64(AttrKind::Ctransid)?,
            parent_uuid: attrs.uuid(AttrKind::CloneUuid)?,
            parent_ctransid: attrs.u64(AttrKind::CloneCtransid)?,
        },
        CommandKind::Mkfile => SendStreamItem::Mkfile {
            path: attrs.bytes(AttrKind::Path)?,
        },
        CommandKind::Mkdir => SendStreamItem::Mkdir {
            path: attrs.bytes(AttrKind::Path)?,
        },
        CommandKind::Mknod => SendStreamItem::Mknod {
            path: attrs.bytes(AttrKind::Path)?,
            mode: attrs.u64(AttrKind::Mode)?,
            dev: attrs.u64(AttrKind::Rdev)?,
        },
        CommandKind::Mkfifo => SendStreamItem::Mkfifo {
            path: attrs.bytes(AttrKind::Path)?,
        },
        CommandKind::Mksock => SendStreamItem::Mksock {
            path: attrs.bytes(AttrKind::Path)?,
        },
        CommandKind::Symlink => SendStreamItem::Symlink {
            path: attrs.bytes(AttrKind::Path)?,
            // The receiver treats the link content as a path.
            dest: normalize_path(&attrs.bytes(AttrKind::PathLink)?),
        },
        CommandKind::Rename => SendStreamItem::Rename {
            path: attrs.bytes(AttrKind::Path)?,
            dest: attrs.bytes(AttrKind::PathTo)?,
        },
        CommandKind::Link => SendStreamItem::Link {
            path: attrs.bytes(AttrKind::Path)?,
            dest: normalize_path(&attrs.bytes(AttrKind::PathLink)?),
        },
        CommandKind::Unlink => SendStreamItem::Unlink {
            path: attrs.bytes(AttrKind::Path)?,
        },
        CommandKind::Rmdir => SendStreamItem::Rmdir {
            path: attrs.bytes(AttrKind::Path)?,
        },
        CommandKind::SetXattr => SendStreamItem::SetXattr {
            path: attrs.bytes(AttrKind::Path)?,
            name: attrs.bytes(AttrKind::XattrName)?,
            data: attrs.bytes(AttrKind::XattrData)?,
        },
        CommandKind::RemoveXattr => SendStreamItem::RemoveXattr {
            path: attrs.bytes(AttrKind::Path)?,
            name: attrs.bytes(AttrKind::XattrName)?,
        },
        CommandKind::Write => SendStreamItem::Write {
            path: attrs.bytes(AttrKind::Path)?,
            offset: attrs.u64(AttrKind::FileOffset)?,
            data: attrs.bytes(AttrKind::Data)?,
        },
        CommandKind::Clone => SendStreamItem::Clone {
            path: attrs.bytes(AttrKind::Path)?,
            offset: attrs.u64(AttrKind::FileOffset)?,
            len: attrs.u64(AttrKind::CloneLen)?,
            from_uuid: attrs.uuid(AttrKind::CloneUuid)?,
            from_ctransid: attrs.u64(AttrKind::CloneCtransid)?,
            from_path: attrs.bytes(AttrKind::ClonePath)?,
            clone_offset: attrs.u64(AttrKind::CloneOffset)?,
        },
        CommandKind::Truncate => SendStreamItem::Truncate {
            path: attrs.bytes(AttrKind::Path)?,
            size: attrs.u64(AttrKind::Size)?,
        },
        CommandKind::Chmod => SendStreamItem::Chmod {
            path: attrs.bytes(AttrKind::Path)?,
            mode: attrs.u64(AttrKind::Mode)?,
        },
        CommandKind::Chown => SendStreamItem::Chown {
            path: attrs.bytes(AttrKind::Path)?,
            uid: attrs.u64(AttrKind::Uid)?,
            gid: attrs.u64(AttrKind::Gid)?,
        },
        CommandKind::Utimes => SendStreamItem::Utimes {
            path: attrs.bytes(AttrKind::Path)?,
            ctime: attrs.time(AttrKind::Ctime)?,
            mtime: attrs.time(AttrKind::Mtime)?,
            atime: attrs.time(AttrKind::Atime)?,
        },
        CommandKind::UpdateExtent => SendStreamItem::UpdateExtent {
            path: attrs.bytes(AttrKind::Path)?,
            offset: attrs.u64(AttrKind::FileOffset)?,
            len: attrs.u64(AttrKind::Size)?,
        },
        CommandKind::End => return Ok(None),
    };
    Ok(Some(item))
}

fn read_exact(
    reader: &mut impl Read,
    len: usize,
    context: &'static str,
) -> Result<Vec<u8>, ParseError> {
    let mut buf = vec![0_u8; len];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(buf),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(ParseError::Truncated {
            context,
            needed: len,
            actual: 0,
        }),
        Err(err) => Err(ParseError::Io {
            context,
            detail: err.to_string(),
        }),
    }
}

/// Streaming decoder: checks the magic and version up front, then yields
/// one [`SendStreamItem`] per command until `END`.
pub struct SendStream<R> {
    reader: R,
    done: bool,
}

impl<R: Read> SendStream<R> {
    /// Reads and validates the stream header.
    pub fn new(mut reader: R) -> Result<Self, ParseError> {
        let magic = read_exact(&mut reader, SEND_STREAM_MAGIC.len(), "stream magic")?;
        if magic != SEND_STREAM_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SEND_STREAM_MAGIC,
                actual: magic,
            });
        }
        let version_bytes = read_exact(&mut reader, 4, "stream version")?;
        let version = read_le_u32(&version_bytes, 0, "stream version")?;
        if version != SEND_STREAM_VERSION {
            return Err(ParseError::UnsupportedVersion {
                expected: SEND_STREAM_VERSION,
                actual: version,
            });
        }
        Ok(SendStream {
            reader,
            done: false,
        })
    }

    fn read_command(&mut self) -> Result<Option<SendStreamItem>, ParseError> {
        let header = read_exact(&mut self.reader, COMMAND_HEADER_SIZE, "command header")?;
        let length = read_le_u32(&header, 0, "command length")? as usize;
        let raw_kind = read_le_u16(&header, 4, "command kind")?;
        // The crc32c at bytes 6..10 goes unchecked.
        let kind = CommandKind::from_raw(raw_kind)?;
        let payload = read_exact(&mut self.reader, length, "command payload")?;
        trace!(command = kind.name(), payload = length, "decoded command");
        let attrs = AttrMap::parse(&payload, kind.name())?;
        build_item(kind, attrs)
    }
}

impl<R: Read> Iterator for SendStream<R> {
    type Item = Result<SendStreamItem, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_command() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Convenience wrapper: decode a whole stream into memory, stopping at
/// the first error.
pub fn parse_send_stream(reader: impl Read) -> Result<Vec<SendStreamItem>, ParseError> {
    SendStream::new(reader)?.collect()
}
