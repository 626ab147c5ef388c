#![forbid(unsafe_code)]
//! Subvolume-level state machines.
//!
//! A [`Subvolume`] maps paths to inode builders and knows how to apply
//! every send-stream item that addresses a path. A [`SubvolumeSet`] holds
//! many subvolumes keyed by UUID; it only understands the two items that
//! establish a subvolume (`subvol` and `snapshot`) and resolves the
//! cross-subvolume halves of `clone` and `snapshot`. Streams are driven
//! through a [`SubvolumeSetMutator`], which pins the subvolume the stream
//! opened and proxies the remaining items to it.
//!
//! Subvolumes have fully independent path trees: real btrfs refuses
//! cross-subvolume renames and hardlinks with `EXDEV`, so nothing here
//! needs to model them. Only `clone` reaches across, and only through the
//! set.
//!
//! Freezing consumes the set: the clone resolver runs once over every
//! file of every subvolume (clones do not respect subvolume boundaries),
//! then each builder becomes an immutable [`Inode`].

mod render;

use std::collections::{BTreeMap, HashMap};

use sendfs_clone::extents_to_chunks_with_clones;
use sendfs_error::{ApplyError, Result};
use sendfs_extent::Extent;
use sendfs_inode::{Chunk, IncompleteInode, Inode};
use sendfs_path::{InodeId, InodeIdMap};
use sendfs_types::{display_path, ParseError};
use sendfs_wire::SendStreamItem;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Parse-or-apply failure while receiving a stream.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Identity of a subvolume as the stream states it.
///
/// The transaction id is carried but never validated against `clone`
/// items: the reference receiver does not check it either, and a
/// send-stream may legitimately encode the same filesystem state in a
/// different number of transactions than the sender's volume saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeMeta {
    pub name: Vec<u8>,
    pub uuid: Uuid,
    pub ctransid: u64,
    /// Set for snapshots only.
    pub parent: Option<(Uuid, u64)>,
}

/// One subvolume: a path map plus the inode builder behind each identity.
pub struct Subvolume {
    meta: SubvolumeMeta,
    id_map: InodeIdMap,
    /// Keyed by raw integer id; a `BTreeMap` so iteration (and thus
    /// resolver input and freeze order) is deterministic.
    inodes: BTreeMap<u64, IncompleteInode>,
}

impl Subvolume {
    fn new(meta: SubvolumeMeta, id_map: InodeIdMap) -> Result<Self> {
        let mut inodes = BTreeMap::new();
        let root = id_map.root_id();
        inodes.insert(
            root.raw(),
            IncompleteInode::new(&SendStreamItem::Mkdir {
                path: b".".to_vec(),
            })?,
        );
        Ok(Subvolume {
            meta,
            id_map,
            inodes,
        })
    }

    #[must_use]
    pub fn meta(&self) -> &SubvolumeMeta {
        &self.meta
    }

    #[must_use]
    pub fn id_map(&self) -> &InodeIdMap {
        &self.id_map
    }

    /// `Ok(None)` when nothing lives at `path`.
    pub fn inode_at_path(&self, path: &[u8]) -> Result<Option<&IncompleteInode>> {
        match self.id_map.get_id(path)? {
            // The inode table is a superset of the map, so a mapped id
            // with no inode is a bug, not a user error.
            Some(id) => self
                .inodes
                .get(&id.raw())
                .map(Some)
                .ok_or_else(|| ApplyError::Internal {
                    detail: format!("path map knows {id} but the inode table does not"),
                }),
            None => Ok(None),
        }
    }

    fn require_id(&self, item: &SendStreamItem, path: &[u8]) -> Result<InodeId> {
        self.id_map.get_id(path)?.ok_or_else(|| ApplyError::NotFound {
            item: item.to_string(),
            path: display_path(path),
        })
    }

    fn require_inode_mut<'a>(
        inodes: &'a mut BTreeMap<u64, IncompleteInode>,
        item: &SendStreamItem,
        id: &InodeId,
    ) -> Result<&'a mut IncompleteInode> {
        inodes.get_mut(&id.raw()).ok_or_else(|| ApplyError::Internal {
            detail: format!("no inode behind {id} while applying {item}"),
        })
    }

    fn is_dir(&self, id: &InodeId) -> bool {
        self.inodes.get(&id.raw()).is_some_and(IncompleteInode::is_dir)
    }

    /// Detach one path; when it was the inode's last path, drop the inode
    /// from the table too.
    fn delete(&mut self, path: &[u8]) -> Result<()> {
        let id = self.id_map.remove_path(path)?;
        if self.id_map.get_paths(&id)?.is_empty() {
            self.inodes.remove(&id.raw());
        }
        Ok(())
    }

    /// Applies any path-addressed item. `clone` must go through
    /// [`SubvolumeSetMutator::apply_item`], which resolves its source.
    pub fn apply_item(&mut self, item: &SendStreamItem) -> Result<()> {
        match item {
            SendStreamItem::Mkfile { path }
            | SendStreamItem::Mkdir { path }
            | SendStreamItem::Mkfifo { path }
            | SendStreamItem::Mksock { path }
            | SendStreamItem::Mknod { path, .. }
            | SendStreamItem::Symlink { path, .. } => {
                // Build the inode first so a bad item (e.g. a mknod mode
                // that is no device) leaves no orphan path behind.
                let inode = IncompleteInode::new(item)?;
                let id = self.id_map.next();
                if inode.is_dir() {
                    self.id_map.add_dir(&id, path)?;
                } else {
                    self.id_map.add_file(&id, path)?;
                }
                self.inodes.insert(id.raw(), inode);
                Ok(())
            }
            SendStreamItem::Rename { path, dest } => self.apply_rename(item, path, dest),
            SendStreamItem::Unlink { path } => {
                let id = self.require_id(item, path)?;
                if self.is_dir(&id) {
                    return Err(ApplyError::WrongTarget {
                        item: item.to_string(),
                        detail: "cannot unlink a directory".to_owned(),
                    });
                }
                self.delete(path)
            }
            SendStreamItem::Rmdir { path } => {
                let id = self.require_id(item, path)?;
                if !self.is_dir(&id) {
                    return Err(ApplyError::WrongTarget {
                        item: item.to_string(),
                        detail: "rmdir target is not a directory".to_owned(),
                    });
                }
                self.delete(path)
            }
            SendStreamItem::Link { path, dest } => {
                // `path` is the new name; `dest` is the existing file.
                if self.id_map.get_id(path)?.is_some() {
                    return Err(ApplyError::Exists {
                        item: item.to_string(),
                        path: display_path(path),
                    });
                }
                let src = self.require_id(item, dest)?;
                if self.is_dir(&src) {
                    return Err(ApplyError::HardlinkToDirectory {
                        item: item.to_string(),
                    });
                }
                self.id_map.add_file(&src, path)
            }
            SendStreamItem::Clone { .. } => Err(ApplyError::Internal {
                detail: format!("{item} must be applied through the subvolume set"),
            }),
            other => {
                let id = self.require_id(other, other.path())?;
                Self::require_inode_mut(&mut self.inodes, other, &id)?.apply_item(other)
            }
        }
    }

    fn apply_rename(&mut self, item: &SendStreamItem, path: &[u8], dest: &[u8]) -> Result<()> {
        let mut own_subtree_prefix = path.to_vec();
        own_subtree_prefix.push(b'/');
        if dest.starts_with(&own_subtree_prefix) {
            return Err(ApplyError::RenameIntoOwnSubtree {
                item: item.to_string(),
            });
        }

        let old_id = self.require_id(item, path)?;
        let new_id = self.id_map.get_id(dest)?;

        // Per rename(2), renaming a link onto another link of the same
        // inode does nothing at all.
        if new_id.as_ref() == Some(&old_id) {
            return Ok(());
        }

        let Some(new_id) = new_id else {
            return self.id_map.rename_path(path, dest);
        };

        // Overwriting: a directory may replace only an (empty) directory,
        // a non-directory may not replace a directory. Emptiness is
        // enforced by the delete below.
        if self.is_dir(&old_id) {
            if !self.is_dir(&new_id) {
                return Err(ApplyError::OverwriteMismatch {
                    item: item.to_string(),
                    detail: "a directory may only overwrite an empty directory".to_owned(),
                });
            }
        } else if self.is_dir(&new_id) {
            return Err(ApplyError::OverwriteMismatch {
                item: item.to_string(),
                detail: "cannot overwrite a directory with a non-directory".to_owned(),
            });
        }
        self.delete(dest)?;
        self.id_map.rename_path(path, dest)
    }

    /// A clone source: validate the range and borrow out the extent's
    /// identity. Runs against the *source* subvolume.
    fn clone_source_extent(&self, item: &SendStreamItem) -> Result<Extent> {
        let SendStreamItem::Clone { from_path, .. } = item else {
            return Err(ApplyError::Internal {
                detail: format!("{item} is not a clone"),
            });
        };
        let src = self
            .inode_at_path(from_path)?
            .ok_or_else(|| ApplyError::NotFound {
                item: item.to_string(),
                path: display_path(from_path),
            })?;
        src.clone_source_extent(item)
    }

    /// The destination half of a clone, with the source extent already
    /// taken by value (the source may live in this same subvolume).
    fn apply_clone_from_extent(&mut self, item: &SendStreamItem, src: Extent) -> Result<()> {
        let id = self.require_id(item, item.path())?;
        Self::require_inode_mut(&mut self.inodes, item, &id)?.apply_clone_from_extent(item, src)
    }

    /// `(identity, extent)` for each regular file, in raw-id order.
    fn inode_ids_and_extents(&self) -> Vec<(InodeId, Extent)> {
        self.inodes
            .iter()
            .filter_map(|(raw, ino)| {
                ino.extent()
                    .map(|extent| (self.id_map.handle(*raw), extent.clone()))
            })
            .collect()
    }

    fn freeze(self, id_to_chunks: &mut HashMap<InodeId, Vec<Chunk>>) -> Result<FrozenSubvolume> {
        let mut inodes = BTreeMap::new();
        for (raw, ino) in &self.inodes {
            let chunks = if ino.extent().is_some() {
                // The resolver saw every file we fed it, so a file with
                // no entry would be a resolver bug; an empty chunk list
                // is the legitimate result for an empty file.
                Some(
                    id_to_chunks
                        .remove(&self.id_map.handle(*raw))
                        .ok_or_else(|| ApplyError::Internal {
                            detail: format!("no resolved chunks for inode #{raw}"),
                        })?,
                )
            } else {
                None
            };
            inodes.insert(*raw, ino.freeze(chunks)?);
        }
        Ok(FrozenSubvolume {
            meta: self.meta,
            id_map: self.id_map,
            inodes,
        })
    }
}

/// An immutable subvolume: every builder has become an [`Inode`] and file
/// forks are clone-annotated chunk sequences.
pub struct FrozenSubvolume {
    meta: SubvolumeMeta,
    id_map: InodeIdMap,
    inodes: BTreeMap<u64, Inode>,
}

impl FrozenSubvolume {
    #[must_use]
    pub fn meta(&self) -> &SubvolumeMeta {
        &self.meta
    }

    #[must_use]
    pub fn id_map(&self) -> &InodeIdMap {
        &self.id_map
    }

    pub fn inode_at_path(&self, path: &[u8]) -> Result<Option<&Inode>> {
        match self.id_map.get_id(path)? {
            Some(id) => Ok(self.inodes.get(&id.raw())),
            None => Ok(None),
        }
    }

    pub fn inodes(&self) -> impl Iterator<Item = &Inode> {
        self.inodes.values()
    }

    /// Every inode must carry complete metadata in a finished volume.
    pub fn check_complete(&self) -> Result<()> {
        for ino in self.inodes.values() {
            ino.check_complete()?;
        }
        Ok(())
    }

    /// A human-readable `[inode, {"name": child}]` view of the whole
    /// tree. Directories are `[repr, {"name": child}]`, files `[repr]`,
    /// and hardlinked inodes carry a shared traversal id: `[[repr, 0]]`.
    pub fn render(&self) -> Result<serde_json::Value> {
        render::render(self)
    }
}

/// All subvolumes reconstructed from a series of streams, keyed by UUID.
#[derive(Default)]
pub struct SubvolumeSet {
    subvolumes: BTreeMap<Uuid, Subvolume>,
    /// For each `name` and `name@uuid-prefix`, how many subvolumes render
    /// to it. Lets every subvolume display the shortest `name@prefix`
    /// that is unique within the set, git-style.
    name_prefix_counts: HashMap<String, u32>,
}

impl SubvolumeSet {
    #[must_use]
    pub fn new() -> Self {
        SubvolumeSet::default()
    }

    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<&Subvolume> {
        self.subvolumes.get(uuid)
    }

    pub fn subvolumes(&self) -> impl Iterator<Item = &Subvolume> {
        self.subvolumes.values()
    }

    /// Feed one whole parsed stream into the set. The first item must
    /// establish the subvolume; parse errors abort mid-stream.
    pub fn receive<I>(&mut self, items: I) -> std::result::Result<(), ReceiveError>
    where
        I: IntoIterator<Item = std::result::Result<SendStreamItem, ParseError>>,
    {
        let mut items = items.into_iter();
        let first = match items.next() {
            Some(first) => first?,
            None => return Ok(()),
        };
        let mut mutator = SubvolumeSetMutator::new(self, &first)?;
        for item in items {
            mutator.apply_item(&item?)?;
        }
        Ok(())
    }

    /// Resolve clones across the whole set and freeze every subvolume.
    pub fn freeze(self) -> Result<FrozenSubvolumeSet> {
        let ids_and_extents: Vec<(InodeId, Extent)> = self
            .subvolumes
            .values()
            .flat_map(Subvolume::inode_ids_and_extents)
            .collect();
        debug!(
            subvolumes = self.subvolumes.len(),
            files = ids_and_extents.len(),
            "freezing subvolume set"
        );
        let mut id_to_chunks = extents_to_chunks_with_clones(&ids_and_extents);
        let mut subvolumes = BTreeMap::new();
        for (uuid, subvol) in self.subvolumes {
            subvolumes.insert(uuid, subvol.freeze(&mut id_to_chunks)?);
        }
        Ok(FrozenSubvolumeSet { subvolumes })
    }

    /// All `name@uuid-prefix` candidates of a subvolume, shortest first;
    /// the bare name is the zero-length prefix.
    fn name_prefixes(name: &[u8], uuid: &Uuid) -> Vec<String> {
        let name = display_path(name);
        let uuid = uuid.to_string();
        let mut out = vec![name.clone()];
        for i in 1..=uuid.len() {
            out.push(format!("{name}@{}", &uuid[..i]));
        }
        out
    }

    fn rendered_name(&self, name: &[u8], uuid: &Uuid) -> String {
        let prefixes = Self::name_prefixes(name, uuid);
        for prefix in &prefixes {
            if self.name_prefix_counts.get(prefix).copied().unwrap_or(0) < 2 {
                return prefix.clone();
            }
        }
        // Only possible when two subvolumes share the whole uuid, which
        // the duplicate check precludes; keep the render total anyway.
        let full = prefixes.last().map(String::as_str).unwrap_or_default();
        format!("{full}-ERROR")
    }

    /// Re-derive every subvolume's display name. Runs after each insert:
    /// adding `vol` a second time forces the first `vol` to grow a uuid
    /// suffix too.
    fn refresh_descriptions(&self) {
        for subvol in self.subvolumes.values() {
            let rendered = self.rendered_name(&subvol.meta.name, &subvol.meta.uuid);
            subvol.id_map.set_description(rendered);
        }
    }
}

/// A stream's handle on the subvolume its first item established.
///
/// Exists because `clone` items need both the target subvolume and the
/// whole set (their source is named by UUID), so handing the caller a
/// bare `&mut Subvolume` would not do.
pub struct SubvolumeSetMutator<'a> {
    set: &'a mut SubvolumeSet,
    uuid: Uuid,
}

impl<'a> SubvolumeSetMutator<'a> {
    /// Consumes the stream's first item. `subvol` creates an empty
    /// subvolume; `snapshot` structurally copies the parent, sharing
    /// extent leaves (so clone tracking spans the snapshot boundary) but
    /// nothing mutable.
    pub fn new(set: &'a mut SubvolumeSet, item: &SendStreamItem) -> Result<Self> {
        let meta = match item {
            SendStreamItem::Subvol {
                path,
                uuid,
                ctransid,
            } => SubvolumeMeta {
                name: path.clone(),
                uuid: *uuid,
                ctransid: *ctransid,
                parent: None,
            },
            SendStreamItem::Snapshot {
                path,
                uuid,
                ctransid,
                parent_uuid,
                parent_ctransid,
            } => SubvolumeMeta {
                name: path.clone(),
                uuid: *uuid,
                ctransid: *ctransid,
                parent: Some((*parent_uuid, *parent_ctransid)),
            },
            other => {
                return Err(ApplyError::StreamWithoutSubvolume {
                    item: other.to_string(),
                })
            }
        };

        if set.subvolumes.contains_key(&meta.uuid) {
            return Err(ApplyError::DuplicateSubvolume {
                uuid: meta.uuid.to_string(),
            });
        }

        let name = display_path(&meta.name);
        let subvol = match meta.parent {
            Some((parent_uuid, _)) => {
                let parent = set.subvolumes.get(&parent_uuid).ok_or_else(|| {
                    ApplyError::UnknownSnapshotParent {
                        item: item.to_string(),
                        uuid: parent_uuid.to_string(),
                    }
                })?;
                debug!(parent = %parent_uuid, snapshot = %meta.uuid, "snapshotting");
                Subvolume {
                    meta: meta.clone(),
                    id_map: parent.id_map.deep_clone(name),
                    inodes: parent.inodes.clone(),
                }
            }
            None => Subvolume::new(meta.clone(), InodeIdMap::new(name))?,
        };

        let uuid = meta.uuid;
        set.subvolumes.insert(uuid, subvol);
        for prefix in SubvolumeSet::name_prefixes(&meta.name, &meta.uuid) {
            *set.name_prefix_counts.entry(prefix).or_insert(0) += 1;
        }
        set.refresh_descriptions();
        Ok(SubvolumeSetMutator { set, uuid })
    }

    /// The subvolume this mutator's stream established.
    pub fn subvolume(&self) -> Result<&Subvolume> {
        // The uuid was inserted in `new` and never removed.
        self.set
            .subvolumes
            .get(&self.uuid)
            .ok_or_else(|| ApplyError::Internal {
                detail: "mutator subvolume vanished".to_owned(),
            })
    }

    pub fn apply_item(&mut self, item: &SendStreamItem) -> Result<()> {
        if let SendStreamItem::Clone { from_uuid, .. } = item {
            let src_extent = self
                .set
                .subvolumes
                .get(from_uuid)
                .ok_or_else(|| ApplyError::UnknownCloneSource {
                    item: item.to_string(),
                    uuid: from_uuid.to_string(),
                })?
                .clone_source_extent(item)?;
            return self
                .set
                .subvolumes
                .get_mut(&self.uuid)
                .ok_or_else(|| ApplyError::Internal {
                    detail: "mutator subvolume vanished".to_owned(),
                })?
                .apply_clone_from_extent(item, src_extent);
        }
        self.set
            .subvolumes
            .get_mut(&self.uuid)
            .ok_or_else(|| ApplyError::Internal {
                detail: "mutator subvolume vanished".to_owned(),
            })?
            .apply_item(item)
    }
}

/// The frozen counterpart of [`SubvolumeSet`].
pub struct FrozenSubvolumeSet {
    subvolumes: BTreeMap<Uuid, FrozenSubvolume>,
}

impl FrozenSubvolumeSet {
    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<&FrozenSubvolume> {
        self.subvolumes.get(uuid)
    }

    pub fn subvolumes(&self) -> impl Iterator<Item = &FrozenSubvolume> {
        self.subvolumes.values()
    }

    pub fn check_complete(&self) -> Result<()> {
        for subvol in self.subvolumes.values() {
            subvol.check_complete()?;
        }
        Ok(())
    }

    /// Rendered views keyed by each subvolume's disambiguated name.
    pub fn render(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let mut out = BTreeMap::new();
        for subvol in self.subvolumes.values() {
            out.insert(subvol.id_map.description(), subvol.render()?);
        }
        Ok(out)
    }
}
