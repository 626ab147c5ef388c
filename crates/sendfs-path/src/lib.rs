#![forbid(unsafe_code)]
//! Bidirectional path ↔ inode-identity map.
//!
//! Reconstructing a filesystem from a send-stream requires tracking which
//! paths point at which inode, with hardlinks (many paths, one file inode)
//! and renames both in play. [`InodeIdMap`] owns that mapping in both
//! directions; [`InodeId`] is the identity handle it hands out.
//!
//! An `InodeId` carries a reference to the inner state of the map that
//! allocated it. This buys three things:
//! - identities from different maps hash and compare as different even
//!   when the integer ids collide, which is what lets clone aggregation
//!   work across subvolumes;
//! - using an id with somebody else's map is a detected error,
//!   not a silent mixup;
//! - the `Display` form shows the inode's current paths rather than a
//!   bare integer, which makes failures legible.
//!
//! Paths are byte strings, relative to the map root `.`. Symlinks are
//! never resolved. Directory hardlinks are banned, so a directory always
//! has exactly one path; files may have many.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use sendfs_error::{ApplyError, Result};
use sendfs_types::{display_path, split_path};
use tracing::trace;

/// One right-to-left step of a path: this inode is called `name` inside
/// the directory with integer id `parent`. `parent == None` marks the
/// root entry.
///
/// Renames rewrite the *parent's own* entry, so we store the parent by
/// integer id rather than by nested value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReverseEntry {
    name: Vec<u8>,
    parent: Option<u64>,
}

impl ReverseEntry {
    fn root() -> Self {
        ReverseEntry {
            name: Vec::new(),
            parent: None,
        }
    }

    fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Shared between the map and every `InodeId` it allocates. Split out of
/// [`InodeIdMap`] so ids can render themselves without a handle on the
/// whole map.
struct Inner {
    /// Prefix for rendered ids, e.g. the owning subvolume's display name.
    description: RefCell<String>,
    reverse: RefCell<HashMap<u64, BTreeSet<ReverseEntry>>>,
}

impl Inner {
    /// All current paths of `id`, sorted. Anonymous inodes yield nothing.
    fn paths(&self, id: u64) -> BTreeSet<Vec<u8>> {
        let reverse = self.reverse.borrow();
        let mut out = BTreeSet::new();
        for entry in reverse.get(&id).into_iter().flatten() {
            if entry.is_root() {
                out.insert(b".".to_vec());
                continue;
            }
            // Walk parents right-to-left. Every parent is a directory, so
            // it has exactly one reverse entry.
            let mut names = vec![entry.name.clone()];
            let mut cursor = entry.parent;
            while let Some(parent_id) = cursor {
                let parent = match reverse.get(&parent_id).and_then(|set| set.first()) {
                    Some(parent) => parent,
                    None => break,
                };
                if parent.is_root() {
                    break;
                }
                names.push(parent.name.clone());
                cursor = parent.parent;
            }
            names.reverse();
            out.insert(names.join(&b'/'));
        }
        out
    }
}

/// Identity handle for one inode of one map.
///
/// Cheap to clone; equality and hashing cover both the integer id and the
/// owning map, so ids never collide across maps.
#[derive(Clone)]
pub struct InodeId {
    id: u64,
    inner: Rc<Inner>,
}

impl InodeId {
    /// The underlying integer id, unique within the owning map.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.id
    }
}

impl PartialEq for InodeId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for InodeId {}

impl Hash for InodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        (Rc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl PartialOrd for InodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InodeId {
    /// Orders by rendered content (map description, then paths, then the
    /// integer id), so sorted collections of ids — and anything keyed on
    /// them, like clone references within a chunk — come out the same for
    /// the same filesystem no matter how it was built. Pointer identity
    /// is only the final tie-break, keeping distinct ids unequal.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return self.id.cmp(&other.id);
        }
        self.inner
            .description
            .borrow()
            .cmp(&other.inner.description.borrow())
            .then_with(|| self.inner.paths(self.id).cmp(&other.inner.paths(other.id)))
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| {
                (Rc::as_ptr(&self.inner) as usize).cmp(&(Rc::as_ptr(&other.inner) as usize))
            })
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self.inner.description.borrow();
        if !description.is_empty() {
            write!(f, "{description}@")?;
        }
        let paths = self.inner.paths(self.id);
        if paths.is_empty() {
            return write!(f, "ANON_INODE#{}", self.id);
        }
        let joined = paths
            .iter()
            .map(|p| display_path(p))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{joined}")
    }
}

impl fmt::Debug for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeId({self})")
    }
}

/// One node of the forward (path → id) tree. `children == None` marks a
/// file entry; directories carry a name-keyed child table.
#[derive(Debug, Clone)]
struct PathEntry {
    id: u64,
    children: Option<BTreeMap<Vec<u8>, PathEntry>>,
}

/// The path ↔ identity map for one subvolume.
pub struct InodeIdMap {
    next_id: u64,
    root: PathEntry,
    inner: Rc<Inner>,
}

impl InodeIdMap {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        let inner = Rc::new(Inner {
            description: RefCell::new(description.into()),
            reverse: RefCell::new(HashMap::new()),
        });
        inner
            .reverse
            .borrow_mut()
            .entry(0)
            .or_default()
            .insert(ReverseEntry::root());
        InodeIdMap {
            next_id: 1,
            root: PathEntry {
                id: 0,
                children: Some(BTreeMap::new()),
            },
            inner,
        }
    }

    /// Rename the map (and so every id it already handed out); used when
    /// a subvolume learns its name and uuid from the stream.
    pub fn set_description(&self, description: impl Into<String>) {
        *self.inner.description.borrow_mut() = description.into();
    }

    #[must_use]
    pub fn description(&self) -> String {
        self.inner.description.borrow().clone()
    }

    /// Allocate a fresh anonymous identity. It gains paths only through
    /// `add_file`/`add_dir`.
    pub fn next(&mut self) -> InodeId {
        let id = self.next_id;
        self.next_id += 1;
        InodeId {
            id,
            inner: Rc::clone(&self.inner),
        }
    }

    /// The identity of the map root `.`.
    #[must_use]
    pub fn root_id(&self) -> InodeId {
        self.handle(self.root.id)
    }

    /// Rebuild a handle from a raw integer id. Needed when a structural
    /// copy of a subvolume re-associates stored inodes with the copied
    /// map; does not check that the id was ever allocated.
    #[must_use]
    pub fn handle(&self, id: u64) -> InodeId {
        InodeId {
            id,
            inner: Rc::clone(&self.inner),
        }
    }

    fn assert_mine(&self, id: &InodeId) -> Result<()> {
        if Rc::ptr_eq(&id.inner, &self.inner) {
            Ok(())
        } else {
            Err(ApplyError::ForeignInodeId { id: id.id })
        }
    }

    fn check_relative(path: &[u8]) -> Result<()> {
        if path.first() == Some(&b'/') {
            return Err(ApplyError::AbsolutePath {
                path: display_path(path),
            });
        }
        Ok(())
    }

    /// Attach a (possibly additional) path to a file identity.
    pub fn add_file(&mut self, id: &InodeId, path: &[u8]) -> Result<()> {
        self.assert_mine(id)?;
        self.add_entry(
            PathEntry {
                id: id.id,
                children: None,
            },
            path,
        )
        .map_err(|(_, err)| err)
    }

    /// Attach the single path of a directory identity.
    pub fn add_dir(&mut self, id: &InodeId, path: &[u8]) -> Result<()> {
        self.assert_mine(id)?;
        self.add_entry(
            PathEntry {
                id: id.id,
                children: Some(BTreeMap::new()),
            },
            path,
        )
        .map_err(|(_, err)| err)
    }

    /// On failure, hands the entry back so `rename_path` can restore it.
    fn add_entry(&mut self, entry: PathEntry, path: &[u8]) -> std::result::Result<(), (PathEntry, ApplyError)> {
        if let Err(err) = Self::check_relative(path) {
            return Err((entry, err));
        }

        // An id must not be both a file and a directory, and directory
        // hardlinks are banned. One existing path is enough to check.
        if let Some(prev_path) = self.inner.paths(entry.id).into_iter().next() {
            let prev_is_dir = match self.lookup(&prev_path) {
                Some(prev) => prev.children.is_some(),
                None => false,
            };
            if prev_is_dir || entry.children.is_some() {
                return Err((
                    entry,
                    ApplyError::HardlinkToDirectory {
                        item: format!("adding path {}", display_path(path)),
                    },
                ));
            }
        }

        let parts = split_path(path);
        let Some((name, ancestors)) = parts.split_last() else {
            return Err((
                entry,
                ApplyError::Exists {
                    item: "adding path".to_owned(),
                    path: ".".to_owned(),
                },
            ));
        };

        let mut cursor = &mut self.root;
        for part in ancestors {
            let children = match cursor.children.as_mut() {
                Some(children) => children,
                None => {
                    return Err((
                        entry,
                        ApplyError::AncestorIsFile {
                            path: display_path(path),
                        },
                    ))
                }
            };
            cursor = match children.get_mut(part) {
                Some(child) => child,
                None => {
                    return Err((
                        entry,
                        ApplyError::MissingAncestor {
                            path: display_path(path),
                        },
                    ))
                }
            };
        }
        let parent_id = cursor.id;
        let children = match cursor.children.as_mut() {
            Some(children) => children,
            None => {
                return Err((
                    entry,
                    ApplyError::AncestorIsFile {
                        path: display_path(path),
                    },
                ))
            }
        };
        if children.contains_key(name) {
            let item = format!("adding #{}", entry.id);
            return Err((
                entry,
                ApplyError::Exists {
                    item,
                    path: display_path(path),
                },
            ));
        }

        let id = entry.id;
        children.insert(name.clone(), entry);
        self.inner
            .reverse
            .borrow_mut()
            .entry(id)
            .or_default()
            .insert(ReverseEntry {
                name: name.clone(),
                parent: Some(parent_id),
            });
        Ok(())
    }

    fn lookup(&self, path: &[u8]) -> Option<&PathEntry> {
        let mut cursor = &self.root;
        for part in split_path(path) {
            cursor = cursor.children.as_ref()?.get(&part)?;
        }
        Some(cursor)
    }

    /// Detach one path. Fails on the root, on missing paths, and on
    /// directories that still have children.
    pub fn remove_path(&mut self, path: &[u8]) -> Result<InodeId> {
        if let Some(entry) = self.lookup(path) {
            if entry.children.as_ref().is_some_and(|c| !c.is_empty()) {
                return Err(ApplyError::NotEmpty {
                    path: display_path(path),
                });
            }
        }
        let entry = self.remove_entry(path)?;
        Ok(self.handle(entry.id))
    }

    /// Detach without the emptiness check; `rename_path` moves whole
    /// subtrees through this.
    fn remove_entry(&mut self, path: &[u8]) -> Result<PathEntry> {
        Self::check_relative(path)?;
        let parts = split_path(path);
        let Some((name, ancestors)) = parts.split_last() else {
            return Err(ApplyError::RootRemoval);
        };

        let mut cursor = &mut self.root;
        for part in ancestors {
            let children = cursor.children.as_mut().ok_or_else(|| ApplyError::AncestorIsFile {
                path: display_path(path),
            })?;
            cursor = children.get_mut(part).ok_or_else(|| ApplyError::NotFound {
                item: "removing path".to_owned(),
                path: display_path(path),
            })?;
        }
        let children = cursor.children.as_mut().ok_or_else(|| ApplyError::AncestorIsFile {
            path: display_path(path),
        })?;
        let entry = children.remove(name).ok_or_else(|| ApplyError::NotFound {
            item: "removing path".to_owned(),
            path: display_path(path),
        })?;

        self.remove_reverse_entry(entry.id, &parts);
        Ok(entry)
    }

    fn remove_reverse_entry(&mut self, id: u64, parts: &[Vec<u8>]) {
        let mut reverse = self.inner.reverse.borrow_mut();
        let Some(entries) = reverse.get(&id) else {
            return;
        };
        let mut matched: Option<ReverseEntry> = None;
        'candidates: for candidate in entries {
            let mut current = candidate.clone();
            for part in parts.iter().rev() {
                if current.is_root() || current.name != *part {
                    continue 'candidates;
                }
                let Some(parent_id) = current.parent else {
                    continue 'candidates;
                };
                current = match reverse.get(&parent_id).and_then(|set| set.first()) {
                    Some(parent) => parent.clone(),
                    None => continue 'candidates,
                };
            }
            // All components matched; it is only the right path if the
            // walk also bottomed out at the root (otherwise `parts` was
            // merely a suffix).
            if current.is_root() {
                matched = Some(candidate.clone());
                break;
            }
        }
        if let Some(matched) = matched {
            if let Some(entries) = reverse.get_mut(&id) {
                entries.remove(&matched);
                if entries.is_empty() {
                    reverse.remove(&id);
                }
            }
        }
    }

    /// Detach `src` and reattach it (subtree included) at `dest`. If the
    /// reattachment fails, the entry is restored at `src` first.
    pub fn rename_path(&mut self, src: &[u8], dest: &[u8]) -> Result<()> {
        trace!(
            src = display_path(src),
            dest = display_path(dest),
            "rename path"
        );
        let entry = self.remove_entry(src)?;
        if let Err((entry, err)) = self.add_entry(entry, dest) {
            // Restore at the source. The source slot was just vacated, so
            // this cannot fail; if it somehow does, surface the original
            // error anyway.
            let _ = self.add_entry(entry, src);
            return Err(err);
        }
        Ok(())
    }

    /// `Ok(None)` when the path does not exist. Errors when a non-final
    /// component is a file.
    pub fn get_id(&self, path: &[u8]) -> Result<Option<InodeId>> {
        Self::check_relative(path)?;
        let mut cursor = &self.root;
        for part in split_path(path) {
            let children = match cursor.children.as_ref() {
                Some(children) => children,
                None => {
                    return Err(ApplyError::AncestorIsFile {
                        path: display_path(path),
                    })
                }
            };
            cursor = match children.get(&part) {
                Some(child) => child,
                None => return Ok(None),
            };
        }
        Ok(Some(self.handle(cursor.id)))
    }

    /// All current paths of an identity, sorted; empty for anonymous
    /// inodes.
    pub fn get_paths(&self, id: &InodeId) -> Result<BTreeSet<Vec<u8>>> {
        self.assert_mine(id)?;
        Ok(self.inner.paths(id.id))
    }

    /// `Ok(None)` for files; for directories, the sorted full paths of
    /// the children (possibly empty).
    pub fn get_children(&self, id: &InodeId) -> Result<Option<BTreeSet<Vec<u8>>>> {
        self.assert_mine(id)?;
        let paths = self.inner.paths(id.id);
        if paths.len() != 1 {
            // Hardlinked, hence a file.
            return Ok(None);
        }
        let path = paths.into_iter().next().unwrap_or_default();
        let Some(entry) = self.lookup(&path) else {
            return Ok(None);
        };
        let Some(children) = entry.children.as_ref() else {
            return Ok(None);
        };
        Ok(Some(
            children
                .keys()
                .map(|name| {
                    if path == b"." {
                        name.clone()
                    } else {
                        let mut joined = path.clone();
                        joined.push(b'/');
                        joined.extend_from_slice(name);
                        joined
                    }
                })
                .collect(),
        ))
    }

    /// Structural deep copy with a fresh identity tag: integer ids and
    /// the tree carry over, but ids from the copy and the original
    /// compare as different. Snapshots are built on this.
    #[must_use]
    pub fn deep_clone(&self, description: impl Into<String>) -> InodeIdMap {
        let inner = Rc::new(Inner {
            description: RefCell::new(description.into()),
            reverse: RefCell::new(self.inner.reverse.borrow().clone()),
        });
        InodeIdMap {
            next_id: self.next_id,
            root: self.root.clone(),
            inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(map: &InodeIdMap, id: &InodeId) -> Vec<String> {
        map.get_paths(id)
            .expect("own id")
            .iter()
            .map(|p| display_path(p))
            .collect()
    }

    #[test]
    fn root_exists() {
        let map = InodeIdMap::new("");
        let root = map.get_id(b".").expect("lookup").expect("root");
        assert_eq!(root.raw(), 0);
        assert_eq!(paths(&map, &root), vec!["."]);
        assert_eq!(
            map.get_children(&root).expect("root is a dir"),
            Some(BTreeSet::new())
        );
    }

    #[test]
    fn add_and_look_up_file() {
        let mut map = InodeIdMap::new("");
        let dir = map.next();
        map.add_dir(&dir, b"a").expect("add dir");
        let file = map.next();
        map.add_file(&file, b"a/f").expect("add file");

        assert_eq!(map.get_id(b"a/f").expect("lookup"), Some(file.clone()));
        assert_eq!(paths(&map, &file), vec!["a/f"]);
        assert_eq!(map.get_children(&file).expect("file"), None);
        let children = map.get_children(&dir).expect("dir").expect("is dir");
        assert_eq!(children, BTreeSet::from([b"a/f".to_vec()]));
    }

    #[test]
    fn hardlinks_give_many_paths() {
        let mut map = InodeIdMap::new("");
        let file = map.next();
        map.add_file(&file, b"one").expect("add");
        map.add_file(&file, b"two").expect("link");
        assert_eq!(paths(&map, &file), vec!["one", "two"]);
        assert_eq!(map.get_id(b"one").expect("lookup"), map.get_id(b"two").expect("lookup"));
    }

    #[test]
    fn directory_hardlink_rejected() {
        let mut map = InodeIdMap::new("");
        let dir = map.next();
        map.add_dir(&dir, b"d").expect("add dir");
        assert!(matches!(
            map.add_dir(&dir, b"d2"),
            Err(ApplyError::HardlinkToDirectory { .. })
        ));
        assert!(matches!(
            map.add_file(&dir, b"f"),
            Err(ApplyError::HardlinkToDirectory { .. })
        ));
    }

    #[test]
    fn missing_ancestor_and_file_ancestor() {
        let mut map = InodeIdMap::new("");
        let file = map.next();
        assert!(matches!(
            map.add_file(&file, b"no/such/dir"),
            Err(ApplyError::MissingAncestor { .. })
        ));
        map.add_file(&file, b"f").expect("add");
        let other = map.next();
        assert!(matches!(
            map.add_file(&other, b"f/child"),
            Err(ApplyError::AncestorIsFile { .. })
        ));
        assert!(matches!(
            map.get_id(b"f/child"),
            Err(ApplyError::AncestorIsFile { .. })
        ));
    }

    #[test]
    fn duplicate_path_rejected() {
        let mut map = InodeIdMap::new("");
        let a = map.next();
        map.add_file(&a, b"x").expect("add");
        let b = map.next();
        assert!(matches!(
            map.add_file(&b, b"x"),
            Err(ApplyError::Exists { .. })
        ));
    }

    #[test]
    fn absolute_path_rejected() {
        let mut map = InodeIdMap::new("");
        let a = map.next();
        assert!(matches!(
            map.add_file(&a, b"/abs"),
            Err(ApplyError::AbsolutePath { .. })
        ));
    }

    #[test]
    fn remove_path_drops_one_link() {
        let mut map = InodeIdMap::new("");
        let file = map.next();
        map.add_file(&file, b"one").expect("add");
        map.add_file(&file, b"two").expect("link");
        let removed = map.remove_path(b"one").expect("remove");
        assert_eq!(removed, file);
        assert_eq!(paths(&map, &file), vec!["two"]);
        assert_eq!(map.get_id(b"one").expect("lookup"), None);
    }

    #[test]
    fn remove_refuses_root_and_nonempty_dirs() {
        let mut map = InodeIdMap::new("");
        assert!(matches!(map.remove_path(b"."), Err(ApplyError::RootRemoval)));
        let dir = map.next();
        map.add_dir(&dir, b"d").expect("add dir");
        let file = map.next();
        map.add_file(&file, b"d/f").expect("add file");
        assert!(matches!(
            map.remove_path(b"d"),
            Err(ApplyError::NotEmpty { .. })
        ));
        map.remove_path(b"d/f").expect("remove file");
        map.remove_path(b"d").expect("remove now-empty dir");
    }

    #[test]
    fn removing_last_path_makes_inode_anonymous() {
        let mut map = InodeIdMap::new("");
        let file = map.next();
        map.add_file(&file, b"f").expect("add");
        map.remove_path(b"f").expect("remove");
        assert!(paths(&map, &file).is_empty());
        assert_eq!(format!("{file}"), format!("ANON_INODE#{}", file.raw()));
    }

    #[test]
    fn rename_moves_subtrees() {
        let mut map = InodeIdMap::new("");
        let dir = map.next();
        map.add_dir(&dir, b"d").expect("add dir");
        let file = map.next();
        map.add_file(&file, b"d/f").expect("add file");
        let dest = map.next();
        map.add_dir(&dest, b"e").expect("add dir");

        map.rename_path(b"d", b"e/d").expect("rename");
        assert_eq!(map.get_id(b"d").expect("lookup"), None);
        assert_eq!(map.get_id(b"e/d").expect("lookup"), Some(dir.clone()));
        assert_eq!(paths(&map, &file), vec!["e/d/f"]);
    }

    #[test]
    fn failed_rename_restores_source() {
        let mut map = InodeIdMap::new("");
        let file = map.next();
        map.add_file(&file, b"f").expect("add");
        let blocker = map.next();
        map.add_file(&blocker, b"taken").expect("add");

        assert!(matches!(
            map.rename_path(b"f", b"taken"),
            Err(ApplyError::Exists { .. })
        ));
        assert_eq!(map.get_id(b"f").expect("lookup"), Some(file.clone()));
        assert_eq!(paths(&map, &file), vec!["f"]);

        assert!(matches!(
            map.rename_path(b"f", b"no/such/place"),
            Err(ApplyError::MissingAncestor { .. })
        ));
        assert_eq!(paths(&map, &file), vec!["f"]);
    }

    #[test]
    fn rename_disambiguates_hardlinked_suffixes() {
        // Two links whose paths share a suffix: removal must detach the
        // right one.
        let mut map = InodeIdMap::new("");
        let a = map.next();
        map.add_dir(&a, b"a").expect("add");
        let b = map.next();
        map.add_dir(&b, b"b").expect("add");
        let file = map.next();
        map.add_file(&file, b"a/f").expect("add");
        map.add_file(&file, b"b/f").expect("link");

        map.remove_path(b"a/f").expect("remove");
        assert_eq!(paths(&map, &file), vec!["b/f"]);
        assert_eq!(map.get_id(b"b/f").expect("lookup"), Some(file));
    }

    #[test]
    fn cross_map_id_is_an_error() {
        let mut a = InodeIdMap::new("a");
        let mut b = InodeIdMap::new("b");
        let id_a = a.next();
        let _ = b.next();
        assert!(matches!(
            b.add_file(&id_a, b"f"),
            Err(ApplyError::ForeignInodeId { .. })
        ));
        assert!(b.get_paths(&id_a).is_err());
    }

    #[test]
    fn ids_from_different_maps_never_compare_equal() {
        let mut a = InodeIdMap::new("");
        let mut b = InodeIdMap::new("");
        let id_a = a.next();
        let id_b = b.next();
        assert_eq!(id_a.raw(), id_b.raw());
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn display_shows_description_and_paths() {
        let mut map = InodeIdMap::new("vol");
        let file = map.next();
        map.add_file(&file, b"one").expect("add");
        map.add_file(&file, b"two").expect("link");
        assert_eq!(format!("{file}"), "vol@one,two");
        map.set_description("vol@ab");
        assert_eq!(format!("{file}"), "vol@ab@one,two");
    }

    #[test]
    fn deep_clone_decouples_ids() {
        let mut map = InodeIdMap::new("orig");
        let dir = map.next();
        map.add_dir(&dir, b"d").expect("add");
        let file = map.next();
        map.add_file(&file, b"d/f").expect("add");

        let copy = map.deep_clone("copy");
        let copied_file = copy.get_id(b"d/f").expect("lookup").expect("path");
        assert_eq!(copied_file.raw(), file.raw());
        assert_ne!(copied_file, file);

        // Mutating the copy leaves the original alone.
        let mut copy = copy;
        copy.remove_path(b"d/f").expect("remove");
        assert_eq!(copy.get_id(b"d/f").expect("lookup"), None);
        assert_eq!(map.get_id(b"d/f").expect("lookup"), Some(file));
    }

    #[test]
    fn ids_order_by_content_not_allocation() {
        let mut alpha = InodeIdMap::new("alpha");
        let a = alpha.next();
        alpha.add_file(&a, b"f").expect("add");
        let mut beta = InodeIdMap::new("beta");
        let b = beta.next();
        beta.add_file(&b, b"f").expect("add");

        // Cross-map ordering follows the rendered names, whichever map
        // happened to be allocated first.
        assert!(a < b);
        assert!(beta.root_id() > a);

        // Within a map, the integer id decides.
        let a2 = alpha.next();
        alpha.add_file(&a2, b"g").expect("add");
        assert!(a < a2);

        // Distinct ids never compare equal, even with matching content.
        let twin = beta.deep_clone("beta");
        let twin_b = twin.get_id(b"f").expect("lookup").expect("path");
        assert_ne!(twin_b.cmp(&b), std::cmp::Ordering::Equal);
    }
}
