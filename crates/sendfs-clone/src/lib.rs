#![forbid(unsafe_code)]
//! Turns history-preserving extent trees into flat, clone-annotated
//! [`Chunk`] sequences.
//!
//! The output is deliberately normalized: it depends only on the final
//! filesystem state, never on the order of the operations that built it.
//! Every pair of file ranges sharing storage is reported symmetrically in
//! *both* files' chunks; for N files sharing one range that is N*(N-1)/2
//! references instead of a spanning tree's N-1. The redundancy is the
//! point: the symmetric form is unique, so no reader has to understand a
//! tree-selection rule. Copy counts in practice are small enough that the
//! quadratic size never matters.
//!
//! Holes participate in clone tracking like data does. Real btrfs likely
//! does not track shared holes (they save no space), but nothing here
//! ignores them, and the extra references are harmless to consumers.
//!
//! Adjacent chunk clones created by separate `clone` operations are NOT
//! merged, only the chunks themselves are.
//!
//! The per-leaf computation is the classic interval-overlap sweep: sort
//! interval starts and ends, scan once, track the open set. Ends sort
//! before starts at the same position, so intervals that merely touch do
//! not count as overlapping. All the work happens on ends, and the
//! relationship is recorded in both directions at once, so the relative
//! order of ends at one position cannot matter.

use std::collections::{BTreeSet, HashMap};

use sendfs_extent::{Extent, LeafId};
use sendfs_inode::{Chunk, ChunkClone, CloneRef};
use sendfs_path::InodeId;
use tracing::debug;

/// One occurrence of a leaf extent inside one inode's flattened fork.
///
/// A single inode can contain the same leaf twice at the same trim, so
/// `(leaf_offset, length)` alone does not identify an occurrence; the
/// position in the flattening (`leaf_idx`) does. The two occurrences must
/// get different clone lists anyway: each refers to the other, never to
/// itself.
#[derive(Clone)]
struct LeafRef {
    inode: InodeId,
    /// Offset of this occurrence in the inode's file layout.
    inode_offset: u64,
    length: u64,
    /// Trim of the underlying leaf at this occurrence.
    leaf_offset: u64,
    /// Position in the inode's flattened-leaf sequence.
    leaf_idx: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Interval end. Sorts before `Push` at equal positions.
    Pop,
    /// Interval start.
    Push,
}

struct Op {
    pos: u64,
    action: Action,
    ref_idx: usize,
}

/// The intervals of all occurrences of one leaf, across all inodes.
#[derive(Default)]
struct LeafGroup {
    refs: Vec<LeafRef>,
    ops: Vec<Op>,
}

fn group_by_leaf(ids_and_extents: &[(InodeId, Extent)]) -> HashMap<LeafId, LeafGroup> {
    let mut groups: HashMap<LeafId, LeafGroup> = HashMap::new();
    for (inode, extent) in ids_and_extents {
        let mut file_offset = 0_u64;
        for (leaf_idx, piece) in extent.trimmed_leaves().enumerate() {
            let group = groups.entry(piece.leaf.leaf_id()).or_default();
            let ref_idx = group.refs.len();
            group.refs.push(LeafRef {
                inode: inode.clone(),
                inode_offset: file_offset,
                length: piece.length,
                leaf_offset: piece.offset,
                leaf_idx,
            });
            group.ops.push(Op {
                pos: piece.offset,
                action: Action::Push,
                ref_idx,
            });
            group.ops.push(Op {
                pos: piece.offset + piece.length,
                action: Action::Pop,
                ref_idx,
            });
            file_offset += piece.length;
        }
    }
    groups
}

/// Sweep one leaf's intervals; append each discovered clone to the
/// per-(inode, leaf occurrence) lists. Clone offsets recorded here are
/// relative to the *leaf*, not the file; the final assembly rebases them.
fn sweep_group(
    group: &mut LeafGroup,
    clones: &mut HashMap<(InodeId, usize), Vec<(u64, CloneRef)>>,
) {
    let refs = &group.refs;
    group.ops.sort_by(|a, b| {
        let key = |op: &Op| {
            let r = &refs[op.ref_idx];
            (
                op.pos,
                op.action == Action::Push,
                r.leaf_offset,
                r.leaf_idx,
                r.inode_offset,
                r.length,
                r.inode.clone(),
            )
        };
        key(a).cmp(&key(b))
    });

    let mut active: BTreeSet<usize> = BTreeSet::new();
    for op in &group.ops {
        match op.action {
            Action::Push => {
                active.insert(op.ref_idx);
            }
            Action::Pop => {
                active.remove(&op.ref_idx);
                let popped = &refs[op.ref_idx];
                for &other_idx in &active {
                    let other = &refs[other_idx];
                    // The shared range starts at the later of the two
                    // trims and runs to the popped interval's end.
                    let start = popped.leaf_offset.max(other.leaf_offset);
                    let length = op.pos - start;

                    // `other` clones part of `popped`'s inode...
                    clones
                        .entry((popped.inode.clone(), popped.leaf_idx))
                        .or_default()
                        .push((
                            start,
                            CloneRef {
                                inode_id: other.inode.clone(),
                                offset: other.inode_offset + (start - other.leaf_offset),
                                length,
                            },
                        ));
                    // ...and `popped` clones part of `other`'s inode.
                    clones
                        .entry((other.inode.clone(), other.leaf_idx))
                        .or_default()
                        .push((
                            start,
                            CloneRef {
                                inode_id: popped.inode.clone(),
                                offset: popped.inode_offset + (start - popped.leaf_offset),
                                length,
                            },
                        ));
                }
            }
        }
    }
}

/// Flattens each extent into its [`Chunk`] sequence, annotating every
/// cross-inode (and intra-inode) shared byte range symmetrically.
///
/// The same leaf may be shared across subvolumes; callers aggregating
/// several volumes pass all their files in one call so the sweep sees
/// every occurrence.
#[must_use]
pub fn extents_to_chunks_with_clones(
    ids_and_extents: &[(InodeId, Extent)],
) -> HashMap<InodeId, Vec<Chunk>> {
    let mut groups = group_by_leaf(ids_and_extents);
    debug!(
        files = ids_and_extents.len(),
        leaves = groups.len(),
        "resolving clones"
    );
    let mut clones: HashMap<(InodeId, usize), Vec<(u64, CloneRef)>> = HashMap::new();
    for group in groups.values_mut() {
        sweep_group(group, &mut clones);
    }

    let mut out = HashMap::new();
    for (inode, extent) in ids_and_extents {
        let mut chunks: Vec<Chunk> = Vec::new();
        for (leaf_idx, piece) in extent.trimmed_leaves().enumerate() {
            let kind = match piece.leaf.kind() {
                Some(kind) => kind,
                None => continue,
            };
            // Adjacent same-kind runs merge into one chunk; a clone's
            // chunk offset is its leaf-relative offset, shifted into the
            // merged chunk's coordinates.
            let (prev_length, mut chunk_clones) = match chunks.pop() {
                Some(last) if last.kind == kind => (last.length, last.clones),
                Some(last) => {
                    chunks.push(last);
                    (0, BTreeSet::new())
                }
                None => (0, BTreeSet::new()),
            };
            for (clone_offset, clone) in clones
                .remove(&(inode.clone(), leaf_idx))
                .unwrap_or_default()
            {
                chunk_clones.insert(ChunkClone {
                    offset: clone_offset + prev_length - piece.offset,
                    clone,
                });
            }
            chunks.push(Chunk {
                kind,
                length: piece.length + prev_length,
                clones: chunk_clones,
            });
        }
        out.insert(inode.clone(), chunks);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendfs_extent::Kind;
    use sendfs_path::InodeIdMap;

    fn render(chunks: &[Chunk]) -> String {
        chunks
            .iter()
            .map(|c| {
                let mut s = format!("{}{}", c.kind.abbrev(), c.length);
                if !c.clones.is_empty() {
                    let clones = c
                        .clones
                        .iter()
                        .map(ChunkClone::to_string)
                        .collect::<Vec<_>>()
                        .join("/");
                    s.push('(');
                    s.push_str(&clones);
                    s.push(')');
                }
                s
            })
            .collect()
    }

    fn named_id(map: &mut InodeIdMap, name: &[u8]) -> InodeId {
        let id = map.next();
        map.add_file(&id, name).expect("add");
        id
    }

    #[test]
    fn unshared_file_has_no_clones() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let extent = Extent::empty().write(0, 5).expect("write").truncate(8);
        let result = extents_to_chunks_with_clones(&[(a.clone(), extent)]);
        assert_eq!(render(&result[&a]), "d5h3");
    }

    #[test]
    fn adjacent_same_kind_runs_merge() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let extent = Extent::empty()
            .write(0, 3)
            .expect("write")
            .write(3, 4)
            .expect("write");
        let result = extents_to_chunks_with_clones(&[(a.clone(), extent)]);
        assert_eq!(render(&result[&a]), "d7");
    }

    #[test]
    fn full_file_clone_is_symmetric() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let b = named_id(&mut map, b"b");
        let src = Extent::empty().write(0, 6).expect("write");
        let dst = Extent::empty()
            .clone_range(0, &src, 0, 6)
            .expect("clone");
        let result =
            extents_to_chunks_with_clones(&[(a.clone(), src), (b.clone(), dst)]);
        assert_eq!(render(&result[&a]), "d6(b:0+6@0)");
        assert_eq!(render(&result[&b]), "d6(a:0+6@0)");
    }

    #[test]
    fn partial_clone_reports_the_shared_range_only() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let b = named_id(&mut map, b"b");
        let src = Extent::empty().write(0, 10).expect("write");
        // b = bytes 2..7 of a, placed at offset 1 after a 1-byte hole.
        let dst = Extent::empty()
            .truncate(1)
            .clone_range(1, &src, 2, 5)
            .expect("clone");
        let result =
            extents_to_chunks_with_clones(&[(a.clone(), src), (b.clone(), dst)]);
        assert_eq!(render(&result[&a]), "d10(b:1+5@2)");
        assert_eq!(render(&result[&b]), "h1d5(a:2+5@0)");
    }

    #[test]
    fn three_way_share_is_quadratic() {
        // The docblock figure: one 10-byte extent, A holds 0-2 and 6-8,
        // B holds 1-5, C holds 3-7.
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let b = named_id(&mut map, b"b");
        let c = named_id(&mut map, b"c");
        let disk = Extent::empty().write(0, 10).expect("write");
        let ext_a = Extent::empty()
            .clone_range(0, &disk, 0, 3)
            .expect("clone")
            .clone_range(3, &disk, 6, 3)
            .expect("clone");
        let ext_b = Extent::empty().clone_range(0, &disk, 1, 5).expect("clone");
        let ext_c = Extent::empty().clone_range(0, &disk, 3, 5).expect("clone");
        // Only a, b, c are files on the filesystem; `disk` stands for the
        // original extent and is dropped.
        let result = extents_to_chunks_with_clones(&[
            (a.clone(), ext_a),
            (b.clone(), ext_b),
            (c.clone(), ext_c),
        ]);
        // Chunk clones sort by their in-chunk offset.
        assert_eq!(render(&result[&a]), "d6(b:0+2@1/c:3+2@3)");
        assert_eq!(render(&result[&b]), "d5(a:1+2@0/c:0+3@2)");
        assert_eq!(render(&result[&c]), "d5(b:2+3@0/a:3+2@3)");
    }

    #[test]
    fn self_clone_within_one_file() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let base = Extent::empty().write(0, 4).expect("write");
        let doubled = base.clone_range(4, &base, 0, 4).expect("clone");
        let result = extents_to_chunks_with_clones(&[(a.clone(), doubled)]);
        assert_eq!(render(&result[&a]), "d8(a:4+4@0/a:0+4@4)");
    }

    #[test]
    fn holes_are_clone_tracked_too() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let b = named_id(&mut map, b"b");
        let src = Extent::empty().truncate(6);
        let dst = Extent::empty().clone_range(0, &src, 0, 6).expect("clone");
        let result =
            extents_to_chunks_with_clones(&[(a.clone(), src), (b.clone(), dst)]);
        assert_eq!(result[&a][0].kind, Kind::Hole);
        assert_eq!(render(&result[&a]), "h6(b:0+6@0)");
        assert_eq!(render(&result[&b]), "h6(a:0+6@0)");
    }

    #[test]
    fn touching_intervals_do_not_overlap() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let b = named_id(&mut map, b"b");
        let disk = Extent::empty().write(0, 10).expect("write");
        let ext_a = Extent::empty().clone_range(0, &disk, 0, 5).expect("clone");
        let ext_b = Extent::empty().clone_range(0, &disk, 5, 5).expect("clone");
        let result = extents_to_chunks_with_clones(&[(a.clone(), ext_a), (b.clone(), ext_b)]);
        assert_eq!(render(&result[&a]), "d5");
        assert_eq!(render(&result[&b]), "d5");
    }

    #[test]
    fn equal_content_without_shared_leaf_is_not_a_clone() {
        let mut map = InodeIdMap::new("");
        let a = named_id(&mut map, b"a");
        let b = named_id(&mut map, b"b");
        let ext_a = Extent::empty().write(0, 5).expect("write");
        let ext_b = Extent::empty().write(0, 5).expect("write");
        let result = extents_to_chunks_with_clones(&[(a.clone(), ext_a), (b.clone(), ext_b)]);
        assert_eq!(render(&result[&a]), "d5");
        assert_eq!(render(&result[&b]), "d5");
    }
}
