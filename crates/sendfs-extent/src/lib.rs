#![forbid(unsafe_code)]
//! Immutable extent history trees.
//!
//! An [`Extent`] records how a file's data fork came to be: a tree whose
//! leaves are contiguous `DATA` or `HOLE` runs and whose interior nodes are
//! ordered child lists trimmed by an `(offset, length)` window. The file
//! always has exactly one root extent at file offset zero.
//!
//! ## Key invariant: leaves are never replaced
//!
//! Operations (`write`, `truncate`, `clone_range`) return a new root that
//! *wraps* the old tree; they never rebuild or copy a leaf. Leaves are
//! reference-counted, and clone detection later identifies shared storage
//! purely by leaf pointer identity ([`Extent::leaf_id`]). Replacing a leaf
//! with an equal-content copy would silently discard clone information,
//! so construction-time normalization only ever drops whole children or
//! adjusts the trim window — it never creates a smaller leaf from a
//! bigger one.
//!
//! Two structurally identical leaves created by separate operations have
//! distinct [`LeafId`]s on purpose: equal content is not shared storage.

use std::cmp::min;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// What a leaf run is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Data,
    Hole,
}

impl Kind {
    /// One-letter abbreviation used by the compact run rendering.
    #[must_use]
    pub fn abbrev(self) -> char {
        match self {
            Kind::Data => 'd',
            Kind::Hole => 'h',
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtentError {
    /// Overlaying zero bytes has no defined semantics (should it punch a
    /// hole at EOF or do nothing?), so it is rejected outright.
    #[error("zero-length overlay at offset {offset} is not defined")]
    ZeroLengthOverlay { offset: u64 },

    /// A clone asked for bytes the source extent does not have.
    #[error(
        "clone source range {offset}+{length} exceeds source length {source_length}"
    )]
    SourceRangeOutOfBounds {
        offset: u64,
        length: u64,
        source_length: u64,
    },
}

enum Content {
    Leaf(Kind),
    Children(Vec<Extent>),
}

struct Node {
    content: Content,
    /// Hides the first `offset` bytes of the children. Always zero for
    /// leaves.
    offset: u64,
    length: u64,
}

impl Drop for Node {
    /// Histories grow one node per mutation, so the derived drop would
    /// recurse once per write. Detach children into a worklist instead;
    /// nodes still shared elsewhere are left alone and take the same
    /// iterative path when their last handle goes away.
    fn drop(&mut self) {
        let Content::Children(children) = &mut self.content else {
            return;
        };
        let mut queue = std::mem::take(children);
        while let Some(mut child) = queue.pop() {
            if let Some(node) = Rc::get_mut(&mut child.0) {
                if let Content::Children(grandchildren) = &mut node.content {
                    queue.append(&mut std::mem::take(grandchildren));
                }
            }
        }
    }
}

/// A shared handle to one node of an extent history tree.
///
/// Cloning an `Extent` clones the handle, not the tree; this is exactly
/// what snapshot and clone semantics require, since leaf identity must
/// survive the copy.
#[derive(Clone)]
pub struct Extent(Rc<Node>);

/// Identity handle for one created leaf. Stable for as long as any
/// `Extent` referencing the leaf is alive, which in practice means until
/// the resolver has finished flattening every file that shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafId(usize);

/// Construct a leaf run. A non-positive length is clamped to zero; the
/// zero-length leaf is then dropped by any composition it enters.
fn leaf(kind: Kind, length: i128) -> Extent {
    let length = u64::try_from(length.max(0)).unwrap_or(u64::MAX);
    Extent(Rc::new(Node {
        content: Content::Leaf(kind),
        offset: 0,
        length,
    }))
}

/// Compose children under an `(offset, length)` trim window, applying the
/// normalization rules:
/// - zero-length children are dropped;
/// - children fully hidden by the left offset are dropped, reducing the
///   offset accordingly;
/// - children entirely past `offset + length` are dropped;
/// - a single child exactly spanning `[0, length)` is returned directly
///   instead of being wrapped.
fn compose(children: Vec<Extent>, mut offset: u64, length: Option<u64>) -> Extent {
    let total: u64 = children.iter().map(Extent::length).sum();
    let max_length = total.saturating_sub(offset);
    let length = match length {
        Some(len) => {
            debug_assert!(len <= max_length, "length {len} > available {max_length}");
            min(len, max_length)
        }
        None => max_length,
    };

    let mut kept = Vec::with_capacity(children.len());
    let mut kept_len: u64 = 0;
    for child in children {
        if child.length() == 0 {
            continue;
        }
        // The left trim only ever hides a prefix: once a child is kept,
        // `offset` points into that child and later children are fully
        // visible on their left edge.
        if kept.is_empty() && child.length() <= offset {
            offset -= child.length();
            continue;
        }
        if kept_len >= offset.saturating_add(length) {
            continue;
        }
        kept_len += child.length();
        kept.push(child);
    }

    if kept.len() == 1 && offset == 0 && length == kept[0].length() {
        return kept.into_iter().next().unwrap_or_else(Extent::empty);
    }

    Extent(Rc::new(Node {
        content: Content::Children(kept),
        offset,
        length,
    }))
}

impl Extent {
    /// A zero-length extent: the data fork of a freshly created file.
    #[must_use]
    pub fn empty() -> Self {
        compose(Vec::new(), 0, None)
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.0.length
    }

    /// `Some(kind)` when this node is a ground-truth leaf.
    #[must_use]
    pub fn kind(&self) -> Option<Kind> {
        match self.0.content {
            Content::Leaf(kind) => Some(kind),
            Content::Children(_) => None,
        }
    }

    /// Pointer-identity handle for clone detection. Only meaningful for
    /// leaves, but well-defined for any node.
    #[must_use]
    pub fn leaf_id(&self) -> LeafId {
        LeafId(Rc::as_ptr(&self.0) as usize)
    }

    /// True when both handles refer to the same created node.
    #[must_use]
    pub fn same_node(&self, other: &Extent) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Overlay `what` at `offset`, synthesizing an explicit `HOLE` when
    /// `offset` lies past the current end.
    fn put(&self, offset: u64, what: Extent) -> Result<Extent, ExtentError> {
        if what.length() == 0 {
            return Err(ExtentError::ZeroLengthOverlay { offset });
        }
        let head = compose(vec![self.clone()], 0, Some(min(self.length(), offset)));
        let gap = leaf(Kind::Hole, i128::from(offset) - i128::from(self.length()));
        let tail = compose(
            vec![self.clone()],
            offset.saturating_add(what.length()),
            None,
        );
        Ok(compose(vec![head, gap, what, tail], 0, None))
    }

    /// Overlay a fresh `DATA` run at `[offset, offset + length)`.
    pub fn write(&self, offset: u64, length: u64) -> Result<Extent, ExtentError> {
        self.put(offset, leaf(Kind::Data, i128::from(length)))
    }

    /// Grow or shrink to exactly `length` bytes. Growth appends an
    /// explicit `HOLE`; shrinkage trims through the same overlay window
    /// mechanism `write` uses, preserving every surviving leaf.
    #[must_use]
    pub fn truncate(&self, length: u64) -> Extent {
        let gap = leaf(Kind::Hole, i128::from(length) - i128::from(self.length()));
        compose(vec![self.clone(), gap], 0, Some(length))
    }

    /// Overlay, at `to_offset`, a trimmed *view of another extent's
    /// identity*. The view wraps `from` rather than copying its leaves,
    /// which is what lets the resolver see the shared storage later.
    pub fn clone_range(
        &self,
        to_offset: u64,
        from: &Extent,
        from_offset: u64,
        length: u64,
    ) -> Result<Extent, ExtentError> {
        let available = from.length().saturating_sub(from_offset);
        if from_offset > from.length() || length > available {
            return Err(ExtentError::SourceRangeOutOfBounds {
                offset: from_offset,
                length,
                source_length: from.length(),
            });
        }
        self.put(to_offset, compose(vec![from.clone()], from_offset, Some(length)))
    }

    /// Flatten to the sequence of leaf runs a real filesystem would show
    /// for this byte range.
    ///
    /// The traversal runs on an explicit work stack: one file can
    /// accumulate an extent-tree level per operation, so native recursion
    /// would overflow the call stack on large files.
    #[must_use]
    pub fn trimmed_leaves(&self) -> TrimmedLeaves {
        TrimmedLeaves {
            stack: vec![Frame {
                idx: 0,
                calls: vec![Call {
                    extent: self.clone(),
                    offset: 0,
                    length: None,
                }],
            }],
        }
    }
}

impl fmt::Display for Extent {
    /// Compact run rendering: adjacent leaves of one kind merge, e.g. a
    /// 5-byte hole followed by 6 bytes of data renders as `h5d6`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut run: Option<(Kind, u64)> = None;
        for piece in self.trimmed_leaves() {
            let kind = match piece.leaf.kind() {
                Some(kind) => kind,
                None => continue,
            };
            match &mut run {
                Some((cur, len)) if *cur == kind => *len += piece.length,
                _ => {
                    if let Some((cur, len)) = run.take() {
                        write!(f, "{}{len}", cur.abbrev())?;
                    }
                    run = Some((kind, piece.length));
                }
            }
        }
        if let Some((cur, len)) = run {
            write!(f, "{}{len}", cur.abbrev())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Extent {
    // Derived Debug would recurse once per wrapping operation and blow
    // the stack on deep histories; render the flattened runs instead.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent({self})")
    }
}

/// One flattened leaf occurrence: `offset`/`length` trim `leaf` down to
/// the bytes actually visible at this position of the file.
#[derive(Debug, Clone)]
pub struct TrimmedLeaf {
    pub offset: u64,
    pub length: u64,
    pub leaf: Extent,
}

#[derive(Clone)]
struct Call {
    extent: Extent,
    offset: u64,
    length: Option<u64>,
}

struct Frame {
    idx: usize,
    calls: Vec<Call>,
}

/// Iterator over [`TrimmedLeaf`]s, driven by an explicit stack.
pub struct TrimmedLeaves {
    stack: Vec<Frame>,
}

enum Step {
    Yield(TrimmedLeaf),
    Skip,
    Recurse(Vec<Call>),
}

fn step(call: &Call) -> Step {
    let extent = &call.extent;
    let offset = call.offset;
    debug_assert!(offset <= extent.length());
    let max_length = extent.length() - offset;
    let length = call.length.unwrap_or(max_length);
    debug_assert!(length <= max_length);

    match &extent.0.content {
        Content::Leaf(_) => {
            let trimmed = min(length, extent.length() - offset);
            if trimmed > 0 {
                Step::Yield(TrimmedLeaf {
                    offset,
                    length: trimmed,
                    leaf: extent.clone(),
                })
            } else {
                Step::Skip
            }
        }
        Content::Children(children) => {
            let mut off = offset + extent.0.offset;
            let mut remaining = i128::from(length);
            let mut calls = Vec::new();
            for child in children {
                if child.length() > off {
                    let visible = child.length() - off;
                    let take = min(remaining.max(0) as u64, visible);
                    calls.push(Call {
                        extent: child.clone(),
                        offset: off,
                        length: Some(take),
                    });
                    remaining -= i128::from(visible);
                    if remaining <= 0 {
                        break;
                    }
                }
                off -= min(off, child.length());
            }
            Step::Recurse(calls)
        }
    }
}

impl Iterator for TrimmedLeaves {
    type Item = TrimmedLeaf;

    fn next(&mut self) -> Option<TrimmedLeaf> {
        while let Some(frame) = self.stack.last_mut() {
            if frame.idx == frame.calls.len() {
                self.stack.pop();
                continue;
            }
            let call = frame.calls[frame.idx].clone();
            frame.idx += 1;
            match step(&call) {
                Step::Yield(piece) => return Some(piece),
                Step::Skip => {}
                Step::Recurse(calls) => self.stack.push(Frame { idx: 0, calls }),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runs(extent: &Extent) -> String {
        extent.to_string()
    }

    #[test]
    fn empty_extent() {
        let e = Extent::empty();
        assert_eq!(e.length(), 0);
        assert_eq!(runs(&e), "");
        assert!(e.trimmed_leaves().next().is_none());
    }

    #[test]
    fn write_at_start() {
        let e = Extent::empty().write(0, 3).expect("write");
        assert_eq!(e.length(), 3);
        assert_eq!(runs(&e), "d3");
        let leaves: Vec<_> = e.trimmed_leaves().collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!((leaves[0].offset, leaves[0].length), (0, 3));
        assert_eq!(leaves[0].leaf.kind(), Some(Kind::Data));
    }

    #[test]
    fn write_past_end_synthesizes_hole() {
        let e = Extent::empty().write(5, 6).expect("write");
        assert_eq!(e.length(), 11);
        assert_eq!(runs(&e), "h5d6");
    }

    #[test]
    fn zero_length_write_rejected() {
        let err = Extent::empty().write(0, 0).unwrap_err();
        assert_eq!(err, ExtentError::ZeroLengthOverlay { offset: 0 });
        let err = Extent::empty().write(5, 0).unwrap_err();
        assert_eq!(err, ExtentError::ZeroLengthOverlay { offset: 5 });
    }

    #[test]
    fn truncate_grows_with_hole() {
        let e = Extent::empty().write(0, 4).expect("write").truncate(10);
        assert_eq!(e.length(), 10);
        assert_eq!(runs(&e), "d4h6");
    }

    #[test]
    fn truncate_shrinks_without_replacing_leaf() {
        let base = Extent::empty().write(0, 10).expect("write");
        let original_leaf = base.trimmed_leaves().next().expect("leaf").leaf;
        let shrunk = base.truncate(4);
        assert_eq!(shrunk.length(), 4);
        assert_eq!(runs(&shrunk), "d4");
        let leaf = shrunk.trimmed_leaves().next().expect("leaf");
        assert!(leaf.leaf.same_node(&original_leaf));
        assert_eq!((leaf.offset, leaf.length), (0, 4));
    }

    #[test]
    fn truncate_to_zero() {
        let e = Extent::empty().write(0, 7).expect("write").truncate(0);
        assert_eq!(e.length(), 0);
        assert_eq!(runs(&e), "");
    }

    #[test]
    fn overwrite_preserves_partially_covered_leaves() {
        let base = Extent::empty().write(0, 10).expect("write");
        let base_leaf = base.trimmed_leaves().next().expect("leaf").leaf;
        let over = base.write(2, 3).expect("write");
        assert_eq!(runs(&over), "d10");

        let leaves: Vec<_> = over.trimmed_leaves().collect();
        assert_eq!(leaves.len(), 3);
        // Head and tail are trims of the same original leaf object.
        assert!(leaves[0].leaf.same_node(&base_leaf));
        assert!(leaves[2].leaf.same_node(&base_leaf));
        assert!(!leaves[1].leaf.same_node(&base_leaf));
        assert_eq!((leaves[0].offset, leaves[0].length), (0, 2));
        assert_eq!((leaves[1].offset, leaves[1].length), (0, 3));
        assert_eq!((leaves[2].offset, leaves[2].length), (5, 5));
    }

    #[test]
    fn fully_covered_leaf_is_discarded() {
        let base = Extent::empty().write(0, 3).expect("write");
        let over = base.write(0, 3).expect("write");
        let leaves: Vec<_> = over.trimmed_leaves().collect();
        assert_eq!(leaves.len(), 1);
        let base_leaf = base.trimmed_leaves().next().expect("leaf").leaf;
        assert!(!leaves[0].leaf.same_node(&base_leaf));
    }

    #[test]
    fn clone_range_carries_identity() {
        let src = Extent::empty().write(0, 10).expect("write");
        let src_leaf = src.trimmed_leaves().next().expect("leaf").leaf;
        let dst = Extent::empty()
            .clone_range(0, &src, 2, 4)
            .expect("clone");
        assert_eq!(dst.length(), 4);
        assert_eq!(runs(&dst), "d4");
        let leaf = dst.trimmed_leaves().next().expect("leaf");
        assert!(leaf.leaf.same_node(&src_leaf));
        assert_eq!((leaf.offset, leaf.length), (2, 4));
    }

    #[test]
    fn clone_range_rejects_out_of_bounds() {
        let src = Extent::empty().write(0, 10).expect("write");
        let err = Extent::empty().clone_range(0, &src, 8, 4).unwrap_err();
        assert_eq!(
            err,
            ExtentError::SourceRangeOutOfBounds {
                offset: 8,
                length: 4,
                source_length: 10,
            }
        );
    }

    #[test]
    fn equal_content_leaves_have_distinct_ids() {
        let a = Extent::empty().write(0, 5).expect("write");
        let b = Extent::empty().write(0, 5).expect("write");
        let la = a.trimmed_leaves().next().expect("leaf").leaf;
        let lb = b.trimmed_leaves().next().expect("leaf").leaf;
        assert_ne!(la.leaf_id(), lb.leaf_id());
    }

    #[test]
    fn disjoint_op_order_does_not_change_runs() {
        // Same set of non-overlapping writes, composed in two orders.
        let ops: [(u64, u64); 3] = [(0, 2), (4, 3), (10, 1)];
        let mut forward = Extent::empty();
        for (off, len) in ops {
            forward = forward.write(off, len).expect("write");
        }
        let mut backward = Extent::empty();
        for (off, len) in ops.iter().rev() {
            backward = backward.write(*off, *len).expect("write");
        }
        // A trailing truncate to the common length normalizes EOF.
        let backward = backward.truncate(forward.length());
        assert_eq!(runs(&forward), runs(&backward));
    }

    #[test]
    fn deep_history_does_not_overflow_the_stack() {
        let mut e = Extent::empty();
        for i in 0..10_000_u64 {
            e = e.write(i, 1).expect("write");
        }
        assert_eq!(e.length(), 10_000);
        let total: u64 = e.trimmed_leaves().map(|piece| piece.length).sum();
        assert_eq!(total, 10_000);
        assert_eq!(runs(&e), "d10000");
    }

    #[test]
    fn deep_history_drops_without_recursion() {
        let mut e = Extent::empty();
        for i in 0..10_000_u64 {
            e = e.write(i, 1).expect("write");
        }
        // A second handle must keep the whole tree alive across the
        // first drop, and then free it iteratively itself.
        let survivor = e.clone();
        drop(e);
        assert_eq!(survivor.length(), 10_000);
        assert_eq!(runs(&survivor), "d10000");
        drop(survivor);
    }

    #[test]
    fn left_trim_stops_at_the_first_kept_child() {
        let e = compose(vec![leaf(Kind::Data, 10), leaf(Kind::Hole, 3)], 5, None);
        assert_eq!(e.length(), 8);
        assert_eq!(runs(&e), "d5h3");
    }

    #[test]
    fn hole_data_hole_sandwich() {
        let e = Extent::empty()
            .write(4, 2)
            .expect("write")
            .truncate(10);
        assert_eq!(runs(&e), "h4d2h4");
    }
}
