//! JSON-friendly views of a frozen subvolume.
//!
//! The rendered form is `[inode, {"name": child, ...}]` for directories
//! and `[inode]` for files, where `inode` is the compact `Display` string
//! of the [`Inode`](sendfs_inode::Inode). It is meant for humans and for
//! tools like `jq`, not for lossless round-tripping.
//!
//! Inodes that appear at several paths (hardlinks) are emitted as
//! `[repr, id]` pairs so the aliasing is visible; the ids are small,
//! dense, and deterministic: they number the repeated inodes in the order
//! a bottom-up, name-sorted traversal first completes them. Inodes with a
//! single path stay bare strings, which keeps small fixtures readable.

use std::collections::{BTreeMap, HashMap};

use sendfs_error::{ApplyError, Result};
use sendfs_path::InodeId;
use sendfs_types::{display_path, split_path};
use serde_json::{json, Map, Value};

use crate::FrozenSubvolume;

/// The final name component, which for a direct child is its name under
/// the parent directory. The root renders as ".".
fn child_name(path: &[u8]) -> String {
    match split_path(path).last() {
        Some(last) => display_path(last),
        None => ".".to_owned(),
    }
}

struct Frame<T> {
    path: Vec<u8>,
    id: InodeId,
    /// Child full paths still to traverse, reversed so `pop` yields name
    /// order. `None` for files.
    pending: Option<Vec<Vec<u8>>>,
    done: BTreeMap<String, T>,
}

/// Walk every path bottom-up, children in name order, calling `complete`
/// once per finished subtree with the completed children's results (or
/// `None` for a file). Returns the root's result. Iterative, so nesting
/// depth cannot overflow the call stack.
fn traverse_bottom_up<T, F>(subvol: &FrozenSubvolume, mut complete: F) -> Result<T>
where
    F: FnMut(&[u8], &InodeId, Option<BTreeMap<String, T>>) -> Result<T>,
{
    let open = |path: Vec<u8>| -> Result<Frame<T>> {
        let id = subvol
            .id_map()
            .get_id(&path)?
            .ok_or_else(|| ApplyError::Internal {
                detail: format!("rendering missing path {}", display_path(&path)),
            })?;
        let pending = subvol.id_map().get_children(&id)?.map(|children| {
            let mut paths: Vec<Vec<u8>> = children.into_iter().collect();
            paths.reverse();
            paths
        });
        Ok(Frame {
            path,
            id,
            pending,
            done: BTreeMap::new(),
        })
    };

    let mut stack = vec![open(b".".to_vec())?];
    loop {
        let top = stack.last_mut().ok_or_else(|| ApplyError::Internal {
            detail: "render traversal stack underflow".to_owned(),
        })?;
        if let Some(next) = top.pending.as_mut().and_then(Vec::pop) {
            let frame = open(next)?;
            stack.push(frame);
            continue;
        }
        let frame = stack.pop().ok_or_else(|| ApplyError::Internal {
            detail: "render traversal stack underflow".to_owned(),
        })?;
        let names = frame.pending.map(|_| frame.done);
        let result = complete(&frame.path, &frame.id, names)?;
        match stack.last_mut() {
            Some(parent) => {
                parent.done.insert(child_name(&frame.path), result);
            }
            None => return Ok(result),
        }
    }
}

pub(crate) fn render(subvol: &FrozenSubvolume) -> Result<Value> {
    // First pass: count how often each inode is completed and fix the
    // dense ids of the repeated ones, in first-completion order.
    let mut visit_counts: HashMap<u64, u32> = HashMap::new();
    let mut completion_order: Vec<u64> = Vec::new();
    traverse_bottom_up(subvol, |_, id, _: Option<BTreeMap<String, ()>>| {
        let count = visit_counts.entry(id.raw()).or_insert(0);
        if *count == 0 {
            completion_order.push(id.raw());
        }
        *count += 1;
        Ok(())
    })?;
    let mut dense_ids: HashMap<u64, u64> = HashMap::new();
    for raw in completion_order {
        if visit_counts.get(&raw).copied().unwrap_or(0) >= 2 {
            let next = dense_ids.len() as u64;
            dense_ids.insert(raw, next);
        }
    }

    // Second pass: the same traversal, now assembling the value tree.
    traverse_bottom_up(subvol, |_, id, children| {
        let ino = subvol
            .inodes
            .get(&id.raw())
            .ok_or_else(|| ApplyError::Internal {
                detail: format!("rendering {id} with no inode"),
            })?;
        let repr = match dense_ids.get(&id.raw()) {
            Some(dense) => json!([ino.to_string(), dense]),
            None => json!(ino.to_string()),
        };
        Ok(match children {
            None => json!([repr]),
            Some(children) => {
                let mut map = Map::new();
                for (name, child) in children {
                    map.insert(name, child);
                }
                Value::Array(vec![repr, Value::Object(map)])
            }
        })
    })
}
