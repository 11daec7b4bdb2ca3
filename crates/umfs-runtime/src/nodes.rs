//! Node registry
//!
//! Tracks which cookies name live nodes and, with path tracking on, the
//! full path of each. Attributes and reference counts belong to the
//! filesystem implementation, not to this table.

use std::collections::HashMap;

use umfs_core::id::Cookie;
use umfs_core::path::{FsPath, PathOps};

/// One filesystem object known to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub cookie: Cookie,
    pub path: Option<FsPath>,
}

/// Live nodes of a mount, keyed by cookie
#[derive(Debug)]
pub struct NodeTable {
    nodes: HashMap<Cookie, Node>,
}

impl NodeTable {
    /// Table holding only the root node
    pub fn new(root: Cookie, root_path: Option<FsPath>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                cookie: root,
                path: root_path,
            },
        );
        Self { nodes }
    }

    /// Record a node, returning the one it replaces
    pub fn insert(&mut self, cookie: Cookie, path: Option<FsPath>) -> Option<Node> {
        self.nodes.insert(cookie, Node { cookie, path })
    }

    pub fn remove(&mut self, cookie: Cookie) -> Option<Node> {
        self.nodes.remove(&cookie)
    }

    pub fn get(&self, cookie: Cookie) -> Option<&Node> {
        self.nodes.get(&cookie)
    }

    pub fn path(&self, cookie: Cookie) -> Option<&FsPath> {
        self.nodes.get(&cookie).and_then(|n| n.path.as_ref())
    }

    pub fn contains(&self, cookie: Cookie) -> bool {
        self.nodes.contains_key(&cookie)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Move every node at or under `from` to the same place under `to`
    ///
    /// Returns the number of paths rewritten. A path the strategy refuses
    /// to rebase is left as it was.
    pub fn rename_subtree(&mut self, ops: &dyn PathOps, from: &FsPath, to: &FsPath) -> usize {
        let mut moved = 0;
        for node in self.nodes.values_mut() {
            let Some(old) = node.path.as_ref() else { continue };
            if !ops.is_under(old, from) {
                continue;
            }
            match ops.rebase(old, from, to) {
                Ok(new) => {
                    if let Some(old) = node.path.replace(new) {
                        ops.release(old);
                    }
                    moved += 1;
                }
                Err(e) => {
                    tracing::warn!(cookie = %node.cookie, errno = %e, "path rewrite refused");
                }
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umfs_core::path::SlashPaths;

    #[test]
    fn test_insert_and_remove() {
        let mut t = NodeTable::new(Cookie(1), Some(FsPath::root()));
        assert_eq!(t.len(), 1);
        assert!(t.insert(Cookie(2), Some(FsPath::new("/a"))).is_none());
        assert_eq!(t.path(Cookie(2)), Some(&FsPath::new("/a")));
        assert_eq!(t.remove(Cookie(2)).map(|n| n.cookie), Some(Cookie(2)));
        assert!(!t.contains(Cookie(2)));
    }

    #[test]
    fn test_rename_subtree() {
        let ops = SlashPaths::default();
        let mut t = NodeTable::new(Cookie(1), Some(FsPath::root()));
        t.insert(Cookie(2), Some(FsPath::new("/a")));
        t.insert(Cookie(3), Some(FsPath::new("/a/b")));
        t.insert(Cookie(4), Some(FsPath::new("/ab")));
        t.insert(Cookie(5), None);

        let moved = t.rename_subtree(&ops, &FsPath::new("/a"), &FsPath::new("/z/y"));
        assert_eq!(moved, 2);
        assert_eq!(t.path(Cookie(2)), Some(&FsPath::new("/z/y")));
        assert_eq!(t.path(Cookie(3)), Some(&FsPath::new("/z/y/b")));
        assert_eq!(t.path(Cookie(4)), Some(&FsPath::new("/ab")));
        assert_eq!(t.path(Cookie(1)), Some(&FsPath::root()));
    }
}
