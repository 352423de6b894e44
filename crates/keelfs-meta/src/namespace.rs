//! In-memory namespace: the inode tree and the persistent part of the block map.
//!
//! Inodes live in an arena keyed by [`InodeId`]. A directory owns its
//! children through a name-ordered map of ids; the `parent` field on a child
//! is a plain id used only to rebuild paths, so the tree has no reference
//! cycles. Every mutation goes through [`Namespace::apply`] with a
//! [`LogRecord`], which makes replay after a crash the same code path as the
//! live write path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::edit_log::{LogOp, LogRecord};
use crate::types::*;

/// A file or directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct INode {
    /// Inode identifier
    pub id: InodeId,
    /// File or directory
    pub kind: InodeKind,
    /// Name within the parent ("" for the root)
    pub name: String,
    /// Parent directory; None only for the root
    pub parent: Option<InodeId>,
    /// Children by name (directories only)
    pub children: BTreeMap<String, InodeId>,
    /// Committed length in bytes (files only)
    pub size: u64,
    /// Modification time, ms since epoch
    pub mtime_ms: u64,
    /// Replication factor (files only)
    pub replication: u16,
    /// Blocks in file order (files only)
    pub blocks: Vec<BlockId>,
}

impl INode {
    fn directory(id: InodeId, name: String, parent: Option<InodeId>, mtime_ms: u64) -> Self {
        Self {
            id,
            kind: InodeKind::Directory,
            name,
            parent,
            children: BTreeMap::new(),
            size: 0,
            mtime_ms,
            replication: 0,
            blocks: Vec::new(),
        }
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }
}

/// Lifecycle of a block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    /// Allocated and being written by a pipeline
    UnderConstruction,
    /// Committed with a final length
    Complete,
}

/// Persistent facts about a block. Replica locations are soft state kept by
/// the block manager and rebuilt from block reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Block identifier
    pub id: BlockId,
    /// Owning file
    pub inode: InodeId,
    /// Committed length
    pub size: u64,
    /// Lifecycle state
    pub state: BlockState,
}

/// The namespace as of `last_applied`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    inodes: BTreeMap<InodeId, INode>,
    blocks: BTreeMap<BlockId, BlockMeta>,
    next_inode: u64,
    next_block: u64,
    last_applied: u64,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    /// Creates a namespace holding only the root directory.
    pub fn new() -> Self {
        let mut inodes = BTreeMap::new();
        inodes.insert(
            InodeId::ROOT,
            INode::directory(InodeId::ROOT, String::new(), None, 0),
        );
        Self {
            inodes,
            blocks: BTreeMap::new(),
            next_inode: InodeId::ROOT.as_u64() + 1,
            // Block ids start high so they never collide with inode ids in logs.
            next_block: 1 << 30,
            last_applied: 0,
        }
    }

    /// Sequence number of the last applied log record.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Number of inodes including the root.
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// The id the next created inode will get.
    pub fn next_inode_id(&self) -> InodeId {
        InodeId::new(self.next_inode)
    }

    /// The id the next allocated block will get.
    pub fn next_block_id(&self) -> BlockId {
        BlockId::new(self.next_block)
    }

    /// Looks up an inode by id.
    pub fn inode(&self, id: InodeId) -> Option<&INode> {
        self.inodes.get(&id)
    }

    /// Looks up a block by id.
    pub fn block(&self, id: BlockId) -> Option<&BlockMeta> {
        self.blocks.get(&id)
    }

    /// Iterates over every block known to the namespace.
    pub fn blocks(&self) -> impl Iterator<Item = &BlockMeta> {
        self.blocks.values()
    }

    /// Resolves an absolute path to an inode id.
    pub fn resolve(&self, path: &str) -> Result<InodeId, MetaError> {
        let mut current = InodeId::ROOT;
        for component in split_path(path)? {
            let node = self.get(current)?;
            if !node.is_dir() {
                return Err(MetaError::NotADirectory {
                    path: self.path_of(current),
                });
            }
            current = *node
                .children
                .get(component)
                .ok_or_else(|| MetaError::NotFound {
                    path: path.to_string(),
                })?;
        }
        Ok(current)
    }

    /// Resolves a path to its inode.
    pub fn lookup(&self, path: &str) -> Result<&INode, MetaError> {
        let id = self.resolve(path)?;
        self.get(id)
    }

    /// Resolves the parent directory of `path` and returns it with the final
    /// component. Fails for the root.
    pub fn resolve_parent<'p>(&self, path: &'p str) -> Result<(InodeId, &'p str), MetaError> {
        let components = split_path(path)?;
        let (name, ancestors) = components.split_last().ok_or(MetaError::InvalidPath {
            path: path.to_string(),
            reason: "operation not permitted on the root",
        })?;
        let mut current = InodeId::ROOT;
        for component in ancestors {
            let node = self.get(current)?;
            current = *node
                .children
                .get(*component)
                .ok_or_else(|| MetaError::NotFound {
                    path: path.to_string(),
                })?;
        }
        let parent = self.get(current)?;
        if !parent.is_dir() {
            return Err(MetaError::NotADirectory {
                path: self.path_of(current),
            });
        }
        Ok((current, name))
    }

    /// Rebuilds the absolute path of an inode by walking parent links.
    pub fn path_of(&self, id: InodeId) -> String {
        let mut names = Vec::new();
        let mut current = self.inodes.get(&id);
        while let Some(node) = current {
            match node.parent {
                Some(parent) => {
                    names.push(node.name.as_str());
                    current = self.inodes.get(&parent);
                }
                None => break,
            }
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Returns true if `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: InodeId, id: InodeId) -> bool {
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.inodes.get(&c).and_then(|n| n.parent);
        }
        false
    }

    /// Collects every block owned by the subtree rooted at `id`.
    pub fn subtree_blocks(&self, id: InodeId) -> Vec<BlockId> {
        let mut blocks = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.inodes.get(&current) {
                blocks.extend(node.blocks.iter().copied());
                stack.extend(node.children.values().copied());
            }
        }
        blocks
    }

    /// Builds the status summary of an inode.
    pub fn status(&self, id: InodeId, block_size: u64) -> Result<FileStatus, MetaError> {
        let node = self.get(id)?;
        Ok(FileStatus {
            path: self.path_of(id),
            name: node.name.clone(),
            kind: node.kind,
            len: node.size,
            mtime_ms: node.mtime_ms,
            replication: node.replication,
            block_size: if node.is_dir() { 0 } else { block_size },
        })
    }

    fn get(&self, id: InodeId) -> Result<&INode, MetaError> {
        self.inodes
            .get(&id)
            .ok_or_else(|| MetaError::Corrupted(format!("dangling inode reference {}", id)))
    }

    fn get_mut(&mut self, id: InodeId) -> Result<&mut INode, MetaError> {
        self.inodes
            .get_mut(&id)
            .ok_or_else(|| MetaError::Corrupted(format!("dangling inode reference {}", id)))
    }

    /// Applies one log record.
    ///
    /// Records must arrive in strict sequence order. Returns the blocks the
    /// record released (deleted files, abandoned blocks) so their replicas
    /// can be invalidated.
    pub fn apply(&mut self, record: &LogRecord) -> Result<Vec<BlockId>, MetaError> {
        if record.seq != self.last_applied + 1 {
            return Err(MetaError::Corrupted(format!(
                "log record {} applied after {}",
                record.seq, self.last_applied
            )));
        }
        let released = self.apply_op(&record.op)?;
        self.last_applied = record.seq;
        Ok(released)
    }

    fn apply_op(&mut self, op: &LogOp) -> Result<Vec<BlockId>, MetaError> {
        match op {
            LogOp::Create {
                parent,
                name,
                inode,
                kind,
                replication,
                mtime_ms,
            } => {
                let dir = self.get_mut(*parent)?;
                if !dir.is_dir() || dir.children.contains_key(name) {
                    return Err(MetaError::Corrupted(format!(
                        "cannot create {} under inode {}",
                        name, parent
                    )));
                }
                dir.children.insert(name.clone(), *inode);
                dir.mtime_ms = *mtime_ms;

                let mut node = INode::directory(*inode, name.clone(), Some(*parent), *mtime_ms);
                if *kind == InodeKind::File {
                    node.kind = InodeKind::File;
                    node.replication = *replication;
                }
                self.inodes.insert(*inode, node);
                self.next_inode = self.next_inode.max(inode.as_u64() + 1);
                Ok(Vec::new())
            }
            LogOp::Delete { inode, mtime_ms } => {
                let node = self.get(*inode)?;
                let parent = node.parent.ok_or_else(|| {
                    MetaError::Corrupted("delete of the root inode".to_string())
                })?;
                let name = node.name.clone();
                let released = self.subtree_blocks(*inode);

                let dir = self.get_mut(parent)?;
                dir.children.remove(&name);
                dir.mtime_ms = *mtime_ms;

                let mut stack = vec![*inode];
                while let Some(current) = stack.pop() {
                    if let Some(removed) = self.inodes.remove(&current) {
                        stack.extend(removed.children.into_values());
                    }
                }
                for block in &released {
                    self.blocks.remove(block);
                }
                Ok(released)
            }
            LogOp::Rename {
                inode,
                new_parent,
                new_name,
                mtime_ms,
            } => {
                let node = self.get(*inode)?;
                let old_parent = node.parent.ok_or_else(|| {
                    MetaError::Corrupted("rename of the root inode".to_string())
                })?;
                let old_name = node.name.clone();
                if self.get(*new_parent)?.children.contains_key(new_name) {
                    return Err(MetaError::Corrupted(format!(
                        "rename target {} exists under inode {}",
                        new_name, new_parent
                    )));
                }

                let src_dir = self.get_mut(old_parent)?;
                src_dir.children.remove(&old_name);
                src_dir.mtime_ms = *mtime_ms;

                let dst_dir = self.get_mut(*new_parent)?;
                dst_dir.children.insert(new_name.clone(), *inode);
                dst_dir.mtime_ms = *mtime_ms;

                let node = self.get_mut(*inode)?;
                node.parent = Some(*new_parent);
                node.name = new_name.clone();
                Ok(Vec::new())
            }
            LogOp::AddBlock { inode, block } => {
                let file = self.get_mut(*inode)?;
                if file.is_dir() {
                    return Err(MetaError::Corrupted(format!(
                        "block {} added to directory inode {}",
                        block, inode
                    )));
                }
                file.blocks.push(*block);
                self.blocks.insert(
                    *block,
                    BlockMeta {
                        id: *block,
                        inode: *inode,
                        size: 0,
                        state: BlockState::UnderConstruction,
                    },
                );
                self.next_block = self.next_block.max(block.as_u64() + 1);
                Ok(Vec::new())
            }
            LogOp::CommitBlock {
                inode,
                block,
                size,
                mtime_ms,
            } => {
                let meta = self
                    .blocks
                    .get_mut(block)
                    .ok_or(MetaError::UnknownBlock(*block))?;
                if meta.state != BlockState::UnderConstruction || meta.inode != *inode {
                    return Err(MetaError::Corrupted(format!(
                        "commit of block {} in unexpected state",
                        block
                    )));
                }
                meta.state = BlockState::Complete;
                meta.size = *size;
                let file = self.get_mut(*inode)?;
                file.size += *size;
                file.mtime_ms = *mtime_ms;
                Ok(Vec::new())
            }
            LogOp::AbandonBlock { inode, block } => {
                let file = self.get_mut(*inode)?;
                if file.blocks.last() != Some(block) {
                    return Err(MetaError::Corrupted(format!(
                        "abandon of block {} that is not the last block of inode {}",
                        block, inode
                    )));
                }
                file.blocks.pop();
                self.blocks.remove(block);
                Ok(vec![*block])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Builder {
        ns: Namespace,
        seq: u64,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                ns: Namespace::new(),
                seq: 0,
            }
        }

        fn apply(&mut self, op: LogOp) -> Vec<BlockId> {
            self.seq += 1;
            self.ns
                .apply(&LogRecord { seq: self.seq, op })
                .unwrap()
        }

        fn create(&mut self, parent: InodeId, name: &str, kind: InodeKind) -> InodeId {
            let inode = self.ns.next_inode_id();
            self.apply(LogOp::Create {
                parent,
                name: name.to_string(),
                inode,
                kind,
                replication: 3,
                mtime_ms: 10,
            });
            inode
        }
    }

    #[test]
    fn test_new_has_root() {
        let ns = Namespace::new();
        assert_eq!(ns.resolve("/").unwrap(), InodeId::ROOT);
        assert_eq!(ns.path_of(InodeId::ROOT), "/");
        assert_eq!(ns.inode_count(), 1);
    }

    #[test]
    fn test_create_and_resolve() {
        let mut b = Builder::new();
        let a = b.create(InodeId::ROOT, "a", InodeKind::Directory);
        let f = b.create(a, "f.txt", InodeKind::File);

        assert_eq!(b.ns.resolve("/a/f.txt").unwrap(), f);
        assert_eq!(b.ns.path_of(f), "/a/f.txt");
        assert_eq!(b.ns.lookup("/a/f.txt").unwrap().replication, 3);
        assert!(matches!(
            b.ns.resolve("/a/missing"),
            Err(MetaError::NotFound { .. })
        ));
        assert!(matches!(
            b.ns.resolve("/a/f.txt/x"),
            Err(MetaError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_resolve_parent() {
        let mut b = Builder::new();
        let a = b.create(InodeId::ROOT, "a", InodeKind::Directory);
        assert_eq!(b.ns.resolve_parent("/a/new").unwrap(), (a, "new"));
        assert!(matches!(
            b.ns.resolve_parent("/"),
            Err(MetaError::InvalidPath { .. })
        ));
        assert!(matches!(
            b.ns.resolve_parent("/x/y"),
            Err(MetaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let mut b = Builder::new();
        let a = b.create(InodeId::ROOT, "a", InodeKind::Directory);
        let c = b.create(InodeId::ROOT, "c", InodeKind::Directory);
        let f = b.create(a, "f", InodeKind::File);
        b.apply(LogOp::Rename {
            inode: a,
            new_parent: c,
            new_name: "moved".to_string(),
            mtime_ms: 20,
        });
        assert_eq!(b.ns.path_of(f), "/c/moved/f");
        assert!(b.ns.resolve("/a").is_err());
        assert!(b.ns.is_ancestor(c, f));
    }

    #[test]
    fn test_delete_releases_blocks() {
        let mut b = Builder::new();
        let a = b.create(InodeId::ROOT, "a", InodeKind::Directory);
        let f = b.create(a, "f", InodeKind::File);
        let block = b.ns.next_block_id();
        b.apply(LogOp::AddBlock { inode: f, block });
        b.apply(LogOp::CommitBlock {
            inode: f,
            block,
            size: 100,
            mtime_ms: 30,
        });
        assert_eq!(b.ns.inode(f).unwrap().size, 100);

        let released = b.apply(LogOp::Delete {
            inode: a,
            mtime_ms: 40,
        });
        assert_eq!(released, vec![block]);
        assert!(b.ns.block(block).is_none());
        assert!(b.ns.inode(f).is_none());
        assert_eq!(b.ns.inode_count(), 1);
    }

    #[test]
    fn test_abandon_removes_last_block() {
        let mut b = Builder::new();
        let f = b.create(InodeId::ROOT, "f", InodeKind::File);
        let block = b.ns.next_block_id();
        b.apply(LogOp::AddBlock { inode: f, block });
        assert_eq!(
            b.ns.block(block).unwrap().state,
            BlockState::UnderConstruction
        );
        let released = b.apply(LogOp::AbandonBlock { inode: f, block });
        assert_eq!(released, vec![block]);
        assert!(b.ns.inode(f).unwrap().blocks.is_empty());
        // Ids are never reused.
        assert!(b.ns.next_block_id() > block);
    }

    #[test]
    fn test_out_of_order_record_rejected() {
        let mut ns = Namespace::new();
        let err = ns
            .apply(&LogRecord {
                seq: 2,
                op: LogOp::Delete {
                    inode: InodeId::new(5),
                    mtime_ms: 0,
                },
            })
            .unwrap_err();
        assert!(matches!(err, MetaError::Corrupted(_)));
        assert_eq!(ns.last_applied(), 0);
    }

    #[test]
    fn test_status() {
        let mut b = Builder::new();
        let f = b.create(InodeId::ROOT, "f", InodeKind::File);
        let st = b.ns.status(f, 1024).unwrap();
        assert_eq!(st.path, "/f");
        assert_eq!(st.name, "f");
        assert!(!st.is_dir());
        assert_eq!(st.block_size, 1024);
    }
}
