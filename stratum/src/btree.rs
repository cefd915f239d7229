//! Disk-backed B+ tree.
//!
//! Nodes live on fixed-size pages reached through the buffer pool; only the
//! pages touched by an operation are materialized. Keys are unique: inserting
//! an existing key overwrites its value. Deletes do not rebalance; occupancy
//! below half is accepted and repaired offline (see `rebalance`).

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;

use crate::buffer_pool::BufferPool;
use crate::codec::{Codec, KeyOrder};
use crate::disk::DiskManager;
use crate::error::{Error, Result};
use crate::node::{decode_node, encode_node, InternalNode, LeafNode, Node};
use crate::page::PageId;

/// Structural statistics gathered by a full tree traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub leaf_nodes: usize,
    pub internal_nodes: usize,
    pub total_keys: usize,
    pub average_fill: f64,
    pub max_depth: usize,
}

impl fmt::Display for TreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TreeStats{{total_nodes={}, leaf_nodes={}, internal_nodes={}, total_keys={}, avg_fill={:.2}, max_depth={}}}",
            self.total_nodes,
            self.leaf_nodes,
            self.internal_nodes,
            self.total_keys,
            self.average_fill,
            self.max_depth
        )
    }
}

#[derive(Default)]
struct StatsCollector {
    total_nodes: usize,
    leaf_nodes: usize,
    internal_nodes: usize,
    total_keys: usize,
    max_depth: usize,
}

/// A paged B+ tree over a buffer pool. `order` is the maximum number of keys
/// a node may hold before it must split.
pub struct BPlusTree<K, V> {
    order: usize,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    key_order: Arc<dyn KeyOrder<K>>,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    root: RwLock<PageId>,
}

impl<K, V> BPlusTree<K, V>
where
    K: Clone,
    V: Clone,
{
    /// Opens (or creates) a tree file. A fresh file gets a metadata page at
    /// page 0 and an empty root leaf at page 1.
    pub fn open<P: AsRef<Path>>(
        path: P,
        order: usize,
        buffer_pool_size: usize,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        key_order: Arc<dyn KeyOrder<K>>,
    ) -> Result<Self> {
        let disk = Arc::new(DiskManager::open(path)?);
        let pool = Arc::new(BufferPool::new(Arc::clone(&disk), buffer_pool_size));

        let tree = BPlusTree {
            order,
            key_codec,
            value_codec,
            key_order,
            disk,
            pool,
            root: RwLock::new(PageId::INVALID),
        };
        tree.initialize()?;
        Ok(tree)
    }

    fn initialize(&self) -> Result<()> {
        if self.disk.file_size()? == 0 {
            let metadata_page = self.pool.new_page()?;
            let root_page = self.pool.new_page()?;
            let root_id = root_page.id();

            let root: Node<K, V> = Node::Leaf(LeafNode::empty());
            root_page.write_data(&encode_node(&root, &*self.key_codec, &*self.value_codec)?)?;

            *self.root.write() = root_id;
            self.save_root_page_id()?;

            self.pool.unpin_page(root_id, true)?;
            self.pool.unpin_page(metadata_page.id(), true)?;
        } else {
            *self.root.write() = self.load_root_page_id()?;
        }
        Ok(())
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn save_root_page_id(&self) -> Result<()> {
        let page = self.pool.fetch_page(PageId::METADATA)?;
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.root.read().to_raw());
        let result = page.write_data(&buf);
        self.pool.unpin_page(PageId::METADATA, true)?;
        result
    }

    fn load_root_page_id(&self) -> Result<PageId> {
        let page = self.pool.fetch_page(PageId::METADATA)?;
        let data = page.read_data();
        self.pool.unpin_page(PageId::METADATA, false)?;

        if data.len() >= 8 {
            let mut buf = &data[..8];
            let raw = buf.get_u64();
            if raw != 0 {
                return Ok(PageId::from_raw(raw));
            }
        }
        // Metadata never written: fall back to the initial root location.
        Ok(PageId::new(1))
    }

    fn load_node(&self, page_id: PageId) -> Result<Node<K, V>> {
        let page = self.pool.fetch_page(page_id)?;
        let data = page.read_data();
        let result = decode_node(&data, &*self.key_codec, &*self.value_codec);
        self.pool.unpin_page(page_id, false)?;
        result
    }

    fn load_leaf(&self, page_id: PageId) -> Result<LeafNode<K, V>> {
        match self.load_node(page_id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(Error::corruption(format!(
                "expected leaf node on page {page_id}"
            ))),
        }
    }

    fn save_node(&self, page_id: PageId, node: &Node<K, V>) -> Result<()> {
        let bytes = encode_node(node, &*self.key_codec, &*self.value_codec)?;
        let page = self.pool.fetch_page(page_id)?;
        let result = page.write_data(&bytes);
        self.pool.unpin_page(page_id, true)?;
        result
    }

    /// Writes a node into a freshly allocated page and returns its id.
    fn save_new_node(&self, node: &Node<K, V>) -> Result<PageId> {
        let bytes = encode_node(node, &*self.key_codec, &*self.value_codec)?;
        let page = self.pool.new_page()?;
        let page_id = page.id();
        let result = page.write_data(&bytes);
        self.pool.unpin_page(page_id, true)?;
        result.map(|_| page_id)
    }

    /// Index of the first key not less than `key`, or an exact match.
    fn lower_bound(&self, keys: &[K], key: &K) -> usize {
        let mut left = 0;
        let mut right = keys.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match self.key_order.compare(key, &keys[mid]) {
                Ordering::Greater => left = mid + 1,
                Ordering::Equal => return mid,
                Ordering::Less => right = mid,
            }
        }
        left
    }

    /// Child slot for `key`: the first index whose separator exceeds it.
    fn child_index(&self, keys: &[K], key: &K) -> usize {
        let mut index = 0;
        while index < keys.len() && self.key_order.compare(key, &keys[index]) != Ordering::Less {
            index += 1;
        }
        index
    }

    /// Point lookup.
    pub fn search(&self, key: &K) -> Result<Option<V>> {
        let mut current = self.root_page_id();
        loop {
            match self.load_node(current)? {
                Node::Leaf(leaf) => {
                    let index = self.lower_bound(&leaf.keys, key);
                    if index < leaf.keys.len()
                        && self.key_order.compare(&leaf.keys[index], key) == Ordering::Equal
                    {
                        return Ok(Some(leaf.values[index].clone()));
                    }
                    return Ok(None);
                }
                Node::Internal(internal) => {
                    let index = self.child_index(&internal.keys, key);
                    current = internal.children[index];
                }
            }
        }
    }

    /// Inserts or overwrites a key. Splits propagate upward; a root split
    /// allocates a new internal root and updates the metadata page.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let root_id = self.root_page_id();
        if let Some((promoted, new_node_id)) = self.insert_into(root_id, key, value)? {
            let new_root: Node<K, V> = Node::Internal(InternalNode {
                keys: vec![promoted],
                children: vec![root_id, new_node_id],
            });
            let new_root_id = self.save_new_node(&new_root)?;
            *self.root.write() = new_root_id;
            self.save_root_page_id()?;
        }
        Ok(())
    }

    fn insert_into(&self, page_id: PageId, key: K, value: V) -> Result<Option<(K, PageId)>> {
        match self.load_node(page_id)? {
            Node::Leaf(mut leaf) => {
                let index = self.lower_bound(&leaf.keys, &key);
                if index < leaf.keys.len()
                    && self.key_order.compare(&leaf.keys[index], &key) == Ordering::Equal
                {
                    leaf.values[index] = value;
                    self.save_node(page_id, &Node::Leaf(leaf))?;
                    return Ok(None);
                }

                leaf.keys.insert(index, key);
                leaf.values.insert(index, value);

                if leaf.keys.len() > self.order {
                    return self.split_leaf(page_id, leaf).map(Some);
                }
                self.save_node(page_id, &Node::Leaf(leaf))?;
                Ok(None)
            }
            Node::Internal(mut internal) => {
                let index = self.child_index(&internal.keys, &key);
                let child_id = internal.children[index];
                let Some((promoted, new_node_id)) = self.insert_into(child_id, key, value)? else {
                    return Ok(None);
                };

                internal.keys.insert(index, promoted);
                internal.children.insert(index + 1, new_node_id);

                if internal.keys.len() > self.order {
                    return self.split_internal(page_id, internal).map(Some);
                }
                self.save_node(page_id, &Node::Internal(internal))?;
                Ok(None)
            }
        }
    }

    /// Splits an over-full leaf. The right half keeps entries from the
    /// midpoint on; its first key is promoted (and retained). The new leaf is
    /// spliced into the chain.
    fn split_leaf(&self, page_id: PageId, mut leaf: LeafNode<K, V>) -> Result<(K, PageId)> {
        let mid = leaf.keys.len() / 2;

        let right = LeafNode {
            keys: leaf.keys.split_off(mid),
            values: leaf.values.split_off(mid),
            next_leaf: leaf.next_leaf,
        };
        let promoted = right.keys[0].clone();

        let new_page_id = self.save_new_node(&Node::Leaf(right))?;
        leaf.next_leaf = new_page_id;
        self.save_node(page_id, &Node::Leaf(leaf))?;

        Ok((promoted, new_page_id))
    }

    /// Splits an over-full internal node. The middle key moves up and is
    /// retained by neither half.
    fn split_internal(&self, page_id: PageId, mut internal: InternalNode<K>) -> Result<(K, PageId)> {
        let mid = internal.keys.len() / 2;
        let promoted = internal.keys[mid].clone();

        let right = InternalNode {
            keys: internal.keys.split_off(mid + 1),
            children: internal.children.split_off(mid + 1),
        };
        internal.keys.truncate(mid);

        let new_page_id = self.save_new_node(&Node::Internal(right))?;
        self.save_node(page_id, &Node::Internal(internal))?;

        Ok((promoted, new_page_id))
    }

    /// Removes a key. Underflowing nodes are left as they are; the only
    /// structural response is root shrink, which promotes the sole child of
    /// an emptied internal root.
    pub fn delete(&self, key: &K) -> Result<bool> {
        let root_id = self.root_page_id();
        let (deleted, _underflow) = self.delete_from(root_id, key)?;

        if let Node::Internal(internal) = self.load_node(root_id)? {
            if internal.keys.is_empty() && !internal.children.is_empty() {
                *self.root.write() = internal.children[0];
                self.save_root_page_id()?;
            }
        }

        Ok(deleted)
    }

    fn delete_from(&self, page_id: PageId, key: &K) -> Result<(bool, bool)> {
        match self.load_node(page_id)? {
            Node::Leaf(mut leaf) => {
                let index = self.lower_bound(&leaf.keys, key);
                if index >= leaf.keys.len()
                    || self.key_order.compare(&leaf.keys[index], key) != Ordering::Equal
                {
                    return Ok((false, false));
                }

                leaf.keys.remove(index);
                leaf.values.remove(index);
                let underflow = leaf.keys.len() < self.order / 2;
                self.save_node(page_id, &Node::Leaf(leaf))?;
                Ok((true, underflow))
            }
            Node::Internal(internal) => {
                let index = self.child_index(&internal.keys, key);
                // Child underflow is reported but not repaired; reduced fill
                // is accepted until an offline rebalance.
                self.delete_from(internal.children[index], key)
            }
        }
    }

    /// Inclusive range scan as a lazy cursor over the leaf chain.
    pub fn range(&self, start_key: &K, end_key: &K) -> Result<RangeScan<'_, K, V>> {
        let mut current = self.root_page_id();
        let leaf = loop {
            match self.load_node(current)? {
                Node::Leaf(leaf) => break leaf,
                Node::Internal(internal) => {
                    let index = self.child_index(&internal.keys, start_key);
                    current = internal.children[index];
                }
            }
        };

        let mut start_index = leaf.keys.len();
        for (i, key) in leaf.keys.iter().enumerate() {
            if self.key_order.compare(key, start_key) != Ordering::Less {
                start_index = i;
                break;
            }
        }

        Ok(RangeScan {
            tree: self,
            leaf: Some(leaf),
            index: start_index,
            end_key: end_key.clone(),
            done: false,
        })
    }

    /// First leaf in chain order.
    fn first_leaf(&self) -> Result<LeafNode<K, V>> {
        let mut current = self.root_page_id();
        loop {
            match self.load_node(current)? {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Internal(internal) => {
                    let Some(&first) = internal.children.first() else {
                        return Err(Error::corruption(format!(
                            "internal node on page {current} has no children"
                        )));
                    };
                    current = first;
                }
            }
        }
    }

    /// Number of live keys, counted along the leaf chain.
    pub fn size(&self) -> Result<usize> {
        let mut count = 0;
        let mut leaf = self.first_leaf()?;
        loop {
            count += leaf.keys.len();
            if !leaf.next_leaf.is_valid() {
                return Ok(count);
            }
            leaf = self.load_leaf(leaf.next_leaf)?;
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        let root = self.load_node(self.root_page_id())?;
        Ok(root.keys().is_empty())
    }

    /// Every key/value pair in key order, by walking the leaf chain.
    pub fn all_pairs(&self) -> Result<Vec<(K, V)>> {
        let mut pairs = Vec::new();
        let mut leaf = self.first_leaf()?;
        loop {
            for (key, value) in leaf.keys.iter().zip(leaf.values.iter()) {
                pairs.push((key.clone(), value.clone()));
            }
            if !leaf.next_leaf.is_valid() {
                return Ok(pairs);
            }
            leaf = self.load_leaf(leaf.next_leaf)?;
        }
    }

    /// Collects structural statistics with a full traversal.
    pub fn stats(&self) -> Result<TreeStats> {
        let mut collector = StatsCollector::default();
        self.collect_stats(self.root_page_id(), 0, &mut collector)?;

        let average_fill = if collector.total_nodes > 0 && self.order > 1 {
            collector.total_keys as f64 / (collector.total_nodes * (self.order - 1)) as f64
        } else {
            0.0
        };

        Ok(TreeStats {
            total_nodes: collector.total_nodes,
            leaf_nodes: collector.leaf_nodes,
            internal_nodes: collector.internal_nodes,
            total_keys: collector.total_keys,
            average_fill,
            max_depth: collector.max_depth,
        })
    }

    fn collect_stats(
        &self,
        page_id: PageId,
        depth: usize,
        collector: &mut StatsCollector,
    ) -> Result<()> {
        collector.total_nodes += 1;
        collector.max_depth = collector.max_depth.max(depth);

        match self.load_node(page_id)? {
            Node::Leaf(leaf) => {
                collector.leaf_nodes += 1;
                collector.total_keys += leaf.keys.len();
            }
            Node::Internal(internal) => {
                collector.internal_nodes += 1;
                collector.total_keys += internal.keys.len();
                for &child in &internal.children {
                    self.collect_stats(child, depth + 1, collector)?;
                }
            }
        }
        Ok(())
    }

    /// Verifies the structural invariants: strictly increasing keys in every
    /// node, separator bounds against child subtrees, uniform leaf depth,
    /// and a leaf chain that threads the leaves in traversal order.
    pub fn check_invariants(&self) -> Result<()> {
        let mut leaf_ids = Vec::new();
        let mut leaf_depth = None;
        self.check_subtree(
            self.root_page_id(),
            None,
            None,
            0,
            &mut leaf_depth,
            &mut leaf_ids,
        )?;

        // The chain must visit exactly the leaves of the in-order traversal.
        let mut chained = Vec::with_capacity(leaf_ids.len());
        let mut current = match leaf_ids.first() {
            Some(&first) => first,
            None => return Ok(()),
        };
        loop {
            chained.push(current);
            let leaf = self.load_leaf(current)?;
            if !leaf.next_leaf.is_valid() {
                break;
            }
            current = leaf.next_leaf;
        }
        if chained != leaf_ids {
            return Err(Error::corruption(
                "leaf chain disagrees with in-order traversal",
            ));
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        leaf_ids: &mut Vec<PageId>,
    ) -> Result<()> {
        let node = self.load_node(page_id)?;
        let keys = node.keys();

        for pair in keys.windows(2) {
            if self.key_order.compare(&pair[0], &pair[1]) != Ordering::Less {
                return Err(Error::corruption(format!(
                    "keys out of order on page {page_id}"
                )));
            }
        }
        if let (Some(lower), Some(first)) = (lower, keys.first()) {
            if self.key_order.compare(first, lower) == Ordering::Less {
                return Err(Error::corruption(format!(
                    "key below subtree bound on page {page_id}"
                )));
            }
        }
        if let (Some(upper), Some(last)) = (upper, keys.last()) {
            if self.key_order.compare(last, upper) != Ordering::Less {
                return Err(Error::corruption(format!(
                    "key above subtree bound on page {page_id}"
                )));
            }
        }

        match node {
            Node::Leaf(_) => {
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(Error::corruption(format!(
                            "leaf on page {page_id} at depth {depth}, expected {expected}"
                        )));
                    }
                    Some(_) => {}
                }
                leaf_ids.push(page_id);
            }
            Node::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(Error::corruption(format!(
                        "internal node on page {page_id} has {} keys but {} children",
                        internal.keys.len(),
                        internal.children.len()
                    )));
                }
                for (i, &child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(&internal.keys[i - 1])
                    };
                    let child_upper = if i < internal.keys.len() {
                        Some(&internal.keys[i])
                    } else {
                        upper
                    };
                    self.check_subtree(
                        child,
                        child_lower,
                        child_upper,
                        depth + 1,
                        leaf_depth,
                        leaf_ids,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Flushes all dirty pages and syncs the data file.
    pub fn sync(&self) -> Result<()> {
        self.pool.flush_all()?;
        self.disk.sync()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

/// Forward-only cursor over `[start_key, end_key]`, holding at most one leaf
/// at a time. Dropping the cursor cancels the scan.
pub struct RangeScan<'a, K, V> {
    tree: &'a BPlusTree<K, V>,
    leaf: Option<LeafNode<K, V>>,
    index: usize,
    end_key: K,
    done: bool,
}

impl<K, V> Iterator for RangeScan<'_, K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.keys.len() {
                let key = &leaf.keys[self.index];
                if self.tree.key_order.compare(key, &self.end_key) == Ordering::Greater {
                    self.done = true;
                    return None;
                }
                let item = (key.clone(), leaf.values[self.index].clone());
                self.index += 1;
                return Some(Ok(item));
            }

            let next = leaf.next_leaf;
            if !next.is_valid() {
                self.done = true;
                return None;
            }
            match self.tree.load_leaf(next) {
                Ok(next_leaf) => {
                    self.leaf = Some(next_leaf);
                    self.index = 0;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
