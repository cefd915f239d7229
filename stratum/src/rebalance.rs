//! Offline tree rebalancing.
//!
//! Deletes never rebalance the tree online, so occupancy drifts below half
//! and orphan pages accumulate. The rebalancer repairs this out of band: it
//! reads every pair along the leaf chain, builds a fresh densely packed tree
//! beside the original, and atomically swaps the files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::btree::{BPlusTree, TreeStats};
use crate::codec::{Codec, KeyOrder};
use crate::error::Result;

/// Rebuilds tree files with optimal packing.
pub struct Rebalancer<K, V> {
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    key_order: Arc<dyn KeyOrder<K>>,
    order: usize,
    buffer_pool_size: usize,
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{file_name}{suffix}"))
}

impl<K, V> Rebalancer<K, V>
where
    K: Clone,
    V: Clone,
{
    pub fn new(
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        key_order: Arc<dyn KeyOrder<K>>,
        order: usize,
        buffer_pool_size: usize,
    ) -> Self {
        Rebalancer {
            key_codec,
            value_codec,
            key_order,
            order,
            buffer_pool_size,
        }
    }

    fn open_tree(&self, path: &Path) -> Result<BPlusTree<K, V>> {
        BPlusTree::open(
            path,
            self.order,
            self.buffer_pool_size,
            Arc::clone(&self.key_codec),
            Arc::clone(&self.value_codec),
            Arc::clone(&self.key_order),
        )
    }

    /// Rebalances the tree file at `path` in place. The original file is
    /// only replaced once the rebuilt tree is fully on disk.
    pub fn rebalance(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("tree file does not exist: {}", path.display()),
            )
            .into());
        }

        info!(path = %path.display(), "starting tree rebalance");

        let pairs = {
            let tree = self.open_tree(path)?;
            tree.all_pairs()?
        };
        info!(pairs = pairs.len(), "extracted pairs from existing tree");

        if pairs.is_empty() {
            info!("tree is empty, nothing to rebalance");
            return Ok(());
        }

        let temp_path = sibling_with_suffix(path, ".rebalancing");
        let backup_path = sibling_with_suffix(path, ".backup");

        let result = (|| -> Result<()> {
            {
                let fresh = self.open_tree(&temp_path)?;
                for (key, value) in &pairs {
                    fresh.insert(key.clone(), value.clone())?;
                }
                fresh.sync()?;
            }

            std::fs::rename(path, &backup_path)?;
            std::fs::rename(&temp_path, path)?;
            std::fs::remove_file(&backup_path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            let _ = std::fs::remove_file(&backup_path);
        } else {
            info!(path = %path.display(), pairs = pairs.len(), "tree rebalance complete");
        }
        result
    }

    /// Structural statistics for the tree file at `path`.
    pub fn tree_stats(&self, path: &Path) -> Result<TreeStats> {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("tree file does not exist: {}", path.display()),
            )
            .into());
        }
        let tree = self.open_tree(path)?;
        tree.stats()
    }
}
