//! Storage Contract
//!
//! Concrete storage backends (raster files, tables, databases) live outside
//! the kernel. They plug in through [`StorageManager`]; the kernel calls it
//! only while holding the right node lock, and reads each (node, tile) at
//! most once per validity period.
//!
//! Reads go through [`prepare_data`](crate::graph::prepare_data) (all
//! tiles) or [`EngineContext::read_tile`](crate::EngineContext::read_tile)
//! (one tile, when the backend allows it). Writes go through
//! [`EngineContext::commit_item`](crate::EngineContext::commit_item) and
//! tree synchronisation through
//! [`EngineContext::sync_storage`](crate::EngineContext::sync_storage).

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::Node;

/// Tile index within a node's data.
pub type TileId = usize;

/// How far a tree synchronisation should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Create every item the storage knows about.
    All,
    /// Only update attributes of existing items.
    Attr,
    /// Only touch the holder itself.
    None,
}

/// What a backend needs to know to locate an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMetaInfo {
    /// Name of the storage (file name, connection string).
    pub storage_name: String,
    /// Path of the item inside the storage.
    pub relative_path: String,
    /// Number of tiles the item is split into.
    pub tile_count: usize,
}

impl StorageMetaInfo {
    pub fn new(storage_name: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            storage_name: storage_name.into(),
            relative_path: relative_path.into(),
            tile_count: 1,
        }
    }

    pub fn with_tiles(mut self, tile_count: usize) -> Self {
        self.tile_count = tile_count.max(1);
        self
    }
}

/// A pluggable storage backend.
///
/// Returning `Ok(false)` means the backend had nothing to deliver; the
/// kernel turns that into a Data failure naming the storage. Errors carry
/// backend-specific context and surface the same way.
pub trait StorageManager: Send + Sync {
    /// Read one tile of `target` and store it with [`Node::store_tile`].
    fn read_item(&self, meta: &StorageMetaInfo, target: &Node, tile: TileId) -> Result<bool>;

    /// Write the data of `source` to the storage. Only called when
    /// [`can_write_tiles`](Self::can_write_tiles) is true, with `source`
    /// read-locked and data-ready.
    fn write_item(&self, meta: &StorageMetaInfo, source: &Node) -> Result<bool> {
        let _ = (meta, source);
        Ok(false)
    }

    /// Create or update the items below `holder` that mirror the storage.
    /// Called with `holder` write-locked.
    fn sync_tree(&self, holder: &Arc<Node>, mode: SyncMode) -> Result<()> {
        let _ = (holder, mode);
        Ok(())
    }

    /// Whether the backend accepts writes at all.
    fn can_write_tiles(&self) -> bool {
        false
    }

    /// Whether single tiles may be read without reading the whole item.
    fn allow_random_tile_access(&self) -> bool {
        false
    }
}

/// A node's link to the storage it is read from.
#[derive(Clone)]
pub struct StorageBinding {
    pub manager: Arc<dyn StorageManager>,
    pub meta: StorageMetaInfo,
}

impl StorageBinding {
    pub fn new(manager: Arc<dyn StorageManager>, meta: StorageMetaInfo) -> Self {
        Self { manager, meta }
    }
}

impl fmt::Debug for StorageBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBinding")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}
