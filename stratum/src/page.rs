//! Fixed-size pages, the basic unit of I/O.

use std::fmt;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::PAGE_SIZE;

/// A unique identifier for a page in the database file.
/// Page 0 is the metadata page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    /// Sentinel meaning "no page". Encoded on disk as `u64::MAX`.
    pub const INVALID: PageId = PageId(u64::MAX);

    /// The metadata page, which stores the current root page id.
    pub const METADATA: PageId = PageId(0);

    pub fn new(value: u64) -> Self {
        PageId(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != PageId::INVALID
    }

    /// Raw on-disk representation; `INVALID` maps to `u64::MAX`.
    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        PageId(raw)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "INVALID")
        }
    }
}

struct PageState {
    data: Vec<u8>,
    dirty: bool,
    pin_count: u32,
}

/// A fixed-size page. One lock guards the byte buffer, the dirty flag and
/// the pin count. Pinned pages must never be evicted from the buffer pool.
pub struct Page {
    id: PageId,
    state: RwLock<PageState>,
}

impl Page {
    /// Creates an empty page with the given id.
    pub fn new(id: PageId) -> Self {
        Page {
            id,
            state: RwLock::new(PageState {
                data: vec![0; PAGE_SIZE],
                dirty: false,
                pin_count: 0,
            }),
        }
    }

    /// Creates a page holding the given bytes.
    pub fn with_data(id: PageId, data: Vec<u8>) -> Result<Self> {
        if data.len() > PAGE_SIZE {
            return Err(Error::PageOverflow { len: data.len() });
        }
        Ok(Page {
            id,
            state: RwLock::new(PageState {
                data,
                dirty: false,
                pin_count: 0,
            }),
        })
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Returns a copy of the page contents.
    pub fn read_data(&self) -> Vec<u8> {
        self.state.read().data.clone()
    }

    /// Replaces the page contents and marks the page dirty.
    pub fn write_data(&self, data: &[u8]) -> Result<()> {
        if data.len() > PAGE_SIZE {
            return Err(Error::PageOverflow { len: data.len() });
        }
        let mut state = self.state.write();
        state.data.clear();
        state.data.extend_from_slice(data);
        state.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn mark_dirty(&self) {
        self.state.write().dirty = true;
    }

    /// Marks the page clean after it has been written to disk.
    pub fn mark_clean(&self) {
        self.state.write().dirty = false;
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        let mut state = self.state.write();
        state.pin_count += 1;
        state.pin_count
    }

    /// Decrements the pin count and returns the new value.
    pub fn unpin(&self) -> Result<u32> {
        let mut state = self.state.write();
        if state.pin_count == 0 {
            return Err(Error::PinUnderflow(self.id));
        }
        state.pin_count -= 1;
        Ok(state.pin_count)
    }

    pub fn pin_count(&self) -> u32 {
        self.state.read().pin_count
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_sets_dirty_and_round_trips() {
        let page = Page::new(PageId::new(7));
        assert!(!page.is_dirty());

        page.write_data(b"hello").unwrap();
        assert!(page.is_dirty());
        assert_eq!(page.read_data(), b"hello");

        page.mark_clean();
        assert!(!page.is_dirty());
    }

    #[test]
    fn rejects_oversized_writes() {
        let page = Page::new(PageId::new(1));
        let too_big = vec![0u8; PAGE_SIZE + 1];
        assert!(matches!(
            page.write_data(&too_big),
            Err(Error::PageOverflow { .. })
        ));
    }

    #[test]
    fn pin_counting() {
        let page = Page::new(PageId::new(3));
        assert!(!page.is_pinned());
        assert_eq!(page.pin(), 1);
        assert_eq!(page.pin(), 2);
        assert_eq!(page.unpin().unwrap(), 1);
        assert_eq!(page.unpin().unwrap(), 0);
        assert!(matches!(page.unpin(), Err(Error::PinUnderflow(_))));
    }

    #[test]
    fn invalid_page_id_sentinel() {
        assert!(!PageId::INVALID.is_valid());
        assert!(PageId::METADATA.is_valid());
        assert_eq!(PageId::from_raw(PageId::INVALID.to_raw()), PageId::INVALID);
    }
}
