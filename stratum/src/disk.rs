//! Disk I/O for fixed-size pages.

use std::fs::{create_dir_all, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::page::{Page, PageId};
use crate::PAGE_SIZE;

struct DiskInner {
    file: File,
    next_page_id: u64,
}

/// Reads and writes whole pages at `page_id * PAGE_SIZE` in a single file.
/// Reads take the shared lock; writes and page-id allocation take the
/// exclusive lock so that allocation stays serialized.
pub struct DiskManager {
    path: PathBuf,
    inner: RwLock<DiskInner>,
}

impl DiskManager {
    /// Opens the database file, creating it (and parent directories) if
    /// needed. The page-id counter is initialized from the file size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let next_page_id = file_size / PAGE_SIZE as u64;

        Ok(DiskManager {
            path,
            inner: RwLock::new(DiskInner { file, next_page_id }),
        })
    }

    /// Reads one page. A read past the end of the file yields an all-zero
    /// page with the requested id.
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        if !page_id.is_valid() {
            return Err(Error::InvalidPageId);
        }

        let inner = self.inner.read();
        let offset = page_id.value() * PAGE_SIZE as u64;

        let mut data = vec![0u8; PAGE_SIZE];
        let mut read = 0;
        while read < PAGE_SIZE {
            match inner.file.read_at(&mut data[read..], offset + read as u64)? {
                0 => break,
                n => read += n,
            }
        }

        Page::with_data(page_id, data)
    }

    /// Writes one page, padding with zeros up to the page size, then syncs
    /// file data to disk.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        if !page.id().is_valid() {
            return Err(Error::InvalidPageId);
        }

        let mut buf = page.read_data();
        buf.resize(PAGE_SIZE, 0);

        let inner = self.inner.write();
        let offset = page.id().value() * PAGE_SIZE as u64;
        inner.file.write_all_at(&buf, offset)?;
        inner.file.sync_data()?;

        page.mark_clean();
        Ok(())
    }

    /// Allocates the next page id.
    pub fn allocate_page_id(&self) -> Result<PageId> {
        let mut inner = self.inner.write();
        let page_id = PageId::new(inner.next_page_id);
        inner.next_page_id += 1;
        Ok(page_id)
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner.file.metadata()?.len())
    }

    /// Syncs file data and metadata to disk.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocates_from_file_size_and_persists_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let disk = DiskManager::open(&path).unwrap();
        let page_id = disk.allocate_page_id().unwrap();
        assert_eq!(page_id, PageId::new(0));

        let page = disk.read_page(page_id).unwrap();
        page.write_data(b"payload").unwrap();
        disk.write_page(&page).unwrap();
        assert!(!page.is_dirty());

        drop(disk);
        let disk = DiskManager::open(&path).unwrap();
        let page = disk.read_page(page_id).unwrap();
        assert_eq!(&page.read_data()[..7], b"payload");
        // Counter continues past existing pages.
        assert_eq!(disk.allocate_page_id().unwrap(), PageId::new(1));
    }

    #[test]
    fn read_past_eof_returns_zero_page() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("empty.db")).unwrap();

        let page = disk.read_page(PageId::new(9)).unwrap();
        assert!(page.read_data().iter().all(|&b| b == 0));
        assert_eq!(page.read_data().len(), PAGE_SIZE);
    }

    #[test]
    fn rejects_invalid_page_id() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("invalid.db")).unwrap();

        assert!(matches!(
            disk.read_page(PageId::INVALID),
            Err(Error::InvalidPageId)
        ));
        let page = Page::new(PageId::INVALID);
        assert!(matches!(disk.write_page(&page), Err(Error::InvalidPageId)));
    }
}
