//! Buffer manager: an in-memory cache of disk pages.

use crate::disk::{DiskSpaceManager, PAGE_SIZE};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Bytes reserved at the head of every page for the page LSN.
const RESERVED_SPACE: usize = 8;

/// Usable bytes per page, after the reserved page-LSN header.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - RESERVED_SPACE;

/// Hooks invoked around buffer write-back.
///
/// The recovery layer installs these to enforce write-ahead logging:
/// the log must be flushed past a page's LSN before the page reaches
/// disk, and the dirty page table is trimmed once it has.
pub trait FlushHooks: Send + Sync {
    /// Called before a dirty page is written back to disk. An error here
    /// aborts the write-back: the page stays dirty and in memory.
    fn before_flush(&self, page_lsn: u64) -> StorageResult<()>;

    /// Called after a page has been written back to disk.
    fn on_disk_io(&self, page_num: u64);
}

struct FrameState {
    /// Usable page contents (the page-LSN header is kept separately).
    data: Vec<u8>,
    page_lsn: u64,
    dirty: bool,
}

struct Frame {
    page_num: u64,
    state: Mutex<FrameState>,
}

/// A pinned page.
///
/// Holding a `Page` keeps the frame resident. Reads and writes address the
/// usable region of the page; the page LSN is read and written through its
/// own accessors. Dropping the guard unpins the page.
pub struct Page {
    frame: Arc<Frame>,
}

impl Page {
    /// The page number of this page.
    #[must_use]
    pub fn page_num(&self) -> u64 {
        self.frame.page_num
    }

    /// Reads `len` bytes at `offset` within the usable page region.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OutOfBounds`] if the range does not fit.
    pub fn read(&self, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        check_bounds(offset, len)?;
        let state = self.frame.state.lock();
        Ok(state.data[offset..offset + len].to_vec())
    }

    /// Writes `data` at `offset` within the usable page region and marks
    /// the page dirty.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OutOfBounds`] if the range does not fit.
    pub fn write(&self, offset: usize, data: &[u8]) -> StorageResult<()> {
        check_bounds(offset, data.len())?;
        let mut state = self.frame.state.lock();
        state.data[offset..offset + data.len()].copy_from_slice(data);
        state.dirty = true;
        Ok(())
    }

    /// Returns the page LSN: the LSN of the last log record that
    /// modified this page.
    #[must_use]
    pub fn page_lsn(&self) -> u64 {
        self.frame.state.lock().page_lsn
    }

    /// Sets the page LSN and marks the page dirty.
    pub fn set_page_lsn(&self, lsn: u64) {
        let mut state = self.frame.state.lock();
        state.page_lsn = lsn;
        state.dirty = true;
    }
}

fn check_bounds(offset: usize, len: usize) -> StorageResult<()> {
    if offset.saturating_add(len) > EFFECTIVE_PAGE_SIZE {
        return Err(StorageError::OutOfBounds {
            offset,
            len,
            page_size: EFFECTIVE_PAGE_SIZE,
        });
    }
    Ok(())
}

/// Caches disk pages in memory and tracks which are dirty.
///
/// Pages are fetched through [`BufferManager::fetch_page`], which returns a
/// pinned [`Page`] guard. Dirty pages reach disk only through
/// [`BufferManager::flush_page`] / [`BufferManager::flush_all`], which run
/// the installed [`FlushHooks`] around the write-back.
pub struct BufferManager {
    disk: Arc<DiskSpaceManager>,
    frames: Mutex<HashMap<u64, Arc<Frame>>>,
    hooks: RwLock<Option<Arc<dyn FlushHooks>>>,
}

impl BufferManager {
    /// Usable bytes per page.
    pub const EFFECTIVE_PAGE_SIZE: usize = EFFECTIVE_PAGE_SIZE;

    /// Creates a buffer manager over the given disk space manager.
    #[must_use]
    pub fn new(disk: Arc<DiskSpaceManager>) -> Self {
        Self {
            disk,
            frames: Mutex::new(HashMap::new()),
            hooks: RwLock::new(None),
        }
    }

    /// Installs the write-back hooks.
    ///
    /// Installed after construction: the recovery layer needs the buffer
    /// manager to redo changes, while the buffer manager needs the recovery
    /// layer to gate evictions on the log.
    pub fn set_flush_hooks(&self, hooks: Arc<dyn FlushHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    /// Fetches a page, reading it from disk if it is not resident.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not allocated or the read fails.
    pub fn fetch_page(&self, page_num: u64) -> StorageResult<Page> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&page_num) {
            return Ok(Page {
                frame: Arc::clone(frame),
            });
        }

        let raw = self.disk.read_page(page_num)?;
        let page_lsn = u64::from_le_bytes(
            raw[..RESERVED_SPACE]
                .try_into()
                .map_err(|_| StorageError::Corrupted("short page header".into()))?,
        );
        let frame = Arc::new(Frame {
            page_num,
            state: Mutex::new(FrameState {
                data: raw[RESERVED_SPACE..].to_vec(),
                page_lsn,
                dirty: false,
            }),
        });
        frames.insert(page_num, Arc::clone(&frame));
        Ok(Page { frame })
    }

    /// Writes a page back to disk if it is dirty.
    ///
    /// Runs `before_flush` (with the page's LSN) before the write and
    /// `on_disk_io` after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk write fails.
    pub fn flush_page(&self, page_num: u64) -> StorageResult<()> {
        let frame = {
            let frames = self.frames.lock();
            match frames.get(&page_num) {
                Some(f) => Arc::clone(f),
                None => return Ok(()),
            }
        };
        self.write_back(&frame)
    }

    /// Writes every dirty resident page back to disk.
    ///
    /// # Errors
    ///
    /// Returns the first write failure.
    pub fn flush_all(&self) -> StorageResult<()> {
        let frames: Vec<Arc<Frame>> = self.frames.lock().values().cloned().collect();
        for frame in frames {
            self.write_back(&frame)?;
        }
        Ok(())
    }

    /// Drops a page from the cache, flushing it first if dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if the write-back fails.
    pub fn evict(&self, page_num: u64) -> StorageResult<()> {
        self.flush_page(page_num)?;
        self.frames.lock().remove(&page_num);
        Ok(())
    }

    /// Drops a page from the cache without writing it back.
    ///
    /// Used when the page has been freed on disk and its cached contents
    /// are no longer meaningful.
    pub fn discard(&self, page_num: u64) {
        self.frames.lock().remove(&page_num);
    }

    /// Calls `f(page_num, is_dirty)` for every resident page.
    pub fn iter_page_nums(&self, mut f: impl FnMut(u64, bool)) {
        let frames: Vec<Arc<Frame>> = self.frames.lock().values().cloned().collect();
        for frame in frames {
            let dirty = frame.state.lock().dirty;
            f(frame.page_num, dirty);
        }
    }

    fn write_back(&self, frame: &Arc<Frame>) -> StorageResult<()> {
        // The frame lock is held across the write so a concurrent page
        // write cannot slip between the snapshot and the dirty reset.
        let mut state = frame.state.lock();
        if !state.dirty {
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend_from_slice(&state.page_lsn.to_le_bytes());
        bytes.extend_from_slice(&state.data);

        let hooks = self.hooks.read().clone();
        if let Some(hooks) = &hooks {
            hooks.before_flush(state.page_lsn)?;
        }
        self.disk.write_page(frame.page_num, &bytes)?;
        state.dirty = false;
        drop(state);

        if let Some(hooks) = &hooks {
            hooks.on_disk_io(frame.page_num);
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("resident", &self.frames.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn setup() -> (Arc<DiskSpaceManager>, BufferManager, u64) {
        let disk = Arc::new(DiskSpaceManager::in_memory());
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        let buffer = BufferManager::new(Arc::clone(&disk));
        (disk, buffer, page)
    }

    #[test]
    fn fetch_write_read() {
        let (_disk, buffer, page_num) = setup();
        let page = buffer.fetch_page(page_num).unwrap();

        page.write(10, b"hello").unwrap();
        assert_eq!(page.read(10, 5).unwrap(), b"hello");
    }

    #[test]
    fn write_marks_dirty_flush_cleans() {
        let (_disk, buffer, page_num) = setup();
        let page = buffer.fetch_page(page_num).unwrap();
        page.write(0, &[1, 2, 3]).unwrap();

        let mut dirty = None;
        buffer.iter_page_nums(|p, d| {
            if p == page_num {
                dirty = Some(d);
            }
        });
        assert_eq!(dirty, Some(true));

        buffer.flush_page(page_num).unwrap();
        let mut dirty = None;
        buffer.iter_page_nums(|p, d| {
            if p == page_num {
                dirty = Some(d);
            }
        });
        assert_eq!(dirty, Some(false));
    }

    #[test]
    fn page_lsn_persists_through_flush() {
        let (disk, buffer, page_num) = setup();
        let page = buffer.fetch_page(page_num).unwrap();
        page.write(0, &[7]).unwrap();
        page.set_page_lsn(42);
        buffer.flush_page(page_num).unwrap();
        drop(page);
        buffer.discard(page_num);

        // Reload from disk through a fresh buffer.
        let buffer2 = BufferManager::new(disk);
        let page = buffer2.fetch_page(page_num).unwrap();
        assert_eq!(page.page_lsn(), 42);
        assert_eq!(page.read(0, 1).unwrap(), &[7]);
    }

    #[test]
    fn unflushed_write_is_lost_on_discard() {
        let (disk, buffer, page_num) = setup();
        let page = buffer.fetch_page(page_num).unwrap();
        page.write(0, &[9]).unwrap();
        drop(page);
        buffer.discard(page_num);

        let buffer2 = BufferManager::new(disk);
        let page = buffer2.fetch_page(page_num).unwrap();
        assert_eq!(page.read(0, 1).unwrap(), &[0]);
    }

    #[test]
    fn out_of_bounds_write_rejected() {
        let (_disk, buffer, page_num) = setup();
        let page = buffer.fetch_page(page_num).unwrap();
        let result = page.write(EFFECTIVE_PAGE_SIZE - 2, &[0, 1, 2, 3]);
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));
    }

    #[test]
    fn flush_hooks_run_around_write_back() {
        struct Recorder {
            flushed_lsn: AtomicU64,
            ios: AtomicU64,
        }
        impl FlushHooks for Recorder {
            fn before_flush(&self, page_lsn: u64) -> StorageResult<()> {
                self.flushed_lsn.store(page_lsn, Ordering::SeqCst);
                Ok(())
            }
            fn on_disk_io(&self, _page_num: u64) {
                self.ios.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_disk, buffer, page_num) = setup();
        let recorder = Arc::new(Recorder {
            flushed_lsn: AtomicU64::new(0),
            ios: AtomicU64::new(0),
        });
        buffer.set_flush_hooks(Arc::clone(&recorder) as Arc<dyn FlushHooks>);

        let page = buffer.fetch_page(page_num).unwrap();
        page.write(0, &[1]).unwrap();
        page.set_page_lsn(99);
        buffer.flush_page(page_num).unwrap();

        assert_eq!(recorder.flushed_lsn.load(Ordering::SeqCst), 99);
        assert_eq!(recorder.ios.load(Ordering::SeqCst), 1);

        // A clean page does not run the hooks again.
        buffer.flush_page(page_num).unwrap();
        assert_eq!(recorder.ios.load(Ordering::SeqCst), 1);
    }
}
