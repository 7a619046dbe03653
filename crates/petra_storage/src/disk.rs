//! Disk space management: partitions and fixed-size pages.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Size of a raw page on disk, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The partition reserved for the write-ahead log.
///
/// The disk space manager never hands out data pages in this partition;
/// the log layer owns its backing store directly.
pub const LOG_PARTITION: u32 = 0;

/// Extracts the partition number from a page number.
#[must_use]
pub const fn part_num(page_num: u64) -> u32 {
    (page_num >> 32) as u32
}

/// Extracts the index of a page within its partition.
#[must_use]
pub const fn page_index(page_num: u64) -> u32 {
    page_num as u32
}

/// Builds a page number from a partition number and a page index.
#[must_use]
pub const fn page_num(part: u32, index: u32) -> u64 {
    ((part as u64) << 32) | index as u64
}

/// Factory producing the backing store for a newly allocated partition.
type PartitionFactory = Box<dyn Fn(u32) -> StorageResult<Box<dyn StorageBackend>> + Send + Sync>;

struct PartitionState {
    backend: Box<dyn StorageBackend>,
    /// Indices of pages currently allocated in this partition.
    allocated: BTreeSet<u32>,
    /// Next index to hand out for a fresh allocation.
    next_index: u32,
}

struct DiskState {
    parts: HashMap<u32, PartitionState>,
    next_part: u32,
}

/// Manages partitions of fixed-size pages.
///
/// A page number packs the partition number in its high 32 bits and the
/// page's index within the partition in the low 32 bits. Partition
/// [`LOG_PARTITION`] is reserved and never allocated for data.
///
/// Page data lives in one backend per partition at `index * PAGE_SIZE`.
/// Freeing a page zeroes its slot; the slot index is not reused.
pub struct DiskSpaceManager {
    state: Mutex<DiskState>,
    factory: PartitionFactory,
}

impl DiskSpaceManager {
    /// Creates a disk space manager whose partitions live in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_factory(Box::new(|_| Ok(Box::new(InMemoryBackend::new()))))
    }

    /// Creates a disk space manager storing each partition as a file
    /// under `dir` (`part.<num>`). Partition files already present in the
    /// directory are opened, with every page below their size treated as
    /// allocated.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or an existing partition file
    /// cannot be read.
    pub fn on_disk(dir: PathBuf) -> StorageResult<Self> {
        let scan_dir = dir.clone();
        let manager = Self::with_factory(Box::new(move |part| {
            let path = dir.join(format!("part.{part}"));
            Ok(Box::new(FileBackend::open_with_create_dirs(&path)?))
        }));

        if scan_dir.exists() {
            let mut existing: Vec<u32> = Vec::new();
            for entry in std::fs::read_dir(&scan_dir)? {
                let name = entry?.file_name();
                if let Some(part) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("part."))
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    existing.push(part);
                }
            }
            existing.sort_unstable();
            let mut state = manager.state.lock();
            for part in existing {
                let partition = manager.open_partition(part)?;
                state.parts.insert(part, partition);
                if part >= state.next_part {
                    state.next_part = part + 1;
                }
            }
        }

        Ok(manager)
    }

    fn with_factory(factory: PartitionFactory) -> Self {
        Self {
            state: Mutex::new(DiskState {
                parts: HashMap::new(),
                // Partition 0 is reserved for the log.
                next_part: LOG_PARTITION + 1,
            }),
            factory,
        }
    }

    /// Allocates a fresh partition and returns its number.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition's backing store cannot be created.
    pub fn alloc_part(&self) -> StorageResult<u32> {
        let mut state = self.state.lock();
        let part = state.next_part;
        let partition = self.open_partition(part)?;
        state.parts.insert(part, partition);
        state.next_part += 1;
        Ok(part)
    }

    /// Allocates a specific partition number.
    ///
    /// Used when replaying allocations whose numbers are already decided.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PartitionExists`] if already allocated.
    pub fn alloc_part_at(&self, part: u32) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.parts.contains_key(&part) {
            return Err(StorageError::PartitionExists(part));
        }
        let partition = self.open_partition(part)?;
        state.parts.insert(part, partition);
        if part >= state.next_part {
            state.next_part = part + 1;
        }
        Ok(())
    }

    /// Frees a partition and every page in it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PartitionMissing`] if not allocated.
    pub fn free_part(&self, part: u32) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.parts.remove(&part).is_none() {
            return Err(StorageError::PartitionMissing(part));
        }
        Ok(())
    }

    /// Returns whether the partition is currently allocated.
    #[must_use]
    pub fn part_exists(&self, part: u32) -> bool {
        self.state.lock().parts.contains_key(&part)
    }

    /// Allocates a fresh zeroed page in `part` and returns its page number.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PartitionMissing`] if the partition is not
    /// allocated, or an I/O error from the backing store.
    pub fn alloc_page(&self, part: u32) -> StorageResult<u64> {
        let mut state = self.state.lock();
        let partition = state
            .parts
            .get_mut(&part)
            .ok_or(StorageError::PartitionMissing(part))?;

        let index = partition.next_index;
        Self::extend_to(partition, index)?;
        partition.allocated.insert(index);
        partition.next_index = index + 1;
        Ok(page_num(part, index))
    }

    /// Allocates a specific page number.
    ///
    /// Used when replaying allocations whose numbers are already decided.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PageExists`] if already allocated, or
    /// [`StorageError::PartitionMissing`] if the partition is not allocated.
    pub fn alloc_page_at(&self, page: u64) -> StorageResult<()> {
        let part = part_num(page);
        let index = page_index(page);

        let mut state = self.state.lock();
        let partition = state
            .parts
            .get_mut(&part)
            .ok_or(StorageError::PartitionMissing(part))?;

        if partition.allocated.contains(&index) {
            return Err(StorageError::PageExists(page));
        }
        Self::extend_to(partition, index)?;
        // The slot may hold stale bytes from a freed page; reset it.
        partition
            .backend
            .write_at(u64::from(index) * PAGE_SIZE as u64, &[0u8; PAGE_SIZE])?;
        partition.allocated.insert(index);
        if index >= partition.next_index {
            partition.next_index = index + 1;
        }
        Ok(())
    }

    /// Frees a page, zeroing its slot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PageMissing`] if not allocated.
    pub fn free_page(&self, page: u64) -> StorageResult<()> {
        let part = part_num(page);
        let index = page_index(page);

        let mut state = self.state.lock();
        let partition = state
            .parts
            .get_mut(&part)
            .ok_or(StorageError::PartitionMissing(part))?;

        if !partition.allocated.remove(&index) {
            return Err(StorageError::PageMissing(page));
        }
        partition
            .backend
            .write_at(u64::from(index) * PAGE_SIZE as u64, &[0u8; PAGE_SIZE])?;
        Ok(())
    }

    /// Returns whether the page is currently allocated.
    #[must_use]
    pub fn page_exists(&self, page: u64) -> bool {
        let state = self.state.lock();
        state
            .parts
            .get(&part_num(page))
            .is_some_and(|p| p.allocated.contains(&page_index(page)))
    }

    /// Reads a full page.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PageMissing`] if the page is not allocated.
    pub fn read_page(&self, page: u64) -> StorageResult<Vec<u8>> {
        let part = part_num(page);
        let index = page_index(page);

        let state = self.state.lock();
        let partition = state
            .parts
            .get(&part)
            .ok_or(StorageError::PartitionMissing(part))?;
        if !partition.allocated.contains(&index) {
            return Err(StorageError::PageMissing(page));
        }
        partition
            .backend
            .read_at(u64::from(index) * PAGE_SIZE as u64, PAGE_SIZE)
    }

    /// Writes a full page. `data` must be exactly [`PAGE_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PageMissing`] if the page is not allocated,
    /// or [`StorageError::OutOfBounds`] on a short or long buffer.
    pub fn write_page(&self, page: u64, data: &[u8]) -> StorageResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::OutOfBounds {
                offset: 0,
                len: data.len(),
                page_size: PAGE_SIZE,
            });
        }
        let part = part_num(page);
        let index = page_index(page);

        let mut state = self.state.lock();
        let partition = state
            .parts
            .get_mut(&part)
            .ok_or(StorageError::PartitionMissing(part))?;
        if !partition.allocated.contains(&index) {
            return Err(StorageError::PageMissing(page));
        }
        partition
            .backend
            .write_at(u64::from(index) * PAGE_SIZE as u64, data)
    }

    /// Syncs every partition's backing store.
    ///
    /// # Errors
    ///
    /// Returns the first sync failure.
    pub fn sync(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        for partition in state.parts.values_mut() {
            partition.backend.sync()?;
        }
        Ok(())
    }

    fn open_partition(&self, part: u32) -> StorageResult<PartitionState> {
        let backend = (self.factory)(part)?;
        let size = backend.size()?;
        let existing = (size / PAGE_SIZE as u64) as u32;
        // Reopening a file-backed partition: every slot below the current
        // size is treated as allocated.
        let allocated = (0..existing).collect();
        Ok(PartitionState {
            backend,
            allocated,
            next_index: existing,
        })
    }

    fn extend_to(partition: &mut PartitionState, index: u32) -> StorageResult<()> {
        let needed = (u64::from(index) + 1) * PAGE_SIZE as u64;
        let mut size = partition.backend.size()?;
        while size < needed {
            partition.backend.append(&[0u8; PAGE_SIZE])?;
            size += PAGE_SIZE as u64;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DiskSpaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DiskSpaceManager")
            .field("partitions", &state.parts.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_num_packing() {
        let page = page_num(3, 7);
        assert_eq!(part_num(page), 3);
        assert_eq!(page_index(page), 7);
    }

    #[test]
    fn alloc_part_skips_log_partition() {
        let disk = DiskSpaceManager::in_memory();
        let part = disk.alloc_part().unwrap();
        assert_eq!(part, 1);
        assert!(!disk.part_exists(LOG_PARTITION));
    }

    #[test]
    fn alloc_page_round_trip() {
        let disk = DiskSpaceManager::in_memory();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();

        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        disk.write_page(page, &data).unwrap();

        assert_eq!(disk.read_page(page).unwrap(), data);
    }

    #[test]
    fn fresh_page_is_zeroed() {
        let disk = DiskSpaceManager::in_memory();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        assert_eq!(disk.read_page(page).unwrap(), vec![0u8; PAGE_SIZE]);
    }

    #[test]
    fn free_page_zeroes_and_forgets() {
        let disk = DiskSpaceManager::in_memory();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        disk.write_page(page, &[1u8; PAGE_SIZE]).unwrap();

        disk.free_page(page).unwrap();
        assert!(!disk.page_exists(page));
        assert!(matches!(
            disk.read_page(page),
            Err(StorageError::PageMissing(_))
        ));
    }

    #[test]
    fn alloc_page_at_reclaims_freed_slot() {
        let disk = DiskSpaceManager::in_memory();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        disk.write_page(page, &[9u8; PAGE_SIZE]).unwrap();
        disk.free_page(page).unwrap();

        disk.alloc_page_at(page).unwrap();
        assert_eq!(disk.read_page(page).unwrap(), vec![0u8; PAGE_SIZE]);
    }

    #[test]
    fn double_alloc_page_at_fails() {
        let disk = DiskSpaceManager::in_memory();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        assert!(matches!(
            disk.alloc_page_at(page),
            Err(StorageError::PageExists(_))
        ));
    }

    #[test]
    fn free_part_frees_pages() {
        let disk = DiskSpaceManager::in_memory();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();

        disk.free_part(part).unwrap();
        assert!(!disk.part_exists(part));
        assert!(!disk.page_exists(page));
    }

    #[test]
    fn on_disk_partition_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let page;
        let data = vec![0x5A; PAGE_SIZE];

        {
            let disk = DiskSpaceManager::on_disk(path.clone()).unwrap();
            let part = disk.alloc_part().unwrap();
            page = disk.alloc_page(part).unwrap();
            disk.write_page(page, &data).unwrap();
            disk.sync().unwrap();
        }

        {
            // Reopening discovers the partition file on its own.
            let disk = DiskSpaceManager::on_disk(path).unwrap();
            assert!(disk.part_exists(part_num(page)));
            assert_eq!(disk.read_page(page).unwrap(), data);
            // New partitions number past the recovered ones.
            assert_eq!(disk.alloc_part().unwrap(), part_num(page) + 1);
        }
    }
}
