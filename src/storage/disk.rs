// Disk space manager.
//
// Tracks which partitions and pages exist and stores page images. Pages are
// addressed by a 64-bit page number whose high half is the partition number,
// so ownership checks are arithmetic. Partition 0 belongs to the log and is
// never handed out by `alloc_part`.
//
// The store is memory-backed: "disk" contents survive a simulated crash
// (buffer frames and the unflushed log tail do not), which is exactly the
// failure model restart recovery is tested against.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::{page_index, page_num, part_num, PageNum, PartNum, LOG_PARTITION, PAGE_SIZE};

/// Result type alias for disk operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the disk space manager and the buffer pool above it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Partition already exists.
    #[error("partition {0} is already allocated")]
    PartitionExists(PartNum),

    /// Partition does not exist.
    #[error("partition {0} is not allocated")]
    PartitionNotFound(PartNum),

    /// Page already exists.
    #[error("page {0} is already allocated")]
    PageExists(PageNum),

    /// Page does not exist.
    #[error("page {0} is not allocated")]
    PageNotAllocated(PageNum),

    /// Read or write outside the usable page area.
    #[error("offset {offset} + {len} bytes does not fit in a page")]
    OutOfBounds { offset: usize, len: usize },

    /// All buffer frames are pinned; nothing can be evicted.
    #[error("buffer pool is full and every frame is pinned")]
    NoEvictableFrame,
}

#[derive(Default)]
struct Partition {
    pages: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
    next_index: u32,
}

#[derive(Default)]
struct DiskState {
    partitions: HashMap<PartNum, Partition>,
    next_part: PartNum,
}

/// In-memory partitioned page store.
pub struct DiskSpaceManager {
    state: Mutex<DiskState>,
}

impl DiskSpaceManager {
    /// Creates a disk space manager with the log partition already present.
    pub fn new() -> Self {
        let mut state = DiskState::default();
        state.partitions.insert(LOG_PARTITION, Partition::default());
        state.next_part = LOG_PARTITION + 1;
        Self {
            state: Mutex::new(state),
        }
    }

    /// Allocates a fresh partition and returns its number.
    pub fn alloc_part(&self) -> StorageResult<PartNum> {
        let mut state = self.state.lock();
        let part = state.next_part;
        state.next_part += 1;
        state.partitions.insert(part, Partition::default());
        Ok(part)
    }

    /// Allocates a specific partition number. Used when replaying the log.
    pub fn alloc_part_num(&self, part: PartNum) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.partitions.contains_key(&part) {
            return Err(StorageError::PartitionExists(part));
        }
        state.partitions.insert(part, Partition::default());
        if part >= state.next_part {
            state.next_part = part + 1;
        }
        Ok(())
    }

    /// Frees a partition and every page in it.
    pub fn free_part(&self, part: PartNum) -> StorageResult<()> {
        let mut state = self.state.lock();
        state
            .partitions
            .remove(&part)
            .map(|_| ())
            .ok_or(StorageError::PartitionNotFound(part))
    }

    /// Allocates the next free page in a partition, zero-filled.
    pub fn alloc_page(&self, part: PartNum) -> StorageResult<PageNum> {
        let mut state = self.state.lock();
        let partition = state
            .partitions
            .get_mut(&part)
            .ok_or(StorageError::PartitionNotFound(part))?;
        let index = partition.next_index;
        partition.next_index += 1;
        partition.pages.insert(index, Box::new([0u8; PAGE_SIZE]));
        Ok(page_num(part, index))
    }

    /// Allocates a specific page number, zero-filled. Used when replaying
    /// the log.
    pub fn alloc_page_num(&self, page: PageNum) -> StorageResult<()> {
        let part = part_num(page);
        let index = page_index(page);
        let mut state = self.state.lock();
        let partition = state
            .partitions
            .get_mut(&part)
            .ok_or(StorageError::PartitionNotFound(part))?;
        if partition.pages.contains_key(&index) {
            return Err(StorageError::PageExists(page));
        }
        partition.pages.insert(index, Box::new([0u8; PAGE_SIZE]));
        if index >= partition.next_index {
            partition.next_index = index + 1;
        }
        Ok(())
    }

    /// Frees a page.
    pub fn free_page(&self, page: PageNum) -> StorageResult<()> {
        let part = part_num(page);
        let mut state = self.state.lock();
        let partition = state
            .partitions
            .get_mut(&part)
            .ok_or(StorageError::PartitionNotFound(part))?;
        partition
            .pages
            .remove(&page_index(page))
            .map(|_| ())
            .ok_or(StorageError::PageNotAllocated(page))
    }

    /// Returns true if the page exists.
    pub fn is_page_allocated(&self, page: PageNum) -> bool {
        let state = self.state.lock();
        state
            .partitions
            .get(&part_num(page))
            .map(|p| p.pages.contains_key(&page_index(page)))
            .unwrap_or(false)
    }

    /// Returns true if the partition exists.
    pub fn is_part_allocated(&self, part: PartNum) -> bool {
        self.state.lock().partitions.contains_key(&part)
    }

    /// Reads a full page image into `buf`.
    pub fn read_page(&self, page: PageNum, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let state = self.state.lock();
        let data = state
            .partitions
            .get(&part_num(page))
            .and_then(|p| p.pages.get(&page_index(page)))
            .ok_or(StorageError::PageNotAllocated(page))?;
        buf.copy_from_slice(&data[..]);
        Ok(())
    }

    /// Writes a full page image.
    pub fn write_page(&self, page: PageNum, buf: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let mut state = self.state.lock();
        let data = state
            .partitions
            .get_mut(&part_num(page))
            .and_then(|p| p.pages.get_mut(&page_index(page)))
            .ok_or(StorageError::PageNotAllocated(page))?;
        data.copy_from_slice(buf);
        Ok(())
    }
}

impl Default for DiskSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_partition_reserved() {
        let disk = DiskSpaceManager::new();
        assert!(disk.is_part_allocated(LOG_PARTITION));
        assert_eq!(disk.alloc_part().unwrap(), 1);
    }

    #[test]
    fn test_alloc_read_write_free() {
        let disk = DiskSpaceManager::new();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        assert_eq!(part_num(page), part);
        assert!(disk.is_page_allocated(page));

        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(page, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        buf[100] = 0xAB;
        disk.write_page(page, &buf).unwrap();
        let mut back = [0u8; PAGE_SIZE];
        disk.read_page(page, &mut back).unwrap();
        assert_eq!(back[100], 0xAB);

        disk.free_page(page).unwrap();
        assert_eq!(
            disk.read_page(page, &mut back),
            Err(StorageError::PageNotAllocated(page))
        );
    }

    #[test]
    fn test_explicit_allocation_for_replay() {
        let disk = DiskSpaceManager::new();
        disk.alloc_part_num(4).unwrap();
        assert_eq!(disk.alloc_part_num(4), Err(StorageError::PartitionExists(4)));

        let page = page_num(4, 9);
        disk.alloc_page_num(page).unwrap();
        assert_eq!(disk.alloc_page_num(page), Err(StorageError::PageExists(page)));

        // The next sequential allocation continues past the explicit one.
        assert_eq!(disk.alloc_page(4).unwrap(), page_num(4, 10));
    }

    #[test]
    fn test_free_part_drops_pages() {
        let disk = DiskSpaceManager::new();
        let part = disk.alloc_part().unwrap();
        let page = disk.alloc_page(part).unwrap();
        disk.free_part(part).unwrap();
        assert!(!disk.is_page_allocated(page));
        assert_eq!(disk.free_part(part), Err(StorageError::PartitionNotFound(part)));
    }
}
