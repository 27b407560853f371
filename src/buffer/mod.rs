// Buffer manager.
//
// Caches page frames over the disk space manager. The first 8 bytes of every
// frame hold the page LSN; callers address the remaining data region with
// offsets in `0..EFFECTIVE_PAGE_SIZE`.
//
// Frames are pinned through [`PageGuard`], which unpins on drop, so a fetch
// can never leak a pin on an early return. Three hooks connect the pool to
// the recovery manager without a hard dependency edge:
//
// - the page-flush hook runs before any dirty frame reaches disk, with the
//   frame's page LSN (the write-ahead rule);
// - the disk-I/O hook runs after a frame has been written out;
// - the dirty hook runs on every frame write, with the stamping LSN.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::common::{Lsn, PageNum, EFFECTIVE_PAGE_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::{DiskSpaceManager, StorageError, StorageResult};

type PageFlushHook = Box<dyn Fn(Lsn) + Send + Sync>;
type DiskIoHook = Box<dyn Fn(PageNum) + Send + Sync>;
type DirtyHook = Box<dyn Fn(PageNum, Lsn) + Send + Sync>;

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of resident frames before eviction kicks in.
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    dirty: bool,
    pins: u32,
}

impl Frame {
    fn page_lsn(&self) -> Lsn {
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        bytes.copy_from_slice(&self.data[..PAGE_HEADER_SIZE]);
        Lsn::from_be_bytes(bytes)
    }

    fn set_page_lsn(&mut self, lsn: Lsn) {
        self.data[..PAGE_HEADER_SIZE].copy_from_slice(&lsn.to_be_bytes());
    }
}

/// Page cache with pin accounting and write-ahead ordered eviction.
pub struct BufferManager {
    disk: Arc<DiskSpaceManager>,
    frames: Mutex<HashMap<PageNum, Frame>>,
    config: BufferConfig,
    page_flush_hook: OnceCell<PageFlushHook>,
    disk_io_hook: OnceCell<DiskIoHook>,
    dirty_hook: OnceCell<DirtyHook>,
}

impl BufferManager {
    pub fn new(disk: Arc<DiskSpaceManager>, config: BufferConfig) -> Self {
        Self {
            disk,
            frames: Mutex::new(HashMap::new()),
            config,
            page_flush_hook: OnceCell::new(),
            disk_io_hook: OnceCell::new(),
            dirty_hook: OnceCell::new(),
        }
    }

    /// Installs the pre-flush hook. Set once during wiring.
    pub fn set_page_flush_hook(&self, hook: PageFlushHook) {
        let _ = self.page_flush_hook.set(hook);
    }

    /// Installs the post-write hook. Set once during wiring.
    pub fn set_disk_io_hook(&self, hook: DiskIoHook) {
        let _ = self.disk_io_hook.set(hook);
    }

    /// Installs the frame-write hook. Set once during wiring.
    pub fn set_dirty_hook(&self, hook: DirtyHook) {
        let _ = self.dirty_hook.set(hook);
    }

    /// Fetches a page, loading it from disk on a miss, and pins it.
    pub fn fetch_page(&self, page: PageNum) -> StorageResult<PageGuard<'_>> {
        let mut frames = self.frames.lock();
        if !frames.contains_key(&page) {
            if frames.len() >= self.config.capacity {
                self.evict_one(&mut frames)?;
            }
            let mut data = Box::new([0u8; PAGE_SIZE]);
            self.disk.read_page(page, &mut data)?;
            frames.insert(
                page,
                Frame {
                    data,
                    dirty: false,
                    pins: 0,
                },
            );
        }
        let frame = frames.get_mut(&page).expect("frame was just inserted");
        frame.pins += 1;
        Ok(PageGuard {
            manager: self,
            page,
        })
    }

    /// Page numbers of all dirty resident frames.
    pub fn dirty_page_nums(&self) -> Vec<PageNum> {
        self.frames
            .lock()
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(&p, _)| p)
            .collect()
    }

    /// Writes a dirty frame back to disk, observing the write-ahead rule.
    pub fn flush_page(&self, page: PageNum) -> StorageResult<()> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get_mut(&page) {
            self.flush_frame(page, frame)?;
        }
        Ok(())
    }

    /// Flushes every dirty frame.
    pub fn flush_all(&self) -> StorageResult<()> {
        let mut frames = self.frames.lock();
        let pages: Vec<PageNum> = frames.keys().copied().collect();
        for page in pages {
            let frame = frames.get_mut(&page).expect("frame disappeared mid-flush");
            self.flush_frame(page, frame)?;
        }
        Ok(())
    }

    /// Flushes (if dirty) and drops a frame. Fails if the frame is pinned.
    pub fn evict(&self, page: PageNum) -> StorageResult<()> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get_mut(&page) {
            if frame.pins > 0 {
                return Err(StorageError::NoEvictableFrame);
            }
            self.flush_frame(page, frame)?;
            frames.remove(&page);
        }
        Ok(())
    }

    /// Evicts every unpinned frame.
    pub fn evict_all(&self) -> StorageResult<()> {
        let mut frames = self.frames.lock();
        let pages: Vec<PageNum> = frames
            .iter()
            .filter(|(_, f)| f.pins == 0)
            .map(|(&p, _)| p)
            .collect();
        for page in pages {
            let frame = frames.get_mut(&page).expect("frame disappeared mid-evict");
            self.flush_frame(page, frame)?;
            frames.remove(&page);
        }
        Ok(())
    }

    /// Drops a frame without writing it back. Used when the page itself is
    /// being freed, and by crash simulation.
    pub fn discard_frame(&self, page: PageNum) {
        self.frames.lock().remove(&page);
    }

    /// Drops every frame without writing anything back.
    pub fn discard_all(&self) {
        self.frames.lock().clear();
    }

    fn evict_one(&self, frames: &mut HashMap<PageNum, Frame>) -> StorageResult<()> {
        let victim = frames
            .iter()
            .find(|(_, f)| f.pins == 0)
            .map(|(&p, _)| p)
            .ok_or(StorageError::NoEvictableFrame)?;
        let frame = frames.get_mut(&victim).expect("victim frame disappeared");
        self.flush_frame(victim, frame)?;
        frames.remove(&victim);
        Ok(())
    }

    fn flush_frame(&self, page: PageNum, frame: &mut Frame) -> StorageResult<()> {
        if !frame.dirty {
            return Ok(());
        }
        if let Some(hook) = self.page_flush_hook.get() {
            hook(frame.page_lsn());
        }
        self.disk.write_page(page, &frame.data)?;
        frame.dirty = false;
        if let Some(hook) = self.disk_io_hook.get() {
            hook(page);
        }
        Ok(())
    }
}

/// Pinned handle to a buffered page; unpins on drop.
pub struct PageGuard<'a> {
    manager: &'a BufferManager,
    page: PageNum,
}

impl PageGuard<'_> {
    /// Page number of the pinned page.
    pub fn page_num(&self) -> PageNum {
        self.page
    }

    /// LSN of the last log record reflected on this page.
    pub fn page_lsn(&self) -> Lsn {
        let frames = self.manager.frames.lock();
        frames
            .get(&self.page)
            .expect("pinned frame missing")
            .page_lsn()
    }

    /// Reads from the data region at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> StorageResult<()> {
        if offset + buf.len() > EFFECTIVE_PAGE_SIZE {
            return Err(StorageError::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        let frames = self.manager.frames.lock();
        let frame = frames.get(&self.page).expect("pinned frame missing");
        let start = PAGE_HEADER_SIZE + offset;
        buf.copy_from_slice(&frame.data[start..start + buf.len()]);
        Ok(())
    }

    /// Writes into the data region at `offset`, stamping the page LSN and
    /// marking the frame dirty.
    pub fn write(&self, offset: usize, buf: &[u8], lsn: Lsn) -> StorageResult<()> {
        if offset + buf.len() > EFFECTIVE_PAGE_SIZE {
            return Err(StorageError::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        {
            let mut frames = self.manager.frames.lock();
            let frame = frames.get_mut(&self.page).expect("pinned frame missing");
            let start = PAGE_HEADER_SIZE + offset;
            frame.data[start..start + buf.len()].copy_from_slice(buf);
            frame.set_page_lsn(lsn);
            frame.dirty = true;
        }
        if let Some(hook) = self.manager.dirty_hook.get() {
            hook(self.page, lsn);
        }
        Ok(())
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        let mut frames = self.manager.frames.lock();
        if let Some(frame) = frames.get_mut(&self.page) {
            frame.pins = frame.pins.saturating_sub(1);
        }
    }
}
