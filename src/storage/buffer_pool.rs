use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::{
    error::DbError,
    recovery::recovery_manager::RecoveryManager,
    storage::disk_manager::{DiskManager, PageID, PAGE_SIZE},
    types::{DbResult, Pod},
    utils::HandyRwLock,
};

/// The first 8 bytes of every on-disk page hold its page LSN; the rest
/// is payload.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - 8;

/// An in-memory copy of a disk page, pinned while in use.
pub struct Page {
    pid: PageID,
    data: Vec<u8>,
    page_lsn: u64,
    dirty: bool,
    pin_count: u32,
}

impl Page {
    fn new(pid: PageID, page_lsn: u64, data: Vec<u8>) -> Self {
        Self {
            pid,
            data,
            page_lsn,
            dirty: false,
            pin_count: 0,
        }
    }

    pub fn get_pid(&self) -> PageID {
        self.pid
    }

    pub fn get_page_lsn(&self) -> u64 {
        self.page_lsn
    }

    pub fn set_page_lsn(&mut self, lsn: u64) {
        self.page_lsn = lsn;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data[offset..offset + len].to_vec()
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.dirty = true;
    }

    pub fn unpin(&mut self, dirty: bool) {
        self.pin_count = self.pin_count.saturating_sub(1);
        self.dirty |= dirty;
    }
}

/// Caches pages between the disk manager and everything above it.
///
/// Eviction is out of scope here; the pool grows until pages are
/// flushed or discarded explicitly. Flushing honors write-ahead
/// logging by pushing the page LSN through the recovery manager's
/// flush hook before the bytes reach the disk manager.
pub struct BufferPool {
    disk_manager: Arc<DiskManager>,
    pages: HashMap<PageID, Pod<Page>>,
}

impl BufferPool {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        Self {
            disk_manager,
            pages: HashMap::new(),
        }
    }

    /// Fetch a page into the pool (reading it from disk on a miss) and
    /// pin it. The caller unpins through `Page::unpin`.
    pub fn fetch_page(&mut self, pid: PageID) -> Result<Pod<Page>, DbError> {
        if !self.pages.contains_key(&pid) {
            let raw = self.disk_manager.read_page(pid)?;

            let mut lsn_bytes = [0u8; 8];
            lsn_bytes.copy_from_slice(&raw[..8]);
            let page_lsn = u64::from_le_bytes(lsn_bytes);

            let page = Page::new(pid, page_lsn, raw[8..].to_vec());
            self.pages.insert(pid, Arc::new(RwLock::new(page)));
        }

        let pod = Arc::clone(self.pages.get(&pid).unwrap());
        pod.wl().pin_count += 1;
        Ok(pod)
    }

    /// Write one page back to disk if it is dirty. The recovery
    /// manager is handed in so the WAL rule (log durable up to the
    /// page LSN first) and the dirty page table stay honest.
    pub fn flush_page(&mut self, pid: PageID, recovery: &mut RecoveryManager) -> DbResult {
        let pod = match self.pages.get(&pid) {
            Some(p) => Arc::clone(p),
            None => return Ok(()),
        };

        let mut page = pod.wl();
        if !page.dirty {
            return Ok(());
        }

        recovery.page_flush_hook(page.page_lsn)?;

        let mut raw = Vec::with_capacity(PAGE_SIZE);
        raw.extend_from_slice(&page.page_lsn.to_le_bytes());
        raw.extend_from_slice(&page.data);
        self.disk_manager.write_page(pid, &raw)?;

        page.dirty = false;
        debug!("page {:#x} flushed, page_lsn: {}", pid, page.page_lsn);

        recovery.disk_io_hook(pid);
        Ok(())
    }

    pub fn flush_all_pages(&mut self, recovery: &mut RecoveryManager) -> DbResult {
        let pids: Vec<PageID> = self.pages.keys().cloned().collect();
        for pid in pids {
            self.flush_page(pid, recovery)?;
        }
        Ok(())
    }

    /// Visit every buffered page as `(page_id, dirty)`.
    pub fn iter_pages<F: FnMut(PageID, bool)>(&self, mut f: F) {
        for (pid, pod) in self.pages.iter() {
            f(*pid, pod.rl().dirty);
        }
    }

    /// Drop a page from the pool without writing it back.
    pub fn discard_page(&mut self, pid: PageID) {
        self.pages.remove(&pid);
    }

    /// Drop everything without writing back, as a crash would.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}
