use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use log::debug;

use crate::error::DbError;

pub const PAGE_SIZE: usize = 4096;

/// A page id packs the owning partition into the high 32 bits and the
/// page index within the partition into the low 32 bits.
pub type PageID = u64;

pub fn part_num(page_id: PageID) -> u32 {
    (page_id >> 32) as u32
}

pub fn page_index(page_id: PageID) -> u32 {
    (page_id & 0xFFFF_FFFF) as u32
}

pub fn make_page_id(part: u32, index: u32) -> PageID {
    ((part as u64) << 32) | (index as u64)
}

struct Partition {
    pages: HashMap<u32, Vec<u8>>,
    next_page_index: u32,
}

impl Partition {
    fn new() -> Self {
        Self {
            pages: HashMap::new(),
            next_page_index: 0,
        }
    }
}

/// Hands out partitions and fixed-size pages, and moves raw bytes in
/// and out of them.
///
/// The backing store is an in-memory map: the on-disk layout proper
/// belongs to a different layer. What matters to the rest of the crate
/// is the allocation contract (reads and writes fail on pages that
/// were never allocated or have been freed).
pub struct DiskManager {
    partitions: Mutex<HashMap<u32, Partition>>,
    next_part_num: AtomicU32,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            next_part_num: AtomicU32::new(0),
        }
    }

    pub fn alloc_part(&self) -> u32 {
        let part = self.next_part_num.fetch_add(1, Ordering::SeqCst);
        self.partitions
            .lock()
            .unwrap()
            .insert(part, Partition::new());
        debug!("partition {} allocated", part);
        part
    }

    /// Allocate a partition under a caller-chosen number, used when
    /// replaying allocations from the log.
    pub fn alloc_part_with(&self, part: u32) -> Result<(), DbError> {
        let mut partitions = self.partitions.lock().unwrap();
        if partitions.contains_key(&part) {
            return Err(DbError::new(&format!(
                "partition {} already allocated",
                part
            )));
        }
        partitions.insert(part, Partition::new());

        // keep the allocator ahead of explicit numbers
        let mut next = self.next_part_num.load(Ordering::SeqCst);
        while next <= part {
            match self.next_part_num.compare_exchange(
                next,
                part + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(v) => next = v,
            }
        }
        Ok(())
    }

    pub fn free_part(&self, part: u32) -> Result<(), DbError> {
        let mut partitions = self.partitions.lock().unwrap();
        match partitions.remove(&part) {
            Some(_) => Ok(()),
            None => Err(DbError::new(&format!("partition {} not allocated", part))),
        }
    }

    pub fn is_part_allocated(&self, part: u32) -> bool {
        self.partitions.lock().unwrap().contains_key(&part)
    }

    pub fn alloc_page(&self, part: u32) -> Result<PageID, DbError> {
        let mut partitions = self.partitions.lock().unwrap();
        let partition = partitions
            .get_mut(&part)
            .ok_or(DbError::new(&format!("partition {} not allocated", part)))?;

        let index = partition.next_page_index;
        partition.next_page_index += 1;
        partition.pages.insert(index, vec![0u8; PAGE_SIZE]);

        let pid = make_page_id(part, index);
        debug!("page {:#x} allocated", pid);
        Ok(pid)
    }

    /// Allocate a specific page id, used when replaying allocations
    /// from the log.
    pub fn alloc_page_with(&self, page_id: PageID) -> Result<(), DbError> {
        let part = part_num(page_id);
        let index = page_index(page_id);

        let mut partitions = self.partitions.lock().unwrap();
        let partition = partitions
            .get_mut(&part)
            .ok_or(DbError::new(&format!("partition {} not allocated", part)))?;

        if partition.pages.contains_key(&index) {
            return Err(DbError::new(&format!(
                "page {:#x} already allocated",
                page_id
            )));
        }
        partition.pages.insert(index, vec![0u8; PAGE_SIZE]);
        if partition.next_page_index <= index {
            partition.next_page_index = index + 1;
        }
        Ok(())
    }

    pub fn free_page(&self, page_id: PageID) -> Result<(), DbError> {
        let mut partitions = self.partitions.lock().unwrap();
        let partition = partitions
            .get_mut(&part_num(page_id))
            .ok_or(DbError::new(&format!(
                "partition {} not allocated",
                part_num(page_id)
            )))?;

        match partition.pages.remove(&page_index(page_id)) {
            Some(_) => Ok(()),
            None => Err(DbError::new(&format!("page {:#x} not allocated", page_id))),
        }
    }

    pub fn is_page_allocated(&self, page_id: PageID) -> bool {
        let partitions = self.partitions.lock().unwrap();
        match partitions.get(&part_num(page_id)) {
            Some(p) => p.pages.contains_key(&page_index(page_id)),
            None => false,
        }
    }

    pub fn read_page(&self, page_id: PageID) -> Result<Vec<u8>, DbError> {
        let partitions = self.partitions.lock().unwrap();
        partitions
            .get(&part_num(page_id))
            .and_then(|p| p.pages.get(&page_index(page_id)))
            .cloned()
            .ok_or(DbError::new(&format!("page {:#x} not allocated", page_id)))
    }

    pub fn write_page(&self, page_id: PageID, data: &[u8]) -> Result<(), DbError> {
        if data.len() != PAGE_SIZE {
            return Err(DbError::new(&format!(
                "page write of {} bytes, expect {}",
                data.len(),
                PAGE_SIZE
            )));
        }

        let mut partitions = self.partitions.lock().unwrap();
        let page = partitions
            .get_mut(&part_num(page_id))
            .and_then(|p| p.pages.get_mut(&page_index(page_id)))
            .ok_or(DbError::new(&format!("page {:#x} not allocated", page_id)))?;
        page.copy_from_slice(data);
        Ok(())
    }
}
