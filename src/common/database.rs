use std::{
    path::Path,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    concurrency::{LockContext, LockManager},
    error::DbError,
    recovery::recovery_manager::{RecoveryManager, TransactionFactory},
    storage::{
        buffer_pool::BufferPool,
        disk_manager::{DiskManager, PageID},
    },
    transaction::Transaction,
    types::{DbResult, Pod},
    utils::HandyRwLock,
};

/// Wires the subsystems together: the disk manager, the buffer pool
/// on top of it, the recovery manager watching every page write, and
/// the lock manager with the root of the resource hierarchy.
///
/// Instantiable, not a process-wide singleton: tests create as many
/// independent databases as they like.
///
/// Guard ordering: code that needs both always takes the recovery
/// manager before the buffer pool.
pub struct Database {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Pod<BufferPool>,
    recovery_manager: Pod<RecoveryManager>,
    lock_manager: Arc<LockManager>,
    root_context: Arc<LockContext>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(log_path: P) -> Self {
        let disk_manager = Arc::new(DiskManager::new());
        let buffer_pool = Arc::new(RwLock::new(BufferPool::new(Arc::clone(&disk_manager))));

        let factory: TransactionFactory = Box::new(|id| Arc::new(Transaction::with_id(id)));
        let recovery_manager = Arc::new(RwLock::new(RecoveryManager::new(
            Arc::clone(&disk_manager),
            Arc::clone(&buffer_pool),
            log_path,
            factory,
        )));

        let lock_manager = Arc::new(LockManager::new());
        let root_context = LockContext::new_root(Arc::clone(&lock_manager), "database");

        Self {
            disk_manager,
            buffer_pool,
            recovery_manager,
            lock_manager,
            root_context,
        }
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub fn buffer_pool(&self) -> RwLockReadGuard<'_, BufferPool> {
        self.buffer_pool.rl()
    }

    pub fn mut_buffer_pool(&self) -> RwLockWriteGuard<'_, BufferPool> {
        self.buffer_pool.wl()
    }

    pub fn recovery_manager(&self) -> RwLockReadGuard<'_, RecoveryManager> {
        self.recovery_manager.rl()
    }

    pub fn mut_recovery_manager(&self) -> RwLockWriteGuard<'_, RecoveryManager> {
        self.recovery_manager.wl()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// The root of the lock hierarchy; table and page contexts hang
    /// off it.
    pub fn root_lock_context(&self) -> Arc<LockContext> {
        Arc::clone(&self.root_context)
    }

    pub fn start_transaction(&self) -> Arc<Transaction> {
        let tx = Arc::new(Transaction::new());
        self.recovery_manager.wl().start_transaction(&tx);
        tx
    }

    pub fn commit(&self, tx: &Arc<Transaction>) -> DbResult {
        self.recovery_manager.wl().commit(tx.get_id())?;
        self.release_all_locks(tx)?;
        self.recovery_manager.wl().end(tx.get_id())?;
        Ok(())
    }

    /// Abort: the rollback itself happens inside `end`.
    pub fn abort(&self, tx: &Arc<Transaction>) -> DbResult {
        self.recovery_manager.wl().abort(tx.get_id())?;
        self.recovery_manager.wl().end(tx.get_id())?;
        self.release_all_locks(tx)?;
        Ok(())
    }

    /// Release every lock the transaction still holds, deepest
    /// resources first.
    fn release_all_locks(&self, tx: &Arc<Transaction>) -> DbResult {
        let mut locks = self.lock_manager.locks_of(tx.get_id());
        locks.sort_by_key(|l| std::cmp::Reverse(l.resource.depth()));
        for lock in locks {
            self.lock_manager.release(tx, &lock.resource)?;
        }
        Ok(())
    }

    pub fn alloc_part(&self, tx: &Arc<Transaction>) -> Result<u32, DbError> {
        let part = self.disk_manager.alloc_part();
        self.recovery_manager.wl().log_alloc_part(tx.get_id(), part)?;
        Ok(part)
    }

    pub fn free_part(&self, tx: &Arc<Transaction>, part: u32) -> DbResult {
        self.recovery_manager.wl().log_free_part(tx.get_id(), part)?;
        self.disk_manager.free_part(part)?;
        Ok(())
    }

    pub fn alloc_page(&self, tx: &Arc<Transaction>, part: u32) -> Result<PageID, DbError> {
        let pid = self.disk_manager.alloc_page(part)?;
        self.recovery_manager.wl().log_alloc_page(tx.get_id(), pid)?;
        Ok(pid)
    }

    pub fn free_page(&self, tx: &Arc<Transaction>, pid: PageID) -> DbResult {
        self.recovery_manager.wl().log_free_page(tx.get_id(), pid)?;
        self.buffer_pool.wl().discard_page(pid);
        self.disk_manager.free_page(pid)?;
        Ok(())
    }

    /// A logged page write: the update record goes to the log first,
    /// then the bytes and the new page LSN land in the buffered page.
    pub fn page_write(
        &self,
        tx: &Arc<Transaction>,
        pid: PageID,
        offset: u16,
        after: &[u8],
    ) -> DbResult {
        let mut recovery = self.recovery_manager.wl();
        let page_pod = self.buffer_pool.wl().fetch_page(pid)?;

        let before = page_pod.rl().read_bytes(offset as usize, after.len());
        let lsn = recovery.log_page_write(tx.get_id(), pid, offset, &before, after)?;

        let mut page = page_pod.wl();
        page.write_bytes(offset as usize, after);
        page.set_page_lsn(lsn);
        page.unpin(true);
        Ok(())
    }

    /// Read bytes out of a page through the buffer pool.
    pub fn page_read(&self, pid: PageID, offset: u16, len: usize) -> Result<Vec<u8>, DbError> {
        let page_pod = self.buffer_pool.wl().fetch_page(pid)?;
        let bytes = page_pod.rl().read_bytes(offset as usize, len);
        page_pod.wl().unpin(false);
        Ok(bytes)
    }

    pub fn flush_all_pages(&self) -> DbResult {
        let mut recovery = self.recovery_manager.wl();
        self.buffer_pool.wl().flush_all_pages(&mut recovery)
    }

    pub fn checkpoint(&self) -> DbResult {
        self.recovery_manager.wl().checkpoint()
    }

    /// Throw away all volatile state, as a crash would: buffered pages
    /// and the recovery tables. The log and the disk survive.
    pub fn crash(&self) {
        self.buffer_pool.wl().clear();
        self.recovery_manager.wl().simulate_crash();
    }

    /// Run restart recovery (analysis, redo, undo, checkpoint).
    pub fn restart(&self) -> DbResult {
        self.recovery_manager.wl().restart()
    }

    /// Orderly shutdown: checkpoint and flush the log.
    pub fn close(&self) -> DbResult {
        self.recovery_manager.wl().close()
    }
}
