use std::{
    collections::{BinaryHeap, HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use log::{debug, info};

use crate::{
    error::DbError,
    recovery::{
        log_manager::LogManager,
        log_record::LogRecord,
    },
    storage::{
        buffer_pool::{BufferPool, EFFECTIVE_PAGE_SIZE},
        disk_manager::{DiskManager, PageID},
    },
    transaction::{Transaction, TransactionID, TransactionStatus},
    types::{DbResult, Pod},
    utils::HandyRwLock,
};

/// What the recovery manager tracks per live transaction.
pub struct TransactionTableEntry {
    pub transaction: Arc<Transaction>,
    /// LSN of the most recent log record mentioning this transaction.
    pub last_lsn: u64,
    pub touched_pages: HashSet<PageID>,
    /// Savepoint name to the LSN rollback should stop at. Duplicate
    /// names overwrite.
    pub savepoints: HashMap<String, u64>,
}

impl TransactionTableEntry {
    fn new(transaction: Arc<Transaction>) -> Self {
        Self {
            transaction,
            last_lsn: 0,
            touched_pages: HashSet::new(),
            savepoints: HashMap::new(),
        }
    }
}

pub type TransactionFactory = Box<dyn Fn(TransactionID) -> Arc<Transaction> + Send + Sync>;

/// ARIES: write-ahead logging in the forward path, fuzzy checkpoints,
/// and the analysis / redo / undo passes on restart.
///
/// Owns the log manager, the dirty page table (page to recLSN, the LSN
/// of the earliest record that dirtied it since it was last clean on
/// disk) and the transaction table. Completely independent of the lock
/// subsystem.
pub struct RecoveryManager {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Pod<BufferPool>,
    log_manager: LogManager,

    dirty_page_table: HashMap<PageID, u64>,
    transaction_table: HashMap<TransactionID, TransactionTableEntry>,

    /// Builds transaction handles for transactions met during restart
    /// analysis.
    txn_factory: TransactionFactory,

    /// While the redo pass runs, pages written to disk must keep their
    /// dirty page table entries (the recLSNs are still needed), so the
    /// disk io hook is gated on this.
    redo_complete: bool,
}

impl RecoveryManager {
    pub fn new<P: AsRef<Path>>(
        disk_manager: Arc<DiskManager>,
        buffer_pool: Pod<BufferPool>,
        log_path: P,
        txn_factory: TransactionFactory,
    ) -> Self {
        let mut instance = Self {
            disk_manager,
            buffer_pool,
            log_manager: LogManager::new(log_path),
            dirty_page_table: HashMap::new(),
            transaction_table: HashMap::new(),
            txn_factory,
            redo_complete: true,
        };

        // a brand-new log gets its first checkpoint so the master
        // record always points somewhere
        if instance.log_manager.get_master_lsn() == 0 {
            instance.checkpoint().unwrap();
        }
        instance
    }

    pub fn get_dirty_page_table(&self) -> &HashMap<PageID, u64> {
        &self.dirty_page_table
    }

    pub fn get_transaction_table(&self) -> &HashMap<TransactionID, TransactionTableEntry> {
        &self.transaction_table
    }

    pub fn get_log_manager(&mut self) -> &mut LogManager {
        &mut self.log_manager
    }

    fn xt_entry(&mut self, txn_id: TransactionID) -> &mut TransactionTableEntry {
        self.transaction_table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("tx_{} is not in the transaction table", txn_id))
    }

    // ------------------------------------------------------------------
    // forward processing
    // ------------------------------------------------------------------

    pub fn start_transaction(&mut self, tx: &Arc<Transaction>) {
        self.transaction_table
            .entry(tx.get_id())
            .or_insert_with(|| TransactionTableEntry::new(Arc::clone(tx)));
    }

    /// Log one page write, with before and after images of equal
    /// length. Writes wider than half a page are split so every record
    /// stays under the cap.
    pub fn log_page_write(
        &mut self,
        txn_id: TransactionID,
        page_id: PageID,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> Result<u64, DbError> {
        if before.len() != after.len() {
            return Err(DbError::new("before and after images differ in length"));
        }

        let half = EFFECTIVE_PAGE_SIZE / 2;
        let mut lsn = 0;
        let mut start = 0;
        while start < before.len() || (before.is_empty() && start == 0) {
            let end = (start + half).min(before.len());

            let entry = self.xt_entry(txn_id);
            let record = LogRecord::UpdatePage {
                txn_id,
                prev_lsn: entry.last_lsn,
                page_id,
                offset: offset + start as u16,
                before: before[start..end].to_vec(),
                after: after[start..end].to_vec(),
            };
            lsn = self.log_manager.append(record);

            let entry = self.xt_entry(txn_id);
            entry.last_lsn = lsn;
            entry.touched_pages.insert(page_id);
            self.dirty_page_table.entry(page_id).or_insert(lsn);

            if end == before.len() {
                break;
            }
            start = end;
        }
        Ok(lsn)
    }

    pub fn log_alloc_part(&mut self, txn_id: TransactionID, part: u32) -> Result<u64, DbError> {
        let prev_lsn = self.xt_entry(txn_id).last_lsn;
        let lsn = self.log_manager.append(LogRecord::AllocPart {
            txn_id,
            prev_lsn,
            part_num: part,
        });
        self.xt_entry(txn_id).last_lsn = lsn;
        self.log_manager.flush_to(lsn)?;
        Ok(lsn)
    }

    pub fn log_free_part(&mut self, txn_id: TransactionID, part: u32) -> Result<u64, DbError> {
        let prev_lsn = self.xt_entry(txn_id).last_lsn;
        let lsn = self.log_manager.append(LogRecord::FreePart {
            txn_id,
            prev_lsn,
            part_num: part,
        });
        self.xt_entry(txn_id).last_lsn = lsn;
        self.log_manager.flush_to(lsn)?;
        Ok(lsn)
    }

    pub fn log_alloc_page(
        &mut self,
        txn_id: TransactionID,
        page_id: PageID,
    ) -> Result<u64, DbError> {
        let prev_lsn = self.xt_entry(txn_id).last_lsn;
        let lsn = self.log_manager.append(LogRecord::AllocPage {
            txn_id,
            prev_lsn,
            page_id,
        });
        self.xt_entry(txn_id).last_lsn = lsn;
        self.log_manager.flush_to(lsn)?;
        Ok(lsn)
    }

    /// Freeing a page also forgets it ever was dirty.
    pub fn log_free_page(
        &mut self,
        txn_id: TransactionID,
        page_id: PageID,
    ) -> Result<u64, DbError> {
        let prev_lsn = self.xt_entry(txn_id).last_lsn;
        let lsn = self.log_manager.append(LogRecord::FreePage {
            txn_id,
            prev_lsn,
            page_id,
        });
        self.xt_entry(txn_id).last_lsn = lsn;
        self.dirty_page_table.remove(&page_id);
        self.log_manager.flush_to(lsn)?;
        Ok(lsn)
    }

    /// Append the commit record and make it durable before returning.
    pub fn commit(&mut self, txn_id: TransactionID) -> Result<u64, DbError> {
        let prev_lsn = self.xt_entry(txn_id).last_lsn;
        let lsn = self
            .log_manager
            .append(LogRecord::CommitTransaction { txn_id, prev_lsn });

        let entry = self.xt_entry(txn_id);
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Committing);

        self.log_manager.flush_to(lsn)?;
        Ok(lsn)
    }

    /// Append the abort record. The actual rollback happens in `end`.
    pub fn abort(&mut self, txn_id: TransactionID) -> Result<u64, DbError> {
        let prev_lsn = self.xt_entry(txn_id).last_lsn;
        let lsn = self
            .log_manager
            .append(LogRecord::AbortTransaction { txn_id, prev_lsn });

        let entry = self.xt_entry(txn_id);
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Aborting);
        Ok(lsn)
    }

    /// Finish the transaction: roll it back first if it is aborting,
    /// append the end record, and drop it from the table.
    pub fn end(&mut self, txn_id: TransactionID) -> Result<u64, DbError> {
        let status = self.xt_entry(txn_id).transaction.get_status();
        if matches!(
            status,
            TransactionStatus::Aborting | TransactionStatus::RecoveryAborting
        ) {
            self.rollback_to_lsn(txn_id, 0);
        }

        let entry = self.xt_entry(txn_id);
        let prev_lsn = entry.last_lsn;
        let transaction = Arc::clone(&entry.transaction);

        let lsn = self
            .log_manager
            .append(LogRecord::EndTransaction { txn_id, prev_lsn });

        transaction.cleanup();
        transaction.set_status(TransactionStatus::Complete);
        self.transaction_table.remove(&txn_id);
        Ok(lsn)
    }

    pub fn savepoint(&mut self, txn_id: TransactionID, name: &str) {
        let entry = self.xt_entry(txn_id);
        let lsn = entry.last_lsn;
        entry.savepoints.insert(name.to_string(), lsn);
    }

    pub fn release_savepoint(&mut self, txn_id: TransactionID, name: &str) {
        self.xt_entry(txn_id).savepoints.remove(name);
    }

    pub fn rollback_to_savepoint(&mut self, txn_id: TransactionID, name: &str) -> DbResult {
        let target = match self.xt_entry(txn_id).savepoints.get(name) {
            Some(lsn) => *lsn,
            None => {
                return Err(DbError::new(&format!(
                    "tx_{} has no savepoint named {:?}",
                    txn_id, name
                )))
            }
        };
        self.rollback_to_lsn(txn_id, target);
        Ok(())
    }

    /// Write-ahead rule: before a page with this page LSN reaches
    /// disk, the log must be durable through it.
    pub fn page_flush_hook(&mut self, page_lsn: u64) -> DbResult {
        self.log_manager.flush_to(page_lsn)
    }

    /// A page made it to disk clean, so it is no longer dirty. Gated
    /// during the redo pass, which still needs the recLSNs.
    pub fn disk_io_hook(&mut self, page_id: PageID) {
        if self.redo_complete {
            self.dirty_page_table.remove(&page_id);
        }
    }

    /// Walk the transaction's record chain backwards, compensating
    /// every undoable record above `target_lsn`.
    fn rollback_to_lsn(&mut self, txn_id: TransactionID, target_lsn: u64) {
        let mut current_lsn = self.xt_entry(txn_id).last_lsn;

        while current_lsn > target_lsn {
            let record = self.log_manager.fetch(current_lsn);

            if let Some(undo_next) = record.get_undo_next_lsn() {
                if undo_next >= current_lsn {
                    panic!(
                        "corrupted log: CLR at {} has undo_next {} past itself",
                        current_lsn, undo_next
                    );
                }
            }

            if record.is_undoable() {
                let last_lsn = self.xt_entry(txn_id).last_lsn;
                let clr = record.undo(last_lsn);
                let clr_lsn = self.log_manager.append(clr.clone());
                self.xt_entry(txn_id).last_lsn = clr_lsn;
                clr.redo(clr_lsn, &self.disk_manager, &self.buffer_pool);
            }

            current_lsn = record
                .get_undo_next_lsn()
                .or(record.get_prev_lsn())
                .unwrap_or(0);
        }
    }

    // ------------------------------------------------------------------
    // checkpoint
    // ------------------------------------------------------------------

    /// Fuzzy checkpoint: a begin record, then the dirty page table and
    /// transaction table streamed into as many end records as they
    /// need (at least one, even when both are empty), then the master
    /// record is pointed at the begin.
    pub fn checkpoint(&mut self) -> DbResult {
        let begin_lsn = self.log_manager.append(LogRecord::BeginCheckpoint);

        let mut chk_dpt: Vec<(PageID, u64)> = Vec::new();
        let mut chk_txn: Vec<(TransactionID, TransactionStatus, u64)> = Vec::new();

        let mut dpt_entries: Vec<(PageID, u64)> = self
            .dirty_page_table
            .iter()
            .map(|(p, l)| (*p, *l))
            .collect();
        dpt_entries.sort();

        for (page_id, rec_lsn) in dpt_entries {
            if !LogRecord::checkpoint_fits(chk_dpt.len() + 1, chk_txn.len()) {
                self.log_manager.append(LogRecord::EndCheckpoint {
                    dpt: std::mem::take(&mut chk_dpt),
                    txn_table: std::mem::take(&mut chk_txn),
                });
            }
            chk_dpt.push((page_id, rec_lsn));
        }

        let mut txn_entries: Vec<(TransactionID, TransactionStatus, u64)> = self
            .transaction_table
            .iter()
            .map(|(id, e)| (*id, e.transaction.get_status(), e.last_lsn))
            .collect();
        txn_entries.sort_by_key(|(id, _, _)| *id);

        for entry in txn_entries {
            if !LogRecord::checkpoint_fits(chk_dpt.len(), chk_txn.len() + 1) {
                self.log_manager.append(LogRecord::EndCheckpoint {
                    dpt: std::mem::take(&mut chk_dpt),
                    txn_table: std::mem::take(&mut chk_txn),
                });
            }
            chk_txn.push(entry);
        }

        let end_lsn = self.log_manager.append(LogRecord::EndCheckpoint {
            dpt: chk_dpt,
            txn_table: chk_txn,
        });

        self.log_manager.flush_to(end_lsn)?;
        self.log_manager.rewrite_master(begin_lsn)?;
        debug!("checkpoint taken, begin lsn {}", begin_lsn);
        Ok(())
    }

    /// Checkpoint and flush everything on shutdown.
    pub fn close(&mut self) -> DbResult {
        self.checkpoint()?;
        self.log_manager.flush_all()
    }

    /// Forget all volatile state, as a crash would. The log file and
    /// the disk survive.
    pub fn simulate_crash(&mut self) {
        self.dirty_page_table.clear();
        self.transaction_table.clear();
        self.redo_complete = true;
    }

    // ------------------------------------------------------------------
    // restart
    // ------------------------------------------------------------------

    /// Crash recovery: analysis, redo, undo, then a fresh checkpoint.
    pub fn restart(&mut self) -> DbResult {
        info!("restart recovery begins");

        self.redo_complete = false;
        self.restart_analysis();
        self.restart_redo();
        self.redo_complete = true;
        self.clean_dpt();
        self.restart_undo();
        self.checkpoint()?;

        info!("restart recovery complete");
        Ok(())
    }

    /// Reconstruct the dirty page table and transaction table by
    /// scanning forward from the last begin-checkpoint.
    fn restart_analysis(&mut self) {
        let master_lsn = self.log_manager.get_master_lsn();
        let records = self.log_manager.scan_from(master_lsn);

        let mut ended: HashSet<TransactionID> = HashSet::new();

        for (lsn, record) in records {
            if let Some(txn_id) = record.get_txn_id() {
                if !self.transaction_table.contains_key(&txn_id) {
                    let tx = (self.txn_factory)(txn_id);
                    self.transaction_table
                        .insert(txn_id, TransactionTableEntry::new(tx));
                }
                let entry = self.transaction_table.get_mut(&txn_id).unwrap();
                entry.last_lsn = lsn;

                match record {
                    LogRecord::CommitTransaction { .. } => {
                        entry
                            .transaction
                            .set_status(TransactionStatus::Committing);
                    }
                    LogRecord::AbortTransaction { .. } => {
                        entry
                            .transaction
                            .set_status(TransactionStatus::RecoveryAborting);
                    }
                    LogRecord::EndTransaction { .. } => {
                        entry.transaction.cleanup();
                        entry.transaction.set_status(TransactionStatus::Complete);
                        self.transaction_table.remove(&txn_id);
                        ended.insert(txn_id);
                    }
                    _ => {}
                }
            }

            if let Some(page_id) = record.get_page_id() {
                match record {
                    LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                        self.dirty_page_table.entry(page_id).or_insert(lsn);
                    }
                    LogRecord::FreePage { .. } | LogRecord::UndoAllocPage { .. } => {
                        self.log_manager.flush_to(lsn).unwrap();
                        self.dirty_page_table.remove(&page_id);
                    }
                    // allocation dirties nothing that redo needs
                    LogRecord::AllocPage { .. } | LogRecord::UndoFreePage { .. } => {}
                    _ => {}
                }
            }

            if let LogRecord::EndCheckpoint { dpt, txn_table } = record {
                for (page_id, rec_lsn) in dpt {
                    self.dirty_page_table.insert(page_id, rec_lsn);
                }
                for (txn_id, status, chk_last_lsn) in txn_table {
                    if ended.contains(&txn_id) {
                        continue;
                    }
                    if !self.transaction_table.contains_key(&txn_id) {
                        let tx = (self.txn_factory)(txn_id);
                        self.transaction_table
                            .insert(txn_id, TransactionTableEntry::new(tx));
                    }
                    let entry = self.transaction_table.get_mut(&txn_id).unwrap();
                    entry.last_lsn = entry.last_lsn.max(chk_last_lsn);

                    // statuses only advance, never regress
                    if entry.transaction.get_status() == TransactionStatus::Running {
                        match status {
                            TransactionStatus::Committing => {
                                entry
                                    .transaction
                                    .set_status(TransactionStatus::Committing);
                            }
                            TransactionStatus::Aborting
                            | TransactionStatus::RecoveryAborting => {
                                entry
                                    .transaction
                                    .set_status(TransactionStatus::RecoveryAborting);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        // settle what is left: committing transactions end now,
        // running ones will be rolled back by the undo pass
        let txn_ids: Vec<TransactionID> = self.transaction_table.keys().cloned().collect();
        for txn_id in txn_ids {
            let status = self.xt_entry(txn_id).transaction.get_status();
            match status {
                TransactionStatus::Committing => {
                    let entry = self.xt_entry(txn_id);
                    let prev_lsn = entry.last_lsn;
                    let transaction = Arc::clone(&entry.transaction);
                    self.log_manager
                        .append(LogRecord::EndTransaction { txn_id, prev_lsn });
                    transaction.cleanup();
                    transaction.set_status(TransactionStatus::Complete);
                    self.transaction_table.remove(&txn_id);
                }
                TransactionStatus::Running => {
                    let entry = self.xt_entry(txn_id);
                    entry
                        .transaction
                        .set_status(TransactionStatus::RecoveryAborting);
                    let prev_lsn = entry.last_lsn;
                    let lsn = self
                        .log_manager
                        .append(LogRecord::AbortTransaction { txn_id, prev_lsn });
                    self.xt_entry(txn_id).last_lsn = lsn;
                }
                TransactionStatus::RecoveryAborting => {}
                other => panic!("tx_{} has impossible status {:?} after analysis", txn_id, other),
            }
        }

        debug!(
            "analysis done: {} dirty pages, {} live transactions",
            self.dirty_page_table.len(),
            self.transaction_table.len()
        );
    }

    /// Replay history from the earliest recLSN. Allocation-style
    /// records replay unconditionally; page-modifying records only
    /// when the dirty page table and the on-disk page LSN say their
    /// effect is missing.
    fn restart_redo(&mut self) {
        let start_lsn = match self.dirty_page_table.values().min() {
            Some(lsn) => *lsn,
            None => return,
        };

        for (lsn, record) in self.log_manager.scan_from(start_lsn) {
            if !record.is_redoable() {
                continue;
            }

            if record.is_page_modifying() {
                let page_id = record.get_page_id().unwrap();
                let rec_lsn = match self.dirty_page_table.get(&page_id) {
                    Some(rec_lsn) => *rec_lsn,
                    None => continue,
                };
                if rec_lsn > lsn {
                    continue;
                }
                if !self.disk_manager.is_page_allocated(page_id) {
                    // freed on disk already; nothing left to apply
                    continue;
                }
                let page_pod = self.buffer_pool.wl().fetch_page(page_id).unwrap();
                let page_lsn = page_pod.rl().get_page_lsn();
                page_pod.wl().unpin(false);
                if page_lsn >= lsn {
                    continue;
                }
            }

            record.redo(lsn, &self.disk_manager, &self.buffer_pool);
        }
        debug!("redo pass done");
    }

    /// Drop dirty page table entries for pages the buffer manager no
    /// longer considers dirty; survivors keep their recLSN.
    fn clean_dpt(&mut self) {
        let mut actually_dirty: HashSet<PageID> = HashSet::new();
        self.buffer_pool.rl().iter_pages(|page_id, dirty| {
            if dirty {
                actually_dirty.insert(page_id);
            }
        });
        self.dirty_page_table
            .retain(|page_id, _| actually_dirty.contains(page_id));
    }

    /// Roll back every transaction recovery decided to abort, largest
    /// last-LSN first, emitting CLRs as it goes.
    fn restart_undo(&mut self) {
        let mut heap: BinaryHeap<(u64, TransactionID)> = self
            .transaction_table
            .iter()
            .map(|(id, e)| (e.last_lsn, *id))
            .collect();

        while let Some((lsn, txn_id)) = heap.pop() {
            let record = self.log_manager.fetch(lsn);

            if let Some(undo_next) = record.get_undo_next_lsn() {
                if undo_next >= lsn {
                    panic!(
                        "corrupted log: CLR at {} has undo_next {} past itself",
                        lsn, undo_next
                    );
                }
            }

            if record.is_undoable() {
                let last_lsn = self.xt_entry(txn_id).last_lsn;
                let clr = record.undo(last_lsn);
                let clr_lsn = self.log_manager.append(clr.clone());
                self.xt_entry(txn_id).last_lsn = clr_lsn;
                clr.redo(clr_lsn, &self.disk_manager, &self.buffer_pool);
            }

            let next_lsn = record
                .get_undo_next_lsn()
                .or(record.get_prev_lsn())
                .unwrap_or(0);

            if next_lsn == 0 {
                let entry = self.xt_entry(txn_id);
                let prev_lsn = entry.last_lsn;
                let transaction = Arc::clone(&entry.transaction);
                self.log_manager
                    .append(LogRecord::EndTransaction { txn_id, prev_lsn });
                transaction.cleanup();
                transaction.set_status(TransactionStatus::Complete);
                self.transaction_table.remove(&txn_id);
            } else {
                heap.push((next_lsn, txn_id));
            }
        }
        debug!("undo pass done");
    }
}
