use minirel::recovery::LogRecord;
use minirel::storage::buffer_pool::EFFECTIVE_PAGE_SIZE;
use minirel::storage::disk_manager::PageID;
use minirel::transaction::TransactionStatus;
use minirel::Database;

use crate::test_utils::new_database;

fn log_records(db: &Database) -> Vec<(u64, LogRecord)> {
    db.mut_recovery_manager().get_log_manager().scan_from(0)
}

fn master_lsn(db: &Database) -> u64 {
    db.mut_recovery_manager().get_log_manager().get_master_lsn()
}

#[test]
fn test_forward_logging_tracks_dpt_and_xt() {
    let db = new_database("forward_logging");

    let tx = db.start_transaction();
    let part = db.alloc_part(&tx).unwrap();
    let pid = db.alloc_page(&tx, part).unwrap();

    db.page_write(&tx, pid, 0, &[1, 2, 3]).unwrap();
    db.page_write(&tx, pid, 8, &[4, 5, 6]).unwrap();

    {
        let recovery = db.recovery_manager();

        // the page went dirty at the first update
        let dpt = recovery.get_dirty_page_table();
        assert!(dpt.contains_key(&pid));

        let xt = recovery.get_transaction_table();
        let entry = xt.get(&tx.get_id()).unwrap();
        assert!(entry.touched_pages.contains(&pid));
        assert!(entry.last_lsn > 0);
    }

    // the transaction's records chain backwards through prev_lsn
    let records = log_records(&db);
    let tx_lsns: Vec<(u64, u64)> = records
        .iter()
        .filter(|(_, r)| r.get_txn_id() == Some(tx.get_id()))
        .map(|(lsn, r)| (*lsn, r.get_prev_lsn().unwrap()))
        .collect();
    assert!(tx_lsns.len() >= 4);
    assert_eq!(tx_lsns[0].1, 0);
    for window in tx_lsns.windows(2) {
        assert_eq!(window[1].1, window[0].0);
    }

    db.commit(&tx).unwrap();
    assert_eq!(tx.get_status(), TransactionStatus::Complete);
    assert!(db.recovery_manager().get_transaction_table().is_empty());
}

#[test]
fn test_commit_and_page_flush_honor_wal() {
    let db = new_database("wal_order");

    let tx = db.start_transaction();
    let part = db.alloc_part(&tx).unwrap();
    let pid = db.alloc_page(&tx, part).unwrap();
    db.page_write(&tx, pid, 0, &[9, 9, 9]).unwrap();

    let update_lsn = db
        .recovery_manager()
        .get_transaction_table()
        .get(&tx.get_id())
        .unwrap()
        .last_lsn;

    // flushing the page forces the log out at least through its LSN
    db.flush_all_pages().unwrap();
    assert!(db.mut_recovery_manager().get_log_manager().get_flushed_lsn() > update_lsn);

    // a flushed clean page leaves the dirty page table
    assert!(!db
        .recovery_manager()
        .get_dirty_page_table()
        .contains_key(&pid));

    // commit flushes through the commit record
    let commit_lsn = db.mut_recovery_manager().commit(tx.get_id()).unwrap();
    assert!(db.mut_recovery_manager().get_log_manager().get_flushed_lsn() > commit_lsn);
    db.mut_recovery_manager().end(tx.get_id()).unwrap();
}

#[test]
fn test_abort_rolls_back_with_clrs() {
    let db = new_database("abort_rollback");

    let setup_tx = db.start_transaction();
    let part = db.alloc_part(&setup_tx).unwrap();
    let pid = db.alloc_page(&setup_tx, part).unwrap();
    db.page_write(&setup_tx, pid, 0, &[1, 1, 1]).unwrap();
    db.commit(&setup_tx).unwrap();

    let tx = db.start_transaction();
    db.page_write(&tx, pid, 0, &[2, 2, 2]).unwrap();
    db.page_write(&tx, pid, 16, &[3, 3, 3]).unwrap();
    assert_eq!(db.page_read(pid, 0, 3).unwrap(), vec![2, 2, 2]);

    db.abort(&tx).unwrap();

    // both updates compensated, the committed bytes are back
    assert_eq!(db.page_read(pid, 0, 3).unwrap(), vec![1, 1, 1]);
    assert_eq!(db.page_read(pid, 16, 3).unwrap(), vec![0, 0, 0]);
    assert_eq!(tx.get_status(), TransactionStatus::Complete);

    let records = log_records(&db);
    let clrs = records
        .iter()
        .filter(|(_, r)| {
            matches!(r, LogRecord::UndoUpdatePage { txn_id, .. } if *txn_id == tx.get_id())
        })
        .count();
    assert_eq!(clrs, 2);

    // every CLR points its undo_next strictly before itself
    for (lsn, record) in &records {
        if let Some(undo_next) = record.get_undo_next_lsn() {
            assert!(undo_next < *lsn);
        }
    }
}

#[test]
fn test_savepoint_partial_rollback() {
    let db = new_database("savepoint");

    let tx = db.start_transaction();
    let part = db.alloc_part(&tx).unwrap();
    let pid = db.alloc_page(&tx, part).unwrap();

    db.page_write(&tx, pid, 0, &[1, 2, 3]).unwrap();
    db.mut_recovery_manager().savepoint(tx.get_id(), "before_edit");

    db.page_write(&tx, pid, 0, &[7, 8, 9]).unwrap();
    db.page_write(&tx, pid, 32, &[4, 4]).unwrap();
    assert_eq!(db.page_read(pid, 0, 3).unwrap(), vec![7, 8, 9]);

    db.mut_recovery_manager()
        .rollback_to_savepoint(tx.get_id(), "before_edit")
        .unwrap();

    // back to the savepoint, the first write survives
    assert_eq!(db.page_read(pid, 0, 3).unwrap(), vec![1, 2, 3]);
    assert_eq!(db.page_read(pid, 32, 2).unwrap(), vec![0, 0]);

    // the savepoint name can be reused; rolling back to it again is a
    // no-op now
    db.mut_recovery_manager().savepoint(tx.get_id(), "before_edit");
    db.mut_recovery_manager()
        .rollback_to_savepoint(tx.get_id(), "before_edit")
        .unwrap();
    assert_eq!(db.page_read(pid, 0, 3).unwrap(), vec![1, 2, 3]);

    db.commit(&tx).unwrap();
    assert_eq!(db.page_read(pid, 0, 3).unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_checkpoint_chunks_large_tables_and_moves_master() {
    let db = new_database("checkpoint_chunking");

    let before = master_lsn(&db);

    let tx = db.start_transaction();
    let part = db.alloc_part(&tx).unwrap();

    // dirty enough pages that one end-checkpoint record cannot hold
    // the whole dirty page table
    let mut pids: Vec<PageID> = Vec::new();
    for _ in 0..300 {
        let pid = db.alloc_page(&tx, part).unwrap();
        db.page_write(&tx, pid, 0, &[1]).unwrap();
        pids.push(pid);
    }

    db.checkpoint().unwrap();

    let after = master_lsn(&db);
    assert!(after > before);

    // scanning from the master: one begin, then at least two end
    // records carrying the split tables
    let records = db.mut_recovery_manager().get_log_manager().scan_from(after);
    assert!(matches!(records[0].1, LogRecord::BeginCheckpoint));

    let mut dpt_total = 0;
    let mut end_records = 0;
    for (_, record) in &records {
        if let LogRecord::EndCheckpoint { dpt, .. } = record {
            end_records += 1;
            dpt_total += dpt.len();
        }
    }
    assert!(end_records >= 2, "expected a chunked checkpoint");
    assert_eq!(dpt_total, 300);

    db.commit(&tx).unwrap();
}

#[test]
fn test_restart_recovers_committed_and_aborts_running() {
    let db = new_database("restart");

    // T1 allocates everything, writes P1 and reaches its commit
    // record; T2 writes P2 and is still running at the crash
    let t1 = db.start_transaction();
    let t2 = db.start_transaction();

    let part = db.alloc_part(&t1).unwrap();
    let p1 = db.alloc_page(&t1, part).unwrap();
    let p2 = db.alloc_page(&t1, part).unwrap();

    db.page_write(&t1, p1, 0, &[1, 2, 3]).unwrap();
    db.page_write(&t2, p2, 0, &[4, 5, 6]).unwrap();

    db.mut_recovery_manager().commit(t1.get_id()).unwrap();
    db.checkpoint().unwrap();

    let master_before = master_lsn(&db);
    db.crash();
    db.restart().unwrap();

    // T1's committed write is back, T2's is compensated away
    assert_eq!(db.page_read(p1, 0, 3).unwrap(), vec![1, 2, 3]);
    assert_eq!(db.page_read(p2, 0, 3).unwrap(), vec![0, 0, 0]);

    // no transaction survives restart
    assert!(db.recovery_manager().get_transaction_table().is_empty());

    // the tail of the log tells the story: an abort and a CLR for T2,
    // then both transactions end
    let records = log_records(&db);
    let t2_aborted = records.iter().any(|(_, r)| {
        matches!(r, LogRecord::AbortTransaction { txn_id, .. } if *txn_id == t2.get_id())
    });
    let t2_compensated = records.iter().any(|(_, r)| {
        matches!(r, LogRecord::UndoUpdatePage { txn_id, .. } if *txn_id == t2.get_id())
    });
    let t1_ended = records.iter().any(|(_, r)| {
        matches!(r, LogRecord::EndTransaction { txn_id, .. } if *txn_id == t1.get_id())
    });
    let t2_ended = records.iter().any(|(_, r)| {
        matches!(r, LogRecord::EndTransaction { txn_id, .. } if *txn_id == t2.get_id())
    });
    assert!(t2_aborted && t2_compensated && t1_ended && t2_ended);

    // restart finished with a fresh checkpoint
    assert!(master_lsn(&db) > master_before);

    // the dirty page table holds exactly the pages still dirty in the
    // buffer pool
    let mut dirty = std::collections::HashSet::new();
    db.buffer_pool().iter_pages(|pid, is_dirty| {
        if is_dirty {
            dirty.insert(pid);
        }
    });
    let recovery = db.recovery_manager();
    for (pid, _) in recovery.get_dirty_page_table() {
        assert!(dirty.contains(pid));
    }
}

#[test]
fn test_restart_skips_redo_for_flushed_pages() {
    let db = new_database("redo_skip");

    let tx = db.start_transaction();
    let part = db.alloc_part(&tx).unwrap();
    let pid = db.alloc_page(&tx, part).unwrap();
    db.page_write(&tx, pid, 0, &[7, 8, 9]).unwrap();
    db.flush_all_pages().unwrap();
    db.commit(&tx).unwrap();

    db.crash();
    db.restart().unwrap();

    assert_eq!(db.page_read(pid, 0, 3).unwrap(), vec![7, 8, 9]);

    // the update was already on disk, so nothing went dirty again
    assert!(db.recovery_manager().get_dirty_page_table().is_empty());
}

#[test]
fn test_repeated_crashes_converge() {
    let db = new_database("double_crash");

    let t1 = db.start_transaction();
    let part = db.alloc_part(&t1).unwrap();
    let pid = db.alloc_page(&t1, part).unwrap();
    db.page_write(&t1, pid, 0, &[1, 1]).unwrap();
    db.commit(&t1).unwrap();

    let t2 = db.start_transaction();
    db.page_write(&t2, pid, 0, &[2, 2]).unwrap();

    db.crash();
    db.restart().unwrap();

    // crash again right after recovery, before anything new happens
    db.crash();
    db.restart().unwrap();

    assert_eq!(db.page_read(pid, 0, 2).unwrap(), vec![1, 1]);
    assert!(db.recovery_manager().get_transaction_table().is_empty());
}

#[test]
fn test_log_lsns_strictly_increase_along_chains() {
    let db = new_database("lsn_chains");

    let tx = db.start_transaction();
    let part = db.alloc_part(&tx).unwrap();
    let pid = db.alloc_page(&tx, part).unwrap();
    db.page_write(&tx, pid, 0, &[5]).unwrap();
    db.abort(&tx).unwrap();
    db.checkpoint().unwrap();

    for (lsn, record) in log_records(&db) {
        if let Some(prev) = record.get_prev_lsn() {
            assert!(prev < lsn, "prev_lsn {} not before {}", prev, lsn);
        }
        if let Some(undo_next) = record.get_undo_next_lsn() {
            assert!(undo_next < lsn);
        }
    }
}

#[test]
fn test_oversized_page_write_splits_into_half_page_records() {
    let db = new_database("split_write");

    let tx = db.start_transaction();
    let part = db.alloc_part(&tx).unwrap();
    let pid = db.alloc_page(&tx, part).unwrap();

    // a full-page write cannot fit its two images in one record
    let bytes = vec![0xAB; EFFECTIVE_PAGE_SIZE];
    db.page_write(&tx, pid, 0, &bytes).unwrap();

    let updates = log_records(&db)
        .iter()
        .filter(|(_, r)| matches!(r, LogRecord::UpdatePage { .. }))
        .count();
    assert_eq!(updates, 2);

    for (_, record) in log_records(&db) {
        if let LogRecord::UpdatePage { before, after, .. } = record {
            assert!(before.len() <= EFFECTIVE_PAGE_SIZE / 2);
            assert_eq!(before.len(), after.len());
        }
    }

    db.commit(&tx).unwrap();
    assert_eq!(
        db.page_read(pid, 0, EFFECTIVE_PAGE_SIZE).unwrap(),
        vec![0xAB; EFFECTIVE_PAGE_SIZE]
    );
}
