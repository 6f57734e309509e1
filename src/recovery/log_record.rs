use core::fmt;
use std::sync::Arc;

use crate::{
    io::{read_into, ByteWriter, Decodeable, Encodeable},
    storage::{
        buffer_pool::{BufferPool, EFFECTIVE_PAGE_SIZE},
        disk_manager::{DiskManager, PageID},
    },
    transaction::{TransactionID, TransactionStatus},
    types::Pod,
    utils::HandyRwLock,
};

/// Everything the write-ahead log knows how to carry.
///
/// The LSN is not part of the record; it is the record's byte position
/// in the log, assigned on append. `prev_lsn` chains a transaction's
/// records backwards, terminating at 0 (the master slot, which no
/// transaction record can occupy). The `Undo*` variants are
/// compensation records: redo-only, carrying `undo_next_lsn` so a
/// re-crash skips work that is already undone.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Lives only in the fixed slot at position 0 and points at the
    /// last begin-checkpoint.
    Master { last_checkpoint_lsn: u64 },

    AllocPage {
        txn_id: TransactionID,
        prev_lsn: u64,
        page_id: PageID,
    },
    UpdatePage {
        txn_id: TransactionID,
        prev_lsn: u64,
        page_id: PageID,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    FreePage {
        txn_id: TransactionID,
        prev_lsn: u64,
        page_id: PageID,
    },
    AllocPart {
        txn_id: TransactionID,
        prev_lsn: u64,
        part_num: u32,
    },
    FreePart {
        txn_id: TransactionID,
        prev_lsn: u64,
        part_num: u32,
    },

    CommitTransaction {
        txn_id: TransactionID,
        prev_lsn: u64,
    },
    AbortTransaction {
        txn_id: TransactionID,
        prev_lsn: u64,
    },
    EndTransaction {
        txn_id: TransactionID,
        prev_lsn: u64,
    },

    BeginCheckpoint,
    EndCheckpoint {
        dpt: Vec<(PageID, u64)>,
        txn_table: Vec<(TransactionID, TransactionStatus, u64)>,
    },

    UndoAllocPage {
        txn_id: TransactionID,
        prev_lsn: u64,
        undo_next_lsn: u64,
        page_id: PageID,
    },
    UndoUpdatePage {
        txn_id: TransactionID,
        prev_lsn: u64,
        undo_next_lsn: u64,
        page_id: PageID,
        offset: u16,
        after: Vec<u8>,
    },
    UndoFreePage {
        txn_id: TransactionID,
        prev_lsn: u64,
        undo_next_lsn: u64,
        page_id: PageID,
    },
    UndoAllocPart {
        txn_id: TransactionID,
        prev_lsn: u64,
        undo_next_lsn: u64,
        part_num: u32,
    },
    UndoFreePart {
        txn_id: TransactionID,
        prev_lsn: u64,
        undo_next_lsn: u64,
        part_num: u32,
    },
}

// wire tags
const TAG_MASTER: u8 = 0;
const TAG_ALLOC_PAGE: u8 = 1;
const TAG_UPDATE_PAGE: u8 = 2;
const TAG_FREE_PAGE: u8 = 3;
const TAG_ALLOC_PART: u8 = 4;
const TAG_FREE_PART: u8 = 5;
const TAG_COMMIT: u8 = 6;
const TAG_ABORT: u8 = 7;
const TAG_END: u8 = 8;
const TAG_BEGIN_CHECKPOINT: u8 = 9;
const TAG_END_CHECKPOINT: u8 = 10;
const TAG_UNDO_ALLOC_PAGE: u8 = 11;
const TAG_UNDO_UPDATE_PAGE: u8 = 12;
const TAG_UNDO_FREE_PAGE: u8 = 13;
const TAG_UNDO_ALLOC_PART: u8 = 14;
const TAG_UNDO_FREE_PART: u8 = 15;

fn status_to_u8(status: TransactionStatus) -> u8 {
    match status {
        TransactionStatus::Running => 0,
        TransactionStatus::Committing => 1,
        TransactionStatus::Aborting => 2,
        TransactionStatus::RecoveryAborting => 3,
        TransactionStatus::Complete => 4,
    }
}

fn status_from_u8(value: u8) -> TransactionStatus {
    match value {
        0 => TransactionStatus::Running,
        1 => TransactionStatus::Committing,
        2 => TransactionStatus::Aborting,
        3 => TransactionStatus::RecoveryAborting,
        4 => TransactionStatus::Complete,
        _ => panic!("invalid transaction status: {}", value),
    }
}

impl LogRecord {
    pub fn get_txn_id(&self) -> Option<TransactionID> {
        use LogRecord::*;
        match self {
            AllocPage { txn_id, .. }
            | UpdatePage { txn_id, .. }
            | FreePage { txn_id, .. }
            | AllocPart { txn_id, .. }
            | FreePart { txn_id, .. }
            | CommitTransaction { txn_id, .. }
            | AbortTransaction { txn_id, .. }
            | EndTransaction { txn_id, .. }
            | UndoAllocPage { txn_id, .. }
            | UndoUpdatePage { txn_id, .. }
            | UndoFreePage { txn_id, .. }
            | UndoAllocPart { txn_id, .. }
            | UndoFreePart { txn_id, .. } => Some(*txn_id),
            _ => None,
        }
    }

    pub fn get_prev_lsn(&self) -> Option<u64> {
        use LogRecord::*;
        match self {
            AllocPage { prev_lsn, .. }
            | UpdatePage { prev_lsn, .. }
            | FreePage { prev_lsn, .. }
            | AllocPart { prev_lsn, .. }
            | FreePart { prev_lsn, .. }
            | CommitTransaction { prev_lsn, .. }
            | AbortTransaction { prev_lsn, .. }
            | EndTransaction { prev_lsn, .. }
            | UndoAllocPage { prev_lsn, .. }
            | UndoUpdatePage { prev_lsn, .. }
            | UndoFreePage { prev_lsn, .. }
            | UndoAllocPart { prev_lsn, .. }
            | UndoFreePart { prev_lsn, .. } => Some(*prev_lsn),
            _ => None,
        }
    }

    pub fn get_undo_next_lsn(&self) -> Option<u64> {
        use LogRecord::*;
        match self {
            UndoAllocPage { undo_next_lsn, .. }
            | UndoUpdatePage { undo_next_lsn, .. }
            | UndoFreePage { undo_next_lsn, .. }
            | UndoAllocPart { undo_next_lsn, .. }
            | UndoFreePart { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    pub fn get_page_id(&self) -> Option<PageID> {
        use LogRecord::*;
        match self {
            AllocPage { page_id, .. }
            | UpdatePage { page_id, .. }
            | FreePage { page_id, .. }
            | UndoAllocPage { page_id, .. }
            | UndoUpdatePage { page_id, .. }
            | UndoFreePage { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    pub fn get_part_num(&self) -> Option<u32> {
        use LogRecord::*;
        match self {
            AllocPart { part_num, .. }
            | FreePart { part_num, .. }
            | UndoAllocPart { part_num, .. }
            | UndoFreePart { part_num, .. } => Some(*part_num),
            _ => None,
        }
    }

    /// Can this record's effect be rolled back?
    pub fn is_undoable(&self) -> bool {
        use LogRecord::*;
        matches!(
            self,
            AllocPage { .. }
                | UpdatePage { .. }
                | FreePage { .. }
                | AllocPart { .. }
                | FreePart { .. }
        )
    }

    /// Does this record carry a physical effect worth replaying?
    pub fn is_redoable(&self) -> bool {
        use LogRecord::*;
        matches!(
            self,
            AllocPage { .. }
                | UpdatePage { .. }
                | FreePage { .. }
                | AllocPart { .. }
                | FreePart { .. }
                | UndoAllocPage { .. }
                | UndoUpdatePage { .. }
                | UndoFreePage { .. }
                | UndoAllocPart { .. }
                | UndoFreePart { .. }
        )
    }

    /// Does redoing this record need the dirty page table check, as
    /// opposed to the allocation-style records that replay
    /// unconditionally?
    pub fn is_page_modifying(&self) -> bool {
        use LogRecord::*;
        matches!(
            self,
            UpdatePage { .. } | UndoUpdatePage { .. } | FreePage { .. } | UndoAllocPage { .. }
        )
    }

    /// Build the compensation record that undoes this one.
    ///
    /// `prev_lsn` is the writing transaction's current last LSN; the
    /// CLR's `undo_next_lsn` is this record's own `prev_lsn`, so a
    /// re-crash resumes the rollback right after it.
    pub fn undo(&self, prev_lsn: u64) -> LogRecord {
        use LogRecord::*;
        match self {
            UpdatePage {
                txn_id,
                prev_lsn: own_prev,
                page_id,
                offset,
                before,
                ..
            } => UndoUpdatePage {
                txn_id: *txn_id,
                prev_lsn,
                undo_next_lsn: *own_prev,
                page_id: *page_id,
                offset: *offset,
                after: before.clone(),
            },
            AllocPage {
                txn_id,
                prev_lsn: own_prev,
                page_id,
            } => UndoAllocPage {
                txn_id: *txn_id,
                prev_lsn,
                undo_next_lsn: *own_prev,
                page_id: *page_id,
            },
            FreePage {
                txn_id,
                prev_lsn: own_prev,
                page_id,
            } => UndoFreePage {
                txn_id: *txn_id,
                prev_lsn,
                undo_next_lsn: *own_prev,
                page_id: *page_id,
            },
            AllocPart {
                txn_id,
                prev_lsn: own_prev,
                part_num,
            } => UndoAllocPart {
                txn_id: *txn_id,
                prev_lsn,
                undo_next_lsn: *own_prev,
                part_num: *part_num,
            },
            FreePart {
                txn_id,
                prev_lsn: own_prev,
                part_num,
            } => UndoFreePart {
                txn_id: *txn_id,
                prev_lsn,
                undo_next_lsn: *own_prev,
                part_num: *part_num,
            },
            _ => panic!("cannot undo {}", self),
        }
    }

    /// Apply this record's physical effect. `lsn` is the record's own
    /// LSN and becomes the page LSN of any page it touches.
    ///
    /// Replay is tolerant of effects that are already present on disk
    /// (a freed page that is already gone, an allocation that already
    /// exists): recovery may visit the same record more than once
    /// across repeated crashes.
    pub fn redo(&self, lsn: u64, disk: &Arc<DiskManager>, buffer: &Pod<BufferPool>) {
        use LogRecord::*;
        match self {
            UpdatePage {
                page_id,
                offset,
                after,
                ..
            }
            | UndoUpdatePage {
                page_id,
                offset,
                after,
                ..
            } => {
                let page_pod = buffer
                    .wl()
                    .fetch_page(*page_id)
                    .unwrap_or_else(|e| panic!("redo failed on page {:#x}: {}", page_id, e));
                {
                    let mut page = page_pod.wl();
                    page.write_bytes(*offset as usize, after);
                    page.set_page_lsn(lsn);
                }
                page_pod.wl().unpin(true);
            }
            AllocPage { page_id, .. } | UndoFreePage { page_id, .. } => {
                if !disk.is_page_allocated(*page_id) {
                    disk.alloc_page_with(*page_id)
                        .unwrap_or_else(|e| panic!("redo failed: {}", e));
                }
                let page_pod = buffer
                    .wl()
                    .fetch_page(*page_id)
                    .unwrap_or_else(|e| panic!("redo failed on page {:#x}: {}", page_id, e));
                page_pod.wl().set_page_lsn(lsn);
                page_pod.wl().unpin(true);
            }
            FreePage { page_id, .. } | UndoAllocPage { page_id, .. } => {
                buffer.wl().discard_page(*page_id);
                if disk.is_page_allocated(*page_id) {
                    disk.free_page(*page_id)
                        .unwrap_or_else(|e| panic!("redo failed: {}", e));
                }
            }
            AllocPart { part_num, .. } | UndoFreePart { part_num, .. } => {
                if !disk.is_part_allocated(*part_num) {
                    disk.alloc_part_with(*part_num)
                        .unwrap_or_else(|e| panic!("redo failed: {}", e));
                }
            }
            FreePart { part_num, .. } | UndoAllocPart { part_num, .. } => {
                if disk.is_part_allocated(*part_num) {
                    disk.free_part(*part_num)
                        .unwrap_or_else(|e| panic!("redo failed: {}", e));
                }
            }
            _ => panic!("cannot redo {}", self),
        }
    }

    /// Would an end-checkpoint record with this many dirty page and
    /// transaction table entries still fit in one page?
    pub fn checkpoint_fits(num_dpt: usize, num_txn: usize) -> bool {
        // tag + two counts, 16 bytes per dpt entry, 17 per txn entry
        let size = 1 + 4 + 4 + 16 * num_dpt + 17 * num_txn;
        size <= EFFECTIVE_PAGE_SIZE
    }
}

impl Encodeable for LogRecord {
    fn encode(&self) -> Vec<u8> {
        use LogRecord::*;
        let mut w = ByteWriter::new();
        match self {
            Master { last_checkpoint_lsn } => {
                w.write(&TAG_MASTER);
                w.write(last_checkpoint_lsn);
            }
            AllocPage {
                txn_id,
                prev_lsn,
                page_id,
            } => {
                w.write(&TAG_ALLOC_PAGE);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(page_id);
            }
            UpdatePage {
                txn_id,
                prev_lsn,
                page_id,
                offset,
                before,
                after,
            } => {
                w.write(&TAG_UPDATE_PAGE);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(page_id);
                w.write(offset);
                w.write(before);
                w.write(after);
            }
            FreePage {
                txn_id,
                prev_lsn,
                page_id,
            } => {
                w.write(&TAG_FREE_PAGE);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(page_id);
            }
            AllocPart {
                txn_id,
                prev_lsn,
                part_num,
            } => {
                w.write(&TAG_ALLOC_PART);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(part_num);
            }
            FreePart {
                txn_id,
                prev_lsn,
                part_num,
            } => {
                w.write(&TAG_FREE_PART);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(part_num);
            }
            CommitTransaction { txn_id, prev_lsn } => {
                w.write(&TAG_COMMIT);
                w.write(txn_id);
                w.write(prev_lsn);
            }
            AbortTransaction { txn_id, prev_lsn } => {
                w.write(&TAG_ABORT);
                w.write(txn_id);
                w.write(prev_lsn);
            }
            EndTransaction { txn_id, prev_lsn } => {
                w.write(&TAG_END);
                w.write(txn_id);
                w.write(prev_lsn);
            }
            BeginCheckpoint => {
                w.write(&TAG_BEGIN_CHECKPOINT);
            }
            EndCheckpoint { dpt, txn_table } => {
                w.write(&TAG_END_CHECKPOINT);
                w.write(&(dpt.len() as u32));
                w.write(&(txn_table.len() as u32));
                for (page_id, rec_lsn) in dpt {
                    w.write(page_id);
                    w.write(rec_lsn);
                }
                for (txn_id, status, last_lsn) in txn_table {
                    w.write(txn_id);
                    w.write(&status_to_u8(*status));
                    w.write(last_lsn);
                }
            }
            UndoAllocPage {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                page_id,
            } => {
                w.write(&TAG_UNDO_ALLOC_PAGE);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(undo_next_lsn);
                w.write(page_id);
            }
            UndoUpdatePage {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                page_id,
                offset,
                after,
            } => {
                w.write(&TAG_UNDO_UPDATE_PAGE);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(undo_next_lsn);
                w.write(page_id);
                w.write(offset);
                w.write(after);
            }
            UndoFreePage {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                page_id,
            } => {
                w.write(&TAG_UNDO_FREE_PAGE);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(undo_next_lsn);
                w.write(page_id);
            }
            UndoAllocPart {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                part_num,
            } => {
                w.write(&TAG_UNDO_ALLOC_PART);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(undo_next_lsn);
                w.write(part_num);
            }
            UndoFreePart {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                part_num,
            } => {
                w.write(&TAG_UNDO_FREE_PART);
                w.write(txn_id);
                w.write(prev_lsn);
                w.write(undo_next_lsn);
                w.write(part_num);
            }
        }
        w.to_bytes()
    }
}

impl Decodeable for LogRecord {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        use LogRecord::*;
        let tag: u8 = read_into(reader);
        match tag {
            TAG_MASTER => Master {
                last_checkpoint_lsn: read_into(reader),
            },
            TAG_ALLOC_PAGE => AllocPage {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                page_id: read_into(reader),
            },
            TAG_UPDATE_PAGE => UpdatePage {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                page_id: read_into(reader),
                offset: read_into(reader),
                before: read_into(reader),
                after: read_into(reader),
            },
            TAG_FREE_PAGE => FreePage {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                page_id: read_into(reader),
            },
            TAG_ALLOC_PART => AllocPart {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                part_num: read_into(reader),
            },
            TAG_FREE_PART => FreePart {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                part_num: read_into(reader),
            },
            TAG_COMMIT => CommitTransaction {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
            },
            TAG_ABORT => AbortTransaction {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
            },
            TAG_END => EndTransaction {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
            },
            TAG_BEGIN_CHECKPOINT => BeginCheckpoint,
            TAG_END_CHECKPOINT => {
                let dpt_count: u32 = read_into(reader);
                let txn_count: u32 = read_into(reader);
                let mut dpt = Vec::with_capacity(dpt_count as usize);
                for _ in 0..dpt_count {
                    let page_id: u64 = read_into(reader);
                    let rec_lsn: u64 = read_into(reader);
                    dpt.push((page_id, rec_lsn));
                }
                let mut txn_table = Vec::with_capacity(txn_count as usize);
                for _ in 0..txn_count {
                    let txn_id: u64 = read_into(reader);
                    let status: u8 = read_into(reader);
                    let last_lsn: u64 = read_into(reader);
                    txn_table.push((txn_id, status_from_u8(status), last_lsn));
                }
                EndCheckpoint { dpt, txn_table }
            }
            TAG_UNDO_ALLOC_PAGE => UndoAllocPage {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                undo_next_lsn: read_into(reader),
                page_id: read_into(reader),
            },
            TAG_UNDO_UPDATE_PAGE => UndoUpdatePage {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                undo_next_lsn: read_into(reader),
                page_id: read_into(reader),
                offset: read_into(reader),
                after: read_into(reader),
            },
            TAG_UNDO_FREE_PAGE => UndoFreePage {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                undo_next_lsn: read_into(reader),
                page_id: read_into(reader),
            },
            TAG_UNDO_ALLOC_PART => UndoAllocPart {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                undo_next_lsn: read_into(reader),
                part_num: read_into(reader),
            },
            TAG_UNDO_FREE_PART => UndoFreePart {
                txn_id: read_into(reader),
                prev_lsn: read_into(reader),
                undo_next_lsn: read_into(reader),
                part_num: read_into(reader),
            },
            _ => panic!("corrupted log: invalid record tag {}", tag),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use LogRecord::*;
        match self {
            Master { last_checkpoint_lsn } => {
                write!(f, "MASTER(checkpoint: {})", last_checkpoint_lsn)
            }
            AllocPage {
                txn_id, page_id, ..
            } => write!(f, "ALLOC_PAGE(tx_{}, page {:#x})", txn_id, page_id),
            UpdatePage {
                txn_id,
                page_id,
                offset,
                before,
                after,
                ..
            } => write!(
                f,
                "UPDATE_PAGE(tx_{}, page {:#x}, offset {}, {} -> {})",
                txn_id,
                page_id,
                offset,
                hex::encode(before),
                hex::encode(after)
            ),
            FreePage {
                txn_id, page_id, ..
            } => write!(f, "FREE_PAGE(tx_{}, page {:#x})", txn_id, page_id),
            AllocPart {
                txn_id, part_num, ..
            } => write!(f, "ALLOC_PART(tx_{}, partition {})", txn_id, part_num),
            FreePart {
                txn_id, part_num, ..
            } => write!(f, "FREE_PART(tx_{}, partition {})", txn_id, part_num),
            CommitTransaction { txn_id, .. } => write!(f, "COMMIT(tx_{})", txn_id),
            AbortTransaction { txn_id, .. } => write!(f, "ABORT(tx_{})", txn_id),
            EndTransaction { txn_id, .. } => write!(f, "END(tx_{})", txn_id),
            BeginCheckpoint => write!(f, "BEGIN_CHECKPOINT"),
            EndCheckpoint { dpt, txn_table } => write!(
                f,
                "END_CHECKPOINT({} dirty pages, {} transactions)",
                dpt.len(),
                txn_table.len()
            ),
            UndoAllocPage {
                txn_id,
                page_id,
                undo_next_lsn,
                ..
            } => write!(
                f,
                "UNDO_ALLOC_PAGE(tx_{}, page {:#x}, undo next {})",
                txn_id, page_id, undo_next_lsn
            ),
            UndoUpdatePage {
                txn_id,
                page_id,
                offset,
                after,
                undo_next_lsn,
                ..
            } => write!(
                f,
                "UNDO_UPDATE_PAGE(tx_{}, page {:#x}, offset {}, restore {}, undo next {})",
                txn_id,
                page_id,
                offset,
                hex::encode(after),
                undo_next_lsn
            ),
            UndoFreePage {
                txn_id,
                page_id,
                undo_next_lsn,
                ..
            } => write!(
                f,
                "UNDO_FREE_PAGE(tx_{}, page {:#x}, undo next {})",
                txn_id, page_id, undo_next_lsn
            ),
            UndoAllocPart {
                txn_id,
                part_num,
                undo_next_lsn,
                ..
            } => write!(
                f,
                "UNDO_ALLOC_PART(tx_{}, partition {}, undo next {})",
                txn_id, part_num, undo_next_lsn
            ),
            UndoFreePart {
                txn_id,
                part_num,
                undo_next_lsn,
                ..
            } => write!(
                f,
                "UNDO_FREE_PART(tx_{}, partition {}, undo next {})",
                txn_id, part_num, undo_next_lsn
            ),
        }
    }
}
