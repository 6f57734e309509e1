use std::io::SeekFrom;
use std::path::Path;

use log::debug;

use crate::{
    io::DbFile,
    recovery::log_record::LogRecord,
    types::DbResult,
};

/// The master slot is a `MASTER` record pinned at position 0: one tag
/// byte plus the 8-byte LSN of the last begin-checkpoint. Real records
/// start right after it.
pub const FIRST_RECORD_LSN: u64 = 9;

/// The append-only write-ahead log.
///
/// An LSN is the byte offset of a record in the log file, so LSNs are
/// totally ordered, monotonically increasing, and 0 (the master slot)
/// doubles as the null LSN terminating every prev-chain.
pub struct LogManager {
    file: DbFile,
    next_lsn: u64,
    /// Everything below this LSN is durable.
    flushed_lsn: u64,
}

impl LogManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let mut file = DbFile::new(path);

        let mut size = file.get_size().unwrap();
        if size == 0 {
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write(&LogRecord::Master {
                last_checkpoint_lsn: 0,
            })
            .unwrap();
            file.flush().unwrap();
            size = file.get_size().unwrap();
        }

        Self {
            file,
            next_lsn: size,
            flushed_lsn: size,
        }
    }

    /// Append a record, returning its LSN.
    pub fn append(&mut self, record: LogRecord) -> u64 {
        let lsn = self.next_lsn;
        self.file.seek(SeekFrom::Start(lsn)).unwrap();
        self.file.write(&record).unwrap();
        self.next_lsn = self.file.get_current_position().unwrap();

        debug!("lsn {}: {}", lsn, record);
        lsn
    }

    /// Make the log durable at least through `lsn`.
    pub fn flush_to(&mut self, lsn: u64) -> DbResult {
        if lsn < self.flushed_lsn {
            return Ok(());
        }
        self.file.flush()?;
        self.flushed_lsn = self.next_lsn;
        debug!("log flushed through lsn {}", self.flushed_lsn);
        Ok(())
    }

    /// Make everything appended so far durable.
    pub fn flush_all(&mut self) -> DbResult {
        let end = self.next_lsn;
        self.flush_to(end)
    }

    pub fn get_flushed_lsn(&self) -> u64 {
        self.flushed_lsn
    }

    pub fn get_next_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Read the record at `lsn`. A dangling LSN means the log (or a
    /// record chain in it) is corrupted, which is not recoverable.
    pub fn fetch(&mut self, lsn: u64) -> LogRecord {
        if lsn >= self.next_lsn {
            panic!("corrupted log: lsn {} is past the end of the log", lsn);
        }
        self.file.seek(SeekFrom::Start(lsn)).unwrap();
        self.file.read::<LogRecord>().unwrap()
    }

    /// The LSN the master record points at, 0 when no checkpoint has
    /// been taken yet.
    pub fn get_master_lsn(&mut self) -> u64 {
        self.file.seek(SeekFrom::Start(0)).unwrap();
        match self.file.read::<LogRecord>() {
            Ok(LogRecord::Master { last_checkpoint_lsn }) => last_checkpoint_lsn,
            _ => panic!("corrupted log: missing master record"),
        }
    }

    /// Point the master record at the begin-checkpoint at `lsn`.
    /// Rewritten in place, durably.
    pub fn rewrite_master(&mut self, lsn: u64) -> DbResult {
        self.file.seek(SeekFrom::Start(0)).unwrap();
        self.file.write(&LogRecord::Master {
            last_checkpoint_lsn: lsn,
        })?;
        self.file.flush()?;
        Ok(())
    }

    /// All records from `lsn` (or the first record, if `lsn` is 0) to
    /// the end of the log, paired with their LSNs.
    pub fn scan_from(&mut self, lsn: u64) -> Vec<(u64, LogRecord)> {
        let start = if lsn == 0 { FIRST_RECORD_LSN } else { lsn };

        let mut records = Vec::new();
        let mut pos = start;
        self.file.seek(SeekFrom::Start(start)).unwrap();
        while pos < self.next_lsn {
            let record = self.file.read::<LogRecord>().unwrap();
            let next = self.file.get_current_position().unwrap();
            records.push((pos, record));
            pos = next;
        }
        records
    }

    /// Render the whole log for debugging.
    pub fn show_log_contents(&mut self) {
        let mut depiction = String::new();

        let master = self.get_master_lsn();
        if master != 0 {
            depiction.push_str(&format!("├── [master] last checkpoint: {}\n", master));
        } else {
            depiction.push_str("├── [master] no checkpoint\n");
        }

        for (lsn, record) in self.scan_from(FIRST_RECORD_LSN) {
            depiction.push_str(&format!("├── [lsn {}] {}\n", lsn, record));
        }

        debug!("log contents:\n{}", depiction);
    }
}
