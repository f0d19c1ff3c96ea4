//! Streamed scan and query results

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;

use super::record::Record;
use crate::utils::{Error, ErrorKind, Result};

/// How long a producer waits on a full queue before rechecking for cancel
const SEND_POLL: Duration = Duration::from_millis(100);

/// Which terminated error a cancelled producer reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Scan,
    Query,
}

impl StreamKind {
    pub fn terminated(&self) -> Error {
        match self {
            StreamKind::Scan => ErrorKind::ScanTerminated.into(),
            StreamKind::Query => ErrorKind::QueryTerminated.into(),
        }
    }
}

/// Producer half of a [`Recordset`]
#[derive(Clone)]
pub struct RecordSender {
    tx: Sender<Result<Record>>,
    active: Arc<AtomicBool>,
    kind: StreamKind,
}

impl RecordSender {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Queue a record, waiting while the consumer catches up.
    ///
    /// Fails with the terminated error once the recordset is closed.
    pub fn send(&self, record: Record) -> Result<()> {
        self.deliver(Ok(record))
    }

    /// Queue a final error for the consumer.
    pub fn send_error(&self, error: Error) {
        let _ = self.deliver(Err(error));
    }

    fn deliver(&self, mut item: Result<Record>) -> Result<()> {
        loop {
            if !self.is_active() {
                return Err(self.kind.terminated());
            }
            match self.tx.send_timeout(item, SEND_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(self.kind.terminated()),
            }
        }
    }
}

/// Records of a scan or query, in arrival order
///
/// Iterating yields `Ok(record)` for each record and at most one `Err` for a
/// failure that ended the run. Dropping or closing the recordset cancels
/// the producers.
pub struct Recordset {
    rx: Receiver<Result<Record>>,
    active: Arc<AtomicBool>,
    task_id: u64,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl Recordset {
    /// A recordset and its producer half. The queue holds `capacity` records.
    pub fn new(capacity: usize, task_id: u64, kind: StreamKind) -> (Self, RecordSender) {
        let (tx, rx) = bounded(capacity.max(1));
        let active = Arc::new(AtomicBool::new(true));
        let sender = RecordSender {
            tx,
            active: Arc::clone(&active),
            kind,
        };
        let recordset = Self {
            rx,
            active,
            task_id,
            producer: Mutex::new(None),
        };
        (recordset, sender)
    }

    /// Attach the thread that feeds this recordset; it is joined on close.
    pub(crate) fn set_producer(&self, handle: JoinHandle<()>) {
        *self.producer.lock() = Some(handle);
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cancel the run and wait for the producers to stop.
    pub fn close(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        // unblock producers waiting on a full queue
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.producer.lock().take() {
            let _ = handle.join();
        }
    }

    /// Collect every record, stopping at the first error.
    pub fn collect_records(self) -> Result<Vec<Record>> {
        self.into_iter().collect()
    }
}

impl Iterator for Recordset {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.rx.recv().ok();
        if item.is_none() {
            self.active.store(false, Ordering::Release);
        }
        item
    }
}

impl Drop for Recordset {
    fn drop(&mut self) {
        self.close();
    }
}
