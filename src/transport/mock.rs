//! Scripted transport for session tests

use super::{Transport, TransportError};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub enum MockRead {
    Report(Vec<u8>),
    Fail,
}

#[derive(Debug, Clone)]
pub struct Written {
    pub report: Vec<u8>,
    pub at: Instant,
}

#[derive(Default)]
struct Shared {
    writes: Mutex<Vec<Written>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    cancels: AtomicUsize,
}

pub struct MockTransport {
    reads: Receiver<MockRead>,
    write_events: Sender<Written>,
    shared: Arc<Shared>,
}

/// Test-side end of a [`MockTransport`]
#[derive(Clone)]
pub struct MockHandle {
    reads: Sender<MockRead>,
    write_events: Receiver<Written>,
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let (read_tx, read_rx) = crossbeam_channel::unbounded();
        let (write_tx, write_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::default());

        let transport = Self {
            reads: read_rx,
            write_events: write_tx,
            shared: Arc::clone(&shared),
        };
        let handle = MockHandle {
            reads: read_tx,
            write_events: write_rx,
            shared,
        };
        (transport, handle)
    }
}

impl MockHandle {
    pub fn push_report(&self, report: &[u8]) {
        let _ = self.reads.send(MockRead::Report(report.to_vec()));
    }

    pub fn push_failure(&self) {
        let _ = self.reads.send(MockRead::Fail);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared
            .writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|w| w.report.clone())
            .collect()
    }

    /// Wait for the next write not yet consumed by this handle
    pub fn next_write(&self, timeout: Duration) -> Option<Written> {
        self.write_events.recv_timeout(timeout).ok()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.shared.cancels.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.reads.recv_timeout(timeout) {
            Ok(MockRead::Report(report)) => {
                let len = report.len().min(buf.len());
                buf[..len].copy_from_slice(&report[..len]);
                Ok(len)
            }
            Ok(MockRead::Fail) => Err(TransportError::Io("scripted failure".to_string())),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(0),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(TransportError::Disconnected)
            }
        }
    }

    fn write_output(&self, report: &[u8]) -> Result<usize, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("scripted write failure".to_string()));
        }
        let written = Written {
            report: report.to_vec(),
            at: Instant::now(),
        };
        self.shared
            .writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(written.clone());
        let _ = self.write_events.send(written);
        Ok(report.len())
    }

    fn cancel_pending_read(&self) {
        self.shared.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}
