mod hid;
#[cfg(test)]
pub mod mock;

pub use hid::HidTransport;

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("HID I/O error: {0}")]
    Io(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Device handle already closed")]
    Closed,
}

/// Raw report I/O for one opened controller.
///
/// The session calls `read_input` only from its input thread and
/// `write_output` only from its output thread (and once during startup), so
/// implementations must tolerate both running at the same time.
pub trait Transport: Send + Sync {
    /// Read one input report into `buf`. `Ok(0)` means the timeout elapsed
    /// without data.
    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write one output report, returning the number of bytes written
    fn write_output(&self, report: &[u8]) -> Result<usize, TransportError>;

    /// Abort a blocking read so the input loop notices a stop request early
    fn cancel_pending_read(&self);

    /// Release the device handle. Further calls fail with `Closed`.
    fn close(&self);
}
