use super::{Transport, TransportError};
use hidapi::{HidApi, HidDevice};
use std::ffi::{CStr, CString};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const STADIA_VENDOR_ID: u16 = 0x18D1;
pub const STADIA_PRODUCT_ID: u16 = 0x9400;

/// Report-level access to one opened HID handle
pub trait ReportDevice: Send {
    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError>;
    fn write_report(&self, report: &[u8]) -> Result<usize, TransportError>;
}

impl ReportDevice for HidDevice {
    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
        self.read_timeout(buf, timeout_ms)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn write_report(&self, report: &[u8]) -> Result<usize, TransportError> {
        self.write(report)
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// hidapi-backed transport for one controller.
///
/// The path is opened twice so the output loop never waits behind a timed
/// read. hidapi has no way to abort a read from another thread, so the
/// input loop relies on the read timeout to notice stop requests.
pub struct HidTransport<D = HidDevice> {
    path: CString,
    reader: Mutex<Option<D>>,
    writer: Mutex<Option<D>>,
}

impl HidTransport {
    pub fn open(api: &HidApi, path: &CStr) -> anyhow::Result<Self> {
        let open = || {
            api.open_path(path)
                .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.to_string_lossy(), e))
        };
        let reader = open()?;
        let writer = open()?;

        log::info!("Opened HID device {}", path.to_string_lossy());

        Ok(Self::from_handles(path, reader, writer))
    }

    /// Paths of every attached Stadia controller
    pub fn enumerate(api: &mut HidApi) -> anyhow::Result<Vec<CString>> {
        api.refresh_devices()
            .map_err(|e| anyhow::anyhow!("Failed to refresh HID devices: {}", e))?;

        let mut paths: Vec<CString> = api
            .device_list()
            .filter(|info| {
                info.vendor_id() == STADIA_VENDOR_ID && info.product_id() == STADIA_PRODUCT_ID
            })
            .map(|info| info.path().to_owned())
            .collect();

        // Composite devices can list the same path once per interface
        paths.sort();
        paths.dedup();

        log::debug!("Enumerated {} controller(s)", paths.len());
        Ok(paths)
    }
}

impl<D: ReportDevice> HidTransport<D> {
    pub fn from_handles(path: &CStr, reader: D, writer: D) -> Self {
        Self {
            path: path.to_owned(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }
}

fn lock<D>(handle: &Mutex<Option<D>>) -> MutexGuard<'_, Option<D>> {
    handle.lock().unwrap_or_else(|e| e.into_inner())
}

impl<D: ReportDevice> Transport for HidTransport<D> {
    fn read_input(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let guard = lock(&self.reader);
        let device = guard.as_ref().ok_or(TransportError::Closed)?;

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        device.read_report(buf, timeout_ms)
    }

    fn write_output(&self, report: &[u8]) -> Result<usize, TransportError> {
        let guard = lock(&self.writer);
        let device = guard.as_ref().ok_or(TransportError::Closed)?;

        match device.write_report(report)? {
            0 => Err(TransportError::Disconnected),
            written => Ok(written),
        }
    }

    fn cancel_pending_read(&self) {
        log::trace!(
            "Read on {} ends with its timeout",
            self.path.to_string_lossy()
        );
    }

    fn close(&self) {
        // Writer first: it is never held for long
        let writer = lock(&self.writer).take();
        let reader = lock(&self.reader).take();
        if writer.is_some() || reader.is_some() {
            log::info!("Closed HID device {}", self.path.to_string_lossy());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    /// Reads block for the whole timeout, like an idle controller
    struct IdleDevice;

    impl ReportDevice for IdleDevice {
        fn read_report(&self, _buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
            thread::sleep(Duration::from_millis(timeout_ms as u64));
            Ok(0)
        }

        fn write_report(&self, report: &[u8]) -> Result<usize, TransportError> {
            Ok(report.len())
        }
    }

    fn transport() -> HidTransport<IdleDevice> {
        let path = CString::new("test-path").unwrap();
        HidTransport::from_handles(&path, IdleDevice, IdleDevice)
    }

    #[test]
    fn writes_do_not_wait_behind_reads() {
        let transport = Arc::new(transport());
        let reading = Arc::new(AtomicBool::new(true));

        let reader = {
            let transport = Arc::clone(&transport);
            let reading = Arc::clone(&reading);
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                while reading.load(Ordering::SeqCst) {
                    let _ = transport.read_input(&mut buf, Duration::from_millis(50));
                }
            })
        };

        // Let the reader settle into its timed reads
        thread::sleep(Duration::from_millis(20));

        let mut worst = Duration::ZERO;
        for step in 0..20u8 {
            let started = Instant::now();
            let written = transport.write_output(&[0x05, 0, step, 0, step]);
            worst = worst.max(started.elapsed());
            assert_eq!(written, Ok(5));
            thread::sleep(Duration::from_millis(7));
        }

        reading.store(false, Ordering::SeqCst);
        reader.join().unwrap();

        assert!(worst < Duration::from_millis(25), "write waited {:?}", worst);
    }

    #[test]
    fn close_releases_both_handles() {
        let transport = transport();
        transport.close();

        let mut buf = [0u8; 64];
        assert_eq!(
            transport.read_input(&mut buf, Duration::from_millis(1)),
            Err(TransportError::Closed)
        );
        assert_eq!(
            transport.write_output(&[0x05, 0, 0, 0, 0]),
            Err(TransportError::Closed)
        );

        // Idempotent
        transport.close();
    }

    #[test]
    fn zero_length_write_means_disconnected() {
        struct GoneDevice;

        impl ReportDevice for GoneDevice {
            fn read_report(&self, _buf: &mut [u8], _timeout_ms: i32) -> Result<usize, TransportError> {
                Ok(0)
            }

            fn write_report(&self, _report: &[u8]) -> Result<usize, TransportError> {
                Ok(0)
            }
        }

        let path = CString::new("gone").unwrap();
        let transport = HidTransport::from_handles(&path, GoneDevice, GoneDevice);
        assert_eq!(
            transport.write_output(&[0x05, 0, 0, 0, 0]),
            Err(TransportError::Disconnected)
        );
    }
}
