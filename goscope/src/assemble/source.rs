//! The raw record channel: a restartable, closeable stream of ring-buffer
//! payloads.
//!
//! The assembler's intake task owns the source and blocks on `read`; a
//! [`SourceHandle`] lets any other thread request close. A close only
//! stops the reader; records already handed to the assembler still
//! drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aya::maps::{MapData, RingBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadError {
    /// The source was closed; normal end of stream.
    #[error("record source closed")]
    Closed,

    /// Nothing arrived within the read deadline; callers retry.
    #[error("record read timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A blocking byte-record stream. One record per successful read.
pub trait RecordSource: Send {
    fn read(&mut self) -> Result<Vec<u8>, ReadError>;
}

/// Requests close on the source it was created with.
#[derive(Clone)]
pub struct SourceHandle {
    closed: Arc<AtomicBool>,
}

impl SourceHandle {
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Polls an eBPF ring buffer, surfacing a timeout every deadline so the
/// intake loop stays responsive to close requests.
pub struct RingBufSource {
    ring: RingBuf<MapData>,
    closed: Arc<AtomicBool>,
    poll_interval: Duration,
    read_deadline: Duration,
}

impl RingBufSource {
    pub fn new(ring: RingBuf<MapData>) -> (Self, SourceHandle) {
        let closed = Arc::new(AtomicBool::new(false));
        let handle = SourceHandle { closed: Arc::clone(&closed) };
        let source = Self {
            ring,
            closed,
            poll_interval: Duration::from_millis(10),
            read_deadline: Duration::from_secs(1),
        };
        (source, handle)
    }
}

impl RecordSource for RingBufSource {
    fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        let start = Instant::now();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReadError::Closed);
            }
            if let Some(item) = self.ring.next() {
                return Ok(item.to_vec());
            }
            if start.elapsed() >= self.read_deadline {
                return Err(ReadError::Timeout);
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
