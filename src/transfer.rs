#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Phase of a file transfer, reported through the progress callback.
///
/// Exactly one of the three `Completed*` values is reported per
/// transfer, as the last report the callback receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Not started.
    None,
    /// Opening the remote file.
    Open,
    /// Moving data blocks.
    Transmitting,
    /// Closing the remote handle.
    Close,
    /// Terminal: all bytes moved.
    CompletedSuccess,
    /// Terminal: the transfer failed.
    CompletedError,
    /// Terminal: cancellation was honored.
    CompletedAbort,
}

/// Cooperative cancellation token for file transfers.
///
/// Cheap to clone; all clones share the flag. The transfer loop polls
/// it once per block, so cancellation takes effect at the next block
/// boundary.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Irrevocable.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress callback: current phase and total payload bytes moved so
/// far.
pub type Progress<'a> = &'a mut dyn FnMut(TransferStatus, u64);
