#![forbid(unsafe_code)]

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::Error;

/// Acquires a mutex, continuing with the inner value if another
/// thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outbound half of a secure channel multiplexed over an encrypted
/// connection.
///
/// The channel layer itself (connection setup, encryption, channel
/// open/close) is not part of this crate; implementations wrap
/// whatever transport the application already has.
pub trait Channel: Send + Sync {
    /// Sends bytes over the channel.
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Signals that no more data will be sent.
    fn send_eof(&self) -> io::Result<()>;

    /// Closes the channel.
    fn close(&self) -> io::Result<()>;
}

/// Inbound events of a secure channel.
///
/// The channel layer guarantees that all callbacks for one channel
/// are invoked sequentially by a single delivery thread. Chunks
/// passed to [`ChannelEventSink::on_data`] carry no alignment to any
/// protocol message boundary.
pub trait ChannelEventSink: Send + Sync {
    /// Data arrived on the channel.
    fn on_data(&self, data: &[u8]);

    /// The channel finished opening and is ready for traffic.
    fn on_ready(&self);

    /// The channel was closed.
    fn on_closed(&self);

    /// The remote side sent end-of-stream.
    fn on_eof(&self);

    /// The channel failed.
    fn on_error(&self, error: io::Error);
}

/// Factory side of the secure transport, used to open channels with
/// an event sink already wired in.
pub trait SecureConnection {
    /// Opens a subsystem channel (e.g. `"sftp"`).
    fn open_subsystem(
        &self,
        sink: Arc<dyn ChannelEventSink>,
        subsystem: &str,
    ) -> io::Result<Box<dyn Channel>>;

    /// Opens a channel executing a remote command (e.g. `scp -f`).
    fn exec_command(
        &self,
        sink: Arc<dyn ChannelEventSink>,
        command: &str,
    ) -> io::Result<Box<dyn Channel>>;
}

/// Lifecycle of a channel as observed through its event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No lifecycle event observed yet.
    Unknown,
    /// The channel reported ready.
    Ready,
    /// The channel was closed. Terminal.
    Closed,
    /// The channel failed. Terminal.
    Error,
}

impl ChannelStatus {
    /// Whether no further transition can occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelStatus::Closed | ChannelStatus::Error)
    }
}

#[derive(Debug)]
struct StatusState {
    status: ChannelStatus,
    cause: Option<String>,
}

/// Shared channel-status cell.
///
/// Mutated only by channel-thread callbacks, read by any blocked
/// caller thread. Transitions are monotonic toward a terminal state;
/// every transition broadcast-wakes the waiters.
#[derive(Debug)]
pub(crate) struct StatusCell {
    state: Mutex<StatusState>,
    cond: Condvar,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(StatusState {
                status: ChannelStatus::Unknown,
                cause: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> ChannelStatus {
        lock(&self.state).status
    }

    /// The transport failure recorded by the transition to
    /// [`ChannelStatus::Error`], if any.
    pub(crate) fn error_cause(&self) -> Option<String> {
        lock(&self.state).cause.clone()
    }

    pub(crate) fn transition(&self, next: ChannelStatus) {
        self.transition_with_cause(next, None);
    }

    pub(crate) fn transition_with_cause(&self, next: ChannelStatus, cause: Option<String>) {
        let mut state = lock(&self.state);
        if state.status.is_terminal() {
            return;
        }
        state.status = next;
        if cause.is_some() {
            state.cause = cause;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(status = ?state.status, "channel status transition");
        self.cond.notify_all();
    }

    /// Blocks until the channel reports ready.
    ///
    /// A terminal transition observed while waiting fails fast with
    /// [`Error::InvalidStatus`] instead of running out the timeout.
    pub(crate) fn wait_ready(&self, timeout: Duration) -> Result<(), Error> {
        let mut state = lock(&self.state);
        loop {
            match state.status {
                ChannelStatus::Ready => return Ok(()),
                ChannelStatus::Closed | ChannelStatus::Error => return Err(Error::InvalidStatus),
                ChannelStatus::Unknown => {
                    let (guard, wait) = self
                        .cond
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                    if wait.timed_out() && state.status == ChannelStatus::Unknown {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }
}
