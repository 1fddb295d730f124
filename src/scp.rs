#![forbid(unsafe_code)]

//! Blocking byte stream over an exec channel, as used by the SCP
//! protocol.
//!
//! Unlike the SFTP side there is no framing here: whatever the remote
//! command writes arrives as an ordered byte stream, buffered until a
//! reader asks for it.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::byte_queue::ByteQueue;
use crate::channel::{lock, Channel, ChannelEventSink, ChannelStatus, SecureConnection, StatusCell};
use crate::Error;

const INITIAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus {
    NotOpened,
    Opened,
    Closing,
    Closed,
    Error,
}

#[derive(Debug)]
struct StreamInner {
    status: Mutex<StreamStatus>,
    ready: StatusCell,
    buffer: Mutex<ByteQueue>,
    data_cond: Condvar,
}

impl StreamInner {
    /// Wakes blocked readers so they can observe a status change.
    fn pulse_readers(&self) {
        let _buffer = lock(&self.buffer);
        self.data_cond.notify_all();
    }
}

impl ChannelEventSink for StreamInner {
    fn on_data(&self, data: &[u8]) {
        let mut buffer = lock(&self.buffer);
        buffer.append(data);
        self.data_cond.notify_all();
    }

    fn on_ready(&self) {
        self.ready.transition(ChannelStatus::Ready);
    }

    fn on_closed(&self) {
        {
            let mut status = lock(&self.status);
            if *status != StreamStatus::Error {
                *status = StreamStatus::Closed;
            }
        }
        self.ready.transition(ChannelStatus::Closed);
        self.pulse_readers();
    }

    fn on_eof(&self) {}

    fn on_error(&self, error: io::Error) {
        #[cfg(feature = "tracing")]
        tracing::error!(?error, "scp channel error");
        {
            let mut status = lock(&self.status);
            if *status != StreamStatus::Closed {
                *status = StreamStatus::Error;
            }
        }
        self.ready
            .transition_with_cause(ChannelStatus::Error, Some(error.to_string()));
        self.pulse_readers();
    }
}

/// Blocking stream over a channel running a remote command.
///
/// Reads block until data is available or the timeout expires; data
/// delivered by the channel thread is buffered in the meantime, so no
/// bytes are lost between reads. A closed or failed channel fails
/// blocked readers promptly with [`Error::InvalidStatus`].
pub struct ScpChannelStream {
    inner: Arc<StreamInner>,
    channel: Option<Box<dyn Channel>>,
}

impl ScpChannelStream {
    pub fn new() -> Self {
        Self::with_initial_capacity(INITIAL_CAPACITY)
    }

    /// Creates a stream whose receive buffer starts at `capacity`
    /// bytes. The buffer still grows on demand.
    pub fn with_initial_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                status: Mutex::new(StreamStatus::NotOpened),
                ready: StatusCell::new(),
                buffer: Mutex::new(ByteQueue::with_capacity(capacity)),
                data_cond: Condvar::new(),
            }),
            channel: None,
        }
    }

    /// Opens a channel running `command` and waits until it is ready.
    pub fn open(
        &mut self,
        connection: &dyn SecureConnection,
        command: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        if *lock(&self.inner.status) != StreamStatus::NotOpened {
            return Err(Error::InvalidStatus);
        }
        let sink: Arc<dyn ChannelEventSink> = Arc::clone(&self.inner) as Arc<dyn ChannelEventSink>;
        let channel = connection.exec_command(sink, command)?;
        self.channel = Some(channel);
        self.inner.ready.wait_ready(timeout)?;
        let mut status = lock(&self.inner.status);
        if *status != StreamStatus::NotOpened {
            return Err(Error::InvalidStatus);
        }
        *status = StreamStatus::Opened;
        Ok(())
    }

    /// Sends bytes to the remote command.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        if *lock(&self.inner.status) != StreamStatus::Opened {
            return Err(Error::InvalidStatus);
        }
        let channel = self.channel.as_ref().ok_or(Error::InvalidStatus)?;
        channel.send(data)?;
        Ok(())
    }

    /// Reads available bytes into `out`, blocking until at least one
    /// byte arrives. Returns how many bytes were read.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        self.read_max(out, out.len(), timeout)
    }

    /// Like [`ScpChannelStream::read`] but reads at most `max` bytes
    /// even when more are buffered.
    pub fn read_max(&self, out: &mut [u8], max: usize, timeout: Duration) -> Result<usize, Error> {
        let mut buffer = lock(&self.inner.buffer);
        loop {
            if *lock(&self.inner.status) != StreamStatus::Opened {
                return Err(Error::InvalidStatus);
            }
            if !buffer.is_empty() {
                return Ok(buffer.drain_into(out, max));
            }
            let (guard, wait) = self
                .inner
                .data_cond
                .wait_timeout(buffer, timeout)
                .unwrap_or_else(|e| e.into_inner());
            buffer = guard;
            if wait.timed_out() && buffer.is_empty() {
                if *lock(&self.inner.status) != StreamStatus::Opened {
                    return Err(Error::InvalidStatus);
                }
                return Err(Error::Timeout);
            }
        }
    }

    /// Reads exactly one byte.
    pub fn read_byte(&self, timeout: Duration) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        loop {
            let n = self.read_max(&mut byte, 1, timeout)?;
            if n == 1 {
                return Ok(byte[0]);
            }
        }
    }

    /// Reads up to and including the first occurrence of
    /// `terminator`.
    ///
    /// On timeout nothing is consumed; bytes that arrived stay
    /// buffered for the next read. The timeout bounds each blocking
    /// wait, not the whole call.
    pub fn read_until(&self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, Error> {
        let mut buffer = lock(&self.inner.buffer);
        let mut scanned = 0;
        loop {
            if *lock(&self.inner.status) != StreamStatus::Opened {
                return Err(Error::InvalidStatus);
            }
            let slice = buffer.as_slice();
            if let Some(index) = slice[scanned..].iter().position(|&b| b == terminator) {
                return Ok(buffer.take(scanned + index + 1));
            }
            scanned = slice.len();
            let before = buffer.len();
            let (guard, wait) = self
                .inner
                .data_cond
                .wait_timeout(buffer, timeout)
                .unwrap_or_else(|e| e.into_inner());
            buffer = guard;
            if wait.timed_out() && buffer.len() == before {
                if *lock(&self.inner.status) != StreamStatus::Opened {
                    return Err(Error::InvalidStatus);
                }
                return Err(Error::Timeout);
            }
        }
    }

    /// Closes the stream: signals EOF, closes the channel, and marks
    /// the stream closed. Calling close on an already closed or never
    /// opened stream is a no-op.
    pub fn close(&mut self) -> Result<(), Error> {
        {
            let mut status = lock(&self.inner.status);
            match *status {
                StreamStatus::Opened | StreamStatus::Error => *status = StreamStatus::Closing,
                StreamStatus::NotOpened | StreamStatus::Closing | StreamStatus::Closed => {
                    return Ok(())
                }
            }
        }
        if let Some(channel) = &self.channel {
            channel.send_eof()?;
            channel.close()?;
        }
        let mut status = lock(&self.inner.status);
        if *status == StreamStatus::Closing {
            *status = StreamStatus::Closed;
        }
        Ok(())
    }
}

impl Default for ScpChannelStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScpChannelStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
