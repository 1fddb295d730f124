#![forbid(unsafe_code)]

//! Message reassembly and request/response correlation for the SFTP
//! channel.
//!
//! The channel hands over raw chunks with no message alignment;
//! [`SftpReceiver`] reassembles length-prefix-framed messages out of
//! them and delivers each completed message to the single blocked
//! caller, if any. The protocol here is strictly request/response
//! with one exchange in flight at a time, so correlation is a
//! single-slot structure rather than a map of pending requests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use crate::channel::{lock, ChannelEventSink, ChannelStatus, StatusCell};
use crate::wire::DataReader;
use crate::Error;

#[derive(Debug)]
struct Message {
    packet_type: u8,
    payload: Bytes,
}

#[derive(Debug)]
struct ResponseSlot {
    /// Whether a caller is blocked in [`SftpReceiver::wait_response`].
    /// Messages completed while this is false are dropped.
    waiting: bool,
    queue: VecDeque<Message>,
}

#[derive(Debug)]
pub(crate) struct SftpReceiver {
    status: StatusCell,
    /// Serializes callers of `wait_response`; at most one exchange is
    /// in flight per channel.
    exchange: Mutex<()>,
    slot: Mutex<ResponseSlot>,
    response_cond: Condvar,
    reassembly: Mutex<BytesMut>,
}

impl SftpReceiver {
    pub(crate) fn new() -> Self {
        Self {
            status: StatusCell::new(),
            exchange: Mutex::new(()),
            slot: Mutex::new(ResponseSlot {
                waiting: false,
                queue: VecDeque::new(),
            }),
            response_cond: Condvar::new(),
            reassembly: Mutex::new(BytesMut::new()),
        }
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        self.status.get()
    }

    pub(crate) fn wait_ready(&self, timeout: Duration) -> Result<(), Error> {
        self.status.wait_ready(timeout)
    }

    /// Runs one request/response exchange.
    ///
    /// Registers the wait, runs `transmit` to put the request on the
    /// wire, then blocks until `handler` accepts a response message.
    /// The handler returns `Ok(None)` to ignore a message (e.g. a
    /// stale request id), `Ok(Some(v))` on a match, or `Err` to raise
    /// a decoded failure to the caller. The timeout covers the whole
    /// exchange; a terminal channel transition fails the wait
    /// immediately.
    pub(crate) fn wait_response<T>(
        &self,
        timeout: Duration,
        transmit: impl FnOnce() -> Result<(), Error>,
        mut handler: impl FnMut(u8, &mut DataReader) -> Result<Option<T>, Error>,
    ) -> Result<T, Error> {
        let _exchange = lock(&self.exchange);

        {
            let mut slot = lock(&self.slot);
            slot.queue.clear();
            slot.waiting = true;
        }

        let result = (|| {
            transmit()?;

            let deadline = Instant::now() + timeout;
            let mut slot = lock(&self.slot);
            loop {
                if let Some(message) = slot.queue.pop_front() {
                    // Run the handler without blocking the delivery
                    // thread.
                    drop(slot);
                    let mut reader = DataReader::new(message.payload);
                    match handler(message.packet_type, &mut reader)? {
                        Some(value) => return Ok(value),
                        None => {
                            slot = lock(&self.slot);
                            continue;
                        }
                    }
                }

                match self.status.get() {
                    ChannelStatus::Error => {
                        let cause = self
                            .status
                            .error_cause()
                            .unwrap_or_else(|| "channel error".to_owned());
                        return Err(Error::Transport(cause));
                    }
                    ChannelStatus::Closed => return Err(Error::InvalidStatus),
                    ChannelStatus::Unknown | ChannelStatus::Ready => {}
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout);
                }
                let (guard, _) = self
                    .response_cond
                    .wait_timeout(slot, remaining)
                    .unwrap_or_else(|e| e.into_inner());
                slot = guard;
            }
        })();

        let mut slot = lock(&self.slot);
        slot.waiting = false;
        slot.queue.clear();

        result
    }

    /// Appends a chunk to the accumulator and dispatches every
    /// message that is now complete.
    fn reassemble(&self, data: &[u8]) {
        let mut completed = Vec::new();
        {
            let mut buf = lock(&self.reassembly);
            buf.extend_from_slice(data);
            loop {
                if buf.len() < 4 {
                    break;
                }
                let declared =
                    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if buf.len() < 4 + declared {
                    break;
                }
                let mut frame = buf.split_to(4 + declared);
                frame.advance(4);
                completed.push(frame.freeze());
            }
        }
        for frame in completed {
            self.dispatch(frame);
        }
    }

    fn dispatch(&self, frame: Bytes) {
        if frame.is_empty() {
            // Zero-length frame; nothing to type-dispatch.
            return;
        }
        let packet_type = frame[0];
        let payload = frame.slice(1..);
        let mut slot = lock(&self.slot);
        if slot.waiting {
            slot.queue.push_back(Message {
                packet_type,
                payload,
            });
            self.response_cond.notify_all();
        } else {
            #[cfg(feature = "tracing")]
            tracing::trace!(packet_type, "dropping message with no wait in progress");
        }
    }

    /// Wakes any blocked exchange so it can observe a status change.
    fn wake_waiters(&self) {
        let _slot = lock(&self.slot);
        self.response_cond.notify_all();
    }
}

impl ChannelEventSink for SftpReceiver {
    fn on_data(&self, data: &[u8]) {
        self.reassemble(data);
    }

    fn on_ready(&self) {
        self.status.transition(ChannelStatus::Ready);
    }

    fn on_closed(&self) {
        self.status.transition(ChannelStatus::Closed);
        self.wake_waiters();
    }

    fn on_eof(&self) {}

    fn on_error(&self, error: io::Error) {
        #[cfg(feature = "tracing")]
        tracing::error!(?error, "channel error");
        self.status
            .transition_with_cause(ChannelStatus::Error, Some(error.to_string()));
        self.wake_waiters();
    }
}
