#![allow(dead_code)]

//! In-process fake of the channel layer: a transport that records
//! everything the client sends and lets the test (or a scripted
//! responder thread) deliver inbound events.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sftp_channel_client::{Channel, ChannelEventSink, SecureConnection};

#[derive(Default)]
struct TransportState {
    sink: Option<Arc<dyn ChannelEventSink>>,
    sent: Vec<Vec<u8>>,
    consumed: usize,
    eof: bool,
    closed: bool,
}

/// Fake channel transport shared between the channel handed to the
/// client and the test driving the remote side.
#[derive(Default)]
pub struct TestTransport {
    state: Mutex<TransportState>,
    sent_cond: Condvar,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_sink(&self, sink: Arc<dyn ChannelEventSink>) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    fn sink(&self) -> Arc<dyn ChannelEventSink> {
        self.state
            .lock()
            .unwrap()
            .sink
            .as_ref()
            .expect("no channel opened")
            .clone()
    }

    fn record_send(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.sent.push(data.to_vec());
        self.sent_cond.notify_all();
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Blocks until the client sends another message, consuming it.
    pub fn next_sent(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.consumed < state.sent.len() {
                let message = state.sent[state.consumed].clone();
                state.consumed += 1;
                return Some(message);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self.sent_cond.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
    }

    pub fn eof_sent(&self) -> bool {
        self.state.lock().unwrap().eof
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Delivers inbound bytes as the channel thread would.
    pub fn deliver(&self, data: &[u8]) {
        self.sink().on_data(data);
    }

    pub fn announce_ready(&self) {
        self.sink().on_ready();
    }

    pub fn announce_closed(&self) {
        self.sink().on_closed();
    }

    pub fn announce_error(&self, message: &str) {
        self.sink()
            .on_error(io::Error::new(io::ErrorKind::ConnectionReset, message.to_owned()));
    }
}

struct TestChannel(Arc<TestTransport>);

impl Channel for TestChannel {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.0.record_send(data);
        Ok(())
    }

    fn send_eof(&self) -> io::Result<()> {
        self.0.state.lock().unwrap().eof = true;
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.0.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Connection factory handing out channels bound to one
/// [`TestTransport`]. By default the channel reports ready as soon as
/// it is opened.
pub struct TestConnection {
    transport: Arc<TestTransport>,
    ready_on_open: bool,
    opened_with: Mutex<Vec<String>>,
}

impl TestConnection {
    pub fn new(transport: Arc<TestTransport>) -> Self {
        Self {
            transport,
            ready_on_open: true,
            opened_with: Mutex::new(Vec::new()),
        }
    }

    /// Leaves the channel in the unknown state after open; the test
    /// announces readiness (or failure) itself.
    pub fn without_ready(mut self) -> Self {
        self.ready_on_open = false;
        self
    }

    /// Subsystem names / command lines the client opened channels
    /// with.
    pub fn opened_with(&self) -> Vec<String> {
        self.opened_with.lock().unwrap().clone()
    }

    fn open(&self, sink: Arc<dyn ChannelEventSink>, target: &str) -> io::Result<Box<dyn Channel>> {
        self.opened_with.lock().unwrap().push(target.to_owned());
        self.transport.set_sink(Arc::clone(&sink));
        if self.ready_on_open {
            sink.on_ready();
        }
        Ok(Box::new(TestChannel(Arc::clone(&self.transport))))
    }
}

impl SecureConnection for TestConnection {
    fn open_subsystem(
        &self,
        sink: Arc<dyn ChannelEventSink>,
        subsystem: &str,
    ) -> io::Result<Box<dyn Channel>> {
        self.open(sink, subsystem)
    }

    fn exec_command(
        &self,
        sink: Arc<dyn ChannelEventSink>,
        command: &str,
    ) -> io::Result<Box<dyn Channel>> {
        self.open(sink, command)
    }
}

/// Runs `script` on its own thread for every message the client
/// sends, delivering whatever replies it returns. The thread exits
/// once the client goes quiet.
pub fn spawn_responder(
    transport: Arc<TestTransport>,
    mut script: impl FnMut(u8, Vec<u8>) -> Vec<Vec<u8>> + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Some(message) = transport.next_sent(Duration::from_secs(5)) {
            if message.len() < 5 {
                continue;
            }
            for reply in script(message[4], message) {
                transport.deliver(&reply);
            }
        }
    })
}

/// Builders for server-side reply frames and accessors for the
/// client's request frames.
pub mod pkt {
    pub const FXP_INIT: u8 = 1;
    pub const FXP_VERSION: u8 = 2;
    pub const FXP_OPEN: u8 = 3;
    pub const FXP_CLOSE: u8 = 4;
    pub const FXP_READ: u8 = 5;
    pub const FXP_WRITE: u8 = 6;
    pub const FXP_LSTAT: u8 = 7;
    pub const FXP_SETSTAT: u8 = 9;
    pub const FXP_OPENDIR: u8 = 11;
    pub const FXP_READDIR: u8 = 12;
    pub const FXP_REMOVE: u8 = 13;
    pub const FXP_MKDIR: u8 = 14;
    pub const FXP_RMDIR: u8 = 15;
    pub const FXP_REALPATH: u8 = 16;
    pub const FXP_STAT: u8 = 17;
    pub const FXP_RENAME: u8 = 18;
    pub const FXP_STATUS: u8 = 101;
    pub const FXP_HANDLE: u8 = 102;
    pub const FXP_DATA: u8 = 103;
    pub const FXP_NAME: u8 = 104;
    pub const FXP_ATTRS: u8 = 105;

    pub const FX_OK: u32 = 0;
    pub const FX_EOF: u32 = 1;
    pub const FX_NO_SUCH_FILE: u32 = 2;
    pub const FX_PERMISSION_DENIED: u32 = 3;
    pub const FX_FAILURE: u32 = 4;

    /// Packet type of a client request frame.
    pub fn req_type(frame: &[u8]) -> u8 {
        frame[4]
    }

    /// Request id of a client request frame.
    pub fn req_id(frame: &[u8]) -> u32 {
        u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]])
    }

    /// Read offset (u64 after the handle string) of an FXP_READ or
    /// FXP_WRITE frame.
    pub fn req_offset(frame: &[u8]) -> u64 {
        let handle_len = u32::from_be_bytes([frame[9], frame[10], frame[11], frame[12]]) as usize;
        let at = 13 + handle_len;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&frame[at..at + 8]);
        u64::from_be_bytes(raw)
    }

    pub fn frame(packet_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 5);
        out.extend_from_slice(&((payload.len() + 1) as u32).to_be_bytes());
        out.push(packet_type);
        out.extend_from_slice(payload);
        out
    }

    fn put_string(out: &mut Vec<u8>, value: &[u8]) {
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }

    pub fn version(version: u32) -> Vec<u8> {
        frame(FXP_VERSION, &version.to_be_bytes())
    }

    pub fn status(id: u32, code: u32, message: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        put_string(&mut payload, message.as_bytes());
        put_string(&mut payload, b"en");
        frame(FXP_STATUS, &payload)
    }

    pub fn handle(id: u32, handle: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        put_string(&mut payload, handle);
        frame(FXP_HANDLE, &payload)
    }

    pub fn data(id: u32, bytes: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        put_string(&mut payload, bytes);
        frame(FXP_DATA, &payload)
    }

    /// FXP_NAME reply; each entry is (file name, long name), with an
    /// empty attribute block.
    pub fn name(id: u32, entries: &[(&str, &str)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (file_name, long_name) in entries {
            put_string(&mut payload, file_name.as_bytes());
            put_string(&mut payload, long_name.as_bytes());
            payload.extend_from_slice(&0u32.to_be_bytes());
        }
        frame(FXP_NAME, &payload)
    }

    /// FXP_ATTRS reply carrying size and permissions.
    pub fn attrs(id: u32, size: u64, permissions: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&(0x0000_0001u32 | 0x0000_0004).to_be_bytes());
        payload.extend_from_slice(&size.to_be_bytes());
        payload.extend_from_slice(&permissions.to_be_bytes());
        frame(FXP_ATTRS, &payload)
    }
}
