#![forbid(unsafe_code)]

//! SFTP version 3 wire format: packet type and status constants, an
//! outgoing message builder, and a bounds-checked payload reader.
//!
//! Every message on the wire is a u32 big-endian length `N`, followed
//! by `N` bytes of which the first is the packet type.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

pub const SFTP_VERSION: u32 = 3;

pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;

pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_BAD_MESSAGE: u32 = 5;
pub const SSH_FX_NO_CONNECTION: u32 = 6;
pub const SSH_FX_CONNECTION_LOST: u32 = 7;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;

pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x0000_0001;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x0000_0002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x0000_0004;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x8000_0000;

pub const SSH_FXF_READ: u32 = 0x0000_0001;
pub const SSH_FXF_WRITE: u32 = 0x0000_0002;
pub const SSH_FXF_APPEND: u32 = 0x0000_0004;
pub const SSH_FXF_CREAT: u32 = 0x0000_0008;
pub const SSH_FXF_TRUNC: u32 = 0x0000_0010;
pub const SSH_FXF_EXCL: u32 = 0x0000_0020;

/// Builds one outgoing length-prefix-framed message.
///
/// The length field is written as a placeholder up front and patched
/// in [`PacketBuilder::finish`].
#[derive(Debug)]
pub(crate) struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    pub(crate) fn new(packet_type: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        buf.put_u8(packet_type);
        Self { buf }
    }

    pub(crate) fn uint32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub(crate) fn uint64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub(crate) fn byte(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Appends a length-prefixed byte string.
    pub(crate) fn string(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Patches the length prefix and freezes the message.
    pub(crate) fn finish(self) -> Bytes {
        let mut buf = self.buf;
        let payload_len = (buf.len() - 4) as u32;
        buf[..4].copy_from_slice(&payload_len.to_be_bytes());
        buf.freeze()
    }
}

/// Bounds-checked big-endian reader over a message payload.
///
/// Truncated input surfaces as [`Error::InvalidResponse`] instead of
/// panicking, since the payload comes from the remote peer.
#[derive(Debug)]
pub(crate) struct DataReader {
    data: Bytes,
    pos: usize,
}

impl DataReader {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn advance(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.remaining() < n {
            return Err(Error::InvalidResponse("truncated message payload"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn byte(&mut self) -> Result<u8, Error> {
        Ok(self.advance(1)?[0])
    }

    pub(crate) fn uint32(&mut self) -> Result<u32, Error> {
        let bytes = self.advance(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn uint64(&mut self) -> Result<u64, Error> {
        let bytes = self.advance(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads a length-prefixed byte string.
    pub(crate) fn string(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.uint32()? as usize;
        Ok(self.advance(len)?.to_vec())
    }
}

/// Decoded `SSH_FXP_STATUS` payload.
#[derive(Debug)]
pub(crate) struct StatusResponse {
    pub(crate) request_id: u32,
    pub(crate) code: u32,
    pub(crate) message: String,
    pub(crate) language_tag: String,
}

impl StatusResponse {
    /// Parses a status payload. The message and language tag are
    /// optional on the wire; some servers omit them for SSH_FX_OK.
    pub(crate) fn parse(reader: &mut DataReader) -> Result<Self, Error> {
        let request_id = reader.uint32()?;
        let code = reader.uint32()?;
        let (message, language_tag) = if reader.remaining() > 0 {
            let message = String::from_utf8_lossy(&reader.string()?).into_owned();
            let language_tag = if reader.remaining() > 0 {
                String::from_utf8_lossy(&reader.string()?).into_owned()
            } else {
                String::new()
            };
            (message, language_tag)
        } else {
            (String::new(), String::new())
        };
        Ok(Self {
            request_id,
            code,
            message,
            language_tag,
        })
    }

    pub(crate) fn into_error(self) -> Error {
        Error::Protocol {
            request_id: self.request_id,
            code: self.code,
            message: self.message,
            language_tag: self.language_tag,
        }
    }
}
