#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Channel, ChannelEventSink, ChannelStatus, SecureConnection};
use crate::encoding::PathEncoding;
use crate::metadata::{DirEntry, FileAttrs};
use crate::receiver::SftpReceiver;
use crate::transfer::{Cancellation, Progress, TransferStatus};
use crate::wire::{
    DataReader, PacketBuilder, StatusResponse, SFTP_VERSION, SSH_FXF_CREAT, SSH_FXF_READ,
    SSH_FXF_TRUNC, SSH_FXF_WRITE, SSH_FXP_ATTRS, SSH_FXP_CLOSE, SSH_FXP_DATA, SSH_FXP_HANDLE,
    SSH_FXP_INIT, SSH_FXP_LSTAT, SSH_FXP_MKDIR, SSH_FXP_NAME, SSH_FXP_OPEN, SSH_FXP_OPENDIR,
    SSH_FXP_READ, SSH_FXP_READDIR, SSH_FXP_REALPATH, SSH_FXP_REMOVE, SSH_FXP_RENAME,
    SSH_FXP_RMDIR, SSH_FXP_SETSTAT, SSH_FXP_STAT, SSH_FXP_STATUS, SSH_FXP_VERSION,
    SSH_FXP_WRITE, SSH_FX_EOF, SSH_FX_OK,
};
use crate::Error;

/// Payload bytes moved per `SSH_FXP_READ`/`SSH_FXP_WRITE` during a
/// file transfer.
pub const FILE_TRANSFER_BLOCK_SIZE: usize = 10240;

/// Default bound on each request/response exchange.
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Blocking SFTP version 3 client over a subsystem channel.
///
/// All operations run one request/response exchange at a time,
/// bounded by the protocol timeout. The client stays usable after an
/// operation fails with a server status error or a timeout; it
/// becomes permanently inoperable once [`SftpClient::close`] is
/// called or the channel reaches a terminal state.
pub struct SftpClient {
    channel: Box<dyn Channel>,
    receiver: Arc<SftpReceiver>,
    protocol_timeout: Duration,
    encoding: PathEncoding,
    request_id: AtomicU32,
    closed: AtomicBool,
}

impl SftpClient {
    /// Opens the `sftp` subsystem on `connection`.
    ///
    /// The protocol handshake is a separate step; call
    /// [`SftpClient::init`] before any file operation.
    pub fn open(connection: &dyn SecureConnection) -> Result<Self, Error> {
        let receiver = Arc::new(SftpReceiver::new());
        let sink: Arc<dyn ChannelEventSink> = Arc::clone(&receiver) as Arc<dyn ChannelEventSink>;
        let channel = connection.open_subsystem(sink, "sftp")?;
        Ok(Self {
            channel,
            receiver,
            protocol_timeout: DEFAULT_PROTOCOL_TIMEOUT,
            encoding: PathEncoding::default(),
            request_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Bound applied to each blocking exchange.
    pub fn set_protocol_timeout(&mut self, timeout: Duration) {
        self.protocol_timeout = timeout;
    }

    /// Encoding used for remote paths and file names.
    pub fn set_path_encoding(&mut self, encoding: PathEncoding) {
        self.encoding = encoding;
    }

    /// Performs the version handshake: waits for the channel to be
    /// ready, sends `SSH_FXP_INIT`, and returns the server's protocol
    /// version. Server extensions are accepted and ignored.
    pub fn init(&self) -> Result<u32, Error> {
        self.receiver.wait_ready(self.protocol_timeout)?;
        let mut builder = PacketBuilder::new(SSH_FXP_INIT);
        builder.uint32(SFTP_VERSION);
        self.wait_response(builder, |packet_type, reader| {
            if packet_type != SSH_FXP_VERSION {
                return Err(Error::InvalidResponse("expected SSH_FXP_VERSION"));
            }
            let version = reader.uint32()?;
            while reader.remaining() > 0 {
                reader.string()?;
                reader.string()?;
            }
            Ok(Some(version))
        })
    }

    /// Shuts the channel down. Every subsequent operation fails with
    /// [`Error::InvalidStatus`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.send_eof()?;
        self.channel.close()?;
        Ok(())
    }

    /// Resolves `path` to a canonical absolute path on the server.
    pub fn real_path(&self, path: &str) -> Result<String, Error> {
        self.check_status()?;
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_REALPATH);
        builder.uint32(id).string(&self.encoding.encode(path));
        let encoding = self.encoding;
        self.wait_response(builder, move |packet_type, reader| match packet_type {
            SSH_FXP_NAME => {
                if reader.uint32()? != id {
                    return Ok(None);
                }
                let count = reader.uint32()?;
                if count == 0 {
                    return Err(Error::InvalidResponse("SSH_FXP_NAME carries no entries"));
                }
                let entry = DirEntry::parse(reader, encoding)?;
                Ok(Some(entry.file_name))
            }
            SSH_FXP_STATUS => {
                let status = StatusResponse::parse(reader)?;
                if status.request_id != id {
                    return Ok(None);
                }
                Err(status.into_error())
            }
            _ => Ok(None),
        })
    }

    /// Lists the entries of `path`, including `.` and `..` when the
    /// server reports them.
    ///
    /// The directory handle is closed exactly once, even when a
    /// listing call fails partway; in that case the listing error is
    /// returned and a secondary close failure is only logged.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        self.check_status()?;
        let mut path = path;
        while path != "/" && path.ends_with('/') {
            path = &path[..path.len() - 1];
        }
        let handle = self.open_dir(path)?;
        let mut entries = Vec::new();
        let listing = loop {
            match self.read_dir_chunk(&handle, &mut entries) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(error) => break Err(error),
            }
        };
        let closed = self.close_handle(&handle);
        match listing {
            Ok(()) => {
                closed?;
                Ok(entries)
            }
            Err(error) => {
                if let Err(_close_error) = closed {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = ?_close_error, "failed to close directory handle");
                }
                Err(error)
            }
        }
    }

    pub fn create_directory(&self, path: &str) -> Result<(), Error> {
        self.check_status()?;
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_MKDIR);
        builder
            .uint32(id)
            .string(&self.encoding.encode(path))
            .uint32(0);
        self.expect_status_ok(builder, id)
    }

    pub fn remove_directory(&self, path: &str) -> Result<(), Error> {
        self.check_status()?;
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_RMDIR);
        builder.uint32(id).string(&self.encoding.encode(path));
        self.expect_status_ok(builder, id)
    }

    pub fn remove_file(&self, path: &str) -> Result<(), Error> {
        self.check_status()?;
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_REMOVE);
        builder.uint32(id).string(&self.encoding.encode(path));
        self.expect_status_ok(builder, id)
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), Error> {
        self.check_status()?;
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_RENAME);
        builder
            .uint32(id)
            .string(&self.encoding.encode(old_path))
            .string(&self.encoding.encode(new_path));
        self.expect_status_ok(builder, id)
    }

    /// Sets the permission bits of `path`. Only the low 12 bits are
    /// sent.
    pub fn set_permissions(&self, path: &str, permissions: u32) -> Result<(), Error> {
        self.check_status()?;
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_SETSTAT);
        builder
            .uint32(id)
            .string(&self.encoding.encode(path))
            .uint32(crate::wire::SSH_FILEXFER_ATTR_PERMISSIONS)
            .uint32(permissions & 0o7777);
        self.expect_status_ok(builder, id)
    }

    /// Attributes of `path`, following symlinks.
    pub fn stat(&self, path: &str) -> Result<FileAttrs, Error> {
        self.attrs_of(SSH_FXP_STAT, path)
    }

    /// Attributes of `path` itself, not following symlinks.
    pub fn lstat(&self, path: &str) -> Result<FileAttrs, Error> {
        self.attrs_of(SSH_FXP_LSTAT, path)
    }

    /// Downloads `remote_path` into the local file at `local_path`,
    /// creating or truncating it.
    ///
    /// Progress is reported per block; exactly one terminal status
    /// (`CompletedSuccess`, `CompletedError` or `CompletedAbort`) is
    /// reported per call. Cancellation is polled once per block.
    pub fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        cancellation: Option<&Cancellation>,
        mut progress: Option<Progress<'_>>,
    ) -> Result<(), Error> {
        self.check_status()?;
        let mut transmitted = 0;
        match self.run_download(
            remote_path,
            local_path,
            cancellation,
            &mut progress,
            &mut transmitted,
        ) {
            Ok(None) => Ok(()),
            Ok(Some(pending)) => Err(Error::transfer(pending)),
            Err(error) => {
                report(&mut progress, TransferStatus::CompletedError, transmitted);
                Err(error)
            }
        }
    }

    /// Uploads the local file at `local_path` to `remote_path`,
    /// creating or truncating the remote file. Progress and
    /// cancellation behave as in [`SftpClient::download`].
    pub fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancellation: Option<&Cancellation>,
        mut progress: Option<Progress<'_>>,
    ) -> Result<(), Error> {
        self.check_status()?;
        let mut transmitted = 0;
        match self.run_upload(
            local_path,
            remote_path,
            cancellation,
            &mut progress,
            &mut transmitted,
        ) {
            Ok(None) => Ok(()),
            Ok(Some(pending)) => Err(Error::transfer(pending)),
            Err(error) => {
                report(&mut progress, TransferStatus::CompletedError, transmitted);
                Err(error)
            }
        }
    }

    /// Transfer body for [`SftpClient::download`].
    ///
    /// `Err` means a failure on the wire; the remote handle is left
    /// to the server (a half-finished exchange cannot be followed by
    /// a close exchange). `Ok(Some(_))` carries a local failure that
    /// was held back so the handle could still be closed.
    fn run_download(
        &self,
        remote_path: &str,
        local_path: &Path,
        cancellation: Option<&Cancellation>,
        progress: &mut Option<Progress<'_>>,
        transmitted: &mut u64,
    ) -> Result<Option<Error>, Error> {
        report(progress, TransferStatus::Open, 0);
        let handle = self.open_file(remote_path, SSH_FXF_READ)?;

        let mut pending = None;
        let mut aborted = false;
        let mut local = match File::create(local_path) {
            Ok(file) => Some(file),
            Err(error) => {
                pending = Some(Error::from(error));
                None
            }
        };

        if let Some(local) = local.as_mut() {
            loop {
                if cancellation.map_or(false, Cancellation::is_requested) {
                    aborted = true;
                    break;
                }
                report(progress, TransferStatus::Transmitting, *transmitted);
                match self.read_block(&handle, *transmitted, FILE_TRANSFER_BLOCK_SIZE as u32)? {
                    None => break,
                    Some(data) => {
                        if let Err(error) = local.write_all(&data) {
                            pending = Some(Error::from(error));
                            break;
                        }
                        *transmitted += data.len() as u64;
                    }
                }
            }
        }

        report(progress, TransferStatus::Close, *transmitted);
        self.finish_transfer(&handle, pending, aborted, progress, *transmitted)
    }

    /// Transfer body for [`SftpClient::upload`]; see
    /// [`SftpClient::run_download`] for the error contract.
    fn run_upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        cancellation: Option<&Cancellation>,
        progress: &mut Option<Progress<'_>>,
        transmitted: &mut u64,
    ) -> Result<Option<Error>, Error> {
        report(progress, TransferStatus::Open, 0);
        let mut local = File::open(local_path)?;
        let handle =
            self.open_file(remote_path, SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC)?;

        let mut pending = None;
        let mut aborted = false;
        let mut block = vec![0u8; FILE_TRANSFER_BLOCK_SIZE];
        loop {
            if cancellation.map_or(false, Cancellation::is_requested) {
                aborted = true;
                break;
            }
            report(progress, TransferStatus::Transmitting, *transmitted);
            let n = match local.read(&mut block) {
                Ok(n) => n,
                Err(error) => {
                    pending = Some(Error::from(error));
                    break;
                }
            };
            if n == 0 {
                break;
            }
            self.write_block(&handle, *transmitted, &block[..n])?;
            *transmitted += n as u64;
        }

        report(progress, TransferStatus::Close, *transmitted);
        self.finish_transfer(&handle, pending, aborted, progress, *transmitted)
    }

    /// Closes the transfer handle and reports the terminal status.
    fn finish_transfer(
        &self,
        handle: &[u8],
        pending: Option<Error>,
        aborted: bool,
        progress: &mut Option<Progress<'_>>,
        transmitted: u64,
    ) -> Result<Option<Error>, Error> {
        let closed = self.close_handle(handle);
        if let Some(pending) = pending {
            if let Err(_close_error) = closed {
                #[cfg(feature = "tracing")]
                tracing::error!(error = ?_close_error, "failed to close file handle");
            }
            report(progress, TransferStatus::CompletedError, transmitted);
            return Ok(Some(pending));
        }
        closed?;
        if aborted {
            report(progress, TransferStatus::CompletedAbort, transmitted);
        } else {
            report(progress, TransferStatus::CompletedSuccess, transmitted);
        }
        Ok(None)
    }

    fn attrs_of(&self, packet_type: u8, path: &str) -> Result<FileAttrs, Error> {
        self.check_status()?;
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(packet_type);
        builder.uint32(id).string(&self.encoding.encode(path));
        self.wait_response(builder, move |packet_type, reader| match packet_type {
            SSH_FXP_ATTRS => {
                if reader.uint32()? != id {
                    return Ok(None);
                }
                Ok(Some(FileAttrs::parse(reader)?))
            }
            SSH_FXP_STATUS => {
                let status = StatusResponse::parse(reader)?;
                if status.request_id != id {
                    return Ok(None);
                }
                Err(status.into_error())
            }
            _ => Ok(None),
        })
    }

    fn open_dir(&self, path: &str) -> Result<Vec<u8>, Error> {
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_OPENDIR);
        builder.uint32(id).string(&self.encoding.encode(path));
        self.wait_handle(builder, id)
    }

    /// One `SSH_FXP_READDIR` exchange. Returns whether more entries
    /// may follow.
    fn read_dir_chunk(&self, handle: &[u8], entries: &mut Vec<DirEntry>) -> Result<bool, Error> {
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_READDIR);
        builder.uint32(id).string(handle);
        let encoding = self.encoding;
        self.wait_response(builder, move |packet_type, reader| match packet_type {
            SSH_FXP_NAME => {
                if reader.uint32()? != id {
                    return Ok(None);
                }
                let count = reader.uint32()?;
                for _ in 0..count {
                    entries.push(DirEntry::parse(reader, encoding)?);
                }
                Ok(Some(true))
            }
            SSH_FXP_STATUS => {
                let status = StatusResponse::parse(reader)?;
                if status.request_id != id {
                    return Ok(None);
                }
                if status.code == SSH_FX_EOF {
                    Ok(Some(false))
                } else {
                    Err(status.into_error())
                }
            }
            _ => Ok(None),
        })
    }

    fn open_file(&self, path: &str, flags: u32) -> Result<Vec<u8>, Error> {
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_OPEN);
        builder
            .uint32(id)
            .string(&self.encoding.encode(path))
            .uint32(flags)
            .uint32(0);
        self.wait_handle(builder, id)
    }

    /// One `SSH_FXP_READ` exchange at an absolute offset. `None`
    /// means the server reported end of file.
    fn read_block(&self, handle: &[u8], offset: u64, len: u32) -> Result<Option<Vec<u8>>, Error> {
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_READ);
        builder
            .uint32(id)
            .string(handle)
            .uint64(offset)
            .uint32(len);
        self.wait_response(builder, move |packet_type, reader| match packet_type {
            SSH_FXP_DATA => {
                if reader.uint32()? != id {
                    return Ok(None);
                }
                Ok(Some(Some(reader.string()?)))
            }
            SSH_FXP_STATUS => {
                let status = StatusResponse::parse(reader)?;
                if status.request_id != id {
                    return Ok(None);
                }
                if status.code == SSH_FX_EOF {
                    Ok(Some(None))
                } else {
                    Err(status.into_error())
                }
            }
            _ => Ok(None),
        })
    }

    fn write_block(&self, handle: &[u8], offset: u64, data: &[u8]) -> Result<(), Error> {
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_WRITE);
        builder
            .uint32(id)
            .string(handle)
            .uint64(offset)
            .string(data);
        self.expect_status_ok(builder, id)
    }

    fn close_handle(&self, handle: &[u8]) -> Result<(), Error> {
        let id = self.next_request_id();
        let mut builder = PacketBuilder::new(SSH_FXP_CLOSE);
        builder.uint32(id).string(handle);
        self.expect_status_ok(builder, id)
    }

    fn wait_handle(&self, builder: PacketBuilder, id: u32) -> Result<Vec<u8>, Error> {
        self.wait_response(builder, move |packet_type, reader| match packet_type {
            SSH_FXP_HANDLE => {
                if reader.uint32()? != id {
                    return Ok(None);
                }
                Ok(Some(reader.string()?))
            }
            SSH_FXP_STATUS => {
                let status = StatusResponse::parse(reader)?;
                if status.request_id != id {
                    return Ok(None);
                }
                Err(status.into_error())
            }
            _ => Ok(None),
        })
    }

    fn expect_status_ok(&self, builder: PacketBuilder, id: u32) -> Result<(), Error> {
        self.wait_response(builder, move |packet_type, reader| {
            if packet_type != SSH_FXP_STATUS {
                return Ok(None);
            }
            let status = StatusResponse::parse(reader)?;
            if status.request_id != id {
                return Ok(None);
            }
            if status.code == SSH_FX_OK {
                Ok(Some(()))
            } else {
                Err(status.into_error())
            }
        })
    }

    fn wait_response<T>(
        &self,
        builder: PacketBuilder,
        handler: impl FnMut(u8, &mut DataReader) -> Result<Option<T>, Error>,
    ) -> Result<T, Error> {
        let message = builder.finish();
        self.receiver.wait_response(
            self.protocol_timeout,
            || {
                self.channel.send(&message)?;
                Ok(())
            },
            handler,
        )
    }

    /// Ids are pre-incremented; the first request uses id 1.
    fn next_request_id(&self) -> u32 {
        self.request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn check_status(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) || self.receiver.status() != ChannelStatus::Ready {
            return Err(Error::InvalidStatus);
        }
        Ok(())
    }
}

impl Drop for SftpClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn report(progress: &mut Option<Progress<'_>>, status: TransferStatus, transmitted: u64) {
    if let Some(callback) = progress {
        callback(status, transmitted);
    }
}
