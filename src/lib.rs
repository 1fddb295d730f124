#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod byte_queue;
mod channel;
mod client;
mod encoding;
mod metadata;
mod receiver;
mod scp;
mod transfer;
mod wire;

pub use sftp_channel_error::Error;

pub use channel::{Channel, ChannelEventSink, ChannelStatus, SecureConnection};
pub use client::{SftpClient, DEFAULT_PROTOCOL_TIMEOUT, FILE_TRANSFER_BLOCK_SIZE};
pub use encoding::PathEncoding;
pub use metadata::{DirEntry, FileAttrs};
pub use scp::ScpChannelStream;
pub use transfer::{Cancellation, Progress, TransferStatus};

pub use wire::{
    SSH_FXF_APPEND, SSH_FXF_CREAT, SSH_FXF_EXCL, SSH_FXF_READ, SSH_FXF_TRUNC, SSH_FXF_WRITE,
    SSH_FX_BAD_MESSAGE, SSH_FX_CONNECTION_LOST, SSH_FX_EOF, SSH_FX_FAILURE, SSH_FX_NO_CONNECTION,
    SSH_FX_NO_SUCH_FILE, SSH_FX_OK, SSH_FX_OP_UNSUPPORTED, SSH_FX_PERMISSION_DENIED,
};
