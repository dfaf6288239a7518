//! Shared data types and fixed-size wire headers for iRODS data transfer.
//!
//! This crate does no I/O. The transfer engine and the resource-server
//! client both build on the types defined here.

pub mod types;
pub mod wire;

pub use types::{
    EncryptionAlgorithm, EncryptionContext, FileHandle, OpenMode, OperationType,
    RedirectionHandle, RedirectionInfo, ReplicaAccessToken, Whence,
};
pub use wire::{EncryptionHeader, TRANSFER_HEADER_LEN, TransferHeader, encode_cookie};

/// Errors produced while decoding protocol structures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("short {what}: need {need} bytes, got {got}")]
    ShortBuffer {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("invalid redirection info: {0}")]
    InvalidRedirection(String),

    #[error("unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),
}
