//! Client for iRODS resource servers.
//!
//! When the catalog redirects a get or put, the bytes move over dedicated
//! TCP connections to a resource server instead of the catalog connection.
//! The control connection still owns the redirection and completes it.
//!
//! # Wire format
//!
//! See [`irods_protocol::wire`] for the header layouts.

pub mod client;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod redirect;
pub mod wire;

pub use client::{receive_frames, send_frames};
pub use connection::ResourceServerConnection;
pub use crypto::FrameCipher;
pub use error::ResourceServerError;
pub use redirect::{download_via_redirection, upload_via_redirection};

/// Largest payload a single frame may announce (64 MiB).
pub const MAX_FRAME_LENGTH: i64 = 64 * 1024 * 1024;
