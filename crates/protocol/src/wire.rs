//! Fixed-size headers of the resource-server streaming sub-protocol.
//!
//! # Wire format
//!
//! ```text
//! AUTH (client -> resource server, once after dial):
//!   [4 bytes BE: cookie]
//!
//! PER FRAME (resource server -> client):
//!   [4 bytes BE: operation type]   1 = PUT, 2 = GET, 9999 = DONE
//!   [4 bytes BE: flags]
//!   [8 bytes BE: offset]
//!   [8 bytes BE: length]
//!
//! ENCRYPTION HEADER (only when the control connection negotiated SSL):
//!   [4 bytes LE: encrypted length + key size]
//!   [key size bytes: IV]
//!
//! PAYLOAD: length plaintext bytes, or (encrypted length) ciphertext bytes
//! ```

use crate::ProtocolError;
use crate::types::OperationType;

/// Size of an encoded [`TransferHeader`].
pub const TRANSFER_HEADER_LEN: usize = 24;

/// Encodes the cookie a client presents right after dialing a resource server.
pub fn encode_cookie(cookie: i32) -> [u8; 4] {
    (cookie as u32).to_be_bytes()
}

/// Header preceding every chunk exchanged with a resource server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub operation: OperationType,
    pub flags: u32,
    pub offset: i64,
    pub length: i64,
}

impl TransferHeader {
    /// Header that terminates a frame stream.
    pub fn done() -> Self {
        Self {
            operation: OperationType::Done,
            flags: 0,
            offset: 0,
            length: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; TRANSFER_HEADER_LEN] {
        let mut buf = [0u8; TRANSFER_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.operation.code().to_be_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < TRANSFER_HEADER_LEN {
            return Err(ProtocolError::ShortBuffer {
                what: "transfer header",
                need: TRANSFER_HEADER_LEN,
                got: buf.len(),
            });
        }

        let word = |range: std::ops::Range<usize>| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[range]);
            u32::from_be_bytes(b)
        };
        let long = |range: std::ops::Range<usize>| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[range]);
            i64::from_be_bytes(b)
        };

        Ok(Self {
            operation: OperationType::from_code(word(0..4)),
            flags: word(4..8),
            offset: long(8..16),
            length: long(16..24),
        })
    }
}

/// Header preceding an encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    /// Ciphertext length plus the key size, as declared by the sender.
    pub length: u32,
    pub iv: Vec<u8>,
}

impl EncryptionHeader {
    /// Encoded size for a given IV (key) size.
    pub fn encoded_len(iv_len: usize) -> usize {
        4 + iv_len
    }

    /// Builds a header for `ciphertext_len` bytes of payload.
    pub fn for_ciphertext(ciphertext_len: usize, iv: Vec<u8>) -> Self {
        let length = (ciphertext_len + iv.len()) as u32;
        Self { length, iv }
    }

    /// Number of ciphertext bytes that follow this header.
    ///
    /// Returns `None` when the declared length is smaller than the IV.
    pub fn ciphertext_len(&self) -> Option<usize> {
        (self.length as usize).checked_sub(self.iv.len())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(self.iv.len()));
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.iv);
        buf
    }

    pub fn from_bytes(buf: &[u8], iv_len: usize) -> Result<Self, ProtocolError> {
        let need = Self::encoded_len(iv_len);
        if buf.len() < need {
            return Err(ProtocolError::ShortBuffer {
                what: "encryption header",
                need,
                got: buf.len(),
            });
        }

        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[0..4]);
        Ok(Self {
            length: u32::from_le_bytes(len),
            iv: buf[4..need].to_vec(),
        })
    }
}
