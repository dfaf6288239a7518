//! Async framing over a resource-server socket.
//!
//! The byte layouts live in [`irods_protocol::wire`]; this module only moves
//! them across a stream. An end of stream before a transfer header is a
//! clean close. An end of stream anywhere else is a protocol error.

use irods_protocol::{EncryptionHeader, TRANSFER_HEADER_LEN, TransferHeader, encode_cookie};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ResourceServerError;

/// Sends the redirection cookie that authenticates a new connection.
pub async fn write_cookie<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cookie: i32,
) -> Result<(), ResourceServerError> {
    writer.write_all(&encode_cookie(cookie)).await?;
    Ok(())
}

/// Reads the cookie a client presents after dialing.
pub async fn read_cookie<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, ResourceServerError> {
    Ok(reader.read_i32().await?)
}

/// Reads the next transfer header.
///
/// Returns `None` if the peer closed the stream before sending any byte
/// of the header.
pub async fn read_transfer_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<TransferHeader>, ResourceServerError> {
    let mut buf = [0u8; TRANSFER_HEADER_LEN];
    let mut filled = 0;
    while filled < TRANSFER_HEADER_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ResourceServerError::Protocol(format!(
                "stream ended inside transfer header ({filled} of {TRANSFER_HEADER_LEN} bytes)"
            )));
        }
        filled += n;
    }
    Ok(Some(TransferHeader::from_bytes(&buf)?))
}

pub async fn write_transfer_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &TransferHeader,
) -> Result<(), ResourceServerError> {
    writer.write_all(&header.to_bytes()).await?;
    Ok(())
}

/// Reads an encryption header carrying an IV of `iv_len` bytes.
pub async fn read_encryption_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    iv_len: usize,
) -> Result<EncryptionHeader, ResourceServerError> {
    let mut buf = vec![0u8; EncryptionHeader::encoded_len(iv_len)];
    read_frame_bytes(reader, &mut buf, "encryption header").await?;
    Ok(EncryptionHeader::from_bytes(&buf, iv_len)?)
}

pub async fn write_encryption_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &EncryptionHeader,
) -> Result<(), ResourceServerError> {
    writer.write_all(&header.to_bytes()).await?;
    Ok(())
}

/// Fills `buf` from the stream. Running out of bytes is a protocol error
/// naming `what` was being read.
pub async fn read_frame_bytes<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), ResourceServerError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            ResourceServerError::Protocol(format!("stream ended inside {what}")),
        ),
        Err(e) => Err(e.into()),
    }
}
