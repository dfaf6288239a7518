//! A single TCP connection to a resource server.

use std::future::Future;
use std::time::Duration;

use irods_protocol::{EncryptionContext, EncryptionHeader, RedirectionInfo, TransferHeader};
use irods_transfer::TransferConfig;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::crypto::FrameCipher;
use crate::error::ResourceServerError;
use crate::wire::{
    read_encryption_header, read_frame_bytes, read_transfer_header, write_cookie,
    write_encryption_header,
};

/// An authenticated stream to a resource server.
///
/// Frames are read with [`next_header`](Self::next_header) and
/// [`read_payload`](Self::read_payload); payloads for PUT requests go out
/// through [`write_payload`](Self::write_payload). Encryption is applied
/// transparently when the session negotiated it.
pub struct ResourceServerConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    cipher: Option<FrameCipher>,
    address: String,
}

impl ResourceServerConnection {
    /// Dials the resource server in `info` and presents its cookie.
    pub async fn connect(
        info: &RedirectionInfo,
        encryption: Option<&EncryptionContext>,
        config: &TransferConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, ResourceServerError> {
        info.validate()?;
        let cipher = encryption.map(FrameCipher::new).transpose()?;
        let address = info.address();

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ResourceServerError::Cancelled);
            }
            result = tokio::time::timeout(config.connect_timeout, dial(&address, config.tcp_buffer_size)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(ResourceServerError::Timeout(format!("connect to {address}"))),
                }
            }
        };

        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::with_capacity(config.tcp_buffer_size, reader),
            writer: BufWriter::with_capacity(config.tcp_buffer_size, writer),
            cipher,
            address,
        };

        write_cookie(&mut conn.writer, info.cookie).await?;
        conn.writer.flush().await?;
        info!(address = %conn.address, encrypted = conn.is_encrypted(), "connected to resource server");
        Ok(conn)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Reads the next transfer header, or `None` once the server hung up.
    pub async fn next_header(
        &mut self,
        limit: Duration,
    ) -> Result<Option<TransferHeader>, ResourceServerError> {
        bounded(limit, "transfer header", read_transfer_header(&mut self.reader)).await
    }

    /// Reads the payload of a frame announcing `length` plaintext bytes.
    pub async fn read_payload(
        &mut self,
        length: usize,
        limit: Duration,
    ) -> Result<Vec<u8>, ResourceServerError> {
        bounded(limit, "frame payload", async {
            let Some(cipher) = &self.cipher else {
                let mut data = vec![0u8; length];
                read_frame_bytes(&mut self.reader, &mut data, "frame payload").await?;
                return Ok(data);
            };

            let header = read_encryption_header(&mut self.reader, cipher.iv_len()).await?;
            let sealed_len = header.ciphertext_len().ok_or_else(|| {
                ResourceServerError::Protocol(format!(
                    "encryption header length {} is shorter than its IV",
                    header.length
                ))
            })?;
            let mut sealed = vec![0u8; sealed_len];
            read_frame_bytes(&mut self.reader, &mut sealed, "encrypted payload").await?;

            let mut data = cipher.decrypt(&header.iv, &sealed)?;
            if data.len() < length {
                return Err(ResourceServerError::Encryption(format!(
                    "decrypted {} bytes, frame announced {length}",
                    data.len()
                )));
            }
            data.truncate(length);
            Ok::<_, ResourceServerError>(data)
        })
        .await
    }

    /// Sends `data` in answer to a PUT request and flushes it.
    pub async fn write_payload(
        &mut self,
        data: &[u8],
        limit: Duration,
    ) -> Result<(), ResourceServerError> {
        bounded(limit, "frame write", async {
            match &self.cipher {
                Some(cipher) => {
                    let iv = cipher.generate_iv();
                    let sealed = cipher.encrypt(&iv, data)?;
                    let header = EncryptionHeader::for_ciphertext(sealed.len(), iv);
                    write_encryption_header(&mut self.writer, &header).await?;
                    self.writer.write_all(&sealed).await?;
                }
                None => self.writer.write_all(data).await?,
            }
            self.writer.flush().await?;
            Ok::<_, ResourceServerError>(())
        })
        .await
    }
}

async fn dial(address: &str, buffer_size: usize) -> Result<TcpStream, ResourceServerError> {
    let addr = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| ResourceServerError::InvalidRedirection(format!("{address} did not resolve")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
    socket.set_send_buffer_size(size)?;
    socket.set_recv_buffer_size(size)?;

    debug!(%addr, "dialing resource server");
    Ok(socket.connect(addr).await?)
}

async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, ResourceServerError>
where
    F: Future<Output = Result<T, ResourceServerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ResourceServerError::Timeout(format!("{what} after {limit:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irods_protocol::{EncryptionAlgorithm, OperationType};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::wire::{read_cookie, write_transfer_header};

    fn info_for(port: u16) -> RedirectionInfo {
        RedirectionInfo {
            host: "127.0.0.1".into(),
            port: port as i32,
            cookie: 4242,
            server_socket: 7,
            window_size: 0,
        }
    }

    #[tokio::test]
    async fn presents_cookie_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_cookie(&mut stream).await.unwrap()
        });

        let conn = ResourceServerConnection::connect(
            &info_for(port),
            None,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(server.await.unwrap(), 4242);
        assert!(!conn.is_encrypted());
        assert_eq!(conn.address(), format!("127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn invalid_info_is_rejected_before_dialing() {
        let mut info = info_for(1);
        info.cookie = 0;
        let err = ResourceServerConnection::connect(
            &info,
            None,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ResourceServerError::InvalidRedirection(_)));
    }

    #[tokio::test]
    async fn cancelled_before_connect() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ResourceServerConnection::connect(&info_for(9), None, &TransferConfig::default(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ResourceServerError::Cancelled));
    }

    #[tokio::test]
    async fn slow_header_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let mut conn = ResourceServerConnection::connect(
            &info_for(port),
            None,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let err = conn.next_header(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ResourceServerError::Timeout(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn encrypted_payload_written_with_header() {
        let ctx = EncryptionContext {
            algorithm: EncryptionAlgorithm::Aes256Cbc,
            key_size: 32,
            shared_secret: vec![5u8; 32],
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server_ctx = ctx.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_cookie(&mut stream).await.unwrap();
            let header = TransferHeader {
                operation: OperationType::Put,
                flags: 0,
                offset: 0,
                length: 5,
            };
            write_transfer_header(&mut stream, &header).await.unwrap();

            let enc = read_encryption_header(&mut stream, 32).await.unwrap();
            let mut sealed = vec![0u8; enc.ciphertext_len().unwrap()];
            stream.read_exact(&mut sealed).await.unwrap();
            FrameCipher::new(&server_ctx).unwrap().decrypt(&enc.iv, &sealed).unwrap()
        });

        let mut conn = ResourceServerConnection::connect(
            &info_for(port),
            Some(&ctx),
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let limit = Duration::from_secs(5);
        let header = conn.next_header(limit).await.unwrap().unwrap();
        assert_eq!(header.operation, OperationType::Put);
        conn.write_payload(b"hello", limit).await.unwrap();

        assert_eq!(server.await.unwrap(), b"hello");
    }
}
