//! GET and PUT frame loops.
//!
//! The resource server drives both directions: it sends a transfer header
//! for every chunk, and the client either reads the payload that follows
//! (GET) or answers with the requested bytes of the local file (PUT). A
//! DONE header, or the server closing the socket between frames, ends the
//! loop.

use std::io::SeekFrom;

use irods_protocol::{OperationType, TransferHeader};
use irods_transfer::TransferConfig;
use irods_transfer::progress::TaskProgress;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::MAX_FRAME_LENGTH;
use crate::connection::ResourceServerConnection;
use crate::error::ResourceServerError;

/// Receives GET frames and writes each payload at its offset in `file`.
///
/// Returns the number of bytes written.
pub async fn receive_frames(
    conn: &mut ResourceServerConnection,
    file: &mut File,
    progress: &mut TaskProgress,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<i64, ResourceServerError> {
    let mut received = 0i64;

    while let Some(header) = next_request(conn, OperationType::Get, config, cancel).await? {
        let length = frame_length(&header)?;
        debug!(offset = header.offset, length, "GET frame");

        let data = conn.read_payload(length, config.operation_timeout).await?;
        file.seek(SeekFrom::Start(header.offset as u64)).await?;
        file.write_all(&data).await?;

        received += length as i64;
        progress.advance(length as i64);
    }

    file.flush().await?;
    debug!(address = conn.address(), received, "GET stream finished");
    Ok(received)
}

/// Answers PUT frames with the requested ranges of `file`.
///
/// Returns the number of bytes sent.
pub async fn send_frames(
    conn: &mut ResourceServerConnection,
    file: &mut File,
    progress: &mut TaskProgress,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<i64, ResourceServerError> {
    let mut sent = 0i64;

    while let Some(header) = next_request(conn, OperationType::Put, config, cancel).await? {
        let length = frame_length(&header)?;
        debug!(offset = header.offset, length, "PUT frame");

        let mut data = vec![0u8; length];
        file.seek(SeekFrom::Start(header.offset as u64)).await?;
        let read = read_full(file, &mut data).await?;
        if read < length {
            return Err(ResourceServerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "local file ends at {} but server asked for {length} bytes at {}",
                    header.offset + read as i64,
                    header.offset
                ),
            )));
        }

        conn.write_payload(&data, config.operation_timeout).await?;
        sent += length as i64;
        progress.advance(length as i64);
    }

    debug!(address = conn.address(), sent, "PUT stream finished");
    Ok(sent)
}

/// Reads the next header and checks it asks for `expected`.
///
/// `None` means the stream is over.
async fn next_request(
    conn: &mut ResourceServerConnection,
    expected: OperationType,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<Option<TransferHeader>, ResourceServerError> {
    if cancel.is_cancelled() {
        return Err(ResourceServerError::Cancelled);
    }

    let header = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ResourceServerError::Cancelled),
        header = conn.next_header(config.operation_timeout) => header?,
    };

    match header {
        None => {
            debug!(address = conn.address(), "resource server closed the stream");
            Ok(None)
        }
        Some(h) if h.operation == OperationType::Done => Ok(None),
        Some(h) if h.operation == expected => Ok(Some(h)),
        Some(h) => Err(ResourceServerError::Protocol(format!(
            "unexpected operation type {} in {expected:?} stream",
            h.operation.code()
        ))),
    }
}

fn frame_length(header: &TransferHeader) -> Result<usize, ResourceServerError> {
    if header.offset < 0 || header.length < 0 || header.length > MAX_FRAME_LENGTH {
        return Err(ResourceServerError::Protocol(format!(
            "bad frame: offset {}, length {}",
            header.offset, header.length
        )));
    }
    Ok(header.length as usize)
}

async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize, ResourceServerError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use irods_protocol::{EncryptionAlgorithm, EncryptionContext, EncryptionHeader, RedirectionInfo};
    use irods_transfer::progress::ProgressAggregator;
    use tokio::net::{TcpListener, TcpStream};

    use crate::crypto::FrameCipher;
    use crate::wire::{read_cookie, read_encryption_header, write_transfer_header};

    fn header(operation: OperationType, offset: i64, length: i64) -> TransferHeader {
        TransferHeader {
            operation,
            flags: 0,
            offset,
            length,
        }
    }

    fn aes_context() -> EncryptionContext {
        EncryptionContext {
            algorithm: EncryptionAlgorithm::Aes256Cbc,
            key_size: 32,
            shared_secret: vec![0x5a; 32],
        }
    }

    /// Accepts one client, checks its cookie, and hands the socket to `script`.
    async fn serve_one<F, Fut>(script: F) -> (RedirectionInfo, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            assert_eq!(read_cookie(&mut stream).await.unwrap(), 99);
            script(stream).await;
        });
        let info = RedirectionInfo {
            host: "127.0.0.1".into(),
            port: port as i32,
            cookie: 99,
            server_socket: 3,
            window_size: 0,
        };
        (info, task)
    }

    async fn connect(
        info: &RedirectionInfo,
        encryption: Option<&EncryptionContext>,
    ) -> ResourceServerConnection {
        ResourceServerConnection::connect(
            info,
            encryption,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    async fn local_file(dir: &tempfile::TempDir, data: &[u8]) -> (std::path::PathBuf, File) {
        let path = dir.path().join("local.bin");
        std::fs::write(&path, data).unwrap();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .unwrap();
        (path, file)
    }

    #[tokio::test]
    async fn get_frames_written_at_offsets_until_done() {
        let (info, server) = serve_one(|mut stream| async move {
            // Out of order on purpose.
            write_transfer_header(&mut stream, &header(OperationType::Get, 4, 4)).await.unwrap();
            stream.write_all(b"EFGH").await.unwrap();
            write_transfer_header(&mut stream, &header(OperationType::Get, 0, 4)).await.unwrap();
            stream.write_all(b"ABCD").await.unwrap();
            write_transfer_header(&mut stream, &TransferHeader::done()).await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (path, mut file) = local_file(&dir, b"").await;
        let aggregate = ProgressAggregator::new(8, None);
        let mut progress = aggregate.task();

        let mut conn = connect(&info, None).await;
        let n = receive_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        server.await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(aggregate.done(), 8);
        assert_eq!(std::fs::read(&path).unwrap(), b"ABCDEFGH");
    }

    #[tokio::test]
    async fn close_between_frames_ends_cleanly() {
        let (info, server) = serve_one(|mut stream| async move {
            write_transfer_header(&mut stream, &header(OperationType::Get, 0, 3)).await.unwrap();
            stream.write_all(b"xyz").await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (path, mut file) = local_file(&dir, b"").await;
        let mut progress = ProgressAggregator::new(3, None).task();

        let mut conn = connect(&info, None).await;
        server.await.unwrap();
        let n = receive_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(n, 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn stream_ending_mid_frame_is_error() {
        let (info, server) = serve_one(|mut stream| async move {
            write_transfer_header(&mut stream, &header(OperationType::Get, 0, 10)).await.unwrap();
            stream.write_all(b"only4").await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (_, mut file) = local_file(&dir, b"").await;
        let mut progress = ProgressAggregator::new(10, None).task();

        let mut conn = connect(&info, None).await;
        server.await.unwrap();
        let err = receive_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResourceServerError::Protocol(_)));
    }

    #[tokio::test]
    async fn unexpected_operation_is_protocol_error() {
        let (info, server) = serve_one(|mut stream| async move {
            write_transfer_header(&mut stream, &header(OperationType::Put, 0, 4)).await.unwrap();
            // Keep the socket open until the client has looked at the header.
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (_, mut file) = local_file(&dir, b"").await;
        let mut progress = ProgressAggregator::new(4, None).task();

        let mut conn = connect(&info, None).await;
        let err = receive_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResourceServerError::Protocol(msg) if msg.contains("unexpected operation type 1")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn encrypted_get_frame_writes_plaintext() {
        let ctx = aes_context();
        let server_ctx = ctx.clone();
        let (info, server) = serve_one(move |mut stream| async move {
            let cipher = FrameCipher::new(&server_ctx).unwrap();
            let iv = cipher.generate_iv();
            let sealed = cipher.encrypt(&iv, b"secret bytes").unwrap();

            write_transfer_header(&mut stream, &header(OperationType::Get, 100, 12)).await.unwrap();
            let enc = EncryptionHeader::for_ciphertext(sealed.len(), iv);
            stream.write_all(&enc.to_bytes()).await.unwrap();
            stream.write_all(&sealed).await.unwrap();
            write_transfer_header(&mut stream, &TransferHeader::done()).await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (path, mut file) = local_file(&dir, b"").await;
        let mut progress = ProgressAggregator::new(112, None).task();

        let mut conn = connect(&info, Some(&ctx)).await;
        assert!(conn.is_encrypted());
        let n = receive_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        server.await.unwrap();

        assert_eq!(n, 12);
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 112);
        assert_eq!(&written[100..], b"secret bytes");
    }

    #[tokio::test]
    async fn put_frames_answered_from_local_file() {
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let (info, server) = serve_one(move |mut stream| async move {
            for (offset, length) in [(6i64, 4i64), (0, 6)] {
                write_transfer_header(&mut stream, &header(OperationType::Put, offset, length))
                    .await
                    .unwrap();
                let mut buf = vec![0u8; length as usize];
                stream.read_exact(&mut buf).await.unwrap();
                sink.lock().unwrap().push((offset, buf));
            }
            write_transfer_header(&mut stream, &TransferHeader::done()).await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (_, mut file) = local_file(&dir, b"0123456789").await;
        let aggregate = ProgressAggregator::new(10, None);
        let mut progress = aggregate.task();

        let mut conn = connect(&info, None).await;
        let n = send_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        server.await.unwrap();

        assert_eq!(n, 10);
        assert_eq!(aggregate.done(), 10);
        let received = received.lock().unwrap();
        assert_eq!(received[0], (6, b"6789".to_vec()));
        assert_eq!(received[1], (0, b"012345".to_vec()));
    }

    #[tokio::test]
    async fn encrypted_put_frame_decrypts_on_server() {
        let ctx = aes_context();
        let server_ctx = ctx.clone();
        let (info, server) = serve_one(move |mut stream| async move {
            write_transfer_header(&mut stream, &header(OperationType::Put, 2, 5)).await.unwrap();
            let enc = read_encryption_header(&mut stream, 32).await.unwrap();
            let mut sealed = vec![0u8; enc.ciphertext_len().unwrap()];
            stream.read_exact(&mut sealed).await.unwrap();
            let plain = FrameCipher::new(&server_ctx).unwrap().decrypt(&enc.iv, &sealed).unwrap();
            assert_eq!(plain, b"cdefg");
            write_transfer_header(&mut stream, &TransferHeader::done()).await.unwrap();
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (_, mut file) = local_file(&dir, b"abcdefgh").await;
        let mut progress = ProgressAggregator::new(8, None).task();

        let mut conn = connect(&info, Some(&ctx)).await;
        send_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn put_beyond_local_file_fails() {
        let (info, server) = serve_one(|mut stream| async move {
            write_transfer_header(&mut stream, &header(OperationType::Put, 4, 8)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (_, mut file) = local_file(&dir, b"abcdef").await;
        let mut progress = ProgressAggregator::new(6, None).task();

        let mut conn = connect(&info, None).await;
        let err = send_frames(
            &mut conn,
            &mut file,
            &mut progress,
            &TransferConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResourceServerError::Io(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_checked_between_frames() {
        let (info, server) = serve_one(|mut stream| async move {
            write_transfer_header(&mut stream, &header(OperationType::Get, 0, 2)).await.unwrap();
            stream.write_all(b"ok").await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (_, mut file) = local_file(&dir, b"").await;
        let mut progress = ProgressAggregator::new(2, None).task();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut conn = connect(&info, None).await;
        let err = receive_frames(&mut conn, &mut file, &mut progress, &TransferConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceServerError::Cancelled));
        server.await.unwrap();
    }

    #[test]
    fn oversized_frame_rejected() {
        let err = frame_length(&header(OperationType::Get, 0, MAX_FRAME_LENGTH + 1)).unwrap_err();
        assert!(matches!(err, ResourceServerError::Protocol(_)));
        assert!(frame_length(&header(OperationType::Get, -1, 4)).is_err());
        assert_eq!(frame_length(&header(OperationType::Get, 0, 4)).unwrap(), 4);
    }
}
