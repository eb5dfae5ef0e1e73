//! Async framing over TCP: length-prefix (4 bytes LE) + bincode, one message per frame.

use std::time::Duration;

use share_core::wire::{self, FrameDecodeError, FrameEncodeError, LEN_SIZE};
use share_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
}

impl TransportError {
    /// Whether retrying against the same or another peer may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Timeout(_) | TransportError::Closed
        )
    }
}

/// Read one frame. A clean EOF before the length prefix is `Closed`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = wire::frame_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(wire::decode_body(&body)?)
}

/// `read_message` bounded by `limit`.
pub async fn read_message_timeout<R>(
    reader: &mut R,
    limit: Duration,
) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(limit, read_message(reader))
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// `write_message` bounded by `limit`.
pub async fn write_message_timeout<W>(
    writer: &mut W,
    msg: &Message,
    limit: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, write_message(writer, msg))
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = Message::ChunkData {
            offset: 7,
            payload: vec![9u8; 300],
        };
        let writer = tokio::spawn(async move {
            write_message(&mut a, &sent).await.unwrap();
            write_message(&mut a, &Message::Cancel).await.unwrap();
        });
        match read_message(&mut b).await.unwrap() {
            Message::ChunkData { offset, payload } => {
                assert_eq!(offset, 7);
                assert_eq!(payload.len(), 300);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        assert!(matches!(read_message(&mut b).await.unwrap(), Message::Cancel));
        writer.await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(TransportError::Decode(FrameDecodeError::TooLarge))
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let limit = Duration::from_millis(20);
        assert!(matches!(
            read_message_timeout(&mut b, limit).await,
            Err(TransportError::Timeout(_))
        ));
    }
}
