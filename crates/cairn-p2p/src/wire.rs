//! Wire protocol: frames and messages exchanged between peers.
//!
//! Every unit on a connection is self-describing:
//!
//! - message frame: `[0x01][u32 LE length][postcard bytes]`
//! - stream frame:  `[0x02][u64 LE length][raw bytes]`
//!
//! A stream frame always follows the message that announces it
//! ([`Message::StoreFile`] or [`Message::FileFound`]). Decoders only read the
//! stream header; the body is read straight off the connection by whoever
//! handles the preceding message.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

// ── Framing ────────────────────────────────────────────────────────────

/// Maximum encoded message size (1 MB). Payloads travel in stream frames.
pub const MAX_MSG_SIZE: u32 = 1024 * 1024;

pub const MESSAGE_FRAME: u8 = 0x01;
pub const STREAM_FRAME: u8 = 0x02;

/// A decoded unit read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Encoded [`Message`] bytes.
    Message(Vec<u8>),
    /// Header of a raw byte stream; the body (`len` bytes) is still unread.
    Stream(u64),
}

/// A frame tagged with the address of the peer that sent it.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: SocketAddr,
    pub frame: Frame,
}

/// Serialize `msg` into a complete message frame.
pub fn encode_msg(msg: &Message) -> Result<Vec<u8>, TransportError> {
    let bytes = postcard::to_allocvec(msg)?;
    let len = bytes.len() as u32;
    if len > MAX_MSG_SIZE {
        return Err(TransportError::MessageTooLarge(len as u64));
    }
    let mut frame = Vec::with_capacity(5 + bytes.len());
    frame.push(MESSAGE_FRAME);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

pub fn decode_msg(bytes: &[u8]) -> Result<Message, TransportError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Write a message frame.
pub async fn write_msg<W>(writer: &mut W, msg: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_msg(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(TransportError::Write)
}

/// Write the header of a stream frame. The caller writes exactly `len`
/// body bytes next.
pub async fn write_stream_header<W>(writer: &mut W, len: u64) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut header = [0u8; 9];
    header[0] = STREAM_FRAME;
    header[1..].copy_from_slice(&len.to_le_bytes());
    writer
        .write_all(&header)
        .await
        .map_err(TransportError::Write)
}

/// Read the next frame. For stream frames only the header is consumed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = reader.read_u8().await.map_err(TransportError::from_read)?;
    match tag {
        MESSAGE_FRAME => {
            let len = reader
                .read_u32_le()
                .await
                .map_err(TransportError::from_read)?;
            if len > MAX_MSG_SIZE {
                return Err(TransportError::MessageTooLarge(len as u64));
            }
            let mut buf = vec![0u8; len as usize];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(TransportError::from_read)?;
            Ok(Frame::Message(buf))
        }
        STREAM_FRAME => {
            let len = reader
                .read_u64_le()
                .await
                .map_err(TransportError::from_read)?;
            Ok(Frame::Stream(len))
        }
        other => Err(TransportError::UnknownFrame(other)),
    }
}

// ── Messages ───────────────────────────────────────────────────────────

/// Control messages sent between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    StoreFile(StoreFile),
    GetFile(GetFile),
    FileFound(FileFound),
    FileNotFound(FileNotFound),
}

impl Message {
    /// Size of the stream frame that must follow this message, if any.
    pub fn stream_len(&self) -> Option<u64> {
        match self {
            Message::StoreFile(m) => Some(m.size),
            Message::FileFound(m) => Some(m.size),
            Message::GetFile(_) | Message::FileNotFound(_) => None,
        }
    }
}

/// Replicate `size` bytes under `key`. The bytes follow as a stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFile {
    pub key: String,
    pub size: u64,
}

/// Ask a peer for the content of `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFile {
    /// Chosen by the requester; echoed in the reply.
    pub request_id: u64,
    pub key: String,
}

/// Positive reply to [`GetFile`]. The content follows as a stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFound {
    pub request_id: u64,
    pub key: String,
    pub size: u64,
}

/// The responder does not hold the requested key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNotFound {
    pub request_id: u64,
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_frame_layout() {
        let msg = Message::GetFile(GetFile {
            request_id: 7,
            key: "My Data".into(),
        });
        let frame = encode_msg(&msg).unwrap();

        assert_eq!(frame[0], MESSAGE_FRAME);
        let len = u32::from_le_bytes(frame[1..5].try_into().unwrap());
        assert_eq!(len as usize, frame.len() - 5);
        assert_eq!(decode_msg(&frame[5..]).unwrap(), msg);
    }

    #[tokio::test]
    async fn message_then_stream_on_one_connection() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let msg = Message::StoreFile(StoreFile {
            key: "k".into(),
            size: 5,
        });
        write_msg(&mut a, &msg).await.unwrap();
        write_stream_header(&mut a, 5).await.unwrap();
        a.write_all(b"hello").await.unwrap();
        write_msg(
            &mut a,
            &Message::FileNotFound(FileNotFound {
                request_id: 1,
                key: "x".into(),
            }),
        )
        .await
        .unwrap();

        let Frame::Message(bytes) = read_frame(&mut b).await.unwrap() else {
            panic!("expected message frame");
        };
        assert_eq!(decode_msg(&bytes).unwrap(), msg);
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Stream(5));

        let mut body = [0u8; 5];
        b.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");

        let Frame::Message(bytes) = read_frame(&mut b).await.unwrap() else {
            panic!("expected message frame");
        };
        assert!(matches!(decode_msg(&bytes).unwrap(), Message::FileNotFound(_)));
    }

    #[tokio::test]
    async fn fragmented_frame_is_reassembled() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let msg = Message::StoreFile(StoreFile {
            key: "k".repeat(300),
            size: 1,
        });
        let frame = encode_msg(&msg).unwrap();

        let writer = tokio::spawn(async move {
            for piece in frame.chunks(7) {
                a.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let Frame::Message(bytes) = read_frame(&mut b).await.unwrap() else {
            panic!("expected message frame");
        };
        assert_eq!(decode_msg(&bytes).unwrap(), msg);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn unknown_tag_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x7f, 0, 0, 0, 0]).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownFrame(0x7f)));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = vec![MESSAGE_FRAME];
        header.extend_from_slice(&(MAX_MSG_SIZE + 1).to_le_bytes());
        a.write_all(&header).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge(_)));
    }

    #[test]
    fn stream_len_only_for_payload_messages() {
        let store = Message::StoreFile(StoreFile {
            key: "k".into(),
            size: 42,
        });
        let found = Message::FileFound(FileFound {
            request_id: 1,
            key: "k".into(),
            size: 9,
        });
        let get = Message::GetFile(GetFile {
            request_id: 1,
            key: "k".into(),
        });
        assert_eq!(store.stream_len(), Some(42));
        assert_eq!(found.stream_len(), Some(9));
        assert_eq!(get.stream_len(), None);
    }
}
