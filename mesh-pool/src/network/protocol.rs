// Wire protocol between the manager and its workers
//
// Every frame is a u32 big-endian length prefix followed by a CBOR-encoded
// `Frame`. Frames carry a tag; ordering is only guaranteed among frames with
// the same tag on the same link.

use crate::executor::CombineOp;
use crate::group::GroupMode;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Protocol version announced in `Hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size (256MB)
pub const MESSAGE_SIZE_LIMIT: usize = 256 * 1024 * 1024;

/// Logical stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Join/hello handshake, merge rendezvous and leave
    Control,
    /// Element count announcement, always ahead of the payloads
    Size,
    /// Chunk of the first input matrix
    PayloadA,
    /// Chunk of the second input matrix
    PayloadB,
    /// Combined chunk returned by a worker
    Result,
}

/// Messages exchanged on a worker link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Worker → manager, first frame on a fresh link
    Join { worker_index: u32 },
    /// Manager → worker, reply to `Join`
    Hello {
        job_id: Uuid,
        version: u32,
        /// Size of the remote (manager) group as seen by the worker
        parent_group_size: u32,
        worker_count: u32,
        mode: GroupMode,
        op: CombineOp,
    },
    /// Manager → worker, opens the merge rendezvous
    MergeIntent,
    /// Worker → manager, worker is ready to merge
    MergeJoin { worker_index: u32 },
    /// Manager → worker, every worker joined; carries the unified rank
    MergeCommit { rank: u32, size: u32 },
    /// Worker → manager, worker adopted its unified rank
    MergeAck { rank: u32 },
    /// Number of elements in each following payload
    Size { element_count: u64 },
    /// Column-major chunk of values
    Payload { data: Vec<f64> },
    /// Manager → worker, disconnect
    Leave,
}

impl Message {
    /// Short name for logs and protocol errors
    pub fn name(&self) -> &'static str {
        match self {
            Message::Join { .. } => "Join",
            Message::Hello { .. } => "Hello",
            Message::MergeIntent => "MergeIntent",
            Message::MergeJoin { .. } => "MergeJoin",
            Message::MergeCommit { .. } => "MergeCommit",
            Message::MergeAck { .. } => "MergeAck",
            Message::Size { .. } => "Size",
            Message::Payload { .. } => "Payload",
            Message::Leave => "Leave",
        }
    }
}

/// A tagged message as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub tag: Tag,
    pub message: Message,
}

impl Frame {
    pub fn new(tag: Tag, message: Message) -> Self {
        Self { tag, message }
    }
}

/// Read a length-prefixed CBOR frame from an async stream
pub async fn read_frame<T>(io: &mut T) -> io::Result<Frame>
where
    T: AsyncRead + Unpin + Send,
{
    // Read u32 length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MESSAGE_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", len, MESSAGE_SIZE_LIMIT),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    ciborium::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a length-prefixed CBOR frame to an async stream
pub async fn write_frame<T>(io: &mut T, frame: &Frame) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let mut buf = Vec::new();
    ciborium::into_writer(frame, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if buf.len() > MESSAGE_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Frame size {} exceeds limit {}",
                buf.len(),
                MESSAGE_SIZE_LIMIT
            ),
        ));
    }

    let len = buf.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hello() -> Message {
        Message::Hello {
            job_id: Uuid::new_v4(),
            version: PROTOCOL_VERSION,
            parent_group_size: 1,
            worker_count: 3,
            mode: GroupMode::Merged,
            op: CombineOp::Add,
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frames = vec![
            Frame::new(Tag::Control, hello()),
            Frame::new(Tag::Size, Message::Size { element_count: 6 }),
            Frame::new(
                Tag::PayloadB,
                Message::Payload {
                    data: vec![1.5, -2.25, 1e300],
                },
            ),
        ];

        let mut write_buf = Vec::new();
        for frame in &frames {
            write_frame(&mut write_buf, frame).await.unwrap();
        }

        let mut read_buf = Cursor::new(write_buf);
        for frame in &frames {
            let decoded = read_frame(&mut read_buf).await.unwrap();
            assert_eq!(&decoded, frame);
        }
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let frame = Frame::new(Tag::Result, Message::Payload { data: vec![] });
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let decoded = read_frame(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_read_size_limit_enforcement() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::new(Tag::Control, Message::Leave))
            .await
            .unwrap();

        // Tamper with the length prefix
        let large_len: u32 = (MESSAGE_SIZE_LIMIT + 1) as u32;
        buf[0..4].copy_from_slice(&large_len.to_be_bytes());

        let result = read_frame(&mut Cursor::new(buf)).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_malformed_cbor() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&[0xFF; 10]);

        let result = read_frame(&mut Cursor::new(buf)).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_incomplete_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x02, 0x03]);

        let result = read_frame(&mut Cursor::new(buf)).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_message_names() {
        assert_eq!(hello().name(), "Hello");
        assert_eq!(Message::MergeAck { rank: 1 }.name(), "MergeAck");
    }
}
