//! Point-to-point session with one peer
//!
//! A session owns one ordered byte stream and multiplexes tagged logical
//! streams over it. Frames are FIFO per tag; a frame that arrives for a tag
//! nobody is waiting on is parked until someone asks for that tag, so a
//! receiver never depends on the relative order of different tags.

use crate::errors::{PoolError, Result};
use crate::network::protocol::{read_frame, write_frame, Frame, Message, Tag};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Any bidirectional byte stream that can carry a session
pub trait Link: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Link for T {}

/// Type-erased link (TCP stream, in-memory duplex, ...)
pub type BoxedLink = Box<dyn Link>;

/// Tagged, ordered message channel to a single peer
pub struct Session {
    /// Peer index, the worker index on the manager side and 0 on workers
    peer: usize,
    link: BoxedLink,
    pending: HashMap<Tag, VecDeque<Message>>,
    timeout: Option<Duration>,
}

impl Session {
    pub fn new(peer: usize, link: BoxedLink) -> Self {
        Self {
            peer,
            link,
            pending: HashMap::new(),
            timeout: None,
        }
    }

    /// Bound every send and receive by `timeout`; `None` blocks indefinitely
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    /// Number of parked frames across all tags
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        write_frame(&mut self.link, &frame).await?;
        Ok(())
    }

    async fn read_until(&mut self, tag: Tag) -> Result<Message> {
        loop {
            let frame = read_frame(&mut self.link).await?;
            trace!(peer = self.peer, tag = ?frame.tag, message = frame.message.name(), "recv");
            if frame.tag == tag {
                return Ok(frame.message);
            }
            self.pending
                .entry(frame.tag)
                .or_default()
                .push_back(frame.message);
        }
    }

    async fn bounded<T>(
        limit: Option<Duration>,
        peer: usize,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match limit {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| PoolError::Timeout(limit, peer))?,
            None => fut.await,
        }
    }

    /// Send `message` on the logical stream `tag`
    pub async fn send(&mut self, tag: Tag, message: Message) -> Result<()> {
        trace!(peer = self.peer, ?tag, message = message.name(), "send");
        let (limit, peer) = (self.timeout, self.peer);
        Self::bounded(limit, peer, self.write(Frame::new(tag, message))).await
    }

    /// Receive the next message on `tag`, parking frames for other tags
    pub async fn receive(&mut self, tag: Tag) -> Result<Message> {
        if let Some(message) = self.pending.get_mut(&tag).and_then(VecDeque::pop_front) {
            return Ok(message);
        }
        let (limit, peer) = (self.timeout, self.peer);
        Self::bounded(limit, peer, self.read_until(tag)).await
    }

    /// Announce the element count of the payloads that follow
    pub async fn send_size(&mut self, element_count: usize) -> Result<()> {
        self.send(
            Tag::Size,
            Message::Size {
                element_count: element_count as u64,
            },
        )
        .await
    }

    pub async fn receive_size(&mut self) -> Result<usize> {
        match self.receive(Tag::Size).await? {
            Message::Size { element_count } => usize::try_from(element_count).map_err(|_| {
                PoolError::Protocol(format!("Element count {} too large", element_count))
            }),
            other => Err(unexpected(self.peer, Tag::Size, &other)),
        }
    }

    pub async fn send_payload(&mut self, tag: Tag, data: &[f64]) -> Result<()> {
        self.send(
            tag,
            Message::Payload {
                data: data.to_vec(),
            },
        )
        .await
    }

    /// Receive a payload and check it carries exactly `expected` elements
    pub async fn receive_payload(&mut self, tag: Tag, expected: usize) -> Result<Vec<f64>> {
        match self.receive(tag).await? {
            Message::Payload { data } if data.len() == expected => Ok(data),
            Message::Payload { data } => Err(PoolError::Protocol(format!(
                "Peer {} sent {} elements on {:?}, expected {}",
                self.peer,
                data.len(),
                tag,
                expected
            ))),
            other => Err(unexpected(self.peer, tag, &other)),
        }
    }

    /// Flush and shut down the write half of the link
    pub async fn close(&mut self) -> Result<()> {
        let (limit, peer) = (self.timeout, self.peer);
        Self::bounded(limit, peer, async {
            self.link.shutdown().await?;
            Ok::<(), PoolError>(())
        })
        .await
    }
}

/// Protocol error for a message that is not valid at this point
pub fn unexpected(peer: usize, tag: Tag, message: &Message) -> PoolError {
    PoolError::Protocol(format!(
        "Unexpected {} from peer {} on {:?}",
        message.name(),
        peer,
        tag
    ))
}

/// True if the error means the peer closed its end of the link
pub fn is_disconnect(err: &PoolError) -> bool {
    matches!(
        err,
        PoolError::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
        )
    )
}
