//! Transports.
//!
//! A transport is reduced to a [`Channel`]: a stream of inbound messages
//! (or per-frame errors) and a sink for outbound messages. The peer loop
//! does not know which transport it runs on.
//!
//! - [`stdio`] — newline-delimited JSON over stdin/stdout, a child process,
//!   or any byte stream pair
//! - [`http_server`] — HTTP POST for client-to-server messages, Server-Sent
//!   Events for server-to-client messages, with resumable event IDs
//! - [`http_client`] — the client side of the HTTP transport
//! - [`events`] — the resumable event log and SSE wire decoder

pub mod events;
pub mod http_client;
pub mod http_server;
pub mod stdio;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use super::error::TransportError;
use super::framing::{FrameError, JsonLineCodec};
use super::protocol::Message;

pub use stdio::memory_pair;

/// Inbound half of a channel.
pub type MessageStream = BoxStream<'static, Result<Message, FrameError>>;

/// Outbound half of a channel.
#[async_trait]
pub trait MessageSink: Send {
    /// Writes one message.
    async fn send(&mut self, message: Message) -> Result<(), TransportError>;

    /// Flushes and releases the transport.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A bidirectional message channel.
pub struct Channel {
    pub incoming: MessageStream,
    pub outgoing: Box<dyn MessageSink>,
}

impl Channel {
    #[must_use]
    pub fn new(incoming: MessageStream, outgoing: Box<dyn MessageSink>) -> Self {
        Self { incoming, outgoing }
    }
}

#[async_trait]
impl<W> MessageSink for FramedWrite<W, JsonLineCodec>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        SinkExt::send(self, message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(self).await?;
        Ok(())
    }
}
