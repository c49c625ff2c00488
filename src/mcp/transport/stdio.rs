//! Newline-delimited stream transport.
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin: receives messages from the peer
//! - stdout: sends messages to the peer
//! - stderr: may be used for logging (never protocol traffic)
//!
//! The same framing works over any `AsyncRead`/`AsyncWrite` pair, which is
//! how child processes and in-memory pairs are wired up.

use std::process::Stdio;

use futures::{future, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error};

use super::Channel;
use crate::mcp::error::TransportError;
use crate::mcp::framing::JsonLineCodec;

/// Builds a channel over the process's stdin and stdout.
#[must_use]
pub fn stdio(max_line_bytes: usize) -> Channel {
    from_io(tokio::io::stdin(), tokio::io::stdout(), max_line_bytes)
}

/// Builds a channel over an arbitrary byte stream pair.
///
/// The inbound stream ends at EOF or at the first read error. Malformed
/// lines are yielded as errors and do not end the stream.
pub fn from_io<R, W>(reader: R, writer: W, max_line_bytes: usize) -> Channel
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let codec = JsonLineCodec::with_max_line_bytes(max_line_bytes);

    let incoming = FramedRead::new(reader, codec.clone())
        .take_while(|item| {
            if let Err(e) = item {
                error!(error = %e, "Failed to read from transport");
            }
            future::ready(item.is_ok())
        })
        .filter_map(|item| future::ready(item.ok()))
        .boxed();

    Channel::new(incoming, Box::new(FramedWrite::new(writer, codec)))
}

/// Two channels connected back to back in memory.
#[must_use]
pub fn memory_pair(max_line_bytes: usize) -> (Channel, Channel) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        from_io(a_read, a_write, max_line_bytes),
        from_io(b_read, b_write, max_line_bytes),
    )
}

/// Spawns `command` and talks to it over its stdin and stdout.
///
/// The child's stderr is inherited so its logs stay visible. The child is
/// killed when the returned handle is dropped.
///
/// # Errors
///
/// Returns an error if the process cannot be started.
pub fn spawn_child(
    command: &str,
    args: &[String],
    max_line_bytes: usize,
) -> Result<(Channel, Child), TransportError> {
    debug!(command, ?args, "Spawning stdio server");

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
    let stdout = child.stdout.take().ok_or(TransportError::Closed)?;

    Ok((from_io(stdout, stdin, max_line_bytes), child))
}
