//! Message types for talking to one connected runner.
//!
//! A [`RunnerChannel`] is a cloneable handle over an mpsc channel whose
//! receiving end is owned by the connection's I/O task. Each
//! [`CommandExchange`] carries the command and a oneshot `reply` sender the
//! I/O task answers through, so exchanges are serialized per connection and
//! no socket types ever cross the channel.

use std::fmt;
use std::time::Duration;

use commands::{RunnerCommand, RunnerReply};
use tokio::sync::{mpsc, oneshot};

// ─── Error type that crosses the channel ───────────────────────────────────

/// Errors surfaced by a command exchange with a runner.
#[derive(Debug)]
pub enum ProtocolError {
    /// The connection task is gone (socket closed before the send)
    ChannelClosed,
    /// The runner closed the socket mid-exchange
    ConnectionClosed,
    /// No reply within the caller's deadline
    Timeout,
    /// The reply line was not valid JSON for a reply
    Malformed(String),
    /// Socket read/write failure
    Io(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ChannelClosed => write!(f, "runner channel is closed"),
            ProtocolError::ConnectionClosed => write!(f, "runner closed the connection"),
            ProtocolError::Timeout => write!(f, "timed out waiting for runner reply"),
            ProtocolError::Malformed(msg) => write!(f, "malformed runner reply: {msg}"),
            ProtocolError::Io(msg) => write!(f, "runner connection error: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ─── Exchange envelope ─────────────────────────────────────────────────────

/// One command plus the oneshot the I/O task replies through.
pub struct CommandExchange {
    command: RunnerCommand,
    reply: oneshot::Sender<Result<RunnerReply, ProtocolError>>,
}

impl CommandExchange {
    pub fn into_parts(
        self,
    ) -> (
        RunnerCommand,
        oneshot::Sender<Result<RunnerReply, ProtocolError>>,
    ) {
        (self.command, self.reply)
    }
}

// ─── Channel handle ────────────────────────────────────────────────────────

/// Cloneable sending side of a runner connection.
#[derive(Clone)]
pub struct RunnerChannel {
    tx: mpsc::Sender<CommandExchange>,
}

impl RunnerChannel {
    /// Create a channel pair. The receiver goes to the connection I/O task,
    /// which must answer every exchange exactly once.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<CommandExchange>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Send a command and wait for the runner's reply.
    ///
    /// `timeout` bounds the whole exchange; `None` waits indefinitely.
    pub async fn send_command(
        &self,
        command: RunnerCommand,
        timeout: Option<Duration>,
    ) -> Result<RunnerReply, ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = CommandExchange {
            command,
            reply: reply_tx,
        };
        self.tx
            .send(exchange)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)?;

        match timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| ProtocolError::Timeout)?
                .map_err(|_| ProtocolError::ChannelClosed)?,
            None => reply_rx.await.map_err(|_| ProtocolError::ChannelClosed)?,
        }
    }
}
