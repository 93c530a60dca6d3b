//! Accept loop for inbound runner connections.
//!
//! Runners dial in from inside their VMs. For every accepted socket the loop
//! spawns a connection task that performs the INFO handshake, registers the
//! runner's channel under its machine name, and unregisters it when the
//! socket closes. Frames are newline-delimited JSON.

use std::sync::Arc;
use std::time::Duration;

use commands::{RunnerCommand, RunnerReply};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::channel::{CommandExchange, ProtocolError, RunnerChannel};
use crate::registry::RunnerRegistry;

/// How long a freshly connected runner gets to answer INFO.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest accepted frame. START replies carry full result payloads.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Outstanding exchanges buffered towards one connection.
const CHANNEL_BUFFER: usize = 32;

/// Serve runner connections on an already-bound listener until accept fails.
pub async fn serve(listener: TcpListener, registry: Arc<RunnerRegistry>) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "listening for runner connections");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!(peer_addr = %peer_addr, "runner connection attempt");
        tokio::spawn(handle_connection(stream, registry.clone()));
    }
}

async fn handle_connection(stream: TcpStream, registry: Arc<RunnerRegistry>) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(error = %err, "failed to set nodelay on runner socket");
    }
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let (channel, exchanges) = RunnerChannel::new(CHANNEL_BUFFER);
    let io_task = tokio::spawn(connection_io(framed, exchanges));

    // Ask the runner who it is before anything else touches the channel.
    let machine_name = match channel
        .send_command(RunnerCommand::Info, Some(HANDSHAKE_TIMEOUT))
        .await
    {
        Ok(RunnerReply::Ok(ok)) => match ok.machine_name {
            Some(name) if !name.is_empty() => name,
            _ => {
                error!("runner INFO reply did not carry a machine name");
                drop(channel);
                let _ = io_task.await;
                return;
            }
        },
        Ok(RunnerReply::Error { cause }) => {
            error!(cause = %cause, "runner rejected INFO handshake");
            drop(channel);
            let _ = io_task.await;
            return;
        }
        Err(err) => {
            error!(error = %err, "runner INFO handshake failed");
            drop(channel);
            let _ = io_task.await;
            return;
        }
    };

    if let Err(err) = registry.register(&machine_name, channel.clone()) {
        error!(machine_name = %machine_name, error = %err, "rejecting runner connection");
        drop(channel);
        let _ = io_task.await;
        return;
    }
    info!(machine_name = %machine_name, "runner connected");

    // The registry holds the channel now; wait for the socket to close and
    // then remove it. The hook tolerates double fires.
    let hook = registry.close_hook(&machine_name);
    drop(channel);
    let _ = io_task.await;
    hook.fire();
}

/// Owns the socket. Processes exchanges strictly one at a time: write the
/// command line, read the reply line, answer the oneshot. Between exchanges
/// the socket is watched so a disconnect is noticed while idle.
async fn connection_io(
    mut framed: Framed<TcpStream, LinesCodec>,
    mut exchanges: mpsc::Receiver<CommandExchange>,
) {
    loop {
        let exchange = tokio::select! {
            exchange = exchanges.recv() => match exchange {
                Some(exchange) => exchange,
                // Every channel handle dropped; close the socket.
                None => return,
            },
            frame = framed.next() => match frame {
                Some(Ok(text)) => {
                    warn!(line = %text, "discarding unsolicited runner frame");
                    continue;
                }
                Some(Err(err)) => {
                    debug!(error = %err, "runner socket read failed");
                    return;
                }
                None => return,
            },
        };
        let (command, reply) = exchange.into_parts();

        let line = match serde_json::to_string(&command) {
            Ok(line) => line,
            Err(err) => {
                let _ = reply.send(Err(ProtocolError::Io(err.to_string())));
                continue;
            }
        };
        if let Err(err) = framed.send(line).await {
            let _ = reply.send(Err(ProtocolError::Io(err.to_string())));
            return;
        }

        match framed.next().await {
            Some(Ok(text)) => match serde_json::from_str::<RunnerReply>(&text) {
                Ok(parsed) => {
                    let _ = reply.send(Ok(parsed));
                }
                Err(err) => {
                    // A garbled reply desyncs the whole exchange stream; give
                    // up on the connection rather than guess.
                    let _ = reply.send(Err(ProtocolError::Malformed(err.to_string())));
                    return;
                }
            },
            Some(Err(err)) => {
                let _ = reply.send(Err(ProtocolError::Io(err.to_string())));
                return;
            }
            None => {
                let _ = reply.send(Err(ProtocolError::ConnectionClosed));
                return;
            }
        }
    }
}
