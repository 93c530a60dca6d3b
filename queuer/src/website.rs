//! Website-facing boundary: accepts START commands, maps them onto judge
//! requests, and replies with the judge result.
//!
//! Input validation happens here, synchronously, before anything reaches the
//! evaluator queue: a malformed machine type or non-positive resource ask is
//! answered with an error reply and never scheduled. Each command is handled
//! in its own task; replies carry the command's correlation id.

use std::net::SocketAddr;

use commands::{
    WebsiteCommand, WebsiteEnvelope, WebsiteReply, WebsiteReplyEnvelope, WebsiteStartArgs,
};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::dto::{JudgeResult, MachineProfile, Submission, SubmissionKind, causes};
use crate::evaluator::Evaluator;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serve website connections on an already-bound listener.
pub async fn serve(listener: TcpListener, evaluator: Evaluator) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "listening for website connections");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!(peer_addr = %peer_addr, "website connected");
        tokio::spawn(handle_connection(stream, evaluator.clone()));
    }
}

async fn handle_connection(stream: TcpStream, evaluator: Evaluator) {
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let (mut sink, mut lines) = framed.split();

    // Commands run concurrently; a writer task serializes their replies.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<WebsiteReplyEnvelope>();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = reply_rx.recv().await {
            let line = match serde_json::to_string(&envelope) {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, "unserializable reply");
                    continue;
                }
            };
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next().await {
        let text = match line {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "website read failed");
                break;
            }
        };
        let evaluator = evaluator.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let envelope = handle_line(&evaluator, &text).await;
            let _ = reply_tx.send(envelope);
        });
    }

    drop(reply_tx);
    let _ = writer.await;
    info!("website disconnected");
}

async fn handle_line(evaluator: &Evaluator, text: &str) -> WebsiteReplyEnvelope {
    let envelope: WebsiteEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "malformed website command");
            return WebsiteReplyEnvelope {
                id: 0,
                reply: WebsiteReply::Error {
                    cause: format!("malformed command: {err}"),
                },
            };
        }
    };
    let reply = match envelope.command {
        WebsiteCommand::Start(args) => handle_start(evaluator, args).await,
    };
    WebsiteReplyEnvelope {
        id: envelope.id,
        reply,
    }
}

/// Validate and submit one START command, mapping the result back onto the
/// website reply shape.
pub async fn handle_start(evaluator: &Evaluator, args: WebsiteStartArgs) -> WebsiteReply {
    let WebsiteStartArgs {
        evaluation_settings: settings,
        benchmark_instances,
        submission_url,
        validator_url,
    } = args;

    let profile = match MachineProfile::from_name(&settings.machine_type) {
        Ok(profile) => profile,
        Err(err) => {
            return WebsiteReply::Error {
                cause: err.to_string(),
            };
        }
    };
    if settings.cpu < 1 || settings.memory < 1 {
        return WebsiteReply::Error {
            cause: format!(
                "resource request must be positive (cpu={}, memory={})",
                settings.cpu, settings.memory
            ),
        };
    }

    let settings_value = match serde_json::to_value(&settings) {
        Ok(value) => value,
        Err(err) => {
            error!(error = %err, "evaluation settings not serializable");
            return WebsiteReply::Error {
                cause: causes::JUDGE_INTERNAL.to_string(),
            };
        }
    };
    let submission = Submission::new(SubmissionKind::Code, submission_url, validator_url);

    debug!(machine_type = %profile.name(), cpu = settings.cpu, memory = settings.memory, "website start");
    let result = evaluator
        .submit(
            submission,
            profile,
            settings.cpu,
            settings.memory,
            settings_value,
            benchmark_instances,
        )
        .await;

    match result {
        JudgeResult::Success(payload) => WebsiteReply::Ok { result: payload },
        JudgeResult::Error(cause) => WebsiteReply::Error { cause },
    }
}
