//! Out-of-process background contexts speaking JSON lines over stdio.
//!
//! The parent writes one request envelope per line to the child's stdin and
//! reads one reply envelope per line from its stdout. The child's stderr is
//! inherited so its logs stay visible. Child exit is a fatal event.

use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::context::{Handler, WorkerEvent, WorkerLink, respond};
use crate::Error;

/// Start `command` as a background context.
///
/// The child is killed when the returned link's context is terminated.
pub fn spawn_process(mut command: Command) -> Result<WorkerLink, Error> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::WorkerFatal(format!("failed to start background process: {e}")))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::WorkerFatal("background process has no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::WorkerFatal("background process has no stdout".into()))?;

    let (outbox, mut inbox) = mpsc::unbounded_channel::<Value>();
    let (events_tx, events) = mpsc::unbounded_channel();

    let driver = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                outgoing = inbox.recv() => {
                    let Some(message) = outgoing else { break };
                    let mut line = message.to_string();
                    line.push('\n');
                    let written = match stdin.write_all(line.as_bytes()).await {
                        Ok(()) => stdin.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        let reason = format!("write to background process failed: {e}");
                        let _ = events_tx.send(WorkerEvent::Fatal(reason));
                        break;
                    }
                }
                incoming = lines.next_line() => match incoming {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(value) => {
                                let _ = events_tx.send(WorkerEvent::Message(value));
                            }
                            Err(e) => tracing::warn!(error = %e, "ignoring non-JSON line from background process"),
                        }
                    }
                    Ok(None) => {
                        let reason = match child.wait().await {
                            Ok(status) => format!("background process exited: {status}"),
                            Err(e) => format!("background process lost: {e}"),
                        };
                        tracing::error!(%reason, "background context crashed");
                        let _ = events_tx.send(WorkerEvent::Fatal(reason));
                        break;
                    }
                    Err(e) => {
                        let reason = format!("read from background process failed: {e}");
                        let _ = events_tx.send(WorkerEvent::Fatal(reason));
                        break;
                    }
                }
            }
        }
    });

    Ok(WorkerLink::from_parts(outbox, events, Some(driver.abort_handle())))
}

/// Serve `handler` over this process's stdin/stdout until stdin closes.
///
/// Logging must go to stderr; stdout carries only reply envelopes.
pub async fn serve_stdio<H: Handler>(handler: H) -> Result<(), Error> {
    serve(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Answer JSON-line requests read from `input` with reply lines on `output`
/// until `input` reaches end of file.
pub async fn serve<H, R, W>(mut handler: H, input: R, mut output: W) -> Result<(), Error>
where
    H: Handler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring non-JSON request line");
                continue;
            }
        };
        if let Some(reply) = respond(&mut handler, message).await {
            let mut out = serde_json::to_string(&reply)?;
            out.push('\n');
            output.write_all(out.as_bytes()).await?;
            output.flush().await?;
        }
    }

    tracing::info!("input closed, background context shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::wire::ReplyEnvelope;
    use crate::channel::{MessageChannel, Protocol};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data", rename_all = "snake_case")]
    enum CountRequest {
        Ping { n: u32 },
        Fail,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data", rename_all = "snake_case")]
    enum CountResponse {
        Pong { n: u32 },
    }

    struct Count;

    impl Protocol for Count {
        type Request = CountRequest;
        type Response = CountResponse;
    }

    struct CountHandler;

    #[async_trait]
    impl Handler for CountHandler {
        type Protocol = Count;

        async fn handle(&mut self, request: CountRequest) -> Result<CountResponse, Error> {
            match request {
                CountRequest::Ping { n } => Ok(CountResponse::Pong { n }),
                CountRequest::Fail => Err(Error::Storage("disk full".into())),
            }
        }
    }

    fn shell_channel(script: &'static str) -> Arc<MessageChannel<Count>> {
        let channel = MessageChannel::new(
            move || {
                let mut command = Command::new("sh");
                command.args(["-c", script]);
                spawn_process(command)
            },
            Duration::from_secs(10),
        );
        Arc::new(channel)
    }

    #[tokio::test]
    async fn test_serve_answers_json_lines() {
        let (caller, context) = tokio::io::duplex(4096);
        let (context_in, context_out) = tokio::io::split(context);
        let serving = tokio::spawn(serve(CountHandler, context_in, context_out));

        let (caller_in, mut caller_out) = tokio::io::split(caller);
        let requests = [
            r#"{"id": 1, "type": "ping", "data": {"n": 7}}"#,
            "",
            "not json",
            r#"{"type": "ping", "data": {"n": 1}}"#,
            r#"{"id": 2, "type": "fail"}"#,
            r#"{"id": 3, "type": "format_disk"}"#,
        ];
        for request in requests {
            caller_out.write_all(format!("{request}\n").as_bytes()).await.unwrap();
        }
        caller_out.shutdown().await.unwrap();

        let mut replies = Vec::new();
        let mut lines = BufReader::new(caller_in).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str::<ReplyEnvelope>(&line).unwrap());
        }
        serving.await.unwrap().unwrap();

        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], ReplyEnvelope::success(1, &CountResponse::Pong { n: 7 }).unwrap());
        assert_eq!(replies[0].data, Some(json!({"n": 7})));
        assert_eq!(replies[1].id, 2);
        assert_eq!(replies[1].error.as_deref(), Some("STORAGE_ERROR: disk full"));
        assert_eq!(replies[2].id, 3);
        assert!(replies[2].error.as_deref().is_some_and(|e| e.starts_with("PROTOCOL_ERROR")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_round_trip() {
        let channel = shell_channel(r#"read line; echo '{"id": 1, "type": "pong", "data": {"n": 7}}'; sleep 5"#);
        let response = channel.call(CountRequest::Ping { n: 7 }).await.unwrap();
        assert_eq!(response, CountResponse::Pong { n: 7 });
        channel.destroy().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_rejects_pending_calls() {
        let channel = shell_channel("sleep 0.3; exit 3");
        let calls: Vec<_> = (0..3)
            .map(|n| {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move { channel.call(CountRequest::Ping { n }).await })
            })
            .collect();

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert_eq!(err.code(), "WORKER_FATAL");
        }
        assert_eq!(channel.pending_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let channel = MessageChannel::<Count>::new(
            || spawn_process(Command::new("/nonexistent/posa-worker")),
            Duration::from_secs(1),
        );
        let err = channel.ready().await.unwrap_err();
        assert_eq!(err.code(), "WORKER_FATAL");
    }
}
