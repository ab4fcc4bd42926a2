//! Stdin/stdout JSON bridge.
//!
//! Reads newline-delimited JSON `CommandEnvelope` messages and writes one
//! `ResponseEnvelope` per line. Commands are handled concurrently, so
//! responses may arrive out of order; clients match them by `request_id`.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::error::{AppError, Result};
use crate::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};
use crate::host::handler::HostHandler;

/// Run the bridge on the process's stdin and stdout until stdin closes or a
/// `host.stop` command is received.
pub async fn run_stdio_bridge(handler: HostHandler) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = BufWriter::new(tokio::io::stdout());
    serve(handler, reader, writer).await
}

/// Serve envelopes from `reader`, writing responses to `writer`.
///
/// In-flight commands are awaited before returning.
pub async fn serve<R, W>(handler: HostHandler, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let mut in_flight = JoinSet::new();
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| AppError::Bridge(format!("failed to read from stdin: {e}")))?;

        // EOF
        if bytes_read == 0 {
            tracing::info!("stdin closed (EOF); shutting down stdio bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse command envelope from stdin");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                write_response(&writer, &response).await?;
                continue;
            }
        };

        if envelope.command == CommandName::HostStop {
            let response = handler.handle(envelope).await;
            write_response(&writer, &response).await?;
            tracing::info!("host.stop received; shutting down stdio bridge");
            break;
        }

        let handler = handler.clone();
        let writer = Arc::clone(&writer);
        in_flight.spawn(async move {
            let response = handler.handle(envelope).await;
            write_response(&writer, &response).await
        });

        // Reap finished commands so the set does not grow unbounded.
        while let Some(done) = in_flight.try_join_next() {
            report(done);
        }
    }

    while let Some(done) = in_flight.join_next().await {
        report(done);
    }
    Ok(())
}

fn report(done: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match done {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "failed to write response"),
        Err(e) => tracing::error!(error = %e, "bridge command task failed"),
    }
}

async fn write_response<W>(writer: &Mutex<W>, response: &ResponseEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)
        .map_err(|e| AppError::Bridge(format!("failed to serialize response envelope: {e}")))?;
    let mut w = writer.lock().await;
    write_line(&mut *w, &json).await
}

/// Write a single JSON line and flush.
async fn write_line<W>(writer: &mut W, json: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| AppError::Bridge(format!("failed to write to stdout: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| AppError::Bridge(format!("failed to write newline to stdout: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AppError::Bridge(format!("failed to flush stdout: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use uir_search::{EngineConfig, RouterBuilder};

    use super::*;

    fn handler() -> HostHandler {
        let router = RouterBuilder::new(EngineConfig::default())
            .build()
            .expect("router");
        HostHandler::new(Arc::new(router))
    }

    /// Collects everything written, shared so the test can read it back.
    #[derive(Clone, Default)]
    struct Sink(Arc<std::sync::Mutex<Vec<u8>>>);

    impl AsyncWrite for Sink {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    async fn run(input: &str) -> Vec<ResponseEnvelope> {
        let sink = Sink::default();
        serve(handler(), BufReader::new(input.as_bytes()), sink.clone())
            .await
            .expect("serve");
        let bytes = sink.0.lock().expect("lock").clone();
        String::from_utf8(bytes)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("response json"))
            .collect()
    }

    #[tokio::test]
    async fn answers_each_line() {
        let responses = run(concat!(
            r#"{"v":1,"request_id":"a","command":"host.ping","payload":{}}"#,
            "\n\n",
            r#"{"v":1,"request_id":"b","command":"stats"}"#,
            "\n",
        ))
        .await;
        assert_eq!(responses.len(), 2);
        let mut ids: Vec<&str> = responses.iter().map(|r| r.request_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(responses.iter().all(|r| r.ok));
    }

    #[tokio::test]
    async fn garbage_line_gets_parse_error() {
        let responses = run("{not json}\n").await;
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].ok);
        assert_eq!(responses[0].request_id, "parse-error");
    }

    #[tokio::test]
    async fn stop_ends_the_session() {
        let responses = run(concat!(
            r#"{"v":1,"request_id":"s","command":"host.stop"}"#,
            "\n",
            r#"{"v":1,"request_id":"late","command":"host.ping"}"#,
            "\n",
        ))
        .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, "s");
        assert_eq!(responses[0].payload["stopping"], true);
    }
}
