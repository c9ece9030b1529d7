//! NDJSON channel endpoints.
//!
//! Implements the tolerant reader pattern: blank lines are skipped and
//! lines that fail to decode or parse are logged and dropped. The stream
//! ends at EOF.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::envelope::Envelope;
use crate::error::Result;

/// Sending half of an IPC channel.
///
/// Cheap to clone. Sends are fire-and-forget: they never block, there is
/// no acknowledgment, and envelopes queued on one sender are written in
/// order by a single writer task.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    label: Arc<str>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSender {
    /// Spawn a writer task that serializes envelopes onto `writer`, one per line.
    pub fn spawn_writer<W>(writer: W, label: impl Into<Arc<str>>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let task_label = Arc::clone(&label);
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(envelope) = rx.recv().await {
                let line = match serde_json::to_string(&envelope) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(channel = %task_label, error = %e, "Failed to encode envelope");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!(channel = %task_label, error = %e, "Failed to write envelope");
                    break;
                }
                if let Err(e) = writer.write_all(b"\n").await {
                    warn!(channel = %task_label, error = %e, "Failed to write newline");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    warn!(channel = %task_label, error = %e, "Failed to flush channel");
                    break;
                }
            }
            debug!(channel = %task_label, "channel writer finished");
        });

        Self { label, tx }
    }

    /// Create a sender whose envelopes land in an in-process receiver.
    pub fn detached(label: impl Into<Arc<str>>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                label: label.into(),
                tx,
            },
            rx,
        )
    }

    /// Queue an envelope for delivery; returns `false` once the channel is closed.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.tx.send(envelope.clone()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Parse a single NDJSON line into an envelope.
pub fn parse_line(line: &str) -> Result<Envelope> {
    Ok(serde_json::from_str(line)?)
}

/// Read envelopes from `reader` until EOF or until `on_envelope` returns `false`.
pub async fn read_envelopes<R, F>(reader: R, label: &str, mut on_envelope: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(Envelope) -> bool,
{
    let mut lines = BufReader::new(reader).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(raw)) => {
                let bytes = raw.strip_suffix(b"\r").unwrap_or(&raw);
                let line = match std::str::from_utf8(bytes) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(channel = label, error = %e, "Dropping non UTF-8 line");
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Ok(envelope) => {
                        if !on_envelope(envelope) {
                            debug!(channel = label, "envelope consumer closed");
                            break;
                        }
                    }
                    Err(e) => warn!(channel = label, error = %e, "Dropping malformed envelope"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(channel = label, error = %e, "channel read failed");
                break;
            }
        }
    }
    debug!(channel = label, "channel reader finished");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ipc::{Action, Endpoint};

    #[tokio::test]
    async fn writer_and_reader_preserve_order() {
        let (client, server) = tokio::io::duplex(1024);
        let sender = ChannelSender::spawn_writer(client, "test");

        for n in 0..5 {
            let envelope = Envelope::new(format!("step-{n}")).addressed_to(Endpoint::Agent);
            assert!(sender.send(&envelope));
        }
        drop(sender);

        let mut seen = Vec::new();
        read_envelopes(server, "test", |env| {
            seen.push(env.action.to_string());
            true
        })
        .await;
        assert_eq!(seen, vec!["step-0", "step-1", "step-2", "step-3", "step-4"]);
    }

    #[tokio::test]
    async fn reader_skips_malformed_lines() {
        let input: &[u8] = concat!(
            "{\"action\":\"agent-start\"}\n",
            "\n",
            "not json\n",
            "{\"action\":\"egg-ready\",\"to\":\"app\"}\n",
        )
        .as_bytes();
        let mut seen = Vec::new();
        read_envelopes(input, "test", |env| {
            seen.push(env.action);
            true
        })
        .await;
        assert_eq!(seen, vec![Action::AgentStart, Action::EggReady]);
    }

    #[tokio::test]
    async fn reader_skips_lines_that_are_not_utf8() {
        let input: &[u8] =
            b"{\"action\":\"agent-start\"}\n\xff\xfe garbage\r\n{\"action\":\"app-start\"}\r\n";
        let mut seen = Vec::new();
        read_envelopes(input, "test", |env| {
            seen.push(env.action);
            true
        })
        .await;
        assert_eq!(seen, vec![Action::AgentStart, Action::AppStart]);
    }

    #[tokio::test]
    async fn detached_sender_reports_closure() {
        let (sender, rx) = ChannelSender::detached("mem");
        assert!(sender.send(&Envelope::new(Action::AppStart)));
        drop(rx);
        assert!(sender.is_closed());
        assert!(!sender.send(&Envelope::new(Action::AppStart)));
    }
}
