// Output multiplexer: per-target sinks feeding one renderer

use std::io::Write;
use std::sync::Arc;

use colored::*;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::inventory::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `--> task`
    Task,
    /// `$ command`
    Command,
    /// `!! reason`
    Failure,
}

#[derive(Debug, Clone)]
enum OutputEvent {
    Line {
        prefix: Arc<str>,
        stream: Stream,
        text: String,
    },
    Marker {
        prefix: Arc<str>,
        kind: MarkerKind,
        text: String,
    },
}

/// Producer handle owned by one target's execution
///
/// Sends never block; a closed renderer silently drops output.
#[derive(Debug, Clone)]
pub struct HostSink {
    prefix: Arc<str>,
    tx: UnboundedSender<OutputEvent>,
}

impl HostSink {
    pub fn line(&self, stream: Stream, text: impl Into<String>) {
        let _ = self.tx.send(OutputEvent::Line {
            prefix: self.prefix.clone(),
            stream,
            text: text.into(),
        });
    }

    pub fn marker(&self, kind: MarkerKind, text: impl Into<String>) {
        let _ = self.tx.send(OutputEvent::Marker {
            prefix: self.prefix.clone(),
            kind,
            text: text.into(),
        });
    }

    /// A sink whose output goes nowhere
    pub fn discard(prefix: &str) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        HostSink {
            prefix: Arc::from(prefix),
            tx,
        }
    }
}

/// Fans in output from every target and renders it as prefixed lines
///
/// Lines from one sink are rendered in the order they were sent; lines from
/// different sinks interleave as they arrive.
pub struct OutputMultiplexer {
    tx: UnboundedSender<OutputEvent>,
    renderer: JoinHandle<()>,
}

impl OutputMultiplexer {
    /// Render to `writer`; with `quiet` the task/command/failure markers are dropped
    pub fn spawn<W>(writer: W, quiet: bool) -> Self
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let renderer = tokio::spawn(render(rx, writer, quiet));
        OutputMultiplexer { tx, renderer }
    }

    pub fn stdout(quiet: bool) -> Self {
        OutputMultiplexer::spawn(std::io::stdout(), quiet)
    }

    pub fn sink(&self, target: &Target) -> HostSink {
        HostSink {
            prefix: Arc::from(target.label()),
            tx: self.tx.clone(),
        }
    }

    /// Wait until everything sent so far has been written
    ///
    /// Every sink handed out must be dropped first, or this waits forever.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.renderer.await;
    }
}

async fn render<W: Write>(mut rx: UnboundedReceiver<OutputEvent>, mut writer: W, quiet: bool) {
    while let Some(event) = rx.recv().await {
        let rendered = match event {
            OutputEvent::Line {
                prefix,
                stream,
                text,
            } => {
                let tag = format!("[{}]", prefix).dimmed();
                match stream {
                    Stream::Stdout => format!("{} {}", tag, text),
                    Stream::Stderr => format!("{} {}", tag, text.red()),
                }
            }
            OutputEvent::Marker { .. } if quiet => continue,
            OutputEvent::Marker { prefix, kind, text } => {
                let tag = format!("[{}]", prefix).cyan();
                match kind {
                    MarkerKind::Task => format!("{} {} {}", tag, "-->".green().bold(), text.bold()),
                    MarkerKind::Command => format!("{} {} {}", tag, "$".dimmed(), text.dimmed()),
                    MarkerKind::Failure => format!("{} {} {}", tag, "!!".red().bold(), text.red()),
                }
            }
        };

        if writeln!(writer, "{}", rendered).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}

/// Splits a byte stream into complete lines
///
/// A trailing `\r` (PTY line endings) is dropped; invalid UTF-8 is replaced.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer::default()
    }

    /// Append `bytes` and return every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Whatever is left after the stream ended without a final newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
