//! Event sink that writes one JSON object per line to stdout.
//!
//! Serialization and writing happen on a dedicated task so `emit` never
//! blocks a worker.

use portfwd_core::{Event, EventSink};
use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

pub struct JsonLinesSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl JsonLinesSink {
    /// Create a sink writing to `out`. The writer task ends once every
    /// clone of the sink has been dropped.
    pub fn spawn<W>(mut out: W) -> (Self, JoinHandle<()>)
    where
        W: Write + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = write_event(&mut out, &event) {
                    warn!(error = %e, "cannot write event");
                }
            }
        });
        (Self { tx }, task)
    }

    pub fn stdout() -> (Self, JoinHandle<()>) {
        Self::spawn(std::io::stdout())
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

fn write_event<W: Write>(out: &mut W, event: &Event) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
