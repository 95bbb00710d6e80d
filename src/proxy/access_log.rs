//! Request logging, serialized off the hot path.
//!
//! Handlers queue one record at request start and one at request end on a
//! small bounded channel; a single writer task drains it so output is
//! ordered without each handler contending on the sink. Under sustained
//! overload senders wait, which beats dropping lines.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

const QUEUE_DEPTH: usize = 10;

#[derive(Debug)]
pub enum Record {
    Start {
        id: String,
        remote: SocketAddr,
        proto: &'static str,
        host: String,
        method: String,
        uri: String,
        ingress: String,
        target: String,
        /// Gate that answered the request instead of forwarding, if any.
        reject: Option<&'static str>,
    },
    End {
        id: String,
        elapsed: Duration,
    },
}

#[derive(Clone)]
pub struct AccessLog {
    tx: mpsc::Sender<Record>,
}

impl AccessLog {
    /// Start the writer task and hand out the sending side.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(writer(rx));
        Self { tx }
    }

    pub async fn send(&self, record: Record) {
        // An error means the writer is gone, which only happens at shutdown.
        let _ = self.tx.send(record).await;
    }
}

async fn writer(mut rx: mpsc::Receiver<Record>) {
    while let Some(record) = rx.recv().await {
        match record {
            Record::Start {
                id,
                remote,
                proto,
                host,
                method,
                uri,
                ingress,
                target,
                reject,
            } => info!(
                target: "request",
                req = %id,
                remote = %remote,
                proto,
                host = %host,
                method = %method,
                uri = %uri,
                ingress = %ingress,
                backend = %target,
                reject = reject.unwrap_or(""),
                "request start"
            ),
            Record::End { id, elapsed } => info!(
                target: "request",
                req = %id,
                duration_us = elapsed.as_micros() as u64,
                "request end"
            ),
        }
    }
}
